//! # Dispatcher
//!
//! Routes one inbound envelope to the handler for its type tag and echoes
//! every resulting notification to the console sink. Dispatch is purely by
//! tag; the dispatcher itself keeps no state.
//!
//! An unknown tag produces a warning and an empty outcome. Nothing a handler
//! does can make `handle` fail: faults arrive folded into the outcome.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::envelope::{Envelope, Payload};
use crate::outcome::{Fault, Outcome};
use crate::protocols::{ConsoleSink, FileStore};
use crate::state::NodeState;
use crate::{advertise, clocksync, ftp, ping, send_message, tor, traceroute};

/// Out-of-band signals from the transport that accompany an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleArgs {
    /// The transport could not deliver the envelope in one piece.
    pub fragmentation_failure: bool,
}

impl HandleArgs {
    pub fn fragmented() -> Self {
        Self {
            fragmentation_failure: true,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    console: Arc<dyn ConsoleSink>,
    store: Arc<dyn FileStore>,
}

impl Dispatcher {
    pub fn new(console: Arc<dyn ConsoleSink>, store: Arc<dyn FileStore>) -> Self {
        Self { console, store }
    }

    pub fn handle(&self, state: &mut NodeState, envelope: Envelope, args: &HandleArgs) -> Outcome {
        trace!(
            node = state.name(),
            kind = envelope.payload.type_tag(),
            from = envelope.source_name(),
            to = envelope.destination_name(),
            "dispatching"
        );

        let Envelope { route, payload } = envelope;
        let outcome = match payload {
            Payload::Traceroute(p) => traceroute::handle(state, route, p),
            Payload::Ping(p) => ping::handle(state, route, p),
            Payload::Ftp(p) => {
                ftp::handle(state, self.store.as_ref(), route, p, args.fragmentation_failure)
            }
            Payload::SendMessage(p) => send_message::handle(state, route, p),
            Payload::Tor(p) => tor::handle(state, route, p),
            Payload::Advertise(p) => advertise::handle(state, route, p),
            Payload::ClockSync(p) => clocksync::handle(state, route, p),
            Payload::Unrecognized { tag, .. } => {
                warn!(node = state.name(), %tag, "no handler for control message type");
                Outcome::fault(Fault::UnroutableType(tag))
            }
        };

        self.report(&outcome);
        outcome
    }

    /// Emit notifications produced outside a dispatch, such as a timeout sweep.
    pub fn report(&self, outcome: &Outcome) {
        for notification in &outcome.notifications {
            self.console.emit(notification);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
