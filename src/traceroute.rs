//! # Traceroute
//!
//! A probe travels toward its destination, appending one
//! `"<hop> <host> <delay_ms>\n"` line at every node that handles it. The
//! destination marks it complete and sends it home with the original
//! `time_sent`, so the source can judge the whole round trip.
//!
//! ```text
//! EN_ROUTE ──► ARRIVED ──► RETURNING ──► DELIVERED
//!     │                        ▲
//!     └──► TIMED_OUT ──────────┘ (failure=true, carried home)
//! ```
//!
//! Timeouts are detected on arrival at *any* hop: whichever node first sees
//! an in-flight probe older than `ping_timeout` turns it into a failure
//! envelope addressed to the source.

use tracing::debug;

use crate::envelope::{Envelope, Payload, Route, TraceroutePayload};
use crate::identity::Contact;
use crate::outcome::{Notification, Outcome};
use crate::state::NodeState;

/// First leg of a traceroute from this node to `destination`.
pub fn request(state: &NodeState, destination: Contact) -> Envelope {
    Envelope::new(
        Route::new(state.contact().clone(), destination, state.node_time()),
        Payload::Traceroute(TraceroutePayload {
            last_hop_time: state.now_ms(),
            ..Default::default()
        }),
    )
}

pub fn handle(state: &NodeState, route: Route, mut payload: TraceroutePayload) -> Outcome {
    let elapsed = state.elapsed_since(route.time_sent);
    let timeout = state.ping_timeout().as_secs_f64();
    let home = route.is_addressed_to(state.name());

    if payload.failure {
        if !home {
            return pass(route, payload);
        }
        debug!(elapsed, hops = payload.hop_count, "failed traceroute arrived back");
        return Outcome::terminal().with(Notification::TracerouteTimedOut {
            timeout_secs: timeout,
            hops: payload.hop_count,
        });
    }

    if payload.complete {
        if !home {
            return pass(route, payload);
        }
        if timeout <= elapsed {
            debug!(elapsed, hops = payload.hop_count, "traceroute returned after timeout");
            return Outcome::terminal().with(Notification::TracerouteTimedOut {
                timeout_secs: timeout,
                hops: payload.hop_count,
            });
        }
        debug!(elapsed, hops = payload.hop_count, "traceroute arrived back");
        return Outcome::terminal().with(Notification::TracerouteReport {
            trace: payload.data,
        });
    }

    if timeout <= elapsed {
        debug!(elapsed, at = state.name(), "traceroute timed out in flight");
        payload.hop_count = payload.hop_count.saturating_add(1);
        payload.data.clear();
        payload.failure = true;
        let back = route.back_to_source(state.contact(), route.time_sent);
        return Outcome::forward(Envelope::new(back, Payload::Traceroute(payload)));
    }

    // Delay uses the truncated clock; the stamp handed on is rounded up.
    let delay = state.now_ms_floor().saturating_sub(payload.last_hop_time);
    payload.last_hop_time = state.now_ms();
    payload.hop_count = payload.hop_count.saturating_add(1);
    payload
        .data
        .push_str(&format!("{} {} {}\n", payload.hop_count, state.name(), delay));

    if home {
        payload.complete = true;
        let back = route.back_to_source(state.contact(), route.time_sent);
        return Outcome::forward(Envelope::new(back, Payload::Traceroute(payload)));
    }

    Outcome::forward(Envelope::new(route, Payload::Traceroute(payload)))
}

fn pass(route: Route, payload: TraceroutePayload) -> Outcome {
    Outcome::forward(Envelope::new(route, Payload::Traceroute(payload)))
}
