//! # Ping
//!
//! Echo request/reply with one-shot unreachable reporting.
//!
//! The originator registers every request in `pending_requests` under a
//! unique id. Timeouts are poll-driven: a stale request is noticed either
//! when a late packet carrying its id arrives, or when the node runs
//! [`sweep_timeouts`] from its periodic tick. Either way the
//! "host unreachable" line is printed at most once per id.

use blake3::Hasher;
use tracing::debug;

use crate::envelope::{Envelope, Payload, PingPayload, Route};
use crate::identity::Contact;
use crate::outcome::{Notification, Outcome};
use crate::state::NodeState;

/// Request id: hex of `blake3(source || destination || seq || time_sent)`,
/// truncated to 16 bytes.
pub fn request_id(source: &str, destination: &str, seq_id: u64, time_sent: f64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&[0]);
    hasher.update(destination.as_bytes());
    hasher.update(&seq_id.to_le_bytes());
    hasher.update(&time_sent.to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// First leg of a ping. Registers the request so its timeout can be tracked.
pub fn request(state: &mut NodeState, destination: Contact, seq_id: u64) -> Envelope {
    let time_sent = state.node_time();
    let unique_id = request_id(state.name(), &destination.name, seq_id, time_sent);
    state.register_request(unique_id.clone(), time_sent);
    debug!(id = %unique_id, seq_id, to = %destination, "ping sent");

    Envelope::new(
        Route::new(state.contact().clone(), destination, time_sent),
        Payload::Ping(PingPayload {
            unique_id,
            seq_id,
            complete: false,
        }),
    )
}

pub fn handle(state: &mut NodeState, route: Route, mut payload: PingPayload) -> Outcome {
    let elapsed = state.elapsed_since(route.time_sent);
    let timeout = state.ping_timeout().as_secs_f64();

    if let Some(pending) = state.pending_request_mut(&payload.unique_id)
        && elapsed > timeout
    {
        if pending.notified {
            return Outcome::terminal();
        }
        pending.notified = true;
        debug!(id = %payload.unique_id, elapsed, "ping timed out");
        return Outcome::terminal().with(Notification::PingUnreachable {
            unique_id: payload.unique_id,
        });
    }

    if !route.is_addressed_to(state.name()) {
        return Outcome::forward(Envelope::new(route, Payload::Ping(payload)));
    }

    if payload.complete {
        if let Some(pending) = state.pending_request_mut(&payload.unique_id) {
            pending.completed = true;
        }
        return Outcome::terminal().with(Notification::PingReply {
            seq_id: payload.seq_id,
            peer: route.source.name,
            rtt: elapsed,
        });
    }

    payload.complete = true;
    let back = route.back_to_source(state.contact(), route.time_sent);
    Outcome::forward(Envelope::new(back, Payload::Ping(payload)))
}

/// Periodic re-evaluation of outstanding pings. Emits one unreachable line
/// for each request that went stale since the last sweep.
pub fn sweep_timeouts(state: &mut NodeState) -> Outcome {
    let now = state.node_time();
    let timeout = state.ping_timeout().as_secs_f64();
    let mut outcome = Outcome::terminal();

    for (unique_id, pending) in state.pending_requests_mut() {
        if pending.completed || pending.notified || now - pending.sent_at <= timeout {
            continue;
        }
        pending.notified = true;
        outcome.push(Notification::PingUnreachable {
            unique_id: unique_id.clone(),
        });
    }
    outcome
}
