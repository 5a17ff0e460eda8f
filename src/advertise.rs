//! # Subscription Advertisement
//!
//! Walks a fixed, ordered member list until every member has seen the
//! advertisement, then acknowledges back to the node that started it.
//!
//! ```text
//! PROPAGATING ──► COVERED ──► RETURNING ──► COMMITTED
//! ```
//!
//! Propagation legs keep the initiator as their route source. Each member
//! notes the member list, appends itself to `visited`, and hands the packet
//! to the first listed member that is neither itself nor visited. The
//! member that completes coverage addresses the ack to the initiator, which
//! commits the subscription together with the neighbor that introduced it.
//!
//! Coverage order depends only on list order and the visited set. A list of
//! N distinct members completes after at most N-1 hops.

use tracing::{debug, warn};

use crate::envelope::{AdvertisePayload, Envelope, Payload, Route};
use crate::identity::Contact;
use crate::outcome::{Fault, Notification, Outcome};
use crate::state::NodeState;

/// First leg of an advertisement, addressed to this node so it walks the
/// same path as every later hop.
pub fn request(state: &NodeState, subscription: impl Into<String>, members: Vec<String>) -> Envelope {
    let here = state.contact().clone();
    Envelope::new(
        Route::new(here.clone(), here, state.node_time()),
        Payload::Advertise(AdvertisePayload {
            unique_id: subscription.into(),
            node_list: members,
            ..Default::default()
        }),
    )
}

pub fn handle(state: &mut NodeState, route: Route, mut payload: AdvertisePayload) -> Outcome {
    if !route.is_addressed_to(state.name()) {
        return Outcome::forward(Envelope::new(route, Payload::Advertise(payload)));
    }

    if payload.complete {
        return commit(state, route, payload);
    }

    let here = state.name().to_string();
    state.record_members(&payload.unique_id, &payload.node_list);
    if !payload.visited.contains(&here) {
        payload.visited.push(here.clone());
    }
    payload.prev = payload.current.take();
    payload.current = Some(here.clone());

    let covered = payload.node_list.iter().all(|m| payload.visited.contains(m));
    if covered {
        let sender = route.source.name.clone();
        debug!(subscription = %payload.unique_id, to = %sender, "membership covered");
        payload.complete = true;
        payload.next = Some(sender.clone());
        let hop = Notification::AdvertiseHop {
            subscription: payload.unique_id.clone(),
            prev: payload.prev.clone(),
            next: sender,
        };
        let back = route.back_to_source(state.contact(), state.node_time());
        return Outcome::forward(Envelope::new(back, Payload::Advertise(payload))).with(hop);
    }

    let Some(next) = payload
        .node_list
        .iter()
        .find(|m| **m != here && !payload.visited.contains(m))
        .cloned()
    else {
        warn!(subscription = %payload.unique_id, "no unvisited member left");
        return Outcome::fault(Fault::Invariant(format!(
            "ADVERTISE: {} has no unvisited member but is not covered",
            payload.unique_id
        )));
    };

    debug!(subscription = %payload.unique_id, to = %next, "advertising onward");
    payload.next = Some(next.clone());
    let hop = Notification::AdvertiseHop {
        subscription: payload.unique_id.clone(),
        prev: payload.prev.clone(),
        next: next.clone(),
    };
    let onward = Route::new(route.source, Contact::named(next), state.node_time());
    Outcome::forward(Envelope::new(onward, Payload::Advertise(payload))).with(hop)
}

fn commit(state: &mut NodeState, route: Route, payload: AdvertisePayload) -> Outcome {
    let introduced_by = route.source.name;
    match state.commit_subscription(&payload.unique_id, &payload.node_list, &introduced_by) {
        Ok(()) => {
            debug!(subscription = %payload.unique_id, via = %introduced_by, "subscription committed");
            Outcome::terminal().with(Notification::SubscriptionCommitted {
                subscription: payload.unique_id,
                members: payload.node_list,
            })
        }
        Err(existing) => {
            warn!(subscription = %payload.unique_id, %existing, "duplicate completion");
            Outcome::fault(Fault::Protocol(format!(
                "ADVERTISE: {} already committed via {}",
                payload.unique_id, existing
            )))
        }
    }
}
