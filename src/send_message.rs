//! Text message delivery with a size check and a returning acknowledgement.
//!
//! The destination compares the declared size against the character count
//! of the message it received. Either way it acknowledges back to the
//! source, stamping the ack with its own clock: round-trip timing is not
//! tracked for messages.

use tracing::debug;

use crate::envelope::{Envelope, Payload, Route, SendMessagePayload};
use crate::identity::Contact;
use crate::outcome::{Notification, Outcome};
use crate::state::NodeState;

pub fn request(state: &NodeState, destination: Contact, message: impl Into<String>) -> Envelope {
    let message = message.into();
    Envelope::new(
        Route::new(state.contact().clone(), destination, state.node_time()),
        Payload::SendMessage(SendMessagePayload {
            size: message.chars().count(),
            message,
            complete: false,
            failure: false,
        }),
    )
}

pub fn handle(state: &NodeState, route: Route, mut payload: SendMessagePayload) -> Outcome {
    let here = route.is_addressed_to(state.name());

    if payload.complete {
        if !here {
            return Outcome::forward(Envelope::new(route, Payload::SendMessage(payload)));
        }
        if payload.failure {
            return Outcome::terminal().with(Notification::MessageUnreachable {
                peer: route.source.name,
            });
        }
        return Outcome::terminal();
    }

    if !here {
        return Outcome::forward(Envelope::new(route, Payload::SendMessage(payload)));
    }

    let mut outcome = Outcome::terminal();
    let received = payload.message.chars().count();
    if received != payload.size {
        debug!(declared = payload.size, received, from = %route.source, "message size mismatch");
        payload.failure = true;
    } else {
        outcome.push(Notification::MessageDelivered {
            peer: route.source.name.clone(),
            message: payload.message.clone(),
        });
    }

    payload.complete = true;
    let back = route.back_to_source(state.contact(), state.node_time());
    outcome.forward = Some(Envelope::new(back, Payload::SendMessage(payload)));
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeConfig;

    fn node(name: &str, time: f64) -> NodeState {
        NodeState::new(Contact::named(name), &NodeConfig::default(), time)
    }

    fn split(outcome: &Outcome) -> (Route, SendMessagePayload) {
        match &outcome.forward {
            Some(Envelope { route, payload: Payload::SendMessage(p) }) => (route.clone(), p.clone()),
            other => panic!("expected message forward, got {:?}", other),
        }
    }

    fn arriving(size: usize) -> (Route, SendMessagePayload) {
        (
            Route::new(Contact::named("A"), Contact::named("C"), 1.0),
            SendMessagePayload {
                message: "hello world".into(),
                size,
                complete: false,
                failure: false,
            },
        )
    }

    #[test]
    fn matching_size_is_delivered_and_acked() {
        let (route, payload) = arriving(11);
        let outcome = handle(&node("C", 4.0), route, payload);
        let (back, ack) = split(&outcome);

        assert!(ack.complete);
        assert!(!ack.failure);
        assert_eq!(back.destination.name, "A");
        assert_eq!(back.time_sent, 4.0);
        assert_eq!(outcome.notifications[0].to_string(), "SENDMSG: A --> hello world");
    }

    #[test]
    fn size_mismatch_sets_failure_and_is_reported_at_source() {
        let (route, payload) = arriving(5);
        let outcome = handle(&node("C", 4.0), route, payload);
        assert!(outcome.notifications.is_empty());
        let (back, ack) = split(&outcome);
        assert!(ack.complete && ack.failure);

        let home = handle(&node("A", 5.0), back, ack);
        assert!(home.is_terminal());
        assert_eq!(home.notifications[0].to_string(), "SENDMSG ERROR: C UNREACHABLE");
    }

    #[test]
    fn successful_ack_ends_quietly() {
        let route = Route::new(Contact::named("C"), Contact::named("A"), 4.0);
        let ack = SendMessagePayload { complete: true, ..Default::default() };
        let outcome = handle(&node("A", 5.0), route, ack);
        assert_eq!(outcome, Outcome::terminal());
    }

    #[test]
    fn size_counts_characters() {
        let env = request(&node("A", 0.0), Contact::named("B"), "héllo");
        let Payload::SendMessage(p) = env.payload else { unreachable!() };
        assert_eq!(p.size, 5);
    }

    #[test]
    fn transit_passes_through() {
        let (route, payload) = arriving(11);
        assert_eq!(split(&handle(&node("B", 2.0), route.clone(), payload.clone())), (route, payload));
    }
}
