//! # Clock Synchronization
//!
//! A Cristian-style exchange. The source sends an empty request; the
//! destination stamps its own clock into `destination_time` and returns it
//! with the original `time_sent`. Back home, the source estimates one-way
//! latency as half the round trip and moves its clock forward to
//! `destination_time + rtt/2` when it is behind. A clock is never moved
//! backward.

use tracing::{debug, info};

use crate::envelope::{ClockSyncPayload, Envelope, Payload, Route};
use crate::identity::Contact;
use crate::outcome::{Notification, Outcome};
use crate::state::NodeState;

pub fn request(state: &NodeState, destination: Contact) -> Envelope {
    Envelope::new(
        Route::new(state.contact().clone(), destination, state.node_time()),
        Payload::ClockSync(ClockSyncPayload::default()),
    )
}

pub fn handle(state: &mut NodeState, route: Route, mut payload: ClockSyncPayload) -> Outcome {
    if !route.is_addressed_to(state.name()) {
        return Outcome::forward(Envelope::new(route, Payload::ClockSync(payload)));
    }

    let Some(destination_time) = payload.destination_time else {
        let node_time = state.node_time();
        payload.destination_time = Some(node_time);
        let peer = route.source.name.clone();
        let back = route.back_to_source(state.contact(), route.time_sent);
        return Outcome::forward(Envelope::new(back, Payload::ClockSync(payload)))
            .with(Notification::ClockStamped { peer, node_time });
    };

    let node_time = state.node_time();
    let one_way = (node_time - route.time_sent) / 2.0;
    let estimate = destination_time + one_way;

    if node_time < estimate {
        let delta = estimate - node_time;
        state.set_node_time(estimate);
        info!(from = %route.source, delta, "clock corrected");
        return Outcome::terminal().with(Notification::ClockSynced {
            node_time: estimate,
            delta,
        });
    }

    debug!(from = %route.source, node_time, estimate, "clock ahead of peer");
    Outcome::terminal().with(Notification::ClockUnchanged {
        peer: route.source.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeConfig;

    fn node(name: &str, time: f64) -> NodeState {
        NodeState::new(Contact::named(name), &NodeConfig::default(), time)
    }

    fn stamped(a: &NodeState, b: &mut NodeState) -> (Route, ClockSyncPayload) {
        let req = request(a, b.contact().clone());
        let Payload::ClockSync(p) = req.payload else { unreachable!() };
        match handle(b, req.route, p).forward {
            Some(Envelope { route, payload: Payload::ClockSync(p) }) => (route, p),
            other => panic!("expected stamped reply, got {:?}", other),
        }
    }

    #[test]
    fn lagging_clock_jumps_to_estimate() {
        let mut a = node("A", 100.0);
        let mut b = node("B", 500.0);
        let (route, p) = stamped(&a, &mut b);
        assert_eq!(p.destination_time, Some(500.0));
        assert_eq!(route.time_sent, 100.0);

        a.advance_clock(2.0);
        let outcome = handle(&mut a, route, p);
        assert!(outcome.is_terminal());
        assert_eq!(a.node_time(), 501.0);
        assert_eq!(
            outcome.notifications,
            vec![Notification::ClockSynced { node_time: 501.0, delta: 399.0 }]
        );
    }

    #[test]
    fn leading_clock_is_left_alone() {
        let mut a = node("A", 900.0);
        let mut b = node("B", 10.0);
        let (route, p) = stamped(&a, &mut b);

        a.advance_clock(1.0);
        let outcome = handle(&mut a, route, p);
        assert_eq!(a.node_time(), 901.0);
        assert_eq!(outcome.notifications, vec![Notification::ClockUnchanged { peer: "B".into() }]);
    }

    #[test]
    fn transit_does_not_stamp() {
        let route = Route::new(Contact::named("A"), Contact::named("C"), 0.0);
        let outcome = handle(&mut node("B", 3.0), route.clone(), ClockSyncPayload::default());
        assert_eq!(
            outcome.forward,
            Some(Envelope::new(route, Payload::ClockSync(ClockSyncPayload::default())))
        );
    }
}
