//! Handler scenarios driven through the dispatcher, with every hop crossing
//! the JSON wire codec the way a real transport would.

use std::collections::HashMap;
use std::sync::Arc;

use cmpnode::envelope::{SendMessagePayload, TraceroutePayload};
use cmpnode::{
    Contact, Dispatcher, Envelope, FsStore, HandleArgs, NodeConfig, NodeState, Notification,
    Outcome, Payload, RecordingConsole, Route, advertise, clocksync, decode_envelope,
    encode_envelope, traceroute,
};

struct Net {
    dispatcher: Dispatcher,
    console: Arc<RecordingConsole>,
    nodes: HashMap<String, NodeState>,
}

impl Net {
    fn new(nodes: &[(&str, f64)]) -> Self {
        let console = Arc::new(RecordingConsole::new());
        let config = NodeConfig::default();
        Self {
            dispatcher: Dispatcher::new(console.clone(), Arc::new(FsStore)),
            console,
            nodes: nodes
                .iter()
                .map(|(n, t)| (n.to_string(), NodeState::new(Contact::named(*n), &config, *t)))
                .collect(),
        }
    }

    /// Encode, decode, and hand `envelope` to node `at`.
    fn hop(&mut self, at: &str, envelope: &Envelope) -> Outcome {
        let wire = encode_envelope(envelope).unwrap();
        let arrived = decode_envelope(&wire).unwrap();
        let state = self.nodes.get_mut(at).unwrap();
        self.dispatcher.handle(state, arrived, &HandleArgs::default())
    }

    fn state(&self, name: &str) -> &NodeState {
        &self.nodes[name]
    }

    fn set_clock(&mut self, name: &str, secs: f64) {
        let state = self.nodes.get_mut(name).unwrap();
        state.advance_clock(secs - state.node_time());
    }
}

#[test]
fn traceroute_a_to_c_via_b() {
    let mut net = Net::new(&[("A", 10.0), ("B", 10.0), ("C", 10.0)]);
    let first = traceroute::request(net.state("A"), Contact::named("C"));
    match &first.payload {
        Payload::Traceroute(p) => assert_eq!((p.hop_count, p.data.as_str()), (0, "")),
        other => panic!("unexpected {:?}", other),
    }

    net.set_clock("B", 10.25);
    let at_b = net.hop("B", &first).forward.unwrap();
    assert_eq!(at_b.destination_name(), "C");

    net.set_clock("C", 10.5);
    let at_c = net.hop("C", &at_b).forward.unwrap();
    assert_eq!(at_c.destination_name(), "A");
    assert_eq!(at_c.route.time_sent, 10.0);

    let back_at_b = net.hop("B", &at_c).forward.unwrap();
    net.set_clock("A", 11.0);
    let done = net.hop("A", &back_at_b);

    assert!(done.is_terminal());
    assert_eq!(net.console.lines(), vec!["1 B 250\n2 C 250\n"]);
}

#[test]
fn traceroute_with_extreme_wire_counters_is_handled() {
    let mut net = Net::new(&[("A", 0.0), ("B", 1.0), ("C", 0.0)]);
    let cases = [
        r#"{"HOPCOUNT":4294967295,"last_hop_time":0}"#,
        r#"{"HOPCOUNT":0,"last_hop_time":-9223372036854775808}"#,
        r#"{"HOPCOUNT":4294967295,"last_hop_time":9223372036854775807}"#,
    ];

    for payload in cases {
        let text = format!(
            r#"{{"source_name":"A","destination_name":"C","type":"TRACEROUTE","payload":{},"time_sent":0.5}}"#,
            payload
        );
        let envelope = decode_envelope(&text).unwrap();
        let out = net.hop("B", &envelope).forward.unwrap();
        assert_eq!(out.destination_name(), "C");
        match &out.payload {
            Payload::Traceroute(p) => assert!(p.data.contains(" B ")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn stale_traceroute_fails_at_whichever_hop_sees_it() {
    for detector in ["B", "C"] {
        let mut net = Net::new(&[("A", 0.0), ("B", 0.0), ("C", 0.0), ("D", 0.0)]);
        let mut env = traceroute::request(net.state("A"), Contact::named("D"));

        for hop in ["B", "C"] {
            if hop == detector {
                net.set_clock(hop, 5.0);
            }
            env = net.hop(hop, &env).forward.unwrap();
            if hop == detector {
                break;
            }
        }

        assert_eq!(env.destination_name(), "A", "detected at {}", detector);
        assert_eq!(env.source_name(), detector);
        match &env.payload {
            Payload::Traceroute(TraceroutePayload { failure, data, .. }) => {
                assert!(*failure);
                assert!(data.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        net.set_clock("A", 5.5);
        let done = net.hop("A", &env);
        assert!(done.is_terminal());
        assert!(matches!(done.notifications[0], Notification::TracerouteTimedOut { .. }));
    }
}

#[test]
fn send_message_size_check() {
    let arriving = |size| {
        Envelope::new(
            Route::new(Contact::named("A"), Contact::named("C"), 0.0),
            Payload::SendMessage(SendMessagePayload {
                message: "hello world".into(),
                size,
                ..Default::default()
            }),
        )
    };

    let mut net = Net::new(&[("A", 0.0), ("C", 3.0)]);
    let ok = net.hop("C", &arriving(11)).forward.unwrap();
    match &ok.payload {
        Payload::SendMessage(p) => assert!(p.complete && !p.failure),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ok.route.time_sent, 3.0);
    assert_eq!(net.console.lines(), vec!["SENDMSG: A --> hello world"]);

    let bad = net.hop("C", &arriving(5)).forward.unwrap();
    match &bad.payload {
        Payload::SendMessage(p) => assert!(p.complete && p.failure),
        other => panic!("unexpected {:?}", other),
    }
    net.hop("A", &bad);
    assert_eq!(net.console.lines().last().unwrap(), "SENDMSG ERROR: C UNREACHABLE");
}

#[test]
fn advertise_covers_any_start_in_n_minus_one_hops() {
    let names = ["A", "B", "C", "D", "E"];
    let members: Vec<String> = names.iter().map(|s| s.to_string()).collect();

    for start in names {
        let nodes: Vec<_> = names.iter().map(|n| (*n, 0.0)).collect();
        let mut net = Net::new(&nodes);
        let mut env = advertise::request(net.state(start), "s", members.clone());
        let mut at = start.to_string();
        let mut propagation_hops = 0;

        let (completed_by, ack) = loop {
            let out = net.hop(&at, &env).forward.unwrap();
            if let Payload::Advertise(p) = &out.payload
                && p.complete
            {
                assert_eq!(p.visited.len(), members.len());
                break (at, out);
            }
            propagation_hops += 1;
            assert!(propagation_hops < names.len(), "advertisement from {} did not converge", start);
            at = out.destination_name().to_string();
            env = out;
        };

        assert_eq!(propagation_hops, names.len() - 1, "start {}", start);
        assert_eq!(ack.destination_name(), start);
        let outcome = net.hop(start, &ack);
        assert!(outcome.faults().next().is_none());
        assert_eq!(net.state(start).first_hop_of_subscription("s"), Some(completed_by.as_str()));

        let again = net.hop(start, &ack);
        assert!(again.is_terminal());
        assert!(again.faults().next().is_some());
        assert_eq!(net.state(start).first_hop_of_subscription("s"), Some(completed_by.as_str()));
    }
}

#[test]
fn clocksync_never_moves_backward() {
    for (mine, theirs) in [(0.0, 100.0), (100.0, 0.0), (50.0, 50.0), (3.0, 3.5)] {
        let mut net = Net::new(&[("A", mine), ("B", theirs)]);
        let request = clocksync::request(net.state("A"), Contact::named("B"));
        let stamped = net.hop("B", &request).forward.unwrap();

        net.set_clock("A", mine + 0.5);
        let before = net.state("A").node_time();
        net.hop("A", &stamped);
        let after = net.state("A").node_time();

        assert!(after >= before);
        let estimate = theirs + 0.25;
        if before < estimate {
            assert_eq!(after, estimate);
        } else {
            assert_eq!(after, before);
        }
    }
}
