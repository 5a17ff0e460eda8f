//! # Per-Node State
//!
//! [`NodeState`] is the only mutable store a handler touches. It is created
//! once per node, owned by that node's actor, and never shared: the actor
//! processes one envelope at a time, so none of the tables below need
//! synchronization.
//!
//! | Table | Key | Value | Written by |
//! |-------|-----|-------|------------|
//! | `pending_requests` | request unique id | `{sent_at, notified, completed}` | ping origination |
//! | `subscriptions` | subscription id | ordered member list | advertise |
//! | `first_hop_of_subscription` | subscription id | introducing neighbor | advertise commit |
//!
//! Tables grow monotonically; nothing is evicted here.

use std::collections::HashMap;
use std::time::Duration;

use crate::envelope::MAX_ENVELOPE_SIZE;
use crate::identity::{Contact, Keypair};

/// Default round-trip budget for ping and traceroute.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the node actor advances its logical clock.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Inbound envelope queue depth per node.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Elapsed logical time after which a round trip counts as failed.
    pub ping_timeout: Duration,
    /// Logical clock advance period. `Duration::ZERO` freezes the clock so
    /// only ClockSync (and explicit `advance_clock` calls) move it.
    pub tick_interval: Duration,
    /// Bounded inbox size; senders wait when it is full.
    pub inbox_capacity: usize,
    /// Largest wire envelope the node will decode.
    pub max_envelope_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            max_envelope_size: MAX_ENVELOPE_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PendingRequest {
    /// Logical time the request left this node.
    pub sent_at: f64,
    /// Set once the "host unreachable" line has been emitted.
    pub notified: bool,
    /// Set once the reply made it home.
    pub completed: bool,
}

#[derive(Debug)]
pub struct NodeState {
    contact: Contact,
    node_time: f64,
    ping_timeout: Duration,
    max_envelope_size: usize,
    keypair: Option<Keypair>,
    pending_requests: HashMap<String, PendingRequest>,
    subscriptions: HashMap<String, Vec<String>>,
    first_hop_of_subscription: HashMap<String, String>,
}

impl NodeState {
    pub fn new(contact: Contact, config: &NodeConfig, node_time: f64) -> Self {
        Self {
            contact,
            node_time,
            ping_timeout: config.ping_timeout,
            max_envelope_size: config.max_envelope_size,
            keypair: None,
            pending_requests: HashMap::new(),
            subscriptions: HashMap::new(),
            first_hop_of_subscription: HashMap::new(),
        }
    }

    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    #[inline]
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.contact.name
    }

    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.contact.is(name)
    }

    /// Largest encoded envelope this node accepts, inner onion layers included.
    #[inline]
    pub fn max_envelope_size(&self) -> usize {
        self.max_envelope_size
    }

    #[inline]
    pub fn node_time(&self) -> f64 {
        self.node_time
    }

    /// Logical clock in whole milliseconds, rounded up.
    #[inline]
    pub fn now_ms(&self) -> i64 {
        (self.node_time * 1000.0).ceil() as i64
    }

    /// Logical clock in whole milliseconds, truncated.
    #[inline]
    pub fn now_ms_floor(&self) -> i64 {
        (self.node_time * 1000.0) as i64
    }

    /// Logical seconds since `time_sent`.
    #[inline]
    pub fn elapsed_since(&self, time_sent: f64) -> f64 {
        self.node_time - time_sent
    }

    #[inline]
    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Advance the logical clock. Runtime ticks only; negative steps are ignored.
    pub fn advance_clock(&mut self, secs: f64) {
        if secs > 0.0 {
            self.node_time += secs;
        }
    }

    /// Used by ClockSync alone.
    pub(crate) fn set_node_time(&mut self, node_time: f64) {
        self.node_time = node_time;
    }

    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    pub fn register_request(&mut self, unique_id: impl Into<String>, sent_at: f64) {
        self.pending_requests
            .entry(unique_id.into())
            .or_insert(PendingRequest {
                sent_at,
                ..Default::default()
            });
    }

    pub fn pending_request(&self, unique_id: &str) -> Option<&PendingRequest> {
        self.pending_requests.get(unique_id)
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    pub(crate) fn pending_request_mut(&mut self, unique_id: &str) -> Option<&mut PendingRequest> {
        self.pending_requests.get_mut(unique_id)
    }

    pub(crate) fn pending_requests_mut(
        &mut self,
    ) -> impl Iterator<Item = (&String, &mut PendingRequest)> {
        self.pending_requests.iter_mut()
    }

    pub fn subscription(&self, id: &str) -> Option<&[String]> {
        self.subscriptions.get(id).map(Vec::as_slice)
    }

    pub fn subscriptions(&self) -> &HashMap<String, Vec<String>> {
        &self.subscriptions
    }

    pub fn first_hop_of_subscription(&self, id: &str) -> Option<&str> {
        self.first_hop_of_subscription.get(id).map(String::as_str)
    }

    /// A subscription is committed once its introducing neighbor is known.
    pub fn is_committed(&self, id: &str) -> bool {
        self.first_hop_of_subscription.contains_key(id)
    }

    /// Note the member list of a subscription passing through. Never touches
    /// a committed record.
    pub(crate) fn record_members(&mut self, id: &str, members: &[String]) {
        if !self.is_committed(id) {
            self.subscriptions.insert(id.to_string(), members.to_vec());
        }
    }

    /// Commit a subscription. Returns the already-committed first hop when
    /// the id was committed before, leaving the existing record untouched.
    pub(crate) fn commit_subscription(
        &mut self,
        id: &str,
        members: &[String],
        first_hop: &str,
    ) -> Result<(), String> {
        if let Some(existing) = self.first_hop_of_subscription.get(id) {
            return Err(existing.clone());
        }
        self.subscriptions.insert(id.to_string(), members.to_vec());
        self.first_hop_of_subscription
            .insert(id.to_string(), first_hop.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> NodeState {
        NodeState::new(Contact::new("A", "10.0.0.1"), &NodeConfig::default(), 100.0)
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert!(config.tick_interval > Duration::ZERO);
        assert!(config.inbox_capacity > 0);
        assert_eq!(config.max_envelope_size, MAX_ENVELOPE_SIZE);
    }

    #[test]
    fn clock_only_moves_forward_on_ticks() {
        let mut state = state();
        state.advance_clock(1.25);
        state.advance_clock(-10.0);
        assert_eq!(state.node_time(), 101.25);
        assert_eq!(state.now_ms(), 101_250);
        assert_eq!(state.now_ms_floor(), 101_250);
        assert_eq!(state.elapsed_since(100.0), 1.25);
    }

    #[test]
    fn request_registration_is_idempotent() {
        let mut state = state();
        state.register_request("r1", 100.0);
        state.pending_request_mut("r1").unwrap().notified = true;
        state.register_request("r1", 200.0);
        let entry = state.pending_request("r1").unwrap();
        assert!(entry.notified);
        assert_eq!(entry.sent_at, 100.0);
        assert!(state.pending_request("r2").is_none());
    }

    #[test]
    fn commit_happens_at_most_once() {
        let mut state = state();
        let members = vec!["A".to_string(), "B".to_string()];
        state.commit_subscription("s", &members, "B").unwrap();

        let other = vec!["X".to_string()];
        assert_eq!(state.commit_subscription("s", &other, "X"), Err("B".to_string()));
        state.record_members("s", &other);

        assert_eq!(state.subscription("s"), Some(members.as_slice()));
        assert_eq!(state.first_hop_of_subscription("s"), Some("B"));
    }

    #[test]
    fn passing_through_does_not_commit() {
        let mut state = state();
        state.record_members("s", &["A".to_string()]);
        assert!(state.subscription("s").is_some());
        assert!(!state.is_committed("s"));
    }
}
