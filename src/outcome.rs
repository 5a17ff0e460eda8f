//! Handler results: what to forward, and what to tell the operator.
//!
//! Every handler returns an [`Outcome`]. Faults never escape as errors; they
//! are folded into the notification list as [`Notification::Fault`] so the
//! dispatcher always hands the transport a well-formed value.

use chrono::{DateTime, Utc};

use crate::envelope::Envelope;

/// Fault classes a single packet can hit. Each one terminates (or converts)
/// that packet's lifecycle and is reported exactly once.
///
/// Timeouts are not faults here: they surface as
/// [`Notification::TracerouteTimedOut`] and [`Notification::PingUnreachable`].
#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    /// Logically inconsistent state (duplicate subscription completion,
    /// FTP byte-count mismatch).
    Protocol(String),
    /// Persistence failure, already converted into a FAILED acknowledgement.
    TransientIo(String),
    /// Onion layer could not be opened or its contents were malformed.
    Security(String),
    /// Type tag with no handler.
    UnroutableType(String),
    /// A state the handler logic should make unreachable.
    Invariant(String),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Protocol(msg) => write!(f, "{}", msg),
            Fault::TransientIo(msg) => write!(f, "I/O fault: {}", msg),
            Fault::Security(msg) => write!(f, "security fault: {}", msg),
            Fault::UnroutableType(tag) => write!(f, "Control Message Type: {} not handled", tag),
            Fault::Invariant(msg) => write!(f, "invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for Fault {}

/// Diagnostic events surfaced on the console stream.
///
/// `Display` renders the exact console line for each event.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// Completed traceroute arrived home; `trace` is the accumulated hop table.
    TracerouteReport { trace: String },
    TracerouteTimedOut { timeout_secs: f64, hops: u32 },
    PingReply { seq_id: u64, peer: String, rtt: f64 },
    PingUnreachable { unique_id: String },
    FileStored { peer: String, path: String },
    FileStoreFailed { peer: String, path: String },
    FileTransferComplete { file_name: String, peer: String, secs: u64, bytes_per_sec: u64 },
    FileTransferInterrupted { file_name: String, peer: String, bytes_written: u64 },
    MessageDelivered { peer: String, message: String },
    MessageUnreachable { peer: String },
    OnionDelivered { message: String },
    AdvertiseHop { subscription: String, prev: Option<String>, next: String },
    SubscriptionCommitted { subscription: String, members: Vec<String> },
    ClockStamped { peer: String, node_time: f64 },
    ClockSynced { node_time: f64, delta: f64 },
    ClockUnchanged { peer: String },
    Fault(Fault),
}

impl Notification {
    /// Whether this line belongs on the error stream.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notification::TracerouteTimedOut { .. }
                | Notification::PingUnreachable { .. }
                | Notification::FileStoreFailed { .. }
                | Notification::FileTransferInterrupted { .. }
                | Notification::MessageUnreachable { .. }
                | Notification::Fault(_)
        )
    }
}

/// `HH:MM:SS` (UTC) for a logical clock value in seconds.
pub(crate) fn clock_face(node_time: f64) -> String {
    let secs = node_time.floor();
    let nanos = ((node_time - secs) * 1e9) as u32;
    match DateTime::<Utc>::from_timestamp(secs as i64, nanos) {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => format!("{:.3}s", node_time),
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::TracerouteReport { trace } => write!(f, "{}", trace),
            Notification::TracerouteTimedOut { timeout_secs, hops } => {
                write!(f, "{} ON {}", timeout_secs, hops)
            }
            Notification::PingReply { seq_id, peer, rtt } => write!(f, "{} {} {}", seq_id, peer, rtt),
            Notification::PingUnreachable { .. } => write!(f, "PING ERROR: HOST UNREACHABLE"),
            Notification::FileStored { peer, path } => write!(f, "FTP: {} --> {}", peer, path),
            Notification::FileStoreFailed { peer, path } => {
                write!(f, "FTP: ERROR: {} --> {}", peer, path)
            }
            Notification::FileTransferComplete { file_name, peer, secs, bytes_per_sec } => {
                write!(f, "FTP: {} --> {} in {} at {}", file_name, peer, secs, bytes_per_sec)
            }
            Notification::FileTransferInterrupted { file_name, peer, bytes_written } => write!(
                f,
                "FTP: ERROR: {} --> {} INTERRUPTED AFTER {}",
                file_name, peer, bytes_written
            ),
            Notification::MessageDelivered { peer, message } => {
                write!(f, "SENDMSG: {} --> {}", peer, message)
            }
            Notification::MessageUnreachable { peer } => write!(f, "SENDMSG ERROR: {} UNREACHABLE", peer),
            Notification::OnionDelivered { message } => {
                write!(f, "Received onion message: \"{}\"", message)
            }
            Notification::AdvertiseHop { subscription, prev, next } => write!(
                f,
                "ADVERTISE: {} {} --> {}",
                subscription,
                prev.as_deref().unwrap_or(""),
                next
            ),
            Notification::SubscriptionCommitted { subscription, members } => write!(
                f,
                "{} NODES {:?} SUBSCRIBED TO {}",
                members.len(),
                members,
                subscription
            ),
            Notification::ClockStamped { peer, node_time } => {
                write!(f, "CLOCKSYNC FROM {}: TIME = {}", peer, clock_face(*node_time))
            }
            Notification::ClockSynced { node_time, delta } => {
                write!(f, "CLOCKSYNC: TIME = {} DELTA = {}", clock_face(*node_time), delta)
            }
            Notification::ClockUnchanged { peer } => {
                write!(f, "CLOCKSYNC: NO CORRECTION FROM {}", peer)
            }
            Notification::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

/// What the transport should do with a processed envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// Envelope to enqueue toward its (possibly new) destination.
    pub forward: Option<Envelope>,
    /// Diagnostics in emission order.
    pub notifications: Vec<Notification>,
}

impl Outcome {
    pub fn forward(envelope: Envelope) -> Self {
        Self {
            forward: Some(envelope),
            notifications: Vec::new(),
        }
    }

    /// The journey ends at this node.
    pub fn terminal() -> Self {
        Self::default()
    }

    pub fn fault(fault: Fault) -> Self {
        Self::terminal().with(Notification::Fault(fault))
    }

    pub fn with(mut self, notification: Notification) -> Self {
        self.notifications.push(notification);
        self
    }

    pub fn push(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn is_terminal(&self) -> bool {
        self.forward.is_none()
    }

    pub fn faults(&self) -> impl Iterator<Item = &Fault> {
        self.notifications.iter().filter_map(|n| match n {
            Notification::Fault(fault) => Some(fault),
            _ => None,
        })
    }
}
