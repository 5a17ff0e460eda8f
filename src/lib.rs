//! # cmpnode - Control Message Handling for Overlay Nodes
//!
//! cmpnode implements the control plane of a simulated overlay network. Nodes
//! exchange typed Control Message Packets (envelopes) and each node reacts to
//! them with a per-protocol handler:
//!
//! - **Traceroute** and **Ping**: round-trip probes with timeout detection
//! - **FTP**: single-envelope file push with acknowledgement and throughput
//! - **Send message**: text delivery with a size check
//! - **TOR**: onion-routed messages, one layer peeled per relay
//! - **Advertise**: subscription gossip over a fixed member list
//! - **ClockSync**: Cristian-style logical clock correction
//!
//! ## Architecture
//!
//! Handlers are synchronous functions over a node's private [`NodeState`].
//! Each returns an [`Outcome`]: an optional envelope to forward plus the
//! notifications to print. The [`Dispatcher`] picks the handler by type tag.
//!
//! The runtime uses the **Actor Pattern**:
//! - [`Node`] is a cheap, cloneable handle; its actor owns the state and
//!   processes one envelope at a time
//! - Forwards leave through the [`Transport`] trait; [`MeshTransport`]
//!   connects nodes in one process
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `envelope` | Envelope, typed payloads, JSON codec |
//! | `identity` | Node contact and RSA keypair |
//! | `crypto` | Onion layer open/seal |
//! | `state` | Per-node tables and configuration |
//! | `outcome` | Outcome, notifications, fault classes |
//! | `protocols` | Collaborator traits (transport, storage, console) |
//! | `storage` | Filesystem store for FTP |
//! | `console` | Console sinks |
//! | `traceroute` .. `clocksync` | The protocol handlers |
//! | `dispatch` | Type-tag dispatch |
//! | `node` | Node actor and handle |
//! | `mesh` | In-process line topology |

mod console;
mod crypto;
mod dispatch;
mod identity;
mod mesh;
mod node;
mod outcome;
mod protocols;
mod state;
mod storage;

pub mod envelope;

pub mod advertise;
pub mod clocksync;
pub mod ftp;
pub mod ping;
pub mod send_message;
pub mod tor;
pub mod traceroute;

pub use console::{RecordingConsole, StdConsole};
pub use crypto::{LayerContents, OnionError};
pub use dispatch::{Dispatcher, HandleArgs};
pub use envelope::{CmpType, Envelope, Payload, Route, decode_envelope, encode_envelope};
pub use identity::{Contact, DEFAULT_KEY_BITS, Keypair};
pub use mesh::MeshTransport;
pub use node::{Node, NodeSnapshot, Request};
pub use outcome::{Fault, Notification, Outcome};
pub use protocols::{ConsoleSink, FileStore, Transport};
pub use state::{
    DEFAULT_INBOX_CAPACITY, DEFAULT_PING_TIMEOUT, DEFAULT_TICK_INTERVAL, NodeConfig, NodeState,
    PendingRequest,
};
pub use storage::FsStore;
