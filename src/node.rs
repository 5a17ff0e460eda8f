//! # Node Runtime
//!
//! A [`Node`] is a cheap, cloneable handle to an actor that owns one
//! [`NodeState`]. The actor processes inbound envelopes strictly one at a
//! time, hands every forward to the [`Transport`], and advances the logical
//! clock on a fixed tick.
//!
//! ```text
//!  Node (handle) ──Command──► NodeActor ──Dispatcher──► handlers
//!                                 │
//!                                 └──forward──► Transport ──► next Node
//! ```
//!
//! Exchanges are started through the handle (`traceroute`, `ping`, ...).
//! The originator does not process its own first leg: it goes straight to
//! the transport, which delivers it to the next hop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, HandleArgs};
use crate::envelope::{Envelope, decode_envelope_bounded};
use crate::identity::Contact;
use crate::outcome::Outcome;
use crate::protocols::Transport;
use crate::state::{NodeConfig, NodeState};
use crate::{advertise, clocksync, ftp, ping, send_message, tor, traceroute};

/// First legs the handle can start.
#[derive(Clone, Debug)]
pub enum Request {
    Traceroute { destination: Contact },
    Ping { destination: Contact, seq_id: u64 },
    SendFile {
        destination: Contact,
        fpath: String,
        file_name: String,
        bytes: Vec<u8>,
    },
    SendMessage { destination: Contact, message: String },
    Advertise { subscription: String, members: Vec<String> },
    ClockSync { destination: Contact },
    /// Onion message along `relays`; the last relay is the recipient.
    Onion {
        relays: Vec<(Contact, RsaPublicKey)>,
        message: String,
    },
}

/// Point-in-time view of a node's tables.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub node_time: f64,
    pub subscriptions: HashMap<String, Vec<String>>,
    pub first_hops: HashMap<String, String>,
    pub pending_requests: usize,
}

enum Command {
    Deliver(Envelope, HandleArgs, Option<oneshot::Sender<Outcome>>),
    Originate(Request, oneshot::Sender<Result<Envelope>>),
    CheckTimeouts(oneshot::Sender<Outcome>),
    AdvanceClock(f64, oneshot::Sender<f64>),
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Quit,
}

#[derive(Clone)]
pub struct Node {
    contact: Contact,
    max_envelope_size: usize,
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// Start the actor for `state`. Must be called within a tokio runtime.
    pub fn spawn(
        state: NodeState,
        dispatcher: Dispatcher,
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let contact = state.contact().clone();
        let actor = NodeActor {
            state,
            dispatcher,
            transport,
        };
        tokio::spawn(actor.run(cmd_rx, config.tick_interval));

        Self {
            contact,
            max_envelope_size: config.max_envelope_size,
            cmd_tx,
        }
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn name(&self) -> &str {
        &self.contact.name
    }

    /// Queue an envelope without waiting for it to be handled. Fails when
    /// the inbox is full or the actor has stopped.
    pub fn post(&self, envelope: Envelope, args: HandleArgs) -> Result<()> {
        self.cmd_tx
            .try_send(Command::Deliver(envelope, args, None))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => anyhow!("{} inbox full", self.contact.name),
                mpsc::error::TrySendError::Closed(_) => anyhow!("node actor closed"),
            })
    }

    /// Handle an envelope and wait for its outcome. The forward, if any, has
    /// already been passed to the transport when this returns.
    pub async fn deliver(&self, envelope: Envelope, args: HandleArgs) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Deliver(envelope, args, Some(tx)))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    /// Decode a wire envelope and handle it.
    pub async fn deliver_wire(&self, text: &str) -> Result<Outcome> {
        let envelope = decode_envelope_bounded(text, self.max_envelope_size)
            .context("rejected inbound envelope")?;
        self.deliver(envelope, HandleArgs::default()).await
    }

    async fn originate(&self, request: Request) -> Result<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Originate(request, tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    pub async fn traceroute(&self, destination: Contact) -> Result<Envelope> {
        self.originate(Request::Traceroute { destination }).await
    }

    pub async fn ping(&self, destination: Contact, seq_id: u64) -> Result<Envelope> {
        self.originate(Request::Ping { destination, seq_id }).await
    }

    pub async fn send_file(
        &self,
        destination: Contact,
        fpath: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Envelope> {
        self.originate(Request::SendFile {
            destination,
            fpath: fpath.into(),
            file_name: file_name.into(),
            bytes,
        })
        .await
    }

    pub async fn send_message(&self, destination: Contact, message: impl Into<String>) -> Result<Envelope> {
        self.originate(Request::SendMessage {
            destination,
            message: message.into(),
        })
        .await
    }

    pub async fn advertise(&self, subscription: impl Into<String>, members: Vec<String>) -> Result<Envelope> {
        self.originate(Request::Advertise {
            subscription: subscription.into(),
            members,
        })
        .await
    }

    pub async fn clocksync(&self, destination: Contact) -> Result<Envelope> {
        self.originate(Request::ClockSync { destination }).await
    }

    pub async fn onion(&self, relays: Vec<(Contact, RsaPublicKey)>, message: impl Into<String>) -> Result<Envelope> {
        self.originate(Request::Onion {
            relays,
            message: message.into(),
        })
        .await
    }

    /// Re-evaluate outstanding pings and report the ones that went stale.
    pub async fn check_timeouts(&self) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CheckTimeouts(tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    /// Step the logical clock forward. Returns the new node time.
    pub async fn advance_clock(&self, secs: f64) -> Result<f64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AdvanceClock(secs, tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("contact", &self.contact).finish_non_exhaustive()
    }
}

struct NodeActor {
    state: NodeState,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, tick: Duration) {
        let ticking = !tick.is_zero();
        let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
        let mut last_tick = Instant::now();
        debug!(node = self.state.name(), ?tick, "node actor started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Deliver(envelope, args, reply)) => {
                            let outcome = self.dispatcher.handle(&mut self.state, envelope, &args);
                            self.send_on(outcome.forward.clone()).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(outcome);
                            }
                        }
                        Some(Command::Originate(request, reply)) => {
                            let result = self.originate(request);
                            if let Ok(envelope) = &result {
                                self.send_on(Some(envelope.clone())).await;
                            }
                            let _ = reply.send(result);
                        }
                        Some(Command::CheckTimeouts(reply)) => {
                            let outcome = ping::sweep_timeouts(&mut self.state);
                            self.dispatcher.report(&outcome);
                            let _ = reply.send(outcome);
                        }
                        Some(Command::AdvanceClock(secs, reply)) => {
                            self.state.advance_clock(secs);
                            let _ = reply.send(self.state.node_time());
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Quit) => {
                            debug!(node = self.state.name(), "node actor quitting");
                            break;
                        }
                        None => {
                            debug!(node = self.state.name(), "node handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                now = ticker.tick(), if ticking => {
                    self.state.advance_clock(now.duration_since(last_tick).as_secs_f64());
                    last_tick = now;
                }
            }
        }
    }

    fn originate(&mut self, request: Request) -> Result<Envelope> {
        let state = &mut self.state;
        let envelope = match request {
            Request::Traceroute { destination } => traceroute::request(state, destination),
            Request::Ping { destination, seq_id } => ping::request(state, destination, seq_id),
            Request::SendFile {
                destination,
                fpath,
                file_name,
                bytes,
            } => ftp::request(state, destination, fpath, file_name, &bytes),
            Request::SendMessage { destination, message } => {
                send_message::request(state, destination, message)
            }
            Request::Advertise { subscription, members } => {
                advertise::request(state, subscription, members)
            }
            Request::ClockSync { destination } => clocksync::request(state, destination),
            Request::Onion { relays, message } => tor::build_onion(
                &mut OsRng,
                state.contact(),
                &relays,
                message,
                state.node_time(),
            )
            .context("failed to build onion")?,
        };
        info!(
            node = state.name(),
            kind = envelope.payload.type_tag(),
            to = envelope.destination_name(),
            "starting exchange"
        );
        Ok(envelope)
    }

    async fn send_on(&self, forward: Option<Envelope>) {
        let Some(envelope) = forward else {
            return;
        };
        if let Err(e) = self.transport.forward(self.state.name(), envelope).await {
            warn!(node = self.state.name(), error = %e, "failed to forward envelope");
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        let subscriptions = self.state.subscriptions().clone();
        let first_hops = subscriptions
            .keys()
            .filter_map(|id| {
                self.state
                    .first_hop_of_subscription(id)
                    .map(|hop| (id.clone(), hop.to_string()))
            })
            .collect();
        NodeSnapshot {
            name: self.state.name().to_string(),
            node_time: self.state.node_time(),
            subscriptions,
            first_hops,
            pending_requests: self.state.pending_request_count(),
        }
    }
}
