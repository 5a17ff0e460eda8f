//! # In-Process Mesh
//!
//! [`MeshTransport`] connects [`Node`]s running in one process along a
//! line, in the order they joined:
//!
//! ```text
//! A ── B ── C ── D
//! ```
//!
//! A forwarded envelope moves one position toward its destination per hop,
//! so a packet from A to C is handled by B on the way. An envelope whose
//! destination is the forwarding node itself is delivered back to it.
//!
//! Delivery never blocks the forwarding actor: a full inbox drops the
//! envelope and reports an error to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::dispatch::{Dispatcher, HandleArgs};
use crate::envelope::Envelope;
use crate::node::Node;
use crate::protocols::Transport;
use crate::state::{NodeConfig, NodeState};

#[derive(Default)]
struct Topology {
    order: Vec<String>,
    nodes: HashMap<String, Node>,
}

#[derive(Default)]
pub struct MeshTransport {
    topology: RwLock<Topology>,
}

impl MeshTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn a node for `state` and append it to the end of the line.
    pub async fn join(
        self: &Arc<Self>,
        state: NodeState,
        dispatcher: Dispatcher,
        config: &NodeConfig,
    ) -> Result<Node> {
        let name = state.name().to_string();
        let mut topology = self.topology.write().await;
        if topology.nodes.contains_key(&name) {
            return Err(anyhow!("node {} already joined", name));
        }
        let transport: Arc<dyn Transport> = self.clone();
        let node = Node::spawn(state, dispatcher, transport, config);
        topology.order.push(name.clone());
        topology.nodes.insert(name, node.clone());
        Ok(node)
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.topology.read().await.nodes.get(name).cloned()
    }

    pub async fn members(&self) -> Vec<String> {
        self.topology.read().await.order.clone()
    }

    /// Stop every node actor.
    pub async fn shutdown(&self) {
        let nodes: Vec<Node> = {
            let mut topology = self.topology.write().await;
            topology.order.clear();
            topology.nodes.drain().map(|(_, node)| node).collect()
        };
        for node in nodes {
            node.quit().await;
        }
    }

    /// Neighbor of `from` one step toward `to`, or `from` itself.
    fn next_hop<'a>(topology: &'a Topology, from: &str, to: &str) -> Result<&'a Node> {
        let position = |name: &str| topology.order.iter().position(|n| n == name);
        let target = position(to).ok_or_else(|| anyhow!("unknown destination {}", to))?;
        let hop = match position(from) {
            Some(here) if here < target => here + 1,
            Some(here) if here > target => here - 1,
            _ => target,
        };
        topology
            .nodes
            .get(&topology.order[hop])
            .ok_or_else(|| anyhow!("node {} not running", topology.order[hop]))
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn forward(&self, from: &str, envelope: Envelope) -> Result<()> {
        let topology = self.topology.read().await;
        let next = Self::next_hop(&topology, from, envelope.destination_name())?;
        trace!(
            from,
            via = next.name(),
            to = envelope.destination_name(),
            kind = envelope.payload.type_tag(),
            "mesh hop"
        );
        next.post(envelope, HandleArgs::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::RecordingConsole;
    use crate::identity::Contact;
    use crate::storage::FsStore;
    use std::time::Duration;

    async fn line(names: &[&str]) -> Arc<MeshTransport> {
        let mesh = MeshTransport::new();
        let config = NodeConfig {
            tick_interval: Duration::ZERO,
            ..NodeConfig::default()
        };
        for name in names {
            let dispatcher = Dispatcher::new(Arc::new(RecordingConsole::new()), Arc::new(FsStore));
            let state = NodeState::new(Contact::named(*name), &config, 0.0);
            mesh.join(state, dispatcher, &config).await.unwrap();
        }
        mesh
    }

    #[tokio::test]
    async fn next_hop_walks_the_line() {
        let mesh = line(&["A", "B", "C", "D"]).await;
        let topology = mesh.topology.read().await;
        let hop = |from, to| MeshTransport::next_hop(&topology, from, to).map(|n| n.name().to_string());

        assert_eq!(hop("A", "D").unwrap(), "B");
        assert_eq!(hop("D", "A").unwrap(), "C");
        assert_eq!(hop("C", "C").unwrap(), "C");
        assert_eq!(hop("outsider", "B").unwrap(), "B");
        assert!(hop("A", "nobody").is_err());
        drop(topology);
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let mesh = line(&["A"]).await;
        let config = NodeConfig::default();
        let dispatcher = Dispatcher::new(Arc::new(RecordingConsole::new()), Arc::new(FsStore));
        let again = NodeState::new(Contact::named("A"), &config, 0.0);
        assert!(mesh.join(again, dispatcher, &config).await.is_err());
        assert_eq!(mesh.members().await, vec!["A"]);
        mesh.shutdown().await;
    }
}
