//! Message plumbing between nodes.
//!
//! Every protocol message travels in an [`Envelope`] naming the protocol
//! instance it belongs to. Nodes hand envelopes to a [`Transport`]; the
//! in-process [`LocalNetwork`] is the one used by the local cluster and tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::error::Error;
use crate::randutil::random_bytes;
use crate::types::{Message, Roster, ServerIdentity};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub [u8; 16]);

impl InstanceId {
    pub fn random() -> Self {
        InstanceId(random_bytes())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", hex::encode(&self.0[..4]))
    }
}

/// Protocols a node knows how to instantiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Setup,
    /// Setup moving an existing LTS onto a new roster.
    Reshare,
    Reencrypt,
    ReencryptBatch,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Setup => "SetupDKG",
            ProtocolKind::Reshare => "ReshareLTS",
            ProtocolKind::Reencrypt => "OCS",
            ProtocolKind::ReencryptBatch => "OCSBatch",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub instance: InstanceId,
    pub kind: ProtocolKind,
    pub from: String,
    /// Roster of the instance, so a node can join on the first message.
    pub roster: Roster,
    pub message: Message,
}

/// A message as delivered to a running instance.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub from: String,
    pub message: Message,
}

pub trait Transport: Send + Sync {
    /// Hand `envelope` to the node at `to`. Fails if the node can't be reached.
    fn send(&self, to: &str, envelope: Envelope) -> Result<(), Error>;
}

/// Addressing helper handed to every protocol instance.
#[derive(Clone)]
pub struct InstanceContext {
    pub instance: InstanceId,
    pub kind: ProtocolKind,
    pub me: String,
    pub roster: Roster,
    transport: Arc<dyn Transport>,
}

impl InstanceContext {
    pub fn new(
        instance: InstanceId,
        kind: ProtocolKind,
        me: impl Into<String>,
        roster: Roster,
        transport: Arc<dyn Transport>,
    ) -> Self {
        InstanceContext {
            instance,
            kind,
            me: me.into(),
            roster,
            transport,
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.roster.index_of(&self.me)
    }

    /// The root is the first node of the roster.
    pub fn is_root(&self) -> bool {
        self.index() == Some(0)
    }

    pub fn root(&self) -> Option<&ServerIdentity> {
        self.roster.get(0)
    }

    pub fn send(&self, to: &str, message: Message) -> Result<(), Error> {
        trace!(instance = %self.instance, to, msg = message.name(), "send");
        self.transport.send(
            to,
            Envelope {
                instance: self.instance,
                kind: self.kind,
                from: self.me.clone(),
                roster: self.roster.clone(),
                message,
            },
        )
    }

    /// Send `message` to every other roster member. Returns the nodes that
    /// couldn't be reached.
    pub fn broadcast(&self, message: &Message) -> Vec<(String, Error)> {
        let mut failed = Vec::new();
        for si in &self.roster.list {
            if si.address == self.me {
                continue;
            }
            if let Err(e) = self.send(&si.address, message.clone()) {
                debug!(instance = %self.instance, to = %si.address, error = %e, "broadcast failed");
                failed.push((si.address.clone(), e));
            }
        }
        failed
    }
}

/// In-process network. Envelopes go through a JSON round trip so nothing is
/// shared between nodes except bytes.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, UnboundedSender<Envelope>>>,
    paused: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    pub fn register(&self, address: impl Into<String>) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        self.nodes.write().insert(address.into(), tx);
        rx
    }

    /// A paused node neither receives nor sends.
    pub fn pause(&self, address: &str) {
        self.paused.write().insert(address.to_string());
    }

    pub fn resume(&self, address: &str) {
        self.paused.write().remove(address);
    }

    pub fn is_paused(&self, address: &str) -> bool {
        self.paused.read().contains(address)
    }
}

impl Transport for LocalNetwork {
    fn send(&self, to: &str, envelope: Envelope) -> Result<(), Error> {
        if self.is_paused(to) || self.is_paused(&envelope.from) {
            return Err(Error::Unreachable(to.to_string()));
        }
        let bytes = serde_json::to_vec(&envelope)?;
        let envelope: Envelope = serde_json::from_slice(&bytes)?;

        let nodes = self.nodes.read();
        let tx = nodes
            .get(to)
            .ok_or_else(|| Error::Unreachable(to.to_string()))?;
        tx.send(envelope)
            .map_err(|_| Error::Unreachable(to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyPair;

    fn roster(names: &[&str]) -> Roster {
        Roster::new(
            names
                .iter()
                .map(|n| ServerIdentity::new(*n, &KeyPair::random().public))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_broadcast_skips_self_and_reports_paused() {
        let net = LocalNetwork::new();
        let _a = net.register("a");
        let mut b = net.register("b");
        let _c = net.register("c");
        net.pause("c");

        let ctx = InstanceContext::new(
            InstanceId::random(),
            ProtocolKind::Setup,
            "a",
            roster(&["a", "b", "c"]),
            net.clone(),
        );
        assert!(ctx.is_root());
        let failed = ctx.broadcast(&Message::WaitReply);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "c");

        let env = b.recv().await.unwrap();
        assert_eq!(env.from, "a");
        assert_eq!(env.instance, ctx.instance);
        assert!(matches!(env.message, Message::WaitReply));

        net.resume("c");
        assert!(ctx.send("c", Message::WaitReply).is_ok());
    }

    #[test]
    fn test_unknown_node_is_unreachable() {
        let net = LocalNetwork::new();
        let ctx = InstanceContext::new(
            InstanceId::random(),
            ProtocolKind::Reencrypt,
            "a",
            roster(&["a", "z"]),
            net,
        );
        assert!(matches!(
            ctx.send("z", Message::WaitReply),
            Err(Error::Unreachable(_))
        ));
    }
}
