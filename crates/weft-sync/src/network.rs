//! Transport abstraction for sync traffic.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique identifier for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a message is routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver to each listed peer once. `redundancy` is the number of
    /// independent routes a relaying transport should try.
    SingleDelivery { to: Vec<PeerId>, redundancy: usize },
    /// Deliver to every connected peer.
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOptions {
    pub mode: DeliveryMode,
    /// Higher is more urgent. Priority 1 marks deduplicated sync requests.
    pub priority: u8,
}

impl SendOptions {
    pub fn single(to: PeerId) -> Self {
        Self::to_peers(vec![to])
    }

    pub fn to_peers(to: Vec<PeerId>) -> Self {
        SendOptions {
            mode: DeliveryMode::SingleDelivery { to, redundancy: 1 },
            priority: 0,
        }
    }

    pub fn broadcast() -> Self {
        SendOptions {
            mode: DeliveryMode::Broadcast,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        if let DeliveryMode::SingleDelivery { redundancy: r, .. } = &mut self.mode {
            *r = redundancy;
        }
        self
    }
}

/// A received message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub priority: u8,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport already subscribed")]
    AlreadySubscribed,
}

/// Message delivery between peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    async fn send(&self, payload: Vec<u8>, options: SendOptions) -> Result<(), NetworkError>;

    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Take the stream of incoming messages. Only one subscriber is allowed.
    fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, NetworkError>;
}

type SharedReceiver = Arc<RwLock<Option<mpsc::Receiver<Envelope>>>>;
type SharedOutgoing = Arc<RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>>;

/// In-memory transport for tests and simulation.
pub struct MemoryTransport {
    local_id: PeerId,
    inbox: mpsc::Sender<Envelope>,
    receiver: SharedReceiver,
    outgoing: SharedOutgoing,
}

impl MemoryTransport {
    pub fn new(local_id: PeerId) -> Self {
        Self::with_capacity(local_id, 1024)
    }

    pub fn with_capacity(local_id: PeerId, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            local_id,
            inbox: tx,
            receiver: Arc::new(RwLock::new(Some(rx))),
            outgoing: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connect two transports in both directions.
    pub fn connect_to(&self, other: &MemoryTransport) {
        self.outgoing
            .write()
            .insert(other.local_id.clone(), other.inbox.clone());
        other
            .outgoing
            .write()
            .insert(self.local_id.clone(), self.inbox.clone());
    }

    /// Drop the link to `other` in both directions.
    pub fn disconnect_from(&self, other: &MemoryTransport) {
        self.outgoing.write().remove(&other.local_id);
        other.outgoing.write().remove(&self.local_id);
    }

    async fn deliver(&self, to: &PeerId, envelope: Envelope) -> Result<(), NetworkError> {
        let tx = {
            let outgoing = self.outgoing.read();
            outgoing.get(to).cloned()
        };
        let tx = tx.ok_or_else(|| NetworkError::PeerNotFound(to.clone()))?;
        tx.send(envelope)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn send(&self, payload: Vec<u8>, options: SendOptions) -> Result<(), NetworkError> {
        let broadcast = matches!(options.mode, DeliveryMode::Broadcast);
        let targets = match options.mode {
            DeliveryMode::SingleDelivery { to, .. } => to,
            DeliveryMode::Broadcast => self.connected_peers().await,
        };
        let mut first_error = None;
        for target in targets {
            let envelope = Envelope {
                from: self.local_id.clone(),
                priority: options.priority,
                payload: payload.clone(),
            };
            if let Err(e) = self.deliver(&target, envelope).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) if !broadcast => Err(e),
            _ => Ok(()),
        }
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.outgoing.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, NetworkError> {
        self.receiver
            .write()
            .take()
            .ok_or(NetworkError::AlreadySubscribed)
    }
}

/// A fully connected network of in-memory transports.
pub fn create_network(count: usize) -> Vec<MemoryTransport> {
    let transports: Vec<_> = (0..count)
        .map(|i| MemoryTransport::new(PeerId::new(format!("peer-{}", i))))
        .collect();

    for i in 0..count {
        for j in (i + 1)..count {
            transports[i].connect_to(&transports[j]);
        }
    }

    transports
}
