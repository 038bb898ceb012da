//! WitnessTransport trait for carrying witness messages between members.
//!
//! Delivery is best effort. A lost report or vote only makes a session fall
//! back to its timeout.

use crate::PeerId;
use crate::witness::WitnessMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Sends witness messages to realm members.
#[async_trait]
pub trait WitnessTransport: Send + Sync {
    /// Send to every other member of the realm.
    async fn broadcast(&self, message: &WitnessMessage) -> Result<()>;

    /// Send to one member.
    async fn send_to(&self, peer_id: PeerId, message: &WitnessMessage) -> Result<()>;
}

/// A message handed to a `ChannelTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// `None` for a broadcast
    pub to: Option<PeerId>,
    pub message: WitnessMessage,
}

/// Transport that queues outgoing messages on a channel.
///
/// Whoever owns the receiver does the actual delivery.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, to: Option<PeerId>, message: &WitnessMessage) -> Result<()> {
        self.tx
            .send(Outbound {
                to,
                message: message.clone(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl WitnessTransport for ChannelTransport {
    async fn broadcast(&self, message: &WitnessMessage) -> Result<()> {
        self.push(None, message)
    }

    async fn send_to(&self, peer_id: PeerId, message: &WitnessMessage) -> Result<()> {
        self.push(Some(peer_id), message)
    }
}
