//! Message bus between the fleet host and driver agents.
//!
//! The host only sees [`AgentTransport`] for publishing and a receiver of
//! [`Inbound`] messages. Delivery is at-least-once: consumers must tolerate
//! duplicates.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::protocol::{Inbound, Outbound};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn publish(&self, message: Outbound) -> Result<(), TransportError>;
}

/// In-process transport backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new(sender: UnboundedSender<Outbound>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn publish(&self, message: Outbound) -> Result<(), TransportError> {
        tracing::trace!(driver = %message.driver(), "bus publish");
        self.sender.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Agent side of an in-process bus.
#[derive(Debug)]
pub struct AgentEndpoint {
    pub requests: UnboundedReceiver<Outbound>,
    pub replies: UnboundedSender<Inbound>,
}

/// Both ends of an in-process bus.
#[derive(Debug)]
pub struct BusPair {
    pub transport: ChannelTransport,
    pub inbound: UnboundedReceiver<Inbound>,
    pub agent: AgentEndpoint,
}

pub fn channel_bus() -> BusPair {
    let (out_tx, out_rx) = unbounded_channel();
    let (in_tx, in_rx) = unbounded_channel();
    BusPair {
        transport: ChannelTransport::new(out_tx),
        inbound: in_rx,
        agent: AgentEndpoint {
            requests: out_rx,
            replies: in_tx,
        },
    }
}
