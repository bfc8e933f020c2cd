//! Frame-level signaling transport.
//!
//! The controller only needs an ordered, at-most-once pipe to the relay:
//! it pushes whole frames out and receives [`TransportEvent`]s back.
//! Reconnecting is the transport's business, not the controller's.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{MemoryRelay, MemoryTransport, MemoryTransportFactory, Side};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A frame has been received from the relay.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active connection to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame. Fire-and-forget: success means handed to the relay,
    /// not delivered.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
