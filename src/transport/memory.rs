//! In-process relay pairing exactly two transports.
//!
//! Behaves like the production relay as far as the controller can tell:
//! frames from one side are delivered in order to the other, and the relay
//! itself injects `connected` / `disconnected` presence envelopes when the
//! pairing forms or breaks.

use async_trait::async_trait;
use bytes::Bytes;
use callcore::SignalingEnvelope;
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use super::{Transport, TransportEvent, TransportFactory};

const CHANNEL_CAPACITY: usize = 100;

/// One of the two seats on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

struct Seat {
    epoch: u64,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct RelayInner {
    seats: [Option<Seat>; 2],
    next_epoch: u64,
}

/// A relay connecting side A to side B.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, side: Side) -> MemoryTransportFactory {
        MemoryTransportFactory {
            relay: self.clone(),
            side,
        }
    }

    /// Factories for both seats.
    pub fn factories(&self) -> (MemoryTransportFactory, MemoryTransportFactory) {
        (self.factory(Side::A), self.factory(Side::B))
    }

    pub async fn is_attached(&self, side: Side) -> bool {
        self.inner.lock().await.seats[side.index()].is_some()
    }

    async fn attach(&self, side: Side) -> (u64, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().await;
        inner.next_epoch += 1;
        let epoch = inner.next_epoch;

        let _ = tx.try_send(TransportEvent::Connected);
        if let Some(previous) = inner.seats[side.index()].replace(Seat {
            epoch,
            events: tx.clone(),
        }) {
            debug!("Relay seat {side:?} re-attached, dropping previous transport");
            let _ = previous.events.try_send(TransportEvent::Disconnected);
        }

        if let Some(other) = &inner.seats[side.other().index()] {
            debug!("Relay pairing formed");
            deliver_presence(&other.events, SignalingEnvelope::Connected).await;
            deliver_presence(&tx, SignalingEnvelope::Connected).await;
        }

        (epoch, rx)
    }

    async fn forward(&self, from: Side, frame: Bytes) {
        let target = {
            let inner = self.inner.lock().await;
            inner.seats[from.other().index()]
                .as_ref()
                .map(|seat| seat.events.clone())
        };

        match target {
            Some(events) => {
                trace!("Relay {from:?} -> {:?}: {} bytes", from.other(), frame.len());
                if events.send(TransportEvent::FrameReceived(frame)).await.is_err() {
                    debug!("Relay peer receiver dropped, frame discarded");
                }
            }
            None => debug!("Relay has no peer for {from:?}, frame discarded"),
        }
    }

    async fn detach(&self, side: Side, epoch: u64) {
        let mut inner = self.inner.lock().await;
        let seat = &mut inner.seats[side.index()];
        if seat.as_ref().is_none_or(|s| s.epoch != epoch) {
            return;
        }
        if let Some(own) = seat.take() {
            let _ = own.events.try_send(TransportEvent::Disconnected);
        }
        if let Some(other) = &inner.seats[side.other().index()] {
            debug!("Relay pairing broken by {side:?}");
            deliver_presence(&other.events, SignalingEnvelope::Disconnected).await;
        }
    }
}

async fn deliver_presence(events: &mpsc::Sender<TransportEvent>, envelope: SignalingEnvelope) {
    match envelope.encode() {
        Ok(frame) => {
            let _ = events
                .send(TransportEvent::FrameReceived(Bytes::from(frame)))
                .await;
        }
        Err(e) => warn!("Failed to encode relay presence notice: {e}"),
    }
}

/// One seat's connection to a [`MemoryRelay`].
pub struct MemoryTransport {
    relay: MemoryRelay,
    side: Side,
    epoch: u64,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let attached = {
            let inner = self.relay.inner.lock().await;
            inner.seats[self.side.index()]
                .as_ref()
                .is_some_and(|seat| seat.epoch == self.epoch)
        };
        if !attached {
            return Err(anyhow::anyhow!("transport is closed"));
        }
        self.relay
            .forward(self.side, Bytes::copy_from_slice(frame))
            .await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.relay.detach(self.side, self.epoch).await;
    }
}

/// Creates transports bound to one seat of a relay.
#[derive(Clone)]
pub struct MemoryTransportFactory {
    relay: MemoryRelay,
    side: Side,
}

impl MemoryTransportFactory {
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn relay(&self) -> &MemoryRelay {
        &self.relay
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (epoch, rx) = self.relay.attach(self.side).await;
        let transport = MemoryTransport {
            relay: self.relay.clone(),
            side: self.side,
            epoch,
        };
        Ok((Arc::new(transport), rx))
    }
}
