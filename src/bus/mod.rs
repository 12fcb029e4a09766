//! Event bus client abstraction.
//!
//! Publishing is a synchronous round trip to the broker, bounded by the
//! configured publish timeout. Consuming yields a lazy sequence of payloads
//! that ends only when the bus is closed. The broker delivers at least once,
//! so consumers must tolerate duplicates.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Envelope;

pub use memory::InMemoryBus;

/// Topic/queue broker.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Route `payload` to every queue bound to `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Open a dedicated subscription on `queue`.
    async fn consume(&self, queue: &str) -> Result<Deliveries>;

    /// Drop every buffered delivery.
    async fn clear(&self) -> Result<()>;

    /// Close the connection. Open subscriptions end after draining what is
    /// already buffered.
    async fn close(&self) -> Result<()>;
}

/// Source behind a [`Deliveries`] subscription.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next payload, or `None` once the connection is closed and nothing is
    /// left buffered for this subscription.
    async fn next_delivery(&mut self) -> Option<Vec<u8>>;
}

/// A subscription on one queue.
pub struct Deliveries {
    source: Box<dyn DeliverySource>,
}

impl Deliveries {
    pub fn new(source: impl DeliverySource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.source.next_delivery().await
    }
}

impl std::fmt::Debug for Deliveries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deliveries").finish_non_exhaustive()
    }
}

/// Encode `envelope` and publish it on its topic.
pub async fn publish_envelope<E>(bus: &dyn EventBus, envelope: &E) -> Result<()>
where
    E: Envelope + Sync,
{
    let payload = envelope.encode()?;
    bus.publish(E::TOPIC, &payload).await
}
