//! In-process topic-routed broker.
//!
//! Topics route to queues through a binding table, like a direct exchange.
//! Each queue is a bounded buffer shared by competing consumers; a payload
//! leaves the queue only when a consumer actually receives it, so dropping a
//! subscription never loses a delivery. Closing the bus lets consumers drain
//! what is already buffered; anything still left afterwards can be taken
//! back with [`InMemoryBus::take_undelivered`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use super::{Deliveries, DeliverySource, EventBus};
use crate::config::BusSettings;
use crate::error::{Error, Result};

struct Buffered {
    topic: String,
    payload: Vec<u8>,
}

struct QueueState {
    tx: mpsc::Sender<Buffered>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Buffered>>>,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[derive(Default)]
struct Topology {
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, Arc<QueueState>>,
}

pub struct InMemoryBus {
    topology: Mutex<Topology>,
    capacity: usize,
    publish_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl InMemoryBus {
    /// Create a bus and declare every queue named in `settings.bindings`.
    pub fn new(settings: &BusSettings) -> Self {
        let (closed, _) = watch::channel(false);
        let bus = Self {
            topology: Mutex::new(Topology::default()),
            capacity: settings.queue_capacity.max(1),
            publish_timeout: settings.publish_timeout(),
            closed,
        };
        for (topic, queues) in &settings.bindings {
            for queue in queues {
                bus.bind(topic, queue);
            }
        }
        bus
    }

    /// Declare `queue` if needed and route `topic` to it.
    pub fn bind(&self, topic: &str, queue: &str) {
        let mut topology = self.lock_topology();
        let capacity = self.capacity;
        topology
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(capacity)));
        let bound = topology.bindings.entry(topic.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        tracing::debug!("Bound topic {} -> queue {}", topic, queue);
    }

    /// Number of deliveries buffered in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock_topology()
            .queues
            .get(queue)
            .map(|q| q.depth())
            .unwrap_or(0)
    }

    /// Remove every buffered delivery no consumer received, as
    /// `(topic, payload)` pairs in queue order.
    pub fn take_undelivered(&self) -> Vec<(String, Vec<u8>)> {
        let queues: Vec<(String, Arc<QueueState>)> = self
            .lock_topology()
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), Arc::clone(q)))
            .collect();

        let mut taken = Vec::new();
        for (name, queue) in queues {
            let Ok(mut rx) = queue.rx.try_lock() else {
                tracing::warn!("Queue {} is busy, leaving its deliveries in place", name);
                continue;
            };
            while let Ok(item) = rx.try_recv() {
                taken.push((item.topic, item.payload));
            }
        }
        taken
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn lock_topology(&self) -> std::sync::MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn routes(&self, topic: &str) -> Vec<(String, Arc<QueueState>)> {
        let topology = self.lock_topology();
        topology
            .bindings
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|name| {
                topology
                    .queues
                    .get(name)
                    .map(|q| (name.clone(), Arc::clone(q)))
            })
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Bus("connection is closed".to_string()));
        }

        let routes = self.routes(topic);
        if routes.is_empty() {
            tracing::debug!("No queue bound to topic {}, payload dropped", topic);
            return Ok(());
        }

        for (name, queue) in routes {
            let item = Buffered {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            tokio::time::timeout(self.publish_timeout, queue.tx.send(item))
                .await
                .map_err(|_| {
                    Error::Bus(format!(
                        "publish to queue {} timed out after {:?}",
                        name, self.publish_timeout
                    ))
                })?
                .map_err(|_| Error::Bus(format!("queue {} is gone", name)))?;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        if self.is_closed() {
            return Err(Error::Bus("connection is closed".to_string()));
        }
        let state = self
            .lock_topology()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::Bus(format!("queue {} is not declared", queue)))?;

        tracing::debug!("Opened subscription on queue {}", queue);
        Ok(Deliveries::new(QueueConsumer {
            rx: Arc::clone(&state.rx),
            closed: self.closed.subscribe(),
        }))
    }

    async fn clear(&self) -> Result<()> {
        let queues: Vec<Arc<QueueState>> = self.lock_topology().queues.values().cloned().collect();
        let mut purged = 0;
        for queue in queues {
            // A consumer holding the lock is parked on an empty queue.
            if let Ok(mut rx) = queue.rx.try_lock() {
                while rx.try_recv().is_ok() {
                    purged += 1;
                }
            }
        }
        tracing::debug!("Cleared {} buffered deliveries", purged);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        tracing::info!("Event bus closed");
        Ok(())
    }
}

struct QueueConsumer {
    rx: Arc<AsyncMutex<mpsc::Receiver<Buffered>>>,
    closed: watch::Receiver<bool>,
}

/// Resolves once the bus is closed or dropped.
async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl DeliverySource for QueueConsumer {
    async fn next_delivery(&mut self) -> Option<Vec<u8>> {
        let rx = Arc::clone(&self.rx);
        // Competing consumers release the lock once the bus closes, so this
        // never waits past close.
        let mut guard = rx.lock().await;
        let item = tokio::select! {
            biased;
            item = guard.recv() => item,
            _ = closed(&mut self.closed) => guard.try_recv().ok(),
        };
        item.map(|item| item.payload)
    }
}
