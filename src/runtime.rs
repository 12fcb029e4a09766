//! Process wiring.
//!
//! `Desk` owns the long-lived handles (store, bus, outbox signal) and hands
//! them to the services and background tasks that need them.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::bus::{EventBus, InMemoryBus};
use crate::config::Settings;
use crate::core::{AssignmentWorker, ConversationService, OutboxRelay, TicketService, WorkerStats};
use crate::error::Result;
use crate::store::{OutboxStore, SqliteStore};

pub struct Desk {
    settings: Settings,
    store: Arc<SqliteStore>,
    bus: Arc<InMemoryBus>,
    outbox_signal: Arc<Notify>,
    conversations: Arc<ConversationService>,
    tickets: Arc<TicketService>,
}

/// Handles of the spawned relay and worker.
pub struct Background {
    shutdown: watch::Sender<bool>,
    relay: JoinHandle<()>,
    worker: Option<JoinHandle<Result<WorkerStats>>>,
}

impl Desk {
    /// Open the configured database and build the services.
    pub fn open(settings: Settings) -> Result<Self> {
        let path = settings.database.resolve_path()?;
        let store = SqliteStore::open(&path)?;
        Ok(Self::assemble(settings, store))
    }

    /// Same wiring over a private in-memory database.
    pub fn in_memory(settings: Settings) -> Result<Self> {
        let store = SqliteStore::open_in_memory()?;
        Ok(Self::assemble(settings, store))
    }

    fn assemble(settings: Settings, store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let bus = Arc::new(InMemoryBus::new(&settings.bus));
        let outbox_signal = Arc::new(Notify::new());

        let conversations = Arc::new(ConversationService::new(
            store.clone(),
            store.clone(),
            outbox_signal.clone(),
        ));
        let tickets = Arc::new(TicketService::new(
            store.clone(),
            store.clone(),
            outbox_signal.clone(),
        ));

        Self {
            settings,
            store,
            bus,
            outbox_signal,
            conversations,
            tickets,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<InMemoryBus> {
        &self.bus
    }

    pub fn conversations(&self) -> &Arc<ConversationService> {
        &self.conversations
    }

    pub fn tickets(&self) -> &Arc<TicketService> {
        &self.tickets
    }

    pub fn relay(&self) -> OutboxRelay {
        OutboxRelay::new(
            self.store.clone(),
            self.bus.clone(),
            self.outbox_signal.clone(),
            self.settings.outbox.clone(),
        )
    }

    pub fn worker(&self) -> AssignmentWorker {
        AssignmentWorker::new(
            self.bus.clone(),
            self.store.clone(),
            self.conversations.clone(),
            self.settings.worker.queue.clone(),
        )
    }

    /// Spawn the outbox relay and, when enabled, the assignment worker.
    pub fn start(&self) -> Background {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let relay = self.relay();
        let relay = tokio::spawn(async move { relay.run(shutdown_rx).await });

        let worker = if self.settings.worker.enabled {
            let worker = self.worker();
            Some(tokio::spawn(async move { worker.run().await }))
        } else {
            tracing::info!("Assignment worker disabled");
            None
        };

        Background {
            shutdown,
            relay,
            worker,
        }
    }

    /// Stop the relay after a final pass, then close the bus. The worker
    /// works through what is already buffered before it finishes; deliveries
    /// nobody received go back to the outbox for the next start. Returns the
    /// worker's counters when it ran.
    pub async fn shutdown(&self, background: Background) -> Result<Option<WorkerStats>> {
        let _ = background.shutdown.send(true);
        if let Err(e) = background.relay.await {
            tracing::error!("Outbox relay task failed: {}", e);
        }

        self.bus.close().await?;

        let stats = match background.worker {
            None => None,
            Some(worker) => match worker.await {
                Ok(Ok(stats)) => Some(stats),
                Ok(Err(e)) => {
                    tracing::error!("Assignment worker failed: {}", e);
                    None
                }
                Err(e) => {
                    tracing::error!("Assignment worker task failed: {}", e);
                    None
                }
            },
        };

        self.requeue_undelivered()?;
        Ok(stats)
    }

    fn requeue_undelivered(&self) -> Result<usize> {
        let mut requeued = 0;
        for (topic, payload) in self.bus.take_undelivered() {
            if self.store.requeue_published(&topic, &payload)? {
                requeued += 1;
            }
        }
        if requeued > 0 {
            tracing::info!("Returned {} undelivered events to the outbox", requeued);
        }
        Ok(requeued)
    }
}
