//! Outbox relay.
//!
//! Publishes outbox entries in commit order. A failed publish stops the
//! batch so later events never overtake an earlier one; the entry is retried
//! on the next pass until it runs out of attempts and is parked as dead.

use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::bus::EventBus;
use crate::config::OutboxSettings;
use crate::error::Result;
use crate::store::{OutboxState, OutboxStore};

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    signal: Arc<Notify>,
    settings: OutboxSettings,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        signal: Arc<Notify>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            outbox,
            bus,
            signal,
            settings,
        }
    }

    /// Publish one batch of pending entries. Returns how many were published.
    pub async fn drain_once(&self) -> Result<usize> {
        let entries = self.outbox.pending_events(self.settings.batch_size)?;
        let mut published = 0;

        for entry in entries {
            match self.bus.publish(&entry.topic, &entry.payload).await {
                Ok(()) => {
                    self.outbox.mark_published(entry.seq)?;
                    published += 1;
                }
                Err(e) => {
                    let state =
                        self.outbox
                            .mark_failed(entry.seq, &e.to_string(), self.settings.max_attempts)?;
                    if state == OutboxState::Dead {
                        tracing::error!(
                            "Giving up on outbox entry {} ({}) after {} attempts: {}",
                            entry.event_id,
                            entry.topic,
                            entry.attempts + 1,
                            e
                        );
                    } else {
                        tracing::warn!(
                            "Publish of outbox entry {} ({}) failed, will retry: {}",
                            entry.event_id,
                            entry.topic,
                            e
                        );
                    }
                    break;
                }
            }
        }

        if published > 0 {
            tracing::debug!("Relayed {} outbox entries", published);
        }
        Ok(published)
    }

    /// Relay until `shutdown` flips to true, then make one last pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_once().await {
                // A full batch likely means more is waiting.
                Ok(n) if n == self.settings.batch_size => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!("Outbox relay pass failed: {}", e),
            }

            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.drain_once().await {
            tracing::warn!("Final outbox pass failed: {}", e);
        }
        tracing::info!("Outbox relay stopped");
    }
}
