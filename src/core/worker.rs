//! Assignment worker.
//!
//! Drains the conversation-created queue and assigns an available agent to
//! each new conversation. Deliveries are handled one at a time; a delivery
//! that cannot be handled is logged and dropped, leaving the conversation
//! unassigned for manual follow-up.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::core::conversation::ConversationService;
use crate::domain::{AgentId, ConversationId};
use crate::error::{Error, Result};
use crate::protocol::{ConversationCreated, Envelope};
use crate::store::AgentDirectory;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Assigned {
        conversation_id: ConversationId,
        agent_id: AgentId,
    },
    /// Duplicate delivery, or someone else assigned first.
    AlreadyAssigned { conversation_id: ConversationId },
    /// Payload did not decode.
    Malformed,
    NoAgent { conversation_id: ConversationId },
    Failed { conversation_id: ConversationId },
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub assigned: u64,
    pub skipped: u64,
    pub dropped: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Assigned { .. } => self.assigned += 1,
            Outcome::AlreadyAssigned { .. } => self.skipped += 1,
            Outcome::Malformed | Outcome::NoAgent { .. } | Outcome::Failed { .. } => {
                self.dropped += 1
            }
        }
    }
}

pub struct AssignmentWorker {
    bus: Arc<dyn EventBus>,
    directory: Arc<dyn AgentDirectory>,
    conversations: Arc<ConversationService>,
    queue: String,
}

impl AssignmentWorker {
    pub fn new(
        bus: Arc<dyn EventBus>,
        directory: Arc<dyn AgentDirectory>,
        conversations: Arc<ConversationService>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            directory,
            conversations,
            queue: queue.into(),
        }
    }

    /// Consume until the bus connection closes.
    pub async fn run(&self) -> Result<WorkerStats> {
        let mut deliveries = self.bus.consume(&self.queue).await?;
        tracing::info!("Assignment worker consuming {}", self.queue);

        let mut stats = WorkerStats::default();
        while let Some(payload) = deliveries.next().await {
            let outcome = self.process(&payload).await;
            stats.record(&outcome);
        }

        tracing::info!(
            "Assignment worker stopped: {} assigned, {} skipped, {} dropped",
            stats.assigned,
            stats.skipped,
            stats.dropped
        );
        Ok(stats)
    }

    /// Handle one delivery. Never fails; the outcome says what happened.
    pub async fn process(&self, payload: &[u8]) -> Outcome {
        let event = match ConversationCreated::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping delivery on {}: {}", self.queue, e);
                return Outcome::Malformed;
            }
        };
        let conversation_id = event.conversation_id;

        match self.conversations.get(conversation_id) {
            Ok(conversation) if conversation.is_assigned() => {
                tracing::debug!("Conversation {} already assigned, skipping", conversation_id);
                return Outcome::AlreadyAssigned { conversation_id };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Dropping delivery for conversation {}: {}", conversation_id, e);
                return Outcome::Failed { conversation_id };
            }
        }

        let agent = match self.directory.get_available_agent(event.tenant_id) {
            Ok(agent) if agent.serves(event.tenant_id) => agent,
            Ok(agent) => {
                tracing::error!(
                    "Directory offered agent {} outside tenant {}, conversation {} stays unassigned",
                    agent.id,
                    event.tenant_id,
                    conversation_id
                );
                return Outcome::NoAgent { conversation_id };
            }
            Err(Error::NotFound(_)) => {
                tracing::warn!(
                    "No available agent for tenant {}, conversation {} stays unassigned",
                    event.tenant_id,
                    conversation_id
                );
                return Outcome::NoAgent { conversation_id };
            }
            Err(e) => {
                tracing::error!(
                    "Agent directory failed for conversation {}: {}",
                    conversation_id,
                    e
                );
                return Outcome::Failed { conversation_id };
            }
        };

        match self
            .conversations
            .assign_agent(conversation_id, agent.id)
            .await
        {
            Ok(conversation) if conversation.assigned_agent_id == Some(agent.id) => {
                Outcome::Assigned {
                    conversation_id,
                    agent_id: agent.id,
                }
            }
            Ok(_) => Outcome::AlreadyAssigned { conversation_id },
            Err(e) => {
                tracing::warn!("Could not assign conversation {}: {}", conversation_id, e);
                Outcome::Failed { conversation_id }
            }
        }
    }
}
