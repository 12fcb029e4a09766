//! Conversations and their status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AgentId, ConversationId, CustomerId, TenantId};
use crate::error::{Error, Result};

/// Conversation status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Assigned,
    Closed,
}

/// Legal status edges. `Closed` has no outgoing edge.
const TRANSITIONS: &[(ConversationStatus, ConversationStatus)] = &[
    (ConversationStatus::Open, ConversationStatus::Assigned),
    (ConversationStatus::Open, ConversationStatus::Closed),
    (ConversationStatus::Assigned, ConversationStatus::Closed),
];

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    /// Validate `self -> next` against the transition table.
    pub fn transition_to(self, next: ConversationStatus) -> Result<ConversationStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                entity: "conversation",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Closed
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "closed" => Ok(Self::Closed),
            other => Err(Error::validation(format!(
                "unknown conversation status '{}' (expected open, assigned or closed)",
                other
            ))),
        }
    }
}

/// A conversation between one customer and one tenant's support team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub assigned_agent_id: Option<AgentId>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// A fresh conversation in `open`.
    pub fn open(tenant_id: TenantId, customer_id: CustomerId) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            customer_id,
            assigned_agent_id: None,
            status: ConversationStatus::Open,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_agent_id.is_some()
    }
}

/// Conversation list filter.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub tenant_id: Option<TenantId>,
    pub customer_id: Option<CustomerId>,
    pub assigned_agent_id: Option<AgentId>,
    pub status: Option<ConversationStatus>,
}
