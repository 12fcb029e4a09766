//! Tickets - tracked escalations derived from a conversation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Conversation, ConversationId, TenantId, TicketId};
use crate::error::{Error, Result};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

const TRANSITIONS: &[(TicketStatus, TicketStatus)] = &[
    (TicketStatus::Open, TicketStatus::InProgress),
    (TicketStatus::InProgress, TicketStatus::Open),
    (TicketStatus::Open, TicketStatus::Closed),
    (TicketStatus::InProgress, TicketStatus::Closed),
];

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    pub fn transition_to(self, next: TicketStatus) -> Result<TicketStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                entity: "ticket",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "closed" => Ok(Self::Closed),
            other => Err(Error::validation(format!(
                "unknown ticket status '{}' (expected open, in_progress or closed)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: TicketId,
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Ticket {
    /// An `open` ticket for `conversation`, stamped with `actor`.
    pub fn open(conversation: &Conversation, request: &NewTicket, actor: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            tenant_id: conversation.tenant_id,
            title: request.title.trim().to_string(),
            description: request.description.clone(),
            priority: request.priority,
            status: TicketStatus::Open,
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Escalation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTicket {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: u8,
}

impl NewTicket {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: u8) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("ticket title is required"));
        }
        validate_priority(self.priority)
    }
}

/// Partial ticket update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
}

impl TicketPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(Error::validation("ticket title cannot be blank"));
            }
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        Ok(())
    }

    pub fn apply(&self, ticket: &mut Ticket) {
        if let Some(title) = &self.title {
            ticket.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            ticket.description = description.clone();
        }
        if let Some(priority) = self.priority {
            ticket.priority = priority;
        }
    }
}

fn validate_priority(priority: u8) -> Result<()> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "ticket priority must be between {} and {}, got {}",
            MIN_PRIORITY, MAX_PRIORITY, priority
        )))
    }
}

/// Ticket list filter. Soft-deleted tickets are never listed.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub tenant_id: Option<TenantId>,
    pub conversation_id: Option<ConversationId>,
    pub status: Option<TicketStatus>,
}
