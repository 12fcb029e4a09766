//! Messages - immutable, append-only, ordered by creation time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConversationId, MessageId};
use crate::error::{Error, Result};

/// Who wrote a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Customer,
    Agent,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            other => Err(Error::validation(format!(
                "unknown sender kind '{}' (expected customer or agent)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message, rejecting blank bodies.
    pub fn new(conversation_id: ConversationId, sender: SenderKind, body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Err(Error::validation("message body is required"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender,
            body: body.to_string(),
            created_at: Utc::now(),
        })
    }
}
