//! Lifecycle event envelopes published on the event bus.
//!
//! Each envelope is a flat JSON object; identifiers serialize as their
//! canonical string form. Decoding also accepts the legacy `cust_id` /
//! `conv_id` field names and ignores unknown fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Conversation, ConversationId, ConversationStatus, CustomerId, TenantId, Ticket, TicketId,
    TicketStatus,
};
use crate::error::{Error, Result};

/// Topic names.
pub mod topics {
    pub const CONVERSATION_CREATED: &str = "conversation_created";
    pub const CONVERSATION_STATUS_UPDATED: &str = "conversation_status_updated";
    pub const TICKET_CREATED: &str = "ticket_created";

    pub const ALL: &[&str] = &[
        CONVERSATION_CREATED,
        CONVERSATION_STATUS_UPDATED,
        TICKET_CREATED,
    ];
}

/// A typed envelope bound to exactly one topic.
pub trait Envelope: Serialize + DeserializeOwned {
    const TOPIC: &'static str;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Malformed payloads are validation errors, never retried.
    fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            Error::validation(format!("malformed {} envelope: {}", Self::TOPIC, e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationCreated {
    pub tenant_id: TenantId,
    #[serde(alias = "cust_id")]
    pub customer_id: CustomerId,
    #[serde(alias = "conv_id")]
    pub conversation_id: ConversationId,
    pub message: String,
}

impl ConversationCreated {
    pub fn new(conversation: &Conversation, message: &str) -> Self {
        Self {
            tenant_id: conversation.tenant_id,
            customer_id: conversation.customer_id,
            conversation_id: conversation.id,
            message: message.to_string(),
        }
    }
}

impl Envelope for ConversationCreated {
    const TOPIC: &'static str = topics::CONVERSATION_CREATED;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationStatusUpdated {
    #[serde(alias = "conv_id")]
    pub conversation_id: ConversationId,
    pub status: ConversationStatus,
}

impl Envelope for ConversationStatusUpdated {
    const TOPIC: &'static str = topics::CONVERSATION_STATUS_UPDATED;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketCreated {
    #[serde(alias = "conv_id")]
    pub conversation_id: ConversationId,
    pub ticket_id: TicketId,
    pub status: TicketStatus,
}

impl TicketCreated {
    pub fn new(ticket: &Ticket) -> Self {
        Self {
            conversation_id: ticket.conversation_id,
            ticket_id: ticket.id,
            status: ticket.status,
        }
    }
}

impl Envelope for TicketCreated {
    const TOPIC: &'static str = topics::TICKET_CREATED;
}

/// An envelope already encoded for its topic, ready for the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl EncodedEvent {
    pub fn from_envelope<E: Envelope>(envelope: &E) -> Result<Self> {
        Ok(Self {
            topic: E::TOPIC.to_string(),
            payload: envelope.encode()?,
        })
    }
}

/// Any lifecycle event, decoded by topic.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ConversationCreated(ConversationCreated),
    ConversationStatusUpdated(ConversationStatusUpdated),
    TicketCreated(TicketCreated),
}

impl LifecycleEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ConversationCreated(_) => ConversationCreated::TOPIC,
            Self::ConversationStatusUpdated(_) => ConversationStatusUpdated::TOPIC,
            Self::TicketCreated(_) => TicketCreated::TOPIC,
        }
    }

    pub fn encode(&self) -> Result<EncodedEvent> {
        match self {
            Self::ConversationCreated(e) => EncodedEvent::from_envelope(e),
            Self::ConversationStatusUpdated(e) => EncodedEvent::from_envelope(e),
            Self::TicketCreated(e) => EncodedEvent::from_envelope(e),
        }
    }

    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self> {
        match topic {
            topics::CONVERSATION_CREATED => {
                ConversationCreated::decode(payload).map(Self::ConversationCreated)
            }
            topics::CONVERSATION_STATUS_UPDATED => {
                ConversationStatusUpdated::decode(payload).map(Self::ConversationStatusUpdated)
            }
            topics::TICKET_CREATED => TicketCreated::decode(payload).map(Self::TicketCreated),
            other => Err(Error::validation(format!("unknown topic '{}'", other))),
        }
    }
}
