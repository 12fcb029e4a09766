//! Domain model - conversations, messages, tickets and agents.

pub mod agent;
pub mod conversation;
pub mod message;
pub mod ticket;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use agent::Agent;
pub use conversation::{Conversation, ConversationFilter, ConversationStatus};
pub use message::{Message, SenderKind};
pub use ticket::{NewTicket, Ticket, TicketFilter, TicketPatch, TicketStatus};

pub type TenantId = u64;
pub type CustomerId = Uuid;
pub type ConversationId = Uuid;
pub type MessageId = Uuid;
pub type TicketId = Uuid;
pub type AgentId = Uuid;

/// Tenant ids are persisted as signed 64-bit integers.
pub fn validate_tenant(tenant_id: TenantId) -> Result<i64> {
    i64::try_from(tenant_id)
        .map_err(|_| Error::validation(format!("tenant id {} is out of range", tenant_id)))
}

/// A page of results with the total number of matching rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 10)
    }
}
