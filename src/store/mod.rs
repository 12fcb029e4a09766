//! Persistence boundary.
//!
//! Every write that must be announced on the bus takes the encoded events
//! alongside the row change; implementations persist both atomically so the
//! outbox relay never publishes an event for a write that did not happen, and
//! never misses one for a write that did.

pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::domain::{
    Agent, AgentId, Conversation, ConversationFilter, ConversationId, ConversationStatus,
    CustomerId, Message, Page, PageRequest, TenantId, Ticket, TicketFilter, TicketId,
    TicketStatus,
};
use crate::error::Result;
use crate::protocol::EncodedEvent;

pub use sqlite::SqliteStore;

pub trait ConversationStore: Send + Sync {
    /// `NotFound` when no live row has this id.
    fn get_conversation(&self, id: ConversationId) -> Result<Conversation>;

    /// The live, non-closed conversation for the pair, or `NotFound`.
    fn get_active_conversation(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<Conversation>;

    /// Insert `conversation` with its first message. `AlreadyExists` when the
    /// pair already has an active conversation.
    fn create_conversation(
        &self,
        conversation: &Conversation,
        first_message: &Message,
        events: &[EncodedEvent],
    ) -> Result<()>;

    /// Move `id` from `expected` to `next`. `false` when the row is not in
    /// `expected` any more.
    fn update_conversation_status(
        &self,
        id: ConversationId,
        expected: ConversationStatus,
        next: ConversationStatus,
        events: &[EncodedEvent],
    ) -> Result<bool>;

    /// Set the agent and move to `assigned` only if the row is `open` and
    /// unassigned. `false` when another writer got there first.
    fn update_assignment(
        &self,
        id: ConversationId,
        agent_id: AgentId,
        events: &[EncodedEvent],
    ) -> Result<bool>;

    fn list_conversations(
        &self,
        filter: &ConversationFilter,
        page: PageRequest,
    ) -> Result<Page<Conversation>>;
}

pub trait MessageStore: Send + Sync {
    fn create_message(&self, message: &Message) -> Result<()>;

    /// Messages oldest first, with the total count for the conversation.
    fn get_messages(
        &self,
        conversation_id: ConversationId,
        offset: u64,
        limit: u32,
    ) -> Result<(Vec<Message>, u64)>;
}

pub trait TicketStore: Send + Sync {
    /// Includes soft-deleted tickets.
    fn get_ticket(&self, id: TicketId) -> Result<Ticket>;

    /// The non-deleted ticket of a conversation, or `NotFound`.
    fn get_ticket_by_conversation(&self, conversation_id: ConversationId) -> Result<Ticket>;

    /// `AlreadyExists` when the conversation already has a live ticket.
    fn create_ticket(&self, ticket: &Ticket, events: &[EncodedEvent]) -> Result<()>;

    /// Persist title, description and priority of a live ticket.
    fn update_ticket(&self, ticket: &Ticket) -> Result<bool>;

    fn update_ticket_status(
        &self,
        id: TicketId,
        expected: TicketStatus,
        next: TicketStatus,
        actor: &str,
    ) -> Result<bool>;

    /// `false` when the ticket was already deleted.
    fn soft_delete_ticket(&self, id: TicketId, actor: &str) -> Result<bool>;

    fn list_tickets(&self, filter: &TicketFilter, page: PageRequest) -> Result<Page<Ticket>>;
}

/// Source of agents eligible for assignment.
pub trait AgentDirectory: Send + Sync {
    /// One available agent serving `tenant_id`, or `NotFound`.
    fn get_available_agent(&self, tenant_id: TenantId) -> Result<Agent>;
}

/// Agent administration.
pub trait AgentStore: AgentDirectory {
    fn register_agent(&self, agent: &Agent) -> Result<()>;

    fn set_agent_availability(&self, id: AgentId, available: bool) -> Result<()>;

    fn list_agents(&self, tenant_id: Option<TenantId>) -> Result<Vec<Agent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Published,
    Dead,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub seq: i64,
    pub event_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    pub dead: u64,
}

pub trait OutboxStore: Send + Sync {
    /// Oldest pending entries first.
    fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    fn mark_published(&self, seq: i64) -> Result<()>;

    /// Record a failed attempt. The entry goes `dead` once `max_attempts` is
    /// reached. Returns the new state.
    fn mark_failed(&self, seq: i64, error: &str, max_attempts: u32) -> Result<OutboxState>;

    /// Put the newest published entry carrying `payload` on `topic` back to
    /// pending, for a delivery that never reached a consumer. `false` when
    /// there is no such entry.
    fn requeue_published(&self, topic: &str, payload: &[u8]) -> Result<bool>;

    fn outbox_stats(&self) -> Result<OutboxStats>;
}
