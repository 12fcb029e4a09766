//! Ticket escalation.
//!
//! A conversation has at most one live ticket. Escalations for the same
//! conversation are serialized in-process, and the store's unique index on
//! live tickets settles races between processes.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;

use super::locks::KeyedLocks;
use crate::domain::{
    ConversationId, NewTicket, Page, PageRequest, Ticket, TicketFilter, TicketId, TicketPatch,
    TicketStatus,
};
use crate::error::{Error, Result};
use crate::protocol::{EncodedEvent, TicketCreated};
use crate::store::{ConversationStore, TicketStore};

pub struct TicketService {
    conversations: Arc<dyn ConversationStore>,
    tickets: Arc<dyn TicketStore>,
    outbox_signal: Arc<Notify>,
    locks: KeyedLocks<ConversationId>,
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(Error::validation("actor is required"));
    }
    Ok(())
}

impl TicketService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        tickets: Arc<dyn TicketStore>,
        outbox_signal: Arc<Notify>,
    ) -> Self {
        Self {
            conversations,
            tickets,
            outbox_signal,
            locks: KeyedLocks::new(),
        }
    }

    /// Open a ticket for `conversation_id`. Fails with `AlreadyExists` when
    /// the conversation already has a live ticket.
    pub async fn escalate(
        &self,
        conversation_id: ConversationId,
        request: &NewTicket,
        actor: &str,
    ) -> Result<Ticket> {
        request.validate()?;
        require_actor(actor)?;

        let conversation = self.conversations.get_conversation(conversation_id)?;
        let _guard = self.locks.lock(conversation_id).await;

        match self.tickets.get_ticket_by_conversation(conversation_id) {
            Ok(existing) => {
                return Err(Error::AlreadyExists(format!(
                    "conversation {} already has ticket {}",
                    conversation_id, existing.id
                )))
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let ticket = Ticket::open(&conversation, request, actor);
        let event = EncodedEvent::from_envelope(&TicketCreated::new(&ticket))?;
        self.tickets.create_ticket(&ticket, &[event])?;
        self.outbox_signal.notify_one();

        tracing::info!(
            "Escalated conversation {} to ticket {} (priority {}) by {}",
            conversation_id,
            ticket.id,
            ticket.priority,
            actor
        );
        Ok(ticket)
    }

    /// Live ticket by id. Soft-deleted tickets are `NotFound`.
    pub fn get(&self, id: TicketId) -> Result<Ticket> {
        let ticket = self.tickets.get_ticket(id)?;
        if ticket.is_deleted() {
            return Err(Error::not_found(format!("ticket {}", id)));
        }
        Ok(ticket)
    }

    pub fn get_by_conversation(&self, conversation_id: ConversationId) -> Result<Ticket> {
        self.tickets.get_ticket_by_conversation(conversation_id)
    }

    pub fn list(&self, filter: &TicketFilter, page: PageRequest) -> Result<Page<Ticket>> {
        self.tickets.list_tickets(filter, page)
    }

    pub async fn update_status(
        &self,
        id: TicketId,
        next: TicketStatus,
        actor: &str,
    ) -> Result<Ticket> {
        require_actor(actor)?;

        let mut current = self.get(id)?;
        loop {
            current.status.transition_to(next)?;
            if self
                .tickets
                .update_ticket_status(id, current.status, next, actor)?
            {
                tracing::info!("Ticket {}: {} -> {} by {}", id, current.status, next, actor);
                return self.get(id);
            }
            tracing::debug!("Ticket {} changed concurrently, re-reading", id);
            current = self.get(id)?;
        }
    }

    /// Edit title, description or priority of a live ticket.
    pub async fn update(&self, id: TicketId, patch: &TicketPatch, actor: &str) -> Result<Ticket> {
        patch.validate()?;
        require_actor(actor)?;

        let mut ticket = self.get(id)?;
        patch.apply(&mut ticket);
        ticket.updated_at = Utc::now();
        ticket.updated_by = actor.to_string();

        if !self.tickets.update_ticket(&ticket)? {
            return Err(Error::not_found(format!("ticket {}", id)));
        }
        tracing::debug!("Updated ticket {} by {}", id, actor);
        Ok(ticket)
    }

    /// Soft-delete. The conversation may be escalated again afterwards.
    pub async fn delete(&self, id: TicketId, actor: &str) -> Result<()> {
        require_actor(actor)?;

        if !self.tickets.soft_delete_ticket(id, actor)? {
            return Err(Error::not_found(format!("ticket {}", id)));
        }
        tracing::info!("Deleted ticket {} by {}", id, actor);
        Ok(())
    }
}
