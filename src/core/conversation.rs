//! Conversation resolution and status lifecycle.
//!
//! Handles:
//! - Attaching inbound messages to the active conversation of a
//!   tenant/customer pair, or opening a new one
//! - Validated status transitions
//! - One-time agent assignment
//!
//! Every state change writes its lifecycle event to the outbox in the same
//! transaction, then wakes the relay.

use std::sync::Arc;

use tokio::sync::Notify;

use super::locks::KeyedLocks;
use crate::domain::{
    validate_tenant, AgentId, Conversation, ConversationFilter, ConversationId,
    ConversationStatus, CustomerId, Message, Page, PageRequest, SenderKind, TenantId,
};
use crate::error::{Error, Result};
use crate::protocol::{ConversationCreated, ConversationStatusUpdated, EncodedEvent};
use crate::store::{ConversationStore, MessageStore};

/// Result of [`ConversationService::resolve_or_create`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub conversation: Conversation,
    pub message: Message,
    /// Whether a new conversation was opened for this message.
    pub created: bool,
}

pub struct ConversationService {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    outbox_signal: Arc<Notify>,
    locks: KeyedLocks<(TenantId, CustomerId)>,
}

impl ConversationService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        outbox_signal: Arc<Notify>,
    ) -> Self {
        Self {
            conversations,
            messages,
            outbox_signal,
            locks: KeyedLocks::new(),
        }
    }

    /// Attach `body` to the pair's active conversation, opening one (and
    /// announcing it) when there is none. Closed conversations are never
    /// reused.
    pub async fn resolve_or_create(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        sender: SenderKind,
        body: &str,
    ) -> Result<Resolution> {
        if body.trim().is_empty() {
            return Err(Error::validation("message body is required"));
        }
        validate_tenant(tenant_id)?;

        let _guard = self.locks.lock((tenant_id, customer_id)).await;

        match self.conversations.get_active_conversation(tenant_id, customer_id) {
            Ok(conversation) => return self.append(conversation, sender, body),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let conversation = Conversation::open(tenant_id, customer_id);
        let message = Message::new(conversation.id, sender, body)?;
        let event = EncodedEvent::from_envelope(&ConversationCreated::new(&conversation, body))?;

        match self
            .conversations
            .create_conversation(&conversation, &message, &[event])
        {
            Ok(()) => {
                self.outbox_signal.notify_one();
                tracing::info!(
                    "Opened conversation {} for tenant {} customer {}",
                    conversation.id,
                    tenant_id,
                    customer_id
                );
                Ok(Resolution {
                    conversation,
                    message,
                    created: true,
                })
            }
            // Another process opened it between our read and write.
            Err(Error::AlreadyExists(_)) => {
                tracing::debug!(
                    "Lost open race for tenant {} customer {}, attaching",
                    tenant_id,
                    customer_id
                );
                let existing = self
                    .conversations
                    .get_active_conversation(tenant_id, customer_id)?;
                self.append(existing, sender, body)
            }
            Err(e) => Err(e),
        }
    }

    fn append(
        &self,
        conversation: Conversation,
        sender: SenderKind,
        body: &str,
    ) -> Result<Resolution> {
        let message = Message::new(conversation.id, sender, body)?;
        self.messages.create_message(&message)?;
        tracing::debug!(
            "Attached {} message {} to conversation {}",
            sender,
            message.id,
            conversation.id
        );
        Ok(Resolution {
            conversation,
            message,
            created: false,
        })
    }

    /// Move a conversation along the state machine. `assigned` is reachable
    /// only through [`assign_agent`](Self::assign_agent).
    pub async fn update_status(
        &self,
        id: ConversationId,
        next: ConversationStatus,
    ) -> Result<Conversation> {
        if next == ConversationStatus::Assigned {
            return Err(Error::validation(
                "conversations become assigned only through agent assignment",
            ));
        }

        let first = self.get(id)?;
        let _guard = self.locks.lock((first.tenant_id, first.customer_id)).await;

        let mut current = first;
        loop {
            current.status.transition_to(next)?;
            let event = EncodedEvent::from_envelope(&ConversationStatusUpdated {
                conversation_id: id,
                status: next,
            })?;
            if self
                .conversations
                .update_conversation_status(id, current.status, next, &[event])?
            {
                self.outbox_signal.notify_one();
                tracing::info!("Conversation {}: {} -> {}", id, current.status, next);
                current.status = next;
                return Ok(current);
            }

            // Status moved under us; the edge set is acyclic so this settles.
            tracing::debug!("Conversation {} changed concurrently, re-reading", id);
            current = self.get(id)?;
        }
    }

    /// Assign `agent_id` to an open, unassigned conversation. Repeating the
    /// call on an assigned conversation is a no-op that returns the current
    /// row, whichever agent holds it.
    pub async fn assign_agent(&self, id: ConversationId, agent_id: AgentId) -> Result<Conversation> {
        let current = self.get(id)?;
        if current.is_assigned() {
            tracing::debug!(
                "Conversation {} already assigned to {:?}, skipping",
                id,
                current.assigned_agent_id
            );
            return Ok(current);
        }
        current
            .status
            .transition_to(ConversationStatus::Assigned)?;

        let event = EncodedEvent::from_envelope(&ConversationStatusUpdated {
            conversation_id: id,
            status: ConversationStatus::Assigned,
        })?;
        if self.conversations.update_assignment(id, agent_id, &[event])? {
            self.outbox_signal.notify_one();
            tracing::info!("Assigned conversation {} to agent {}", id, agent_id);
            return Ok(Conversation {
                assigned_agent_id: Some(agent_id),
                status: ConversationStatus::Assigned,
                ..current
            });
        }

        let latest = self.get(id)?;
        if latest.is_assigned() {
            tracing::debug!("Conversation {} was assigned concurrently", id);
            return Ok(latest);
        }
        latest
            .status
            .transition_to(ConversationStatus::Assigned)?;
        Err(Error::Store(format!("assignment of conversation {} did not apply", id)))
    }

    pub fn get(&self, id: ConversationId) -> Result<Conversation> {
        self.conversations.get_conversation(id)
    }

    pub fn list(&self, filter: &ConversationFilter, page: PageRequest) -> Result<Page<Conversation>> {
        self.conversations.list_conversations(filter, page)
    }

    /// Messages of a conversation, oldest first.
    pub fn messages(&self, id: ConversationId, page: PageRequest) -> Result<Page<Message>> {
        self.get(id)?;
        let (items, total) = self
            .messages
            .get_messages(id, page.offset(), page.page_size)?;
        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Post an agent message to a conversation that is still active.
    pub async fn reply(&self, id: ConversationId, body: &str) -> Result<Message> {
        let conversation = self.get(id)?;
        let _guard = self
            .locks
            .lock((conversation.tenant_id, conversation.customer_id))
            .await;

        let conversation = self.get(id)?;
        if !conversation.status.is_active() {
            return Err(Error::validation(format!(
                "conversation {} is closed",
                id
            )));
        }
        let message = Message::new(id, SenderKind::Agent, body)?;
        self.messages.create_message(&message)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{topics, Envelope};
    use crate::store::{OutboxStore, SqliteStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    fn service() -> (Arc<SqliteStore>, ConversationService) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = ConversationService::new(
            store.clone(),
            store.clone(),
            Arc::new(Notify::new()),
        );
        (store, service)
    }

    fn pending_topics(store: &SqliteStore) -> Vec<String> {
        store
            .pending_events(100)
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect()
    }

    #[tokio::test]
    async fn test_new_pair_opens_conversation_and_emits_created() {
        let (store, service) = service();
        let customer = Uuid::new_v4();

        let res = service
            .resolve_or_create(1, customer, SenderKind::Customer, "Hello")
            .await
            .unwrap();

        assert!(res.created);
        assert_eq!(res.conversation.status, ConversationStatus::Open);
        let messages = service
            .messages(res.conversation.id, PageRequest::default())
            .unwrap();
        assert_eq!(messages.total, 1);
        assert_eq!(messages.items[0].body, "Hello");

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 1);
        let event = ConversationCreated::decode(&pending[0].payload).unwrap();
        assert_eq!(event.tenant_id, 1);
        assert_eq!(event.customer_id, customer);
        assert_eq!(event.conversation_id, res.conversation.id);
        assert_eq!(event.message, "Hello");
    }

    #[tokio::test]
    async fn test_second_message_attaches_without_event() {
        let (store, service) = service();
        let customer = Uuid::new_v4();

        let first = service
            .resolve_or_create(1, customer, SenderKind::Customer, "Hello")
            .await
            .unwrap();
        let second = service
            .resolve_or_create(1, customer, SenderKind::Customer, "Still there?")
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);
        assert_eq!(pending_topics(&store), vec![topics::CONVERSATION_CREATED]);
        assert_eq!(
            service
                .messages(first.conversation.id, PageRequest::default())
                .unwrap()
                .total,
            2
        );
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let (_store, service) = service();
        let customer = Uuid::new_v4();

        let a = service
            .resolve_or_create(1, customer, SenderKind::Customer, "hi")
            .await
            .unwrap();
        let b = service
            .resolve_or_create(2, customer, SenderKind::Customer, "hi")
            .await
            .unwrap();
        assert_ne!(a.conversation.id, b.conversation.id);
    }

    #[tokio::test]
    async fn test_blank_body_rejected() {
        let (store, service) = service();
        let err = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.pending_events(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_tenant_rejected() {
        let (store, service) = service();
        let err = service
            .resolve_or_create(u64::MAX, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.pending_events(10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_contact_opens_one_conversation() {
        let (store, service) = service();
        let service = Arc::new(service);
        let customer = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..16 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service
                    .resolve_or_create(1, customer, SenderKind::Customer, &format!("msg {}", i))
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for handle in handles {
            let res = handle.await.unwrap();
            created += usize::from(res.created);
            ids.push(res.conversation.id);
        }
        ids.dedup();

        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(pending_topics(&store), vec![topics::CONVERSATION_CREATED]);
        assert_eq!(
            service
                .messages(ids[0], PageRequest::new(1, 100))
                .unwrap()
                .total,
            16
        );
    }

    /// Misses the first active-conversation lookup, as if another process
    /// committed right after the read.
    struct StaleFirstRead {
        inner: Arc<SqliteStore>,
        missed: AtomicBool,
    }

    impl ConversationStore for StaleFirstRead {
        fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
            self.inner.get_conversation(id)
        }

        fn get_active_conversation(
            &self,
            tenant_id: TenantId,
            customer_id: CustomerId,
        ) -> Result<Conversation> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Err(Error::not_found("stale read"));
            }
            self.inner.get_active_conversation(tenant_id, customer_id)
        }

        fn create_conversation(
            &self,
            conversation: &Conversation,
            first_message: &Message,
            events: &[EncodedEvent],
        ) -> Result<()> {
            self.inner
                .create_conversation(conversation, first_message, events)
        }

        fn update_conversation_status(
            &self,
            id: ConversationId,
            expected: ConversationStatus,
            next: ConversationStatus,
            events: &[EncodedEvent],
        ) -> Result<bool> {
            self.inner
                .update_conversation_status(id, expected, next, events)
        }

        fn update_assignment(
            &self,
            id: ConversationId,
            agent_id: AgentId,
            events: &[EncodedEvent],
        ) -> Result<bool> {
            self.inner.update_assignment(id, agent_id, events)
        }

        fn list_conversations(
            &self,
            filter: &ConversationFilter,
            page: PageRequest,
        ) -> Result<Page<Conversation>> {
            self.inner.list_conversations(filter, page)
        }
    }

    #[tokio::test]
    async fn test_lost_open_race_attaches_to_winner() {
        let (store, winner) = service();
        let customer = Uuid::new_v4();
        let first = winner
            .resolve_or_create(1, customer, SenderKind::Customer, "Hello")
            .await
            .unwrap();

        let stale = Arc::new(StaleFirstRead {
            inner: store.clone(),
            missed: AtomicBool::new(false),
        });
        let loser = ConversationService::new(stale, store.clone(), Arc::new(Notify::new()));
        let second = loser
            .resolve_or_create(1, customer, SenderKind::Customer, "Anyone?")
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);
        assert_eq!(pending_topics(&store), vec![topics::CONVERSATION_CREATED]);
        let messages = winner
            .messages(first.conversation.id, PageRequest::default())
            .unwrap();
        assert_eq!(messages.total, 2);
        assert_eq!(messages.items[1].body, "Anyone?");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_services_over_one_store_open_one_conversation() {
        let (store, a) = service();
        let a = Arc::new(a);
        let b = Arc::new(ConversationService::new(
            store.clone(),
            store.clone(),
            Arc::new(Notify::new()),
        ));

        for round in 0..20 {
            let customer = Uuid::new_v4();
            let barrier = Arc::new(Barrier::new(2));
            let mut handles = Vec::new();
            for (service, body) in [(Arc::clone(&a), "from a"), (Arc::clone(&b), "from b")] {
                let barrier = Arc::clone(&barrier);
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    service
                        .resolve_or_create(1, customer, SenderKind::Customer, body)
                        .await
                        .unwrap()
                }));
            }

            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            assert_eq!(
                results[0].conversation.id, results[1].conversation.id,
                "round {}",
                round
            );
            assert_eq!(results.iter().filter(|r| r.created).count(), 1);
            assert_eq!(
                a.messages(results[0].conversation.id, PageRequest::default())
                    .unwrap()
                    .total,
                2
            );
        }

        assert_eq!(pending_topics(&store).len(), 20);
        let all = a
            .list(&ConversationFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(all.total, 20);
    }

    #[tokio::test]
    async fn test_close_then_new_message_opens_fresh_conversation() {
        let (store, service) = service();
        let customer = Uuid::new_v4();
        let first = service
            .resolve_or_create(1, customer, SenderKind::Customer, "Hello")
            .await
            .unwrap();

        let closed = service
            .update_status(first.conversation.id, ConversationStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);

        let next = service
            .resolve_or_create(1, customer, SenderKind::Customer, "Me again")
            .await
            .unwrap();
        assert!(next.created);
        assert_ne!(next.conversation.id, first.conversation.id);
        assert_eq!(
            pending_topics(&store),
            vec![
                topics::CONVERSATION_CREATED,
                topics::CONVERSATION_STATUS_UPDATED,
                topics::CONVERSATION_CREATED
            ]
        );
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let (store, service) = service();
        let res = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap();
        let id = res.conversation.id;

        assert!(matches!(
            service.update_status(id, ConversationStatus::Open).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            service.update_status(id, ConversationStatus::Assigned).await,
            Err(Error::Validation(_))
        ));

        service
            .update_status(id, ConversationStatus::Closed)
            .await
            .unwrap();
        assert!(matches!(
            service.update_status(id, ConversationStatus::Closed).await,
            Err(Error::InvalidTransition { .. })
        ));
        // Only created + closed reached the outbox.
        assert_eq!(pending_topics(&store).len(), 2);
    }

    #[tokio::test]
    async fn test_assign_agent_is_idempotent() {
        let (store, service) = service();
        let res = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap();
        let id = res.conversation.id;
        let (agent_x, agent_y) = (Uuid::new_v4(), Uuid::new_v4());

        let assigned = service.assign_agent(id, agent_x).await.unwrap();
        assert_eq!(assigned.assigned_agent_id, Some(agent_x));
        assert_eq!(assigned.status, ConversationStatus::Assigned);

        let again = service.assign_agent(id, agent_y).await.unwrap();
        assert_eq!(again.assigned_agent_id, Some(agent_x));

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 2);
        let event = ConversationStatusUpdated::decode(&pending[1].payload).unwrap();
        assert_eq!(event.status, ConversationStatus::Assigned);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assignment_has_one_winner() {
        let (store, service) = service();
        let service = Arc::new(service);
        let id = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap()
            .conversation
            .id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service.assign_agent(id, Uuid::new_v4()).await.unwrap()
            }));
        }
        let mut agents = Vec::new();
        for handle in handles {
            agents.push(handle.await.unwrap().assigned_agent_id);
        }
        agents.dedup();

        assert_eq!(agents.len(), 1);
        assert_eq!(
            pending_topics(&store),
            vec![
                topics::CONVERSATION_CREATED,
                topics::CONVERSATION_STATUS_UPDATED
            ]
        );
    }

    #[tokio::test]
    async fn test_assign_after_close_is_rejected() {
        let (_store, service) = service();
        let id = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap()
            .conversation
            .id;

        service
            .update_status(id, ConversationStatus::Closed)
            .await
            .unwrap();
        let err = service.assign_agent(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let conv = service.get(id).unwrap();
        assert_eq!(conv.status, ConversationStatus::Closed);
        assert_eq!(conv.assigned_agent_id, None);
    }

    #[tokio::test]
    async fn test_assigned_conversation_can_close() {
        let (_store, service) = service();
        let id = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap()
            .conversation
            .id;
        service.assign_agent(id, Uuid::new_v4()).await.unwrap();

        let closed = service
            .update_status(id, ConversationStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert!(closed.assigned_agent_id.is_some());
    }

    #[tokio::test]
    async fn test_reply_only_on_active_conversation() {
        let (_store, service) = service();
        let id = service
            .resolve_or_create(1, Uuid::new_v4(), SenderKind::Customer, "Hello")
            .await
            .unwrap()
            .conversation
            .id;

        let reply = service.reply(id, "How can I help?").await.unwrap();
        assert_eq!(reply.sender, SenderKind::Agent);

        service
            .update_status(id, ConversationStatus::Closed)
            .await
            .unwrap();
        assert!(service.reply(id, "Anyone?").await.is_err());
        assert!(matches!(
            service.reply(Uuid::new_v4(), "hi").await,
            Err(Error::NotFound(_))
        ));
    }
}
