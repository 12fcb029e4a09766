//! SQLite-backed store for conversations, messages, tickets, agents and the
//! event outbox.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{ffi, params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    AgentDirectory, AgentStore, ConversationStore, MessageStore, OutboxEntry, OutboxState,
    OutboxStats, OutboxStore, TicketStore,
};
use crate::domain::{
    validate_tenant, Agent, AgentId, Conversation, ConversationFilter, ConversationId,
    ConversationStatus, CustomerId, Message, Page, PageRequest, TenantId, Ticket, TicketFilter,
    TicketId, TicketStatus,
};
use crate::error::{Error, Result};
use crate::protocol::EncodedEvent;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        tenant_id INTEGER NOT NULL,
        customer_id TEXT NOT NULL,
        assigned_agent_id TEXT,
        status TEXT NOT NULL CHECK (status IN ('open', 'assigned', 'closed')),
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_pair
        ON conversations(tenant_id, customer_id)
        WHERE status <> 'closed' AND deleted_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_conversations_agent
        ON conversations(assigned_agent_id, status);

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        sender TEXT NOT NULL CHECK (sender IN ('customer', 'agent')),
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, created_at);

    CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        tenant_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 5),
        status TEXT NOT NULL CHECK (status IN ('open', 'in_progress', 'closed')),
        created_at INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        updated_by TEXT NOT NULL,
        deleted_at INTEGER,
        deleted_by TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_live_conversation
        ON tickets(conversation_id)
        WHERE deleted_at IS NULL;

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        tenant_id INTEGER,
        available INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL UNIQUE,
        topic TEXT NOT NULL,
        payload BLOB NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending'
            CHECK (state IN ('pending', 'published', 'dead')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        published_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_state ON outbox(state, seq);
"#;

const CONVERSATION_COLUMNS: &str =
    "id, tenant_id, customer_id, assigned_agent_id, status, created_at, deleted_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, body, created_at";
const TICKET_COLUMNS: &str = "id, conversation_id, tenant_id, title, description, priority, \
     status, created_at, created_by, updated_at, updated_by, deleted_at, deleted_by";
const AGENT_COLUMNS: &str = "id, name, email, tenant_id, available, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("sqlite open {}: {}", path.display(), e)))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::debug!("Opened store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Store(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection mutex poisoned".to_string()))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn enqueue_events(conn: &Connection, events: &[EncodedEvent], now: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO outbox (event_id, topic, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for event in events {
        stmt.execute(params![
            ulid::Ulid::new().to_string(),
            event.topic,
            event.payload,
            now
        ])?;
    }
    Ok(())
}

/// Unique-index violations become `AlreadyExists`.
fn map_unique(e: rusqlite::Error, what: impl FnOnce() -> String) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Error::AlreadyExists(what())
        }
        _ => e.into(),
    }
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => get_uuid(row, idx).map(Some),
        None => Ok(None),
    }
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })
}

fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => get_time(row, idx).map(Some),
        None => Ok(None),
    }
}

fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: get_uuid(row, 0)?,
        tenant_id: row.get(1)?,
        customer_id: get_uuid(row, 2)?,
        assigned_agent_id: get_opt_uuid(row, 3)?,
        status: get_parsed(row, 4)?,
        created_at: get_time(row, 5)?,
        deleted_at: get_opt_time(row, 6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        sender: get_parsed(row, 2)?,
        body: row.get(3)?,
        created_at: get_time(row, 4)?,
    })
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        tenant_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        priority: row.get(5)?,
        status: get_parsed(row, 6)?,
        created_at: get_time(row, 7)?,
        created_by: row.get(8)?,
        updated_at: get_time(row, 9)?,
        updated_by: row.get(10)?,
        deleted_at: get_opt_time(row, 11)?,
        deleted_by: row.get(12)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: get_uuid(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        tenant_id: row.get(3)?,
        available: row.get(4)?,
        created_at: get_time(row, 5)?,
    })
}

/// A `WHERE` clause built from optional filters, with positional arguments.
struct Clauses {
    parts: Vec<String>,
    args: Vec<Value>,
}

impl Clauses {
    fn new(base: &str) -> Self {
        Self {
            parts: vec![base.to_string()],
            args: Vec::new(),
        }
    }

    fn push(&mut self, column: &str, value: Value) {
        self.args.push(value);
        self.parts.push(format!("{} = ?{}", column, self.args.len()));
    }

    fn sql(&self) -> String {
        self.parts.join(" AND ")
    }
}

fn tenant_value(tenant_id: TenantId) -> Result<Value> {
    Ok(Value::Integer(validate_tenant(tenant_id)?))
}

fn paged<T, F>(
    conn: &Connection,
    table: &str,
    columns: &str,
    clauses: Clauses,
    page: PageRequest,
    map: F,
) -> Result<Page<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let where_sql = clauses.sql();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE {}", table, where_sql),
        params_from_iter(clauses.args.iter()),
        |row| row.get(0),
    )?;

    let mut args = clauses.args;
    args.push(Value::Integer(i64::from(page.page_size)));
    args.push(Value::Integer(page.offset() as i64));
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY created_at DESC, id LIMIT ?{} OFFSET ?{}",
        columns,
        table,
        where_sql,
        args.len() - 1,
        args.len()
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), map)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page {
        items,
        total: total as u64,
        page: page.page,
        page_size: page.page_size,
    })
}

impl ConversationStore for SqliteStore {
    fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM conversations WHERE id = ?1 AND deleted_at IS NULL",
                CONVERSATION_COLUMNS
            ),
            params![id.to_string()],
            conversation_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("conversation {}", id)))
    }

    fn get_active_conversation(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<Conversation> {
        let tenant = validate_tenant(tenant_id)?;
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM conversations \
                 WHERE tenant_id = ?1 AND customer_id = ?2 \
                 AND status <> 'closed' AND deleted_at IS NULL",
                CONVERSATION_COLUMNS
            ),
            params![tenant, customer_id.to_string()],
            conversation_from_row,
        )
        .optional()?
        .ok_or_else(|| {
            Error::not_found(format!(
                "active conversation for tenant {} customer {}",
                tenant_id, customer_id
            ))
        })
    }

    fn create_conversation(
        &self,
        conversation: &Conversation,
        first_message: &Message,
        events: &[EncodedEvent],
    ) -> Result<()> {
        let tenant = validate_tenant(conversation.tenant_id)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, tenant_id, customer_id, assigned_agent_id, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.id.to_string(),
                tenant,
                conversation.customer_id.to_string(),
                conversation.assigned_agent_id.map(|a| a.to_string()),
                conversation.status.as_str(),
                conversation.created_at.timestamp_millis()
            ],
        )
        .map_err(|e| {
            map_unique(e, || {
                format!(
                    "active conversation for tenant {} customer {}",
                    conversation.tenant_id, conversation.customer_id
                )
            })
        })?;
        insert_message(&tx, first_message)?;
        enqueue_events(&tx, events, now_millis())?;
        tx.commit()?;
        Ok(())
    }

    fn update_conversation_status(
        &self,
        id: ConversationId,
        expected: ConversationStatus,
        next: ConversationStatus,
        events: &[EncodedEvent],
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE conversations SET status = ?1 \
             WHERE id = ?2 AND status = ?3 AND deleted_at IS NULL",
            params![next.as_str(), id.to_string(), expected.as_str()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        enqueue_events(&tx, events, now_millis())?;
        tx.commit()?;
        Ok(true)
    }

    fn update_assignment(
        &self,
        id: ConversationId,
        agent_id: AgentId,
        events: &[EncodedEvent],
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE conversations SET assigned_agent_id = ?1, status = 'assigned' \
             WHERE id = ?2 AND assigned_agent_id IS NULL AND status = 'open' \
             AND deleted_at IS NULL",
            params![agent_id.to_string(), id.to_string()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        enqueue_events(&tx, events, now_millis())?;
        tx.commit()?;
        Ok(true)
    }

    fn list_conversations(
        &self,
        filter: &ConversationFilter,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let mut clauses = Clauses::new("deleted_at IS NULL");
        if let Some(tenant_id) = filter.tenant_id {
            clauses.push("tenant_id", tenant_value(tenant_id)?);
        }
        if let Some(customer_id) = filter.customer_id {
            clauses.push("customer_id", Value::Text(customer_id.to_string()));
        }
        if let Some(agent_id) = filter.assigned_agent_id {
            clauses.push("assigned_agent_id", Value::Text(agent_id.to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status", Value::Text(status.as_str().to_string()));
        }

        let conn = self.conn()?;
        paged(
            &conn,
            "conversations",
            CONVERSATION_COLUMNS,
            clauses,
            page,
            conversation_from_row,
        )
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender, body, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id.to_string(),
            message.conversation_id.to_string(),
            message.sender.as_str(),
            message.body,
            message.created_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

impl MessageStore for SqliteStore {
    fn create_message(&self, message: &Message) -> Result<()> {
        let conn = self.conn()?;
        insert_message(&conn, message)
    }

    fn get_messages(
        &self,
        conversation_id: ConversationId,
        offset: u64,
        limit: u32,
    ) -> Result<(Vec<Message>, u64)> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 \
             ORDER BY created_at, rowid LIMIT ?2 OFFSET ?3",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map(
                params![conversation_id.to_string(), limit, offset as i64],
                message_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((messages, total as u64))
    }
}

impl TicketStore for SqliteStore {
    fn get_ticket(&self, id: TicketId) -> Result<Ticket> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS),
            params![id.to_string()],
            ticket_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("ticket {}", id)))
    }

    fn get_ticket_by_conversation(&self, conversation_id: ConversationId) -> Result<Ticket> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM tickets WHERE conversation_id = ?1 AND deleted_at IS NULL",
                TICKET_COLUMNS
            ),
            params![conversation_id.to_string()],
            ticket_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("ticket for conversation {}", conversation_id)))
    }

    fn create_ticket(&self, ticket: &Ticket, events: &[EncodedEvent]) -> Result<()> {
        let tenant = validate_tenant(ticket.tenant_id)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tickets (id, conversation_id, tenant_id, title, description, priority, \
             status, created_at, created_by, updated_at, updated_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                ticket.id.to_string(),
                ticket.conversation_id.to_string(),
                tenant,
                ticket.title,
                ticket.description,
                ticket.priority,
                ticket.status.as_str(),
                ticket.created_at.timestamp_millis(),
                ticket.created_by,
                ticket.updated_at.timestamp_millis(),
                ticket.updated_by
            ],
        )
        .map_err(|e| {
            map_unique(e, || {
                format!("ticket for conversation {}", ticket.conversation_id)
            })
        })?;
        enqueue_events(&tx, events, now_millis())?;
        tx.commit()?;
        Ok(())
    }

    fn update_ticket(&self, ticket: &Ticket) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tickets SET title = ?1, description = ?2, priority = ?3, \
             updated_at = ?4, updated_by = ?5 \
             WHERE id = ?6 AND deleted_at IS NULL",
            params![
                ticket.title,
                ticket.description,
                ticket.priority,
                ticket.updated_at.timestamp_millis(),
                ticket.updated_by,
                ticket.id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    fn update_ticket_status(
        &self,
        id: TicketId,
        expected: TicketStatus,
        next: TicketStatus,
        actor: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tickets SET status = ?1, updated_at = ?2, updated_by = ?3 \
             WHERE id = ?4 AND status = ?5 AND deleted_at IS NULL",
            params![
                next.as_str(),
                now_millis(),
                actor,
                id.to_string(),
                expected.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    fn soft_delete_ticket(&self, id: TicketId, actor: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_millis();
        let changed = conn.execute(
            "UPDATE tickets SET deleted_at = ?1, deleted_by = ?2, updated_at = ?1, updated_by = ?2 \
             WHERE id = ?3 AND deleted_at IS NULL",
            params![now, actor, id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn list_tickets(&self, filter: &TicketFilter, page: PageRequest) -> Result<Page<Ticket>> {
        let mut clauses = Clauses::new("deleted_at IS NULL");
        if let Some(tenant_id) = filter.tenant_id {
            clauses.push("tenant_id", tenant_value(tenant_id)?);
        }
        if let Some(conversation_id) = filter.conversation_id {
            clauses.push("conversation_id", Value::Text(conversation_id.to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status", Value::Text(status.as_str().to_string()));
        }

        let conn = self.conn()?;
        paged(&conn, "tickets", TICKET_COLUMNS, clauses, page, ticket_from_row)
    }
}

impl AgentDirectory for SqliteStore {
    /// Least-loaded available agent serving the tenant; ties go to the
    /// longest-registered agent.
    fn get_available_agent(&self, tenant_id: TenantId) -> Result<Agent> {
        let tenant = validate_tenant(tenant_id)?;
        let conn = self.conn()?;
        conn.query_row(
            "SELECT a.id, a.name, a.email, a.tenant_id, a.available, a.created_at \
             FROM agents a \
             WHERE a.available = 1 AND a.deleted_at IS NULL \
             AND (a.tenant_id IS NULL OR a.tenant_id = ?1) \
             ORDER BY ( \
                 SELECT COUNT(*) FROM conversations c \
                 WHERE c.assigned_agent_id = a.id AND c.status = 'assigned' \
                 AND c.deleted_at IS NULL \
             ), a.created_at, a.id \
             LIMIT 1",
            params![tenant],
            agent_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("available agent for tenant {}", tenant_id)))
    }
}

impl AgentStore for SqliteStore {
    fn register_agent(&self, agent: &Agent) -> Result<()> {
        let tenant = agent.tenant_id.map(validate_tenant).transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (id, name, email, tenant_id, available, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                agent.id.to_string(),
                agent.name,
                agent.email,
                tenant,
                agent.available,
                agent.created_at.timestamp_millis()
            ],
        )
        .map_err(|e| map_unique(e, || format!("agent with email {}", agent.email)))?;
        Ok(())
    }

    fn set_agent_availability(&self, id: AgentId, available: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE agents SET available = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![available, id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("agent {}", id)));
        }
        Ok(())
    }

    fn list_agents(&self, tenant_id: Option<TenantId>) -> Result<Vec<Agent>> {
        let tenant = tenant_id.map(validate_tenant).transpose()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents WHERE deleted_at IS NULL \
             AND (?1 IS NULL OR tenant_id IS NULL OR tenant_id = ?1) \
             ORDER BY created_at, id",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![tenant], agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }
}

impl OutboxStore for SqliteStore {
    fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_id, topic, payload, attempts, created_at FROM outbox \
             WHERE state = 'pending' ORDER BY seq LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(OutboxEntry {
                    seq: row.get(0)?,
                    event_id: row.get(1)?,
                    topic: row.get(2)?,
                    payload: row.get(3)?,
                    attempts: row.get(4)?,
                    created_at: get_time(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn mark_published(&self, seq: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE outbox SET state = 'published', published_at = ?1, last_error = NULL \
             WHERE seq = ?2",
            params![now_millis(), seq],
        )?;
        Ok(())
    }

    fn mark_failed(&self, seq: i64, error: &str, max_attempts: u32) -> Result<OutboxState> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row(
                "UPDATE outbox SET attempts = attempts + 1, last_error = ?1, \
                 state = CASE WHEN attempts + 1 >= ?2 THEN 'dead' ELSE 'pending' END \
                 WHERE seq = ?3 AND state = 'pending' \
                 RETURNING state",
                params![error, max_attempts, seq],
                |row| row.get(0),
            )
            .optional()?;

        match state.as_deref() {
            Some("dead") => Ok(OutboxState::Dead),
            Some(_) => Ok(OutboxState::Pending),
            None => Err(Error::not_found(format!("pending outbox entry {}", seq))),
        }
    }

    fn requeue_published(&self, topic: &str, payload: &[u8]) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE outbox SET state = 'pending', published_at = NULL \
             WHERE seq = ( \
                 SELECT seq FROM outbox \
                 WHERE state = 'published' AND topic = ?1 AND payload = ?2 \
                 ORDER BY seq DESC LIMIT 1 \
             )",
            params![topic, payload],
        )?;
        Ok(changed == 1)
    }

    fn outbox_stats(&self) -> Result<OutboxStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM outbox GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let (state, count) = row?;
            let count = count as u64;
            match state.as_str() {
                "pending" => stats.pending = count,
                "published" => stats.published = count,
                "dead" => stats.dead = count,
                other => tracing::warn!("Unknown outbox state in store: {}", other),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTicket, SenderKind};
    use crate::protocol::{topics, ConversationCreated};
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn seed_conversation(store: &SqliteStore, tenant: TenantId) -> Conversation {
        let conv = Conversation::open(tenant, Uuid::new_v4());
        let msg = Message::new(conv.id, SenderKind::Customer, "Hello").unwrap();
        store.create_conversation(&conv, &msg, &[]).unwrap();
        conv
    }

    #[test]
    fn test_create_and_get_conversation() {
        let store = store();
        let conv = Conversation::open(1, Uuid::new_v4());
        let msg = Message::new(conv.id, SenderKind::Customer, "Hello").unwrap();
        let event =
            EncodedEvent::from_envelope(&ConversationCreated::new(&conv, "Hello")).unwrap();
        store.create_conversation(&conv, &msg, &[event]).unwrap();

        let loaded = store.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.id, conv.id);
        assert_eq!(loaded.status, ConversationStatus::Open);
        assert_eq!(
            store.get_active_conversation(1, conv.customer_id).unwrap().id,
            conv.id
        );

        let (messages, total) = store.get_messages(conv.id, 0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(messages[0].body, "Hello");

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, topics::CONVERSATION_CREATED);
    }

    #[test]
    fn test_missing_rows_are_not_found() {
        let store = store();
        assert!(matches!(
            store.get_conversation(Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.get_active_conversation(1, Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.get_ticket(Uuid::new_v4()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_second_active_conversation_rejected_and_rolled_back() {
        let store = store();
        let first = seed_conversation(&store, 1);

        let dup = Conversation::open(1, first.customer_id);
        let msg = Message::new(dup.id, SenderKind::Customer, "again").unwrap();
        let event = EncodedEvent::from_envelope(&ConversationCreated::new(&dup, "again")).unwrap();

        let err = store.create_conversation(&dup, &msg, &[event]).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(store.pending_events(10).unwrap().is_empty());
        assert!(store.get_conversation(dup.id).is_err());
    }

    #[test]
    fn test_closed_conversation_frees_the_pair() {
        let store = store();
        let first = seed_conversation(&store, 1);
        assert!(store
            .update_conversation_status(
                first.id,
                ConversationStatus::Open,
                ConversationStatus::Closed,
                &[]
            )
            .unwrap());
        assert!(store.get_active_conversation(1, first.customer_id).is_err());

        let next = Conversation::open(1, first.customer_id);
        let msg = Message::new(next.id, SenderKind::Customer, "back again").unwrap();
        store.create_conversation(&next, &msg, &[]).unwrap();
        assert_eq!(
            store.get_active_conversation(1, first.customer_id).unwrap().id,
            next.id
        );
    }

    #[test]
    fn test_status_update_is_compare_and_swap() {
        let store = store();
        let conv = seed_conversation(&store, 1);

        assert!(!store
            .update_conversation_status(
                conv.id,
                ConversationStatus::Assigned,
                ConversationStatus::Closed,
                &[]
            )
            .unwrap());
        assert_eq!(
            store.get_conversation(conv.id).unwrap().status,
            ConversationStatus::Open
        );
    }

    #[test]
    fn test_assignment_only_once() {
        let store = store();
        let conv = seed_conversation(&store, 1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.update_assignment(conv.id, a, &[]).unwrap());
        assert!(!store.update_assignment(conv.id, b, &[]).unwrap());

        let loaded = store.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.assigned_agent_id, Some(a));
        assert_eq!(loaded.status, ConversationStatus::Assigned);
    }

    #[test]
    fn test_messages_are_paged_oldest_first() {
        let store = store();
        let conv = seed_conversation(&store, 1);
        for body in ["two", "three", "four"] {
            let msg = Message::new(conv.id, SenderKind::Agent, body).unwrap();
            store.create_message(&msg).unwrap();
        }

        let (page, total) = store.get_messages(conv.id, 1, 2).unwrap();
        assert_eq!(total, 4);
        let bodies: Vec<_> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[test]
    fn test_out_of_range_tenant_is_rejected() {
        let store = store();
        let filter = ConversationFilter {
            tenant_id: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            store.list_conversations(&filter, PageRequest::default()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.get_active_conversation(u64::MAX, Uuid::new_v4()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.get_available_agent(u64::MAX),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_list_conversations_filters_and_pages() {
        let store = store();
        for _ in 0..3 {
            seed_conversation(&store, 1);
        }
        seed_conversation(&store, 2);

        let filter = ConversationFilter {
            tenant_id: Some(1),
            ..Default::default()
        };
        let page = store
            .list_conversations(&filter, PageRequest::new(1, 2))
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|c| c.tenant_id == 1));

        let filter = ConversationFilter {
            status: Some(ConversationStatus::Closed),
            ..Default::default()
        };
        assert_eq!(
            store
                .list_conversations(&filter, PageRequest::default())
                .unwrap()
                .total,
            0
        );
    }

    #[test]
    fn test_one_live_ticket_per_conversation() {
        let store = store();
        let conv = seed_conversation(&store, 1);
        let first = Ticket::open(&conv, &NewTicket::new("Broken", "", 3), "ana");
        store.create_ticket(&first, &[]).unwrap();

        let second = Ticket::open(&conv, &NewTicket::new("Broken again", "", 3), "ana");
        assert!(matches!(
            store.create_ticket(&second, &[]),
            Err(Error::AlreadyExists(_))
        ));

        assert!(store.soft_delete_ticket(first.id, "ana").unwrap());
        assert!(!store.soft_delete_ticket(first.id, "ana").unwrap());
        assert!(store.get_ticket_by_conversation(conv.id).is_err());
        assert!(store.get_ticket(first.id).unwrap().is_deleted());

        store.create_ticket(&second, &[]).unwrap();
        assert_eq!(
            store.get_ticket_by_conversation(conv.id).unwrap().id,
            second.id
        );
    }

    #[test]
    fn test_ticket_status_and_update() {
        let store = store();
        let conv = seed_conversation(&store, 1);
        let mut ticket = Ticket::open(&conv, &NewTicket::new("Broken", "", 3), "ana");
        store.create_ticket(&ticket, &[]).unwrap();

        assert!(store
            .update_ticket_status(ticket.id, TicketStatus::Open, TicketStatus::InProgress, "bob")
            .unwrap());
        assert!(!store
            .update_ticket_status(ticket.id, TicketStatus::Open, TicketStatus::Closed, "bob")
            .unwrap());

        ticket.priority = 5;
        ticket.updated_by = "bob".to_string();
        assert!(store.update_ticket(&ticket).unwrap());

        let loaded = store.get_ticket(ticket.id).unwrap();
        assert_eq!(loaded.status, TicketStatus::InProgress);
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.updated_by, "bob");
        assert_eq!(loaded.created_by, "ana");
    }

    #[test]
    fn test_directory_picks_least_loaded_agent() {
        let store = store();
        let busy = Agent::new("Busy", "busy@x.com", Some(1)).unwrap();
        store.register_agent(&busy).unwrap();
        let idle = Agent::new("Idle", "idle@x.com", None).unwrap();
        store.register_agent(&idle).unwrap();
        let other = Agent::new("Other", "other@x.com", Some(2)).unwrap();
        store.register_agent(&other).unwrap();

        let conv = seed_conversation(&store, 1);
        store.update_assignment(conv.id, busy.id, &[]).unwrap();

        assert_eq!(store.get_available_agent(1).unwrap().id, idle.id);

        store.set_agent_availability(idle.id, false).unwrap();
        assert_eq!(store.get_available_agent(1).unwrap().id, busy.id);
        assert_eq!(store.list_agents(Some(2)).unwrap().len(), 2);
        assert_eq!(store.list_agents(None).unwrap().len(), 3);

        store.set_agent_availability(busy.id, false).unwrap();
        assert!(matches!(
            store.get_available_agent(1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_agent_email_rejected() {
        let store = store();
        store
            .register_agent(&Agent::new("Ana", "ana@x.com", None).unwrap())
            .unwrap();
        assert!(matches!(
            store.register_agent(&Agent::new("Ana 2", "ANA@x.com", None).unwrap()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_requeue_published_returns_entry_to_pending() {
        let store = store();
        let conv = Conversation::open(1, Uuid::new_v4());
        let msg = Message::new(conv.id, SenderKind::Customer, "Hello").unwrap();
        let event =
            EncodedEvent::from_envelope(&ConversationCreated::new(&conv, "Hello")).unwrap();
        let payload = event.payload.clone();
        store.create_conversation(&conv, &msg, &[event]).unwrap();
        let entry = store.pending_events(1).unwrap().remove(0);
        store.mark_published(entry.seq).unwrap();

        assert!(!store
            .requeue_published(topics::TICKET_CREATED, &payload)
            .unwrap());
        assert!(store
            .requeue_published(topics::CONVERSATION_CREATED, &payload)
            .unwrap());
        // Already pending again.
        assert!(!store
            .requeue_published(topics::CONVERSATION_CREATED, &payload)
            .unwrap());

        let pending = store.pending_events(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, entry.seq);
        assert_eq!(pending[0].event_id, entry.event_id);
    }

    #[test]
    fn test_outbox_retry_then_dead() {
        let store = store();
        let conv = Conversation::open(1, Uuid::new_v4());
        let msg = Message::new(conv.id, SenderKind::Customer, "Hello").unwrap();
        let event =
            EncodedEvent::from_envelope(&ConversationCreated::new(&conv, "Hello")).unwrap();
        store.create_conversation(&conv, &msg, &[event]).unwrap();
        let seq = store.pending_events(1).unwrap()[0].seq;

        assert_eq!(store.mark_failed(seq, "down", 2).unwrap(), OutboxState::Pending);
        assert_eq!(store.pending_events(1).unwrap()[0].attempts, 1);
        assert_eq!(store.mark_failed(seq, "down", 2).unwrap(), OutboxState::Dead);
        assert!(store.pending_events(1).unwrap().is_empty());
        assert!(store.mark_failed(seq, "down", 2).is_err());

        let stats = store.outbox_stats().unwrap();
        assert_eq!(stats, OutboxStats { pending: 0, published: 0, dead: 1 });
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db").join("deskflow.db");

        let conv = {
            let store = SqliteStore::open(&path).unwrap();
            seed_conversation(&store, 9)
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_conversation(conv.id).unwrap().tenant_id, 9);
    }
}
