//! CLI commands for deskflow using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::load_settings;
use crate::domain::{
    Agent, ConversationFilter, ConversationStatus, NewTicket, PageRequest, SenderKind,
    TenantId, TicketFilter, TicketPatch, TicketStatus,
};
use crate::protocol::LifecycleEvent;
use crate::runtime::Desk;
use crate::store::{AgentStore, OutboxStore};

/// deskflow - customer-support conversation lifecycle pipeline.
#[derive(Parser)]
#[command(name = "deskflow")]
#[command(version)]
#[command(about = "deskflow - conversations, assignment and escalation for support teams", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the outbox relay and assignment worker until Ctrl-C
    Serve,

    /// Record an inbound message for a tenant/customer pair
    Ingest {
        /// Tenant ID
        #[arg(long)]
        tenant: TenantId,

        /// Customer ID
        #[arg(long)]
        customer: Uuid,

        /// Who wrote the message: customer or agent
        #[arg(long, default_value = "customer")]
        sender: SenderKind,

        /// Message body
        body: String,
    },

    /// Conversation commands
    #[command(subcommand, alias = "c")]
    Conversation(ConversationCommand),

    /// Ticket commands
    #[command(subcommand, alias = "t")]
    Ticket(TicketCommand),

    /// Agent directory commands
    #[command(subcommand, alias = "a")]
    Agent(AgentCommand),

    /// Outbox commands
    #[command(subcommand)]
    Outbox(OutboxCommand),
}

#[derive(clap::Args, Debug, Clone, Copy)]
pub struct PageArgs {
    /// Page number, starting at 1
    #[arg(long, default_value_t = 1)]
    page: u32,

    /// Items per page (max 100)
    #[arg(long, default_value_t = 10)]
    page_size: u32,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

#[derive(Subcommand)]
pub enum ConversationCommand {
    /// Show one conversation
    Show {
        /// Conversation ID
        id: Uuid,
    },

    /// List conversations
    List {
        #[arg(long)]
        tenant: Option<TenantId>,

        #[arg(long)]
        customer: Option<Uuid>,

        /// Assigned agent ID
        #[arg(long)]
        agent: Option<Uuid>,

        /// open, assigned or closed
        #[arg(long)]
        status: Option<ConversationStatus>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Change conversation status (open or closed)
    Status {
        /// Conversation ID
        id: Uuid,

        /// New status
        status: ConversationStatus,
    },

    /// Assign an agent to an open conversation
    Assign {
        /// Conversation ID
        id: Uuid,

        /// Agent ID
        agent: Uuid,
    },

    /// Show messages, oldest first
    Messages {
        /// Conversation ID
        id: Uuid,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Post an agent reply
    Reply {
        /// Conversation ID
        id: Uuid,

        /// Message body
        body: String,
    },
}

#[derive(Subcommand)]
pub enum TicketCommand {
    /// Escalate a conversation to a ticket
    Escalate {
        /// Conversation ID
        conversation: Uuid,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// 1 (lowest) to 5 (highest)
        #[arg(long, default_value_t = 3)]
        priority: u8,

        /// Acting user
        #[arg(long, env = "DESKFLOW_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Show one ticket
    Show {
        /// Ticket ID
        id: Uuid,
    },

    /// List live tickets
    List {
        #[arg(long)]
        tenant: Option<TenantId>,

        #[arg(long)]
        conversation: Option<Uuid>,

        /// open, in_progress or closed
        #[arg(long)]
        status: Option<TicketStatus>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Change ticket status
    Status {
        /// Ticket ID
        id: Uuid,

        /// New status
        status: TicketStatus,

        #[arg(long, env = "DESKFLOW_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Edit ticket fields
    Update {
        /// Ticket ID
        id: Uuid,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long, env = "DESKFLOW_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Soft-delete a ticket
    Delete {
        /// Ticket ID
        id: Uuid,

        #[arg(long, env = "DESKFLOW_ACTOR", default_value = "cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Register an agent
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        /// Restrict the agent to one tenant (omit to serve all)
        #[arg(long)]
        tenant: Option<TenantId>,
    },

    /// List agents
    List {
        /// Only agents serving this tenant
        #[arg(long)]
        tenant: Option<TenantId>,
    },

    /// Mark an agent available or unavailable
    Availability {
        /// Agent ID
        id: Uuid,

        /// true or false
        #[arg(action = clap::ArgAction::Set)]
        available: bool,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommand {
    /// Show pending, published and dead entry counts
    Stats,

    /// Show the oldest entries still waiting to be published
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Serve => cmd_serve().await,
            Command::Ingest {
                tenant,
                customer,
                sender,
                body,
            } => cmd_ingest(*tenant, *customer, *sender, body).await,
            Command::Conversation(cmd) => cmd_conversation(cmd).await,
            Command::Ticket(cmd) => cmd_ticket(cmd).await,
            Command::Agent(cmd) => cmd_agent(cmd).await,
            Command::Outbox(cmd) => cmd_outbox(cmd).await,
        }
    }
}

fn open_desk() -> Result<Desk> {
    let settings = load_settings()?;
    Ok(Desk::open(settings)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// Command implementations

async fn cmd_serve() -> Result<()> {
    let desk = open_desk()?;
    tracing::info!(
        "Starting deskflow (worker queue: {})",
        desk.settings().worker.queue
    );
    let background = desk.start();
    println!("deskflow running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(stats) = desk.shutdown(background).await? {
        println!(
            "Worker stopped: {} assigned, {} skipped, {} dropped",
            stats.assigned, stats.skipped, stats.dropped
        );
    }
    Ok(())
}

async fn cmd_ingest(
    tenant: TenantId,
    customer: Uuid,
    sender: SenderKind,
    body: &str,
) -> Result<()> {
    let desk = open_desk()?;
    let res = desk
        .conversations()
        .resolve_or_create(tenant, customer, sender, body)
        .await?;

    if res.created {
        println!("Opened conversation {}", res.conversation.id);
    } else {
        println!("Attached to conversation {}", res.conversation.id);
    }
    println!("Message {}", res.message.id);
    Ok(())
}

async fn cmd_conversation(cmd: &ConversationCommand) -> Result<()> {
    let desk = open_desk()?;
    let conversations = desk.conversations();

    match cmd {
        ConversationCommand::Show { id } => print_json(&conversations.get(*id)?)?,
        ConversationCommand::List {
            tenant,
            customer,
            agent,
            status,
            page,
        } => {
            let filter = ConversationFilter {
                tenant_id: *tenant,
                customer_id: *customer,
                assigned_agent_id: *agent,
                status: *status,
            };
            let result = conversations.list(&filter, page.request())?;
            println!(
                "Conversations (page {}, {} of {}):",
                result.page,
                result.items.len(),
                result.total
            );
            for conv in &result.items {
                let agent = conv
                    .assigned_agent_id
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {}  tenant={} customer={} status={} agent={}",
                    conv.id, conv.tenant_id, conv.customer_id, conv.status, agent
                );
            }
        }
        ConversationCommand::Status { id, status } => {
            let conv = conversations.update_status(*id, *status).await?;
            println!("Conversation {} is now {}", conv.id, conv.status);
        }
        ConversationCommand::Assign { id, agent } => {
            let conv = conversations.assign_agent(*id, *agent).await?;
            match conv.assigned_agent_id {
                Some(assigned) if assigned == *agent => {
                    println!("Assigned conversation {} to {}", conv.id, assigned)
                }
                Some(assigned) => println!(
                    "Conversation {} was already assigned to {}",
                    conv.id, assigned
                ),
                None => println!("Conversation {} is unassigned", conv.id),
            }
        }
        ConversationCommand::Messages { id, page } => {
            let result = conversations.messages(*id, page.request())?;
            println!("Messages ({} total):", result.total);
            for msg in &result.items {
                println!(
                    "  [{}] {}: {}",
                    msg.created_at.format("%Y-%m-%d %H:%M:%S"),
                    msg.sender,
                    msg.body
                );
            }
        }
        ConversationCommand::Reply { id, body } => {
            let msg = conversations.reply(*id, body).await?;
            println!("Posted message {}", msg.id);
        }
    }
    Ok(())
}

async fn cmd_ticket(cmd: &TicketCommand) -> Result<()> {
    let desk = open_desk()?;
    let tickets = desk.tickets();

    match cmd {
        TicketCommand::Escalate {
            conversation,
            title,
            description,
            priority,
            actor,
        } => {
            let request = NewTicket::new(title.as_str(), description.as_str(), *priority);
            let ticket = tickets.escalate(*conversation, &request, actor).await?;
            println!(
                "Created ticket {} for conversation {}",
                ticket.id, ticket.conversation_id
            );
        }
        TicketCommand::Show { id } => print_json(&tickets.get(*id)?)?,
        TicketCommand::List {
            tenant,
            conversation,
            status,
            page,
        } => {
            let filter = TicketFilter {
                tenant_id: *tenant,
                conversation_id: *conversation,
                status: *status,
            };
            let result = tickets.list(&filter, page.request())?;
            println!(
                "Tickets (page {}, {} of {}):",
                result.page,
                result.items.len(),
                result.total
            );
            for ticket in &result.items {
                println!(
                    "  {}  [{}] p{} {} (conversation {})",
                    ticket.id, ticket.status, ticket.priority, ticket.title, ticket.conversation_id
                );
            }
        }
        TicketCommand::Status { id, status, actor } => {
            let ticket = tickets.update_status(*id, *status, actor).await?;
            println!("Ticket {} is now {}", ticket.id, ticket.status);
        }
        TicketCommand::Update {
            id,
            title,
            description,
            priority,
            actor,
        } => {
            let patch = TicketPatch {
                title: title.clone(),
                description: description.clone(),
                priority: *priority,
            };
            let ticket = tickets.update(*id, &patch, actor).await?;
            print_json(&ticket)?;
        }
        TicketCommand::Delete { id, actor } => {
            tickets.delete(*id, actor).await?;
            println!("Deleted ticket {}", id);
        }
    }
    Ok(())
}

async fn cmd_agent(cmd: &AgentCommand) -> Result<()> {
    let desk = open_desk()?;
    let store = desk.store();

    match cmd {
        AgentCommand::Add {
            name,
            email,
            tenant,
        } => {
            let agent = Agent::new(name, email, *tenant)?;
            store.register_agent(&agent)?;
            println!("Registered agent {} ({})", agent.id, agent.email);
        }
        AgentCommand::List { tenant } => {
            let agents = store.list_agents(*tenant)?;
            println!("Agents:");
            for agent in agents {
                let scope = agent
                    .tenant_id
                    .map(|t| format!("tenant {}", t))
                    .unwrap_or_else(|| "all tenants".to_string());
                let state = if agent.available { "available" } else { "away" };
                println!(
                    "  {}: {} <{}> ({}, {})",
                    agent.id, agent.name, agent.email, scope, state
                );
            }
        }
        AgentCommand::Availability { id, available } => {
            store.set_agent_availability(*id, *available)?;
            println!(
                "Agent {} is now {}",
                id,
                if *available { "available" } else { "away" }
            );
        }
    }
    Ok(())
}

async fn cmd_outbox(cmd: &OutboxCommand) -> Result<()> {
    let desk = open_desk()?;
    match cmd {
        OutboxCommand::Stats => {
            let stats = desk.store().outbox_stats()?;
            println!("Outbox:");
            println!("  pending:   {}", stats.pending);
            println!("  published: {}", stats.published);
            println!("  dead:      {}", stats.dead);
        }
        OutboxCommand::Pending { limit } => {
            let entries = desk.store().pending_events(*limit)?;
            println!("Pending events ({}):", entries.len());
            for entry in entries {
                let summary = match LifecycleEvent::decode(&entry.topic, &entry.payload) {
                    Ok(LifecycleEvent::ConversationCreated(e)) => {
                        format!("conversation {} opened", e.conversation_id)
                    }
                    Ok(LifecycleEvent::ConversationStatusUpdated(e)) => {
                        format!("conversation {} -> {}", e.conversation_id, e.status)
                    }
                    Ok(LifecycleEvent::TicketCreated(e)) => {
                        format!("ticket {} for conversation {}", e.ticket_id, e.conversation_id)
                    }
                    Err(e) => format!("undecodable: {}", e),
                };
                println!(
                    "  #{} {} attempts={} {}",
                    entry.seq, entry.topic, entry.attempts, summary
                );
            }
        }
    }
    Ok(())
}
