//! Core module - conversation lifecycle, escalation and background workers.
//!
//! This module contains the heart of deskflow's message processing:
//! - Conversation resolution and status transitions
//! - Ticket escalation
//! - The assignment worker consuming conversation-created events
//! - The outbox relay publishing lifecycle events

pub mod conversation;
pub mod locks;
pub mod relay;
pub mod ticket;
pub mod worker;

pub use conversation::{ConversationService, Resolution};
pub use locks::KeyedLocks;
pub use relay::OutboxRelay;
pub use ticket::TicketService;
pub use worker::{AssignmentWorker, Outcome, WorkerStats};
