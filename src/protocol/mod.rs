//! Wire protocol for the event bus.
//!
//! This module defines the lifecycle event envelopes shared between the
//! conversation/ticket services and bus consumers:
//! - Topic names
//! - Typed envelopes with JSON encode/decode
//! - Pre-encoded events for the outbox

pub mod envelope;

pub use envelope::{
    topics, ConversationCreated, ConversationStatusUpdated, EncodedEvent, Envelope,
    LifecycleEvent, TicketCreated,
};
