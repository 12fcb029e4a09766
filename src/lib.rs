//! deskflow library root.

pub mod bus;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod store;

pub use bus::{EventBus, InMemoryBus};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{AssignmentWorker, ConversationService, OutboxRelay, TicketService};
pub use error::{Error, Result};
pub use runtime::Desk;
pub use store::SqliteStore;
