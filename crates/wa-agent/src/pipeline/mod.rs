//! The Conversation Orchestrator (C3) and Context-Summary Engine (C6):
//! everything that runs once a batch of inbound messages has been flushed
//! by `wa_batcher::Batcher`.

pub mod compact;
pub mod context;
pub mod process;

pub use compact::maybe_run_context_summary;
pub use context::Orchestrator;
