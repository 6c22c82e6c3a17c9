//! `wa-scheduler` — distributed tick loop driving reminders, summaries, and
//! follow-ups (C7-C10), plus the SQLite tables those engines own.
//!
//! A single instance wins `scheduler:lock` each tick (`wa_core::kv::SharedStore`)
//! and runs one cycle: drain due reminders, detect/retry summary webhooks,
//! drain due follow-up timers, process pending follow-ups. Sending the
//! actual message content is delegated to the `SchedulerSink` trait so this
//! crate never needs an LLM or provider client of its own.

pub mod appointments;
pub mod engine;
pub mod error;
pub mod followups;
pub mod reminders;
pub mod schema;
pub mod store;
pub mod summaries;
pub mod templates;

pub use engine::{SchedulerConfig, SchedulerEngine, SchedulerSink};
pub use error::{Result, SchedulerError};
pub use reminders::NewReminder;
pub use store::SchedulerStore;
