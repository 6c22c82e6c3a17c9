//! `wa-providers` — C1's provider adapters: Meta Cloud API and WaSender.
//!
//! Each adapter normalizes its webhook envelope into a common `InboundEvent`
//! and implements `WhatsAppSender` for outbound delivery. HTTP transport
//! (axum routes, signature extraction from headers) lives in `wa-gateway`;
//! this crate only knows the provider wire formats.

pub mod dispatcher;
pub mod error;
pub mod meta;
pub mod traits;
pub mod types;
pub mod wasender;

pub use dispatcher::{Dispatcher, MediaFetcher};
pub use error::{ProviderError, Result};
pub use traits::{ImageDescriber, Transcriber, WhatsAppSender};
pub use types::{InboundEvent, InboundMsgType, OutboundContent};
