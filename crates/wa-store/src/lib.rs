pub mod agents;
pub mod conversations;
pub mod dedup;
pub mod error;
pub mod knowledge;
pub mod messages;
pub mod products;
pub mod schema;
pub mod store;
pub mod users;

pub use error::{is_unique_violation, Error, Result};
pub use store::Store;
