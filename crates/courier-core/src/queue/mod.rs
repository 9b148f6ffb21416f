//! Queue module: retry/lease policies and `MessageStore` implementations.

mod memory;
mod retry;
mod sqlite;

pub use memory::InMemoryMessageStore;
pub use retry::{DEFAULT_MAX_ATTEMPTS, LeasePolicy, RetryPolicy};
pub use sqlite::SqliteMessageStore;
