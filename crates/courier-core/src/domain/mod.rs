//! Domain model (IDs, messages, errors).

pub mod errors;
pub mod ids;
pub mod message;

pub use self::errors::{ConfigError, DeliveryError, StoreError};
pub use self::ids::{MessageId, WorkerId};
pub use self::message::{BodyKind, MessageRecord, MessageState, Payload};
