//! Domain model: message ids, priorities, timestamps, messages and errors.

pub mod errors;
pub mod ids;
pub mod message;
pub mod priority;
pub mod timestamp;

pub use self::errors::QueueError;
pub use self::ids::MessageId;
pub use self::message::{Message, Payload};
pub use self::priority::Priority;
pub use self::timestamp::Timestamp;
