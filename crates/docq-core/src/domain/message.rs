//! Message value object handed out by `get`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use super::priority::Priority;
use super::timestamp::Timestamp;

/// Caller data carried by a message. Opaque to the queue except for filters.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A claimed (or otherwise loaded) queue message.
///
/// This is a snapshot of the stored document at claim time. Mutations go
/// through the queue (`ack`, `ack_send`, `requeue`) keyed by [`Message::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    payload: Payload,
    priority: Priority,
    earliest_get: Timestamp,
    created: Timestamp,
}

impl Message {
    pub fn new(
        id: MessageId,
        payload: Payload,
        priority: Priority,
        earliest_get: Timestamp,
        created: Timestamp,
    ) -> Self {
        Self {
            id,
            payload,
            priority,
            earliest_get,
            created,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// For a freshly claimed message this is the end of its visibility timeout.
    pub fn earliest_get(&self) -> Timestamp {
        self.earliest_get
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(serde_json::Value::Object(self.payload.clone()))
    }
}
