//! The message queue: send, claim, count, acknowledge and requeue messages
//! stored as documents in a [`Collection`].
//!
//! Visibility is a single timestamp. A message can be claimed once its
//! `earliestGet` is not in the future; claiming pushes `earliestGet` forward
//! by the running reset, so an unacknowledged message comes back on its own.

mod claim;
mod document;

pub use claim::{DEFAULT_POLL, DEFAULT_RUNNING_RESET, DEFAULT_WAIT, GetOptions};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::QueueConfig;
use crate::domain::{Message, MessageId, Payload, Priority, QueueError, Timestamp};
use crate::index::IndexPlanner;
use crate::ports::{Clock, Collection, Document, IdGenerator, SystemClock, UlidGenerator, Update};
use crate::query::{self, fields};

pub struct Queue {
    collection: Arc<dyn Collection>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    indexes: IndexPlanner,
}

impl Queue {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self::with_clock(collection, Arc::new(SystemClock))
    }

    pub fn with_clock(collection: Arc<dyn Collection>, clock: Arc<dyn Clock>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            indexes: IndexPlanner::new(Arc::clone(&collection)),
            collection,
            clock,
            ids,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_config(mut self, config: &QueueConfig) -> Self {
        self.indexes = IndexPlanner::new(Arc::clone(&self.collection))
            .with_attempts(config.index_attempts);
        self
    }

    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_datetime(self.clock.now())
    }

    /// Index covering `get` with the given payload fields around the claim sort.
    pub async fn ensure_get_index(
        &self,
        before_sort: &[(&str, i64)],
        after_sort: &[(&str, i64)],
    ) -> Result<(), QueueError> {
        self.indexes.ensure_get_index(before_sort, after_sort).await
    }

    /// Index covering `count` over the given payload fields.
    pub async fn ensure_count_index(
        &self,
        fields: &[(&str, i64)],
        include_running: bool,
    ) -> Result<(), QueueError> {
        self.indexes.ensure_count_index(fields, include_running).await
    }

    /// Enqueue a new message, claimable from `earliest_get` on.
    pub async fn send(
        &self,
        payload: Payload,
        earliest_get: Timestamp,
        priority: f64,
    ) -> Result<MessageId, QueueError> {
        let priority = Priority::new(priority)?;
        let id = self.ids.generate_message_id();
        let doc = document::new_document(id, payload, priority, earliest_get, self.now());
        self.collection.insert_one(doc).await?;
        debug!(id = %id, priority = %priority, earliest_get = %earliest_get, "sent message");
        Ok(id)
    }

    /// Count messages matching `filter`.
    ///
    /// `running`: `Some(true)` counts only hidden (claimed or delayed)
    /// messages, `Some(false)` only claimable ones, `None` all of them.
    pub async fn count(&self, filter: &Payload, running: Option<bool>) -> Result<u64, QueueError> {
        let mut query = query::payload_filter(filter)?;
        match running {
            Some(true) => {
                query.insert(fields::EARLIEST_GET.to_string(), query::invisible_at(self.now()));
            }
            Some(false) => {
                query.insert(fields::EARLIEST_GET.to_string(), query::visible_at(self.now()));
            }
            None => {}
        }
        Ok(self.collection.count_documents(&query).await?)
    }

    /// Remove a message. Acking one that is already gone is not an error.
    pub async fn ack(&self, message: &Message) -> Result<(), QueueError> {
        let deleted = self.collection.delete_one(&query::by_id(message.id())).await?;
        debug!(id = %message.id(), deleted, "acked message");
        Ok(())
    }

    /// Atomically replace a message with a new one under the same id.
    ///
    /// If the message was deleted in the meantime it is recreated, so there
    /// is always exactly one document for the id afterwards. With
    /// `new_timestamp` false the original `created` is kept, which keeps the
    /// message's place among equal priorities.
    pub async fn ack_send(
        &self,
        message: &Message,
        payload: Payload,
        earliest_get: Timestamp,
        priority: f64,
        new_timestamp: bool,
    ) -> Result<(), QueueError> {
        let priority = Priority::new(priority)?;
        let now = Value::from(self.now().as_millis());

        let mut set = Document::new();
        set.insert(fields::PAYLOAD.to_string(), Value::Object(payload));
        set.insert(
            fields::EARLIEST_GET.to_string(),
            Value::from(earliest_get.as_millis()),
        );
        set.insert(fields::PRIORITY.to_string(), Value::from(priority.value()));

        let mut update = Update::set(set);
        if new_timestamp {
            update.set.insert(fields::CREATED.to_string(), now);
        } else {
            update.set_on_insert.insert(fields::CREATED.to_string(), now);
        }

        let result = self
            .collection
            .update_one(&query::by_id(message.id()), &update, true)
            .await?;
        debug!(
            id = %message.id(),
            recreated = result.upserted,
            earliest_get = %earliest_get,
            "replaced message"
        );
        Ok(())
    }

    /// Put a message back with its own payload.
    pub async fn requeue(
        &self,
        message: &Message,
        earliest_get: Timestamp,
        priority: f64,
        new_timestamp: bool,
    ) -> Result<(), QueueError> {
        self.ack_send(
            message,
            message.payload().clone(),
            earliest_get,
            priority,
            new_timestamp,
        )
        .await
    }

    /// Make a message claimable again right away, behind its equal-priority peers.
    pub async fn requeue_now(&self, message: &Message) -> Result<(), QueueError> {
        self.requeue(message, self.now(), message.priority().value(), true)
            .await
    }

    /// Requeue `message` to become visible `delay` from now.
    pub async fn requeue_after(&self, message: &Message, delay: Duration) -> Result<(), QueueError> {
        let earliest_get = self.now().saturating_add(delay);
        self.requeue(message, earliest_get, message.priority().value(), true)
            .await
    }
}
