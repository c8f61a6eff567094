//! Stored document layout <-> [`Message`].
//!
//! ```text
//! { _id: "<ulid>", payload: {..}, priority: f64, earliestGet: ms, created: ms }
//! ```

use serde_json::Value;

use crate::domain::{Message, MessageId, Payload, Priority, QueueError, Timestamp};
use crate::ports::Document;
use crate::query::fields;

pub(crate) fn new_document(
    id: MessageId,
    payload: Payload,
    priority: Priority,
    earliest_get: Timestamp,
    created: Timestamp,
) -> Document {
    let mut doc = Document::new();
    doc.insert(fields::ID.to_string(), Value::String(id.to_string()));
    doc.insert(fields::PAYLOAD.to_string(), Value::Object(payload));
    doc.insert(fields::PRIORITY.to_string(), Value::from(priority.value()));
    doc.insert(
        fields::EARLIEST_GET.to_string(),
        Value::from(earliest_get.as_millis()),
    );
    doc.insert(fields::CREATED.to_string(), Value::from(created.as_millis()));
    doc
}

pub(crate) fn message_from_document(mut doc: Document) -> Result<Message, QueueError> {
    let id = match doc.get(fields::ID) {
        Some(Value::String(s)) => s
            .parse::<MessageId>()
            .map_err(|e| malformed(fields::ID, e))?,
        other => return Err(malformed(fields::ID, describe(other))),
    };

    let payload = match doc.remove(fields::PAYLOAD) {
        Some(Value::Object(map)) => map,
        other => return Err(malformed(fields::PAYLOAD, describe(other.as_ref()))),
    };

    let priority = match doc.get(fields::PRIORITY).and_then(Value::as_f64) {
        Some(value) => Priority::new(value).map_err(|e| malformed(fields::PRIORITY, e))?,
        None => return Err(malformed(fields::PRIORITY, describe(doc.get(fields::PRIORITY)))),
    };

    let earliest_get = millis(&doc, fields::EARLIEST_GET)?;
    let created = millis(&doc, fields::CREATED)?;

    Ok(Message::new(id, payload, priority, earliest_get, created))
}

fn millis(doc: &Document, field: &str) -> Result<Timestamp, QueueError> {
    doc.get(field)
        .and_then(Value::as_i64)
        .map(Timestamp::from_millis)
        .ok_or_else(|| malformed(field, describe(doc.get(field))))
}

fn malformed(field: &str, reason: impl std::fmt::Display) -> QueueError {
    QueueError::MalformedDocument(format!("{field}: {reason}"))
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "missing".to_string(),
        Some(v) => format!("unexpected value {v}"),
    }
}
