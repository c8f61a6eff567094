//! Query builder: caller filters over payload fields -> filters over stored
//! queue documents.
//!
//! Callers write `{ "type": "email", "attempt": { "$lt": 3 } }` against their
//! own payload. Each top-level key is moved under the `payload.` namespace;
//! values (including nested operators) pass through untouched. Top-level
//! operators such as `$or` are rejected because their branches would escape
//! the rewrite.

use serde_json::{Value, json};

use crate::domain::{Payload, QueueError, Timestamp};
use crate::ports::Document;

/// Field names of the persisted message layout.
pub mod fields {
    pub const ID: &str = "_id";
    pub const PAYLOAD: &str = "payload";
    pub const PRIORITY: &str = "priority";
    pub const EARLIEST_GET: &str = "earliestGet";
    pub const CREATED: &str = "created";
}

/// `payload.<field>`
pub fn payload_field(field: &str) -> String {
    format!("{}.{field}", fields::PAYLOAD)
}

/// A payload field name usable in filters and indexes.
pub(crate) fn is_valid_field(field: &str) -> bool {
    !field.is_empty() && !field.starts_with('$')
}

/// Rewrite a caller filter into the payload namespace.
pub fn payload_filter(filter: &Payload) -> Result<Document, QueueError> {
    let mut out = Document::with_capacity(filter.len());
    for (key, value) in filter {
        if !is_valid_field(key) {
            return Err(QueueError::InvalidFilterKey(key.clone()));
        }
        out.insert(payload_field(key), value.clone());
    }
    Ok(out)
}

/// Condition matching messages that are eligible at `now`.
pub fn visible_at(now: Timestamp) -> Value {
    json!({ "$lte": now.as_millis() })
}

/// Condition matching messages still hidden at `now`.
pub fn invisible_at(now: Timestamp) -> Value {
    json!({ "$gt": now.as_millis() })
}

/// Filter selecting a single message document by id.
pub fn by_id(id: impl ToString) -> Document {
    let mut filter = Document::new();
    filter.insert(fields::ID.to_string(), Value::String(id.to_string()));
    filter
}
