//! Index planner.
//!
//! Builds the compound indexes that cover the claim and count queries and
//! creates them without ever producing duplicates. Stores refuse a second
//! index with the same keys under another name (and the same name with other
//! keys), and some cap name length, so creation is "try a random name, shrink
//! it, and check whether an index with exactly our keys now exists".

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::QueueError;
use crate::ports::{Collection, Direction, IndexModel, KeyPattern};
use crate::query::{self, fields};

pub const DEFAULT_INDEX_ATTEMPTS: u32 = 5;

pub struct IndexPlanner {
    collection: Arc<dyn Collection>,
    attempts: u32,
}

impl IndexPlanner {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self {
            collection,
            attempts: DEFAULT_INDEX_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// `earliestGet`, `before_sort`, `priority`, `created`, `after_sort`.
    ///
    /// Equality/range fields lead, the claim sort follows, and extra payload
    /// fields trail.
    pub fn get_index_keys(
        before_sort: &[(&str, i64)],
        after_sort: &[(&str, i64)],
    ) -> Result<KeyPattern, QueueError> {
        let before = payload_keys(before_sort)?;
        let after = payload_keys(after_sort)?;

        let mut keys = KeyPattern::new().with(fields::EARLIEST_GET, Direction::Ascending);
        keys.extend(before);
        keys.push(fields::PRIORITY, Direction::Ascending);
        keys.push(fields::CREATED, Direction::Ascending);
        keys.extend(after);
        Ok(keys)
    }

    /// Optional `earliestGet` followed by the payload fields.
    pub fn count_index_keys(
        fields: &[(&str, i64)],
        include_running: bool,
    ) -> Result<KeyPattern, QueueError> {
        let payload = payload_keys(fields)?;
        let mut keys = KeyPattern::new();
        if include_running {
            keys.push(fields::EARLIEST_GET, Direction::Ascending);
        }
        keys.extend(payload);
        Ok(keys)
    }

    pub async fn ensure_get_index(
        &self,
        before_sort: &[(&str, i64)],
        after_sort: &[(&str, i64)],
    ) -> Result<(), QueueError> {
        let keys = Self::get_index_keys(before_sort, after_sort)?;
        self.ensure_index(keys).await
    }

    pub async fn ensure_count_index(
        &self,
        fields: &[(&str, i64)],
        include_running: bool,
    ) -> Result<(), QueueError> {
        let keys = Self::count_index_keys(fields, include_running)?;
        self.ensure_index(keys).await
    }

    /// Create an index with `keys` unless an existing index already starts
    /// with them.
    pub async fn ensure_index(&self, keys: KeyPattern) -> Result<(), QueueError> {
        if keys.is_empty() {
            return Err(QueueError::EmptyIndex);
        }

        let existing = self.collection.list_indexes().await?;
        if let Some(index) = existing.iter().find(|index| index.keys.starts_with(&keys)) {
            debug!(keys = %keys, covered_by = %index.name, "index already covered");
            return Ok(());
        }

        for attempt in 1..=self.attempts {
            let name = generate_name();
            for len in (1..=name.len()).rev() {
                let candidate = &name[..len];
                match self
                    .collection
                    .create_index(IndexModel::new(candidate, keys.clone()))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_index_collision() => {
                        debug!(attempt, name = candidate, error = %e, "index creation rejected");
                    }
                    Err(e) => return Err(e.into()),
                }

                // Whoever won the name, an index with exactly our keys is all we need.
                let indexes = self.collection.list_indexes().await?;
                if let Some(index) = indexes.iter().find(|index| index.keys == keys) {
                    info!(keys = %keys, name = %index.name, "index ready");
                    return Ok(());
                }
            }
        }

        warn!(keys = %keys, attempts = self.attempts, "giving up on index creation");
        Err(QueueError::IndexCreationExhausted {
            keys: keys.to_string(),
            attempts: self.attempts,
        })
    }
}

/// Validate `(field, direction)` pairs and move them into the payload namespace.
fn payload_keys(pairs: &[(&str, i64)]) -> Result<Vec<(String, Direction)>, QueueError> {
    pairs
        .iter()
        .map(|&(field, direction)| {
            if !query::is_valid_field(field) {
                return Err(QueueError::InvalidIndexField(field.to_string()));
            }
            let direction =
                Direction::try_from(direction).map_err(|direction| QueueError::InvalidDirection {
                    field: field.to_string(),
                    direction,
                })?;
            Ok((query::payload_field(field), direction))
        })
        .collect()
}

/// Random hex name, shrunk from the right when the store rejects it.
fn generate_name() -> String {
    format!("{:016x}", rand::random::<u64>())
}
