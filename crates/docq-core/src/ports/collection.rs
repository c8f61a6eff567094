//! Collection port - the document store the queue lives in.
//!
//! The queue never coordinates consumers itself. Everything rests on the
//! store applying [`Collection::find_one_and_update`] to a single document
//! atomically, so two concurrent claims can never win the same message.
//!
//! Filters use the Mongo-style query language: `{ "field.path": value }` for
//! equality and `{ "field": { "$lte": value } }` for operators.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// A stored document, a filter, or a set of fields to write.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Sort / index direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i64(self) -> i64 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

impl TryFrom<i64> for Direction {
    type Error = i64;

    /// Only `1` and `-1` are directions; anything else is handed back.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Ascending),
            -1 => Ok(Direction::Descending),
            other => Err(other),
        }
    }
}

/// Ordered list of `(field, direction)` pairs, used for sorts and indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPattern(Vec<(String, Direction)>);

impl KeyPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, direction: Direction) {
        self.0.push((field.into(), direction));
    }

    pub fn with(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.push(field, direction);
        self
    }

    pub fn fields(&self) -> &[(String, Direction)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` matches the leading fields (and directions) of `self`.
    pub fn starts_with(&self, prefix: &KeyPattern) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl FromIterator<(String, Direction)> for KeyPattern {
    fn from_iter<I: IntoIterator<Item = (String, Direction)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<(String, Direction)> for KeyPattern {
    fn extend<I: IntoIterator<Item = (String, Direction)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (field, direction)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}: {}", direction.as_i64())?;
        }
        write!(f, "}}")
    }
}

/// A named secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexModel {
    pub name: String,
    pub keys: KeyPattern,
}

impl IndexModel {
    pub fn new(name: impl Into<String>, keys: KeyPattern) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }
}

/// `$set` plus `$setOnInsert`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    /// Only applied when an upsert inserts a new document.
    pub set_on_insert: Document,
}

impl Update {
    pub fn set(set: Document) -> Self {
        Self {
            set,
            set_on_insert: Document::new(),
        }
    }
}

/// Which version of the document `find_one_and_update` hands back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Default)]
pub struct FindOneAndUpdateOptions {
    pub sort: KeyPattern,
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

/// Errors reported by a [`Collection`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: _id {0:?} already exists")]
    DuplicateKey(String),

    #[error("index name {name:?} is longer than {max} bytes")]
    IndexNameTooLong { name: String, max: usize },

    #[error("index {name:?} conflicts with an existing index: {reason}")]
    IndexConflict { name: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Index creation rejections that only mean "pick another name" or
    /// "an equivalent index is already there".
    pub fn is_index_collision(&self) -> bool {
        matches!(
            self,
            StoreError::IndexNameTooLong { .. } | StoreError::IndexConflict { .. }
        )
    }
}

/// Store collaborator contract consumed by the queue.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Insert a new document. Fails with [`StoreError::DuplicateKey`] when the
    /// `_id` is taken.
    async fn insert_one(&self, doc: Document) -> Result<(), StoreError>;

    /// Atomically pick the first document matching `filter` in `options.sort`
    /// order, apply `update` and return it. `Ok(None)` means nothing matched
    /// (and `upsert` was off).
    async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, StoreError>;

    /// Update the first document matching `filter`, inserting one when
    /// nothing matched and `upsert` is set.
    async fn update_one(
        &self,
        filter: &Document,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError>;

    /// Delete the first matching document; returns how many were removed.
    async fn delete_one(&self, filter: &Document) -> Result<u64, StoreError>;

    async fn count_documents(&self, filter: &Document) -> Result<u64, StoreError>;

    async fn list_indexes(&self) -> Result<Vec<IndexModel>, StoreError>;

    async fn create_index(&self, index: IndexModel) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Ok(Direction::Ascending))]
    #[case(-1, Ok(Direction::Descending))]
    #[case(0, Err(0))]
    #[case(2, Err(2))]
    #[case(-2, Err(-2))]
    fn direction_from_i64(#[case] input: i64, #[case] expected: Result<Direction, i64>) {
        assert_eq!(Direction::try_from(input), expected);
    }

    #[test]
    fn key_pattern_prefix() {
        let full = KeyPattern::new()
            .with("earliestGet", Direction::Ascending)
            .with("priority", Direction::Ascending)
            .with("created", Direction::Ascending);
        let prefix = KeyPattern::new().with("earliestGet", Direction::Ascending);
        let wrong_direction = KeyPattern::new().with("earliestGet", Direction::Descending);
        let not_leading = KeyPattern::new().with("priority", Direction::Ascending);

        assert!(full.starts_with(&prefix));
        assert!(full.starts_with(&full));
        assert!(full.starts_with(&KeyPattern::new()));
        assert!(!full.starts_with(&wrong_direction));
        assert!(!full.starts_with(&not_leading));
        assert!(!prefix.starts_with(&full));
    }

    #[test]
    fn key_pattern_display() {
        let keys = KeyPattern::new()
            .with("earliestGet", Direction::Ascending)
            .with("payload.type", Direction::Descending);
        assert_eq!(keys.to_string(), "{earliestGet: 1, payload.type: -1}");
    }

    #[test]
    fn collision_errors_are_classified() {
        assert!(
            StoreError::IndexNameTooLong {
                name: "x".into(),
                max: 0
            }
            .is_index_collision()
        );
        assert!(
            StoreError::IndexConflict {
                name: "x".into(),
                reason: "r".into()
            }
            .is_index_collision()
        );
        assert!(!StoreError::Backend("down".into()).is_index_collision());
        assert!(!StoreError::DuplicateKey("id".into()).is_index_collision());
    }
}
