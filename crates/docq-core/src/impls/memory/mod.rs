//! In-memory collection.
//!
//! A single async mutex serialises every operation, which gives each call the
//! single-document atomicity the queue protocol relies on. Documents keep
//! insertion ("natural") order, which is the final tie-break of every sort.

mod matcher;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;
use ulid::Ulid;

use crate::ports::{
    Collection, Direction, Document, FindOneAndUpdateOptions, IndexModel, KeyPattern,
    ReturnDocument, StoreError, Update, UpdateResult,
};

use self::matcher::{compare_documents, matches, set_path, upsert_seed};

const ID: &str = "_id";

/// Default maximum index name length, in bytes.
pub const DEFAULT_MAX_INDEX_NAME_LEN: usize = 127;

struct MemoryState {
    /// Natural order: sequence number -> document.
    docs: BTreeMap<u64, Document>,

    /// `_id` -> sequence number.
    ids: HashMap<String, u64>,

    next_seq: u64,

    indexes: Vec<IndexModel>,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            docs: BTreeMap::new(),
            ids: HashMap::new(),
            next_seq: 0,
            indexes: vec![IndexModel::new(
                "_id_",
                KeyPattern::new().with(ID, Direction::Ascending),
            )],
        }
    }

    /// First matching document in sort order, natural order breaking ties.
    fn find_first(&self, filter: &Document, sort: &KeyPattern) -> Result<Option<u64>, StoreError> {
        let mut best: Option<(u64, &Document)> = None;
        for (&seq, doc) in &self.docs {
            if !matches(doc, filter)? {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, current)) => compare_documents(doc, current, sort).is_lt(),
            };
            if better {
                best = Some((seq, doc));
            }
        }
        Ok(best.map(|(seq, _)| seq))
    }

    fn insert(&mut self, mut doc: Document) -> Result<Document, StoreError> {
        let id = doc
            .entry(ID.to_string())
            .or_insert_with(|| Value::String(Ulid::new().to_string()));
        let key = id_key(id);
        if self.ids.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(key, seq);
        self.docs.insert(seq, doc.clone());
        Ok(doc)
    }

    /// Apply `update` to the document at `seq`. Returns (before, after).
    fn update_at(&mut self, seq: u64, update: &Update) -> Result<(Document, Document), StoreError> {
        let Some(current) = self.docs.get(&seq) else {
            return Err(StoreError::Backend(format!("document {seq} vanished")));
        };
        let before = current.clone();
        let mut after = current.clone();
        apply_set(&mut after, &update.set)?;
        if after.get(ID) != before.get(ID) {
            return Err(StoreError::InvalidQuery("_id is immutable".to_string()));
        }
        self.docs.insert(seq, after.clone());
        Ok((before, after))
    }

    fn upsert(&mut self, filter: &Document, update: &Update) -> Result<Document, StoreError> {
        let mut doc = upsert_seed(filter)?;
        apply_set(&mut doc, &update.set)?;
        apply_set(&mut doc, &update.set_on_insert)?;
        self.insert(doc)
    }
}

fn apply_set(doc: &mut Document, set: &Document) -> Result<(), StoreError> {
    for (path, value) in set {
        set_path(doc, path, value.clone())?;
    }
    Ok(())
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// In-memory [`Collection`], used by tests and the demo binary.
pub struct MemoryCollection {
    state: Mutex<MemoryState>,
    max_index_name_len: usize,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::with_max_index_name_len(DEFAULT_MAX_INDEX_NAME_LEN)
    }

    /// Index names longer than `max` are rejected with
    /// [`StoreError::IndexNameTooLong`].
    pub fn with_max_index_name_len(max: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
            max_index_name_len: max,
        }
    }

    /// Snapshot of every stored document in natural order.
    pub async fn documents(&self) -> Vec<Document> {
        let state = self.state.lock().await;
        state.docs.values().cloned().collect()
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn insert_one(&self, doc: Document) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.insert(doc)?;
        Ok(())
    }

    async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, StoreError> {
        let mut state = self.state.lock().await;
        match state.find_first(filter, &options.sort)? {
            Some(seq) => {
                let (before, after) = state.update_at(seq, update)?;
                Ok(Some(match options.return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => after,
                }))
            }
            None if options.upsert => {
                let inserted = state.upsert(filter, update)?;
                Ok(match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(inserted),
                })
            }
            None => Ok(None),
        }
    }

    async fn update_one(
        &self,
        filter: &Document,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError> {
        let mut state = self.state.lock().await;
        match state.find_first(filter, &KeyPattern::new())? {
            Some(seq) => {
                let (before, after) = state.update_at(seq, update)?;
                Ok(UpdateResult {
                    matched: 1,
                    modified: u64::from(before != after),
                    upserted: false,
                })
            }
            None if upsert => {
                state.upsert(filter, update)?;
                Ok(UpdateResult {
                    matched: 0,
                    modified: 0,
                    upserted: true,
                })
            }
            None => Ok(UpdateResult::default()),
        }
    }

    async fn delete_one(&self, filter: &Document) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let Some(seq) = state.find_first(filter, &KeyPattern::new())? else {
            return Ok(0);
        };
        if let Some(doc) = state.docs.remove(&seq) {
            if let Some(id) = doc.get(ID) {
                state.ids.remove(&id_key(id));
            }
        }
        Ok(1)
    }

    async fn count_documents(&self, filter: &Document) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        let mut count = 0;
        for doc in state.docs.values() {
            if matches(doc, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_indexes(&self) -> Result<Vec<IndexModel>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.indexes.clone())
    }

    async fn create_index(&self, index: IndexModel) -> Result<(), StoreError> {
        if index.name.len() > self.max_index_name_len {
            return Err(StoreError::IndexNameTooLong {
                name: index.name,
                max: self.max_index_name_len,
            });
        }
        if index.name.is_empty() || index.keys.is_empty() {
            return Err(StoreError::InvalidQuery(
                "index needs a name and at least one key".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        for existing in &state.indexes {
            if existing.name == index.name {
                if existing.keys == index.keys {
                    return Ok(());
                }
                return Err(StoreError::IndexConflict {
                    name: index.name,
                    reason: format!("name already used by {}", existing.keys),
                });
            }
            if existing.keys == index.keys {
                return Err(StoreError::IndexConflict {
                    name: index.name,
                    reason: format!("same keys already indexed as {:?}", existing.name),
                });
            }
        }
        trace!(name = %index.name, keys = %index.keys, "created index");
        state.indexes.push(index);
        Ok(())
    }
}
