pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod history;
pub mod model;
pub mod parser;
pub mod query;
pub mod table;
pub mod vector;

use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::FieldCipher;
use crate::history::HistoryLog;
use crate::query::QueryEngine;
use crate::table::RecordTable;
use crate::vector::{RandomProjection, VectorIndex, VectorMetadata};

pub use crate::config::MemCoreConfig;
pub use crate::error::{MemError, Result};
pub use crate::model::{
    Embedder, HistoryAction, HistoryEntry, Metadata, Record, RecordBuilder, RecordPatch,
};
pub use crate::query::MemoryHit;

const TABLE_DIR: &str = ".memtable";
const HISTORY_DIR: &str = ".memhistory";
const VECTOR_DIR: &str = ".memvectors";

/// Result of a batch call. Items are applied one by one in input order and a
/// failing item does not stop the ones after it.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub applied: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Position of the item in the input.
    pub position: usize,
    pub id: String,
    pub reason: String,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.applied.len()
    }

    fn fail(&mut self, position: usize, id: &str, reason: impl fmt::Display) {
        warn!(record_id = %id, position, reason = %reason, "batch item skipped");
        self.failed.push(BatchFailure { position, id: id.to_string(), reason: reason.to_string() });
    }
}

/// Handle on one memory folder. Everything outside the crate goes through
/// these methods.
pub struct MemCore {
    config: MemCoreConfig,
    table: RecordTable,
    history: HistoryLog,
    vectors: VectorIndex,
    cipher: Option<FieldCipher>,
    embedder: Option<Arc<dyn Embedder>>,
    write_lock: Mutex<()>,
}

impl fmt::Debug for MemCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemCore")
            .field("root", &self.config.root)
            .field("records", &self.table.len())
            .field("vectors", &self.vectors.len())
            .field("encryption", &self.cipher.is_some())
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

impl MemCore {
    pub fn open(config: MemCoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        let table = RecordTable::open(&config.root.join(TABLE_DIR))?;
        let history = HistoryLog::open(&config.root.join(HISTORY_DIR))?;
        let vectors = VectorIndex::open(&config.root.join(VECTOR_DIR))?;
        let cipher = config.encryption_key.as_deref().map(FieldCipher::derive);

        info!(
            root = %config.root.display(),
            records = table.len(),
            vectors = vectors.len(),
            encryption = cipher.is_some(),
            "Memory folder opened"
        );

        Ok(Self {
            config,
            table,
            history,
            vectors,
            cipher,
            embedder: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Installs the text embedding function used for missing embeddings and
    /// for similarity queries.
    pub fn with_embedder<E>(mut self, embedder: E) -> Self
    where
        E: Embedder + 'static,
    {
        self.embedder = Some(Arc::new(embedder));
        self
    }

    pub fn config(&self) -> &MemCoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub(crate) fn table(&self) -> &RecordTable {
        &self.table
    }

    pub(crate) fn embedder(&self) -> Option<&dyn Embedder> {
        self.embedder.as_deref()
    }

    /// Display form of a stored record. Decryption is fail-soft and the
    /// `encrypted` flag keeps describing the stored form.
    pub(crate) fn reveal(&self, record: Record) -> Record {
        self.decrypt_stored(record).0
    }

    /// Decrypted copy of `record` and whether it is now fully plaintext. A
    /// record that does not decrypt is returned as stored.
    fn decrypt_stored(&self, mut record: Record) -> (Record, bool) {
        if !record.encrypted {
            return (record, true);
        }
        let Some(cipher) = &self.cipher else {
            return (record, false);
        };
        match cipher.try_open_record(&mut record) {
            Ok(()) => (record, true),
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "record did not decrypt, keeping stored value");
                (record, false)
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| MemError::Poisoned("memcore"))
    }

    fn sync_vector(&self, stored: &Record) {
        let Some(vector) = stored.embedding.as_ref().filter(|v| !v.is_empty()) else {
            return;
        };
        let metadata = VectorMetadata {
            content: stored.content.clone(),
            tags: stored.tags().to_vec(),
            importance: stored.importance,
        };
        if let Err(e) = self.vectors.upsert(&stored.id, vector.clone(), metadata) {
            warn!(record_id = %stored.id, error = %e, "vector index update failed");
        }
    }

    // --- CRUD ---

    /// Stores a new record and returns its id. An empty id is replaced with
    /// a fresh one.
    pub fn add_memory(&self, mut record: Record, encrypted: bool) -> Result<String> {
        let _guard = self.lock()?;

        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        if record.created_at <= 0.0 {
            record.created_at = model::now_secs();
            record.updated_at = record.created_at;
        }
        if !record.has_embedding() && !record.content.is_empty() {
            if let Some(embedder) = &self.embedder {
                record.embedding = Some(embedder.embed(&record.content)?);
            }
        }
        if record.content.is_empty() && !record.has_embedding() {
            return Err(MemError::Validation("memory must have either content or embedding".into()));
        }

        let stored = self.table.add(record, encrypted, self.cipher.as_ref())?;
        self.history.append(&stored, HistoryAction::Create);
        self.sync_vector(&stored);
        debug!(record_id = %stored.id, encrypted = stored.encrypted, "Memory added");
        Ok(stored.id)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.table.get(id)?.map(|record| self.reveal(record)))
    }

    /// `Ok(false)` when no record has this id.
    pub fn update_memory(&self, id: &str, mut patch: RecordPatch) -> Result<bool> {
        let _guard = self.lock()?;
        if !self.table.contains(id) {
            return Ok(false);
        }

        if patch.embedding.is_none() {
            if let (Some(embedder), Some(content)) = (&self.embedder, &patch.content) {
                patch.embedding = Some(embedder.embed(content)?);
            }
        }

        let stored = match self.table.update(id, &patch, self.cipher.as_ref()) {
            Ok(stored) => stored,
            Err(MemError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.history.append(&stored, HistoryAction::Update);

        // The vector entry mirrors content, tags and importance.
        if patch.changes_content() || patch.embedding.is_some() || patch.tags.is_some() || patch.importance.is_some() {
            self.sync_vector(&stored);
        }
        debug!(record_id = %id, "Memory updated");
        Ok(true)
    }

    /// `Ok(false)` when no record has this id.
    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let snapshot = match self.table.delete(id) {
            Ok(snapshot) => snapshot,
            Err(MemError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.history.append(&snapshot, HistoryAction::Delete);
        if let Err(e) = self.vectors.remove(id) {
            warn!(record_id = %id, error = %e, "vector index removal failed");
        }
        debug!(record_id = %id, "Memory deleted");
        Ok(true)
    }

    /// Oldest first, decrypted for display.
    pub fn get_history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .history
            .list(id)?
            .into_iter()
            .map(|mut entry| {
                entry.record = self.reveal(entry.record);
                entry
            })
            .collect())
    }

    // --- QUERIES ---

    pub fn memql_query(&self, text: &str) -> Result<Vec<MemoryHit>> {
        let statement = parser::parse_statement(text)?;
        debug!(query = %text, "MemQL");
        QueryEngine::new(self).execute(&statement)
    }

    /// Top `top_k` records by cosine similarity to the embedding of `text`.
    pub fn vector_search_query(&self, text: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        let embedder = self.embedder.as_ref().ok_or(MemError::EmbeddingUnavailable)?;
        let query = embedder.embed(text)?;

        let hits = match self.config.projection_level {
            Some(level) => {
                let projection = RandomProjection::new(query.len(), level)?;
                self.vectors.search_projected(&query, top_k, &projection)?
            }
            None => self.vectors.search(&query, top_k)?,
        };

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.get_memory(&hit.id)? {
                Some(record) => results.push(MemoryHit { record, similarity_score: Some(hit.score) }),
                None => debug!(record_id = %hit.id, "vector hit has no record, skipping"),
            }
        }
        Ok(results)
    }

    // --- BULK ---

    /// Every record, decrypted where the configured key opens it. Only those
    /// records are marked as not encrypted; the rest keep their ciphertext
    /// and their flag so a later import stays readable with the right key.
    pub fn export_all(&self) -> Result<Vec<Record>> {
        self.table.scan_map(|stored| {
            let (mut record, plain) = self.decrypt_stored(stored);
            if plain {
                record.encrypted = false;
            }
            Ok(Some(record))
        })
    }

    /// Adds `records` in order and returns their ids. Stops at the first
    /// failure; records imported before it stay imported.
    pub fn import_all<I>(&self, records: I, encrypt: bool) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut ids = Vec::new();
        for record in records {
            ids.push(self.add_memory(record, encrypt)?);
        }
        info!(count = ids.len(), "Import finished");
        Ok(ids)
    }

    /// Adds every record, continuing past failures.
    pub fn batch_add<I>(&self, records: I, encrypt: bool) -> BatchOutcome
    where
        I: IntoIterator<Item = Record>,
    {
        let mut outcome = BatchOutcome::default();
        for (position, record) in records.into_iter().enumerate() {
            let id = record.id.clone();
            match self.add_memory(record, encrypt) {
                Ok(id) => outcome.applied.push(id),
                Err(e) => outcome.fail(position, &id, e),
            }
        }
        info!(applied = outcome.succeeded(), failed = outcome.failed.len(), "Batch add finished");
        outcome
    }

    /// Applies each `(id, patch)` pair. Unknown ids are reported as failures.
    pub fn batch_update<I>(&self, updates: I) -> BatchOutcome
    where
        I: IntoIterator<Item = (String, RecordPatch)>,
    {
        let mut outcome = BatchOutcome::default();
        for (position, (id, patch)) in updates.into_iter().enumerate() {
            match self.update_memory(&id, patch) {
                Ok(true) => outcome.applied.push(id),
                Ok(false) => outcome.fail(position, &id, MemError::NotFound(id.clone())),
                Err(e) => outcome.fail(position, &id, e),
            }
        }
        info!(applied = outcome.succeeded(), failed = outcome.failed.len(), "Batch update finished");
        outcome
    }

    pub fn batch_delete<I, S>(&self, ids: I) -> BatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = BatchOutcome::default();
        for (position, id) in ids.into_iter().enumerate() {
            let id = id.as_ref();
            match self.delete_memory(id) {
                Ok(true) => outcome.applied.push(id.to_string()),
                Ok(false) => outcome.fail(position, id, MemError::NotFound(id.to_string())),
                Err(e) => outcome.fail(position, id, e),
            }
        }
        info!(applied = outcome.succeeded(), failed = outcome.failed.len(), "Batch delete finished");
        outcome
    }

    /// Adds `tags` to each record, or removes them when `remove` is set.
    /// Existing tag order is kept and added tags go to the end.
    pub fn tag_batch<I, S>(&self, ids: I, tags: &[String], remove: bool) -> BatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut updates = Vec::new();
        let mut skipped = Vec::new();
        for (position, id) in ids.into_iter().enumerate() {
            let id = id.as_ref();
            let stored = match self.table.get(id) {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    skipped.push((position, id.to_string(), MemError::NotFound(id.to_string())));
                    continue;
                }
                Err(e) => {
                    skipped.push((position, id.to_string(), e));
                    continue;
                }
            };
            let (record, plain) = self.decrypt_stored(stored);
            if !plain {
                skipped.push((position, id.to_string(), MemError::EncryptionKeyMismatch));
                continue;
            }

            let mut current = record.tags().to_vec();
            if remove {
                current.retain(|t| !tags.contains(t));
            } else {
                for tag in tags {
                    if !current.contains(tag) {
                        current.push(tag.clone());
                    }
                }
            }
            updates.push((position, id.to_string(), RecordPatch::new().with_tags(current)));
        }

        let mut outcome = BatchOutcome::default();
        for (position, id, patch) in updates {
            match self.update_memory(&id, patch) {
                Ok(true) => outcome.applied.push(id),
                Ok(false) => outcome.fail(position, &id, MemError::NotFound(id.clone())),
                Err(e) => outcome.fail(position, &id, e),
            }
        }
        for (position, id, e) in skipped {
            outcome.fail(position, &id, e);
        }
        outcome.failed.sort_by_key(|f| f.position);
        outcome
    }

    pub fn update_importance_batch<I, S>(&self, ids: I, importance: f32) -> BatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.batch_update(
            ids.into_iter()
                .map(|id| (id.as_ref().to_string(), RecordPatch::new().with_importance(importance))),
        )
    }

    /// Rebuilds the vector index from the record table.
    pub fn reindex_vectors(&self) -> Result<usize> {
        let _guard = self.lock()?;
        self.vectors.clear()?;
        let records = self.table.scan(Record::has_embedding);
        for record in &records {
            self.sync_vector(record);
        }
        info!(count = records.len(), "Vector index rebuilt");
        Ok(self.vectors.len())
    }
}
