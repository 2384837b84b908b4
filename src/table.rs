//! Durable record table: an id -> summary index mirrored to `index.json`
//! plus one `<id>.mem` unit per record holding the codec blob.
//!
//! The unit is always the source of truth. The index only answers
//! existence and listing questions.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::crypto::FieldCipher;
use crate::error::{MemError, Result};
use crate::model::{clamp_importance, now_secs, FieldValue, Record, RecordPatch};

const INDEX_FILE: &str = "index.json";
const UNIT_EXT: &str = "mem";
const MAX_ID_LEN: usize = 128;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub created_at: f64,
    pub updated_at: f64,
    pub importance: f32,
    pub encrypted: bool,
    pub has_embedding: bool,
}

impl From<&Record> for RecordSummary {
    fn from(record: &Record) -> Self {
        Self {
            created_at: record.created_at,
            updated_at: record.updated_at,
            importance: record.importance,
            encrypted: record.encrypted,
            has_embedding: record.has_embedding(),
        }
    }
}

/// Ids double as file names.
pub fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MemError::Validation(format!("invalid record id '{}'", id)))
    }
}

#[derive(Debug)]
pub struct RecordTable {
    dir: PathBuf,
    index: RwLock<BTreeMap<String, RecordSummary>>,
    // Serialises every read-modify-write of the index and the units.
    write_lock: Mutex<()>,
}

impl RecordTable {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let table = Self {
            dir: dir.to_path_buf(),
            index: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        };

        let index = match table.load_index() {
            Ok(Some(index)) => index,
            Ok(None) => table.rebuild_index()?,
            Err(e) => {
                warn!(error = %e, "record index unreadable, rebuilding from units");
                table.rebuild_index()?
            }
        };
        info!(path = %dir.display(), records = index.len(), "Record table opened");

        *table.index.write().map_err(|_| MemError::Poisoned("record index"))? = index;
        Ok(table)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn unit_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, UNIT_EXT))
    }

    fn load_index(&self) -> Result<Option<BTreeMap<String, RecordSummary>>> {
        match fs::read(self.index_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rebuild_index(&self) -> Result<BTreeMap<String, RecordSummary>> {
        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
                continue;
            }
            match codec::read_record(&path) {
                Ok(record) => {
                    index.insert(record.id.clone(), RecordSummary::from(&record));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable unit"),
            }
        }
        if !index.is_empty() {
            info!(records = index.len(), "Rebuilt record index from units");
        }
        self.save_index(&index)?;
        Ok(index)
    }

    fn save_index(&self, index: &BTreeMap<String, RecordSummary>) -> Result<()> {
        codec::write_atomic(&self.index_path(), &serde_json::to_vec_pretty(index)?)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.read().map(|idx| idx.contains_key(id)).unwrap_or(false)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        let idx = self.index.read().map_err(|_| MemError::Poisoned("record index"))?;
        Ok(idx.keys().cloned().collect())
    }

    pub fn summary(&self, id: &str) -> Option<RecordSummary> {
        self.index.read().ok()?.get(id).cloned()
    }

    /// Persists a new record and returns it in its stored form. When
    /// `encrypted` is set the text fields are sealed with `cipher` first.
    pub fn add(&self, mut record: Record, encrypted: bool, cipher: Option<&FieldCipher>) -> Result<Record> {
        validate_id(&record.id)?;
        record.importance = clamp_importance(record.importance);
        if record.updated_at < record.created_at {
            record.updated_at = record.created_at;
        }
        if encrypted {
            let cipher = cipher.ok_or_else(|| {
                MemError::Validation("encryption requested but no key is configured".into())
            })?;
            cipher.seal_record(&mut record)?;
        }

        let _guard = self.write_lock.lock().map_err(|_| MemError::Poisoned("record table"))?;
        if self.contains(&record.id) {
            return Err(MemError::Validation(format!("duplicate record id '{}'", record.id)));
        }
        let unit = self.unit_path(&record.id);
        codec::write_record(&unit, &record)?;

        let mut idx = self.index.write().map_err(|_| MemError::Poisoned("record index"))?;
        idx.insert(record.id.clone(), RecordSummary::from(&record));
        if let Err(e) = self.save_index(&idx) {
            idx.remove(&record.id);
            if let Err(cleanup) = fs::remove_file(&unit) {
                warn!(record_id = %record.id, error = %cleanup, "orphaned unit left after failed add");
            }
            return Err(e);
        }
        debug!(record_id = %record.id, encrypted = record.encrypted, "Record added");
        Ok(record)
    }

    /// Re-reads the unit. `None` when the id is unknown.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        if !self.contains(id) {
            return Ok(None);
        }
        match codec::read_record(&self.unit_path(id)) {
            Ok(record) => Ok(Some(record)),
            Err(MemError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!(record_id = %id, "indexed record has no unit on disk");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Applies `patch`, refreshes `updated_at` and re-seals changed fields of
    /// encrypted records. Returns the stored form after the update.
    pub fn update(&self, id: &str, patch: &RecordPatch, cipher: Option<&FieldCipher>) -> Result<Record> {
        let _guard = self.write_lock.lock().map_err(|_| MemError::Poisoned("record table"))?;
        let previous = self.get(id)?.ok_or_else(|| MemError::NotFound(id.to_string()))?;
        let mut record = previous.clone();

        apply_patch(&mut record, patch, cipher)?;
        let now = now_secs();
        record.updated_at = if now > record.updated_at {
            now
        } else {
            record.updated_at + 1e-6
        };

        let unit = self.unit_path(id);
        codec::write_record(&unit, &record)?;
        let mut idx = self.index.write().map_err(|_| MemError::Poisoned("record index"))?;
        idx.insert(id.to_string(), RecordSummary::from(&record));
        if let Err(e) = self.save_index(&idx) {
            idx.insert(id.to_string(), RecordSummary::from(&previous));
            if let Err(restore) = codec::write_record(&unit, &previous) {
                warn!(record_id = %id, error = %restore, "unit not restored after failed update");
            }
            return Err(e);
        }
        debug!(record_id = %id, "Record updated");
        Ok(record)
    }

    /// Removes the record and returns its last stored form.
    pub fn delete(&self, id: &str) -> Result<Record> {
        let _guard = self.write_lock.lock().map_err(|_| MemError::Poisoned("record table"))?;
        let record = self.get(id)?.ok_or_else(|| MemError::NotFound(id.to_string()))?;

        {
            let mut idx = self.index.write().map_err(|_| MemError::Poisoned("record index"))?;
            let summary = idx.remove(id);
            if let Err(e) = self.save_index(&idx) {
                if let Some(summary) = summary {
                    idx.insert(id.to_string(), summary);
                }
                return Err(e);
            }
        }
        match fs::remove_file(self.unit_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(record_id = %id, "Record deleted");
        Ok(record)
    }

    /// Unordered full pass returning every stored record `predicate` accepts.
    pub fn scan<P>(&self, mut predicate: P) -> Vec<Record>
    where
        P: FnMut(&Record) -> bool,
    {
        self.scan_map(|record| Ok(predicate(&record).then_some(record)))
            .unwrap_or_default()
    }

    /// Full pass that maps each record through `f`. Unreadable units are
    /// logged and skipped; errors returned by `f` abort the pass.
    pub fn scan_map<T, F>(&self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(Record) -> Result<Option<T>>,
    {
        let mut out = Vec::new();
        for id in self.ids()? {
            let record = match codec::read_record(&self.unit_path(&id)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(record_id = %id, error = %e, "skipping unreadable record during scan");
                    continue;
                }
            };
            if let Some(item) = f(record)? {
                out.push(item);
            }
        }
        Ok(out)
    }
}

fn apply_patch(record: &mut Record, patch: &RecordPatch, cipher: Option<&FieldCipher>) -> Result<()> {
    let encrypted = record.encrypted;
    let seal = |value: FieldValue| -> Result<FieldValue> {
        if !encrypted {
            return Ok(value);
        }
        let cipher = cipher.ok_or_else(|| {
            MemError::Validation("record is stored encrypted but no key is configured".into())
        })?;
        cipher.encrypt_field(&value)
    };

    if let Some(content) = &patch.content {
        record.content = seal(content.clone().into())?.into_text().unwrap_or_default();
    }
    if let Some(source) = &patch.source {
        record.source = seal(source.clone().into())?.into_text().unwrap_or_default();
    }
    if let Some(tags) = &patch.tags {
        record.tags = seal(tags.clone().into())?.into_list();
    }
    if let Some(metadata) = &patch.metadata {
        record.metadata = seal(metadata.clone().into())?.into_map();
    }
    if let Some(importance) = patch.importance {
        record.importance = clamp_importance(importance);
    }
    if let Some(embedding) = &patch.embedding {
        record.embedding = Some(embedding.clone());
    }
    Ok(())
}
