//! Append-only per-record history.
//!
//! Layout: `<root>/<id>/<timestamp>_<action>.memh`, one codec blob per entry.
//! The timestamp is zero padded microseconds and strictly increasing within
//! a directory, so sorting file names recovers insertion order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::codec;
use crate::error::{MemError, Result};
use crate::model::{HistoryAction, HistoryEntry, Record};
use crate::table::validate_id;

const ENTRY_EXT: &str = "memh";

#[derive(Debug)]
pub struct HistoryLog {
    dir: PathBuf,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn entry_name(timestamp: u64, action: HistoryAction) -> String {
    format!("{:020}_{}.{}", timestamp, action, ENTRY_EXT)
}

fn parse_entry_name(name: &str) -> Option<(u64, HistoryAction)> {
    let stem = name.strip_suffix(ENTRY_EXT)?.strip_suffix('.')?;
    let (timestamp, action) = stem.split_once('_')?;
    Some((timestamp.parse().ok()?, action.parse().ok()?))
}

impl HistoryLog {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn record_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Best effort: a failed write is logged and never reaches the caller,
    /// so it cannot undo the mutation that triggered it.
    pub fn append(&self, record: &Record, action: HistoryAction) {
        if let Err(e) = self.try_append(record, action) {
            warn!(record_id = %record.id, action = %action, error = %e, "history write failed");
        }
    }

    /// Writes one entry and returns its timestamp.
    pub fn try_append(&self, record: &Record, action: HistoryAction) -> Result<u64> {
        validate_id(&record.id)?;
        let dir = self.record_dir(&record.id);
        fs::create_dir_all(&dir)?;

        let latest = self.entry_names(&dir)?.last().map(|(ts, _, _)| *ts);
        let now = now_micros();
        let timestamp = match latest {
            Some(last) if last >= now => last + 1,
            _ => now,
        };

        codec::write_record(&dir.join(entry_name(timestamp, action)), record)?;
        debug!(record_id = %record.id, action = %action, timestamp, "history entry written");
        Ok(timestamp)
    }

    /// Sorted (timestamp, action, file name) of every entry in `dir`.
    fn entry_names(&self, dir: &Path) -> Result<Vec<(u64, HistoryAction, String)>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some((ts, action)) = parse_entry_name(&name) {
                names.push((ts, action, name));
            }
        }
        names.sort_by(|a, b| a.2.cmp(&b.2));
        Ok(names)
    }

    /// Oldest first. `NotFound` when the id never had any history.
    pub fn list(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        validate_id(id).map_err(|_| MemError::NotFound(id.to_string()))?;
        let dir = self.record_dir(id);
        let names = match self.entry_names(&dir) {
            Ok(names) => names,
            Err(MemError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MemError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut entries = Vec::with_capacity(names.len());
        for (timestamp, action, name) in names {
            match codec::read_record(&dir.join(&name)) {
                Ok(record) => entries.push(HistoryEntry {
                    record_id: id.to_string(),
                    timestamp,
                    action,
                    record,
                }),
                Err(e) => warn!(record_id = %id, entry = %name, error = %e, "skipping unreadable history entry"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordBuilder;
    use tempfile::TempDir;

    #[test]
    fn entry_names_sort_and_parse() {
        let name = entry_name(42, HistoryAction::Update);
        assert_eq!(name, "00000000000000000042_update.memh");
        assert_eq!(parse_entry_name(&name), Some((42, HistoryAction::Update)));
        assert_eq!(parse_entry_name("junk.memh"), None);
        assert_eq!(parse_entry_name("00000000000000000042_update.tmp"), None);
        assert!(entry_name(9, HistoryAction::Update) < entry_name(10, HistoryAction::Create));
    }

    #[test]
    fn entries_come_back_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(dir.path()).unwrap();
        let record = RecordBuilder::new().content("v1").build().unwrap();

        log.append(&record, HistoryAction::Create);
        let mut changed = record.clone();
        changed.content = "v2".into();
        log.append(&changed, HistoryAction::Update);
        log.append(&changed, HistoryAction::Delete);

        let entries = log.list(&record.id).unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, [HistoryAction::Create, HistoryAction::Update, HistoryAction::Delete]);
        assert_eq!(entries[0].record.content, "v1");
        assert_eq!(entries[1].record.content, "v2");
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(dir.path()).unwrap();
        assert!(matches!(log.list("nobody"), Err(MemError::NotFound(_))));
        assert!(matches!(log.list("../etc"), Err(MemError::NotFound(_))));
    }

    #[test]
    fn append_swallows_failures() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(dir.path()).unwrap();
        let mut record = RecordBuilder::new().content("x").build().unwrap();
        record.id = "bad/id".into();

        log.append(&record, HistoryAction::Create);
        assert!(log.try_append(&record, HistoryAction::Create).is_err());
    }

    #[test]
    fn corrupt_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(dir.path()).unwrap();
        let record = RecordBuilder::new().content("x").build().unwrap();
        log.append(&record, HistoryAction::Create);
        fs::write(
            dir.path().join(&record.id).join(entry_name(1, HistoryAction::Update)),
            b"garbage",
        )
        .unwrap();

        let entries = log.list(&record.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, HistoryAction::Create);
    }
}
