//! MemQL evaluation over a `MemCore`.
//!
//! Mutating statements go through the facade so that history and the
//! vector index stay in step with the record table.

use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use serde::Serialize;
use tracing::debug;

use crate::error::{MemError, Result};
use crate::model::{Record, RecordBuilder, RecordPatch};
use crate::parser::{
    Assignment, DeleteTarget, OrderBy, Predicate, SelectQuery, SortKey, Statement, VectorClause,
};
use crate::vector::cosine_similarity;
use crate::MemCore;

/// One row of a MemQL result. `similarity_score` is only set by `VECTOR`
/// queries.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MemoryHit {
    #[serde(flatten)]
    pub record: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
}

impl MemoryHit {
    fn plain(record: Record) -> Self {
        Self { record, similarity_score: None }
    }
}

pub struct QueryEngine<'a> {
    core: &'a MemCore,
}

impl<'a> QueryEngine<'a> {
    pub fn new(core: &'a MemCore) -> Self {
        Self { core }
    }

    pub fn execute(&self, statement: &Statement) -> Result<Vec<MemoryHit>> {
        let hits = match statement {
            Statement::Create(assignments) => self.create(assignments),
            Statement::Select(query) => self.select(query),
            Statement::Update { assignments, filter } => self.update(assignments, filter.as_ref()),
            Statement::Delete(target) => self.delete(target),
        }?;
        debug!(rows = hits.len(), "MemQL statement evaluated");
        Ok(hits)
    }

    fn select(&self, query: &SelectQuery) -> Result<Vec<MemoryHit>> {
        let mut hits = match &query.vector {
            Some(clause) => self.similar(clause)?,
            None => self.filtered(query.filter.as_ref())?,
        };

        // Similarity queries rank best first unless told otherwise.
        let order = query.order.or_else(|| {
            query.vector.as_ref().map(|_| OrderBy { key: SortKey::SimilarityScore, descending: true })
        });
        if let Some(order) = order {
            sort_hits(&mut hits, order);
        }
        if query.limit > 0 {
            hits.truncate(query.limit);
        }
        Ok(hits)
    }

    /// Every record accepted by `filter`, decrypted for display. Predicates
    /// on sealed fields are tested after decryption.
    fn filtered(&self, filter: Option<&Predicate>) -> Result<Vec<MemoryHit>> {
        self.core.table().scan_map(|stored| {
            if let Some(p) = filter.filter(|p| !p.needs_plaintext()) {
                if !p.matches(&stored) {
                    return Ok(None);
                }
            }
            let record = self.core.reveal(stored);
            if let Some(p) = filter.filter(|p| p.needs_plaintext()) {
                if !p.matches(&record) {
                    return Ok(None);
                }
            }
            Ok(Some(MemoryHit::plain(record)))
        })
    }

    fn similar(&self, clause: &VectorClause) -> Result<Vec<MemoryHit>> {
        let embedder = self.core.embedder().ok_or(MemError::EmbeddingUnavailable)?;
        let query = embedder.embed(&clause.text)?;

        self.core.table().scan_map(|stored| {
            let Some(embedding) = stored.embedding.as_deref().filter(|e| !e.is_empty()) else {
                return Ok(None);
            };
            let score = cosine_similarity(&query, embedding)?;
            if score <= clause.threshold {
                return Ok(None);
            }
            Ok(Some(MemoryHit { record: self.core.reveal(stored), similarity_score: Some(score) }))
        })
    }

    fn create(&self, assignments: &[Assignment]) -> Result<Vec<MemoryHit>> {
        let mut builder = RecordBuilder::new();
        let mut encrypted = false;
        for assignment in assignments {
            builder = match assignment {
                Assignment::Content(content) => builder.content(content.as_str()),
                Assignment::Tags(tags) => builder.tags(tags.iter().cloned()),
                Assignment::Importance(importance) => builder.importance(*importance),
                Assignment::Source(source) => builder.source(source.as_str()),
                Assignment::Encrypted(flag) => {
                    encrypted = *flag;
                    builder
                }
            };
        }

        let id = self.core.add_memory(builder.build()?, encrypted)?;
        let record = self.core.get_memory(&id)?.ok_or(MemError::NotFound(id))?;
        Ok(vec![MemoryHit::plain(record)])
    }

    /// Patches every record `filter` accepts. Unlike SELECT there is no
    /// default row limit.
    fn update(&self, assignments: &[Assignment], filter: Option<&Predicate>) -> Result<Vec<MemoryHit>> {
        let patch = patch_from(assignments);
        let targets = self.filtered(filter)?;

        let mut updated = Vec::with_capacity(targets.len());
        for target in targets {
            let id = target.record.id;
            if self.core.update_memory(&id, patch.clone())? {
                if let Some(record) = self.core.get_memory(&id)? {
                    updated.push(MemoryHit::plain(record));
                }
            }
        }
        Ok(updated)
    }

    /// Like UPDATE, not capped by the SELECT default limit.
    fn delete(&self, target: &DeleteTarget) -> Result<Vec<MemoryHit>> {
        let filter = match target {
            DeleteTarget::All => None,
            DeleteTarget::Where(predicate) => Some(predicate),
        };
        let targets = self.filtered(filter)?;

        let mut deleted = Vec::with_capacity(targets.len());
        for snapshot in targets {
            if self.core.delete_memory(&snapshot.record.id)? {
                deleted.push(snapshot);
            }
        }
        Ok(deleted)
    }
}

fn patch_from(assignments: &[Assignment]) -> RecordPatch {
    assignments.iter().fold(RecordPatch::new(), |patch, assignment| match assignment {
        Assignment::Content(content) => patch.with_content(content.as_str()),
        Assignment::Tags(tags) => patch.with_tags(tags.iter().cloned()),
        Assignment::Importance(importance) => patch.with_importance(*importance),
        Assignment::Source(source) => patch.with_source(source.as_str()),
        // rejected by the parser for UPDATE
        Assignment::Encrypted(_) => patch,
    })
}

fn sort_hits(hits: &mut [MemoryHit], order: OrderBy) {
    hits.sort_by(|a, b| {
        let ordering = compare_by(a, b, order.key);
        if order.descending { ordering.reverse() } else { ordering }
    });
}

fn compare_by(a: &MemoryHit, b: &MemoryHit, key: SortKey) -> Ordering {
    let (ra, rb) = (&a.record, &b.record);
    match key {
        SortKey::Importance => OrderedFloat(ra.importance).cmp(&OrderedFloat(rb.importance)),
        SortKey::CreatedAt => OrderedFloat(ra.created_at).cmp(&OrderedFloat(rb.created_at)),
        SortKey::UpdatedAt => OrderedFloat(ra.updated_at).cmp(&OrderedFloat(rb.updated_at)),
        SortKey::SimilarityScore => a.similarity_score.map(OrderedFloat).cmp(&b.similarity_score.map(OrderedFloat)),
        SortKey::Id => ra.id.cmp(&rb.id),
        SortKey::Content => ra.content.cmp(&rb.content),
        SortKey::Source => ra.source.cmp(&rb.source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemCoreConfig;
    use crate::parser::DEFAULT_LIMIT;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> MemCore {
        MemCore::open(MemCoreConfig::new(dir.path())).unwrap()
    }

    fn seed(core: &MemCore, content: &str, importance: f32) -> String {
        let record = RecordBuilder::new().content(content).importance(importance).build().unwrap();
        core.add_memory(record, false).unwrap()
    }

    fn importances(hits: &[MemoryHit]) -> Vec<f32> {
        hits.iter().map(|h| h.record.importance).collect()
    }

    #[test]
    fn where_filter_and_order() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        seed(&core, "low", 0.5);
        seed(&core, "mid", 0.8);
        seed(&core, "high", 0.9);

        let hits = core.memql_query("SELECT WHERE importance >= 0.8").unwrap();
        let mut found = importances(&hits);
        found.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(found, [0.9, 0.8]);

        let hits = core.memql_query("SELECT WHERE importance >= 0.8 ORDER BY importance DESC").unwrap();
        assert_eq!(importances(&hits), [0.9, 0.8]);
        assert!(hits.iter().all(|h| h.similarity_score.is_none()));
    }

    #[test]
    fn limit_caps_results() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        for i in 0..5 {
            seed(&core, &format!("note {}", i), 0.1 * i as f32);
        }
        let hits = core.memql_query("SELECT ORDER BY importance ASC LIMIT 2").unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].record.importance <= hits[1].record.importance);
    }

    #[test]
    fn create_returns_the_new_record() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        let hits = core
            .memql_query(r#"CREATE MEM (content="remember the milk", tags="errand home", importance=0.7)"#)
            .unwrap();
        assert_eq!(hits.len(), 1);
        let record = &hits[0].record;
        assert_eq!(record.content, "remember the milk");
        assert_eq!(record.tags(), ["errand", "home"]);
        assert_eq!(record.importance, 0.7);
        assert!(core.get_memory(&record.id).unwrap().is_some());
    }

    #[test]
    fn update_returns_post_update_records() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        let id = seed(&core, "draft", 0.2);
        seed(&core, "other", 0.3);

        let hits = core
            .memql_query(&format!(r#"UPDATE SET content="final", importance=0.9 WHERE id="{}""#, id))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.content, "final");
        assert_eq!(hits[0].record.importance, 0.9);

        let untouched = core.memql_query("SELECT WHERE content = other").unwrap();
        assert_eq!(untouched[0].record.importance, 0.3);
    }

    #[test]
    fn delete_all_then_select_is_empty() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        for i in 0..60 {
            seed(&core, &format!("bulk {}", i), 0.5);
        }

        let deleted = core.memql_query("DELETE *").unwrap();
        assert_eq!(deleted.len(), 60);
        assert!(deleted.iter().all(|h| h.record.content.starts_with("bulk")));
        assert!(core.memql_query("SELECT").unwrap().is_empty());
    }

    #[test]
    fn delete_where_only_removes_matches() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        seed(&core, "keep me", 0.9);
        seed(&core, "drop me", 0.1);

        let deleted = core.memql_query("DELETE WHERE importance < 0.5").unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].record.content, "drop me");
        assert_eq!(core.memql_query("SELECT").unwrap().len(), 1);
    }

    #[test]
    fn text_predicates_see_decrypted_values() {
        let dir = TempDir::new().unwrap();
        let core = MemCore::open(MemCoreConfig::new(dir.path()).with_encryption_key("k")).unwrap();
        core.memql_query(r#"CREATE MEM (content="launch codes", tags="secret", encrypted=true)"#)
            .unwrap();

        let hits = core.memql_query("SELECT WHERE tags = secret").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.content, "launch codes");
        assert!(hits[0].record.encrypted);
        assert_eq!(core.memql_query("SELECT WHERE encrypted = true").unwrap().len(), 1);
    }

    #[test]
    fn vector_query_needs_an_embedder() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        seed(&core, "anything", 0.5);
        assert!(matches!(
            core.memql_query(r#"SELECT VECTOR "anything""#),
            Err(MemError::EmbeddingUnavailable)
        ));
    }

    #[test]
    fn vector_query_filters_by_threshold_and_ranks() {
        let dir = TempDir::new().unwrap();
        let embed = |text: &str| -> Vec<f32> {
            ["rust", "python", "cooking"]
                .iter()
                .map(|w| if text.contains(w) { 1.0 } else { 0.0 })
                .collect()
        };
        let core = open(&dir).with_embedder(embed);
        seed(&core, "rust", 0.5);
        seed(&core, "rust and python", 0.5);
        seed(&core, "cooking", 0.5);

        let hits = core.memql_query(r#"SELECT VECTOR "rust" SCORE 0.5"#).unwrap();
        let contents: Vec<_> = hits.iter().map(|h| h.record.content.as_str()).collect();
        assert_eq!(contents, ["rust", "rust and python"]);
        assert!((hits[0].similarity_score.unwrap() - 1.0).abs() < 1e-6);

        let hits = core.memql_query(r#"SELECT VECTOR "rust" SCORE 0.9"#).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn hits_serialize_flat() {
        let record = RecordBuilder::new().content("x").build().unwrap();
        let hit = MemoryHit { record, similarity_score: Some(0.5) };
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["content"], "x");
        assert_eq!(json["similarity_score"], 0.5);
    }

    #[test]
    fn update_and_delete_are_not_capped_by_the_select_limit() {
        let dir = TempDir::new().unwrap();
        let core = open(&dir);
        let rows = DEFAULT_LIMIT + 10;
        for i in 0..rows {
            seed(&core, &format!("row {}", i), 0.2);
        }

        assert_eq!(core.memql_query("SELECT").unwrap().len(), DEFAULT_LIMIT);
        let updated = core.memql_query("UPDATE SET importance=0.8 WHERE importance < 0.5").unwrap();
        assert_eq!(updated.len(), rows);
        assert!(updated.iter().all(|hit| hit.record.importance == 0.8));

        assert_eq!(core.memql_query("DELETE *").unwrap().len(), rows);
        assert!(core.is_empty());
    }
}
