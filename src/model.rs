use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{MemError, Result};

pub const DEFAULT_IMPORTANCE: f32 = 0.5;

/// Metadata values are always strings. Anything else handed in from JSON is
/// stringified on the way in and comes back as a string.
pub type Metadata = BTreeMap<String, String>;

/// Seconds since the epoch with sub-second precision.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn clamp_importance(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Caller-supplied text embedding function. The store treats the returned
/// vector as opaque.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

impl<F> Embedder for F
where
    F: Fn(&str) -> Vec<f32> + Send + Sync,
{
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self(text))
    }
}

/// The atomic unit of the store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    /// Assigned once at creation. Empty ids are replaced on insert.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub content: String,

    /// `None` and `Some(vec![])` are distinct and both survive the codec.
    #[serde(default)]
    pub tags: Option<Vec<String>>,

    #[serde(default, deserialize_with = "stringify_metadata")]
    pub metadata: Option<Metadata>,

    /// Always within [0, 1] once written
    #[serde(default = "default_importance")]
    pub importance: f32,

    #[serde(default)]
    pub created_at: f64,

    #[serde(default)]
    pub updated_at: f64,

    /// Free-text provenance
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Whether content/tags/source/metadata are stored in encrypted form
    #[serde(default)]
    pub encrypted: bool,
}

fn default_importance() -> f32 {
    DEFAULT_IMPORTANCE
}

fn stringify_metadata<'de, D>(deserializer: D) -> std::result::Result<Option<Metadata>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|map| {
        map.into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()
    }))
}

impl Record {
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }

    /// True when the record can take part in similarity search.
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().map_or(false, |e| !e.is_empty())
    }
}

/// Builds new records. Ids and creation time are assigned by `build`.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    content: String,
    tags: Option<Vec<String>>,
    metadata: Option<Metadata>,
    importance: f32,
    source: String,
    embedding: Option<Vec<f32>>,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self {
            content: String::new(),
            tags: None,
            metadata: None,
            importance: DEFAULT_IMPORTANCE,
            source: String::new(),
            embedding: None,
        }
    }
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Comma separated tag list, e.g. `"rust, storage"`.
    pub fn tags_from_str(self, tags: &str) -> Self {
        self.tags(tags.split(',').map(str::trim).filter(|t| !t.is_empty()))
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Fills the embedding from the current content.
    pub fn embed_with(mut self, embedder: &dyn Embedder) -> Result<Self> {
        if !self.content.is_empty() {
            self.embedding = Some(embedder.embed(&self.content)?);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Record> {
        let has_embedding = self.embedding.as_ref().map_or(false, |e| !e.is_empty());
        if self.content.is_empty() && !has_embedding {
            return Err(MemError::Validation(
                "memory must have either content or embedding".into(),
            ));
        }
        let now = now_secs();
        Ok(Record {
            id: Uuid::new_v4().to_string(),
            content: self.content,
            tags: self.tags,
            metadata: self.metadata,
            importance: self.importance,
            created_at: now,
            updated_at: now,
            source: self.source,
            embedding: self.embedding,
            encrypted: false,
        })
    }
}

/// Field replacements for an update. Ids never change, so there is no `id`
/// field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
    pub importance: Option<f32>,
    pub source: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn changes_content(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Closed value type walked by the field encryption codec.
///
/// Scalars other than strings have no variant: they are stringified when
/// converted in (see `From<serde_json::Value>`), which is lossy.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Rewrites every text leaf, keeping the shape.
    pub fn map_text<F>(&self, f: &mut F) -> FieldValue
    where
        F: FnMut(&str) -> String,
    {
        match self {
            FieldValue::Text(s) => FieldValue::Text(f(s)),
            FieldValue::List(items) => FieldValue::List(items.iter().map(|v| v.map_text(f)).collect()),
            FieldValue::Map(map) => {
                FieldValue::Map(map.iter().map(|(k, v)| (k.clone(), v.map_text(f))).collect())
            }
        }
    }

    pub fn try_map_text<F>(&self, f: &mut F) -> Result<FieldValue>
    where
        F: FnMut(&str) -> Result<String>,
    {
        Ok(match self {
            FieldValue::Text(s) => FieldValue::Text(f(s)?),
            FieldValue::List(items) => FieldValue::List(
                items.iter().map(|v| v.try_map_text(f)).collect::<Result<Vec<_>>>()?,
            ),
            FieldValue::Map(map) => FieldValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_map_text(f)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
        })
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<String>> {
        match self {
            FieldValue::List(items) => Some(items.into_iter().filter_map(FieldValue::into_text).collect()),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Metadata> {
        match self {
            FieldValue::Map(map) => Some(
                map.into_iter()
                    .filter_map(|(k, v)| v.into_text().map(|s| (k, s)))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value.into_iter().map(FieldValue::Text).collect())
    }
}

impl From<Metadata> for FieldValue {
    fn from(value: Metadata) -> Self {
        FieldValue::Map(value.into_iter().map(|(k, v)| (k, FieldValue::Text(v))).collect())
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(s) => FieldValue::Text(s),
            Value::Array(items) => FieldValue::List(items.into_iter().map(FieldValue::from).collect()),
            Value::Object(map) => {
                FieldValue::Map(map.into_iter().map(|(k, v)| (k, FieldValue::from(v))).collect())
            }
            Value::Null => FieldValue::Text(String::new()),
            scalar => FieldValue::Text(scalar.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Create,
    Update,
    Delete,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Update => "update",
            HistoryAction::Delete => "delete",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryAction {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(HistoryAction::Create),
            "update" => Ok(HistoryAction::Update),
            "delete" => Ok(HistoryAction::Delete),
            other => Err(MemError::CorruptRecord(format!("unknown history action '{}'", other))),
        }
    }
}

/// Immutable snapshot of a record at create/update/delete time.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub record_id: String,
    /// Microseconds since the epoch, unique within one record's history
    pub timestamp: u64,
    pub action: HistoryAction,
    pub record: Record,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn importance_is_clamped() {
        let low = RecordBuilder::new().content("x").importance(-1.0).build().unwrap();
        let high = RecordBuilder::new().content("x").importance(2.0).build().unwrap();
        assert_eq!(low.importance, 0.0);
        assert_eq!(high.importance, 1.0);
        assert_eq!(clamp_importance(f32::NAN), 0.0);
    }

    #[test]
    fn build_requires_content_or_embedding() {
        let err = RecordBuilder::new().build().unwrap_err();
        assert!(matches!(err, MemError::Validation(_)));

        let from_vector = RecordBuilder::new().embedding(vec![0.1, 0.2]).build();
        assert!(from_vector.is_ok());
    }

    #[test]
    fn built_ids_are_unique() {
        let ids: HashSet<String> = (0..50)
            .map(|_| RecordBuilder::new().content("same").build().unwrap().id)
            .collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn builder_embeds_content() {
        let embedder = |text: &str| vec![text.len() as f32, 1.0];
        let record = RecordBuilder::new()
            .content("four")
            .embed_with(&embedder)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(record.embedding, Some(vec![4.0, 1.0]));
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn tags_from_str_splits_on_commas() {
        let record = RecordBuilder::new().content("x").tags_from_str("a, b,,c ").build().unwrap();
        assert_eq!(record.tags(), ["a", "b", "c"]);
    }

    #[test]
    fn json_metadata_values_are_stringified() {
        let record: Record = serde_json::from_str(
            r#"{"id":"m1","content":"c","metadata":{"n":3,"flag":true,"s":"x"}}"#,
        )
        .unwrap();
        let metadata = record.metadata.unwrap();
        assert_eq!(metadata["n"], "3");
        assert_eq!(metadata["flag"], "true");
        assert_eq!(metadata["s"], "x");
        assert_eq!(record.importance, DEFAULT_IMPORTANCE);
        assert!(record.tags.is_none());
    }

    #[test]
    fn field_value_from_json_is_lossy() {
        let value = FieldValue::from(serde_json::json!({"a": [1, "b"], "c": null}));
        let expected = FieldValue::Map(BTreeMap::from([
            (
                "a".to_string(),
                FieldValue::List(vec![FieldValue::Text("1".into()), FieldValue::Text("b".into())]),
            ),
            ("c".to_string(), FieldValue::Text(String::new())),
        ]));
        assert_eq!(value, expected);
    }

    #[test]
    fn history_action_round_trips_through_str() {
        for action in [HistoryAction::Create, HistoryAction::Update, HistoryAction::Delete] {
            assert_eq!(action.as_str().parse::<HistoryAction>().unwrap(), action);
        }
        assert!("rename".parse::<HistoryAction>().is_err());
    }
}
