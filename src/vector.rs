use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::write_atomic;
use crate::error::{MemError, Result};

const VECTOR_FILE: &str = "vectors.json";

/// Seed for the projection matrix so that compressed vectors are
/// reproducible across runs.
pub const PROJECTION_SEED: u64 = 42;

/// Cosine similarity in [-1, 1]. A zero vector on either side scores 0.0.
///
/// Unrolled by 8 lanes so LLVM can keep dot and both norms in vector
/// registers.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(MemError::DimensionMismatch { expected: a.len(), found: b.len() });
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    let chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    let remainder_start = a.len() - a.len() % 8;

    for (ac, bc) in chunks.zip(b_chunks) {
        dot += ac[0]*bc[0] + ac[1]*bc[1] + ac[2]*bc[2] + ac[3]*bc[3] +
        ac[4]*bc[4] + ac[5]*bc[5] + ac[6]*bc[6] + ac[7]*bc[7];

        norm_a += ac[0]*ac[0] + ac[1]*ac[1] + ac[2]*ac[2] + ac[3]*ac[3] +
        ac[4]*ac[4] + ac[5]*ac[5] + ac[6]*ac[6] + ac[7]*ac[7];

        norm_b += bc[0]*bc[0] + bc[1]*bc[1] + bc[2]*bc[2] + bc[3]*bc[3] +
        bc[4]*bc[4] + bc[5]*bc[5] + bc[6]*bc[6] + bc[7]*bc[7];
    }

    for i in remainder_start..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    if norm_a == 0.0 || norm_b == 0.0 { return Ok(0.0); }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Denormalised copy of the fields needed to display a hit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VectorMetadata {
    pub content: String,
    pub tags: Vec<String>,
    pub importance: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Exact similarity store. Search is a linear scan plus a full sort.
#[derive(Debug)]
pub struct VectorIndex {
    path: PathBuf,
    entries: RwLock<HashMap<String, VectorEntry>>,
}

impl VectorIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(VECTOR_FILE);
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                // Derived data: the record table can repopulate it.
                warn!(path = %path.display(), error = %e, "vector store unreadable, starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    fn save(&self, entries: &HashMap<String, VectorEntry>) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec(entries)?)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<VectorEntry> {
        self.entries.read().ok()?.get(id).cloned()
    }

    pub fn upsert(&self, id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| MemError::Poisoned("vector index"))?;
        entries.insert(id.to_string(), VectorEntry { vector, metadata });
        self.save(&entries)?;
        debug!(record_id = %id, "vector upserted");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| MemError::Poisoned("vector index"))?;
        let removed = entries.remove(id).is_some();
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| MemError::Poisoned("vector index"))?;
        entries.clear();
        self.save(&entries)
    }

    /// Top `top_k` entries by descending cosine similarity. Every stored
    /// vector must share the query's dimensionality.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        self.rank(top_k, |vector| cosine_similarity(query, vector))
    }

    /// Like `search`, but compares vectors after random projection.
    /// Experimental: the effect on ranking quality is unmeasured.
    pub fn search_projected(
        &self,
        query: &[f32],
        top_k: usize,
        projection: &RandomProjection,
    ) -> Result<Vec<SearchHit>> {
        let projected_query = projection.project(query)?;
        self.rank(top_k, |vector| cosine_similarity(&projected_query, &projection.project(vector)?))
    }

    fn rank<F>(&self, top_k: usize, mut score: F) -> Result<Vec<SearchHit>>
    where
        F: FnMut(&[f32]) -> Result<f32>,
    {
        let entries = self.entries.read().map_err(|_| MemError::Poisoned("vector index"))?;
        let mut scored = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            scored.push((OrderedFloat(score(&entry.vector)?), id, entry));
        }
        // Ties break on id so results are stable across runs.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, id, entry)| SearchHit {
                id: id.clone(),
                score: score.into_inner(),
                metadata: entry.metadata.clone(),
            })
            .collect())
    }
}

/// Gaussian random projection from `input_dim` down to `input_dim / level`
/// dimensions, scaled by `1 / sqrt(output_dim)`.
#[derive(Debug, Clone)]
pub struct RandomProjection {
    input_dim: usize,
    output_dim: usize,
    // Row-major input_dim x output_dim
    matrix: Vec<f32>,
}

impl RandomProjection {
    pub fn new(input_dim: usize, level: usize) -> Result<Self> {
        Self::with_seed(input_dim, level, PROJECTION_SEED)
    }

    pub fn with_seed(input_dim: usize, level: usize, seed: u64) -> Result<Self> {
        if level == 0 {
            return Err(MemError::Validation("projection level must be at least 1".into()));
        }
        let output_dim = input_dim / level;
        if output_dim == 0 {
            return Err(MemError::Validation(format!(
                "cannot project {} dimensions by a factor of {}",
                input_dim, level
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (output_dim as f64).sqrt();
        let matrix = (0..input_dim * output_dim)
            .map(|_| (gaussian(&mut rng) * scale) as f32)
            .collect();
        Ok(Self { input_dim, output_dim, matrix })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn project(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.input_dim {
            return Err(MemError::DimensionMismatch { expected: self.input_dim, found: vector.len() });
        }
        let mut out = vec![0.0f32; self.output_dim];
        for (row, &x) in self.matrix.chunks_exact(self.output_dim).zip(vector) {
            for (acc, &m) in out.iter_mut().zip(row) {
                *acc += x * m;
            }
        }
        Ok(out)
    }
}

// Box-Muller transform
fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
