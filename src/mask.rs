use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Boolean feature subset over the concatenated feature space of all views,
/// stored as the sorted list of its true positions.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FeatureMask {
    len: usize,
    positions: Vec<usize>,
}

impl FeatureMask {
    /// All-false mask of length `len`
    pub fn empty(len: usize) -> FeatureMask {
        FeatureMask { len, positions: Vec::new() }
    }

    pub fn full(len: usize) -> FeatureMask {
        FeatureMask { len, positions: (0..len).collect() }
    }

    pub fn from_bools<I: IntoIterator<Item = bool>>(bools: I) -> FeatureMask {
        let mut len = 0;
        let mut positions = Vec::new();
        for (i, b) in bools.into_iter().enumerate() {
            if b {
                positions.push(i);
            }
            len = i + 1;
        }
        FeatureMask { len, positions }
    }

    /// Mask of the non-zero support of a distribution
    pub fn from_support(weights: &[f64]) -> FeatureMask {
        FeatureMask::from_bools(weights.iter().map(|w| *w != 0.0))
    }

    /// Positions out of range are dropped, duplicates merged.
    pub fn from_positions(len: usize, positions: &[usize]) -> FeatureMask {
        let mut positions: Vec<usize> = positions.iter().copied().filter(|p| *p < len).collect();
        positions.sort_unstable();
        positions.dedup();
        FeatureMask { len, positions }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of selected features
    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn true_positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn get(&self, idx: usize) -> bool {
        self.positions.binary_search(&idx).is_ok()
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        match (self.positions.binary_search(&idx), value) {
            (Err(at), true) => self.positions.insert(at, idx),
            (Ok(at), false) => {
                self.positions.remove(at);
            }
            _ => {}
        }
    }

    pub fn flip(&mut self, idx: usize) {
        let current = self.get(idx);
        self.set(idx, !current);
    }

    pub fn to_bools(&self) -> Vec<bool> {
        let mut bools = vec![false; self.len];
        for p in &self.positions {
            bools[*p] = true;
        }
        bools
    }

    /// Selects the mask columns of a sample-by-feature matrix, in ascending position order
    pub fn apply<T: Clone>(&self, rows: &[Vec<T>]) -> Vec<Vec<T>> {
        rows.iter().map(|row| self.apply_row(row)).collect()
    }

    pub fn apply_row<T: Clone>(&self, row: &[T]) -> Vec<T> {
        self.positions.iter().map(|p| row[*p].clone()).collect()
    }

    /// Re-expands a vector of size `count()` into a full-length vector, zero elsewhere
    pub fn apply_backward(&self, values: &[f64]) -> Vec<f64> {
        let mut full = vec![0.0; self.len];
        for (v, p) in values.iter().zip(self.positions.iter()) {
            full[*p] = *v;
        }
        full
    }

    pub fn union(&self, other: &FeatureMask) -> FeatureMask {
        let mut positions: Vec<usize> = self.positions.iter().chain(other.positions.iter()).copied().collect();
        positions.sort_unstable();
        positions.dedup();
        FeatureMask { len: self.len.max(other.len), positions }
    }

    pub fn intersection(&self, other: &FeatureMask) -> FeatureMask {
        let positions = self.positions.iter().copied().filter(|p| other.get(*p)).collect();
        FeatureMask { len: self.len.max(other.len), positions }
    }

    /// Positions set in exactly one of the masks
    pub fn symmetric_difference(&self, other: &FeatureMask) -> Vec<usize> {
        let mut diff: Vec<usize> = self.positions.iter().copied().filter(|p| !other.get(*p))
            .chain(other.positions.iter().copied().filter(|p| !self.get(*p)))
            .collect();
        diff.sort_unstable();
        diff
    }

    /// Hash of the sorted true positions that does not depend on the Rust
    /// version, so it can seed evaluations reproducibly
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update((self.len as u64).to_le_bytes());
        for p in &self.positions {
            hasher.update((*p as u64).to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Debug for FeatureMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureMask[{}]{:?}", self.len, self.positions)
    }
}
