use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::data::Data;
use crate::evaluator::EvaluationRecord;
use crate::learner::MaskedPredictor;
use crate::mask::FeatureMask;

/// A candidate biomarker set and everything the evaluator learned about it.
/// Identity (equality and hash) is the mask alone.
#[derive(Clone, Serialize, Deserialize)]
pub struct Individual {
    /// Selected features over the concatenated feature space
    pub mask: FeatureMask,

    /// Optimised fitness, one value per objective (adjusted when an adjuster is set)
    pub fitness: Vec<f64>,
    /// Raw mean of the inner-CV folds
    pub inner_fitness: Vec<f64>,
    pub std_dev: Vec<f64>,
    pub ci95: Vec<(f64, f64)>,
    pub bootstrap_mean: Vec<f64>,

    /// One predictor per predictive objective, trained on the whole training set
    pub predictors: Vec<Option<MaskedPredictor>>,
    /// Importance of the active features, averaged over the distinct predictors
    pub importance: Option<Vec<f64>>,

    /// Secondary sorting keys, larger is better
    pub crowding_distance: f64,
    pub social_space: f64,
    pub peculiarity: f64,
    /// Index of the non-dominated front (0 is the best)
    pub rank: usize,

    pub evaluated: bool,
    /// False when the inner CV could not score the mask; such individuals are never promoted
    pub valid: bool,

    /// Generation that produced the individual
    pub epoch: usize,
    /// Stable hash of the mask
    pub hash: u64,
}

impl Individual {
    pub fn new(mask: FeatureMask, epoch: usize) -> Individual {
        let hash = mask.stable_hash();
        Individual {
            mask,
            fitness: Vec::new(),
            inner_fitness: Vec::new(),
            std_dev: Vec::new(),
            ci95: Vec::new(),
            bootstrap_mean: Vec::new(),
            predictors: Vec::new(),
            importance: None,
            crowding_distance: 0.0,
            social_space: 0.0,
            peculiarity: 0.0,
            rank: 0,
            evaluated: false,
            valid: false,
            epoch,
            hash,
        }
    }

    /// Copies the mask of a parent; the child keeps the parent's evaluation until its mask changes
    pub fn child(parent: &Individual, epoch: usize) -> Individual {
        let mut child = parent.clone();
        child.epoch = epoch;
        child
    }

    /// Replaces the mask, dropping the evaluation when it actually changed
    pub fn set_mask(&mut self, mask: FeatureMask) {
        if mask != self.mask {
            self.mask = mask;
            self.hash = self.mask.stable_hash();
            self.invalidate();
        }
    }

    pub fn invalidate(&mut self) {
        self.evaluated = false;
        self.valid = false;
        self.fitness.clear();
        self.inner_fitness.clear();
        self.std_dev.clear();
        self.ci95.clear();
        self.bootstrap_mean.clear();
        self.predictors.clear();
        self.importance = None;
    }

    pub fn apply_record(&mut self, record: EvaluationRecord) {
        self.fitness = record.fitness;
        self.inner_fitness = record.inner_fitness;
        self.std_dev = record.std_dev;
        self.ci95 = record.ci95;
        self.bootstrap_mean = record.bootstrap_mean;
        self.predictors = record.predictors;
        self.importance = record.importance;
        self.valid = record.valid;
        self.evaluated = true;
    }

    /// Number of selected features
    pub fn k(&self) -> usize {
        self.mask.count()
    }

    pub fn fitness_sum(&self) -> f64 {
        self.fitness.iter().sum()
    }

    /// Pareto domination on the fitness vectors
    pub fn dominates(&self, other: &Individual) -> bool {
        self.valid && dominates(&self.fitness, &other.fitness)
    }

    pub fn display(&self, data: &Data, objective_nicks: &[String]) -> String {
        let fitness = objective_nicks.iter()
            .zip(self.fitness.iter())
            .map(|(nick, f)| format!("{} {:.3}", nick, f))
            .collect::<Vec<_>>()
            .join(" | ");
        format!("k={} [{}] {}", self.k(), data.feature_names(&self.mask).join(", "), fitness)
    }
}

/// `a` dominates `b`: at least as good on every objective and strictly better on one
pub fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly = false;
    for (x, y) in a.iter().zip(b.iter()) {
        if x < y || x.is_nan() {
            return false;
        }
        if x > y {
            strictly = true;
        }
    }
    strictly
}

impl PartialEq for Individual {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask
    }
}

impl Eq for Individual {}

impl Hash for Individual {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mask.hash(state);
    }
}

impl fmt::Debug for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fitness = self.fitness.iter().map(|v| format!("{:.3}", v)).collect::<Vec<_>>().join(", ");
        write!(f, "{:?} ({}){}", self.mask, fitness, if self.valid || !self.evaluated { "" } else { " invalid" })
    }
}

#[cfg(test)]
impl Individual {
    /// An evaluated individual with the given fitness and a mask over `positions` (8 features)
    pub fn test_with(positions: &[usize], fitness: Vec<f64>) -> Individual {
        let mut i = Individual::new(FeatureMask::from_positions(8, positions), 0);
        let m = fitness.len();
        i.inner_fitness = fitness.clone();
        i.fitness = fitness;
        i.std_dev = vec![0.0; m];
        i.ci95 = i.fitness.iter().map(|f| (*f, *f)).collect();
        i.bootstrap_mean = i.fitness.clone();
        i.predictors = vec![None; m];
        i.evaluated = true;
        i.valid = true;
        i
    }
}
