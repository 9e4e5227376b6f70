//! Per hall-of-fame JSON cache of the statistics computed from its saved
//! solutions.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hypervolume::{cross_hypervolume, hypervolume, pareto_delta};
use crate::objective::{Computer, DEFAULT_SOFT_LEANNESS_SATURATION};
use crate::solutions::Solutions;
use crate::utils::jaccard;

pub const REGISTRY_FILE: &str = "validation_registry.json";
const EXCLUSIVE_DIR: &str = "Exclusive_numbers";
const MAX_EXCLUSIVE_NUMBER: usize = 1 << 20;
const LOCK_ATTEMPTS: usize = 1200;
const LOCK_WAIT: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    TestHv,
    CrossHv,
    InnerCvHv,
    MeanJaccard,
    PerformanceGap,
    PerformanceError,
    ParetoDelta,
    SoftCrossHv,
    SoftParetoDelta,
    StabilityBySetOverlap,
    StabilityByWeights,
}

impl Property {
    pub const ALL: [Property; 11] = [
        Property::TestHv,
        Property::CrossHv,
        Property::InnerCvHv,
        Property::MeanJaccard,
        Property::PerformanceGap,
        Property::PerformanceError,
        Property::ParetoDelta,
        Property::SoftCrossHv,
        Property::SoftParetoDelta,
        Property::StabilityBySetOverlap,
        Property::StabilityByWeights,
    ];

    /// Registered names and their legacy aliases
    pub fn from_name(name: &str) -> Result<Property> {
        let property = match name {
            "test_hv" | "hypervolume_test" | "test_hypervolume" => Property::TestHv,
            "cross_hv" | "cross_hypervolume" => Property::CrossHv,
            "inner_cv_hv" | "train_hv" | "inner_hv" => Property::InnerCvHv,
            "mean_jaccard" | "jaccard" => Property::MeanJaccard,
            "performance_gap" | "gap" => Property::PerformanceGap,
            "performance_error" | "error" => Property::PerformanceError,
            "pareto_delta" | "delta" | "hv_delta" => Property::ParetoDelta,
            "soft_cross_hv" | "soft_cross_hypervolume" => Property::SoftCrossHv,
            "soft_pareto_delta" | "soft_delta" => Property::SoftParetoDelta,
            "stability_by_set_overlap" | "set_overlap" => Property::StabilityBySetOverlap,
            "stability_by_weights" | "weights_stability" => Property::StabilityByWeights,
            _ => return Err(Error::value(format!("unknown registry property '{}'", name))),
        };
        Ok(property)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Property::TestHv => "test_hv",
            Property::CrossHv => "cross_hv",
            Property::InnerCvHv => "inner_cv_hv",
            Property::MeanJaccard => "mean_jaccard",
            Property::PerformanceGap => "performance_gap",
            Property::PerformanceError => "performance_error",
            Property::ParetoDelta => "pareto_delta",
            Property::SoftCrossHv => "soft_cross_hv",
            Property::SoftParetoDelta => "soft_pareto_delta",
            Property::StabilityBySetOverlap => "stability_by_set_overlap",
            Property::StabilityByWeights => "stability_by_weights",
        }
    }

    /// Computes the property from the solutions of a hall of fame.
    /// Values are finite; an empty hall of fame yields 0.
    ///
    /// # Arguments
    /// * `solutions` - members of every outer fold
    /// * `softening` - feature space and saturation for the soft properties
    pub fn compute(&self, solutions: &Solutions, softening: &Softening) -> Result<PropertyValue> {
        let value = match self {
            Property::TestHv => per_fold(solutions, |_, test| Ok(hypervolume(test)))?,
            Property::InnerCvHv => per_fold(solutions, |inner, _| Ok(hypervolume(inner)))?,
            Property::CrossHv => per_fold(solutions, cross_hypervolume)?,
            Property::ParetoDelta => per_fold(solutions, pareto_delta)?,
            Property::SoftCrossHv => per_fold(&softening.apply(solutions), cross_hypervolume)?,
            Property::SoftParetoDelta => per_fold(&softening.apply(solutions), pareto_delta)?,
            Property::PerformanceGap => gap(solutions, |d| d),
            Property::PerformanceError => gap(solutions, f64::abs),
            Property::MeanJaccard => PropertyValue::Scalar(pairwise_mean(&fold_sets(solutions), jaccard)),
            Property::StabilityBySetOverlap => PropertyValue::Scalar(pairwise_mean(&fold_sets(solutions), overlap)),
            Property::StabilityByWeights => PropertyValue::Scalar(stability_by_weights(solutions)),
        };
        Ok(value)
    }
}

/// Soft leanness used by the soft properties: leanness axes of the saved
/// fitnesses are re-expressed over `n_features` with the given saturation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Softening {
    pub n_features: usize,
    pub saturation: usize,
}

impl Softening {
    /// Default saturation over the feature columns of the solutions.
    /// Loaded solutions only keep the ever-selected columns, so prefer the
    /// size of the original feature space when it is known.
    pub fn for_solutions(solutions: &Solutions) -> Softening {
        let n_features = solutions.solutions.iter().map(|s| s.mask.len()).max().unwrap_or(0).max(solutions.feature_names.len());
        Softening { n_features, saturation: DEFAULT_SOFT_LEANNESS_SATURATION }
    }

    /// Copy of `solutions` whose leanness axes are softened
    pub fn apply(&self, solutions: &Solutions) -> Solutions {
        let computers: Vec<Option<Computer>> = solutions.objective_nicks.iter()
            .map(|nick| Computer::structural_from_nick(nick, self.saturation))
            .collect();
        let soften = |values: &[f64]| -> Vec<f64> {
            values.iter()
                .zip(computers.iter())
                .map(|(v, c)| c.as_ref().map_or(*v, |c| c.soften(*v, self.n_features, self.saturation)))
                .collect()
        };
        let mut soft = solutions.clone();
        for s in soft.solutions.iter_mut() {
            s.internal_cv = soften(&s.internal_cv);
            s.internal = soften(&s.internal);
        }
        soft
    }
}

/// Stored value: a scalar, a per-fold vector, or both
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(f64),
    PerFold(Vec<f64>),
    Both { value: f64, per_fold: Vec<f64> },
}

impl PropertyValue {
    /// Scalar summary; the mean for a bare per-fold vector
    pub fn value(&self) -> f64 {
        match self {
            PropertyValue::Both { value, .. } | PropertyValue::Scalar(value) => *value,
            PropertyValue::PerFold(values) => finite_mean(values.iter().copied()),
        }
    }

    pub fn per_fold(&self) -> Option<&[f64]> {
        match self {
            PropertyValue::Both { per_fold, .. } | PropertyValue::PerFold(per_fold) => Some(per_fold),
            PropertyValue::Scalar(_) => None,
        }
    }
}

//-----------------------------------------------------------------------------
// Registry
//-----------------------------------------------------------------------------

/// Property cache colocated with a hall of fame directory. Missing
/// properties are computed from the saved solutions on `get`.
///
/// Every write holds the registry lock while it re-reads the file, merges
/// its change and renames a temporary copy over it, so writers sharing a
/// directory never drop each other's keys.
#[derive(Debug)]
pub struct ValidationRegistry {
    dir: PathBuf,
    /// Directory holding the `Exclusive_numbers` tokens
    token_root: PathBuf,
    values: BTreeMap<Property, PropertyValue>,
    solutions: Option<Solutions>,
    softening: Option<Softening>,
}

impl ValidationRegistry {
    /// Opens the registry of `dir`, rewriting legacy names. Unknown keys are dropped.
    pub fn open(dir: &Path, token_root: &Path) -> Result<ValidationRegistry> {
        let values = read_values(&dir.join(REGISTRY_FILE))?;
        Ok(ValidationRegistry { dir: dir.to_path_buf(), token_root: token_root.to_path_buf(), values, solutions: None, softening: None })
    }

    /// Soft leanness for the soft properties; `Softening::for_solutions` otherwise
    pub fn with_softening(mut self, softening: Softening) -> ValidationRegistry {
        self.softening = Some(softening);
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    pub fn has(&self, property: Property) -> bool {
        self.values.contains_key(&property)
    }

    /// Stored value, computed and persisted first when missing
    pub fn get(&mut self, property: Property) -> Result<PropertyValue> {
        if let Some(value) = self.values.get(&property) {
            return Ok(value.clone());
        }
        if self.solutions.is_none() {
            self.solutions = Some(Solutions::load(&self.dir)?);
        }
        let value = match &self.solutions {
            Some(solutions) => {
                let softening = self.softening.unwrap_or_else(|| Softening::for_solutions(solutions));
                property.compute(solutions, &softening)?
            }
            None => return Err(Error::illegal("solutions were not loaded")),
        };
        let stored = value.clone();
        self.update(move |values| {
            values.insert(property, stored);
        })?;
        Ok(value)
    }

    /// Stores a value under a registered name or alias
    pub fn set(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        let property = Property::from_name(name)?;
        self.update(move |values| {
            values.insert(property, value);
        })
    }

    /// Drops every stored value and the cached solutions
    pub fn clean(&mut self) -> Result<()> {
        self.solutions = None;
        self.update(|values| values.clear())
    }

    /// Computes every missing property
    pub fn fill(&mut self) -> Result<()> {
        for property in Property::ALL {
            self.get(property)?;
        }
        Ok(())
    }

    pub fn values(&self) -> &BTreeMap<Property, PropertyValue> {
        &self.values
    }

    /// Applies `change` to the registry on disk under the lock and keeps
    /// the merged result in memory
    fn update<F: FnOnce(&mut BTreeMap<Property, PropertyValue>)>(&mut self, change: F) -> Result<()> {
        let _lock = RegistryLock::acquire(&self.dir)?;
        let mut values = read_values(&self.path())?;
        change(&mut values);
        self.write(&values)?;
        self.values = values;
        Ok(())
    }

    /// Writes to a temporary file named after an exclusive number, then
    /// renames it over the registry. Retried once with a fresh number.
    fn write(&self, values: &BTreeMap<Property, PropertyValue>) -> Result<()> {
        let content = serde_json::to_string_pretty(values)?;
        let mut last_error = String::new();
        for attempt in 0..2 {
            let token = ExclusiveNumber::acquire(&self.token_root)?;
            let tmp = self.dir.join(format!("{}.{}.tmp", REGISTRY_FILE, token.number));
            let written = fs::write(&tmp, &content).and_then(|_| fs::rename(&tmp, self.path()));
            match written {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Registry write attempt {} failed: {}", attempt + 1, e);
                    let _ = fs::remove_file(&tmp);
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::Persistence { path: self.path().display().to_string(), reason: last_error })
    }
}

/// Registry file content with legacy names rewritten; empty when absent
fn read_values(path: &Path) -> Result<BTreeMap<Property, PropertyValue>> {
    let mut values = BTreeMap::new();
    if !path.exists() {
        return Ok(values);
    }
    let raw: BTreeMap<String, PropertyValue> = serde_json::from_str(&fs::read_to_string(path)?)?;
    for (name, value) in raw {
        match Property::from_name(&name) {
            Ok(property) => {
                if property.name() != name {
                    debug!("Registry {}: '{}' renamed to '{}'", path.display(), name, property.name());
                }
                values.insert(property, value);
            }
            Err(_) => warn!("Registry {}: ignoring unknown property '{}'", path.display(), name),
        }
    }
    Ok(values)
}

/// `validation_registry.json.lock`, created exclusively and removed on drop
#[derive(Debug)]
struct RegistryLock {
    path: PathBuf,
}

impl RegistryLock {
    fn acquire(dir: &Path) -> Result<RegistryLock> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", REGISTRY_FILE));
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(RegistryLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => thread::sleep(LOCK_WAIT),
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Persistence { path: path.display().to_string(), reason: "registry lock was never released".to_string() })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not release {}: {}", self.path.display(), e);
        }
    }
}

/// Process-unique number materialised as `<root>/Exclusive_numbers/<n>.tmp`,
/// held until drop
#[derive(Debug)]
pub struct ExclusiveNumber {
    pub number: usize,
    path: PathBuf,
}

impl ExclusiveNumber {
    /// Claims the smallest free number
    pub fn acquire(root: &Path) -> Result<ExclusiveNumber> {
        let dir = root.join(EXCLUSIVE_DIR);
        fs::create_dir_all(&dir)?;
        for number in 0..MAX_EXCLUSIVE_NUMBER {
            let path = dir.join(format!("{}.tmp", number));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(ExclusiveNumber { number, path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Persistence { path: dir.display().to_string(), reason: "no free exclusive number".to_string() })
    }
}

impl Drop for ExclusiveNumber {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not release {}: {}", self.path.display(), e);
        }
    }
}

//-----------------------------------------------------------------------------
// Property computers
//-----------------------------------------------------------------------------

fn fold_fitness(solutions: &Solutions, fold: usize) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    solutions.fold(fold).map(|s| (s.internal_cv.clone(), s.internal.clone())).unzip()
}

fn per_fold<F>(solutions: &Solutions, f: F) -> Result<PropertyValue>
where
    F: Fn(&[Vec<f64>], &[Vec<f64>]) -> Result<f64>,
{
    let per_fold = (0..solutions.n_folds())
        .map(|fold| {
            let (inner, test) = fold_fitness(solutions, fold);
            f(&inner, &test).map(finite)
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok(PropertyValue::Both { value: finite_mean(per_fold.iter().copied()), per_fold })
}

/// Mean of `f(inner - test)` over members and objectives, overall and per fold
fn gap<F: Fn(f64) -> f64>(solutions: &Solutions, f: F) -> PropertyValue {
    let differences = |fold: Option<usize>| {
        solutions.solutions.iter()
            .filter(move |s| fold.map_or(true, |i| s.fold == i))
            .flat_map(|s| s.internal_cv.iter().zip(s.internal.iter()).map(|(a, b)| a - b))
            .filter(|d| d.is_finite())
            .map(&f)
            .collect::<Vec<f64>>()
    };
    let per_fold = (0..solutions.n_folds()).map(|i| finite_mean(differences(Some(i)).into_iter())).collect();
    PropertyValue::Both { value: finite_mean(differences(None).into_iter()), per_fold }
}

/// Selected-feature union of each fold
fn fold_sets(solutions: &Solutions) -> Vec<HashSet<usize>> {
    (0..solutions.n_folds())
        .map(|fold| solutions.fold(fold).flat_map(|s| s.mask.true_positions().iter().copied()).collect())
        .collect()
}

fn overlap(a: &HashSet<usize>, b: &HashSet<usize>) -> f64 {
    let smallest = a.len().min(b.len());
    if smallest == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smallest as f64
}

fn pairwise_mean<T, F: Fn(&T, &T) -> f64>(items: &[T], f: F) -> f64 {
    let mut values = Vec::new();
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            values.push(f(&items[i], &items[j]));
        }
    }
    finite_mean(values.into_iter())
}

/// Mean pairwise cosine similarity of the per-fold feature usage frequencies
fn stability_by_weights(solutions: &Solutions) -> f64 {
    let n_features = solutions.solutions.iter().map(|s| s.mask.len()).max().unwrap_or(0);
    let weights: Vec<Vec<f64>> = (0..solutions.n_folds())
        .map(|fold| {
            let members: Vec<_> = solutions.fold(fold).collect();
            let mut w = vec![0.0; n_features];
            for s in &members {
                for p in s.mask.true_positions() {
                    w[*p] += 1.0 / members.len() as f64;
                }
            }
            w
        })
        .collect();
    pairwise_mean(&weights, |a: &Vec<f64>, b: &Vec<f64>| {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm = a.iter().map(|x| x * x).sum::<f64>().sqrt() * b.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 { dot / norm } else { 0.0 }
    })
}

fn finite(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

fn finite_mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, n) = values.filter(|v| v.is_finite()).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}
