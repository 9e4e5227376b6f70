use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;

use crate::data::OutcomeKind;
use crate::error::{Error, Result};
use crate::utils::parse_nick;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Nsga2,
    Nsga3,
}

impl Algorithm {
    pub fn nick(&self) -> &'static str {
        match self {
            Algorithm::Nsga2 => "nsga2",
            Algorithm::Nsga3 => "nsga3",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Flip,
    Symmetric,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    Elitist,
    Tournament,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub model: Model,
    #[serde(default)]
    pub ga: GA,
    #[serde(default)]
    pub cv: CV,
    #[serde(default)]
    pub adjuster: Adjuster,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "one_default")]
    pub n_workers: usize,
    #[serde(default = "empty_string")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "true_default")]
    pub display_colorful: bool,
    #[serde(default = "save_path_default")]
    pub save_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ViewSource {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutcomeSource {
    pub name: String,
    pub path: String,
    pub kind: OutcomeKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Data {
    #[serde(default = "dataset_default")]
    pub dataset: String,
    /// Views used by the run, in order; empty means every loaded view
    #[serde(default)]
    pub views: Vec<String>,
    #[serde(default)]
    pub view_files: Vec<ViewSource>,
    #[serde(default)]
    pub outcome_files: Vec<OutcomeSource>,
    #[serde(default)]
    pub external_view_files: Vec<ViewSource>,
    #[serde(default)]
    pub external_outcome_files: Vec<OutcomeSource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Model {
    #[serde(default = "objectives_default")]
    pub objectives: Vec<String>,
    #[serde(default = "inner_model_default")]
    pub inner_model: String,
    #[serde(default = "survival_model_default")]
    pub survival_model: String,
    #[serde(default = "bootstrap_b_default")]
    pub bootstrap_b: usize,
    #[serde(default = "soft_leanness_saturation_default")]
    pub soft_leanness_saturation: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Generations {
    #[serde(default)]
    pub sweeps: Vec<usize>,
    #[serde(default = "concatenated_default")]
    pub concatenated: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GA {
    #[serde(default = "algorithm_default")]
    pub algorithm: Algorithm,
    #[serde(default = "sorting_strategy_default")]
    pub sorting_strategy: String,
    #[serde(default = "selection_default")]
    pub selection: Selection,
    #[serde(default)]
    pub generations: Generations,
    #[serde(default = "pop_size_default")]
    pub pop_size: usize,
    #[serde(default = "mating_prob_default")]
    pub mating_prob: f64,
    #[serde(default = "mutation_frequency_default")]
    pub mutation_frequency: f64,
    #[serde(default = "mutation_default")]
    pub mutation: MutationKind,
    #[serde(default = "initial_features_default")]
    pub initial_features: String,
    #[serde(default = "false_default")]
    pub cox_fi: bool,
    #[serde(default = "false_default")]
    pub clone_repurposing: bool,
    #[serde(default = "clone_quota_default")]
    pub clone_quota: usize,
    #[serde(default = "clone_repurposing_attempts_default")]
    pub clone_repurposing_attempts: usize,
    #[serde(default = "reference_divisions_default")]
    pub reference_divisions: usize,
    #[serde(default = "hofs_default")]
    pub hofs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CV {
    #[serde(default = "folds_default")]
    pub folds: String,
    #[serde(default = "inner_folds_default")]
    pub inner_folds: usize,
    #[serde(default = "min_stratum_size_default")]
    pub min_stratum_size: usize,
    #[serde(default = "survival_quantiles_default")]
    pub survival_quantiles: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Adjuster {
    #[serde(default = "adjuster_regressors_default")]
    pub regressors: Vec<String>,
    #[serde(default = "adjuster_sample_size_default")]
    pub sample_size: usize,
    #[serde(default = "adjuster_holdout_ratio_default")]
    pub holdout_ratio: f64,
}

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Model {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Generations {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for GA {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for CV {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Adjuster {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn get(param_file: String) -> Result<Param> {
    let param_file_reader = File::open(&param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<()> {
    if !param.general.log_base.is_empty() {
        param.general.display_colorful = false;
    }

    if param.general.n_workers == 0 {
        warn!("n_workers=0 makes no sense, using 1 worker.");
        param.general.n_workers = 1;
    }

    if param.ga.pop_size < 2 {
        return Err(Error::value(format!("Invalid pop_size={}. Must be >= 2.", param.ga.pop_size)));
    }

    if param.ga.clone_quota == 0 {
        return Err(Error::value("Invalid clone_quota=0. A mask must be allowed at least once."));
    }

    if !(0.0..=1.0).contains(&param.ga.mating_prob) {
        return Err(Error::value(format!("Invalid mating_prob={:.3}. Must be in [0, 1].", param.ga.mating_prob)));
    }

    if !(0.0..=1.0).contains(&param.ga.mutation_frequency) {
        return Err(Error::value(format!(
            "Invalid mutation_frequency={:.3}. Must be in [0, 1].",
            param.ga.mutation_frequency
        )));
    }

    if param.cv.inner_folds < 2 {
        return Err(Error::value(format!(
            "Invalid inner_folds={}. At least 2 folds are required to estimate a deviation.",
            param.cv.inner_folds
        )));
    }

    if param.cv.survival_quantiles == 0 {
        return Err(Error::value("survival_quantiles must be >= 1"));
    }

    if !(0.0..1.0).contains(&param.adjuster.holdout_ratio) {
        return Err(Error::value(format!(
            "Invalid adjuster holdout_ratio={:.3}. Must be in [0, 1).",
            param.adjuster.holdout_ratio
        )));
    }

    if param.model.objectives.is_empty() {
        return Err(Error::value("at least one objective is required"));
    }

    if param.model.bootstrap_b < 100 && param.model.bootstrap_b > 0 {
        warn!("Bootstrap B={} is small: bootstrap means of inner-CV fitnesses may be unstable.", param.model.bootstrap_b);
    }

    if param.adjuster.regressors.is_empty() {
        warn!("No adjuster regressor given: running a single outer CV with the zero adjuster.");
        param.adjuster.regressors = adjuster_regressors_default();
    }

    if param.ga.hofs.is_empty() {
        warn!("No hall of fame requested: using a Pareto front.");
        param.ga.hofs = hofs_default();
    }

    if param.data.external_view_files.is_empty() != param.data.external_outcome_files.is_empty() {
        return Err(Error::value("external views and external outcomes must be provided together"));
    }

    for nick in param.model.objectives.iter()
        .chain(param.ga.hofs.iter())
        .chain(param.adjuster.regressors.iter())
        .chain([&param.ga.sorting_strategy, &param.ga.initial_features, &param.cv.folds].into_iter())
    {
        parse_nick(nick)?;
    }

    Ok(())
}

// Default value definitions

fn seed_default() -> u64 {
    42
}
fn empty_string() -> String {
    "".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn save_path_default() -> String {
    "results".to_string()
}
fn dataset_default() -> String {
    "dataset".to_string()
}
fn objectives_default() -> Vec<String> {
    vec!["balanced_accuracy".to_string(), "leanness".to_string()]
}
fn inner_model_default() -> String {
    "naive_bayes".to_string()
}
fn survival_model_default() -> String {
    "cox".to_string()
}
fn bootstrap_b_default() -> usize {
    200
}
fn soft_leanness_saturation_default() -> usize {
    crate::objective::DEFAULT_SOFT_LEANNESS_SATURATION
}
fn concatenated_default() -> usize {
    100
}
fn algorithm_default() -> Algorithm {
    Algorithm::Nsga2
}
fn sorting_strategy_default() -> String {
    "crowding_distance".to_string()
}
fn selection_default() -> Selection {
    Selection::Elitist
}
fn pop_size_default() -> usize {
    100
}
fn mating_prob_default() -> f64 {
    0.1
}
fn mutation_frequency_default() -> f64 {
    0.01
}
fn mutation_default() -> MutationKind {
    MutationKind::Symmetric
}
fn initial_features_default() -> String {
    "binomial".to_string()
}
fn clone_quota_default() -> usize {
    1
}
fn clone_repurposing_attempts_default() -> usize {
    10
}
fn reference_divisions_default() -> usize {
    12
}
fn hofs_default() -> Vec<String> {
    vec!["pareto".to_string()]
}
fn folds_default() -> String {
    "stratified_k_fold(5, 1)".to_string()
}
fn inner_folds_default() -> usize {
    5
}
fn min_stratum_size_default() -> usize {
    5
}
fn survival_quantiles_default() -> usize {
    2
}
fn adjuster_regressors_default() -> Vec<String> {
    vec!["zero".to_string()]
}
fn adjuster_sample_size_default() -> usize {
    50
}
fn adjuster_holdout_ratio_default() -> f64 {
    0.2
}
fn false_default() -> bool {
    false
}
fn true_default() -> bool {
    true
}
fn one_default() -> usize {
    1
}
