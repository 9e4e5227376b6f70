//! Nested cross-validation: one optimizer per outer fold, halls of fame
//! scored on the fold test samples, then saved and summarised.

use chrono::Local;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::adjuster::FitnessAdjuster;
use crate::cinfo;
use crate::cv::{stratified_k_fold, ClassAssigner, Folds, FoldsCreator};
use crate::data::Data;
use crate::error::{Error, Result};
use crate::evaluator::{score, Evaluator};
use crate::ga::{cox_fi_weights, ga, GaSettings, InitialFeatures, MaskSampler};
use crate::hof::{hof_from_nick, HallOfFame, HofSnapshot, HofUnion};
use crate::individual::Individual;
use crate::learner::{Learner, Target};
use crate::objective::{Objective, ObjectiveDefaults, ObjectiveTag};
use crate::param::Param;
use crate::pool::EvaluationPool;
use crate::registry::{Property, PropertyValue, Softening, ValidationRegistry};
use crate::regressor::RegressorKind;
use crate::solutions::Solutions;
use crate::sorting::{SecondarySorter, Sorter};
use crate::utils::derive_seed;

const STREAM_OUTER_FOLDS: u64 = 1;
const STREAM_FOLD: u64 = 2;
const STREAM_EXTERNAL: u64 = 3;

const FOLD_INNER: u64 = 1;
const FOLD_ADJUSTER: u64 = 2;
const FOLD_EVALUATION: u64 = 3;
const FOLD_GA: u64 = 4;

pub const FOLDS_FILE: &str = "folds.json";

/// Properties and solutions of one hall of fame after all outer folds
#[derive(Debug)]
pub struct HofReport {
    pub nick: String,
    pub dir: PathBuf,
    pub solutions: Solutions,
    pub properties: BTreeMap<Property, PropertyValue>,
}

/// One complete outer cross-validation, for one adjuster
#[derive(Debug)]
pub struct OuterCv {
    pub optimizer_nick: String,
    pub dir: PathBuf,
    pub hofs: Vec<HofReport>,
    pub generations: Vec<usize>,
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct Experiment {
    pub id: String,
    pub version: String,
    pub timestamp: String,
    pub root: PathBuf,
    pub folds: Folds,
    pub runs: Vec<OuterCv>,
    pub execution_time: f64,
}

impl Experiment {
    pub fn display_results(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("\n=============== Experiment {} ===============\n\n", self.id));
        text.push_str(&format!("Paretomics version: v{}\n", self.version));
        text.push_str(&format!("Timestamp: {}\n", self.timestamp));
        text.push_str(&format!("Results: {}\n", self.root.display()));
        text.push_str(&format!("Outer folds: {}\n", self.folds.len()));
        text.push_str(&format!("Execution time: {:.2}s\n\n", self.execution_time));
        for run in &self.runs {
            text.push_str(&format!("\x1b[1;93m{}\x1b[0m{}\n", run.optimizer_nick, if run.interrupted { " (interrupted)" } else { "" }));
            for hof in &run.hofs {
                text.push_str(&format!("  {} - {} solutions\n", hof.nick, hof.solutions.len()));
                for (property, value) in &hof.properties {
                    text.push_str(&format!("    {:<26} {:.4}\n", property.name(), value.value()));
                }
            }
        }
        text
    }
}

//-----------------------------------------------------------------------------
// Setup
//-----------------------------------------------------------------------------

/// Resolves the objective nicks of the run against the dataset
pub fn objectives_from_param(param: &Param, data: &Data) -> Result<Vec<Objective>> {
    let defaults = ObjectiveDefaults {
        classification_learner: Learner::from_nick(&param.model.inner_model)?,
        survival_learner: Learner::from_nick(&param.model.survival_model)?,
        soft_leanness_saturation: param.model.soft_leanness_saturation,
    };
    param.model.objectives.iter().map(|nick| Objective::from_nick(nick, &defaults, data)).collect()
}

/// `<save_path>/<dataset>/<views>/<objectives>/<folds>`
pub fn results_root(param: &Param, data: &Data, objectives: &[Objective], folds: &FoldsCreator) -> PathBuf {
    let views: Vec<String> = data.views.iter().map(|v| v.name.clone()).collect();
    let objectives: Vec<String> = objectives.iter().map(|o| o.nick.clone()).collect();
    Path::new(&param.general.save_path)
        .join(path_component(&param.data.dataset))
        .join(path_component(&views.join("-")))
        .join(path_component(&objectives.join("-")))
        .join(path_component(&folds.nick()))
}

fn path_component(nick: &str) -> String {
    nick.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if matches!(c, ',' | ';' | '/' | '\\') { '_' } else { c })
        .collect()
}

fn mask_sampler(param: &Param, data: &Data) -> Result<MaskSampler> {
    let sampler = MaskSampler::new(InitialFeatures::from_nick(&param.ga.initial_features)?, data.feature_len);
    if !param.ga.cox_fi {
        return Ok(sampler);
    }
    match cox_fi_weights(data) {
        Some(weights) => Ok(sampler.with_weights(weights)),
        None => {
            warn!("cox_fi requested without a survival outcome: sampling features uniformly");
            Ok(sampler)
        }
    }
}

//-----------------------------------------------------------------------------
// Nested cross-validation
//-----------------------------------------------------------------------------

/// Runs one complete outer cross-validation per adjuster regressor
///
/// # Arguments
///
/// * `param` - Validated run parameters.
/// * `data` - Internal dataset, views already selected.
/// * `external` - Optional external cohort over the same features.
/// * `running` - Atomic boolean to control the running state of the algorithm.
///
/// # Returns
///
/// The experiment summary; every artefact is written below `Experiment::root`.
pub fn run_nested_cv(param: &Param, data: Arc<Data>, external: Option<Arc<Data>>, running: Arc<AtomicBool>) -> Result<Experiment> {
    let start = Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let root_seed = param.general.seed;

    if let Some(external) = &external {
        if !data.check_compatibility(external) {
            return Err(Error::value("the external dataset does not share the features of the internal one"));
        }
    }

    let objectives = objectives_from_param(param, &data)?;
    let folds_creator = FoldsCreator::from_nick(&param.cv.folds)?;
    let assigner = ClassAssigner::new(param.cv.min_stratum_size, param.cv.survival_quantiles);
    let mut folds_rng = ChaCha8Rng::seed_from_u64(derive_seed(root_seed, STREAM_OUTER_FOLDS));
    let folds = folds_creator.create(&data, &assigner, &mut folds_rng)?;
    if folds.len() < 2 {
        return Err(Error::value(format!("nested cross-validation needs at least 2 outer folds, got {}", folds.len())));
    }

    let root = results_root(param, &data, &objectives, &folds_creator);
    std::fs::create_dir_all(&root)?;
    folds.save(&root.join(FOLDS_FILE))?;
    info!("{} outer folds saved in {}", folds.len(), root.display());

    let mut runs = Vec::with_capacity(param.adjuster.regressors.len());
    for adjuster_nick in &param.adjuster.regressors {
        let kind = RegressorKind::from_nick(adjuster_nick)?;
        let run = run_outer_cv(param, &data, external.as_ref(), &objectives, &folds, &kind, &root, running.clone())?;
        let interrupted = run.interrupted;
        runs.push(run);
        if interrupted {
            warn!("Run interrupted: remaining adjusters skipped");
            break;
        }
    }

    let version = format!("{}#{}", env!("CARGO_PKG_VERSION"), option_env!("PARETOMICS_GIT_SHA").unwrap_or("unknown"));
    Ok(Experiment {
        id: format!("{}_{}", param.data.dataset, timestamp),
        version,
        timestamp,
        root,
        folds,
        runs,
        execution_time: start.elapsed().as_secs_f64(),
    })
}

/// Outer cross-validation for one adjuster: one optimizer per fold, then
/// the cross-fold savers and property computers of every hall of fame
#[allow(clippy::too_many_arguments)]
fn run_outer_cv(
    param: &Param,
    data: &Arc<Data>,
    external: Option<&Arc<Data>>,
    objectives: &[Objective],
    folds: &Folds,
    kind: &RegressorKind,
    root: &Path,
    running: Arc<AtomicBool>,
) -> Result<OuterCv> {
    let secondary = SecondarySorter::from_nick(&param.ga.sorting_strategy)?;
    let sorter = Sorter::new(param.ga.algorithm, secondary, objectives.len(), param.ga.reference_divisions);
    let optimizer_nick = format!("{}_{}", sorter.nick(), kind.nick());
    let dir = root.join(&optimizer_nick);
    std::fs::create_dir_all(&dir)?;
    cinfo!(param.general.display_colorful, "\x1b[1;96mOptimizer {}\x1b[0m", optimizer_nick);

    let mut unions: Vec<(String, HofUnion)> = Vec::new();
    let mut generations = Vec::with_capacity(folds.len());
    let mut interrupted = false;

    for i in 0..folds.len() {
        let fold_seed = derive_seed(derive_seed(param.general.seed, STREAM_FOLD), i as u64);
        let train = folds.train(i);
        let test = folds.test(i);
        cinfo!(param.general.display_colorful, "\x1b[1;93mFold {}/{}\x1b[0m: {} train / {} test samples", i + 1, folds.len(), train.len(), test.len());

        let fold = run_fold(param, data, objectives, &sorter, kind, &train, fold_seed, running.clone())?;
        generations.push(fold.generations);

        let fold_dir = dir.join(format!("fold_{}", i));
        std::fs::create_dir_all(&fold_dir)?;
        fold.feature_counts.save(&fold_dir.join("feature_counts.csv"), &data.features)?;
        fold.logbook.save(&fold_dir.join("logbook.csv"))?;

        let train_data = data.subset(&train);
        for hof in &fold.hofs {
            let members = hof.hofers();
            let test_fitness = test_fitness(objectives, &members, data, &train_data, test)?;
            let hof_dir = dir.join("hofs").join(path_component(&hof.nick()));
            std::fs::create_dir_all(hof_dir.join(format!("fold_{}", i)))?;
            std::fs::create_dir_all(hof_dir.join("confusion_matrix"))?;
            save_confusion_matrix(&hof_dir.join("confusion_matrix").join(format!("fold_{}.csv", i)), objectives, &members, data, test)?;

            let snapshot = HofSnapshot { nick: hof.nick(), fold: i, members, test_fitness };
            snapshot.save(&hof_dir.join(format!("fold_{}", i)).join("hof.bin"))?;
            debug!("Fold {}: {} members in {}", i, snapshot.members.len(), snapshot.nick);

            let position = match unions.iter().position(|(nick, _)| *nick == snapshot.nick) {
                Some(position) => position,
                None => {
                    unions.push((snapshot.nick.clone(), HofUnion::new()));
                    unions.len() - 1
                }
            };
            unions[position].1.add(snapshot);
        }

        if fold.interrupted {
            warn!("Fold {} interrupted after {} generations: remaining folds skipped", i, fold.generations);
            interrupted = true;
            break;
        }
    }

    let objective_nicks: Vec<String> = objectives.iter().map(|o| o.nick.clone()).collect();
    let token_root = Path::new(&param.general.save_path);
    let mut hofs = Vec::with_capacity(unions.len());
    for (nick, union) in &unions {
        let hof_dir = dir.join("hofs").join(path_component(nick));
        let mut solutions = Solutions::from_union(union, &objective_nicks, &data.features);
        if let (Some(external), false) = (external, interrupted) {
            external_validation(param, objectives, data, external, folds, &mut solutions)?;
        }
        solutions.save(&hof_dir)?;

        let softening = Softening { n_features: data.feature_len, saturation: param.model.soft_leanness_saturation };
        let mut registry = ValidationRegistry::open(&hof_dir, token_root)?.with_softening(softening);
        registry.clean()?;
        registry.fill()?;
        for (property, value) in registry.values() {
            info!("{} {}: {} = {:.4}", optimizer_nick, nick, property.name(), value.value());
        }
        hofs.push(HofReport { nick: nick.clone(), dir: hof_dir, solutions, properties: registry.values().clone() });
    }

    Ok(OuterCv { optimizer_nick, dir, hofs, generations, interrupted })
}

struct FoldRun {
    hofs: Vec<Box<dyn HallOfFame>>,
    feature_counts: crate::population::FeatureCounts,
    logbook: crate::ga::Logbook,
    generations: usize,
    interrupted: bool,
}

/// Inner folds, adjuster, evaluation pool and GA of one outer fold
#[allow(clippy::too_many_arguments)]
fn run_fold(
    param: &Param,
    data: &Data,
    objectives: &[Objective],
    sorter: &Sorter,
    kind: &RegressorKind,
    train: &[usize],
    fold_seed: u64,
    running: Arc<AtomicBool>,
) -> Result<FoldRun> {
    let train_data = Arc::new(data.subset(train));
    let assigner = ClassAssigner::new(param.cv.min_stratum_size, param.cv.survival_quantiles);
    let mut inner_rng = ChaCha8Rng::seed_from_u64(derive_seed(fold_seed, FOLD_INNER));
    let inner = stratified_k_fold(&train_data, param.cv.inner_folds, 1, &assigner, &mut inner_rng)?;

    let sampler = mask_sampler(param, &train_data)?;
    let adjuster = FitnessAdjuster::train(kind, objectives, &train_data, &sampler, param, derive_seed(fold_seed, FOLD_ADJUSTER))?;
    let evaluator = Evaluator::new(objectives.to_vec(), train_data, inner, param.model.bootstrap_b, derive_seed(fold_seed, FOLD_EVALUATION))?
        .with_adjuster(adjuster);
    let mut pool = EvaluationPool::new(Arc::new(evaluator), param.general.n_workers)?;

    let mut hofs = param.ga.hofs.iter().map(|nick| hof_from_nick(nick)).collect::<Result<Vec<_>>>()?;
    let settings = GaSettings::from_param(param);
    let result = ga(&mut pool, sorter, sampler, &settings, &mut hofs, derive_seed(fold_seed, FOLD_GA), running)?;

    Ok(FoldRun {
        hofs,
        feature_counts: result.feature_counts,
        logbook: result.logbook,
        generations: result.generations,
        interrupted: result.interrupted,
    })
}

/// Fitness of each member's predictors on the outer test samples
fn test_fitness(objectives: &[Objective], members: &[Individual], data: &Data, train_data: &Data, test: &[usize]) -> Result<Vec<Vec<f64>>> {
    let train_all: Vec<usize> = (0..train_data.sample_len).collect();
    members.par_iter()
        .map(|m| score(objectives, &m.predictors, &m.mask, data, test, Some((train_data, train_all.as_slice()))))
        .collect()
}

/// One row per (solution, classification objective, true class, predicted class)
fn save_confusion_matrix(path: &Path, objectives: &[Objective], members: &[Individual], data: &Data, test: &[usize]) -> Result<()> {
    let x_test: Vec<Vec<f64>> = test.iter().map(|i| data.x[*i].clone()).collect();
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["solution", "objective", "true", "predicted", "count"])?;
    for (n, member) in members.iter().enumerate() {
        for (objective, predictor) in objectives.iter().zip(member.predictors.iter()) {
            if objective.tag() != ObjectiveTag::Classification {
                continue;
            }
            let Some(predictor) = predictor else { continue };
            let Target::Classes { labels, n_classes } = objective.target(data, test)? else { continue };
            let predicted = match predictor.predict_classes(&x_test) {
                Ok(p) => p,
                Err(Error::DegenerateFit(reason)) => {
                    debug!("No confusion matrix for solution {}: {}", n, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut counts = vec![vec![0usize; n_classes]; n_classes];
            for (t, p) in labels.iter().zip(predicted.iter()) {
                if *t < n_classes && *p < n_classes {
                    counts[*t][*p] += 1;
                }
            }
            for (t, row) in counts.iter().enumerate() {
                for (p, count) in row.iter().enumerate() {
                    writer.write_record([n.to_string(), objective.nick.clone(), t.to_string(), p.to_string(), count.to_string()])?;
                }
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Retrains each solution on the whole internal dataset and scores it on
/// the external cohort
fn external_validation(param: &Param, objectives: &[Objective], data: &Arc<Data>, external: &Arc<Data>, folds: &Folds,
    solutions: &mut Solutions) -> Result<()> {
    let evaluator = Evaluator::new(objectives.to_vec(), data.clone(), folds.clone(), param.model.bootstrap_b,
        derive_seed(param.general.seed, STREAM_EXTERNAL))?;
    let internal_all: Vec<usize> = (0..data.sample_len).collect();
    let external_all: Vec<usize> = (0..external.sample_len).collect();
    info!("External validation of {} solutions on {} samples", solutions.len(), external.sample_len);

    let scores = solutions.solutions.par_iter()
        .map(|s| {
            let predictors = evaluator.fit_complete(&s.mask);
            score(objectives, &predictors, &s.mask, external, &external_all, Some((data.as_ref(), internal_all.as_slice())))
        })
        .collect::<Result<Vec<Vec<f64>>>>()?;
    for (solution, values) in solutions.solutions.iter_mut().zip(scores) {
        solution.external = values;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn toy_param(save_path: &Path) -> Param {
        let mut param = Param::default();
        param.general.save_path = save_path.display().to_string();
        param.general.n_workers = 2;
        param.general.display_colorful = false;
        param.data.dataset = "toy".to_string();
        param.ga.pop_size = 6;
        param.ga.generations.concatenated = 2;
        param.ga.initial_features = "uniform(1,3)".to_string();
        param.ga.mutation_frequency = 0.25;
        param.cv.folds = "stratified_k_fold(2,1)".to_string();
        param.cv.inner_folds = 2;
        param.cv.min_stratum_size = 2;
        param.model.bootstrap_b = 20;
        param
    }

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("c_index(os, cox)"), "c_index(os_cox)");
        assert_eq!(path_component("union(pareto;fronts(2))"), "union(pareto_fronts(2))");
    }

    #[test]
    fn test_results_root_layout() {
        let param = toy_param(Path::new("/tmp/results"));
        let data = Data::test();
        let objectives = objectives_from_param(&param, &data).unwrap();
        let root = results_root(&param, &data, &objectives, &FoldsCreator::from_nick(&param.cv.folds).unwrap());
        assert!(root.starts_with("/tmp/results/toy"));
        assert!(root.ends_with("balanced_accuracy-leanness/skf2x1"));
    }

    #[test]
    fn test_single_outer_fold_is_rejected() {
        let dir = tempdir().unwrap();
        let folds_path = dir.path().join("one.json");
        Folds::new(vec![(0..10).collect()]).unwrap().save(&folds_path).unwrap();
        let mut param = toy_param(dir.path());
        param.cv.folds = format!("load({})", folds_path.display());
        let result = run_nested_cv(&param, Arc::new(Data::test()), None, Arc::new(AtomicBool::new(true)));
        assert!(matches!(result, Err(Error::Value(_))));
    }

    #[test]
    fn test_nested_cv_writes_the_layout() {
        let dir = tempdir().unwrap();
        let param = toy_param(dir.path());
        let experiment = run_nested_cv(&param, Arc::new(Data::test()), None, Arc::new(AtomicBool::new(true))).unwrap();
        assert_eq!(experiment.runs.len(), 1);
        let run = &experiment.runs[0];
        assert_eq!(run.optimizer_nick, "nsga2_cd_zero");
        assert_eq!(run.generations, vec![2, 2]);
        assert!(experiment.root.join(FOLDS_FILE).exists());
        for i in 0..2 {
            assert!(run.dir.join(format!("fold_{}", i)).join("logbook.csv").exists());
            assert!(run.dir.join(format!("fold_{}", i)).join("feature_counts.csv").exists());
        }
        let hof = &run.hofs[0];
        assert_eq!(hof.nick, "pareto");
        assert!(hof.dir.join("solution_features.csv").exists());
        assert!(hof.dir.join("confusion_matrix").join("fold_1.csv").exists());
        assert!(hof.dir.join("fold_0").join("hof.bin").exists());
        assert_eq!(hof.properties.len(), Property::ALL.len());
        assert!(experiment.display_results().contains("test_hv"));
    }
}
