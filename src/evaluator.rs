use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adjuster::FitnessAdjuster;
use crate::cv::Folds;
use crate::data::Data;
use crate::error::{Error, Result};
use crate::learner::{MaskedPredictor, Predictor, Target};
use crate::mask::FeatureMask;
use crate::objective::{CvResult, Objective};
use crate::utils::{bootstrap_mean, derive_seed, RunningStats};

/// Aggregated inner-CV outcome of one mask
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub fitness: Vec<f64>,
    pub inner_fitness: Vec<f64>,
    pub std_dev: Vec<f64>,
    pub ci95: Vec<(f64, f64)>,
    pub bootstrap_mean: Vec<f64>,
    pub fold_fitness: Vec<Vec<f64>>,
    pub predictors: Vec<Option<MaskedPredictor>>,
    pub importance: Option<Vec<f64>>,
    pub valid: bool,
}

impl EvaluationRecord {
    /// Record of a mask that cannot be evaluated: sentinel fitness, never promoted
    pub fn invalid(n_objectives: usize) -> EvaluationRecord {
        EvaluationRecord {
            fitness: vec![f64::NEG_INFINITY; n_objectives],
            inner_fitness: vec![f64::NEG_INFINITY; n_objectives],
            std_dev: vec![0.0; n_objectives],
            ci95: vec![(f64::NEG_INFINITY, f64::NEG_INFINITY); n_objectives],
            bootstrap_mean: vec![f64::NEG_INFINITY; n_objectives],
            fold_fitness: vec![Vec::new(); n_objectives],
            predictors: vec![None; n_objectives],
            importance: None,
            valid: false,
        }
    }
}

/// Runs the inner cross-validation of a mask over a fixed training set.
/// Shared read-only by all pool workers.
#[derive(Debug)]
pub struct Evaluator {
    objectives: Vec<Objective>,
    data: Arc<Data>,
    folds: Folds,
    targets: Vec<Option<Target>>,
    bootstrap_b: usize,
    seed: u64,
    adjuster: FitnessAdjuster,
}

impl Evaluator {
    pub fn new(objectives: Vec<Objective>, data: Arc<Data>, folds: Folds, bootstrap_b: usize, seed: u64) -> Result<Evaluator> {
        if folds.len() < 2 {
            return Err(Error::value(format!("inner cross-validation needs at least 2 folds, got {}", folds.len())));
        }
        folds.check_bounds(data.sample_len)?;
        let all: Vec<usize> = (0..data.sample_len).collect();
        let targets = objectives.iter()
            .map(|o| if o.requires_predictions() { o.target(&data, &all).map(Some) } else { Ok(None) })
            .collect::<Result<Vec<_>>>()?;
        let n = objectives.len();
        Ok(Evaluator { objectives, data, folds, targets, bootstrap_b, seed, adjuster: FitnessAdjuster::zero(n) })
    }

    pub fn with_adjuster(mut self, adjuster: FitnessAdjuster) -> Evaluator {
        self.adjuster = adjuster;
        self
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn data(&self) -> &Arc<Data> {
        &self.data
    }

    pub fn folds(&self) -> &Folds {
        &self.folds
    }

    pub fn adjuster(&self) -> &FitnessAdjuster {
        &self.adjuster
    }

    pub fn n_features(&self) -> usize {
        self.data.feature_len
    }

    pub fn evaluate(&self, mask: &FeatureMask) -> Result<EvaluationRecord> {
        let m = self.objectives.len();
        if mask.len() != self.data.feature_len {
            return Err(Error::value(format!("mask over {} features for a dataset of {}", mask.len(), self.data.feature_len)));
        }
        if mask.is_empty() && self.objectives.iter().any(|o| o.requires_predictions()) {
            return Ok(EvaluationRecord::invalid(m));
        }

        let mut fold_fitness: Vec<Vec<f64>> = vec![Vec::with_capacity(self.folds.len()); m];
        for i in 0..self.folds.len() {
            let train = self.folds.train(i);
            let test = self.folds.test(i);
            let x_train = self.data.project(mask, &train);
            let x_test = self.data.project(mask, test);
            let mut fitted: Vec<(String, Option<Predictor>)> = Vec::new();

            for (o, objective) in self.objectives.iter().enumerate() {
                let value = match (&objective.learner, &self.targets[o]) {
                    (Some(learner), Some(target)) => {
                        let y_train = target.subset(&train);
                        let y_test = target.subset(test);
                        let key = fit_key(objective);
                        let predictor = match fitted.iter().find(|(k, _)| *k == key) {
                            Some((_, p)) => p.clone(),
                            None => {
                                let p = match learner.fit(&x_train, &y_train, None) {
                                    Ok(p) => Some(p),
                                    Err(Error::DegenerateFit(reason)) => {
                                        debug!("fold {} of {:?}: {}", i, mask, reason);
                                        None
                                    }
                                    Err(e) => return Err(e),
                                };
                                fitted.push((key, p.clone()));
                                p
                            }
                        };
                        match predictor {
                            None => f64::NAN,
                            Some(p) => {
                                let train_view = if objective.requires_training_predictions() {
                                    Some((x_train.as_slice(), &y_train))
                                } else {
                                    None
                                };
                                nan_on_degenerate(objective.compute_predictive(&p, &x_test, &y_test, train_view))?
                            }
                        }
                    }
                    _ => objective.compute_structural(mask)?.fitness,
                };
                fold_fitness[o].push(value);
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(self.seed, mask.stable_hash()));
        let mut inner_fitness = Vec::with_capacity(m);
        let mut std_dev = Vec::with_capacity(m);
        let mut ci95 = Vec::with_capacity(m);
        let mut boot = Vec::with_capacity(m);
        for values in &fold_fitness {
            let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
            if valid.len() < 2 {
                let mut record = EvaluationRecord::invalid(m);
                record.fold_fitness = fold_fitness;
                return Ok(record);
            }
            let mut stats = RunningStats::new();
            valid.iter().for_each(|v| stats.push(*v));
            inner_fitness.push(stats.mean());
            std_dev.push(stats.std_dev());
            ci95.push(stats.t_interval(0.95));
            boot.push(bootstrap_mean(&valid, self.bootstrap_b, &mut rng));
        }

        let k = mask.count();
        let fitness: Vec<f64> = (0..m)
            .map(|o| {
                if self.objectives[o].requires_predictions() {
                    self.adjuster.adjust(o, inner_fitness[o], std_dev[o], k, boot[o])
                } else {
                    inner_fitness[o]
                }
            })
            .collect();

        let predictors = self.fit_complete(mask);
        let importance = personalised_importance(&predictors);

        Ok(EvaluationRecord {
            fitness,
            inner_fitness,
            std_dev,
            ci95,
            bootstrap_mean: boot,
            fold_fitness,
            predictors,
            importance,
            valid: true,
        })
    }

    /// One predictor per predictive objective, trained on the complete training set
    pub fn fit_complete(&self, mask: &FeatureMask) -> Vec<Option<MaskedPredictor>> {
        let x = self.data.project_all(mask);
        let mut fitted: Vec<(String, MaskedPredictor)> = Vec::new();
        self.objectives.iter().zip(self.targets.iter())
            .map(|(objective, target)| match (&objective.learner, target) {
                (Some(learner), Some(target)) => {
                    let key = fit_key(objective);
                    if let Some((_, p)) = fitted.iter().find(|(k, _)| *k == key) {
                        return Some(p.clone());
                    }
                    let p = MaskedPredictor::new(mask.clone(), learner.fit_or_fallback(&x, target, None));
                    fitted.push((key, p.clone()));
                    Some(p)
                }
                _ => None,
            })
            .collect()
    }
}

fn fit_key(objective: &Objective) -> String {
    format!("{}|{}",
        objective.learner.as_ref().map(|l| l.nick()).unwrap_or_default(),
        objective.outcome.as_deref().unwrap_or(""))
}

fn nan_on_degenerate(result: Result<CvResult>) -> Result<f64> {
    match result {
        Ok(r) => Ok(r.fitness),
        Err(Error::DegenerateFit(_)) => Ok(f64::NAN),
        Err(e) => Err(e),
    }
}

/// Mean of the active-feature importances of the distinct predictors
fn personalised_importance(predictors: &[Option<MaskedPredictor>]) -> Option<Vec<f64>> {
    let mut distinct: Vec<&MaskedPredictor> = Vec::new();
    for p in predictors.iter().flatten() {
        if !distinct.iter().any(|d| *d == p) {
            distinct.push(p);
        }
    }
    let first = distinct.first()?.predictor.feature_importance();
    let mut acc = first;
    for p in distinct.iter().skip(1) {
        for (a, v) in acc.iter_mut().zip(p.predictor.feature_importance()) {
            *a += v;
        }
    }
    let n = distinct.len() as f64;
    Some(acc.into_iter().map(|v| v / n).collect())
}

/// Fitness of trained predictors on some samples of another dataset (outer
/// test fold or external cohort). `train` gives the samples the predictors
/// were trained on, needed by objectives scoring training predictions.
/// Degenerate computations score NaN.
pub fn score(objectives: &[Objective], predictors: &[Option<MaskedPredictor>], mask: &FeatureMask,
    data: &Data, samples: &[usize], train: Option<(&Data, &[usize])>) -> Result<Vec<f64>> {
    let x_test: Vec<Vec<f64>> = samples.iter().map(|i| data.x[*i].clone()).collect();
    objectives.iter().zip(predictors.iter())
        .map(|(objective, predictor)| {
            if !objective.requires_predictions() {
                return Ok(objective.compute_structural(mask)?.fitness);
            }
            let Some(predictor) = predictor else { return Ok(f64::NAN) };
            let y_test = objective.target(data, samples)?;
            let projected_test = predictor.mask.apply(&x_test);
            let train_view = match train {
                Some((train_data, train_samples)) if objective.requires_training_predictions() => {
                    let x: Vec<Vec<f64>> = train_samples.iter().map(|i| predictor.mask.apply_row(&train_data.x[*i])).collect();
                    Some((x, objective.target(train_data, train_samples)?))
                }
                _ => None,
            };
            nan_on_degenerate(objective.compute_predictive(
                &predictor.predictor,
                &projected_test,
                &y_test,
                train_view.as_ref().map(|(x, y)| (x.as_slice(), y)),
            ))
        })
        .collect()
}

#[cfg(test)]
impl Evaluator {
    /// Balanced accuracy (naive Bayes) and leanness over the toy dataset, 3 inner folds
    pub fn test() -> Evaluator {
        let data = Data::test();
        let objectives = Objective::test_pair(&data);
        let folds = Folds::new(vec![vec![0, 1, 5, 6], vec![2, 3, 7, 8], vec![4, 9]]).unwrap();
        Evaluator::new(objectives, Arc::new(data), folds, 200, 42).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjuster::FitnessAdjuster;
    use crate::objective::{Computer, ObjectiveDefaults};
    use crate::regressor::Regressor;

    #[test]
    fn test_evaluate_informative_mask() {
        let evaluator = Evaluator::test();
        let record = evaluator.evaluate(&FeatureMask::from_positions(4, &[0, 1])).unwrap();
        assert!(record.valid);
        assert_eq!(record.fitness.len(), 2);
        assert_eq!(record.fitness[0], 1.0);
        assert_eq!(record.fitness[1], 0.5);
        assert_eq!(record.fold_fitness[0].len(), 3);
        for o in 0..2 {
            assert!(record.std_dev[o] >= 0.0);
            assert!(record.ci95[o].0 <= record.inner_fitness[o] && record.inner_fitness[o] <= record.ci95[o].1);
        }
        assert!(record.predictors[0].is_some());
        assert!(record.predictors[1].is_none());
        let importance = record.importance.unwrap();
        assert_eq!(importance.len(), 2);
        assert!((importance.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_mask_is_invalid() {
        let record = Evaluator::test().evaluate(&FeatureMask::empty(4)).unwrap();
        assert!(!record.valid);
        assert!(record.fitness.iter().all(|f| *f == f64::NEG_INFINITY));
    }

    #[test]
    fn test_structural_only_objectives_accept_empty_mask() {
        let data = Data::test();
        let objectives = vec![Objective::structural(Computer::Leanness)];
        let folds = Folds::new(vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]).unwrap();
        let evaluator = Evaluator::new(objectives, Arc::new(data), folds, 200, 1).unwrap();
        let record = evaluator.evaluate(&FeatureMask::empty(4)).unwrap();
        assert!(record.valid);
        assert_eq!(record.fitness, vec![1.0]);
        assert_eq!(record.std_dev, vec![0.0]);
        assert_eq!(record.ci95, vec![(1.0, 1.0)]);
    }

    #[test]
    fn test_single_fold_is_rejected() {
        let data = Data::test();
        let objectives = Objective::test_pair(&data);
        let folds = Folds::new(vec![(0..10).collect()]).unwrap();
        assert!(matches!(Evaluator::new(objectives, Arc::new(data), folds, 200, 1), Err(Error::Value(_))));
    }

    #[test]
    fn test_too_many_failed_folds_make_the_record_invalid() {
        // each training set misses one class entirely: every fit is degenerate
        let data = Data::test();
        let objectives = Objective::test_pair(&data);
        let folds = Folds::new(vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]).unwrap();
        let evaluator = Evaluator::new(objectives, Arc::new(data), folds, 200, 1).unwrap();
        let record = evaluator.evaluate(&FeatureMask::from_positions(4, &[0])).unwrap();
        assert!(!record.valid);
        assert!(record.fold_fitness[0].iter().all(|v| v.is_nan()));
        assert_eq!(record.fitness[0], f64::NEG_INFINITY);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let evaluator = Evaluator::test();
        let mask = FeatureMask::from_positions(4, &[0, 2, 3]);
        assert_eq!(evaluator.evaluate(&mask).unwrap(), evaluator.evaluate(&mask).unwrap());
    }

    #[test]
    fn test_adjuster_is_applied_to_predictive_objectives_only() {
        let mut adjuster = FitnessAdjuster::zero(2);
        adjuster.set_regressor(0, Regressor::Median { value: 0.25 });
        adjuster.set_regressor(1, Regressor::Median { value: 0.25 });
        let evaluator = Evaluator::test().with_adjuster(adjuster);
        let record = evaluator.evaluate(&FeatureMask::from_positions(4, &[0, 1])).unwrap();
        assert_eq!(record.inner_fitness[0], 1.0);
        assert_eq!(record.fitness[0], 0.75);
        assert_eq!(record.fitness[1], 0.5, "leanness is never adjusted");
    }

    #[test]
    fn test_score_on_held_out_samples() {
        let evaluator = Evaluator::test();
        let mask = FeatureMask::from_positions(4, &[0]);
        let predictors = evaluator.fit_complete(&mask);
        let data = Data::test();
        let scores = score(evaluator.objectives(), &predictors, &mask, &data, &[0, 4, 5, 9], None).unwrap();
        assert_eq!(scores, vec![1.0, 0.75]);
        let defaults = ObjectiveDefaults::default();
        let consistency = vec![Objective::from_nick("consistency", &defaults, &data).unwrap()];
        let all: Vec<usize> = (0..10).collect();
        let scores = score(&consistency, &predictors[..1], &mask, &data, &[0, 9], Some((&data, all.as_slice()))).unwrap();
        assert_eq!(scores, vec![1.0]);
    }
}
