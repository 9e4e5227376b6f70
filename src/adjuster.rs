use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cv::{stratified_k_fold, ClassAssigner};
use crate::data::Data;
use crate::error::{Error, Result};
use crate::evaluator::{score, Evaluator};
use crate::ga::MaskSampler;
use crate::mask::FeatureMask;
use crate::objective::Objective;
use crate::param::Param;
use crate::regressor::{Regressor, RegressorKind};
use crate::utils::derive_seed;

const STREAM_SPLIT: u64 = 1;
const STREAM_MASKS: u64 = 2;
const STREAM_INNER_FOLDS: u64 = 3;
const STREAM_EVALUATION: u64 = 4;
const STREAM_REGRESSORS: u64 = 100;

/// Removes the optimistic bias of inner-CV fitness values.
///
/// One regressor per objective learns `inner - holdout` from
/// `(inner, std_dev, k, bootstrap_mean)`; the adjusted value is
/// `clamp(inner - prediction, 0, 1)`. Structural objectives keep `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitnessAdjuster {
    pub kind: RegressorKind,
    regressors: Vec<Option<Regressor>>,
}

impl FitnessAdjuster {
    /// Identity adjuster (after clamping) for `n_objectives` objectives
    pub fn zero(n_objectives: usize) -> FitnessAdjuster {
        FitnessAdjuster { kind: RegressorKind::Zero, regressors: vec![None; n_objectives] }
    }

    pub fn nick(&self) -> String {
        self.kind.nick()
    }

    pub fn set_regressor(&mut self, objective: usize, regressor: Regressor) {
        if objective >= self.regressors.len() {
            self.regressors.resize(objective + 1, None);
        }
        self.regressors[objective] = Some(regressor);
    }

    pub fn regressor(&self, objective: usize) -> Option<&Regressor> {
        self.regressors.get(objective).and_then(|r| r.as_ref())
    }

    /// Adjusted fitness of objective `objective`. Non-finite values (invalid
    /// records) pass through untouched.
    pub fn adjust(&self, objective: usize, original: f64, std_dev: f64, k: usize, bootstrap_mean: f64) -> f64 {
        if !original.is_finite() {
            return original;
        }
        let bias = match self.regressor(objective) {
            Some(regressor) => regressor.predict(&[original, std_dev, k as f64, bootstrap_mean]),
            None => 0.0,
        };
        let bias = if bias.is_finite() { bias } else { 0.0 };
        (original - bias).clamp(0.0, 1.0)
    }

    /// Learns the bias of the inner-CV estimate on the outer training set `data`.
    ///
    /// # Arguments
    ///
    /// * `kind` - Regressor family used for every predictive objective.
    /// * `objectives` - Objectives of the optimisation.
    /// * `data` - The outer training set.
    /// * `sampler` - Initial-features distribution the random masks are drawn from.
    /// * `param` - Run parameters (inner folds, bootstrap, adjuster section).
    /// * `seed` - Seed of the adjuster phase.
    ///
    /// # Returns
    ///
    /// An adjuster with one regressor per predictive objective. The zero
    /// regressor short-circuits the whole procedure.
    pub fn train(kind: &RegressorKind, objectives: &[Objective], data: &Data, sampler: &MaskSampler, param: &Param, seed: u64) -> Result<FitnessAdjuster> {
        let m = objectives.len();
        if *kind == RegressorKind::Zero {
            return Ok(FitnessAdjuster::zero(m));
        }

        let assigner = ClassAssigner::new(param.cv.min_stratum_size, param.cv.survival_quantiles);
        let mut split_rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, STREAM_SPLIT));
        let (fit_samples, holdout) = stratified_holdout(data, &assigner, param.adjuster.holdout_ratio, &mut split_rng)?;
        let fit_data = Arc::new(data.subset(&fit_samples));

        let mut fold_rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, STREAM_INNER_FOLDS));
        let inner = stratified_k_fold(&fit_data, param.cv.inner_folds, 1, &assigner, &mut fold_rng)?;
        let evaluator = Evaluator::new(objectives.to_vec(), fit_data.clone(), inner, param.model.bootstrap_b, derive_seed(seed, STREAM_EVALUATION))?;

        let mut mask_rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, STREAM_MASKS));
        let masks: Vec<FeatureMask> = (0..param.adjuster.sample_size).map(|_| sampler.sample(&mut mask_rng)).collect();
        info!("Training the {} adjuster on {} masks ({} fit / {} holdout samples)", kind.nick(), masks.len(), fit_samples.len(), holdout.len());

        let fit_all: Vec<usize> = (0..fit_data.sample_len).collect();
        let rows = masks.par_iter()
            .map(|mask| -> Result<Option<(Vec<Vec<f64>>, Vec<f64>)>> {
                let record = evaluator.evaluate(mask)?;
                if !record.valid {
                    return Ok(None);
                }
                let held_out = score(objectives, &record.predictors, mask, data, &holdout, Some((fit_data.as_ref(), fit_all.as_slice())))?;
                let features = (0..m)
                    .map(|o| vec![record.inner_fitness[o], record.std_dev[o], mask.count() as f64, record.bootstrap_mean[o]])
                    .collect();
                let targets = (0..m).map(|o| record.inner_fitness[o] - held_out[o]).collect();
                Ok(Some((features, targets)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut adjuster = FitnessAdjuster { kind: kind.clone(), regressors: vec![None; m] };
        for (o, objective) in objectives.iter().enumerate() {
            if !objective.requires_predictions() {
                continue;
            }
            let (x, y): (Vec<Vec<f64>>, Vec<f64>) = rows.iter()
                .flatten()
                .filter(|(_, targets)| targets[o].is_finite())
                .map(|(features, targets)| (features[o].clone(), targets[o]))
                .unzip();
            if y.is_empty() {
                warn!("No usable mask to train the adjuster of {}, keeping it unadjusted", objective.nick);
                continue;
            }
            let regressor = kind.fit_or_median(&x, &y, derive_seed(seed, STREAM_REGRESSORS + o as u64));
            debug!("Adjuster of {} trained on {} masks (mean bias {:.4})", objective.nick, y.len(), y.iter().sum::<f64>() / y.len() as f64);
            adjuster.set_regressor(o, regressor);
        }
        Ok(adjuster)
    }
}

/// Stratified split of every sample of `data` into (fit, holdout) index lists.
/// Each stratum gives `round(ratio * size)` samples to the holdout, keeping
/// at least one sample on each side when the stratum allows it.
fn stratified_holdout(data: &Data, assigner: &ClassAssigner, ratio: f64, rng: &mut ChaCha8Rng) -> Result<(Vec<usize>, Vec<usize>)> {
    let all: Vec<usize> = (0..data.sample_len).collect();
    let labels = assigner.assign(&data.outcomes, &all);
    let mut strata: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (s, l) in labels.iter().enumerate() {
        strata.entry(*l).or_default().push(s);
    }

    let mut fit = Vec::new();
    let mut holdout = Vec::new();
    for members in strata.values_mut() {
        members.shuffle(rng);
        let mut n = (ratio * members.len() as f64).round() as usize;
        if members.len() > 1 {
            n = n.clamp(1, members.len() - 1);
        }
        holdout.extend_from_slice(&members[..n]);
        fit.extend_from_slice(&members[n..]);
    }
    if fit.is_empty() || holdout.is_empty() {
        return Err(Error::value(format!("cannot split {} samples for the adjuster with ratio {}", data.sample_len, ratio)));
    }
    fit.sort_unstable();
    holdout.sort_unstable();
    Ok((fit, holdout))
}
