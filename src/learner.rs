use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::data::{Outcome, OutcomeKind};
use crate::error::{Error, Result};
use crate::mask::FeatureMask;
use crate::utils::{parse_arg, parse_nick};

const LBFGS_MEMORY: usize = 7;
const LBFGS_MAX_ITERATIONS: u64 = 200;

/// What a learner is fitted against, restricted to the samples of a fold
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    Classes { labels: Vec<usize>, n_classes: usize },
    Survival { duration: Vec<f64>, event: Vec<bool> },
}

impl Target {
    pub fn from_outcome(outcome: &Outcome, samples: &[usize]) -> Target {
        match outcome.subset(samples) {
            Outcome::Categorical { levels, labels, .. } => Target::Classes { labels, n_classes: levels.len() },
            Outcome::Survival { duration, event, .. } => Target::Survival { duration, event },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Target::Classes { labels, .. } => labels.len(),
            Target::Survival { duration, .. } => duration.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Target::Classes { .. } => OutcomeKind::Categorical,
            Target::Survival { .. } => OutcomeKind::Survival,
        }
    }

    pub fn subset(&self, samples: &[usize]) -> Target {
        match self {
            Target::Classes { labels, n_classes } => Target::Classes {
                labels: samples.iter().map(|i| labels[*i]).collect(),
                n_classes: *n_classes,
            },
            Target::Survival { duration, event } => Target::Survival {
                duration: samples.iter().map(|i| duration[*i]).collect(),
                event: samples.iter().map(|i| event[*i]).collect(),
            },
        }
    }
}

/// Learners selectable by nick
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Learner {
    NaiveBayes,
    Logistic { l2: f64 },
    Cox { l2: f64 },
}

impl Learner {
    /// `naive_bayes`, `logistic(l2)` or `cox(l2)`; the penalty is optional
    pub fn from_nick(nick: &str) -> Result<Learner> {
        let (name, args) = parse_nick(nick)?;
        let l2 = |default: f64| -> Result<f64> {
            if args.is_empty() { Ok(default) } else { parse_arg(nick, &args, 0) }
        };
        match name.as_str() {
            "naive_bayes" | "nb" | "gaussian_nb" => Ok(Learner::NaiveBayes),
            "logistic" | "lr" => Ok(Learner::Logistic { l2: l2(0.01)? }),
            "cox" | "coxph" => Ok(Learner::Cox { l2: l2(0.1)? }),
            _ => Err(Error::value(format!("unknown learner '{}'", nick))),
        }
    }

    pub fn nick(&self) -> String {
        match self {
            Learner::NaiveBayes => "naive_bayes".to_string(),
            Learner::Logistic { l2 } => format!("logistic({})", l2),
            Learner::Cox { l2 } => format!("cox({})", l2),
        }
    }

    pub fn target_kind(&self) -> OutcomeKind {
        match self {
            Learner::NaiveBayes | Learner::Logistic { .. } => OutcomeKind::Categorical,
            Learner::Cox { .. } => OutcomeKind::Survival,
        }
    }

    /// Fit on a sample-by-active-feature matrix. Fails with `DegenerateFit`
    /// when the data cannot support the model.
    pub fn fit(&self, x: &[Vec<f64>], y: &Target, sample_weight: Option<&[f64]>) -> Result<Predictor> {
        if x.len() != y.len() {
            return Err(Error::value(format!("{} rows of x for {} targets", x.len(), y.len())));
        }
        let weights: Vec<f64> = match sample_weight {
            Some(w) if w.len() == x.len() => w.to_vec(),
            Some(w) => return Err(Error::value(format!("{} sample weights for {} samples", w.len(), x.len()))),
            None => vec![1.0; x.len()],
        };
        let n_features = x.first().map(|r| r.len()).unwrap_or(0);
        if n_features == 0 {
            return Err(Error::degenerate("no feature selected"));
        }

        match (self, y) {
            (Learner::NaiveBayes, Target::Classes { labels, n_classes }) => fit_naive_bayes(x, labels, *n_classes, &weights),
            (Learner::Logistic { l2 }, Target::Classes { labels, n_classes }) => fit_logistic(x, labels, *n_classes, &weights, *l2),
            (Learner::Cox { l2 }, Target::Survival { duration, event }) => fit_cox(x, duration, event, &weights, *l2),
            _ => Err(Error::illegal(format!("learner {} cannot be fitted on a {:?} target", self.nick(), y.kind()))),
        }
    }

    /// Degenerate predictor used when the fit fails: class prior for
    /// categorical targets, constant risk for survival ones
    pub fn fallback(&self, x: &[Vec<f64>], y: &Target, sample_weight: Option<&[f64]>) -> Predictor {
        let n_features = x.first().map(|r| r.len()).unwrap_or(0);
        let weights: Vec<f64> = match sample_weight {
            Some(w) if w.len() == y.len() => w.to_vec(),
            _ => vec![1.0; y.len()],
        };
        match y {
            Target::Classes { labels, n_classes } => {
                let mut priors = vec![0.0; *n_classes];
                for (l, w) in labels.iter().zip(weights.iter()) {
                    priors[*l] += w;
                }
                let total: f64 = priors.iter().sum();
                if total > 0.0 {
                    priors.iter_mut().for_each(|p| *p /= total);
                } else if *n_classes > 0 {
                    priors = vec![1.0 / *n_classes as f64; *n_classes];
                }
                Predictor::ClassPrior { priors, n_features }
            }
            Target::Survival { duration, event } => {
                let eta = vec![0.0; duration.len()];
                let (times, cumhaz) = breslow_baseline(duration, event, &weights, &eta);
                Predictor::ConstantRisk { times, cumhaz, n_features }
            }
        }
    }

    pub fn fit_or_fallback(&self, x: &[Vec<f64>], y: &Target, sample_weight: Option<&[f64]>) -> Predictor {
        match self.fit(x, y, sample_weight) {
            Ok(predictor) => predictor,
            Err(e) => {
                debug!("{} failed ({}), using the degenerate predictor", self.nick(), e);
                self.fallback(x, y, sample_weight)
            }
        }
    }
}

/// Trained models, stored by value so they can be persisted with hall-of-fame snapshots
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Predictor {
    NaiveBayes {
        log_priors: Vec<f64>,
        means: Vec<Vec<f64>>,     // classes x features
        variances: Vec<Vec<f64>>,
    },
    Logistic {
        center: Vec<f64>,
        scale: Vec<f64>,
        weights: Vec<Vec<f64>>,   // classes x features, on standardised inputs
        intercepts: Vec<f64>,
    },
    Cox {
        center: Vec<f64>,
        scale: Vec<f64>,
        coef: Vec<f64>,           // on standardised inputs
        times: Vec<f64>,
        cumhaz: Vec<f64>,
    },
    ClassPrior { priors: Vec<f64>, n_features: usize },
    ConstantRisk { times: Vec<f64>, cumhaz: Vec<f64>, n_features: usize },
}

impl Predictor {
    pub fn n_features(&self) -> usize {
        match self {
            Predictor::NaiveBayes { means, .. } => means.first().map(|m| m.len()).unwrap_or(0),
            Predictor::Logistic { center, .. } | Predictor::Cox { center, .. } => center.len(),
            Predictor::ClassPrior { n_features, .. } | Predictor::ConstantRisk { n_features, .. } => *n_features,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, Predictor::ClassPrior { .. } | Predictor::ConstantRisk { .. })
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Predictor::NaiveBayes { .. } | Predictor::Logistic { .. } | Predictor::ClassPrior { .. } => OutcomeKind::Categorical,
            Predictor::Cox { .. } | Predictor::ConstantRisk { .. } => OutcomeKind::Survival,
        }
    }

    /// Class membership probabilities, one row per sample
    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        match self {
            Predictor::NaiveBayes { log_priors, means, variances } => Ok(x.iter()
                .map(|row| {
                    let scores: Vec<f64> = (0..log_priors.len())
                        .map(|c| {
                            if log_priors[c] == f64::NEG_INFINITY {
                                return f64::NEG_INFINITY;
                            }
                            log_priors[c] + row.iter().zip(means[c].iter().zip(variances[c].iter()))
                                .map(|(v, (m, var))| -0.5 * (2.0 * std::f64::consts::PI * var).ln() - (v - m).powi(2) / (2.0 * var))
                                .sum::<f64>()
                        })
                        .collect();
                    softmax(&scores)
                })
                .collect()),
            Predictor::Logistic { center, scale, weights, intercepts } => Ok(x.iter()
                .map(|row| {
                    let z = standardise(row, center, scale);
                    let scores: Vec<f64> = weights.iter().zip(intercepts.iter())
                        .map(|(w, b)| b + dot(w, &z))
                        .collect();
                    softmax(&scores)
                })
                .collect()),
            Predictor::ClassPrior { priors, .. } => Ok(vec![priors.clone(); x.len()]),
            _ => Err(Error::illegal("survival predictors have no class probabilities")),
        }
    }

    pub fn predict_classes(&self, x: &[Vec<f64>]) -> Result<Vec<usize>> {
        Ok(self.predict_proba(x)?.iter().map(|p| argmax(p)).collect())
    }

    /// Linear risk score, higher means earlier event
    pub fn predict_risk(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        match self {
            Predictor::Cox { center, scale, coef, .. } => Ok(x.iter().map(|row| dot(coef, &standardise(row, center, scale))).collect()),
            Predictor::ConstantRisk { .. } => Ok(vec![0.0; x.len()]),
            _ => Err(Error::illegal("classification predictors have no risk score")),
        }
    }

    /// S(t | x) for each sample and each requested time
    pub fn predict_survival_probabilities(&self, x: &[Vec<f64>], times: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (event_times, cumhaz) = match self {
            Predictor::Cox { times, cumhaz, .. } | Predictor::ConstantRisk { times, cumhaz, .. } => (times, cumhaz),
            _ => return Err(Error::illegal("classification predictors have no survival function")),
        };
        let risks = self.predict_risk(x)?;
        let baseline: Vec<f64> = times.iter()
            .map(|t| {
                let idx = event_times.partition_point(|et| et <= t);
                if idx == 0 { 0.0 } else { cumhaz[idx - 1] }
            })
            .collect();
        Ok(risks.iter().map(|r| baseline.iter().map(|h| (-h * r.exp()).exp()).collect()).collect())
    }

    /// Normalised importance of each active feature (sums to 1, uniform when
    /// the model carries no information)
    pub fn feature_importance(&self) -> Vec<f64> {
        let raw: Vec<f64> = match self {
            Predictor::NaiveBayes { log_priors, means, variances } => {
                let present: Vec<usize> = (0..log_priors.len()).filter(|c| log_priors[*c].is_finite()).collect();
                (0..self.n_features())
                    .map(|j| {
                        let mut best: f64 = 0.0;
                        for (a, ca) in present.iter().enumerate() {
                            for cb in present.iter().skip(a + 1) {
                                let pooled = ((variances[*ca][j] + variances[*cb][j]) / 2.0).sqrt();
                                best = best.max((means[*ca][j] - means[*cb][j]).abs() / pooled);
                            }
                        }
                        best
                    })
                    .collect()
            }
            Predictor::Logistic { weights, center, .. } => (0..center.len())
                .map(|j| weights.iter().map(|w| w[j].abs()).sum())
                .collect(),
            Predictor::Cox { coef, .. } => coef.iter().map(|c| c.abs()).collect(),
            Predictor::ClassPrior { n_features, .. } | Predictor::ConstantRisk { n_features, .. } => vec![0.0; *n_features],
        };
        normalise(raw)
    }

    /// Per-feature coefficients when the model is linear
    pub fn coef(&self) -> Option<Vec<f64>> {
        match self {
            Predictor::Logistic { weights, scale, .. } => {
                let last = weights.last()?;
                let first = weights.first()?;
                Some(last.iter().zip(first.iter()).zip(scale.iter()).map(|((l, f), s)| (l - f) / s).collect())
            }
            Predictor::Cox { coef, scale, .. } => Some(coef.iter().zip(scale.iter()).map(|(c, s)| c / s).collect()),
            _ => None,
        }
    }
}

/// A learner restricted to the features of a mask
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedLearner {
    pub mask: FeatureMask,
    pub learner: Learner,
}

impl MaskedLearner {
    pub fn new(mask: FeatureMask, learner: Learner) -> MaskedLearner {
        MaskedLearner { mask, learner }
    }

    /// Fit on full-width rows; never fails, degenerate data yields the fallback predictor
    pub fn fit(&self, x: &[Vec<f64>], y: &Target, sample_weight: Option<&[f64]>) -> MaskedPredictor {
        let projected = self.mask.apply(x);
        MaskedPredictor {
            mask: self.mask.clone(),
            predictor: self.learner.fit_or_fallback(&projected, y, sample_weight),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedPredictor {
    pub mask: FeatureMask,
    pub predictor: Predictor,
}

impl MaskedPredictor {
    pub fn new(mask: FeatureMask, predictor: Predictor) -> MaskedPredictor {
        MaskedPredictor { mask, predictor }
    }

    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.predictor.predict_proba(&self.mask.apply(x))
    }

    pub fn predict_classes(&self, x: &[Vec<f64>]) -> Result<Vec<usize>> {
        self.predictor.predict_classes(&self.mask.apply(x))
    }

    pub fn predict_risk(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        self.predictor.predict_risk(&self.mask.apply(x))
    }

    pub fn predict_survival_probabilities(&self, x: &[Vec<f64>], times: &[f64]) -> Result<Vec<Vec<f64>>> {
        self.predictor.predict_survival_probabilities(&self.mask.apply(x), times)
    }

    /// Importance lifted back to the full feature space
    pub fn feature_importance(&self) -> Vec<f64> {
        self.mask.apply_backward(&self.predictor.feature_importance())
    }
}

//-----------------------------------------------------------------------------
// Fits
//-----------------------------------------------------------------------------

fn fit_naive_bayes(x: &[Vec<f64>], labels: &[usize], n_classes: usize, weights: &[f64]) -> Result<Predictor> {
    let p = x[0].len();
    let mut counts = vec![0usize; n_classes];
    let mut class_weight = vec![0.0; n_classes];
    let mut means = vec![vec![0.0; p]; n_classes];
    for ((row, l), w) in x.iter().zip(labels).zip(weights) {
        counts[*l] += 1;
        class_weight[*l] += w;
        for (m, v) in means[*l].iter_mut().zip(row) {
            *m += w * v;
        }
    }
    check_classes(&counts)?;
    for c in 0..n_classes {
        if class_weight[c] > 0.0 {
            means[c].iter_mut().for_each(|m| *m /= class_weight[c]);
        }
    }

    let mut variances = vec![vec![0.0; p]; n_classes];
    for ((row, l), w) in x.iter().zip(labels).zip(weights) {
        for j in 0..p {
            variances[*l][j] += w * (row[j] - means[*l][j]).powi(2);
        }
    }
    for c in 0..n_classes {
        if class_weight[c] > 0.0 {
            variances[c].iter_mut().for_each(|v| *v /= class_weight[c]);
        }
    }

    let max_var = column_variances(x).into_iter().fold(0.0, f64::max);
    if max_var <= 0.0 {
        return Err(Error::degenerate("zero-variance columns"));
    }
    let epsilon = 1e-9 * max_var;
    variances.iter_mut().flatten().for_each(|v| *v += epsilon);

    let total: f64 = class_weight.iter().sum();
    let log_priors = class_weight.iter()
        .map(|w| if *w > 0.0 { (w / total).ln() } else { f64::NEG_INFINITY })
        .collect();

    Ok(Predictor::NaiveBayes { log_priors, means, variances })
}

fn fit_logistic(x: &[Vec<f64>], labels: &[usize], n_classes: usize, weights: &[f64], l2: f64) -> Result<Predictor> {
    let mut counts = vec![0usize; n_classes];
    labels.iter().for_each(|l| counts[*l] += 1);
    check_classes(&counts)?;

    let (center, scale) = standardisation(x);
    let z: Vec<Vec<f64>> = x.iter().map(|row| standardise(row, &center, &scale)).collect();
    let p = center.len();
    let loss = SoftmaxLoss { z: &z, labels, weights, n_classes, l2, total_weight: weights.iter().sum() };
    let solution = minimise(loss, vec![0.0; n_classes * (p + 1)], "logistic regression")?;

    let (w, b) = solution.split_at(n_classes * p);
    Ok(Predictor::Logistic { center, scale, weights: w.chunks(p).map(|c| c.to_vec()).collect(), intercepts: b.to_vec() })
}

fn fit_cox(x: &[Vec<f64>], duration: &[f64], event: &[bool], weights: &[f64], l2: f64) -> Result<Predictor> {
    if !event.iter().any(|e| *e) {
        return Err(Error::degenerate("no event in the training set"));
    }
    let (center, scale) = standardisation(x);
    let z: Vec<Vec<f64>> = x.iter().map(|row| standardise(row, &center, &scale)).collect();
    let p = center.len();

    let mut order: Vec<usize> = (0..duration.len()).collect();
    order.sort_by(|a, b| duration[*b].total_cmp(&duration[*a]));

    let loss = CoxLoss { z: &z, duration, event, weights, order: &order, l2 };
    let beta = minimise(loss, vec![0.0; p], "Cox regression")?;

    let eta: Vec<f64> = z.iter().map(|row| dot(&beta, row)).collect();
    let (times, cumhaz) = breslow_baseline(duration, event, weights, &eta);
    Ok(Predictor::Cox { center, scale, coef: beta, times, cumhaz })
}

/// Runs L-BFGS with a More-Thuente line search from `init`
///
/// # Arguments
///
/// * `problem` - Smooth cost and its gradient.
/// * `init` - Starting parameter.
/// * `what` - Model name used in the error messages.
///
/// # Returns
///
/// The best parameter found, or `DegenerateFit` when the solver fails or
/// ends on a non-finite cost.
pub(crate) fn minimise<O>(problem: O, init: Vec<f64>, what: &str) -> Result<Vec<f64>>
where
    O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    let solver = LBFGS::new(MoreThuenteLineSearch::new(), LBFGS_MEMORY);
    let result = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(LBFGS_MAX_ITERATIONS))
        .run()
        .map_err(|e| Error::degenerate(format!("{} failed: {}", what, e)))?;

    let state = result.state();
    let best = state.get_best_param()
        .ok_or_else(|| Error::degenerate(format!("{} returned no parameter", what)))?;
    if !state.get_best_cost().is_finite() || best.iter().any(|v| !v.is_finite()) {
        return Err(Error::degenerate(format!("{} did not converge", what)));
    }
    Ok(best.clone())
}

/// Weighted mean cross-entropy of a softmax model with a ridge penalty on
/// the class weights. The parameter holds the weights class by class, then
/// the intercepts.
struct SoftmaxLoss<'a> {
    z: &'a [Vec<f64>],
    labels: &'a [usize],
    weights: &'a [f64],
    n_classes: usize,
    l2: f64,
    total_weight: f64,
}

impl SoftmaxLoss<'_> {
    fn n_weights(&self) -> usize {
        self.n_classes * self.z.first().map_or(0, |r| r.len())
    }

    fn scores(&self, param: &[f64], row: &[f64]) -> Vec<f64> {
        let p = row.len();
        let (w, b) = param.split_at(self.n_weights());
        (0..self.n_classes).map(|c| b[c] + dot(&w[c * p..(c + 1) * p], row)).collect()
    }
}

impl CostFunction for SoftmaxLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let mut loss = 0.0;
        for ((row, l), sw) in self.z.iter().zip(self.labels).zip(self.weights) {
            let scores = self.scores(param, row);
            loss += sw * (log_sum_exp(&scores) - scores[*l]);
        }
        let penalty: f64 = param[..self.n_weights()].iter().map(|v| v * v).sum();
        Ok(loss / self.total_weight + 0.5 * self.l2 * penalty)
    }
}

impl Gradient for SoftmaxLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        let n_weights = self.n_weights();
        let mut grad = vec![0.0; param.len()];
        for ((row, l), sw) in self.z.iter().zip(self.labels).zip(self.weights) {
            let probs = softmax(&self.scores(param, row));
            let p = row.len();
            for c in 0..self.n_classes {
                let err = sw * (probs[c] - if c == *l { 1.0 } else { 0.0 }) / self.total_weight;
                grad[n_weights + c] += err;
                for j in 0..p {
                    grad[c * p + j] += err * row[j];
                }
            }
        }
        for (g, w) in grad.iter_mut().zip(param.iter()).take(n_weights) {
            *g += self.l2 * w;
        }
        Ok(grad)
    }
}

/// Negative penalised Breslow partial log-likelihood; `order` sorts the
/// samples by decreasing duration
struct CoxLoss<'a> {
    z: &'a [Vec<f64>],
    duration: &'a [f64],
    event: &'a [bool],
    weights: &'a [f64],
    order: &'a [usize],
    l2: f64,
}

impl CostFunction for CoxLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, beta: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok(-cox_penalised_loglik(self.z, self.duration, self.event, self.weights, self.order, beta, self.l2))
    }
}

impl Gradient for CoxLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, beta: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        let score = cox_score(self.z, self.duration, self.event, self.weights, self.order, beta, self.l2);
        Ok(score.into_iter().map(|g| -g).collect())
    }
}

/// Penalised Breslow partial log-likelihood
fn cox_penalised_loglik(z: &[Vec<f64>], duration: &[f64], event: &[bool], weights: &[f64], order: &[usize], beta: &[f64], l2: f64) -> f64 {
    let mut ll = 0.0;
    let mut s0 = 0.0;
    let mut k = 0;
    while k < order.len() {
        let t = duration[order[k]];
        let mut end = k;
        while end < order.len() && duration[order[end]] == t {
            s0 += weights[order[end]] * dot(beta, &z[order[end]]).exp();
            end += 1;
        }
        for i in &order[k..end] {
            if event[*i] {
                ll += weights[*i] * (dot(beta, &z[*i]) - s0.ln());
            }
        }
        k = end;
    }
    ll - 0.5 * l2 * beta.iter().map(|b| b * b).sum::<f64>()
}

/// Gradient of the penalised partial log-likelihood
fn cox_score(z: &[Vec<f64>], duration: &[f64], event: &[bool], weights: &[f64], order: &[usize], beta: &[f64], l2: f64) -> Vec<f64> {
    let p = beta.len();
    let mut grad = vec![0.0; p];
    let mut s0 = 0.0;
    let mut s1 = vec![0.0; p];

    let mut k = 0;
    while k < order.len() {
        let t = duration[order[k]];
        let mut end = k;
        while end < order.len() && duration[order[end]] == t {
            let i = order[end];
            let r = weights[i] * dot(beta, &z[i]).exp();
            s0 += r;
            for a in 0..p {
                s1[a] += r * z[i][a];
            }
            end += 1;
        }
        for i in order[k..end].iter().filter(|i| event[**i]) {
            for a in 0..p {
                grad[a] += weights[*i] * (z[*i][a] - s1[a] / s0);
            }
        }
        k = end;
    }

    for a in 0..p {
        grad[a] -= l2 * beta[a];
    }
    grad
}

/// Breslow estimator of the cumulative baseline hazard at each distinct event time
fn breslow_baseline(duration: &[f64], event: &[bool], weights: &[f64], eta: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut event_times: Vec<f64> = duration.iter().zip(event).filter(|(_, e)| **e).map(|(d, _)| *d).collect();
    event_times.sort_by(|a, b| a.total_cmp(b));
    event_times.dedup();

    let mut cumhaz = Vec::with_capacity(event_times.len());
    let mut acc = 0.0;
    for t in &event_times {
        let deaths: f64 = (0..duration.len()).filter(|i| event[*i] && duration[*i] == *t).map(|i| weights[i]).sum();
        let at_risk: f64 = (0..duration.len()).filter(|i| duration[*i] >= *t).map(|i| weights[i] * eta[i].exp()).sum();
        if at_risk > 0.0 {
            acc += deaths / at_risk;
        }
        cumhaz.push(acc);
    }
    (event_times, cumhaz)
}

/// Score test statistic of a univariate Cox model at beta = 0, per column.
/// Used to weight feature sampling when initialising populations.
pub fn univariate_cox_scores(x: &[Vec<f64>], duration: &[f64], event: &[bool]) -> Vec<f64> {
    let p = x.first().map(|r| r.len()).unwrap_or(0);
    let mut order: Vec<usize> = (0..duration.len()).collect();
    order.sort_by(|a, b| duration[*b].total_cmp(&duration[*a]));

    (0..p)
        .map(|j| {
            let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
            let (mut u, mut info) = (0.0, 0.0);
            let mut k = 0;
            while k < order.len() {
                let t = duration[order[k]];
                let mut end = k;
                while end < order.len() && duration[order[end]] == t {
                    let v = x[order[end]][j];
                    s0 += 1.0;
                    s1 += v;
                    s2 += v * v;
                    end += 1;
                }
                for i in &order[k..end] {
                    if event[*i] {
                        let mean = s1 / s0;
                        u += x[*i][j] - mean;
                        info += s2 / s0 - mean * mean;
                    }
                }
                k = end;
            }
            if info > 1e-12 { u * u / info } else { 0.0 }
        })
        .collect()
}

//-----------------------------------------------------------------------------
// Linear algebra helpers
//-----------------------------------------------------------------------------

fn check_classes(counts: &[usize]) -> Result<()> {
    let present = counts.iter().filter(|c| **c > 0).count();
    if present < 2 {
        return Err(Error::degenerate("fewer than two classes in the training set"));
    }
    if counts.iter().any(|c| *c == 1) {
        return Err(Error::degenerate("singleton class"));
    }
    Ok(())
}

fn column_variances(x: &[Vec<f64>]) -> Vec<f64> {
    let (center, _) = standardisation(x);
    let n = x.len() as f64;
    (0..center.len())
        .map(|j| x.iter().map(|row| (row[j] - center[j]).powi(2)).sum::<f64>() / n)
        .collect()
}

/// Column means and standard deviations (1 for constant columns)
fn standardisation(x: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let p = x.first().map(|r| r.len()).unwrap_or(0);
    let n = x.len().max(1) as f64;
    let center: Vec<f64> = (0..p).map(|j| x.iter().map(|row| row[j]).sum::<f64>() / n).collect();
    let scale = (0..p)
        .map(|j| {
            let sd = (x.iter().map(|row| (row[j] - center[j]).powi(2)).sum::<f64>() / n).sqrt();
            if sd > 1e-12 { sd } else { 1.0 }
        })
        .collect();
    (center, scale)
}

fn standardise(row: &[f64], center: &[f64], scale: &[f64]) -> Vec<f64> {
    row.iter().zip(center.iter().zip(scale.iter())).map(|(v, (c, s))| (v - c) / s).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn log_sum_exp(scores: &[f64]) -> f64 {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + scores.iter().map(|s| (s - max).exp()).sum::<f64>().ln()
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn argmax(values: &[f64]) -> usize {
    values.iter().enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, v)| if *v > bv { (i, *v) } else { (bi, bv) })
        .0
}

fn normalise(raw: Vec<f64>) -> Vec<f64> {
    let total: f64 = raw.iter().filter(|v| v.is_finite()).sum();
    if total > 0.0 {
        raw.into_iter().map(|v| if v.is_finite() { v / total } else { 0.0 }).collect()
    } else if raw.is_empty() {
        raw
    } else {
        let n = raw.len() as f64;
        vec![1.0 / n; raw.len()]
    }
}
