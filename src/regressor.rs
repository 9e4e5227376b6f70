use argmin::core::{CostFunction, Error as ArgminError, Gradient};
use log::debug;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::learner::minimise;
use crate::utils::{derive_seed, median, parse_arg, parse_nick};

/// Regressor families selectable by nick
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegressorKind {
    Zero,
    Median,
    DecisionTree { max_depth: usize, min_leaf: usize },
    RandomForest { n_trees: usize, max_depth: usize, min_leaf: usize },
    Svr { c: f64, epsilon: f64 },
    RandomisedSvr { candidates: usize },
}

impl RegressorKind {
    /// `zero`, `median`, `tree(max_depth, min_leaf)`, `forest(n_trees, max_depth, min_leaf)`,
    /// `svr(c, epsilon)`, `random_svr(candidates)`; arguments are optional
    pub fn from_nick(nick: &str) -> Result<RegressorKind> {
        let (name, args) = parse_nick(nick)?;
        let arg_or = |idx: usize, default: f64| -> Result<f64> {
            if args.len() > idx { parse_arg(nick, &args, idx) } else { Ok(default) }
        };
        let kind = match name.as_str() {
            "zero" | "none" => RegressorKind::Zero,
            "median" => RegressorKind::Median,
            "tree" | "decision_tree" => RegressorKind::DecisionTree {
                max_depth: arg_or(0, 3.0)? as usize,
                min_leaf: arg_or(1, 5.0)? as usize,
            },
            "forest" | "random_forest" => RegressorKind::RandomForest {
                n_trees: arg_or(0, 50.0)? as usize,
                max_depth: arg_or(1, 4.0)? as usize,
                min_leaf: arg_or(2, 3.0)? as usize,
            },
            "svr" => RegressorKind::Svr { c: arg_or(0, 1.0)?, epsilon: arg_or(1, 0.01)? },
            "random_svr" | "randomised_svr" => RegressorKind::RandomisedSvr { candidates: arg_or(0, 20.0)? as usize },
            _ => return Err(Error::value(format!("unknown adjuster regressor '{}'", nick))),
        };
        Ok(kind)
    }

    pub fn nick(&self) -> String {
        match self {
            RegressorKind::Zero => "zero".to_string(),
            RegressorKind::Median => "median".to_string(),
            RegressorKind::DecisionTree { max_depth, min_leaf } => format!("tree{}x{}", max_depth, min_leaf),
            RegressorKind::RandomForest { n_trees, max_depth, min_leaf } => format!("forest{}x{}x{}", n_trees, max_depth, min_leaf),
            RegressorKind::Svr { c, epsilon } => format!("svr{}x{}", c, epsilon),
            RegressorKind::RandomisedSvr { candidates } => format!("rsvr{}", candidates),
        }
    }

    pub fn fit(&self, x: &[Vec<f64>], y: &[f64], seed: u64) -> Result<Regressor> {
        if x.len() != y.len() {
            return Err(Error::value(format!("{} rows for {} targets", x.len(), y.len())));
        }
        if matches!(self, RegressorKind::Zero) {
            return Ok(Regressor::Zero);
        }
        if y.is_empty() {
            return Err(Error::degenerate("no sample to fit the regressor"));
        }
        match self {
            RegressorKind::Zero => Ok(Regressor::Zero),
            RegressorKind::Median => Ok(Regressor::Median { value: median(&mut y.to_vec()) }),
            RegressorKind::DecisionTree { max_depth, min_leaf } => {
                let all: Vec<usize> = (0..y.len()).collect();
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let p = x[0].len();
                Ok(Regressor::Tree { root: grow(x, y, &all, *max_depth, (*min_leaf).max(1), p, &mut rng) })
            }
            RegressorKind::RandomForest { n_trees, max_depth, min_leaf } => {
                let p = x[0].len();
                let max_features = ((p as f64) / 3.0).ceil().max(1.0) as usize;
                let trees: Vec<Node> = (0..(*n_trees).max(1))
                    .into_par_iter()
                    .map(|t| {
                        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, t as u64));
                        let sample: Vec<usize> = (0..y.len()).map(|_| rng.gen_range(0..y.len())).collect();
                        grow(x, y, &sample, *max_depth, (*min_leaf).max(1), max_features, &mut rng)
                    })
                    .collect();
                Ok(Regressor::Forest { trees })
            }
            RegressorKind::Svr { c, epsilon } => fit_svr(x, y, *c, *epsilon),
            RegressorKind::RandomisedSvr { candidates } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut best: Option<(f64, f64, f64)> = None;
                for _ in 0..(*candidates).max(1) {
                    let c = 10f64.powf(rng.gen_range(-2.0..2.0));
                    let epsilon = 10f64.powf(rng.gen_range(-3.0..-1.0));
                    let error = match svr_cv_error(x, y, c, epsilon) {
                        Ok(error) => error,
                        Err(e) => {
                            debug!("SVR candidate C={:.4} epsilon={:.4} skipped: {}", c, epsilon, e);
                            continue;
                        }
                    };
                    if best.map_or(true, |(e, _, _)| error < e) {
                        best = Some((error, c, epsilon));
                    }
                }
                let (error, c, epsilon) = best.unwrap_or((f64::NAN, 1.0, 0.01));
                debug!("Randomised SVR picked C={:.4} epsilon={:.4} (cv MAE {:.4})", c, epsilon, error);
                fit_svr(x, y, c, epsilon)
            }
        }
    }

    /// Fit, or the median regressor when the data cannot support the model
    pub fn fit_or_median(&self, x: &[Vec<f64>], y: &[f64], seed: u64) -> Regressor {
        match self.fit(x, y, seed) {
            Ok(r) => r,
            Err(e) => {
                debug!("{} failed ({}), using the median regressor", self.nick(), e);
                if y.is_empty() {
                    Regressor::Zero
                } else {
                    Regressor::Median { value: median(&mut y.to_vec()) }
                }
            }
        }
    }
}

/// A node of a regression tree, leaves hold the median of their samples
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf { value: f64 },
    Split { feature: usize, threshold: f64, left: Box<Node>, right: Box<Node> },
}

impl Node {
    fn predict(&self, x: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    node = if x[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Regressor {
    Zero,
    Median { value: f64 },
    Tree { root: Node },
    Forest { trees: Vec<Node> },
    Svr { center: Vec<f64>, scale: Vec<f64>, weights: Vec<f64>, bias: f64 },
}

impl Regressor {
    pub fn predict(&self, x: &[f64]) -> f64 {
        match self {
            Regressor::Zero => 0.0,
            Regressor::Median { value } => *value,
            Regressor::Tree { root } => root.predict(x),
            Regressor::Forest { trees } => {
                if trees.is_empty() {
                    0.0
                } else {
                    trees.iter().map(|t| t.predict(x)).sum::<f64>() / trees.len() as f64
                }
            }
            Regressor::Svr { center, scale, weights, bias } => {
                bias + x.iter().zip(center.iter().zip(scale.iter())).zip(weights.iter())
                    .map(|((v, (c, s)), w)| w * (v - c) / s)
                    .sum::<f64>()
            }
        }
    }
}

fn absolute_error(y: &[f64], samples: &[usize]) -> (f64, f64) {
    let mut values: Vec<f64> = samples.iter().map(|i| y[*i]).collect();
    let m = median(&mut values);
    (m, values.iter().map(|v| (v - m).abs()).sum())
}

/// Grow a tree minimising the absolute error; a split is kept only when it
/// lowers the error, which prunes branches that do not help
fn grow(x: &[Vec<f64>], y: &[f64], samples: &[usize], depth: usize, min_leaf: usize, max_features: usize, rng: &mut ChaCha8Rng) -> Node {
    let (value, error) = absolute_error(y, samples);
    if depth == 0 || samples.len() < 2 * min_leaf || error <= 1e-12 {
        return Node::Leaf { value };
    }

    let p = x[0].len();
    let features: Vec<usize> = if max_features >= p {
        (0..p).collect()
    } else {
        index::sample(rng, p, max_features).into_vec()
    };

    let mut best: Option<(f64, usize, f64)> = None;
    for feature in features {
        let mut sorted: Vec<usize> = samples.to_vec();
        sorted.sort_by(|a, b| x[*a][feature].total_cmp(&x[*b][feature]));
        for cut in min_leaf..=sorted.len() - min_leaf {
            let (lo, hi) = (x[sorted[cut - 1]][feature], x[sorted[cut]][feature]);
            if lo == hi {
                continue;
            }
            let split_error = absolute_error(y, &sorted[..cut]).1 + absolute_error(y, &sorted[cut..]).1;
            if best.map_or(true, |(e, _, _)| split_error < e) {
                best = Some((split_error, feature, (lo + hi) / 2.0));
            }
        }
    }

    match best {
        Some((split_error, feature, threshold)) if split_error < error - 1e-12 => {
            let (left, right): (Vec<usize>, Vec<usize>) = samples.iter().partition(|i| x[**i][feature] <= threshold);
            Node::Split {
                feature,
                threshold,
                left: Box::new(grow(x, y, &left, depth - 1, min_leaf, max_features, rng)),
                right: Box::new(grow(x, y, &right, depth - 1, min_leaf, max_features, rng)),
            }
        }
        _ => Node::Leaf { value },
    }
}

/// Linear SVR with the squared epsilon-insensitive loss on standardised inputs
fn fit_svr(x: &[Vec<f64>], y: &[f64], c: f64, epsilon: f64) -> Result<Regressor> {
    let n = y.len();
    let p = x[0].len();
    let center: Vec<f64> = (0..p).map(|j| x.iter().map(|r| r[j]).sum::<f64>() / n as f64).collect();
    let scale: Vec<f64> = (0..p)
        .map(|j| {
            let sd = (x.iter().map(|r| (r[j] - center[j]).powi(2)).sum::<f64>() / n as f64).sqrt();
            if sd > 1e-12 { sd } else { 1.0 }
        })
        .collect();
    let z: Vec<Vec<f64>> = x.iter()
        .map(|r| r.iter().zip(center.iter().zip(scale.iter())).map(|(v, (m, s))| (v - m) / s).collect())
        .collect();

    let mut init = vec![0.0; p];
    init.push(median(&mut y.to_vec()));
    let loss = SvrLoss { z: &z, y, epsilon, lambda: 1.0 / (c * n as f64) };
    let mut weights = minimise(loss, init, "SVR")?;
    let bias = weights.pop().unwrap_or(0.0);
    Ok(Regressor::Svr { center, scale, weights, bias })
}

/// `lambda/2 |w|^2 + mean(max(0, |r| - epsilon)^2)` over the residuals `r`.
/// The parameter holds the weights then the bias.
struct SvrLoss<'a> {
    z: &'a [Vec<f64>],
    y: &'a [f64],
    epsilon: f64,
    lambda: f64,
}

impl SvrLoss<'_> {
    /// Signed excess of each residual over the tube
    fn excesses<'p>(&'p self, param: &'p [f64]) -> impl Iterator<Item = f64> + 'p {
        let (w, b) = param.split_at(param.len() - 1);
        self.z.iter().zip(self.y).map(move |(row, target)| {
            let residual = target - (b[0] + row.iter().zip(w).map(|(v, w)| v * w).sum::<f64>());
            residual.signum() * (residual.abs() - self.epsilon).max(0.0)
        })
    }
}

impl CostFunction for SvrLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let n = self.y.len() as f64;
        let loss: f64 = self.excesses(param).map(|e| e * e).sum::<f64>() / n;
        let penalty: f64 = param[..param.len() - 1].iter().map(|w| w * w).sum();
        Ok(loss + 0.5 * self.lambda * penalty)
    }
}

impl Gradient for SvrLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        let n = self.y.len() as f64;
        let p = param.len() - 1;
        let mut grad: Vec<f64> = param[..p].iter().map(|w| self.lambda * w).collect();
        grad.push(0.0);
        for (row, excess) in self.z.iter().zip(self.excesses(param)) {
            for j in 0..p {
                grad[j] -= 2.0 * excess * row[j] / n;
            }
            grad[p] -= 2.0 * excess / n;
        }
        Ok(grad)
    }
}

/// 3-fold mean absolute error of a linear SVR
fn svr_cv_error(x: &[Vec<f64>], y: &[f64], c: f64, epsilon: f64) -> Result<f64> {
    let n = y.len();
    if n < 3 {
        return Ok(0.0);
    }
    let mut total = 0.0;
    for fold in 0..3 {
        let train: Vec<usize> = (0..n).filter(|i| i % 3 != fold).collect();
        let test: Vec<usize> = (0..n).filter(|i| i % 3 == fold).collect();
        let xt: Vec<Vec<f64>> = train.iter().map(|i| x[*i].clone()).collect();
        let yt: Vec<f64> = train.iter().map(|i| y[*i]).collect();
        let model = fit_svr(&xt, &yt, c, epsilon)?;
        total += test.iter().map(|i| (model.predict(&x[*i]) - y[*i]).abs()).sum::<f64>();
    }
    Ok(total / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = 0.3 when x0 > 0.5, 0.0 otherwise; x1 is noise
    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64 / 40.0, ((i * 7) % 11) as f64 / 11.0]).collect();
        let y: Vec<f64> = x.iter().map(|r| if r[0] > 0.5 { 0.3 } else { 0.0 }).collect();
        (x, y)
    }

    #[test]
    fn test_nicks() {
        assert_eq!(RegressorKind::from_nick("zero").unwrap(), RegressorKind::Zero);
        assert_eq!(RegressorKind::from_nick("tree(2, 4)").unwrap(), RegressorKind::DecisionTree { max_depth: 2, min_leaf: 4 });
        assert_eq!(RegressorKind::from_nick("forest").unwrap().nick(), "forest50x4x3");
        assert!(RegressorKind::from_nick("gbm").is_err());
    }

    #[test]
    fn test_zero_and_median() {
        let (x, y) = step_data();
        assert_eq!(RegressorKind::Zero.fit(&x, &y, 1).unwrap().predict(&x[0]), 0.0);
        let m = RegressorKind::Median.fit(&[vec![0.0], vec![1.0], vec![2.0]], &[0.1, 0.5, 0.2], 1).unwrap();
        assert_eq!(m.predict(&[9.0]), 0.2);
    }

    #[test]
    fn test_tree_learns_step() {
        let (x, y) = step_data();
        let tree = RegressorKind::DecisionTree { max_depth: 3, min_leaf: 2 }.fit(&x, &y, 1).unwrap();
        assert_eq!(tree.predict(&[0.1, 0.5]), 0.0);
        assert_eq!(tree.predict(&[0.9, 0.5]), 0.3);
        match tree {
            Regressor::Tree { root } => assert_eq!(root.depth(), 1, "a pure split needs no further branch"),
            _ => panic!("expected a tree"),
        }
    }

    #[test]
    fn test_forest_is_reproducible_and_close() {
        let (x, y) = step_data();
        let kind = RegressorKind::RandomForest { n_trees: 20, max_depth: 4, min_leaf: 2 };
        let a = kind.fit(&x, &y, 7).unwrap();
        let b = kind.fit(&x, &y, 7).unwrap();
        assert_eq!(a, b);
        assert!(a.predict(&[0.95, 0.5]) > a.predict(&[0.05, 0.5]));
    }

    #[test]
    fn test_svr_fits_linear_trend() {
        let x: Vec<Vec<f64>> = (0..30).map(|i| vec![i as f64 / 30.0]).collect();
        let y: Vec<f64> = x.iter().map(|r| r[0]).collect();
        let svr = RegressorKind::Svr { c: 10.0, epsilon: 0.001 }.fit(&x, &y, 1).unwrap();
        assert!(svr.predict(&[1.0]) > svr.predict(&[0.0]));
        let random = RegressorKind::RandomisedSvr { candidates: 5 }.fit(&x, &y, 3).unwrap();
        assert!(random.predict(&[1.0]) > random.predict(&[0.0]));
    }

    #[test]
    fn test_svr_ignores_residuals_inside_the_tube() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..20).map(|i| 2.0 * i as f64 + 1.0 + if i % 2 == 0 { 0.05 } else { -0.05 }).collect();
        let svr = RegressorKind::Svr { c: 1000.0, epsilon: 0.1 }.fit(&x, &y, 1).unwrap();
        for (row, target) in x.iter().zip(y.iter()) {
            assert!((svr.predict(row) - target).abs() < 0.15, "{} vs {}", svr.predict(row), target);
        }
    }

    #[test]
    fn test_empty_sample_falls_back() {
        let kind = RegressorKind::DecisionTree { max_depth: 3, min_leaf: 2 };
        assert!(kind.fit(&[], &[], 1).is_err());
        assert_eq!(kind.fit_or_median(&[], &[], 1), Regressor::Zero);
    }
}
