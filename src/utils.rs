use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// a macro to declare simple Vec<String>
#[macro_export]
macro_rules! string_vec {
    ($($x:expr),*) => {
        vec![$($x.into()),*]
    };
}

/// info! that keeps ANSI colours only when the run is configured to be colourful
#[macro_export]
macro_rules! cinfo {
    ($colorful:expr, $($arg:tt)*) => {
        if $colorful {
            log::info!($($arg)*);
        } else {
            log::info!("{}", $crate::utils::strip_ansi(&format!($($arg)*)));
        }
    };
}

/// Removes `ESC [ ... m` colour sequences from a string
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            for d in chars.by_ref() {
                if d == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

//-----------------------------------------------------------------------------
// Seeds
//-----------------------------------------------------------------------------

/// SplitMix64 finaliser, used to derive independent seeds from the root seed
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seed of the `stream`-th child of `root`
pub fn derive_seed(root: u64, stream: u64) -> u64 {
    splitmix64(root ^ splitmix64(stream))
}

//-----------------------------------------------------------------------------
// Numerics
//-----------------------------------------------------------------------------

/// Kahan-compensated accumulator
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> KahanSum {
        KahanSum::default()
    }

    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum
    }
}

pub fn kahan_sum<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut acc = KahanSum::new();
    for v in values {
        acc.add(v);
    }
    acc.value()
}

/// Welford online mean/variance where both the running mean and the sum of
/// squared deviations are Kahan-compensated
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningStats {
    n: usize,
    mean: KahanSum,
    m2: KahanSum,
}

impl RunningStats {
    pub fn new() -> RunningStats {
        RunningStats::default()
    }

    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean.value();
        self.mean.add(delta / self.n as f64);
        let delta2 = x - self.mean.value();
        self.m2.add(delta * delta2);
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 { f64::NAN } else { self.mean.value() }
    }

    /// Unbiased variance, NaN below two observations
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            f64::NAN
        } else {
            (self.m2.value() / (self.n - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Two-sided Student t confidence interval of the mean
    pub fn t_interval(&self, confidence: f64) -> (f64, f64) {
        let mean = self.mean();
        if self.n < 2 {
            return (mean, mean);
        }
        let sd = self.std_dev();
        if sd == 0.0 {
            return (mean, mean);
        }
        let dof = (self.n - 1) as f64;
        let t = match StudentsT::new(0.0, 1.0, dof) {
            Ok(dist) => dist.inverse_cdf(0.5 + confidence / 2.0),
            Err(_) => return (mean, mean),
        };
        let half = t * sd / (self.n as f64).sqrt();
        (mean - half, mean + half)
    }
}

/// Mean of `b` bootstrap means of `values` (resampled with replacement)
pub fn bootstrap_mean(values: &[f64], b: usize, rng: &mut ChaCha8Rng) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    if b == 0 {
        return kahan_sum(values.iter().copied()) / values.len() as f64;
    }
    let n = values.len();
    let mut means = KahanSum::new();
    for _ in 0..b {
        let mut acc = KahanSum::new();
        for _ in 0..n {
            acc.add(values[rng.gen_range(0..n)]);
        }
        means.add(acc.value() / n as f64);
    }
    means.value() / b as f64
}

pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let mut stats = RunningStats::new();
    for v in values {
        stats.push(*v);
    }
    let std = if stats.count() < 2 { 0.0 } else { stats.std_dev() };
    (stats.mean(), std)
}

pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Value at quantile `q` (linear interpolation between order statistics)
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub fn jaccard(a: &HashSet<usize>, b: &HashSet<usize>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

//-----------------------------------------------------------------------------
// Folds
//-----------------------------------------------------------------------------

/// Shuffles `items` and deals them into `p` chunks whose sizes differ by
/// at most one, the larger chunks first
pub fn balanced_random_chunks<T: Clone>(items: Vec<T>, p: usize, rng: &mut ChaCha8Rng) -> Result<Vec<Vec<T>>> {
    if p == 0 {
        return Err(Error::value("cannot split into 0 chunks"));
    }
    let mut shuffled = items;
    shuffled.shuffle(rng);

    let (base, extra) = (shuffled.len() / p, shuffled.len() % p);
    let mut rest = shuffled.as_slice();
    let chunks = (0..p)
        .map(|i| {
            let (chunk, tail) = rest.split_at(base + usize::from(i < extra));
            rest = tail;
            chunk.to_vec()
        })
        .collect();
    Ok(chunks)
}

//-----------------------------------------------------------------------------
// Nicks
//-----------------------------------------------------------------------------

/// Splits `name(arg1, arg2(x, y))` into `("name", ["arg1", "arg2(x, y)"])`.
/// A bare `name` has no arguments.
pub fn parse_nick(nick: &str) -> Result<(String, Vec<String>)> {
    let nick = nick.trim();
    let Some(open) = nick.find('(') else {
        if nick.is_empty() {
            return Err(Error::value("empty nick"));
        }
        return Ok((nick.to_string(), vec![]));
    };
    if !nick.ends_with(')') {
        return Err(Error::value(format!("unbalanced parentheses in nick '{}'", nick)));
    }
    let name = nick[..open].trim().to_string();
    let inner = &nick[open + 1..nick.len() - 1];

    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::value(format!("unbalanced parentheses in nick '{}'", nick)));
                }
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(Error::value(format!("unbalanced parentheses in nick '{}'", nick)));
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    Ok((name, args))
}

pub fn parse_arg<T: std::str::FromStr>(nick: &str, args: &[String], idx: usize) -> Result<T> {
    args.get(idx)
        .ok_or_else(|| Error::value(format!("'{}' expects at least {} argument(s)", nick, idx + 1)))?
        .parse::<T>()
        .map_err(|_| Error::value(format!("cannot parse argument {} of '{}'", idx + 1, nick)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_balanced_random_chunks_sizes() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let chunks = balanced_random_chunks((0..10).collect::<Vec<usize>>(), 3, &mut rng).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let mut all: Vec<usize> = chunks.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<usize>>());

        let short = balanced_random_chunks(vec![1, 2], 4, &mut rng).unwrap();
        assert_eq!(short.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_balanced_random_chunks_rejects_zero_chunks() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(matches!(balanced_random_chunks(vec![1, 2, 3], 0, &mut rng), Err(Error::Value(_))));
        assert!(balanced_random_chunks(Vec::<usize>::new(), 2, &mut rng).unwrap().iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_kahan_sum_recovers_small_terms() {
        let mut values = vec![1.0e16];
        values.extend(std::iter::repeat(1.0).take(1000));
        values.push(-1.0e16);
        assert_eq!(kahan_sum(values.iter().copied()), 1000.0);
    }

    #[test]
    fn test_running_stats_matches_two_pass() {
        let values = [0.61, 0.72, 0.55, 0.68, 0.70];
        let mut stats = RunningStats::new();
        values.iter().for_each(|v| stats.push(*v));
        let mean = values.iter().sum::<f64>() / 5.0;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-12);
        let (low, high) = stats.t_interval(0.95);
        assert!(low < mean && mean < high);
    }

    #[test]
    fn test_running_stats_single_value_has_point_interval() {
        let mut stats = RunningStats::new();
        stats.push(0.8);
        assert!(stats.variance().is_nan());
        assert_eq!(stats.t_interval(0.95), (0.8, 0.8));
    }

    #[test]
    fn test_bootstrap_mean_of_constant_is_constant() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!((bootstrap_mean(&[0.5; 7], 200, &mut rng) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_derive_seed_is_stable_and_distinct() {
        assert_eq!(derive_seed(42, 1), derive_seed(42, 1));
        assert_ne!(derive_seed(42, 1), derive_seed(42, 2));
        assert_ne!(derive_seed(42, 1), derive_seed(43, 1));
    }

    #[test]
    fn test_parse_nick() {
        assert_eq!(parse_nick("pareto").unwrap(), ("pareto".to_string(), vec![]));
        assert_eq!(
            parse_nick("uniform(1, 10)").unwrap(),
            ("uniform".to_string(), string_vec!["1", "10"])
        );
        assert_eq!(
            parse_nick("union(pareto, top_by_sum(5))").unwrap(),
            ("union".to_string(), string_vec!["pareto", "top_by_sum(5)"])
        );
        assert!(parse_nick("uniform(1, 10").is_err());
        assert!(parse_nick("").is_err());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;93mFold #1\x1b[0m done"), "Fold #1 done");
    }

    #[test]
    fn test_quantile_and_median() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
    }
}
