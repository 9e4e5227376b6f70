use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::data::{Data, Outcome};
use crate::error::{Error, Result};
use crate::utils::{self, parse_arg, parse_nick, quantile};

/// Ordered list of test index sets over a sample universe.
/// The training set of fold i is the universe minus the test set i.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Folds {
    universe: Vec<usize>,
    tests: Vec<Vec<usize>>,
}

impl Folds {
    /// The universe is the union of the test sets
    pub fn new(tests: Vec<Vec<usize>>) -> Result<Folds> {
        if tests.is_empty() {
            return Err(Error::value("folds need at least one test set"));
        }
        if tests.iter().any(|t| t.is_empty()) {
            return Err(Error::value("folds cannot contain an empty test set"));
        }
        let universe: Vec<usize> = tests.iter().flatten().copied().collect::<BTreeSet<usize>>().into_iter().collect();
        let tests = tests.into_iter()
            .map(|mut t| { t.sort_unstable(); t.dedup(); t })
            .collect();
        Ok(Folds { universe, tests })
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn universe(&self) -> &[usize] {
        &self.universe
    }

    pub fn test(&self, i: usize) -> &[usize] {
        &self.tests[i]
    }

    pub fn train(&self, i: usize) -> Vec<usize> {
        let test: BTreeSet<usize> = self.tests[i].iter().copied().collect();
        self.universe.iter().copied().filter(|s| !test.contains(s)).collect()
    }

    pub fn tests(&self) -> &[Vec<usize>] {
        &self.tests
    }

    /// Check that every index addresses a sample of a dataset of `sample_len` samples
    pub fn check_bounds(&self, sample_len: usize) -> Result<()> {
        match self.universe.last() {
            Some(last) if *last >= sample_len => Err(Error::value(format!(
                "folds reference sample {} but the dataset only has {} samples", last, sample_len
            ))),
            _ => Ok(()),
        }
    }

    /// Sample names of the (train, test) sets of each fold
    pub fn get_ids(&self, data: &Data) -> Vec<(Vec<String>, Vec<String>)> {
        (0..self.len())
            .map(|i| {
                let names = |idx: &[usize]| idx.iter().map(|s| data.samples[*s].clone()).collect::<Vec<_>>();
                (names(&self.train(i)), names(self.test(i)))
            })
            .collect()
    }

    /// folds.json is the list of test-index lists
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &self.tests)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Folds> {
        let file = File::open(path)?;
        let tests: Vec<Vec<usize>> = serde_json::from_reader(BufReader::new(file))?;
        Folds::new(tests)
    }
}

//-----------------------------------------------------------------------------
// Multi-outcome class assigner
//-----------------------------------------------------------------------------

/// Maps every sample to a synthetic stratum built from the cross product of
/// the categorical levels and, for survival outcomes, of the event flag and
/// the duration quantile bin. Small strata are merged until each holds at
/// least `min_stratum_size` samples or only one stratum is left.
#[derive(Clone, Debug)]
pub struct ClassAssigner {
    pub min_stratum_size: usize,
    pub survival_quantiles: usize,
}

impl ClassAssigner {
    pub fn new(min_stratum_size: usize, survival_quantiles: usize) -> ClassAssigner {
        ClassAssigner { min_stratum_size, survival_quantiles: survival_quantiles.max(1) }
    }

    /// Stratum label of each sample of `samples` (indices into the outcomes),
    /// numbered by order of first appearance
    pub fn assign(&self, outcomes: &[Outcome], samples: &[usize]) -> Vec<usize> {
        let mut is_bin: Vec<bool> = Vec::new();
        let mut keys: Vec<Vec<usize>> = vec![Vec::new(); samples.len()];

        for outcome in outcomes {
            match outcome {
                Outcome::Categorical { labels, .. } => {
                    is_bin.push(false);
                    for (key, s) in keys.iter_mut().zip(samples) {
                        key.push(labels[*s]);
                    }
                }
                Outcome::Survival { duration, event, .. } => {
                    let mut sorted: Vec<f64> = samples.iter().map(|s| duration[*s]).collect();
                    sorted.sort_by(|a, b| a.total_cmp(b));
                    let thresholds: Vec<f64> = (1..self.survival_quantiles)
                        .map(|q| quantile(&sorted, q as f64 / self.survival_quantiles as f64))
                        .collect();
                    is_bin.push(false);
                    is_bin.push(true);
                    for (key, s) in keys.iter_mut().zip(samples) {
                        let bin = thresholds.iter().filter(|t| duration[*s] > **t).count();
                        key.push(event[*s] as usize);
                        key.push(bin);
                    }
                }
            }
        }

        let mut strata: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
        for (pos, key) in keys.iter().enumerate() {
            strata.entry(key.clone()).or_default().push(pos);
        }

        self.merge_small_strata(&mut strata, &is_bin);

        let mut labels = vec![0; samples.len()];
        let mut order: Vec<(usize, &Vec<usize>)> = strata.values().map(|members| (members[0], members)).collect();
        order.sort_by_key(|(first, _)| *first);
        for (label, (_, members)) in order.into_iter().enumerate() {
            for pos in members {
                labels[*pos] = label;
            }
        }
        labels
    }

    fn merge_small_strata(&self, strata: &mut BTreeMap<Vec<usize>, Vec<usize>>, is_bin: &[bool]) {
        loop {
            if strata.len() <= 1 {
                return;
            }
            let smallest = strata.iter()
                .filter(|(_, members)| members.len() < self.min_stratum_size)
                .min_by_key(|(_, members)| members.len())
                .map(|(key, _)| key.clone());
            let Some(small_key) = smallest else { return };

            let adjacent = strata.iter()
                .filter(|(key, _)| **key != small_key && adjacent_bins(&small_key, key, is_bin))
                .min_by_key(|(_, members)| members.len())
                .map(|(key, _)| key.clone());
            let target = adjacent.or_else(|| {
                strata.iter()
                    .filter(|(key, _)| **key != small_key)
                    .min_by_key(|(_, members)| members.len())
                    .map(|(key, _)| key.clone())
            });

            let Some(target) = target else { return };
            let moved = strata.remove(&small_key).unwrap_or_default();
            debug!("Merging stratum {:?} ({} samples) into {:?}", small_key, moved.len(), target);
            if let Some(members) = strata.get_mut(&target) {
                members.extend(moved);
                members.sort_unstable();
            }
        }
    }
}

/// True when the keys only differ by one step on one survival bin component
fn adjacent_bins(a: &[usize], b: &[usize], is_bin: &[bool]) -> bool {
    let mut diff = a.iter().zip(b.iter()).zip(is_bin.iter()).filter(|((x, y), _)| x != y);
    match (diff.next(), diff.next()) {
        (Some(((x, y), bin)), None) => *bin && x.abs_diff(*y) == 1,
        _ => false,
    }
}

//-----------------------------------------------------------------------------
// Folds creators
//-----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum FoldsCreator {
    StratifiedKFold { k: usize, repeats: usize },
    Load { path: String },
    Auto,
}

impl FoldsCreator {
    /// `stratified_k_fold(k, repeats)`, `load(path)` or `auto`
    pub fn from_nick(nick: &str) -> Result<FoldsCreator> {
        let (name, args) = parse_nick(nick)?;
        match name.as_str() {
            "stratified_k_fold" | "skf" => {
                let k: usize = parse_arg(nick, &args, 0)?;
                let repeats: usize = if args.len() > 1 { parse_arg(nick, &args, 1)? } else { 1 };
                if k < 2 || repeats == 0 {
                    return Err(Error::value(format!("'{}' needs k >= 2 and repeats >= 1", nick)));
                }
                Ok(FoldsCreator::StratifiedKFold { k, repeats })
            }
            "load" => Ok(FoldsCreator::Load { path: parse_arg(nick, &args, 0)? }),
            "auto" => Ok(FoldsCreator::Auto),
            _ => Err(Error::value(format!("unknown folds creator '{}'", nick))),
        }
    }

    /// Name used as a directory component
    pub fn nick(&self) -> String {
        match self {
            FoldsCreator::StratifiedKFold { k, repeats } => format!("skf{}x{}", k, repeats),
            FoldsCreator::Load { path } => {
                let stem = Path::new(path).file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                format!("load_{}", stem)
            }
            FoldsCreator::Auto => "auto".to_string(),
        }
    }

    /// Folds over all samples of `data`
    pub fn create(&self, data: &Data, assigner: &ClassAssigner, rng: &mut ChaCha8Rng) -> Result<Folds> {
        let folds = match self {
            FoldsCreator::StratifiedKFold { k, repeats } => stratified_k_fold(data, *k, *repeats, assigner, rng)?,
            FoldsCreator::Load { path } => {
                info!("Loading folds from {}", path);
                let folds = Folds::load(Path::new(path))?;
                folds.check_bounds(data.sample_len)?;
                if folds.universe().len() != data.sample_len {
                    warn!("Loaded folds only cover {} of {} samples", folds.universe().len(), data.sample_len);
                }
                folds
            }
            FoldsCreator::Auto => {
                let all: Vec<usize> = (0..data.sample_len).collect();
                let labels = assigner.assign(&data.outcomes, &all);
                let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
                labels.iter().for_each(|l| *sizes.entry(*l).or_default() += 1);
                let smallest = sizes.values().copied().min().unwrap_or(0);
                let k = smallest.clamp(2, 5);
                info!("Automatic folds: stratified {}-fold", k);
                stratified_k_fold(data, k, 1, assigner, rng)?
            }
        };
        Ok(folds)
    }
}

/// Stratified k-fold over every sample of `data`. Each stratum is shuffled and
/// cut in k balanced chunks; chunk positions rotate between strata so that the
/// extra samples do not pile up in the first folds.
pub fn stratified_k_fold(data: &Data, k: usize, repeats: usize, assigner: &ClassAssigner, rng: &mut ChaCha8Rng) -> Result<Folds> {
    if k < 2 {
        return Err(Error::value(format!("stratified k-fold needs k >= 2, got {}", k)));
    }
    if data.sample_len < k {
        return Err(Error::value(format!("cannot build {} folds over {} samples", k, data.sample_len)));
    }

    let all: Vec<usize> = (0..data.sample_len).collect();
    let labels = assigner.assign(&data.outcomes, &all);
    let mut strata: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (s, l) in labels.iter().enumerate() {
        strata.entry(*l).or_default().push(s);
    }

    let mut tests = Vec::with_capacity(k * repeats);
    for _ in 0..repeats {
        let mut repeat_tests: Vec<Vec<usize>> = vec![Vec::new(); k];
        let mut offset = 0;
        for members in strata.values() {
            let n = members.len();
            let chunks = utils::balanced_random_chunks(members.clone(), k, rng)?;
            for (c, chunk) in chunks.into_iter().enumerate() {
                repeat_tests[(c + offset) % k].extend(chunk);
            }
            offset = (offset + n % k) % k;
        }
        tests.extend(repeat_tests);
    }
    Folds::new(tests)
}

#[cfg(test)]
impl Folds {
    pub fn test_folds() -> Folds {
        Folds::new(vec![vec![0, 1, 5], vec![2, 6, 7], vec![3, 4, 8, 9]]).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_folds_train_is_complement() {
        let folds = Folds::test_folds();
        assert_eq!(folds.len(), 3);
        assert_eq!(folds.universe(), (0..10).collect::<Vec<_>>().as_slice());
        assert_eq!(folds.train(0), vec![2, 3, 4, 6, 7, 8, 9]);
        assert!(Folds::new(vec![]).is_err());
        assert!(Folds::new(vec![vec![0], vec![]]).is_err());
    }

    #[test]
    fn test_stratified_k_fold_covers_universe_and_balances_classes() {
        let data = Data::test();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let assigner = ClassAssigner::new(1, 2);
        let folds = stratified_k_fold(&data, 5, 1, &assigner, &mut rng).unwrap();
        assert_eq!(folds.len(), 5);
        let mut all: Vec<usize> = folds.tests().iter().flatten().copied().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        for test in folds.tests() {
            assert_eq!(test.len(), 2);
            let positives = test.iter().filter(|s| data.outcomes[0].stratification_key(**s) == 1).count();
            assert_eq!(positives, 1, "each fold should hold one sample of each class");
        }
    }

    #[test]
    fn test_stratified_k_fold_repeats_and_reproducibility() {
        let data = Data::test();
        let assigner = ClassAssigner::new(1, 2);
        let a = stratified_k_fold(&data, 2, 3, &assigner, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let b = stratified_k_fold(&data, 2, 3, &assigner, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert_eq!(a.universe().len(), 10);
    }

    #[test]
    fn test_stratified_k_fold_too_few_samples() {
        let data = Data::test().subset(&[0, 1]);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(stratified_k_fold(&data, 3, 1, &ClassAssigner::new(1, 2), &mut rng).is_err());
    }

    #[test]
    fn test_class_assigner_merges_small_categorical_strata() {
        let outcome = Outcome::Categorical {
            name: "y".to_string(),
            levels: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            labels: vec![0, 0, 0, 0, 1, 1, 1, 1, 1, 2],
        };
        let samples: Vec<usize> = (0..10).collect();
        let labels = ClassAssigner::new(2, 2).assign(&[outcome.clone()], &samples);
        assert_eq!(labels.iter().collect::<BTreeSet<_>>().len(), 2, "the singleton level is merged");
        assert_eq!(labels[9], labels[0], "merged into the smallest other stratum");

        let labels = ClassAssigner::new(1, 2).assign(&[outcome], &samples);
        assert_eq!(labels.iter().collect::<BTreeSet<_>>().len(), 3);
    }

    #[test]
    fn test_class_assigner_survival_merges_adjacent_bins() {
        // events 0..8 with short and long durations, one long censored sample
        let outcome = Outcome::Survival {
            name: "os".to_string(),
            duration: vec![1.0, 2.0, 3.0, 4.0, 10.0, 11.0, 12.0, 13.0, 14.0],
            event: vec![true, true, true, true, true, true, true, true, false],
        };
        let samples: Vec<usize> = (0..9).collect();
        let labels = ClassAssigner::new(2, 2).assign(&[outcome], &samples);
        // the censored sample is alone in (event=0, bin=1) and has no adjacent
        // bin with event=0, so it goes to the smallest other stratum
        let distinct: BTreeSet<usize> = labels.iter().copied().collect();
        assert_eq!(distinct.len(), 2);
        assert_ne!(labels[0], labels[7]);
    }

    #[test]
    fn test_adjacent_bins() {
        let is_bin = [false, false, true];
        assert!(adjacent_bins(&[0, 1, 0], &[0, 1, 1], &is_bin));
        assert!(!adjacent_bins(&[0, 1, 0], &[0, 1, 2], &is_bin));
        assert!(!adjacent_bins(&[0, 1, 0], &[1, 1, 1], &is_bin));
        assert!(!adjacent_bins(&[0, 1, 0], &[1, 1, 0], &is_bin));
    }

    #[test]
    fn test_folds_creator_nicks() {
        assert_eq!(FoldsCreator::from_nick("stratified_k_fold(5, 2)").unwrap(), FoldsCreator::StratifiedKFold { k: 5, repeats: 2 });
        assert_eq!(FoldsCreator::from_nick("stratified_k_fold(3)").unwrap().nick(), "skf3x1");
        assert_eq!(FoldsCreator::from_nick("auto").unwrap(), FoldsCreator::Auto);
        assert_eq!(FoldsCreator::from_nick("load(/tmp/my_folds.json)").unwrap().nick(), "load_my_folds");
        assert!(FoldsCreator::from_nick("stratified_k_fold(1, 1)").is_err());
        assert!(FoldsCreator::from_nick("leave_one_out").is_err());
    }

    #[test]
    fn test_folds_save_load_and_auto() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folds.json");
        let folds = Folds::test_folds();
        folds.save(&path).unwrap();
        let creator = FoldsCreator::Load { path: path.to_string_lossy().to_string() };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let loaded = creator.create(&Data::test(), &ClassAssigner::new(1, 2), &mut rng).unwrap();
        assert_eq!(loaded, folds);

        let auto = FoldsCreator::Auto.create(&Data::test(), &ClassAssigner::new(1, 2), &mut rng).unwrap();
        assert_eq!(auto.len(), 5);
    }

    #[test]
    fn test_loaded_folds_out_of_bounds() {
        let folds = Folds::new(vec![vec![0, 1], vec![2, 30]]).unwrap();
        assert!(folds.check_bounds(10).is_err());
        assert!(folds.check_bounds(31).is_ok());
    }

    #[test]
    fn test_get_ids_returns_correct_sample_names() {
        let data = Data::test();
        let ids = Folds::test_folds().get_ids(&data);
        assert_eq!(ids[0].1, vec!["s0", "s1", "s5"]);
        assert_eq!(ids[0].0.len(), 7);
    }
}
