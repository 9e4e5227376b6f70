//! Hall-of-fame members of every outer fold, flattened to the two CSV
//! files kept next to each hall of fame.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::hof::HofUnion;
use crate::mask::FeatureMask;

pub const FEATURES_FILE: &str = "solution_features.csv";
pub const FITNESSES_FILE: &str = "solution_fitnesses.csv";

const INTERNAL_CV: &str = "_internal_cv";
const INTERNAL: &str = "_internal";
const EXTERNAL: &str = "_external";

#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub fold: usize,
    pub mask: FeatureMask,
    /// Fitness optimised by the GA (inner CV, adjusted)
    pub internal_cv: Vec<f64>,
    /// Fitness on the outer fold test samples
    pub internal: Vec<f64>,
    /// Fitness on the external cohort, NaN without one
    pub external: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Solutions {
    pub objective_nicks: Vec<String>,
    pub feature_names: Vec<String>,
    pub solutions: Vec<Solution>,
}

impl Solutions {
    pub fn from_union(union: &HofUnion, objective_nicks: &[String], feature_names: &[String]) -> Solutions {
        let m = objective_nicks.len();
        let solutions = union.snapshots.iter()
            .flat_map(|s| {
                s.members.iter().enumerate().map(move |(n, member)| Solution {
                    fold: s.fold,
                    mask: member.mask.clone(),
                    internal_cv: member.fitness.clone(),
                    internal: s.test_fitness.get(n).cloned().unwrap_or_else(|| vec![f64::NAN; m]),
                    external: vec![f64::NAN; m],
                })
            })
            .collect();
        Solutions { objective_nicks: objective_nicks.to_vec(), feature_names: feature_names.to_vec(), solutions }
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    /// Number of folds covered: last fold index + 1
    pub fn n_folds(&self) -> usize {
        self.solutions.iter().map(|s| s.fold + 1).max().unwrap_or(0)
    }

    pub fn fold(&self, fold: usize) -> impl Iterator<Item = &Solution> {
        self.solutions.iter().filter(move |s| s.fold == fold)
    }

    /// Positions of features selected by at least one solution
    pub fn ever_selected(&self) -> Vec<usize> {
        let selected: BTreeSet<usize> = self.solutions.iter().flat_map(|s| s.mask.true_positions().iter().copied()).collect();
        selected.into_iter().collect()
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let columns = self.ever_selected();
        let mut writer = csv::Writer::from_path(dir.join(FEATURES_FILE))?;
        let mut header: Vec<String> = crate::string_vec!["fold", "solution"];
        header.extend(columns.iter().map(|f| self.feature_names.get(*f).cloned().unwrap_or_else(|| f.to_string())));
        writer.write_record(&header)?;
        for (n, s) in self.solutions.iter().enumerate() {
            let mut record = vec![s.fold.to_string(), self.local_index(n).to_string()];
            record.extend(columns.iter().map(|f| if s.mask.get(*f) { "1" } else { "0" }.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        let mut writer = csv::Writer::from_path(dir.join(FITNESSES_FILE))?;
        let mut header: Vec<String> = crate::string_vec!["fold", "solution"];
        for nick in &self.objective_nicks {
            header.extend([format!("{}{}", nick, INTERNAL_CV), format!("{}{}", nick, INTERNAL), format!("{}{}", nick, EXTERNAL)]);
        }
        writer.write_record(&header)?;
        for (n, s) in self.solutions.iter().enumerate() {
            let mut record = vec![s.fold.to_string(), self.local_index(n).to_string()];
            for o in 0..self.objective_nicks.len() {
                for values in [&s.internal_cv, &s.internal, &s.external] {
                    record.push(format!("{}", values.get(o).copied().unwrap_or(f64::NAN)));
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads both files back. Masks span the feature columns of the
    /// features file only, named after its header.
    pub fn load(dir: &Path) -> Result<Solutions> {
        let mut reader = csv::Reader::from_path(dir.join(FEATURES_FILE))?;
        let feature_names: Vec<String> = reader.headers()?.iter().skip(2).map(|h| h.to_string()).collect();
        let mut masks: Vec<(usize, FeatureMask)> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let fold = parse_field::<usize>(&record, 0)?;
            let bools = (2..record.len()).map(|i| record.get(i) == Some("1"));
            masks.push((fold, FeatureMask::from_bools(bools)));
        }

        let mut reader = csv::Reader::from_path(dir.join(FITNESSES_FILE))?;
        let headers = reader.headers()?.clone();
        let objective_nicks: Vec<String> = headers.iter()
            .skip(2)
            .filter_map(|h| h.strip_suffix(INTERNAL_CV))
            .map(|h| h.to_string())
            .collect();
        let m = objective_nicks.len();
        if headers.len() != 2 + 3 * m {
            return Err(Error::value(format!("{}: expected 3 columns per objective", FITNESSES_FILE)));
        }

        let mut solutions = Vec::with_capacity(masks.len());
        for (n, record) in reader.records().enumerate() {
            let record = record?;
            let Some((fold, mask)) = masks.get(n).cloned() else {
                return Err(Error::value(format!("{} has more rows than {}", FITNESSES_FILE, FEATURES_FILE)));
            };
            let (mut internal_cv, mut internal, mut external) = (Vec::with_capacity(m), Vec::with_capacity(m), Vec::with_capacity(m));
            for o in 0..m {
                internal_cv.push(parse_field::<f64>(&record, 2 + 3 * o)?);
                internal.push(parse_field::<f64>(&record, 3 + 3 * o)?);
                external.push(parse_field::<f64>(&record, 4 + 3 * o)?);
            }
            solutions.push(Solution { fold, mask, internal_cv, internal, external });
        }
        if solutions.len() != masks.len() {
            return Err(Error::value(format!("{} and {} disagree on the number of solutions", FEATURES_FILE, FITNESSES_FILE)));
        }

        Ok(Solutions { objective_nicks, feature_names, solutions })
    }

    /// Rank of the n-th solution within its fold
    fn local_index(&self, n: usize) -> usize {
        let fold = self.solutions[n].fold;
        self.solutions[..n].iter().filter(|s| s.fold == fold).count()
    }
}

fn parse_field<T: std::str::FromStr>(record: &csv::StringRecord, idx: usize) -> Result<T> {
    let field = record.get(idx).unwrap_or("");
    field.trim().parse::<T>().map_err(|_| Error::value(format!("cannot parse '{}' in column {}", field, idx)))
}

#[cfg(test)]
impl Solutions {
    /// Two folds over six features, two objectives
    pub fn test() -> Solutions {
        let solution = |fold: usize, positions: &[usize], internal_cv: Vec<f64>, internal: Vec<f64>| Solution {
            fold,
            mask: FeatureMask::from_positions(6, positions),
            internal_cv,
            internal,
            external: vec![f64::NAN, f64::NAN],
        };
        Solutions {
            objective_nicks: crate::string_vec!["balanced_accuracy", "leanness"],
            feature_names: (0..6).map(|i| format!("f{}", i)).collect(),
            solutions: vec![
                solution(0, &[0, 1], vec![0.9, 0.75], vec![0.8, 0.75]),
                solution(0, &[0], vec![0.8, 0.875], vec![0.7, 0.875]),
                solution(1, &[0, 2], vec![1.0, 0.75], vec![0.6, 0.75]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hof::HofSnapshot;
    use crate::individual::Individual;
    use tempfile::tempdir;

    #[test]
    fn test_save_writes_the_csv_contracts() {
        let dir = tempdir().unwrap();
        Solutions::test().save(dir.path()).unwrap();
        let features = std::fs::read_to_string(dir.path().join(FEATURES_FILE)).unwrap();
        assert_eq!(features.lines().collect::<Vec<_>>(), vec!["fold,solution,f0,f1,f2", "0,0,1,1,0", "0,1,1,0,0", "1,0,1,0,1"]);
        let fitnesses = std::fs::read_to_string(dir.path().join(FITNESSES_FILE)).unwrap();
        let header = fitnesses.lines().next().unwrap();
        assert_eq!(header, "fold,solution,balanced_accuracy_internal_cv,balanced_accuracy_internal,balanced_accuracy_external,\
            leanness_internal_cv,leanness_internal,leanness_external");
        assert_eq!(fitnesses.lines().nth(1).unwrap(), "0,0,0.9,0.8,NaN,0.75,0.75,NaN");
    }

    #[test]
    fn test_load_reads_back_fitnesses_and_sets() {
        let dir = tempdir().unwrap();
        let saved = Solutions::test();
        saved.save(dir.path()).unwrap();
        let loaded = Solutions::load(dir.path()).unwrap();
        assert_eq!(loaded.objective_nicks, saved.objective_nicks);
        assert_eq!(loaded.feature_names, vec!["f0", "f1", "f2"]);
        assert_eq!(loaded.n_folds(), 2);
        assert_eq!(loaded.solutions[2].internal_cv, vec![1.0, 0.75]);
        assert!(loaded.solutions[2].external[0].is_nan());
        assert_eq!(loaded.solutions[2].mask.true_positions(), &[0, 2]);
    }

    #[test]
    fn test_from_union_uses_snapshot_test_fitness() {
        let mut union = HofUnion::new();
        union.add(HofSnapshot {
            nick: "pareto".to_string(),
            fold: 1,
            members: vec![Individual::test_with(&[3], vec![0.7, 0.875])],
            test_fitness: vec![vec![0.5, 0.875]],
        });
        let names: Vec<String> = (0..8).map(|i| format!("f{}", i)).collect();
        let solutions = Solutions::from_union(&union, &["ba".to_string(), "leanness".to_string()], &names);
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions.solutions[0].internal, vec![0.5, 0.875]);
        assert_eq!(solutions.solutions[0].internal_cv, vec![0.7, 0.875]);
        assert_eq!(solutions.n_folds(), 2);
    }
}
