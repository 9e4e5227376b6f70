use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::individual::Individual;
use crate::mask::FeatureMask;

#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Population {
    pub individuals: Vec<Individual>,
}

impl Population {
    pub fn new() -> Population {
        Population { individuals: Vec::new() }
    }

    pub fn from_individuals(individuals: Vec<Individual>) -> Population {
        Population { individuals }
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    pub fn add(&mut self, population: Population) {
        self.individuals.extend(population.individuals);
    }

    /// Positions of the individuals still waiting for an evaluation
    pub fn unevaluated(&self) -> Vec<usize> {
        self.individuals.iter().enumerate().filter(|(_, i)| !i.evaluated).map(|(n, _)| n).collect()
    }

    pub fn valid(&self) -> Vec<&Individual> {
        self.individuals.iter().filter(|i| i.valid).collect()
    }

    /// Removes duplicated masks, keeping first occurrences. Returns the number removed.
    pub fn remove_clone(&mut self) -> usize {
        let before = self.individuals.len();
        let mut seen: HashSet<FeatureMask> = HashSet::new();
        self.individuals.retain(|i| seen.insert(i.mask.clone()));
        before - self.individuals.len()
    }

    /// Mean of the masks as 0/1 vectors, over the first `n_features` positions
    pub fn mean_mask(&self, n_features: usize) -> Vec<f64> {
        let mut mean = vec![0.0; n_features];
        if self.individuals.is_empty() {
            return mean;
        }
        for i in &self.individuals {
            for p in i.mask.true_positions() {
                if *p < n_features {
                    mean[*p] += 1.0;
                }
            }
        }
        let n = self.individuals.len() as f64;
        mean.iter_mut().for_each(|v| *v /= n);
        mean
    }

    /// Selected features of at least one individual
    pub fn feature_union(&self, n_features: usize) -> FeatureMask {
        self.individuals.iter().fold(FeatureMask::empty(n_features), |acc, i| acc.union(&i.mask))
    }

    /// Min, mean and max of each objective over the valid individuals
    pub fn fitness_summary(&self, n_objectives: usize) -> Vec<(f64, f64, f64)> {
        let valid = self.valid();
        (0..n_objectives)
            .map(|o| {
                if valid.is_empty() {
                    return (f64::NAN, f64::NAN, f64::NAN);
                }
                let values: Vec<f64> = valid.iter().map(|i| i.fitness[o]).collect();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (min, values.iter().sum::<f64>() / values.len() as f64, max)
            })
            .collect()
    }

    pub fn mean_k(&self) -> f64 {
        if self.individuals.is_empty() {
            return 0.0;
        }
        self.individuals.iter().map(|i| i.k() as f64).sum::<f64>() / self.individuals.len() as f64
    }
}

impl fmt::Debug for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Population of {} individuals", self.individuals.len())?;
        for (n, i) in self.individuals.iter().enumerate() {
            writeln!(f, "#{:<4} rank {} {:?}", n, i.rank, i)?;
        }
        Ok(())
    }
}

//-----------------------------------------------------------------------------
// Traces kept along the evolution
//-----------------------------------------------------------------------------

/// Number of individuals selecting each feature, per generation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeatureCounts {
    n_features: usize,
    rows: Vec<(usize, Vec<usize>)>,
}

impl FeatureCounts {
    pub fn new(n_features: usize) -> FeatureCounts {
        FeatureCounts { n_features, rows: Vec::new() }
    }

    pub fn record(&mut self, generation: usize, population: &Population) {
        let mut counts = vec![0; self.n_features];
        for i in &population.individuals {
            for p in i.mask.true_positions() {
                if *p < self.n_features {
                    counts[*p] += 1;
                }
            }
        }
        self.rows.push((generation, counts));
    }

    pub fn rows(&self) -> &[(usize, Vec<usize>)] {
        &self.rows
    }

    /// Features selected at least once over all recorded generations
    pub fn ever_selected(&self) -> Vec<usize> {
        (0..self.n_features).filter(|f| self.rows.iter().any(|(_, c)| c[*f] > 0)).collect()
    }

    /// `gen` column then one column per ever-selected feature; zero-only columns are omitted
    pub fn save(&self, path: &Path, feature_names: &[String]) -> Result<()> {
        let columns = self.ever_selected();
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["gen".to_string()];
        header.extend(columns.iter().map(|f| feature_names.get(*f).cloned().unwrap_or_else(|| f.to_string())));
        writer.write_record(&header)?;
        for (generation, counts) in &self.rows {
            let mut record = vec![generation.to_string()];
            record.extend(columns.iter().map(|f| counts[*f].to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Features reached by the search since the last reset
#[derive(Clone, Debug, PartialEq)]
pub struct ExploredFeatures {
    explored: FeatureMask,
}

impl ExploredFeatures {
    pub fn new(n_features: usize) -> ExploredFeatures {
        ExploredFeatures { explored: FeatureMask::empty(n_features) }
    }

    pub fn update(&mut self, population: &Population) {
        for i in &population.individuals {
            self.explored = self.explored.union(&i.mask);
        }
    }

    pub fn count(&self) -> usize {
        self.explored.count()
    }

    pub fn as_mask(&self) -> &FeatureMask {
        &self.explored
    }

    pub fn reset(&mut self) {
        self.explored = FeatureMask::empty(self.explored.len());
    }
}

#[cfg(test)]
impl Population {
    /// Five evaluated individuals over 8 features, two objectives
    pub fn test() -> Population {
        Population::from_individuals(vec![
            Individual::test_with(&[0, 1], vec![1.0, 0.75]),
            Individual::test_with(&[0], vec![0.8, 0.875]),
            Individual::test_with(&[0, 1, 2], vec![0.9, 0.625]),
            Individual::test_with(&[3], vec![0.5, 0.875]),
            Individual::test_with(&[4, 5, 6, 7], vec![0.6, 0.5]),
        ])
    }
}
