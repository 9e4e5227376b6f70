//! Halls of fame: observers of the evolution that keep a policy-defined
//! subset of the individuals they are shown.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::individual::Individual;
use crate::mask::FeatureMask;
use crate::population::Population;
use crate::sorting::non_dominated_fronts;
use crate::utils::{parse_arg, parse_nick};

pub trait HallOfFame: Send + fmt::Debug {
    /// Name used as a directory component
    fn nick(&self) -> String;

    /// Offers newly evaluated individuals
    fn update(&mut self, new: &[Individual]);

    /// Called once with the final population
    fn signal_final(&mut self, population: &Population);

    /// Current members, deep copies
    fn hofers(&self) -> Vec<Individual>;
}

/// Builds a hall of fame from `pareto`, `top_by_sum(k)`, `participants`,
/// `last_pop`, `fronts(n)` or `union(a;b;...)`
pub fn hof_from_nick(nick: &str) -> Result<Box<dyn HallOfFame>> {
    let trimmed = nick.trim();
    if let Some(inner) = trimmed.strip_prefix("union(").and_then(|s| s.strip_suffix(')')) {
        let members = inner.split(';')
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(hof_from_nick)
            .collect::<Result<Vec<_>>>()?;
        if members.is_empty() {
            return Err(Error::value(format!("'{}' names no hall of fame", nick)));
        }
        return Ok(Box::new(Union::new(members)));
    }

    let (name, args) = parse_nick(trimmed)?;
    let hof: Box<dyn HallOfFame> = match name.as_str() {
        "pareto" | "pareto_front" => Box::new(ParetoFront::new()),
        "top_by_sum" => Box::new(TopBySum::new(parse_arg(nick, &args, 0)?)),
        "participants" => Box::new(Participants::new()),
        "last_pop" | "last_population" => Box::new(LastPop::new()),
        "fronts" => Box::new(Fronts::new(parse_arg(nick, &args, 0)?)),
        _ => return Err(Error::value(format!("unknown hall of fame '{}'", nick))),
    };
    Ok(hof)
}

#[derive(Debug, Default)]
pub struct ParetoFront {
    members: Vec<Individual>,
}

impl ParetoFront {
    pub fn new() -> ParetoFront {
        ParetoFront { members: Vec::new() }
    }

    fn offer(&mut self, candidate: &Individual) {
        if !candidate.valid {
            return;
        }
        let rejected = self.members.iter()
            .any(|m| m.mask == candidate.mask || m.fitness == candidate.fitness || m.dominates(candidate));
        if rejected {
            return;
        }
        self.members.retain(|m| !candidate.dominates(m));
        self.members.push(candidate.clone());
    }
}

impl HallOfFame for ParetoFront {
    fn nick(&self) -> String {
        "pareto".to_string()
    }

    fn update(&mut self, new: &[Individual]) {
        for i in new {
            self.offer(i);
        }
    }

    fn signal_final(&mut self, _population: &Population) {}

    fn hofers(&self) -> Vec<Individual> {
        self.members.clone()
    }
}

/// The `k` individuals with the largest sum of fitness values
#[derive(Debug)]
pub struct TopBySum {
    k: usize,
    members: Vec<Individual>,
}

impl TopBySum {
    pub fn new(k: usize) -> TopBySum {
        TopBySum { k, members: Vec::new() }
    }
}

impl HallOfFame for TopBySum {
    fn nick(&self) -> String {
        format!("top_by_sum{}", self.k)
    }

    fn update(&mut self, new: &[Individual]) {
        for i in new.iter().filter(|i| i.valid) {
            if !self.members.iter().any(|m| m.mask == i.mask) {
                self.members.push(i.clone());
            }
        }
        // stable: ties keep their arrival order
        self.members.sort_by(|a, b| b.fitness_sum().total_cmp(&a.fitness_sum()));
        self.members.truncate(self.k);
    }

    fn signal_final(&mut self, _population: &Population) {}

    fn hofers(&self) -> Vec<Individual> {
        self.members.clone()
    }
}

/// Every valid individual ever offered
#[derive(Debug, Default)]
pub struct Participants {
    seen: HashSet<FeatureMask>,
    members: Vec<Individual>,
}

impl Participants {
    pub fn new() -> Participants {
        Participants::default()
    }
}

impl HallOfFame for Participants {
    fn nick(&self) -> String {
        "participants".to_string()
    }

    fn update(&mut self, new: &[Individual]) {
        for i in new.iter().filter(|i| i.valid) {
            if self.seen.insert(i.mask.clone()) {
                self.members.push(i.clone());
            }
        }
    }

    fn signal_final(&mut self, _population: &Population) {}

    fn hofers(&self) -> Vec<Individual> {
        self.members.clone()
    }
}

/// The valid members of the final population
#[derive(Debug, Default)]
pub struct LastPop {
    members: Vec<Individual>,
}

impl LastPop {
    pub fn new() -> LastPop {
        LastPop::default()
    }
}

impl HallOfFame for LastPop {
    fn nick(&self) -> String {
        "last_pop".to_string()
    }

    fn update(&mut self, _new: &[Individual]) {}

    fn signal_final(&mut self, population: &Population) {
        let mut final_pop = Population::from_individuals(population.individuals.iter().filter(|i| i.valid).cloned().collect());
        final_pop.remove_clone();
        self.members = final_pop.individuals;
    }

    fn hofers(&self) -> Vec<Individual> {
        self.members.clone()
    }
}

/// The first `n` non-dominated layers of the final population
#[derive(Debug)]
pub struct Fronts {
    n: usize,
    members: Vec<Individual>,
}

impl Fronts {
    pub fn new(n: usize) -> Fronts {
        Fronts { n, members: Vec::new() }
    }
}

impl HallOfFame for Fronts {
    fn nick(&self) -> String {
        format!("fronts{}", self.n)
    }

    fn update(&mut self, _new: &[Individual]) {}

    fn signal_final(&mut self, population: &Population) {
        let mut unique = Population::from_individuals(population.individuals.iter().filter(|i| i.valid).cloned().collect());
        unique.remove_clone();
        let points: Vec<&[f64]> = unique.individuals.iter().map(|i| i.fitness.as_slice()).collect();
        let keep: Vec<usize> = non_dominated_fronts(&points).into_iter().take(self.n).flatten().collect();
        self.members = keep.into_iter().map(|i| unique.individuals[i].clone()).collect();
    }

    fn hofers(&self) -> Vec<Individual> {
        self.members.clone()
    }
}

/// Forwards to several halls of fame; members are de-duplicated by mask
#[derive(Debug)]
pub struct Union {
    members: Vec<Box<dyn HallOfFame>>,
}

impl Union {
    pub fn new(members: Vec<Box<dyn HallOfFame>>) -> Union {
        Union { members }
    }
}

impl HallOfFame for Union {
    fn nick(&self) -> String {
        format!("union-{}", self.members.iter().map(|h| h.nick()).collect::<Vec<_>>().join("-"))
    }

    fn update(&mut self, new: &[Individual]) {
        self.members.iter_mut().for_each(|h| h.update(new));
    }

    fn signal_final(&mut self, population: &Population) {
        self.members.iter_mut().for_each(|h| h.signal_final(population));
    }

    fn hofers(&self) -> Vec<Individual> {
        let mut seen: HashSet<FeatureMask> = HashSet::new();
        self.members.iter()
            .flat_map(|h| h.hofers())
            .filter(|i| seen.insert(i.mask.clone()))
            .collect()
    }
}

//-----------------------------------------------------------------------------
// Finished halls of fame
//-----------------------------------------------------------------------------

/// Members of one hall of fame at the end of one outer fold, with the
/// fitness measured on the fold's test samples
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HofSnapshot {
    pub nick: String,
    pub fold: usize,
    pub members: Vec<Individual>,
    pub test_fitness: Vec<Vec<f64>>,
}

impl HofSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        bincode::serialize_into(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<HofSnapshot> {
        let file = std::fs::File::open(path)?;
        Ok(bincode::deserialize_from(std::io::BufReader::new(file))?)
    }
}

/// Merges the snapshots of one hall of fame across folds
#[derive(Clone, Debug, Default)]
pub struct HofUnion {
    pub snapshots: Vec<HofSnapshot>,
}

impl HofUnion {
    pub fn new() -> HofUnion {
        HofUnion::default()
    }

    pub fn add(&mut self, snapshot: HofSnapshot) {
        self.snapshots.push(snapshot);
        self.snapshots.sort_by_key(|s| s.fold);
    }

    pub fn n_folds(&self) -> usize {
        self.snapshots.len()
    }

    /// (fold, member) pairs over every fold
    pub fn members(&self) -> impl Iterator<Item = (usize, &Individual)> {
        self.snapshots.iter().flat_map(|s| s.members.iter().map(move |m| (s.fold, m)))
    }

    /// Distinct masks over every fold
    pub fn distinct_masks(&self) -> Vec<FeatureMask> {
        let mut seen: HashSet<FeatureMask> = HashSet::new();
        self.members().map(|(_, m)| m.mask.clone()).filter(|m| seen.insert(m.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offered() -> Vec<Individual> {
        vec![
            Individual::test_with(&[0, 1], vec![1.0, 0.75]),
            Individual::test_with(&[0], vec![0.8, 0.875]),
            Individual::test_with(&[0, 1, 2], vec![0.9, 0.625]),
            Individual::test_with(&[3], vec![0.5, 0.875]),
            Individual::test_with(&[4, 5, 6, 7], vec![0.6, 0.5]),
        ]
    }

    fn is_closed(members: &[Individual]) -> bool {
        members.iter().all(|a| members.iter().all(|b| !a.dominates(b)))
    }

    #[test]
    fn test_pareto_front_keeps_non_dominated() {
        let mut hof = ParetoFront::new();
        hof.update(&offered());
        let members = hof.hofers();
        assert_eq!(members.len(), 2);
        assert!(is_closed(&members));

        // a newcomer dominating both evicts them
        hof.update(&[Individual::test_with(&[5], vec![1.0, 0.875])]);
        assert_eq!(hof.hofers().len(), 1);
        // equal fitness is rejected
        hof.update(&[Individual::test_with(&[6], vec![1.0, 0.875])]);
        assert_eq!(hof.hofers()[0].mask, FeatureMask::from_positions(8, &[5]));
    }

    #[test]
    fn test_invalid_individuals_are_never_added() {
        let mut invalid = Individual::test_with(&[1], vec![2.0, 2.0]);
        invalid.valid = false;
        let mut hofs: Vec<Box<dyn HallOfFame>> = ["pareto", "top_by_sum(3)", "participants", "last_pop", "fronts(2)"]
            .iter()
            .map(|n| hof_from_nick(n).unwrap())
            .collect();
        for hof in hofs.iter_mut() {
            hof.update(&[invalid.clone()]);
            hof.signal_final(&Population::from_individuals(vec![invalid.clone()]));
            assert!(hof.hofers().is_empty(), "{}", hof.nick());
        }
    }

    #[test]
    fn test_top_by_sum() {
        let mut hof = TopBySum::new(2);
        hof.update(&offered());
        let members = hof.hofers();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].mask, FeatureMask::from_positions(8, &[0, 1]));
        assert_eq!(members[1].mask, FeatureMask::from_positions(8, &[0]));
    }

    #[test]
    fn test_fronts_and_last_pop_use_the_final_population() {
        let population = Population::from_individuals(offered());
        let mut fronts = Fronts::new(2);
        fronts.update(&offered());
        assert!(fronts.hofers().is_empty());
        fronts.signal_final(&population);
        assert_eq!(fronts.hofers().len(), 4);

        let mut last = LastPop::new();
        last.signal_final(&population);
        assert_eq!(last.hofers().len(), 5);
    }

    #[test]
    fn test_union_deduplicates() {
        let mut hof = hof_from_nick("union(pareto; participants)").unwrap();
        hof.update(&offered());
        assert_eq!(hof.hofers().len(), 5);
        assert_eq!(hof.nick(), "union-pareto-participants");
        assert!(hof_from_nick("union()").is_err());
        assert!(hof_from_nick("hall").is_err());
    }

    #[test]
    fn test_snapshot_round_trip_and_union() {
        let dir = tempdir().unwrap();
        let snapshot = HofSnapshot { nick: "pareto".to_string(), fold: 1, members: offered(), test_fitness: vec![vec![0.5, 0.5]; 5] };
        let path = dir.path().join("hof.bin");
        snapshot.save(&path).unwrap();
        let loaded = HofSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);

        let mut union = HofUnion::new();
        union.add(loaded);
        union.add(HofSnapshot { nick: "pareto".to_string(), fold: 0, members: offered()[..2].to_vec(), test_fitness: vec![vec![1.0, 1.0]; 2] });
        assert_eq!(union.n_folds(), 2);
        assert_eq!(union.snapshots[0].fold, 0);
        assert_eq!(union.members().count(), 7);
        assert_eq!(union.distinct_masks().len(), 5);
    }
}
