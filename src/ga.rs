use log::{debug, info, warn};
use rand::seq::index;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cinfo;
use crate::data::{Data, Outcome, OutcomeKind};
use crate::error::{Error, Result};
use crate::hof::HallOfFame;
use crate::individual::Individual;
use crate::learner::univariate_cox_scores;
use crate::mask::FeatureMask;
use crate::param::{MutationKind, Param, Selection};
use crate::pool::EvaluationPool;
use crate::population::{ExploredFeatures, FeatureCounts, Population};
use crate::sorting::Sorter;
use crate::utils::{parse_arg, parse_nick};

/// Expected number of features drawn by `binomial` without an explicit p
const DEFAULT_EXPECTED_FEATURES: f64 = 10.0;
/// Floor applied to sampling weights so that no active feature is unreachable
const MIN_WEIGHT: f64 = 1e-6;

//-----------------------------------------------------------------------------
// Initial features
//-----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum InitialFeatures {
    /// Exactly k features, k drawn uniformly in [min, max]
    Uniform { min: usize, max: usize },
    /// Each active feature independently with probability p
    Binomial { p: Option<f64> },
    /// Binomial whose expected size is drawn uniformly in [min, max]
    BinomialFromUniform { min: usize, max: usize },
}

impl InitialFeatures {
    pub fn from_nick(nick: &str) -> Result<InitialFeatures> {
        let (name, args) = parse_nick(nick)?;
        let distribution = match name.as_str() {
            "uniform" => InitialFeatures::Uniform { min: parse_arg(nick, &args, 0)?, max: parse_arg(nick, &args, 1)? },
            "binomial" => {
                let p = if args.is_empty() { None } else { Some(parse_arg::<f64>(nick, &args, 0)?) };
                if let Some(p) = p {
                    if !(0.0..=1.0).contains(&p) {
                        return Err(Error::value(format!("'{}': p must be in [0, 1]", nick)));
                    }
                }
                InitialFeatures::Binomial { p }
            }
            "binomial_from_uniform" => InitialFeatures::BinomialFromUniform {
                min: parse_arg(nick, &args, 0)?,
                max: parse_arg(nick, &args, 1)?,
            },
            _ => return Err(Error::value(format!("unknown initial features distribution '{}'", nick))),
        };
        match distribution {
            InitialFeatures::Uniform { min, max } | InitialFeatures::BinomialFromUniform { min, max } if min > max => {
                Err(Error::value(format!("'{}': min > max", nick)))
            }
            d => Ok(d),
        }
    }

    pub fn nick(&self) -> String {
        match self {
            InitialFeatures::Uniform { min, max } => format!("uniform({},{})", min, max),
            InitialFeatures::Binomial { p: None } => "binomial".to_string(),
            InitialFeatures::Binomial { p: Some(p) } => format!("binomial({})", p),
            InitialFeatures::BinomialFromUniform { min, max } => format!("binomial_from_uniform({},{})", min, max),
        }
    }
}

/// Draws random masks over the active part of the feature space.
/// A drawn mask is never empty while at least one feature is active.
#[derive(Clone, Debug)]
pub struct MaskSampler {
    pub distribution: InitialFeatures,
    active: FeatureMask,
    weights: Option<Vec<f64>>,
}

impl MaskSampler {
    pub fn new(distribution: InitialFeatures, n_features: usize) -> MaskSampler {
        MaskSampler { distribution, active: FeatureMask::full(n_features), weights: None }
    }

    /// Per-feature sampling weights over the whole feature space
    pub fn with_weights(mut self, weights: Vec<f64>) -> MaskSampler {
        if weights.len() == self.active.len() {
            self.weights = Some(weights.iter().map(|w| if w.is_finite() { w.max(MIN_WEIGHT) } else { MIN_WEIGHT }).collect());
        } else {
            warn!("Ignoring {} sampling weights for {} features", weights.len(), self.active.len());
        }
        self
    }

    pub fn restrict(&mut self, active: FeatureMask) {
        self.active = active;
    }

    pub fn active(&self) -> &FeatureMask {
        &self.active
    }

    pub fn n_features(&self) -> usize {
        self.active.len()
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> FeatureMask {
        let active = self.active.true_positions();
        let n = active.len();
        if n == 0 {
            return FeatureMask::empty(self.active.len());
        }
        let weights: Option<Vec<f64>> = self.weights.as_ref().map(|w| active.iter().map(|p| w[*p]).collect());

        let chosen: Vec<usize> = match &self.distribution {
            InitialFeatures::Uniform { min, max } => {
                let lo = (*min).clamp(1, n);
                let hi = (*max).clamp(lo, n);
                let k = rng.gen_range(lo..=hi);
                choose_k(n, k, weights.as_deref(), rng)
            }
            InitialFeatures::Binomial { p } => {
                let p = p.unwrap_or((DEFAULT_EXPECTED_FEATURES / n as f64).min(1.0));
                bernoulli(n, p, weights.as_deref(), rng)
            }
            InitialFeatures::BinomialFromUniform { min, max } => {
                let lo = (*min).min(n);
                let hi = (*max).clamp(lo, n);
                let target = rng.gen_range(lo..=hi) as f64;
                bernoulli(n, target / n as f64, weights.as_deref(), rng)
            }
        };

        let chosen = if chosen.is_empty() { choose_k(n, 1, weights.as_deref(), rng) } else { chosen };
        let positions: Vec<usize> = chosen.iter().map(|i| active[*i]).collect();
        FeatureMask::from_positions(self.active.len(), &positions)
    }
}

fn choose_k(n: usize, k: usize, weights: Option<&[f64]>, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let k = k.min(n);
    if let Some(w) = weights {
        if let Ok(picked) = index::sample_weighted(rng, n, |i| w[i], k) {
            return picked.into_vec();
        }
    }
    index::sample(rng, n, k).into_vec()
}

fn bernoulli(n: usize, p: f64, weights: Option<&[f64]>, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
    match weights {
        Some(w) => {
            let mean = w.iter().sum::<f64>() / n as f64;
            (0..n).filter(|i| rng.gen_bool((p * w[*i] / mean).clamp(0.0, 1.0))).collect()
        }
        None => (0..n).filter(|_| rng.gen_bool(p)).collect(),
    }
}

/// Sampling weights proportional to the univariate Cox score statistic of
/// each feature against the first survival outcome, if there is one
pub fn cox_fi_weights(data: &Data) -> Option<Vec<f64>> {
    match data.first_outcome(OutcomeKind::Survival) {
        Ok(Outcome::Survival { duration, event, .. }) => {
            let scores = univariate_cox_scores(&data.x, duration, event);
            debug!("Cox feature importance: {:?}", scores);
            Some(scores)
        }
        _ => None,
    }
}

//-----------------------------------------------------------------------------
// Variation
//-----------------------------------------------------------------------------

/// Uniform cross-over: each gene on which the parents disagree is swapped
/// between the two children with probability `prob`
///
/// # Arguments
///
/// * `a` - First parent mask.
/// * `b` - Second parent mask.
/// * `prob` - Per-gene swap probability.
/// * `rng` - Random number generator.
///
/// # Returns
///
/// The two children masks, in parents order.
pub fn cross_over(a: &FeatureMask, b: &FeatureMask, prob: f64, rng: &mut ChaCha8Rng) -> (FeatureMask, FeatureMask) {
    let mut first = a.clone();
    let mut second = b.clone();
    for position in a.symmetric_difference(b) {
        if rng.gen_bool(prob) {
            first.flip(position);
            second.flip(position);
        }
    }
    (first, second)
}

/// Mutates a mask in place, touching only the positions of `active`
///
/// `Flip` flips each active bit with probability `frequency`. `Symmetric`
/// spends an expected budget of `frequency * |active|` flips, split equally
/// between removals and additions; when one side is empty the other side
/// takes the whole budget.
///
/// # Returns
///
/// The number of (removed, added) features.
pub fn mutate(mask: &mut FeatureMask, kind: MutationKind, frequency: f64, active: &FeatureMask, rng: &mut ChaCha8Rng) -> (usize, usize) {
    let positions = active.true_positions();
    let (p_remove, p_add) = match kind {
        MutationKind::Flip => (frequency, frequency),
        MutationKind::Symmetric => {
            let ones = positions.iter().filter(|p| mask.get(**p)).count();
            let zeros = positions.len() - ones;
            let budget = frequency * positions.len() as f64;
            let (to_remove, to_add) = match (ones, zeros) {
                (0, _) => (0.0, budget),
                (_, 0) => (budget, 0.0),
                _ => (budget / 2.0, budget / 2.0),
            };
            let rate = |b: f64, n: usize| if n == 0 { 0.0 } else { (b / n as f64).min(1.0) };
            (rate(to_remove, ones), rate(to_add, zeros))
        }
    };

    let (mut removed, mut added) = (0, 0);
    for position in positions {
        if mask.get(*position) {
            if rng.gen_bool(p_remove.clamp(0.0, 1.0)) {
                mask.set(*position, false);
                removed += 1;
            }
        } else if rng.gen_bool(p_add.clamp(0.0, 1.0)) {
            mask.set(*position, true);
            added += 1;
        }
    }
    (removed, added)
}

/// Redraws offspring whose mask already occurs `quota` times among the
/// population and the earlier offspring, up to `attempts` draws each.
/// A redrawn mask must itself be under the quota.
///
/// # Returns
///
/// The number of offspring that received a new mask.
pub fn repurpose_clones(offspring: &mut [Individual], population: &[Individual], sampler: &MaskSampler,
    quota: usize, attempts: usize, rng: &mut ChaCha8Rng) -> usize {
    let quota = quota.max(1);
    let mut seen: HashMap<FeatureMask, usize> = HashMap::new();
    for individual in population {
        *seen.entry(individual.mask.clone()).or_insert(0) += 1;
    }
    let occurrences = |seen: &HashMap<FeatureMask, usize>, mask: &FeatureMask| seen.get(mask).copied().unwrap_or(0);

    let mut repurposed = 0;
    for child in offspring.iter_mut() {
        if occurrences(&seen, &child.mask) >= quota {
            for _ in 0..attempts {
                let mask = sampler.sample(rng);
                if occurrences(&seen, &mask) < quota {
                    child.set_mask(mask);
                    repurposed += 1;
                    break;
                }
            }
        }
        *seen.entry(child.mask.clone()).or_insert(0) += 1;
    }
    repurposed
}

/// Binary tournament on a sorted population: the better placed of two
/// uniformly drawn positions
fn tournament(n: usize, rng: &mut ChaCha8Rng) -> usize {
    let a = rng.gen_range(0..n);
    let b = rng.gen_range(0..n);
    a.min(b)
}

/// Binary tournament survival without replacement over an already sorted
/// pool. Winners keep their sorted order.
fn tournament_survival(sorted: Vec<Individual>, n: usize, rng: &mut ChaCha8Rng) -> Vec<Individual> {
    if sorted.len() <= n {
        return sorted;
    }
    let mut remaining: Vec<usize> = (0..sorted.len()).collect();
    let mut winners: Vec<usize> = Vec::with_capacity(n);
    while winners.len() < n {
        let drawn = index::sample(rng, remaining.len(), 2.min(remaining.len())).into_vec();
        let best = drawn.iter().copied().min_by_key(|d| remaining[*d]).unwrap_or(0);
        winners.push(remaining.remove(best));
    }
    winners.sort_unstable();
    let mut slots: Vec<Option<Individual>> = sorted.into_iter().map(Some).collect();
    winners.iter().filter_map(|w| slots[*w].take()).collect()
}

//-----------------------------------------------------------------------------
// Generations strategy and logbook
//-----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Default)]
pub struct GenerationsStrategy {
    pub sweeps: Vec<usize>,
    pub concatenated: usize,
}

impl GenerationsStrategy {
    /// Phases in execution order: (generations, ends with a sweep restart)
    pub fn phases(&self) -> Vec<(usize, bool)> {
        let mut phases: Vec<(usize, bool)> = self.sweeps.iter().map(|g| (*g, true)).collect();
        phases.push((self.concatenated, false));
        phases
    }

    pub fn total(&self) -> usize {
        self.sweeps.iter().sum::<usize>() + self.concatenated
    }

    pub fn nick(&self) -> String {
        let mut parts: Vec<String> = self.sweeps.iter().map(|s| format!("s{}", s)).collect();
        parts.push(format!("c{}", self.concatenated));
        parts.join("-")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GaSettings {
    pub pop_size: usize,
    pub mating_prob: f64,
    pub mutation: MutationKind,
    pub mutation_frequency: f64,
    pub selection: Selection,
    pub clone_repurposing: bool,
    /// Copies of a mask tolerated before repurposing
    pub clone_quota: usize,
    pub clone_repurposing_attempts: usize,
    pub generations: GenerationsStrategy,
    pub display_colorful: bool,
}

impl GaSettings {
    pub fn from_param(param: &Param) -> GaSettings {
        GaSettings {
            pop_size: param.ga.pop_size,
            mating_prob: param.ga.mating_prob,
            mutation: param.ga.mutation,
            mutation_frequency: param.ga.mutation_frequency,
            selection: param.ga.selection,
            clone_repurposing: param.ga.clone_repurposing,
            clone_quota: param.ga.clone_quota,
            clone_repurposing_attempts: param.ga.clone_repurposing_attempts,
            generations: GenerationsStrategy {
                sweeps: param.ga.generations.sweeps.clone(),
                concatenated: param.ga.generations.concatenated,
            },
            display_colorful: param.general.display_colorful,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogbookEntry {
    pub generation: usize,
    pub phase: usize,
    pub evaluations: usize,
    pub n_valid: usize,
    pub front_size: usize,
    pub mean_k: f64,
    /// (min, mean, max) per objective over the valid individuals
    pub fitness: Vec<(f64, f64, f64)>,
    pub elapsed_secs: f64,
}

/// One line per generation, generation 0 being the initial population
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Logbook {
    pub objective_nicks: Vec<String>,
    pub entries: Vec<LogbookEntry>,
}

impl Logbook {
    pub fn new(objective_nicks: Vec<String>) -> Logbook {
        Logbook { objective_nicks, entries: Vec::new() }
    }

    pub fn record(&mut self, generation: usize, phase: usize, evaluations: usize, population: &Population, elapsed_secs: f64) -> &LogbookEntry {
        let entry = LogbookEntry {
            generation,
            phase,
            evaluations,
            n_valid: population.valid().len(),
            front_size: population.individuals.iter().filter(|i| i.valid && i.rank == 0).count(),
            mean_k: population.mean_k(),
            fitness: population.fitness_summary(self.objective_nicks.len()),
            elapsed_secs,
        };
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<String> = crate::string_vec!["gen", "phase", "evaluations", "n_valid", "front_size", "mean_k"];
        for nick in &self.objective_nicks {
            header.extend([format!("{}_min", nick), format!("{}_mean", nick), format!("{}_max", nick)]);
        }
        header.push("elapsed".to_string());
        writer.write_record(&header)?;
        for e in &self.entries {
            let mut record = vec![
                e.generation.to_string(),
                e.phase.to_string(),
                e.evaluations.to_string(),
                e.n_valid.to_string(),
                e.front_size.to_string(),
                format!("{}", e.mean_k),
            ];
            for (min, mean, max) in &e.fitness {
                record.extend([format!("{}", min), format!("{}", mean), format!("{}", max)]);
            }
            record.push(format!("{:.3}", e.elapsed_secs));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn display_generation(entry: &LogbookEntry, objective_nicks: &[String]) -> String {
    let objectives: Vec<String> = objective_nicks.iter()
        .zip(entry.fitness.iter())
        .map(|(nick, (_, mean, max))| format!("{} \x1b[1;92m{:.3}\x1b[0m ({:.3})", nick, max, mean))
        .collect();
    format!(
        "\x1b[1;93m#{:<4}\x1b[0m | front {:>3} | valid {:>4} | evals {:>4} | k {:>5.1} | {}",
        entry.generation, entry.front_size, entry.n_valid, entry.evaluations, entry.mean_k, objectives.join(" | ")
    )
}

//-----------------------------------------------------------------------------
// Genetic Algorithm core functions
//-----------------------------------------------------------------------------

pub struct OptimizerResult {
    pub population: Population,
    pub logbook: Logbook,
    pub feature_counts: FeatureCounts,
    pub generations: usize,
    /// True when the running flag stopped the evolution early
    pub interrupted: bool,
}

/// Main function to run the genetic algorithm
///
/// # Arguments
///
/// * `pool` - Evaluation pool holding the inner-CV evaluator.
/// * `sorter` - Non-dominated sorter and secondary comparator.
/// * `sampler` - Initial-features distribution, restricted after each sweep.
/// * `settings` - Genetic operators and generations strategy.
/// * `hofs` - Halls of fame observing the evolution.
/// * `seed` - Seed of the evolution RNG.
/// * `running` - Atomic boolean to control the running state of the algorithm.
///
/// # Returns
///
/// The final population sorted best first, with the logbook and the per-generation feature counts.
pub fn ga(
    pool: &mut EvaluationPool,
    sorter: &Sorter,
    mut sampler: MaskSampler,
    settings: &GaSettings,
    hofs: &mut [Box<dyn HallOfFame>],
    seed: u64,
    running: Arc<AtomicBool>,
) -> Result<OptimizerResult> {
    let time = Instant::now();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let objective_nicks: Vec<String> = pool.evaluator().objectives().iter().map(|o| o.nick.clone()).collect();
    let n_features = sampler.n_features();

    let mut logbook = Logbook::new(objective_nicks.clone());
    let mut feature_counts = FeatureCounts::new(n_features);
    let mut explored = ExploredFeatures::new(n_features);

    let mut generation = 0;
    let (mut pop, evaluations) = generate_pop(pool, sorter, &sampler, settings, hofs, generation, &mut rng)?;
    info!("Population size: {}, mean k {:.1}, {} active features", pop.len(), pop.mean_k(), sampler.active().count());
    explored.update(&pop);
    feature_counts.record(generation, &pop);
    let entry = logbook.record(generation, 0, evaluations, &pop, time.elapsed().as_secs_f64());
    cinfo!(settings.display_colorful, "{}", display_generation(entry, &objective_nicks));

    let mut interrupted = false;
    let phases = settings.generations.phases();
    'phases: for (phase, (n_generations, is_sweep)) in phases.iter().enumerate() {
        for _ in 0..*n_generations {
            if !running.load(Ordering::Relaxed) {
                info!("Signal received");
                interrupted = true;
                break 'phases;
            }
            generation += 1;
            let (next, evaluations) = evolve(pop, pool, sorter, &sampler, settings, hofs, generation, &mut rng)?;
            pop = next;

            explored.update(&pop);
            feature_counts.record(generation, &pop);
            let entry = logbook.record(generation, phase, evaluations, &pop, time.elapsed().as_secs_f64());
            cinfo!(settings.display_colorful, "{}", display_generation(entry, &objective_nicks));
        }

        if *is_sweep {
            if explored.count() > 0 {
                sampler.restrict(explored.as_mask().clone());
            }
            info!("Sweep {} done: active space shrunk to {} features", phase + 1, sampler.active().count());
            explored.reset();
            let (restarted, evaluations) = generate_pop(pool, sorter, &sampler, settings, hofs, generation, &mut rng)?;
            pop = restarted;
            explored.update(&pop);
            feature_counts.record(generation, &pop);
            logbook.record(generation, phase + 1, evaluations, &pop, time.elapsed().as_secs_f64());
        }
    }

    for hof in hofs.iter_mut() {
        hof.signal_final(&pop);
    }

    info!("Genetic algorithm computed {} generations in {:.2?}", generation, time.elapsed());
    Ok(OptimizerResult { population: pop, logbook, feature_counts, generations: generation, interrupted })
}

/// Draws, evaluates and sorts a fresh population
///
/// # Returns
///
/// The sorted population and the number of evaluations it required.
pub fn generate_pop(
    pool: &mut EvaluationPool,
    sorter: &Sorter,
    sampler: &MaskSampler,
    settings: &GaSettings,
    hofs: &mut [Box<dyn HallOfFame>],
    generation: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(Population, usize)> {
    let mut individuals: Vec<Individual> = (0..settings.pop_size)
        .map(|_| Individual::new(sampler.sample(rng), generation))
        .collect();
    if settings.clone_repurposing {
        let n = repurpose_clones(&mut individuals, &[], sampler, settings.clone_quota, settings.clone_repurposing_attempts, rng);
        debug!("{} initial clones repurposed", n);
    }

    let fresh = evaluate(pool, &mut individuals)?;
    let new: Vec<Individual> = fresh.iter().map(|i| individuals[*i].clone()).collect();
    for hof in hofs.iter_mut() {
        hof.update(&new);
    }

    sorter.sort(&mut individuals, settings.pop_size);
    Ok((Population::from_individuals(individuals), fresh.len()))
}

/// Run one evolution step: parents tournament, cross-over, mutation,
/// evaluation, sorting and survival
///
/// # Arguments
///
/// * `pop` - The current population, sorted best first.
/// * `pool` - Evaluation pool.
/// * `sorter` - Sorter used for the survival.
/// * `sampler` - Provides the active features and the repurposing distribution.
/// * `settings` - Genetic operators.
/// * `hofs` - Halls of fame receiving the newly evaluated offspring.
/// * `generation` - The current generation number.
/// * `rng` - Random number generator.
///
/// # Returns
///
/// The next sorted population and the number of evaluations performed.
#[allow(clippy::too_many_arguments)]
pub fn evolve(
    pop: Population,
    pool: &mut EvaluationPool,
    sorter: &Sorter,
    sampler: &MaskSampler,
    settings: &GaSettings,
    hofs: &mut [Box<dyn HallOfFame>],
    generation: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(Population, usize)> {
    let n = pop.len();
    if n == 0 {
        return Err(Error::illegal("cannot evolve an empty population"));
    }

    let mut offspring: Vec<Individual> = Vec::with_capacity(settings.pop_size);
    while offspring.len() < settings.pop_size {
        let a = &pop.individuals[tournament(n, rng)];
        let b = &pop.individuals[tournament(n, rng)];
        let (first, second) = cross_over(&a.mask, &b.mask, settings.mating_prob, rng);
        for (parent, mut mask) in [(a, first), (b, second)] {
            if offspring.len() >= settings.pop_size {
                break;
            }
            mutate(&mut mask, settings.mutation, settings.mutation_frequency, sampler.active(), rng);
            let mut child = Individual::child(parent, generation);
            child.set_mask(mask);
            offspring.push(child);
        }
    }

    if settings.clone_repurposing {
        let n = repurpose_clones(&mut offspring, &pop.individuals, sampler, settings.clone_quota, settings.clone_repurposing_attempts, rng);
        debug!("{} clones repurposed", n);
    }

    let fresh = evaluate(pool, &mut offspring)?;
    let new: Vec<Individual> = fresh.iter().map(|i| offspring[*i].clone()).collect();
    for hof in hofs.iter_mut() {
        hof.update(&new);
    }

    let mut combined = pop.individuals;
    combined.extend(offspring);
    let survivors = match settings.selection {
        Selection::Elitist => sorter.select(combined, settings.pop_size),
        Selection::Tournament => {
            sorter.sort(&mut combined, settings.pop_size);
            let mut survivors = tournament_survival(combined, settings.pop_size, rng);
            sorter.sort(&mut survivors, settings.pop_size);
            survivors
        }
    };

    Ok((Population::from_individuals(survivors), fresh.len()))
}

/// Evaluates the individuals that need it through the pool
///
/// # Returns
///
/// Positions of the individuals evaluated by this call.
fn evaluate(pool: &mut EvaluationPool, individuals: &mut [Individual]) -> Result<Vec<usize>> {
    let pending: Vec<usize> = individuals.iter().enumerate().filter(|(_, i)| !i.evaluated).map(|(n, _)| n).collect();
    let masks: Vec<FeatureMask> = pending.iter().map(|n| individuals[*n].mask.clone()).collect();
    let records = pool.evaluate_batch(&masks)?;
    for (n, record) in pending.iter().zip(records) {
        individuals[*n].apply_record(record);
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluator;
    use crate::hof::hof_from_nick;
    use crate::param::Algorithm;
    use crate::sorting::SecondarySorter;

    fn settings(pop_size: usize, concatenated: usize) -> GaSettings {
        GaSettings {
            pop_size,
            mating_prob: 0.5,
            mutation: MutationKind::Symmetric,
            mutation_frequency: 0.25,
            selection: Selection::Elitist,
            clone_repurposing: true,
            clone_quota: 1,
            clone_repurposing_attempts: 5,
            generations: GenerationsStrategy { sweeps: vec![], concatenated },
            display_colorful: false,
        }
    }

    fn run(settings: &GaSettings, seed: u64, running: bool) -> (OptimizerResult, Vec<Box<dyn HallOfFame>>) {
        let mut pool = EvaluationPool::new(Arc::new(Evaluator::test()), 2).unwrap();
        let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::CrowdingDistance, 2, 12);
        let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 4 }, 4);
        let mut hofs = vec![hof_from_nick("pareto").unwrap()];
        let result = ga(&mut pool, &sorter, sampler, settings, &mut hofs, seed, Arc::new(AtomicBool::new(running))).unwrap();
        (result, hofs)
    }

    #[test]
    fn test_initial_features_nicks() {
        assert_eq!(InitialFeatures::from_nick("uniform(1, 5)").unwrap(), InitialFeatures::Uniform { min: 1, max: 5 });
        assert_eq!(InitialFeatures::from_nick("binomial").unwrap(), InitialFeatures::Binomial { p: None });
        assert_eq!(InitialFeatures::from_nick("binomial(0.2)").unwrap().nick(), "binomial(0.2)");
        assert!(InitialFeatures::from_nick("uniform(5,1)").is_err());
        assert!(InitialFeatures::from_nick("binomial(2)").is_err());
        assert!(InitialFeatures::from_nick("gaussian").is_err());
    }

    #[test]
    fn test_sampler_respects_active_and_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut sampler = MaskSampler::new(InitialFeatures::Uniform { min: 2, max: 3 }, 20);
        sampler.restrict(FeatureMask::from_positions(20, &[3, 7, 11, 12, 19]));
        for _ in 0..200 {
            let mask = sampler.sample(&mut rng);
            assert!((2..=3).contains(&mask.count()));
            assert!(mask.true_positions().iter().all(|p| sampler.active().get(*p)));
        }
    }

    #[test]
    fn test_binomial_is_never_empty_and_defaults_to_ten_features() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let sampler = MaskSampler::new(InitialFeatures::Binomial { p: Some(0.0) }, 30);
        assert!((0..50).all(|_| sampler.sample(&mut rng).count() == 1));

        let sampler = MaskSampler::new(InitialFeatures::Binomial { p: None }, 200);
        let mean = (0..2000).map(|_| sampler.sample(&mut rng).count() as f64).sum::<f64>() / 2000.0;
        assert!((mean - 10.0).abs() < 0.5, "mean size {}", mean);
    }

    #[test]
    fn test_weights_concentrate_sampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut weights = vec![1e-9; 10];
        weights[4] = 1000.0;
        let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 1 }, 10).with_weights(weights);
        let hits = (0..500).filter(|_| sampler.sample(&mut rng).get(4)).count();
        assert!(hits > 450, "weighted feature drawn {} times", hits);
    }

    #[test]
    fn test_cross_over_only_swaps_disagreements() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let a = FeatureMask::from_positions(12, &[0, 1, 2, 5, 8]);
        let b = FeatureMask::from_positions(12, &[1, 2, 3, 9, 10, 11]);
        for _ in 0..50 {
            let (c1, c2) = cross_over(&a, &b, 0.5, &mut rng);
            assert_eq!(c1.union(&c2), a.union(&b));
            assert_eq!(c1.intersection(&c2), a.intersection(&b));
            assert_eq!(c1.count() + c2.count(), a.count() + b.count());
        }
        let (c1, c2) = cross_over(&a, &b, 0.0, &mut rng);
        assert_eq!((c1, c2), (a.clone(), b.clone()));
        let (c1, c2) = cross_over(&a, &b, 1.0, &mut rng);
        assert_eq!((c1, c2), (b, a));
    }

    #[test]
    fn test_symmetric_mutation_expected_flips() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let active = FeatureMask::full(100);
        let start = FeatureMask::from_positions(100, &(0..40).collect::<Vec<_>>());
        let trials = 10_000;
        let (mut removed, mut added) = (0usize, 0usize);
        for _ in 0..trials {
            let mut mask = start.clone();
            let (r, a) = mutate(&mut mask, MutationKind::Symmetric, 0.2, &active, &mut rng);
            removed += r;
            added += a;
        }
        let mean = (removed + added) as f64 / trials as f64;
        assert!((mean - 20.0).abs() < 1.0, "mean flips {}", mean);
        let balance = removed as f64 / (removed + added) as f64;
        assert!((balance - 0.5).abs() < 0.02, "removal share {}", balance);
    }

    #[test]
    fn test_symmetric_mutation_redistributes_budget() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let active = FeatureMask::full(50);
        let mut added = 0;
        for _ in 0..2000 {
            let mut mask = FeatureMask::empty(50);
            let (r, a) = mutate(&mut mask, MutationKind::Symmetric, 0.1, &active, &mut rng);
            assert_eq!(r, 0);
            added += a;
        }
        assert!((added as f64 / 2000.0 - 5.0).abs() < 0.3);
    }

    #[test]
    fn test_mutation_honours_active_mask() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let active = FeatureMask::from_positions(10, &[1, 2, 3]);
        for kind in [MutationKind::Flip, MutationKind::Symmetric] {
            let mut mask = FeatureMask::from_positions(10, &[1, 8]);
            for _ in 0..100 {
                mutate(&mut mask, kind, 0.9, &active, &mut rng);
                assert!(mask.get(8), "inactive positions are never touched");
                assert!(mask.true_positions().iter().all(|p| *p == 8 || active.get(*p)));
            }
        }
        let mut mask = FeatureMask::from_positions(10, &[1]);
        assert_eq!(mutate(&mut mask, MutationKind::Flip, 0.0, &active, &mut rng), (0, 0));
    }

    #[test]
    fn test_repurpose_clones() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 3 }, 8);
        let population = vec![Individual::test_with(&[0, 1], vec![1.0, 0.5])];
        let mut offspring = vec![
            Individual::new(FeatureMask::from_positions(8, &[0, 1]), 1),
            Individual::new(FeatureMask::from_positions(8, &[2]), 1),
            Individual::new(FeatureMask::from_positions(8, &[2]), 1),
        ];
        assert!(repurpose_clones(&mut offspring, &population, &sampler, 1, 50, &mut rng) >= 2);
        let distinct: HashSet<&FeatureMask> = offspring.iter().map(|i| &i.mask).collect();
        assert_eq!(distinct.len(), 3);
        assert!(!distinct.contains(&FeatureMask::from_positions(8, &[0, 1])));
    }

    #[test]
    fn test_clone_quota_tolerates_copies() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 3 }, 8);
        let twin = FeatureMask::from_positions(8, &[2]);
        let mut offspring: Vec<Individual> = (0..3).map(|_| Individual::new(twin.clone(), 1)).collect();
        assert_eq!(repurpose_clones(&mut offspring, &[], &sampler, 2, 50, &mut rng), 1);
        assert_eq!(offspring.iter().filter(|i| i.mask == twin).count(), 2);
        assert_ne!(offspring[2].mask, twin);

        let mut offspring: Vec<Individual> = (0..3).map(|_| Individual::new(twin.clone(), 1)).collect();
        let population = vec![Individual::new(twin.clone(), 0)];
        assert_eq!(repurpose_clones(&mut offspring, &population, &sampler, 2, 50, &mut rng), 2);
    }

    #[test]
    fn test_tournament_survival_keeps_sorted_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let sorted: Vec<Individual> = (0..8).map(|i| Individual::test_with(&[i], vec![1.0 - i as f64 / 10.0])).collect();
        let survivors = tournament_survival(sorted, 4, &mut rng);
        assert_eq!(survivors.len(), 4);
        let firsts: Vec<usize> = survivors.iter().map(|i| i.mask.true_positions()[0]).collect();
        assert!(firsts.windows(2).all(|w| w[0] < w[1]));
        assert_ne!(firsts[3], 0);
    }

    #[test]
    fn test_generations_strategy() {
        let strategy = GenerationsStrategy { sweeps: vec![3, 2], concatenated: 4 };
        assert_eq!(strategy.phases(), vec![(3, true), (2, true), (4, false)]);
        assert_eq!(strategy.total(), 9);
        assert_eq!(strategy.nick(), "s3-s2-c4");
    }

    #[test]
    fn test_zero_generations_returns_evaluated_initial_population() {
        let (result, hofs) = run(&settings(6, 0), 11, true);
        assert_eq!(result.generations, 0);
        assert_eq!(result.population.len(), 6);
        assert!(result.population.individuals.iter().all(|i| i.evaluated));
        assert_eq!(result.logbook.entries.len(), 1);
        assert!(!hofs[0].hofers().is_empty());
    }

    #[test]
    fn test_ga_is_deterministic_and_keeps_pareto_front() {
        let (first, hofs) = run(&settings(8, 5), 21, true);
        let (second, _) = run(&settings(8, 5), 21, true);
        assert_eq!(first.population, second.population);
        assert_eq!(first.generations, 5);
        assert_eq!(first.logbook.entries.len(), 6);
        assert_eq!(first.feature_counts.rows().len(), 6);

        let front = hofs[0].hofers();
        assert!(!front.is_empty());
        for a in &front {
            assert!(front.iter().all(|b| !b.dominates(a)));
            assert!(!a.mask.is_empty());
        }
    }

    #[test]
    fn test_ga_stops_when_not_running() {
        let (result, _) = run(&settings(6, 10), 3, false);
        assert!(result.interrupted);
        assert_eq!(result.generations, 0);
        assert_eq!(result.population.len(), 6);
    }

    #[test]
    fn test_sweeps_restrict_active_space() {
        let mut s = settings(6, 1);
        s.generations.sweeps = vec![2];
        let (result, _) = run(&s, 5, true);
        assert_eq!(result.generations, 3);
        // initial, two sweep generations, restart, one concatenated generation
        assert_eq!(result.logbook.entries.len(), 5);
        assert_eq!(result.logbook.entries[3].phase, 1);
    }

    #[test]
    fn test_sweep_without_generations_restricts_to_the_initial_features() {
        let mut s = settings(2, 0);
        s.generations.sweeps = vec![0];
        let mut pool = EvaluationPool::new(Arc::new(Evaluator::test()), 2).unwrap();
        let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::CrowdingDistance, 2, 12);
        let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 1 }, 4);
        let mut hofs = vec![hof_from_nick("pareto").unwrap()];
        let result = ga(&mut pool, &sorter, sampler, &s, &mut hofs, 13, Arc::new(AtomicBool::new(true))).unwrap();

        // initial population, then the restart drawn from its features only
        let rows = result.feature_counts.rows();
        assert_eq!(rows.len(), 2);
        let initial: HashSet<usize> = (0..4).filter(|f| rows[0].1[*f] > 0).collect();
        assert!(!initial.is_empty() && initial.len() <= 2);
        let restarted: HashSet<usize> = (0..4).filter(|f| rows[1].1[*f] > 0).collect();
        assert!(restarted.is_subset(&initial), "{:?} outside {:?}", restarted, initial);
    }

    #[test]
    fn test_logbook_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logbook.csv");
        let (result, _) = run(&settings(4, 1), 1, true);
        result.logbook.save(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("gen,phase,evaluations,n_valid,front_size,mean_k,"));
    }
}
