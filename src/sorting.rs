//! Ranking of a population: non-dominated fronts (NSGA-II) or reference-point
//! niches (NSGA-III), then a secondary comparator inside each front.

use log::debug;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::individual::{dominates, Individual};
use crate::mask::FeatureMask;
use crate::param::Algorithm;
use crate::utils::parse_nick;

#[derive(Clone, Debug, PartialEq)]
pub enum SecondarySorter {
    CrowdingDistance,
    SocialSpace,
    Peculiarity,
    /// Clones are pushed to later layers; the inner sorter ranks each layer
    CloneIndex(Box<SecondarySorter>),
}

impl SecondarySorter {
    /// `crowding_distance`, `social_space`, `peculiarity` or `clone_index(<inner>)`
    pub fn from_nick(nick: &str) -> Result<SecondarySorter> {
        let (name, args) = parse_nick(nick)?;
        match name.as_str() {
            "crowding_distance" | "crowding" | "cd" => Ok(SecondarySorter::CrowdingDistance),
            "social_space" | "ss" => Ok(SecondarySorter::SocialSpace),
            "peculiarity" => Ok(SecondarySorter::Peculiarity),
            "clone_index" => {
                let inner = match args.first() {
                    Some(inner) => SecondarySorter::from_nick(inner)?,
                    None => SecondarySorter::CrowdingDistance,
                };
                if matches!(inner, SecondarySorter::CloneIndex(_)) {
                    return Err(Error::value(format!("'{}': clone_index cannot be nested", nick)));
                }
                Ok(SecondarySorter::CloneIndex(Box::new(inner)))
            }
            _ => Err(Error::value(format!("unknown sorting strategy '{}'", nick))),
        }
    }

    pub fn nick(&self) -> String {
        match self {
            SecondarySorter::CrowdingDistance => "cd".to_string(),
            SecondarySorter::SocialSpace => "ss".to_string(),
            SecondarySorter::Peculiarity => "pec".to_string(),
            SecondarySorter::CloneIndex(inner) => format!("ci-{}", inner.nick()),
        }
    }
}

/// Orders individuals best first
#[derive(Clone, Debug)]
pub struct Sorter {
    pub algorithm: Algorithm,
    pub secondary: SecondarySorter,
    reference_points: Vec<Vec<f64>>,
}

impl Sorter {
    pub fn new(algorithm: Algorithm, secondary: SecondarySorter, n_objectives: usize, reference_divisions: usize) -> Sorter {
        let reference_points = match algorithm {
            Algorithm::Nsga3 => das_dennis(n_objectives.max(1), reference_divisions),
            Algorithm::Nsga2 => Vec::new(),
        };
        Sorter { algorithm, secondary, reference_points }
    }

    pub fn nick(&self) -> String {
        format!("{}_{}", self.algorithm.nick(), self.secondary.nick())
    }

    /// Sorts `individuals` in place, best first, and fills their rank and
    /// secondary keys. Under NSGA-III the front crossing position `n_select`
    /// is ordered by reference-point niching.
    pub fn sort(&self, individuals: &mut Vec<Individual>, n_select: usize) {
        let order = self.order(individuals, n_select);
        let mut slots: Vec<Option<Individual>> = std::mem::take(individuals).into_iter().map(Some).collect();
        *individuals = order.into_iter().filter_map(|i| slots[i].take()).collect();
    }

    /// Keeps the `n` best individuals
    pub fn select(&self, mut individuals: Vec<Individual>, n: usize) -> Vec<Individual> {
        self.sort(&mut individuals, n);
        individuals.truncate(n);
        individuals
    }

    fn order(&self, individuals: &mut [Individual], n_select: usize) -> Vec<usize> {
        match &self.secondary {
            SecondarySorter::CloneIndex(inner) => {
                let layers = clone_layers(individuals);
                debug!("Clone index layers: {:?}", layers.iter().map(|l| l.len()).collect::<Vec<_>>());
                let mut order = Vec::with_capacity(individuals.len());
                let mut rank_offset = 0;
                for layer in layers {
                    let budget = n_select.saturating_sub(order.len());
                    let (layer_order, n_ranks) = self.order_subset(individuals, &layer, inner, budget);
                    for i in &layer {
                        individuals[*i].rank += rank_offset;
                    }
                    rank_offset += n_ranks;
                    order.extend(layer_order);
                }
                order
            }
            secondary => {
                let all: Vec<usize> = (0..individuals.len()).collect();
                self.order_subset(individuals, &all, secondary, n_select).0
            }
        }
    }

    /// Order of `subset` (positions in `individuals`) and the number of ranks used
    fn order_subset(&self, individuals: &mut [Individual], subset: &[usize], secondary: &SecondarySorter, n_select: usize) -> (Vec<usize>, usize) {
        let (valid, invalid): (Vec<usize>, Vec<usize>) = subset.iter().copied().partition(|i| individuals[*i].valid);

        let points: Vec<&[f64]> = valid.iter().map(|i| individuals[*i].fitness.as_slice()).collect();
        let fronts: Vec<Vec<usize>> = non_dominated_fronts(&points)
            .into_iter()
            .map(|front| front.into_iter().map(|f| valid[f]).collect())
            .collect();

        let peculiarities = if *secondary == SecondarySorter::Peculiarity {
            let masks: Vec<&FeatureMask> = subset.iter().map(|i| &individuals[*i].mask).collect();
            Some(peculiarity(&masks))
        } else {
            None
        };
        if let Some(values) = &peculiarities {
            for (i, v) in subset.iter().zip(values) {
                individuals[*i].peculiarity = *v;
            }
        }

        let n_ranks = fronts.len() + usize::from(!invalid.is_empty());
        let mut order = Vec::with_capacity(subset.len());
        for (rank, front) in fronts.iter().enumerate() {
            let points: Vec<&[f64]> = front.iter().map(|i| individuals[*i].fitness.as_slice()).collect();
            let crowding = crowding_distance(&points);
            let social = social_space(&points);
            for (n, i) in front.iter().enumerate() {
                individuals[*i].rank = rank;
                individuals[*i].crowding_distance = crowding[n];
                individuals[*i].social_space = social[n];
            }

            let mut sorted = front.clone();
            sorted.sort_by(|a, b| secondary_key(&individuals[*b], secondary).total_cmp(&secondary_key(&individuals[*a], secondary)));

            let placed = order.len();
            if self.algorithm == Algorithm::Nsga3 && placed < n_select && placed + sorted.len() > n_select {
                let chosen = self.niche_select(individuals, &order, &sorted, n_select - placed);
                let rest: Vec<usize> = sorted.iter().copied().filter(|i| !chosen.contains(i)).collect();
                order.extend(chosen);
                order.extend(rest);
            } else {
                order.extend(sorted);
            }
        }
        for i in &invalid {
            individuals[*i].rank = fronts.len();
        }
        order.extend(invalid);
        (order, n_ranks)
    }

    /// NSGA-III niching: picks `k` members of `front` given the already
    /// accepted `placed`, in the order they were picked
    fn niche_select(&self, individuals: &[Individual], placed: &[usize], front: &[usize], k: usize) -> Vec<usize> {
        let candidates: Vec<usize> = placed.iter().chain(front.iter()).copied().collect();
        let m = individuals[front[0]].fitness.len();
        let mut ideal = vec![f64::NEG_INFINITY; m];
        let mut worst = vec![f64::INFINITY; m];
        for i in &candidates {
            for (o, v) in individuals[*i].fitness.iter().enumerate() {
                ideal[o] = ideal[o].max(*v);
                worst[o] = worst[o].min(*v);
            }
        }
        let normalised = |i: usize| -> Vec<f64> {
            individuals[i].fitness.iter().enumerate()
                .map(|(o, v)| {
                    let range = ideal[o] - worst[o];
                    if range > 0.0 { (ideal[o] - v) / range } else { 0.0 }
                })
                .collect()
        };

        let mut niche_count = vec![0usize; self.reference_points.len()];
        for i in placed {
            let (r, _) = associate(&normalised(*i), &self.reference_points);
            niche_count[r] += 1;
        }
        let mut remaining: Vec<(usize, usize, f64)> = front.iter()
            .map(|i| {
                let (r, d) = associate(&normalised(*i), &self.reference_points);
                (*i, r, d)
            })
            .collect();

        let mut chosen = Vec::with_capacity(k);
        while chosen.len() < k && !remaining.is_empty() {
            let Some(r) = remaining.iter().map(|(_, r, _)| *r).min_by_key(|r| (niche_count[*r], *r)) else { break };
            let in_niche = remaining.iter().enumerate().filter(|(_, (_, rr, _))| *rr == r);
            // `remaining` keeps the secondary order, so the first member is the best one
            let pick = if niche_count[r] == 0 {
                in_niche.min_by(|a, b| a.1 .2.total_cmp(&b.1 .2)).map(|(n, _)| n)
            } else {
                in_niche.map(|(n, _)| n).next()
            };
            let Some(pick) = pick else { break };
            let (i, _, _) = remaining.remove(pick);
            niche_count[r] += 1;
            chosen.push(i);
        }
        chosen
    }
}

fn secondary_key(individual: &Individual, secondary: &SecondarySorter) -> f64 {
    match secondary {
        SecondarySorter::CrowdingDistance => individual.crowding_distance,
        SecondarySorter::SocialSpace => individual.social_space,
        SecondarySorter::Peculiarity => individual.peculiarity,
        SecondarySorter::CloneIndex(inner) => secondary_key(individual, inner),
    }
}

/// Positions grouped by clone index: layer `c` holds the `c`-th occurrence of
/// every mask, in population order
fn clone_layers(individuals: &[Individual]) -> Vec<Vec<usize>> {
    let mut seen: HashMap<&FeatureMask, usize> = HashMap::new();
    let mut layers: Vec<Vec<usize>> = Vec::new();
    for (n, i) in individuals.iter().enumerate() {
        let c = seen.entry(&i.mask).or_insert(0);
        if layers.len() <= *c {
            layers.push(Vec::new());
        }
        layers[*c].push(n);
        *c += 1;
    }
    layers
}

/// Reference line closest to a normalised point, with the perpendicular distance
fn associate(point: &[f64], references: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (r, w) in references.iter().enumerate() {
        let norm2: f64 = w.iter().map(|x| x * x).sum();
        if norm2 == 0.0 {
            continue;
        }
        let t = point.iter().zip(w).map(|(p, x)| p * x).sum::<f64>() / norm2;
        let d = point.iter().zip(w).map(|(p, x)| (p - t * x).powi(2)).sum::<f64>().sqrt();
        if d < best.1 {
            best = (r, d);
        }
    }
    best
}

//-----------------------------------------------------------------------------
// Primitives
//-----------------------------------------------------------------------------

/// Fast non-dominated sort (maximisation). Returns positions, front by front,
/// each front in ascending position order.
pub fn non_dominated_fronts(points: &[&[f64]]) -> Vec<Vec<usize>> {
    let n = points.len();
    let mut dominated_by = vec![0usize; n];
    let mut dominating: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if dominates(points[i], points[j]) {
                dominating[i].push(j);
                dominated_by[j] += 1;
            } else if dominates(points[j], points[i]) {
                dominating[j].push(i);
                dominated_by[i] += 1;
            }
        }
    }

    let mut fronts = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|i| dominated_by[*i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for i in &current {
            for j in &dominating[*i] {
                dominated_by[*j] -= 1;
                if dominated_by[*j] == 0 {
                    next.push(*j);
                }
            }
        }
        next.sort_unstable();
        fronts.push(std::mem::replace(&mut current, next));
    }
    fronts
}

/// NSGA-II crowding distance of the members of one front; boundary points get +inf
pub fn crowding_distance(points: &[&[f64]]) -> Vec<f64> {
    let n = points.len();
    let mut distance = vec![0.0; n];
    if n <= 2 {
        return vec![f64::INFINITY; n];
    }
    let m = points[0].len();
    for o in 0..m {
        let mut idx: Vec<usize> = (0..n).collect();
        idx.sort_by(|a, b| points[*a][o].total_cmp(&points[*b][o]));
        let range = points[idx[n - 1]][o] - points[idx[0]][o];
        distance[idx[0]] = f64::INFINITY;
        distance[idx[n - 1]] = f64::INFINITY;
        if range <= 0.0 || !range.is_finite() {
            continue;
        }
        for w in 1..n - 1 {
            distance[idx[w]] += (points[idx[w + 1]][o] - points[idx[w - 1]][o]) / range;
        }
    }
    distance
}

/// Distance of each front member to its nearest neighbour: Chebyshev distance
/// in the objective space normalised by the front ranges. Objectives with a
/// zero range contribute 0; a singleton front gets +inf.
pub fn social_space(points: &[&[f64]]) -> Vec<f64> {
    let n = points.len();
    if n <= 1 {
        return vec![f64::INFINITY; n];
    }
    let m = points[0].len();
    let ranges: Vec<f64> = (0..m)
        .map(|o| {
            let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p[o]), hi.max(p[o])));
            hi - lo
        })
        .collect();
    (0..n)
        .map(|i| {
            (0..n)
                .filter(|j| *j != i)
                .map(|j| {
                    (0..m)
                        .map(|o| if ranges[o] > 0.0 { (points[i][o] - points[j][o]).abs() / ranges[o] } else { 0.0 })
                        .fold(0.0, f64::max)
                })
                .fold(f64::INFINITY, f64::min)
        })
        .collect()
}

/// Replaces infinite social-space values by the largest finite one plus 1 (or 1)
pub fn social_space_surrogate(values: &[f64]) -> Vec<f64> {
    let largest = values.iter().copied().filter(|v| v.is_finite()).fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
    let surrogate = largest.map_or(1.0, |v| v + 1.0);
    values.iter().map(|v| if v.is_finite() { *v } else { surrogate }).collect()
}

/// Mean absolute difference between each mask and the average mask, over the
/// union of the selected features
pub fn peculiarity(masks: &[&FeatureMask]) -> Vec<f64> {
    let mut frequency: HashMap<usize, f64> = HashMap::new();
    for mask in masks {
        for p in mask.true_positions() {
            *frequency.entry(*p).or_insert(0.0) += 1.0;
        }
    }
    if frequency.is_empty() {
        return vec![0.0; masks.len()];
    }
    let n = masks.len() as f64;
    let union = frequency.len() as f64;
    masks.iter()
        .map(|mask| {
            frequency.iter()
                .map(|(p, count)| {
                    let mean = count / n;
                    if mask.get(*p) { 1.0 - mean } else { mean }
                })
                .sum::<f64>() / union
        })
        .collect()
}

/// Das-Dennis structured reference points on the unit simplex
pub fn das_dennis(n_objectives: usize, divisions: usize) -> Vec<Vec<f64>> {
    if divisions == 0 {
        return vec![vec![1.0 / n_objectives as f64; n_objectives]];
    }
    let mut points = Vec::new();
    let mut current = Vec::with_capacity(n_objectives);
    das_dennis_rec(n_objectives, divisions, divisions, &mut current, &mut points);
    points
}

fn das_dennis_rec(m: usize, left: usize, total: usize, current: &mut Vec<usize>, points: &mut Vec<Vec<f64>>) {
    if current.len() == m - 1 {
        current.push(left);
        points.push(current.iter().map(|c| *c as f64 / total as f64).collect());
        current.pop();
        return;
    }
    for c in 0..=left {
        current.push(c);
        das_dennis_rec(m, left - c, total, current, points);
        current.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::Population;

    fn as_slices(points: &[Vec<f64>]) -> Vec<&[f64]> {
        points.iter().map(|p| p.as_slice()).collect()
    }

    #[test]
    fn test_non_dominated_fronts() {
        let points = vec![vec![1.0, 0.5], vec![0.9, 0.5], vec![0.5, 1.0], vec![0.4, 0.4]];
        assert_eq!(non_dominated_fronts(&as_slices(&points)), vec![vec![0, 2], vec![1], vec![3]]);
        let equal = vec![vec![0.5, 0.5], vec![0.5, 0.5]];
        assert_eq!(non_dominated_fronts(&as_slices(&equal)), vec![vec![0, 1]]);
        assert!(non_dominated_fronts(&[]).is_empty());
    }

    #[test]
    fn test_crowding_distance() {
        let points = vec![vec![0.0, 1.0], vec![0.5, 0.5], vec![1.0, 0.0]];
        let cd = crowding_distance(&as_slices(&points));
        assert_eq!(cd[0], f64::INFINITY);
        assert_eq!(cd[2], f64::INFINITY);
        assert!((cd[1] - 2.0).abs() < 1e-12);
        assert_eq!(crowding_distance(&as_slices(&points[..2])), vec![f64::INFINITY; 2]);
    }

    #[test]
    fn test_social_space() {
        let points = vec![vec![0.0, 1.0], vec![0.5, 0.5], vec![1.0, 0.0]];
        assert_eq!(social_space(&as_slices(&points)), vec![0.5, 0.5, 0.5]);
        let flat = vec![vec![0.0, 1.0], vec![1.0, 1.0]];
        assert_eq!(social_space(&as_slices(&flat)), vec![1.0, 1.0]);
        assert_eq!(social_space(&as_slices(&points[..1])), vec![f64::INFINITY]);
        assert_eq!(social_space_surrogate(&[0.5, f64::INFINITY]), vec![0.5, 1.5]);
        assert_eq!(social_space_surrogate(&[f64::INFINITY]), vec![1.0]);
    }

    #[test]
    fn test_peculiarity() {
        let a = FeatureMask::from_positions(8, &[0]);
        let b = FeatureMask::from_positions(8, &[1]);
        let values = peculiarity(&[&a, &a, &b]);
        assert!((values[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((values[2] - 2.0 / 3.0).abs() < 1e-12);
        let empty = FeatureMask::empty(8);
        assert_eq!(peculiarity(&[&empty]), vec![0.0]);
    }

    #[test]
    fn test_das_dennis() {
        let points = das_dennis(3, 2);
        assert_eq!(points.len(), 6);
        assert!(points.iter().all(|p| (p.iter().sum::<f64>() - 1.0).abs() < 1e-12));
        assert_eq!(das_dennis(2, 4).len(), 5);
    }

    #[test]
    fn test_nsga2_sort_assigns_ranks() {
        let mut individuals = Population::test().individuals;
        let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::CrowdingDistance, 2, 12);
        sorter.sort(&mut individuals, 5);
        let ranks: Vec<usize> = individuals.iter().map(|i| i.rank).collect();
        assert_eq!(ranks, vec![0, 0, 1, 1, 2]);
        assert_eq!(individuals[0].fitness, vec![1.0, 0.75]);
        assert_eq!(individuals[4].fitness, vec![0.6, 0.5]);
    }

    #[test]
    fn test_invalid_individuals_come_last() {
        let mut individuals = Population::test().individuals;
        individuals[0].valid = false;
        individuals[0].fitness = vec![f64::NEG_INFINITY; 2];
        let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::SocialSpace, 2, 12);
        let selected = sorter.select(individuals, 5);
        assert!(!selected[4].valid);
        assert!(selected[..4].iter().all(|i| i.valid));
    }

    #[test]
    fn test_clone_index_pushes_clones_back() {
        let mut individuals = vec![
            Individual::test_with(&[0], vec![1.0, 0.9]),
            Individual::test_with(&[0], vec![1.0, 0.9]),
            Individual::test_with(&[1], vec![0.2, 0.2]),
        ];
        let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::from_nick("clone_index(crowding_distance)").unwrap(), 2, 12);
        sorter.sort(&mut individuals, 3);
        assert_eq!(individuals[1].mask, FeatureMask::from_positions(8, &[1]));
        assert_eq!(individuals[2].mask, FeatureMask::from_positions(8, &[0]));
        assert!(individuals[2].rank > individuals[1].rank);
    }

    #[test]
    fn test_nsga3_niching_spreads_the_selection() {
        let individuals = vec![
            Individual::test_with(&[0], vec![1.0, 0.0]),
            Individual::test_with(&[1], vec![0.95, 0.05]),
            Individual::test_with(&[2], vec![0.0, 1.0]),
        ];
        let sorter = Sorter::new(Algorithm::Nsga3, SecondarySorter::Peculiarity, 2, 4);
        let selected = sorter.select(individuals, 2);
        let kept: Vec<usize> = selected.iter().map(|i| i.mask.true_positions()[0]).collect();
        assert!(kept.contains(&0) && kept.contains(&2));
    }

    #[test]
    fn test_sorter_nicks() {
        assert!(SecondarySorter::from_nick("clone_index(clone_index)").is_err());
        assert!(SecondarySorter::from_nick("bogus").is_err());
        assert_eq!(SecondarySorter::from_nick("clone_index").unwrap().nick(), "ci-cd");
    }
}
