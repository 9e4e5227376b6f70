//! Hypervolume of fitness sets (maximisation, reference point at the origin)
//! and the train/test cross-hypervolume built on it.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::utils::KahanSum;

pub const TOLERANCE: f64 = 1e-12;

/// Largest input accepted by the inclusion-exclusion routine
pub const MAX_INCLUSION_EXCLUSION: usize = 20;

/// Lebesgue measure of the union of the boxes `[0, p]`. Non-finite or
/// negative coordinates are clamped to 0; an empty set has volume 0.
pub fn hypervolume(points: &[Vec<f64>]) -> f64 {
    let points = sanitise(points);
    if points.is_empty() {
        return 0.0;
    }
    let m = points[0].len();
    let volume = match m {
        0 => 0.0,
        1 => points.iter().map(|p| p[0]).fold(0.0, f64::max),
        2 => staircase(&points),
        _ => {
            let axes: Vec<usize> = (0..m).collect();
            let all: Vec<usize> = (0..points.len()).collect();
            let mut memo: HashMap<(Vec<usize>, Vec<usize>), f64> = HashMap::new();
            slice(&points, &all, &axes, &mut memo)
        }
    };
    if volume.abs() < TOLERANCE { 0.0 } else { volume }
}

fn sanitise(points: &[Vec<f64>]) -> Vec<Vec<f64>> {
    points.iter()
        .map(|p| p.iter().map(|v| if v.is_finite() && *v > 0.0 { *v } else { 0.0 }).collect::<Vec<f64>>())
        .filter(|p| p.iter().all(|v| *v > 0.0))
        .collect()
}

/// O(n log n) sweep for two objectives
fn staircase(points: &[Vec<f64>]) -> f64 {
    let mut sorted: Vec<(f64, f64)> = points.iter().map(|p| (p[0], p[1])).collect();
    sorted.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.total_cmp(&a.1)));
    let mut sum = KahanSum::new();
    let mut height = 0.0;
    for (x, y) in &sorted {
        if *y > height + TOLERANCE {
            sum.add(x * (y - height));
            height = *y;
        }
    }
    sum.value()
}

/// Slices along the remaining axis of highest variance; 1-D unions reduce
/// to the maximum and 2-D ones to the staircase
fn slice(points: &[Vec<f64>], subset: &[usize], axes: &[usize], memo: &mut HashMap<(Vec<usize>, Vec<usize>), f64>) -> f64 {
    if subset.is_empty() {
        return 0.0;
    }
    if axes.len() == 1 {
        return subset.iter().map(|i| points[*i][axes[0]]).fold(0.0, f64::max);
    }
    if axes.len() == 2 {
        let projected: Vec<Vec<f64>> = subset.iter().map(|i| vec![points[*i][axes[0]], points[*i][axes[1]]]).collect();
        return staircase(&projected);
    }
    let key = (subset.to_vec(), axes.to_vec());
    if let Some(v) = memo.get(&key) {
        return *v;
    }

    let axis = *axes.iter()
        .max_by(|a, b| variance(points, subset, **a).total_cmp(&variance(points, subset, **b)))
        .unwrap_or(&axes[0]);
    let rest: Vec<usize> = axes.iter().copied().filter(|a| *a != axis).collect();

    let mut cuts: Vec<f64> = subset.iter().map(|i| points[*i][axis]).collect();
    cuts.sort_by(|a, b| a.total_cmp(b));
    dedup_within_tolerance(&mut cuts);

    let mut sum = KahanSum::new();
    let mut lower = 0.0;
    for cut in cuts {
        let above: Vec<usize> = subset.iter().copied().filter(|i| points[*i][axis] >= cut - TOLERANCE).collect();
        sum.add((cut - lower) * slice(points, &above, &rest, memo));
        lower = cut;
    }
    let volume = sum.value();
    memo.insert(key, volume);
    volume
}

/// Keeps the largest of each run of sorted cuts closer than `TOLERANCE`
fn dedup_within_tolerance(cuts: &mut Vec<f64>) {
    let mut kept: Vec<f64> = Vec::with_capacity(cuts.len());
    for cut in cuts.iter() {
        match kept.last_mut() {
            Some(last) if *cut - *last <= TOLERANCE => *last = *cut,
            _ => kept.push(*cut),
        }
    }
    *cuts = kept;
}

fn variance(points: &[Vec<f64>], subset: &[usize], axis: usize) -> f64 {
    let n = subset.len() as f64;
    let mean = subset.iter().map(|i| points[*i][axis]).sum::<f64>() / n;
    subset.iter().map(|i| (points[*i][axis] - mean).powi(2)).sum::<f64>() / n
}

/// Component-wise minima of position-paired train and test fitness vectors.
/// The shorter side is padded with origin points.
fn paired_minima(train: &[Vec<f64>], test: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let m = train.first().or(test.first()).map(|p| p.len()).unwrap_or(0);
    if train.iter().chain(test.iter()).any(|p| p.len() != m) {
        return Err(Error::value("cross hypervolume over fitness vectors of different lengths"));
    }
    let origin = vec![0.0; m];
    let n = train.len().max(test.len());
    Ok((0..n)
        .map(|i| {
            let a = train.get(i).unwrap_or(&origin);
            let b = test.get(i).unwrap_or(&origin);
            a.iter().zip(b.iter()).map(|(x, y)| x.min(*y)).collect()
        })
        .collect())
}

/// Volume of the union over `i` of the boxes `[0, train_i] ∩ [0, test_i]`,
/// i.e. the hypervolume of the component-wise minima
pub fn cross_hypervolume(train: &[Vec<f64>], test: &[Vec<f64>]) -> Result<f64> {
    Ok(hypervolume(&paired_minima(train, test)?))
}

/// Cross-hypervolume by explicit inclusion-exclusion over index subsets.
/// Exponential, kept for small inputs and to check [`cross_hypervolume`].
pub fn cross_hypervolume_inclusion_exclusion(train: &[Vec<f64>], test: &[Vec<f64>]) -> Result<f64> {
    let boxes: Vec<Vec<f64>> = sanitise(&paired_minima(train, test)?);
    let n = boxes.len();
    if n > MAX_INCLUSION_EXCLUSION {
        return Err(Error::value(format!("inclusion-exclusion over {} boxes (max {})", n, MAX_INCLUSION_EXCLUSION)));
    }
    if n == 0 {
        return Ok(0.0);
    }
    let m = boxes[0].len();
    let mut sum = KahanSum::new();
    for subset in 1u32..(1u32 << n) {
        let mut corner = vec![f64::INFINITY; m];
        for (i, b) in boxes.iter().enumerate() {
            if subset & (1 << i) != 0 {
                for (c, v) in corner.iter_mut().zip(b) {
                    *c = c.min(*v);
                }
            }
        }
        let volume: f64 = corner.iter().product();
        if subset.count_ones() % 2 == 1 {
            sum.add(volume);
        } else {
            sum.add(-volume);
        }
    }
    let v = sum.value();
    Ok(if v.abs() < TOLERANCE { 0.0 } else { v })
}

/// hypervolume(train) - cross_hypervolume(train, test), never below 0
pub fn pareto_delta(train: &[Vec<f64>], test: &[Vec<f64>]) -> Result<f64> {
    let delta = hypervolume(train) - cross_hypervolume(train, test)?;
    Ok(if delta < TOLERANCE { 0.0 } else { delta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_two_objective_hypervolume() {
        let h = vec![vec![0.5, 0.0], vec![0.0, 1.0], vec![0.5, 1.0]];
        assert_abs_diff_eq!(hypervolume(&h), 0.5, epsilon = 1e-12);
        let stairs = vec![vec![1.0, 0.25], vec![0.5, 0.5], vec![0.25, 1.0]];
        assert_abs_diff_eq!(hypervolume(&stairs), 0.25 + 0.125 + 0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_and_degenerate_sets() {
        assert_eq!(hypervolume(&[]), 0.0);
        assert_eq!(hypervolume(&[vec![f64::NEG_INFINITY, 1.0]]), 0.0);
        assert_eq!(hypervolume(&[vec![0.7]]), 0.7);
    }

    #[test]
    fn test_slicing_matches_inclusion_exclusion() {
        let h = vec![
            vec![0.9, 0.2, 0.5],
            vec![0.3, 0.8, 0.6],
            vec![0.5, 0.5, 0.9],
            vec![0.1, 0.1, 0.1],
        ];
        let by_slicing = hypervolume(&h);
        let by_ie = cross_hypervolume_inclusion_exclusion(&h, &h).unwrap();
        assert_abs_diff_eq!(by_slicing, by_ie, epsilon = 1e-12);
        assert_abs_diff_eq!(hypervolume(&[vec![0.5, 0.5, 0.5]]), 0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_one_dimensional_cross_hypervolume() {
        assert_abs_diff_eq!(cross_hypervolume(&[vec![1.0]], &[vec![0.5]]).unwrap(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(pareto_delta(&[vec![1.0]], &[vec![0.5]]).unwrap(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(cross_hypervolume(&[vec![0.5]], &[vec![1.0]]).unwrap(), 0.5, epsilon = 1e-12);
        assert_eq!(pareto_delta(&[vec![0.5]], &[vec![1.0]]).unwrap(), 0.0);
    }

    #[test]
    fn test_cross_hypervolume_bounds() {
        let train = vec![vec![0.9, 0.5], vec![0.6, 0.75], vec![0.3, 1.0]];
        let test = vec![vec![0.7, 0.5], vec![0.8, 0.75], vec![0.2, 1.0]];
        assert_abs_diff_eq!(cross_hypervolume(&train, &train).unwrap(), hypervolume(&train), epsilon = 1e-12);
        let cross = cross_hypervolume(&train, &test).unwrap();
        assert!(cross <= hypervolume(&test) + TOLERANCE);
        assert!(cross <= hypervolume(&train) + TOLERANCE);
        assert_abs_diff_eq!(cross, cross_hypervolume_inclusion_exclusion(&train, &test).unwrap(), epsilon = 1e-12);
        assert!(pareto_delta(&train, &test).unwrap() >= 0.0);
    }

    #[test]
    fn test_shorter_side_is_padded_with_origin() {
        let train = vec![vec![1.0, 1.0], vec![0.5, 0.5]];
        let test = vec![vec![0.5, 1.0]];
        assert_abs_diff_eq!(cross_hypervolume(&train, &test).unwrap(), 0.5, epsilon = 1e-12);
        assert!(cross_hypervolume(&[vec![1.0]], &[vec![1.0, 1.0]]).is_err());
    }

    #[test]
    fn test_near_ties_are_merged() {
        // coordinates equal up to rounding noise count as one step
        let noisy = vec![vec![0.5, 1.0], vec![0.5 + 1e-14, 1.0 - 1e-14], vec![1.0, 0.25]];
        assert_abs_diff_eq!(hypervolume(&noisy), 0.5 * 0.75 + 0.25, epsilon = 1e-12);
        let cube = vec![vec![0.5, 0.5, 0.5], vec![0.5 - 1e-14, 0.5, 0.5 + 1e-14], vec![0.25, 1.0, 0.25]];
        assert_abs_diff_eq!(hypervolume(&cube), 0.125 + 0.25 * 0.5 * 0.25, epsilon = 1e-12);
        let mut cuts = vec![0.2, 0.2 + 1e-13, 0.7];
        dedup_within_tolerance(&mut cuts);
        assert_eq!(cuts.len(), 2);
    }
}
