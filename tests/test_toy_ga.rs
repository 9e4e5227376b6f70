/// Integration Test for the GA on a toy two-objective problem
///
/// This test validates the optimizer alone, without the outer cross-validation:
/// 1. Building a dataset where two of eight features separate the classes
/// 2. Running NSGA-II and NSGA-III with balanced accuracy and leanness
/// 3. Verifying the Pareto hall of fame (closure, no empty mask, quality)
/// 4. Checking a 10-sample set where only the pair {f0, f1} separates the classes
///
/// Run with: cargo test --test test_toy_ga -- --nocapture
use paretomics::cv::{stratified_k_fold, ClassAssigner, Folds};
use paretomics::data::{Data, Outcome, RawView};
use paretomics::evaluator::Evaluator;
use paretomics::ga::{ga, GaSettings, InitialFeatures, MaskSampler};
use paretomics::hof::{hof_from_nick, HallOfFame};
use paretomics::individual::{dominates, Individual};
use paretomics::mask::FeatureMask;
use paretomics::objective::{Objective, ObjectiveDefaults};
use paretomics::param::{Algorithm, Param};
use paretomics::pool::EvaluationPool;
use paretomics::sorting::{SecondarySorter, Sorter};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const N_SAMPLES: usize = 30;
const N_FEATURES: usize = 8;

fn toy_data() -> Data {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let samples: Vec<String> = (0..N_SAMPLES).map(|i| format!("s{}", i)).collect();
    let labels: Vec<usize> = (0..N_SAMPLES).map(|i| i % 2).collect();
    let values = (0..N_FEATURES)
        .map(|f| labels.iter().map(|l| if f < 2 { 3.0 * *l as f64 } else { 0.0 } + rng.gen_range(0.0..1.0)).collect())
        .collect();
    let view = RawView {
        name: "toy".to_string(),
        samples: samples.clone(),
        features: (0..N_FEATURES).map(|f| format!("f{}", f)).collect(),
        values,
    };
    let outcome = Outcome::Categorical { name: "class".to_string(), levels: vec!["a".to_string(), "b".to_string()], labels };
    Data::from_parts(vec![view], vec![(samples, outcome)]).unwrap()
}

fn run_toy(algorithm: Algorithm) -> Vec<Individual> {
    let data = Arc::new(toy_data());
    let defaults = ObjectiveDefaults::default();
    let objectives = vec![
        Objective::from_nick("balanced_accuracy", &defaults, &data).unwrap(),
        Objective::from_nick("leanness", &defaults, &data).unwrap(),
    ];
    let mut fold_rng = ChaCha8Rng::seed_from_u64(42);
    let folds = stratified_k_fold(&data, 3, 1, &ClassAssigner::new(3, 2), &mut fold_rng).unwrap();
    let evaluator = Evaluator::new(objectives, data, folds, 50, 42).unwrap();
    let mut pool = EvaluationPool::new(Arc::new(evaluator), 2).unwrap();

    let mut param = Param::default();
    param.ga.pop_size = 16;
    param.ga.generations.concatenated = 6;
    param.ga.mutation_frequency = 0.2;
    param.general.display_colorful = false;
    let settings = GaSettings::from_param(&param);

    let sorter = Sorter::new(algorithm, SecondarySorter::CrowdingDistance, 2, 12);
    let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 3 }, N_FEATURES);
    let mut hofs: Vec<Box<dyn HallOfFame>> = vec![hof_from_nick("pareto").unwrap()];
    let result = ga(&mut pool, &sorter, sampler, &settings, &mut hofs, 42, Arc::new(AtomicBool::new(true))).unwrap();

    assert_eq!(result.generations, 6);
    assert_eq!(result.population.len(), 16);
    hofs[0].hofers()
}

fn check_front(members: &[Individual]) {
    assert!(!members.is_empty());
    for a in members {
        assert_eq!(a.fitness.len(), 2);
        assert!(a.mask.count() > 0);
        assert!(a.valid);
        for b in members {
            assert!(!dominates(&b.fitness, &a.fitness), "{:?} dominates {:?}", b.fitness, a.fitness);
        }
    }
    let best = members.iter().map(|m| m.fitness[0]).fold(f64::NEG_INFINITY, f64::max);
    assert!(best > 0.8, "best balanced accuracy {}", best);
}

#[test]
fn test_nsga2_finds_the_informative_features() {
    let members = run_toy(Algorithm::Nsga2);
    check_front(&members);
    let best = members.iter().max_by(|a, b| a.fitness[0].total_cmp(&b.fitness[0])).unwrap();
    assert!(best.mask.get(0) || best.mask.get(1));
}

#[test]
fn test_nsga3_front_is_closed() {
    check_front(&run_toy(Algorithm::Nsga3));
}

/// 5 controls then 5 cases. Cases have f0 + f1 >= 4 and controls <= 2, but
/// neither coordinate alone splits them; f2 and f3 are noise.
fn pair_only_data() -> Data {
    let rows = [
        [0.0, 0.0, 0.1, 0.9],
        [1.0, 1.0, 0.3, 0.6],
        [0.0, 1.0, 0.5, 0.2],
        [1.0, 0.0, 0.3, 0.5],
        [0.0, 0.0, 0.3, 0.3],
        [1.0, 3.0, 0.6, 0.1],
        [4.0, 1.0, 0.1, 0.1],
        [0.0, 4.0, 0.4, 0.5],
        [3.0, 2.0, 0.2, 0.1],
        [6.0, 0.0, 0.5, 0.1],
    ];
    let samples: Vec<String> = (0..10).map(|i| format!("s{}", i)).collect();
    let view = RawView {
        name: "toy".to_string(),
        samples: samples.clone(),
        features: (0..4).map(|f| format!("f{}", f)).collect(),
        values: (0..4).map(|f| rows.iter().map(|r| r[f]).collect()).collect(),
    };
    let labels = (0..10).map(|i| usize::from(i >= 5)).collect();
    let outcome = Outcome::Categorical { name: "class".to_string(), levels: vec!["control".to_string(), "case".to_string()], labels };
    Data::from_parts(vec![view], vec![(samples, outcome)]).unwrap()
}

#[test]
fn test_only_the_informative_pair_reaches_full_accuracy() {
    let data = Arc::new(pair_only_data());
    let defaults = ObjectiveDefaults::default();
    let objectives = vec![
        Objective::from_nick("balanced_accuracy", &defaults, &data).unwrap(),
        Objective::from_nick("leanness", &defaults, &data).unwrap(),
    ];
    // one control and one case per inner fold
    let folds = Folds::new((0..5).map(|i| vec![i, i + 5]).collect()).unwrap();
    let evaluator = Evaluator::new(objectives, data, folds, 50, 42).unwrap();
    let pair = FeatureMask::from_positions(4, &[0, 1]);
    for single in 0..4 {
        let fitness = evaluator.evaluate(&FeatureMask::from_positions(4, &[single])).unwrap().fitness;
        assert!(fitness[0] < 1.0, "f{} alone reaches {}", single, fitness[0]);
    }
    assert_eq!(evaluator.evaluate(&pair).unwrap().fitness, vec![1.0, 0.5]);

    let mut pool = EvaluationPool::new(Arc::new(evaluator), 2).unwrap();
    let mut param = Param::default();
    param.ga.pop_size = 8;
    param.ga.generations.concatenated = 20;
    param.ga.mutation_frequency = 0.25;
    param.ga.clone_repurposing = true;
    param.general.display_colorful = false;
    let settings = GaSettings::from_param(&param);
    let sorter = Sorter::new(Algorithm::Nsga2, SecondarySorter::CrowdingDistance, 2, 12);
    let sampler = MaskSampler::new(InitialFeatures::Uniform { min: 1, max: 4 }, 4);
    let mut hofs: Vec<Box<dyn HallOfFame>> = vec![hof_from_nick("pareto").unwrap()];
    let result = ga(&mut pool, &sorter, sampler, &settings, &mut hofs, 42, Arc::new(AtomicBool::new(true))).unwrap();
    assert_eq!(result.generations, 20);

    let members = hofs[0].hofers();
    let at_full: Vec<&Individual> = members.iter().filter(|m| m.fitness[0] == 1.0).collect();
    assert_eq!(at_full.len(), 1, "{:?}", members.iter().map(|m| &m.fitness).collect::<Vec<_>>());
    assert_eq!(at_full[0].mask, pair);
    assert_eq!(at_full[0].fitness, vec![1.0, 0.5]);
    assert!(members.iter().all(|m| !m.mask.is_empty()));
    for a in &members {
        assert!(members.iter().all(|b| !dominates(&b.fitness, &a.fitness)));
    }
}
