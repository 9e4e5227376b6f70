use serde::{Deserialize, Serialize};

use crate::data::{Data, OutcomeKind};
use crate::error::{Error, Result};
use crate::learner::{Learner, Predictor, Target};
use crate::mask::FeatureMask;
use crate::utils::parse_nick;

pub const DEFAULT_SOFT_LEANNESS_SATURATION: usize = 100;

/// Dispatch tag of an objective; the evaluator branches on it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveTag {
    Classification,
    Survival,
    Structural,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Computer {
    BalancedAccuracy,
    /// 1 - |training BA - held-out BA|
    Consistency,
    CIndex,
    Separation,
    RootSeparation,
    Leanness,
    SoftLeanness { saturation: usize },
    RootLeanness,
}

impl Computer {
    pub fn tag(&self) -> ObjectiveTag {
        match self {
            Computer::BalancedAccuracy | Computer::Consistency | Computer::Separation | Computer::RootSeparation => ObjectiveTag::Classification,
            Computer::CIndex => ObjectiveTag::Survival,
            Computer::Leanness | Computer::SoftLeanness { .. } | Computer::RootLeanness => ObjectiveTag::Structural,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Computer::BalancedAccuracy => "balanced_accuracy",
            Computer::Consistency => "consistency",
            Computer::CIndex => "c_index",
            Computer::Separation => "separation",
            Computer::RootSeparation => "root_separation",
            Computer::Leanness => "leanness",
            Computer::SoftLeanness { .. } => "soft_leanness",
            Computer::RootLeanness => "root_leanness",
        }
    }

    pub fn is_leanness(&self) -> bool {
        matches!(self, Computer::Leanness | Computer::SoftLeanness { .. } | Computer::RootLeanness)
    }

    /// Structural computer behind a saved objective nick. Predictive nicks
    /// carry their outcome and give `None`.
    pub fn structural_from_nick(nick: &str, saturation: usize) -> Option<Computer> {
        match nick {
            "leanness" => Some(Computer::Leanness),
            "root_leanness" => Some(Computer::RootLeanness),
            "soft_leanness" => Some(Computer::SoftLeanness { saturation }),
            _ => None,
        }
    }

    /// Re-expresses a fitness of this computer as soft leanness over `n`
    /// features. The feature count is read back from the value: `1 - k/n`
    /// for leanness, its square root for root leanness. Soft leanness and
    /// predictive fitnesses are returned unchanged.
    pub fn soften(&self, value: f64, n: usize, saturation: usize) -> f64 {
        if n == 0 || !value.is_finite() {
            return value;
        }
        let lean = match self {
            Computer::Leanness => value,
            Computer::RootLeanness => value * value,
            _ => return value,
        };
        let k = ((1.0 - lean) * n as f64).round().max(0.0) as usize;
        soft_leanness(k, n, saturation)
    }
}

/// Output of one computation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CvResult {
    pub fitness: f64,
    pub per_class: Option<Vec<f64>>,
    pub tag: ObjectiveTag,
}

/// Learners and constants used when an objective nick does not name them
#[derive(Clone, Debug)]
pub struct ObjectiveDefaults {
    pub classification_learner: Learner,
    pub survival_learner: Learner,
    pub soft_leanness_saturation: usize,
}

impl Default for ObjectiveDefaults {
    fn default() -> Self {
        ObjectiveDefaults {
            classification_learner: Learner::NaiveBayes,
            survival_learner: Learner::Cox { l2: 0.1 },
            soft_leanness_saturation: DEFAULT_SOFT_LEANNESS_SATURATION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub nick: String,
    pub computer: Computer,
    pub learner: Option<Learner>,
    pub outcome: Option<String>,
}

impl Objective {
    /// `name`, `name(outcome)` or `name(outcome, learner)`. Predictive
    /// objectives resolve their outcome against `data` (first outcome of the
    /// right kind when none is named).
    pub fn from_nick(nick: &str, defaults: &ObjectiveDefaults, data: &Data) -> Result<Objective> {
        let (name, args) = parse_nick(nick)?;
        let computer = match name.as_str() {
            "balanced_accuracy" | "ba" => Computer::BalancedAccuracy,
            "consistency" => Computer::Consistency,
            "c_index" | "cindex" | "ci" => Computer::CIndex,
            "separation" => Computer::Separation,
            "root_separation" => Computer::RootSeparation,
            "leanness" => Computer::Leanness,
            "soft_leanness" => Computer::SoftLeanness { saturation: defaults.soft_leanness_saturation },
            "root_leanness" => Computer::RootLeanness,
            _ => return Err(Error::value(format!("unknown objective '{}'", nick))),
        };

        let (learner, outcome) = match computer.tag() {
            ObjectiveTag::Structural => {
                if !args.is_empty() {
                    return Err(Error::value(format!("structural objective '{}' takes no argument", nick)));
                }
                (None, None)
            }
            tag => {
                let kind = if tag == ObjectiveTag::Survival { OutcomeKind::Survival } else { OutcomeKind::Categorical };
                let outcome = match args.first() {
                    Some(name) => {
                        let o = data.outcome(name)?;
                        if o.kind() != kind {
                            return Err(Error::value(format!("objective '{}' needs a {:?} outcome but '{}' is {:?}", nick, kind, name, o.kind())));
                        }
                        o.name().to_string()
                    }
                    None => data.first_outcome(kind)?.name().to_string(),
                };
                let learner = match args.get(1) {
                    Some(l) => Learner::from_nick(l)?,
                    None if kind == OutcomeKind::Survival => defaults.survival_learner.clone(),
                    None => defaults.classification_learner.clone(),
                };
                if learner.target_kind() != kind {
                    return Err(Error::value(format!("learner {} cannot serve objective '{}'", learner.nick(), nick)));
                }
                (Some(learner), Some(outcome))
            }
        };

        let nick = match &outcome {
            Some(o) if !args.is_empty() => format!("{}_{}", computer.name(), o),
            _ => computer.name().to_string(),
        };
        Ok(Objective { nick, computer, learner, outcome })
    }

    pub fn structural(computer: Computer) -> Objective {
        Objective { nick: computer.name().to_string(), computer, learner: None, outcome: None }
    }

    pub fn tag(&self) -> ObjectiveTag {
        self.computer.tag()
    }

    pub fn requires_predictions(&self) -> bool {
        self.tag() != ObjectiveTag::Structural
    }

    pub fn requires_training_predictions(&self) -> bool {
        matches!(self.computer, Computer::Consistency)
    }

    pub fn is_leanness(&self) -> bool {
        self.computer.is_leanness()
    }

    /// Target of the objective over some samples of `data`
    pub fn target(&self, data: &Data, samples: &[usize]) -> Result<Target> {
        let name = self.outcome.as_ref()
            .ok_or_else(|| Error::illegal(format!("structural objective {} has no target", self.nick)))?;
        Ok(Target::from_outcome(data.outcome(name)?, samples))
    }

    /// Fitness of a predictor on held-out data, optionally also on its training data
    pub fn compute_predictive(&self, predictor: &Predictor, x_test: &[Vec<f64>], y_test: &Target,
        train: Option<(&[Vec<f64>], &Target)>) -> Result<CvResult> {
        let tag = self.tag();
        match &self.computer {
            Computer::BalancedAccuracy => {
                let (fitness, per_class) = balanced_accuracy(&predictor.predict_classes(x_test)?, y_test)?;
                Ok(CvResult { fitness, per_class: Some(per_class), tag })
            }
            Computer::Consistency => {
                let (x_train, y_train) = train
                    .ok_or_else(|| Error::illegal("consistency needs the training predictions"))?;
                let (test, _) = balanced_accuracy(&predictor.predict_classes(x_test)?, y_test)?;
                let (fit, _) = balanced_accuracy(&predictor.predict_classes(x_train)?, y_train)?;
                Ok(CvResult { fitness: (1.0 - (fit - test).abs()).clamp(0.0, 1.0), per_class: None, tag })
            }
            Computer::CIndex => match y_test {
                Target::Survival { duration, event } => Ok(CvResult {
                    fitness: concordance_index(&predictor.predict_risk(x_test)?, duration, event)?,
                    per_class: None,
                    tag,
                }),
                _ => Err(Error::illegal("c_index needs a survival target")),
            },
            Computer::Separation | Computer::RootSeparation => {
                let per_class = separations(&predictor.predict_proba(x_test)?, y_test)?;
                let valid: Vec<f64> = per_class.iter().copied().filter(|v| !v.is_nan()).collect();
                let fitness = if matches!(self.computer, Computer::RootSeparation) {
                    valid.iter().map(|v| v.sqrt()).sum::<f64>() / valid.len() as f64
                } else {
                    valid.iter().sum::<f64>() / valid.len() as f64
                };
                Ok(CvResult { fitness, per_class: Some(per_class), tag })
            }
            _ => Err(Error::illegal(format!("{} is structural and takes no predictor", self.nick))),
        }
    }

    pub fn compute_structural(&self, mask: &FeatureMask) -> Result<CvResult> {
        let n = mask.len();
        if n == 0 {
            return Err(Error::value("leanness of an empty feature space"));
        }
        let k = mask.count();
        let fitness = match &self.computer {
            Computer::Leanness => leanness(k, n),
            Computer::RootLeanness => leanness(k, n).sqrt(),
            Computer::SoftLeanness { saturation } => soft_leanness(k, n, *saturation),
            _ => return Err(Error::illegal(format!("{} needs predictions", self.nick))),
        };
        Ok(CvResult { fitness, per_class: None, tag: ObjectiveTag::Structural })
    }
}

pub fn leanness(k: usize, n: usize) -> f64 {
    1.0 - k as f64 / n as f64
}

/// 1 - min(k, s)/s with s = min(n, saturation): full credit is lost after `s` features
pub fn soft_leanness(k: usize, n: usize, saturation: usize) -> f64 {
    let s = n.min(saturation).max(1);
    1.0 - k.min(s) as f64 / s as f64
}

/// Mean recall over the classes present in `y`, and the recall of every class
/// (NaN for absent classes)
pub fn balanced_accuracy(predicted: &[usize], y: &Target) -> Result<(f64, Vec<f64>)> {
    let (labels, n_classes) = match y {
        Target::Classes { labels, n_classes } => (labels, *n_classes),
        _ => return Err(Error::illegal("balanced accuracy needs a categorical target")),
    };
    if labels.is_empty() {
        return Err(Error::degenerate("empty test set"));
    }
    let mut hits = vec![0usize; n_classes];
    let mut totals = vec![0usize; n_classes];
    for (p, l) in predicted.iter().zip(labels.iter()) {
        totals[*l] += 1;
        if p == l {
            hits[*l] += 1;
        }
    }
    let recalls: Vec<f64> = hits.iter().zip(totals.iter())
        .map(|(h, t)| if *t > 0 { *h as f64 / *t as f64 } else { f64::NAN })
        .collect();
    let present: Vec<f64> = recalls.iter().copied().filter(|r| !r.is_nan()).collect();
    Ok((present.iter().sum::<f64>() / present.len() as f64, recalls))
}

/// Harrell's C. A pair is comparable when the shorter time is an event, or
/// when times tie and only one of the two is an event. Ties in risk count 1/2.
pub fn concordance_index(risk: &[f64], duration: &[f64], event: &[bool]) -> Result<f64> {
    let mut concordant = 0.0;
    let mut comparable = 0usize;
    for i in 0..risk.len() {
        if !event[i] {
            continue;
        }
        for j in 0..risk.len() {
            if i == j {
                continue;
            }
            let shorter = duration[i] < duration[j] || (duration[i] == duration[j] && !event[j]);
            if !shorter {
                continue;
            }
            comparable += 1;
            if risk[i] > risk[j] {
                concordant += 1.0;
            } else if risk[i] == risk[j] {
                concordant += 0.5;
            }
        }
    }
    if comparable == 0 {
        return Err(Error::degenerate("no comparable pair in the test set"));
    }
    Ok(concordant / comparable as f64)
}

/// Per class c: mean P(c|x) over members minus mean P(c|x) over non-members,
/// clipped to [0, 1]; NaN when c has no member or no non-member
pub fn separations(proba: &[Vec<f64>], y: &Target) -> Result<Vec<f64>> {
    let (labels, n_classes) = match y {
        Target::Classes { labels, n_classes } => (labels, *n_classes),
        _ => return Err(Error::illegal("separation needs a categorical target")),
    };
    let per_class: Vec<f64> = (0..n_classes)
        .map(|c| {
            let (mut in_sum, mut in_n, mut out_sum, mut out_n) = (0.0, 0usize, 0.0, 0usize);
            for (p, l) in proba.iter().zip(labels.iter()) {
                if *l == c {
                    in_sum += p[c];
                    in_n += 1;
                } else {
                    out_sum += p[c];
                    out_n += 1;
                }
            }
            if in_n == 0 || out_n == 0 {
                f64::NAN
            } else {
                (in_sum / in_n as f64 - out_sum / out_n as f64).clamp(0.0, 1.0)
            }
        })
        .collect();
    if per_class.iter().all(|v| v.is_nan()) {
        return Err(Error::degenerate("separation needs at least two classes in the test set"));
    }
    Ok(per_class)
}

#[cfg(test)]
impl Objective {
    /// Balanced accuracy with naive Bayes, then leanness
    pub fn test_pair(data: &Data) -> Vec<Objective> {
        let defaults = ObjectiveDefaults::default();
        vec![
            Objective::from_nick("balanced_accuracy", &defaults, data).unwrap(),
            Objective::from_nick("leanness", &defaults, data).unwrap(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_target() -> Target {
        Target::Classes { labels: vec![0, 0, 1, 1], n_classes: 2 }
    }

    #[test]
    fn test_balanced_accuracy() {
        let (ba, per_class) = balanced_accuracy(&[0, 1, 1, 1], &toy_target()).unwrap();
        assert_eq!(ba, 0.75);
        assert_eq!(per_class, vec![0.5, 1.0]);

        let three = Target::Classes { labels: vec![0, 0, 1], n_classes: 3 };
        let (ba, per_class) = balanced_accuracy(&[0, 0, 0], &three).unwrap();
        assert_eq!(ba, 0.5);
        assert!(per_class[2].is_nan());
    }

    #[test]
    fn test_concordance_index() {
        let duration = [1.0, 2.0, 3.0, 4.0];
        let event = [true, true, true, false];
        assert_eq!(concordance_index(&[4.0, 3.0, 2.0, 1.0], &duration, &event).unwrap(), 1.0);
        assert_eq!(concordance_index(&[1.0, 2.0, 3.0, 4.0], &duration, &event).unwrap(), 0.0);
        assert_eq!(concordance_index(&[1.0, 1.0, 1.0, 1.0], &duration, &event).unwrap(), 0.5);
        assert!(concordance_index(&[1.0, 2.0], &[1.0, 2.0], &[false, false]).is_err());
    }

    #[test]
    fn test_concordance_tied_times() {
        // tied times count only when exactly one is an event
        let c = concordance_index(&[2.0, 1.0, 0.0], &[1.0, 1.0, 1.0], &[true, false, true]).unwrap();
        // comparable: (0,1) concordant, (2,1) discordant
        assert_eq!(c, 0.5);
    }

    #[test]
    fn test_separation() {
        let proba = vec![vec![0.9, 0.1], vec![0.7, 0.3], vec![0.2, 0.8], vec![0.4, 0.6]];
        let sep = separations(&proba, &toy_target()).unwrap();
        assert!((sep[0] - 0.5).abs() < 1e-12);
        assert!((sep[1] - 0.5).abs() < 1e-12);
        let reversed: Vec<Vec<f64>> = proba.iter().rev().cloned().collect();
        assert_eq!(separations(&reversed, &toy_target()).unwrap(), vec![0.0, 0.0]);
        let single = Target::Classes { labels: vec![0, 0], n_classes: 2 };
        assert!(separations(&proba[..2], &single).is_err());
    }

    #[test]
    fn test_leanness_variants() {
        assert_eq!(leanness(0, 4), 1.0);
        assert_eq!(leanness(2, 4), 0.5);
        assert_eq!(soft_leanness(50, 10_000, 100), 0.5);
        assert_eq!(soft_leanness(500, 10_000, 100), 0.0);
        assert_eq!(soft_leanness(2, 4, 100), 0.5);

        let all_zero = FeatureMask::empty(4);
        let lean = Objective::structural(Computer::Leanness);
        assert_eq!(lean.compute_structural(&all_zero).unwrap().fitness, 1.0);
        let root = Objective::structural(Computer::RootLeanness);
        assert_eq!(root.compute_structural(&FeatureMask::from_positions(4, &[0, 1, 2])).unwrap().fitness, 0.5);
    }

    #[test]
    fn test_soften() {
        assert_eq!(Computer::Leanness.soften(0.995, 10_000, 100), 0.5);
        assert_eq!(Computer::BalancedAccuracy.soften(0.8, 10_000, 100), 0.8);
        assert_eq!(Computer::SoftLeanness { saturation: 4 }.soften(0.25, 8, 4), 0.25);
        // root leanness sqrt(0.75) over 8 features is k = 2, half of a saturation of 4
        assert!((Computer::RootLeanness.soften(0.75f64.sqrt(), 8, 4) - 0.5).abs() < 1e-12);
        assert!(Computer::Leanness.soften(f64::NAN, 8, 4).is_nan());
    }

    #[test]
    fn test_structural_from_nick() {
        assert_eq!(Computer::structural_from_nick("root_leanness", 10), Some(Computer::RootLeanness));
        assert_eq!(Computer::structural_from_nick("soft_leanness", 10), Some(Computer::SoftLeanness { saturation: 10 }));
        assert_eq!(Computer::structural_from_nick("balanced_accuracy_class", 10), None);
    }

    #[test]
    fn test_from_nick_resolves_outcome_and_learner() {
        let data = Data::test();
        let defaults = ObjectiveDefaults::default();
        let ba = Objective::from_nick("balanced_accuracy", &defaults, &data).unwrap();
        assert_eq!(ba.outcome.as_deref(), Some("class"));
        assert_eq!(ba.learner, Some(Learner::NaiveBayes));
        assert!(ba.requires_predictions());
        assert!(!ba.requires_training_predictions());

        let lr = Objective::from_nick("balanced_accuracy(class, logistic)", &defaults, &data).unwrap();
        assert_eq!(lr.nick, "balanced_accuracy_class");
        assert!(matches!(lr.learner, Some(Learner::Logistic { .. })));

        let lean = Objective::from_nick("soft_leanness", &defaults, &data).unwrap();
        assert_eq!(lean.computer, Computer::SoftLeanness { saturation: 100 });
        assert!(!lean.requires_predictions());

        assert!(Objective::from_nick("c_index", &defaults, &data).is_err(), "no survival outcome");
        assert!(Objective::from_nick("balanced_accuracy(class, cox)", &defaults, &data).is_err());
        assert!(Objective::from_nick("auc", &defaults, &data).is_err());
    }

    #[test]
    fn test_structural_and_predictive_dispatch_are_exclusive() {
        let data = Data::test();
        let defaults = ObjectiveDefaults::default();
        let ba = Objective::from_nick("balanced_accuracy", &defaults, &data).unwrap();
        assert!(matches!(ba.compute_structural(&FeatureMask::empty(4)), Err(Error::IllegalState(_))));
        let lean = Objective::structural(Computer::Leanness);
        let prior = Predictor::ClassPrior { priors: vec![0.5, 0.5], n_features: 0 };
        assert!(matches!(lean.compute_predictive(&prior, &[], &toy_target(), None), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_consistency_uses_training_predictions() {
        let data = Data::test();
        let defaults = ObjectiveDefaults::default();
        let objective = Objective::from_nick("consistency", &defaults, &data).unwrap();
        assert!(objective.requires_training_predictions());
        let all: Vec<usize> = (0..10).collect();
        let y = objective.target(&data, &all).unwrap();
        let x = data.project_all(&FeatureMask::from_positions(4, &[0]));
        let predictor = Learner::NaiveBayes.fit(&x, &y, None).unwrap();
        assert!(objective.compute_predictive(&predictor, &x, &y, None).is_err());
        let result = objective.compute_predictive(&predictor, &x, &y, Some((x.as_slice(), &y))).unwrap();
        assert_eq!(result.fitness, 1.0);
    }
}
