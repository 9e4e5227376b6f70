use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};
use crate::mask::FeatureMask;

/// Kind of an outcome file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Categorical,
    Survival,
}

/// A target of the learners. Labels are indices into `levels`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Categorical { name: String, levels: Vec<String>, labels: Vec<usize> },
    Survival { name: String, duration: Vec<f64>, event: Vec<bool> },
}

impl Outcome {
    pub fn name(&self) -> &str {
        match self {
            Outcome::Categorical { name, .. } | Outcome::Survival { name, .. } => name,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Categorical { .. } => OutcomeKind::Categorical,
            Outcome::Survival { .. } => OutcomeKind::Survival,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Outcome::Categorical { labels, .. } => labels.len(),
            Outcome::Survival { duration, .. } => duration.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_classes(&self) -> usize {
        match self {
            Outcome::Categorical { levels, .. } => levels.len(),
            Outcome::Survival { .. } => 0,
        }
    }

    pub fn subset(&self, samples: &[usize]) -> Outcome {
        match self {
            Outcome::Categorical { name, levels, labels } => Outcome::Categorical {
                name: name.clone(),
                levels: levels.clone(),
                labels: samples.iter().map(|i| labels[*i]).collect(),
            },
            Outcome::Survival { name, duration, event } => Outcome::Survival {
                name: name.clone(),
                duration: samples.iter().map(|i| duration[*i]).collect(),
                event: samples.iter().map(|i| event[*i]).collect(),
            },
        }
    }

    /// Categorical key of one sample used when building strata: the label for
    /// categorical outcomes, the event indicator for survival ones
    pub fn stratification_key(&self, sample: usize) -> usize {
        match self {
            Outcome::Categorical { labels, .. } => labels[sample],
            Outcome::Survival { event, .. } => event[sample] as usize,
        }
    }
}

/// Contiguous range of the concatenated feature space coming from one view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewSpan {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub x: Vec<Vec<f64>>,          // samples x concatenated features
    pub features: Vec<String>,
    pub samples: Vec<String>,
    pub views: Vec<ViewSpan>,
    pub outcomes: Vec<Outcome>,
    pub feature_len: usize,
    pub sample_len: usize,
}

/// One view as read from disk: features in rows, samples in columns
#[derive(Clone, Debug)]
pub struct RawView {
    pub name: String,
    pub samples: Vec<String>,
    pub features: Vec<String>,
    pub values: Vec<Vec<f64>>, // features x samples
}

impl RawView {
    /// Load a TSV view. The first line lists sample names after a leading
    /// header cell; each following line is `feature<TAB>v1<TAB>v2...`.
    pub fn load(name: &str, path: &str) -> Result<RawView> {
        info!("Loading view {} from {}...", name, path);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(false)
            .from_path(path)?;

        let samples: Vec<String> = reader.headers()?.iter().skip(1).map(String::from).collect();
        let mut features = Vec::new();
        let mut values = Vec::new();
        let mut unparsable = 0usize;

        for record in reader.records() {
            let record = record?;
            let mut fields = record.iter();
            let feature = fields.next().ok_or_else(|| Error::value(format!("empty line in {}", path)))?;
            features.push(feature.to_string());
            let row: Vec<f64> = fields
                .map(|v| v.trim().parse::<f64>().unwrap_or_else(|_| { unparsable += 1; 0.0 }))
                .collect();
            values.push(row);
        }

        if unparsable > 0 {
            warn!("{} values of view {} could not be parsed and were set to 0", unparsable, name);
        }

        Ok(RawView { name: name.to_string(), samples, features, values })
    }
}

/// Load an outcome TSV: a header line then `sample<TAB>label` lines for
/// categorical outcomes or `sample<TAB>duration<TAB>event` for survival ones
pub fn load_outcome(name: &str, path: &str, kind: OutcomeKind) -> Result<(Vec<String>, Outcome)> {
    info!("Loading {:?} outcome {} from {}...", kind, name, path);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;

    let mut samples = Vec::new();
    let mut raw_labels = Vec::new();
    let mut duration = Vec::new();
    let mut event = Vec::new();

    for record in reader.records() {
        let record = record?;
        let sample = record.get(0).ok_or_else(|| Error::value(format!("empty line in {}", path)))?;
        match kind {
            OutcomeKind::Categorical => {
                let label = record.get(1).ok_or_else(|| Error::value(format!("missing label for {} in {}", sample, path)))?;
                raw_labels.push(label.trim().to_string());
            }
            OutcomeKind::Survival => {
                let d = record.get(1).and_then(|v| v.trim().parse::<f64>().ok())
                    .ok_or_else(|| Error::value(format!("missing or invalid duration for {} in {}", sample, path)))?;
                let e = record.get(2).map(|v| v.trim())
                    .ok_or_else(|| Error::value(format!("missing event for {} in {}", sample, path)))?;
                let e = match e {
                    "1" | "true" | "True" | "TRUE" => true,
                    "0" | "false" | "False" | "FALSE" => false,
                    other => return Err(Error::value(format!("invalid event '{}' for {} in {}", other, sample, path))),
                };
                duration.push(d);
                event.push(e);
            }
        }
        samples.push(sample.to_string());
    }

    let outcome = match kind {
        OutcomeKind::Categorical => {
            let levels: Vec<String> = raw_labels.iter().cloned().collect::<BTreeSet<String>>().into_iter().collect();
            let labels = raw_labels.iter()
                .map(|l| levels.iter().position(|x| x == l).unwrap_or(0))
                .collect();
            Outcome::Categorical { name: name.to_string(), levels, labels }
        }
        OutcomeKind::Survival => Outcome::Survival { name: name.to_string(), duration, event },
    };
    Ok((samples, outcome))
}

impl Data {
    /// Create a new empty `Data`
    pub fn new() -> Data {
        Data {
            x: Vec::new(),
            features: Vec::new(),
            samples: Vec::new(),
            views: Vec::new(),
            outcomes: Vec::new(),
            feature_len: 0,
            sample_len: 0,
        }
    }

    /// Assemble a dataset from views and outcomes keyed by sample name.
    /// Only samples present in every view and every outcome are kept, in the
    /// order of the first view. Feature names are prefixed by their view
    /// name when more than one view is given.
    pub fn from_parts(views: Vec<RawView>, outcomes: Vec<(Vec<String>, Outcome)>) -> Result<Data> {
        if views.is_empty() {
            return Err(Error::value("at least one view is required"));
        }

        let view_index: Vec<HashMap<&str, usize>> = views.iter()
            .map(|v| v.samples.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect())
            .collect();
        let outcome_index: Vec<HashMap<&str, usize>> = outcomes.iter()
            .map(|(s, _)| s.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect())
            .collect();

        let kept: Vec<&String> = views[0].samples.iter()
            .filter(|s| view_index.iter().all(|idx| idx.contains_key(s.as_str()))
                && outcome_index.iter().all(|idx| idx.contains_key(s.as_str())))
            .collect();

        let dropped = views[0].samples.len() - kept.len();
        if dropped > 0 {
            warn!("{} samples are missing from at least one view or outcome and were dropped", dropped);
        }
        if kept.is_empty() {
            return Err(Error::value("no sample is shared by all views and outcomes"));
        }

        let prefix = views.len() > 1;
        let mut features = Vec::new();
        let mut spans = Vec::new();
        for view in &views {
            let start = features.len();
            for f in &view.features {
                features.push(if prefix { format!("{}:{}", view.name, f) } else { f.clone() });
            }
            spans.push(ViewSpan { name: view.name.clone(), start, end: features.len() });
        }

        let x: Vec<Vec<f64>> = kept.iter()
            .map(|s| {
                let mut row = Vec::with_capacity(features.len());
                for (view, idx) in views.iter().zip(view_index.iter()) {
                    let col = idx[s.as_str()];
                    row.extend(view.values.iter().map(|feature_row| feature_row.get(col).copied().unwrap_or(0.0)));
                }
                row
            })
            .collect();

        let outcomes: Vec<Outcome> = outcomes.iter().zip(outcome_index.iter())
            .map(|((_, outcome), idx)| {
                let order: Vec<usize> = kept.iter().map(|s| idx[s.as_str()]).collect();
                outcome.subset(&order)
            })
            .collect();

        let feature_len = features.len();
        Ok(Data {
            x,
            features,
            samples: kept.into_iter().cloned().collect(),
            views: spans,
            outcomes,
            feature_len,
            sample_len: 0,
        }.with_sample_len())
    }

    fn with_sample_len(mut self) -> Data {
        self.sample_len = self.x.len();
        self
    }

    /// Check if another dataset is compatible with the current one (same features, same order)
    pub fn check_compatibility(&self, other: &Data) -> bool {
        self.features == other.features
    }

    pub fn outcome(&self, name: &str) -> Result<&Outcome> {
        self.outcomes.iter().find(|o| o.name() == name)
            .ok_or_else(|| Error::value(format!("unknown outcome '{}'", name)))
    }

    /// First outcome of the requested kind
    pub fn first_outcome(&self, kind: OutcomeKind) -> Result<&Outcome> {
        self.outcomes.iter().find(|o| o.kind() == kind)
            .ok_or_else(|| Error::value(format!("no {:?} outcome loaded", kind)))
    }

    /// filter Data for some samples (represented by a slice of indices)
    pub fn subset(&self, samples: &[usize]) -> Data {
        Data {
            x: samples.iter().map(|i| self.x[*i].clone()).collect(),
            features: self.features.clone(),
            samples: samples.iter().map(|i| self.samples[*i].clone()).collect(),
            views: self.views.clone(),
            outcomes: self.outcomes.iter().map(|o| o.subset(samples)).collect(),
            feature_len: self.feature_len,
            sample_len: samples.len(),
        }
    }

    /// Sample-by-selected-feature matrix of the given rows
    pub fn project(&self, mask: &FeatureMask, samples: &[usize]) -> Vec<Vec<f64>> {
        samples.iter().map(|i| mask.apply_row(&self.x[*i])).collect()
    }

    /// Whole dataset projected on the mask
    pub fn project_all(&self, mask: &FeatureMask) -> Vec<Vec<f64>> {
        mask.apply(&self.x)
    }

    pub fn column(&self, feature: usize) -> Vec<f64> {
        self.x.iter().map(|row| row[feature]).collect()
    }

    /// Restrict the views to the named ones, in the given order
    pub fn select_views(&self, names: &[String]) -> Result<Data> {
        let mut spans = Vec::new();
        let mut columns = Vec::new();
        for name in names {
            let span = self.views.iter().find(|v| &v.name == name)
                .ok_or_else(|| Error::value(format!("unknown view '{}'", name)))?;
            let start = columns.len();
            columns.extend(span.start..span.end);
            spans.push(ViewSpan { name: name.clone(), start, end: columns.len() });
        }
        Ok(Data {
            x: self.x.iter().map(|row| columns.iter().map(|c| row[*c]).collect()).collect(),
            features: columns.iter().map(|c| self.features[*c].clone()).collect(),
            samples: self.samples.clone(),
            views: spans,
            outcomes: self.outcomes.clone(),
            feature_len: columns.len(),
            sample_len: self.sample_len,
        })
    }

    /// Names of the selected features, in ascending position order
    pub fn feature_names(&self, mask: &FeatureMask) -> Vec<String> {
        mask.apply_row(&self.features)
    }
}

impl Default for Data {
    fn default() -> Self {
        Data::new()
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Features: {}   Samples: {}   Views: {}", self.feature_len, self.sample_len,
            self.views.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join(","))?;

        let samples_string = self.samples.join("\t");
        let truncated_samples = if samples_string.len() > 100 {
            format!("{}...", &samples_string[..97])
        } else {
            samples_string
        };
        writeln!(f, "X:                  {}", truncated_samples)?;

        // Limit to the first 20 rows
        for j in (0..self.feature_len).take(20) {
            let row_display: String = self.x.iter().map(|row| format!("{:.2}", row[j])).collect::<Vec<_>>().join("\t");
            let truncated_row = if row_display.len() > 80 {
                format!("{}...", &row_display[..77])
            } else {
                row_display
            };
            writeln!(f, "{:<20} {}", self.features[j], truncated_row)?;
        }

        for outcome in &self.outcomes {
            writeln!(f, "\n{} ({:?}): {} values", outcome.name(), outcome.kind(), outcome.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
impl Data {
    /// 10 samples, 4 features: f0 and f1 are informative, f2 and f3 are noise
    pub fn test() -> Data {
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let f0 = [0.1, 0.2, 0.15, 0.05, 0.3, 0.9, 0.8, 0.95, 0.85, 0.7];
        let f1 = [0.2, 0.1, 0.25, 0.3, 0.15, 0.75, 0.9, 0.8, 0.7, 0.95];
        let f2 = [0.5, 0.1, 0.9, 0.3, 0.7, 0.2, 0.8, 0.4, 0.6, 0.5];
        let f3 = [0.3, 0.8, 0.2, 0.6, 0.4, 0.7, 0.1, 0.9, 0.3, 0.5];
        let x = (0..10).map(|i| vec![f0[i], f1[i], f2[i], f3[i]]).collect();
        Data {
            x,
            features: (0..4).map(|j| format!("f{}", j)).collect(),
            samples: (0..10).map(|i| format!("s{}", i)).collect(),
            views: vec![ViewSpan { name: "toy".to_string(), start: 0, end: 4 }],
            outcomes: vec![Outcome::Categorical {
                name: "class".to_string(),
                levels: vec!["a".to_string(), "b".to_string()],
                labels,
            }],
            feature_len: 4,
            sample_len: 10,
        }
    }

    /// Survival toy set: risk grows with f0, f1 is noise
    pub fn test_survival() -> Data {
        let n = 12;
        let f0: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let f1 = [0.4, 0.9, 0.1, 0.6, 0.3, 0.8, 0.2, 0.7, 0.5, 0.0, 0.35, 0.65];
        let duration: Vec<f64> = (0..n).map(|i| (n - i) as f64 * 2.0).collect();
        let event: Vec<bool> = (0..n).map(|i| i % 4 != 3).collect();
        Data {
            x: (0..n).map(|i| vec![f0[i], f1[i]]).collect(),
            features: vec!["f0".to_string(), "f1".to_string()],
            samples: (0..n).map(|i| format!("s{}", i)).collect(),
            views: vec![ViewSpan { name: "toy".to_string(), start: 0, end: 2 }],
            outcomes: vec![Outcome::Survival { name: "os".to_string(), duration, event }],
            feature_len: 2,
            sample_len: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_load_view_and_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let x = write_file(&dir, "mrna.tsv", "feature\tA\tB\tC\ng1\t1.0\t2.0\t3.0\ng2\t0.5\tNA\t1.5\n");
        let y = write_file(&dir, "y.tsv", "sample\tclass\nC\tcase\nA\tcontrol\nB\tcase\n");
        let s = write_file(&dir, "os.tsv", "sample\ttime\tstatus\nA\t10\t1\nB\t5\t0\nC\t7.5\t1\n");

        let view = RawView::load("mrna", &x).unwrap();
        assert_eq!(view.samples, vec!["A", "B", "C"]);
        assert_eq!(view.features, vec!["g1", "g2"]);
        assert_eq!(view.values[1], vec![0.5, 0.0, 1.5], "unparsable values become 0");

        let classes = load_outcome("class", &y, OutcomeKind::Categorical).unwrap();
        let survival = load_outcome("os", &s, OutcomeKind::Survival).unwrap();
        let data = Data::from_parts(vec![view], vec![classes, survival]).unwrap();

        assert_eq!(data.sample_len, 3);
        assert_eq!(data.feature_len, 2);
        assert_eq!(data.x[2], vec![3.0, 1.5]);
        match data.outcome("class").unwrap() {
            Outcome::Categorical { levels, labels, .. } => {
                assert_eq!(levels, &vec!["case".to_string(), "control".to_string()]);
                assert_eq!(labels, &vec![1, 0, 0], "labels must follow the view sample order");
            }
            _ => panic!("class should be categorical"),
        }
        match data.outcome("os").unwrap() {
            Outcome::Survival { duration, event, .. } => {
                assert_eq!(duration, &vec![10.0, 5.0, 7.5]);
                assert_eq!(event, &vec![true, false, true]);
            }
            _ => panic!("os should be survival"),
        }
    }

    #[test]
    fn test_from_parts_keeps_shared_samples_and_prefixes_views() {
        let v1 = RawView {
            name: "mrna".to_string(),
            samples: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            features: vec!["g1".to_string()],
            values: vec![vec![1.0, 2.0, 3.0]],
        };
        let v2 = RawView {
            name: "mirna".to_string(),
            samples: vec!["C".to_string(), "A".to_string()],
            features: vec!["m1".to_string()],
            values: vec![vec![30.0, 10.0]],
        };
        let outcome = Outcome::Categorical { name: "y".to_string(), levels: vec!["0".to_string(), "1".to_string()], labels: vec![0, 1, 1] };
        let data = Data::from_parts(vec![v1, v2], vec![(vec!["A".to_string(), "B".to_string(), "C".to_string()], outcome)]).unwrap();

        assert_eq!(data.samples, vec!["A", "C"]);
        assert_eq!(data.features, vec!["mrna:g1", "mirna:m1"]);
        assert_eq!(data.x, vec![vec![1.0, 10.0], vec![3.0, 30.0]]);
        assert_eq!(data.views[1], ViewSpan { name: "mirna".to_string(), start: 1, end: 2 });
        assert_eq!(data.outcomes[0].subset(&[0, 1]).len(), 2);
    }

    #[test]
    fn test_subset_and_project() {
        let data = Data::test();
        let sub = data.subset(&[9, 0]);
        assert_eq!(sub.sample_len, 2);
        assert_eq!(sub.samples, vec!["s9", "s0"]);
        assert_eq!(sub.outcomes[0].stratification_key(0), 1);

        let mask = FeatureMask::from_positions(4, &[1, 3]);
        assert_eq!(data.project(&mask, &[0]), vec![vec![0.2, 0.3]]);
        assert_eq!(data.feature_names(&mask), vec!["f1", "f3"]);
        assert_eq!(data.project_all(&mask).len(), 10);
    }

    #[test]
    fn test_subset_empty_set() {
        let sub = Data::test().subset(&[]);
        assert_eq!(sub.sample_len, 0);
        assert!(sub.outcomes[0].is_empty());
    }

    #[test]
    fn test_select_views_unknown_view_is_rejected() {
        let data = Data::test();
        assert!(data.select_views(&["toy".to_string()]).is_ok());
        assert!(matches!(data.select_views(&["nope".to_string()]), Err(Error::Value(_))));
    }

    #[test]
    fn test_data_compatibility() {
        let a = Data::test();
        let mut b = Data::test();
        assert!(a.check_compatibility(&b));
        b.features[0] = "other".to_string();
        assert!(!a.check_compatibility(&b));
    }
}
