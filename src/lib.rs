pub mod error;
pub mod utils;
pub mod mask;
pub mod data;
pub mod param;
pub mod cv;
pub mod learner;
pub mod objective;
pub mod regressor;
pub mod evaluator;
pub mod adjuster;
pub mod individual;
pub mod population;
pub mod sorting;
pub mod hypervolume;
pub mod pool;
pub mod hof;
pub mod ga;
pub mod solutions;
pub mod registry;
pub mod experiment;

use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::data::{load_outcome, Data, RawView};
use crate::error::Result;
use crate::experiment::{run_nested_cv, Experiment};
use crate::param::{OutcomeSource, Param, ViewSource};

/// Loads the views and outcomes listed in `param.data`, runs the nested
/// cross-validation of every adjuster and returns the experiment summary.
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<Experiment> {
    let data = load_data(&param.data.view_files, &param.data.outcome_files)?;
    let data = if param.data.views.is_empty() { data } else { data.select_views(&param.data.views)? };
    cinfo!(param.general.display_colorful, "\x1b[2;97m{:?}\x1b[0m", data);

    let external = if param.data.external_view_files.is_empty() {
        None
    } else {
        debug!("Loading external data...");
        let external = load_data(&param.data.external_view_files, &param.data.external_outcome_files)?;
        let names: Vec<String> = data.views.iter().map(|v| v.name.clone()).collect();
        Some(external.select_views(&names)?)
    };

    run_on_data(data, external, param, running)
}

/// Same as `run` over datasets that are already in memory
pub fn run_on_data(data: Data, external: Option<Data>, param: &Param, running: Arc<AtomicBool>) -> Result<Experiment> {
    let experiment = run_nested_cv(param, Arc::new(data), external.map(Arc::new), running)?;
    cinfo!(param.general.display_colorful, "{}", experiment.display_results());
    Ok(experiment)
}

fn load_data(views: &[ViewSource], outcomes: &[OutcomeSource]) -> Result<Data> {
    let views = views.iter().map(|v| RawView::load(&v.name, &v.path)).collect::<Result<Vec<_>>>()?;
    let outcomes = outcomes.iter().map(|o| load_outcome(&o.name, &o.path, o.kind)).collect::<Result<Vec<_>>>()?;
    Data::from_parts(views, outcomes)
}
