use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use paretomics::param::{self, Param};
use paretomics::run;

fn start_logger(param: &Param) -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(&param.general.log_level)?;
    if param.general.log_base.is_empty() {
        logger.log_to_stdout().start()
    } else {
        logger
            .log_to_file(FileSpec::default().basename(&param.general.log_base).suffix(&param.general.log_suffix))
            .duplicate_to_stderr(Duplicate::Warn)
            .start()
    }
}

fn main() {
    let param_path = std::env::args().nth(1).unwrap_or_else(|| "param.yaml".to_string());
    let param = match param::get(param_path.clone()) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("Cannot read parameters from {}: {}", param_path, e);
            std::process::exit(1);
        }
    };

    let _logger = match start_logger(&param) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Cannot start the logger: {}", e);
            std::process::exit(1);
        }
    };
    info!("Paretomics v{} with parameters from {}", env!("CARGO_PKG_VERSION"), param_path);

    // The optimizers finish their current generation then save what they have
    let running = Arc::new(AtomicBool::new(true));
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            let flag = Arc::clone(&running);
            thread::spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    warn!("Signal {} received, stopping after the current generation...", signal);
                    flag.store(false, Ordering::Relaxed);
                }
            });
        }
        Err(e) => warn!("Cannot register signal handlers: {}", e),
    }

    if let Err(e) = run(&param, running) {
        error!("{}", e);
        std::process::exit(1);
    }
}
