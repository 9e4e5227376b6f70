//! Worker threads evaluating masks in parallel.
//!
//! One producer (the GA) pushes numbered packages on a bounded queue; workers
//! share the evaluator through an `Arc` and answer on a results channel. The
//! gather step puts the answers back in submission order, so results do not
//! depend on the number of workers.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::evaluator::{EvaluationRecord, Evaluator};
use crate::mask::FeatureMask;

const QUEUE_BOUND_PER_WORKER: usize = 4;
const GATHER_POLL: Duration = Duration::from_millis(50);

struct Package {
    batch: u64,
    sequence: usize,
    mask: FeatureMask,
}

struct Answer {
    batch: u64,
    sequence: usize,
    record: Result<EvaluationRecord>,
}

pub struct EvaluationPool {
    evaluator: Arc<Evaluator>,
    tasks: Option<Sender<Package>>,
    answers: Receiver<Answer>,
    workers: Vec<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
    batch: u64,
}

impl EvaluationPool {
    pub fn new(evaluator: Arc<Evaluator>, n_workers: usize) -> Result<EvaluationPool> {
        let n_workers = n_workers.max(1);
        let (task_tx, task_rx) = bounded::<Package>(n_workers * QUEUE_BOUND_PER_WORKER);
        let (answer_tx, answer_rx) = unbounded::<Answer>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(n_workers);
        for w in 0..n_workers {
            let task_rx = task_rx.clone();
            let answer_tx = answer_tx.clone();
            let evaluator = Arc::clone(&evaluator);
            let cancelled = Arc::clone(&cancelled);
            let handle = std::thread::Builder::new()
                .name(format!("evaluator-{}", w))
                .spawn(move || worker_loop(&evaluator, task_rx, answer_tx, cancelled))?;
            workers.push(handle);
        }
        debug!("Evaluation pool started with {} workers", n_workers);

        Ok(EvaluationPool { evaluator, tasks: Some(task_tx), answers: answer_rx, workers, cancelled, batch: 0 })
    }

    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Evaluates every mask and returns the records in input order. The
    /// first failing package cancels the pool: the remaining packages are
    /// discarded and the error is returned; later calls fail with
    /// `Error::Cancelled`.
    pub fn evaluate_batch(&mut self, masks: &[FeatureMask]) -> Result<Vec<EvaluationRecord>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled("the evaluation pool was shut down".to_string()));
        }
        self.batch += 1;
        let batch = self.batch;
        let Some(tasks) = &self.tasks else {
            return Err(Error::Cancelled("the evaluation pool is closed".to_string()));
        };

        let mut slots: Vec<Option<EvaluationRecord>> = vec![None; masks.len()];
        let mut failure: Option<Error> = None;
        let sent = AtomicUsize::new(0);
        let producer_done = AtomicBool::new(false);
        let cancelled = &self.cancelled;
        let answers = &self.answers;

        // the producer runs beside the gather so that a full queue never blocks it
        std::thread::scope(|s| {
            s.spawn(|| {
                for (sequence, mask) in masks.iter().enumerate() {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    if tasks.send(Package { batch, sequence, mask: mask.clone() }).is_err() {
                        break;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
                producer_done.store(true, Ordering::SeqCst);
            });

            let mut received = 0;
            while received < masks.len() {
                if failure.is_some() && producer_done.load(Ordering::SeqCst) && received >= sent.load(Ordering::SeqCst) {
                    break;
                }
                let answer = match answers.recv_timeout(GATHER_POLL) {
                    Ok(answer) => answer,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        cancelled.store(true, Ordering::SeqCst);
                        failure.get_or_insert(Error::Cancelled("all workers stopped".to_string()));
                        break;
                    }
                };
                if answer.batch != batch {
                    continue;
                }
                received += 1;
                match answer.record {
                    Ok(record) => slots[answer.sequence] = Some(record),
                    Err(e) if failure.is_none() => {
                        error!("Evaluation of package {} failed: {}", answer.sequence, e);
                        cancelled.store(true, Ordering::SeqCst);
                        failure = Some(e);
                    }
                    Err(_) => {}
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        slots.into_iter()
            .enumerate()
            .map(|(n, r)| r.ok_or_else(|| Error::Cancelled(format!("package {} was never answered", n))))
            .collect()
    }
}

fn worker_loop(evaluator: &Evaluator, tasks: Receiver<Package>, answers: Sender<Answer>, cancelled: Arc<AtomicBool>) {
    for package in tasks.iter() {
        let record = if cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled("pool shutting down".to_string()))
        } else {
            catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&package.mask)))
                .unwrap_or_else(|_| Err(Error::Cancelled(format!("worker panicked on {:?}", package.mask))))
        };
        if answers.send(Answer { batch: package.batch, sequence: package.sequence, record }).is_err() {
            return;
        }
    }
}

impl Drop for EvaluationPool {
    fn drop(&mut self) {
        // closing the queue ends every worker loop
        self.tasks.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("An evaluation worker panicked during shutdown");
            }
        }
    }
}
