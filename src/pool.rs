//! # Worker pool
//!
//! The pool is an explicit capability of a run: either [`WorkerPool::Inline`], where chunks
//! run one after the other on the caller's thread, or [`WorkerPool::Threads`], a fixed-size
//! [`rayon::ThreadPool`].
//!
//! [`WorkerPool::fan_out`] submits every task before waiting, then blocks once on the scope
//! barrier. Results travel back over a [`crossbeam_channel`] and are keyed by task index in
//! a [`BTreeMap`], so the order in which tasks complete never leaks into the output. A
//! failed task does not stop the others: every outcome is collected, and
//! [`first_failure`] picks the error of the lowest failing index after the barrier. A
//! panicking task is re-raised on the caller's thread once the scope ends.
use std::collections::BTreeMap;

use tracing::debug;

use crate::photonpipe_errors::{PipelineError, Result};

#[derive(Debug)]
pub enum WorkerPool {
    Inline,
    Threads(rayon::ThreadPool),
}

impl WorkerPool {
    /// Build a pool of `threads` workers, or an inline pool for `None`.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        match threads {
            None => Ok(WorkerPool::Inline),
            Some(0) => Err(PipelineError::InvalidConfig(
                "a worker pool needs at least one thread".into(),
            )),
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("photonpipe-worker-{i}"))
                    .build()?;
                debug!("Started a pool of {n} workers");
                Ok(WorkerPool::Threads(pool))
            }
        }
    }

    /// Number of worker threads; `None` for the inline pool.
    pub fn threads(&self) -> Option<usize> {
        match self {
            WorkerPool::Inline => None,
            WorkerPool::Threads(pool) => Some(pool.current_num_threads()),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, WorkerPool::Inline)
    }

    /// Run `f` on every `(index, task)` and collect the outcomes by index.
    ///
    /// Arguments
    /// -----------------
    /// * `tasks`: work items keyed by their index.
    /// * `f`: the work, called once per task, possibly concurrently.
    ///
    /// Return
    /// ----------
    /// * One outcome per task, keyed by task index.
    pub fn fan_out<T, R, F>(&self, tasks: Vec<(usize, T)>, f: F) -> BTreeMap<usize, Result<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> Result<R> + Sync,
    {
        match self {
            WorkerPool::Inline => tasks
                .into_iter()
                .map(|(index, task)| (index, f(index, task)))
                .collect(),
            WorkerPool::Threads(pool) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let f = &f;
                pool.scope(|scope| {
                    for (index, task) in tasks {
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            // The receiver outlives the scope, so sending cannot fail.
                            let _ = tx.send((index, f(index, task)));
                        });
                    }
                });
                drop(tx);
                rx.into_iter().collect()
            }
        }
    }
}

/// Split outcomes into successes, or return the error of the lowest failing index.
///
/// Successful results of the other tasks are dropped on failure.
pub fn first_failure<R>(outcomes: BTreeMap<usize, Result<R>>) -> Result<BTreeMap<usize, R>> {
    let mut ok = BTreeMap::new();
    for (index, outcome) in outcomes {
        ok.insert(index, outcome?);
    }
    Ok(ok)
}
