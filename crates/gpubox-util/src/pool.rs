//! A pool of OS threads for blocking work.
//!
//! Every worker is on exactly one of the idle and busy lists whenever the pool lock is free. Workers are spawned
//! when no idle worker is available and only terminate while the pool drains.

use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;
use thiserror::Error;

type Work = Box<dyn FnOnce() + Send + 'static>;
type WorkerId = usize;

/// What `run` does when the pool is at its thread limit and no worker is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Saturation {
    /// Block until a worker becomes idle.
    #[default]
    Wait,
    /// Fail with [`PoolError::Saturated`].
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Prefix for worker thread names.
    pub name: String,
    /// Upper bound on spawned workers. Unbounded when absent.
    pub max_threads: Option<usize>,
    pub saturation: Saturation,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".into(),
            max_threads: None,
            saturation: Saturation::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("every worker is busy")]
    Saturated,
    #[error("the pool is draining")]
    Draining,
    #[error("failed to spawn a worker thread")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
}

enum Assignment {
    Run(Work),
    Exit,
}

struct WorkerSlot {
    wake: Arc<Condvar>,
    assignment: Option<Assignment>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<WorkerId>,
    busy: VecDeque<WorkerId>,
    workers: HashMap<WorkerId, WorkerSlot>,
    next_id: WorkerId,
    draining: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled whenever a worker becomes idle or exits.
    changed: Condvar,
    config: PoolConfig,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                changed: Condvar::new(),
                config,
            }),
        }
    }

    /// Hands `work` to a worker, returning once the worker has been assigned.
    pub fn run<F>(&self, work: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();

        let id = loop {
            if state.draining {
                return Err(PoolError::Draining);
            }

            if state.idle.is_empty() {
                if config.max_threads.map_or(true, |max| state.workers.len() < max) {
                    self.spawn(&mut state)?;
                } else {
                    match config.saturation {
                        Saturation::Reject => return Err(PoolError::Saturated),
                        Saturation::Wait => {
                            self.shared.changed.wait(&mut state);
                            continue;
                        }
                    }
                }
            }

            if let Some(id) = state.idle.pop_front() {
                break id;
            }
        };

        let Some(slot) = state.workers.get_mut(&id) else {
            unreachable!("idle worker {id} has no slot");
        };
        slot.assignment = Some(Assignment::Run(Box::new(work)));
        slot.wake.notify_one();
        state.busy.push_back(id);

        Ok(())
    }

    /// Terminates every worker, waiting for current work to finish first.
    ///
    /// `run` fails while a drain is in progress. The pool may be used again afterwards.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        state.draining = true;

        while !(state.idle.is_empty() && state.busy.is_empty()) {
            let Some(id) = state.idle.pop_front() else {
                self.shared.changed.wait(&mut state);
                continue;
            };

            let thread = state.workers.get_mut(&id).and_then(|slot| {
                slot.assignment = Some(Assignment::Exit);
                slot.wake.notify_one();
                slot.thread.take()
            });

            MutexGuard::unlocked(&mut state, || {
                if let Some(thread) = thread {
                    if thread.join().is_err() {
                        tracing::error!(worker = id, "worker thread panicked");
                    }
                }
            });

            state.workers.remove(&id);
            tracing::trace!(pool = %self.shared.config.name, worker = id, "worker joined");
        }

        state.draining = false;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.workers.len(),
            idle: state.idle.len(),
            busy: state.busy.len(),
        }
    }

    fn spawn(&self, state: &mut PoolState) -> Result<(), PoolError> {
        let id = state.next_id;
        let wake = Arc::new(Condvar::new());

        let thread = {
            let shared = self.shared.clone();
            let wake = wake.clone();
            std::thread::Builder::new()
                .name(format!("{}-{id}", self.shared.config.name))
                .spawn(move || worker(shared, id, wake))
                .map_err(PoolError::Spawn)?
        };

        state.next_id += 1;
        state.workers.insert(
            id,
            WorkerSlot {
                wake,
                assignment: None,
                thread: Some(thread),
            },
        );
        state.idle.push_back(id);

        tracing::debug!(pool = %self.shared.config.name, worker = id, "spawned worker");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker(shared: Arc<Shared>, id: WorkerId, wake: Arc<Condvar>) {
    let mut state = shared.state.lock();

    loop {
        let assignment = loop {
            match state
                .workers
                .get_mut(&id)
                .and_then(|slot| slot.assignment.take())
            {
                Some(assignment) => break assignment,
                None => wake.wait(&mut state),
            }
        };

        match assignment {
            Assignment::Exit => {
                state.idle.retain(|v| *v != id);
                state.busy.retain(|v| *v != id);
                shared.changed.notify_all();
                return;
            }
            Assignment::Run(work) => {
                MutexGuard::unlocked(&mut state, || {
                    if std::panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                        tracing::error!(worker = id, "work item panicked");
                    }
                });

                state.busy.retain(|v| *v != id);
                state.idle.push_back(id);
                shared.changed.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{PoolConfig, PoolError, PoolStats, Saturation, WorkerPool};

    fn bounded(max_threads: usize, saturation: Saturation) -> WorkerPool {
        WorkerPool::new(PoolConfig {
            name: "test".into(),
            max_threads: Some(max_threads),
            saturation,
        })
    }

    fn wait_until_idle(pool: &WorkerPool, idle: usize) {
        while pool.stats().idle != idle {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn grows_on_demand_and_drains() {
        let pool = WorkerPool::new(PoolConfig::default());
        let barrier = Arc::new(Barrier::new(6));
        let finished = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..5 {
                let barrier = barrier.clone();
                let finished = finished.clone();
                let pool = &pool;
                scope.spawn(move || {
                    pool.run(move || {
                        barrier.wait();
                        finished.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                });
            }
        });

        assert_eq!(
            pool.stats(),
            PoolStats {
                workers: 5,
                idle: 0,
                busy: 5
            }
        );

        barrier.wait();
        pool.drain();

        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn idle_workers_are_reused() {
        let pool = WorkerPool::new(PoolConfig::default());
        let (tx, rx) = flume::unbounded();

        for i in 0..3 {
            let tx = tx.clone();
            pool.run(move || tx.send(i).unwrap()).unwrap();
            assert_eq!(rx.recv().unwrap(), i);
            wait_until_idle(&pool, 1);
        }

        assert_eq!(pool.stats().workers, 1);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn reject_when_saturated() {
        let pool = bounded(1, Saturation::Reject);
        let barrier = Arc::new(Barrier::new(2));

        let release = barrier.clone();
        pool.run(move || {
            release.wait();
        })
        .unwrap();

        assert!(matches!(pool.run(|| ()), Err(PoolError::Saturated)));

        barrier.wait();
        wait_until_idle(&pool, 1);
        pool.run(|| ()).unwrap();
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn wait_when_saturated() {
        let pool = bounded(1, Saturation::Wait);
        let barrier = Arc::new(Barrier::new(2));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        {
            let barrier = barrier.clone();
            let order = order.clone();
            pool.run(move || {
                barrier.wait();
                order.lock().push("first");
            })
            .unwrap();
        }

        std::thread::scope(|scope| {
            let order = order.clone();
            let pool = &pool;
            let second = scope.spawn(move || pool.run(move || order.lock().push("second")));

            std::thread::sleep(Duration::from_millis(20));
            assert!(!second.is_finished());

            barrier.wait();
            second.join().unwrap().unwrap();
        });

        pool.drain();
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn panicking_work_keeps_worker() {
        let pool = WorkerPool::new(PoolConfig::default());
        pool.run(|| panic!("boom")).unwrap();
        wait_until_idle(&pool, 1);

        let (tx, rx) = flume::unbounded();
        pool.run(move || tx.send(()).unwrap()).unwrap();
        rx.recv().unwrap();
        assert_eq!(pool.stats().workers, 1);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn drop_waits_for_work() {
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(PoolConfig::default());

        for _ in 0..3 {
            let finished = finished.clone();
            pool.run(move || {
                std::thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        drop(pool);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
