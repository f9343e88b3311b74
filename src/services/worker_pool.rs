use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::models::AbortResult;

const ABORT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub size: usize,
    /// Tasks holding one of the `size` permits.
    pub active: usize,
    /// Threads still running a task whose caller already gave up on it.
    pub detached: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub aborts: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    /// Blocking threads currently executing a task body.
    threads: AtomicUsize,
    detached: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    aborts: AtomicU64,
}

/// Registration of one (job, chunk) task, owned by the submitting future.
/// Dropping it frees the chunk key and, once started, the active count.
struct Slot {
    key: (u64, usize),
    in_flight: Arc<Mutex<HashSet<(u64, usize)>>>,
    counters: Arc<Counters>,
    started: bool,
}

impl Slot {
    fn start(&mut self) {
        self.started = true;
        self.counters.active.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
        if self.started {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

const RUNNING: u8 = 0;
const ABANDONED: u8 = 1;
const FINISHED: u8 = 2;

/// Lives on the blocking thread for as long as the task body runs.
struct ThreadGuard {
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
}

impl ThreadGuard {
    fn new(counters: Arc<Counters>) -> Self {
        counters.threads.fetch_add(1, Ordering::SeqCst);
        Self { state: Arc::new(AtomicU8::new(RUNNING)), counters }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if self.state.swap(FINISHED, Ordering::SeqCst) == ABANDONED {
            self.counters.detached.fetch_sub(1, Ordering::SeqCst);
        }
        self.counters.threads.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a still-running task as detached from its caller.
fn abandon(state: &AtomicU8, counters: &Counters) {
    if state
        .compare_exchange(RUNNING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        counters.detached.fetch_add(1, Ordering::SeqCst);
    }
}

/// Bounded pool for CPU-bound analysis work. Tasks run on blocking threads,
/// at most `size` at a time, each raced against its own timeout and the
/// pool-wide abort token. Tasks receive a token they should poll so a
/// timeout or abort can stop them early. A task that ignores it gives its
/// permit back when its caller gives up and keeps running detached.
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    root: Mutex<CancellationToken>,
    in_flight: Arc<Mutex<HashSet<(u64, usize)>>>,
    counters: Arc<Counters>,
    next_job: AtomicU64,
    timeout: Duration,
    grace: Duration,
}

impl WorkerPool {
    pub fn new(size: usize, timeout_ms: u64, grace_ms: u64) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            root: Mutex::new(CancellationToken::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            counters: Arc::new(Counters::default()),
            next_job: AtomicU64::new(0),
            timeout: Duration::from_millis(timeout_ms),
            grace: Duration::from_millis(grace_ms),
        }
    }

    /// Allocates an id that scopes chunk indices for one analysis.
    pub fn next_job(&self) -> u64 {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Token that fires on the next `abort`.
    pub fn cancellation(&self) -> CancellationToken {
        self.root.lock().child_token()
    }

    pub async fn submit<T, F>(&self, job: u64, chunk: usize, task: F) -> Result<T, EngineError>
    where
        F: FnOnce(CancellationToken) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_within(job, chunk, self.timeout, task).await
    }

    /// Like `submit` with a per-call timeout instead of the pool default.
    pub async fn submit_within<T, F>(
        &self,
        job: u64,
        chunk: usize,
        timeout: Duration,
        task: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(CancellationToken) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let key = (job, chunk);
        if !self.in_flight.lock().insert(key) {
            return Err(EngineError::WorkerCrash {
                chunk,
                reason: "a task for this chunk is already running".to_string(),
            });
        }
        let mut slot = Slot {
            key,
            in_flight: self.in_flight.clone(),
            counters: self.counters.clone(),
            started: false,
        };

        let token = self.cancellation();
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|e| EngineError::WorkerCrash { chunk, reason: e.to_string() })?,
            _ = token.cancelled() => return Err(EngineError::Aborted),
        };
        if token.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        slot.start();
        let guard = ThreadGuard::new(self.counters.clone());
        let state = guard.state.clone();
        let task_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            task(task_token)
        });

        // `permit` and `slot` stay with this future so giving up frees them
        let outcome = tokio::select! {
            joined = tokio::time::timeout(timeout, handle) => joined,
            _ = token.cancelled() => {
                abandon(&state, &self.counters);
                tracing::debug!("Chunk {} of job {} cancelled by abort", chunk, job);
                return Err(EngineError::Aborted);
            }
        };
        drop(permit);

        match outcome {
            Ok(Ok(Ok(value))) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Ok(Err(join_err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Worker for chunk {} crashed: {}", chunk, join_err);
                Err(EngineError::WorkerCrash { chunk, reason: join_err.to_string() })
            }
            Err(_) => {
                // stop only this task; the thread finishes on its own
                token.cancel();
                abandon(&state, &self.counters);
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!("Worker for chunk {} timed out after {}ms", chunk, timeout_ms);
                Err(EngineError::WorkerTimeout { chunk, timeout_ms })
            }
        }
    }

    /// Signals every running task, waits up to the grace period for them to
    /// stop, and reports the rest as forcibly detached. The pool stays usable
    /// afterwards.
    pub async fn abort(&self) -> AbortResult {
        let previous = std::mem::replace(&mut *self.root.lock(), CancellationToken::new());
        let running = self.counters.threads.load(Ordering::SeqCst);
        previous.cancel();
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Abort requested with {} active workers", running);

        let deadline = Instant::now() + self.grace;
        while self.counters.threads.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(ABORT_POLL).await;
        }
        let forced = self.counters.threads.load(Ordering::SeqCst).min(running);
        if forced > 0 {
            tracing::warn!("{} workers did not stop within {:?} and were detached", forced, self.grace);
        }

        AbortResult {
            success: true,
            aborted: true,
            message: format!(
                "Aborted {} active workers ({} stopped, {} detached)",
                running,
                running - forced,
                forced
            ),
            terminated: running - forced,
            forced,
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size,
            active: self.counters.active.load(Ordering::SeqCst),
            detached: self.counters.detached.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use tokio_test::assert_ok;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2, 5_000, 1_000);
        let job = pool.next_job();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|chunk| {
            let (current, peak) = (current.clone(), peak.clone());
            pool.submit(job, chunk, move |_| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(chunk)
            })
        });
        for result in join_all(tasks).await {
            assert_ok!(result);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.status().completed, 6);
    }

    #[tokio::test]
    async fn timeout_fails_only_that_task() {
        let pool = WorkerPool::new(2, 50, 1_000);
        let job = pool.next_job();
        let (slow, fast) = tokio::join!(
            pool.submit(job, 0, |token| {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }),
            pool.submit(job, 1, |_| Ok(())),
        );
        assert!(matches!(slow, Err(EngineError::WorkerTimeout { chunk: 0, timeout_ms: 50 })));
        assert_ok!(fast);
        let status = pool.status();
        assert_eq!(status.timed_out, 1);
        assert_eq!(status.completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_task_frees_its_permit() {
        let pool = WorkerPool::new(1, 50, 1_000);
        let stuck = pool.submit(0, 0, |_| {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        });
        assert!(matches!(stuck.await, Err(EngineError::WorkerTimeout { chunk: 0, .. })));
        assert_eq!(pool.status().active, 0);
        assert_eq!(pool.status().detached, 1);

        let started = Instant::now();
        assert_eq!(assert_ok!(pool.submit(0, 1, |_| Ok(9)).await), 9);
        assert!(started.elapsed() < Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(pool.status().detached, 0);
    }

    #[tokio::test]
    async fn panics_become_worker_crashes() {
        let pool = WorkerPool::new(1, 1_000, 1_000);
        let result: Result<(), _> = pool.submit(0, 3, |_| panic!("bad chunk")).await;
        assert!(matches!(result, Err(EngineError::WorkerCrash { chunk: 3, .. })));
        assert_eq!(pool.status().failed, 1);
    }

    #[tokio::test]
    async fn one_task_per_chunk() {
        let pool = WorkerPool::new(2, 1_000, 1_000);
        let (first, second) = tokio::join!(
            pool.submit(7, 0, |_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(1)
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.submit(7, 0, |_| Ok(2)).await
            }
        );
        assert_eq!(assert_ok!(first), 1);
        assert!(matches!(second, Err(EngineError::WorkerCrash { chunk: 0, .. })));
    }

    #[tokio::test]
    async fn abort_stops_cooperative_workers() {
        let pool = WorkerPool::new(2, 10_000, 2_000);
        let (result, abort) = tokio::join!(
            pool.submit(1, 0, |token| {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pool.abort().await
            }
        );
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert!(abort.success && abort.aborted);
        assert_eq!((abort.terminated, abort.forced), (1, 0));
        assert_eq!(pool.status().active, 0);

        // still usable after an abort
        assert_eq!(pool.submit(2, 0, |_| Ok(5)).await.unwrap(), 5);
    }
}
