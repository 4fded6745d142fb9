use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

struct PoolState {
    queue: VecDeque<BoxFuture<'static, ()>>,
    active: usize,
    peak: usize,
}

/// Fixed-size pool: at most `limit` jobs run at once, the rest wait in FIFO
/// order. Completion order is whatever the jobs make it.
#[derive(Clone)]
pub struct WorkerPool {
    limit: usize,
    state: Arc<Mutex<PoolState>>,
}

/// Frees the worker slot even if the job panics.
struct SlotGuard(WorkerPool);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Arc::new(Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                peak: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.lock().active
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Highest number of jobs ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak
    }

    /// Queue a job; it starts as soon as a slot is free. Must be called
    /// from within a tokio runtime.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lock().queue.push_back(Box::pin(job));
        self.pump();
    }

    fn pump(&self) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.active >= self.limit {
                    return;
                }
                let Some(job) = state.queue.pop_front() else {
                    return;
                };
                state.active += 1;
                state.peak = state.peak.max(state.active);
                job
            };

            let guard = SlotGuard(self.clone());
            tokio::spawn(async move {
                let _guard = guard;
                job.await;
            });
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.pump();
    }
}
