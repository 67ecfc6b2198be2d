use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel as channel;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size background worker pool used for shuffle fetches.
///
/// Submission never blocks: jobs queue when all workers are busy. Workers are
/// detached and never prevent process exit; dropping the pool closes the
/// queue, letting workers drain outstanding jobs and stop.
pub struct FetchPool {
    sender: channel::Sender<Job>,
    active: Arc<AtomicUsize>,
}

impl FetchPool {
    pub fn new(max_workers: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<Job>();
        let active = Arc::new(AtomicUsize::new(0));
        for worker in 0..max_workers.max(1) {
            let receiver = receiver.clone();
            let active = Arc::clone(&active);
            thread::spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let _running = RunningGuard::enter(&active);
                    job();
                }
                debug!(worker, "fetch worker stopping");
            });
        }
        Self { sender, active }
    }

    /// Number of jobs currently executing. Queued jobs are not counted.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Enqueues a job without blocking.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            debug!("fetch pool queue closed; job dropped");
        }
    }
}

struct RunningGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> RunningGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::FetchPool;

    #[test]
    fn concurrency_never_exceeds_worker_count() {
        let pool = FetchPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel::<()>();

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            pool.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                done_tx.send(()).expect("report completion");
            });
        }
        for _ in 0..8 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("job completion");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn active_count_returns_to_zero() {
        let pool = FetchPool::new(3);
        let (done_tx, done_rx) = mpsc::channel::<()>();
        for _ in 0..3 {
            let done_tx = done_tx.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(10));
                done_tx.send(()).expect("report completion");
            });
        }
        for _ in 0..3 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("job completion");
        }
        // workers decrement after the job body runs; give them a beat
        for _ in 0..100 {
            if pool.active() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.active(), 0);
    }
}
