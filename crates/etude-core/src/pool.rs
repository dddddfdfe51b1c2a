// src/pool.rs
use crate::error::{EtudeError, EtudeResult};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Fixed set of worker threads, each fed by its own bounded queue.
///
/// Submission never blocks: it round-robins across the queues, skips full
/// ones, and fails with [`EtudeError::QueueFull`] when every queue is full.
pub struct WorkerPool<T: Send + 'static> {
    queues: Vec<Sender<T>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    stop: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads named `{name}-{i}` running `job` on every task.
    pub fn new<F>(workers: usize, queue_depth: usize, name: &str, pin: bool, job: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 || queue_depth == 0 {
            return Err(EtudeError::Config(
                "worker pool needs at least one worker and a non-zero queue".to_string(),
            ));
        }

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let job = Arc::new(job);
        let stop = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            queues: Vec::with_capacity(workers),
            handles: Vec::with_capacity(workers),
            next: AtomicUsize::new(0),
            stop: stop.clone(),
        };

        for i in 0..workers {
            let (tx, rx) = bounded::<T>(queue_depth);
            let job = job.clone();
            let stop = stop.clone();
            // Pin to core or wrap around
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(rx, &stop, &*job);
                });

            match spawned {
                Ok(handle) => {
                    pool.queues.push(tx);
                    pool.handles.push(handle);
                }
                Err(e) => {
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!(workers, queue_depth, "worker pool started");
        Ok(pool)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Queue `task` on the next worker with room.
    pub fn submit(&self, task: T) -> EtudeResult<()> {
        let n = self.queues.len();
        if n == 0 || self.stop.load(Ordering::Acquire) {
            return Err(EtudeError::PoolClosed);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let mut task = task;
        for k in 0..n {
            match self.queues[(start + k) % n].try_send(task) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(t)) => task = t,
                Err(TrySendError::Disconnected(_)) => return Err(EtudeError::PoolClosed),
            }
        }
        Err(EtudeError::QueueFull)
    }

    /// Stop accepting work, wake every worker and join them.
    ///
    /// Tasks still queued are dropped unprocessed.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Dropping the senders wakes workers blocked in recv.
        self.queues.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T>(rx: Receiver<T>, stop: &AtomicBool, job: &dyn Fn(T)) {
    while let Ok(task) = rx.recv() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        job(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[test]
    fn every_task_runs_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut pool = WorkerPool::new(3, 64, "test-worker", false, move |n: usize| {
            sink.lock().unwrap().push(n);
        })
        .unwrap();

        for n in 0..50 {
            pool.submit(n).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        pool.shutdown();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn full_queues_fail_fast() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let mut pool = WorkerPool::new(2, 1, "test-worker", false, move |_: u32| {
            let _ = gate_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Two tasks in flight plus one queued per worker at most.
        let mut accepted = 0;
        let mut rejected = false;
        for i in 0..10 {
            match pool.submit(i) {
                Ok(()) => accepted += 1,
                Err(EtudeError::QueueFull) => {
                    rejected = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected);
        assert!(accepted <= 4);

        for _ in 0..accepted {
            gate_tx.send(()).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < accepted && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(ran.load(Ordering::SeqCst), accepted);
        pool.shutdown();
        assert!(matches!(pool.submit(0), Err(EtudeError::PoolClosed)));
    }
}
