//! Worker-thread pipeline stage with a bounded job queue (§5).
//!
//! Grounded in `PipelineNode`/`PipelineNode::Loop`: a dedicated OS thread
//! blocks on a condition variable, swaps in whatever jobs have queued up
//! since it last ran, and executes them in order. Unlike the original's
//! unbounded deque, each stage here is bounded (`§5`'s backpressure
//! requirement): once the queue is full the newest job is dropped rather
//! than applying backpressure to the producer, so a slow stage can't stall
//! the capture thread.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::utils::throttle::LogThrottler;

type Job = Box<dyn FnOnce() + Send + 'static>;

const REPORT_INTERVAL: Duration = Duration::from_secs(20);

struct Shared {
    name: String,
    queue: Mutex<Vec<Job>>,
    condvar: Condvar,
    terminated: AtomicBool,
    max_queue_len: usize,
    dropped: AtomicU64,
    processed: AtomicU64,
}

/// A named worker thread with a bounded FIFO job queue.
pub struct PipelineStage {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PipelineStage {
    /// Spawn a stage named `name`, accepting at most `max_queue_len` queued
    /// jobs before new submissions are dropped.
    pub fn spawn(name: impl Into<String>, max_queue_len: usize) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
            terminated: AtomicBool::new(false),
            max_queue_len: max_queue_len.max(1),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("pipeline-{name}"))
            .spawn(move || Self::run(name, worker_shared))
            .expect("failed to spawn pipeline stage thread");

        Self { shared, thread: Some(thread) }
    }

    /// Queue `job` for execution. Returns `false` (and drops `job`) if the
    /// stage's queue was already at capacity.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.max_queue_len {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            let error = PipelineError::BackpressureDrop { stage: self.shared.name.clone() };
            tracing::error!(error = %error, "dropping job");
            return false;
        }
        queue.push(Box::new(job));
        self.shared.condvar.notify_all();
        true
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    fn run(name: String, shared: Arc<Shared>) {
        let mut private_queue: Vec<Job> = Vec::new();
        let mut count = 0u64;
        let mut total = Duration::ZERO;
        let mut fastest = Duration::ZERO;
        let mut slowest = Duration::ZERO;
        let mut last_report = Instant::now();
        let stall_throttle = LogThrottler::new(Duration::from_secs(2));

        while !shared.terminated.load(Ordering::Acquire) {
            {
                let mut queue = shared.queue.lock();
                if queue.is_empty() && !shared.terminated.load(Ordering::Acquire) {
                    shared.condvar.wait(&mut queue);
                }
                std::mem::swap(&mut *queue, &mut private_queue);
            }

            for job in private_queue.drain(..) {
                if shared.terminated.load(Ordering::Acquire) {
                    break;
                }

                let t0 = Instant::now();
                job();
                let dt = t0.elapsed();

                if count == 0 {
                    fastest = dt;
                    slowest = dt;
                } else if dt < fastest {
                    fastest = dt;
                } else if dt > slowest {
                    slowest = dt;
                }
                count += 1;
                total += dt;
                shared.processed.fetch_add(1, Ordering::Relaxed);

                if last_report.elapsed() > REPORT_INTERVAL {
                    last_report = Instant::now();
                    let avg_ms = total.as_secs_f64() * 1000.0 / count as f64;
                    tracing::info!(
                        stage = %name,
                        frames = count,
                        avg_ms,
                        min_ms = fastest.as_secs_f64() * 1000.0,
                        max_ms = slowest.as_secs_f64() * 1000.0,
                        "stage stats"
                    );
                }

                if dt > Duration::from_millis(100) && stall_throttle.should_log("slow_job") {
                    tracing::warn!(stage = %name, stall_ms = dt.as_secs_f64() * 1000.0, "slow job");
                }
            }
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shared.terminated.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared.queue.lock().clear();
    }
}

impl Drop for PipelineStage {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_in_order() {
        let stage = PipelineStage::spawn("test", 8);
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            stage.queue(move || tx.send(i).unwrap());
        }
        for i in 0..5 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), i);
        }
        assert_eq!(stage.processed_count(), 5);
        stage.shutdown();
    }

    #[test]
    fn excess_jobs_are_dropped_not_blocked() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let stage = PipelineStage::spawn("backpressure", 2);

        // Occupy the worker so queued jobs pile up behind it, waiting for
        // confirmation the job actually started before queueing more.
        stage.queue(move || {
            started_tx.send(()).unwrap();
            let _ = gate_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(stage.queue(|| ()));
        assert!(stage.queue(|| ()));
        assert!(!stage.queue(|| ()));
        assert_eq!(stage.dropped_count(), 1);

        let _ = gate_tx.send(());
        stage.shutdown();
    }
}
