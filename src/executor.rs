//! Thread-pool offload for `run_in_executor`, `getaddrinfo`, and
//! `getnameinfo` (§4.2, §10).
//!
//! Ground truth: the `catnip` sibling example reaches for
//! `crossbeam_channel::unbounded` for its own cross-thread plumbing
//! (`tests/tcp.rs`, `tests/udp.rs`); SPEC_FULL.md's ambient-stack section
//! calls for the same crate here. The teacher itself never needed a thread
//! pool (it is purely single-threaded I/O), so there is no teacher file to
//! generalize — this is new code built on the crate the pack already
//! standardized on for thread hand-off.

use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A small fixed-size thread pool. One is created as the loop's default
/// executor; callers may also build their own and pass it explicitly to
/// `run_in_executor`.
pub struct Executor {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Spawns `size` worker threads (minimum 1) pulling from a shared
    /// unbounded job queue.
    pub fn new(size: usize) -> Arc<Executor> {
        let size = size.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("loomio-exec-{idx}"))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn executor thread"),
            );
        }
        Arc::new(Executor { tx, workers })
    }

    /// The process-wide default: four workers.
    pub fn default_sized() -> Arc<Executor> {
        Executor::new(4)
    }

    /// Submits `job` to the pool. Never blocks the calling (loop) thread.
    pub fn submit(&self, job: Job) {
        if self.tx.send(job).is_err() {
            error!("executor queue closed; dropping submitted job");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Dropping `tx` closes the channel so each worker's `recv()` returns
        // `Err` and exits; threads are not joined here since an executor
        // dropped from inside one of its own jobs must not deadlock.
        self.workers.clear();
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
            error!("executor job panicked: {}", describe_panic(&payload));
        }
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
