// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-thread task runner used as the launcher's primary thread.
// Posted tasks run in FIFO order; delayed tasks run at (or after) their
// deadline. Delayed tasks are a debounce primitive: the closure re-checks
// live state at fire time, it never trusts a captured snapshot.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Run(Task),
    RunAt(Instant, Task),
    Shutdown,
}

/// A delayed task waiting in the worker's heap, ordered soonest-first.
struct Pending {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Owns one worker thread consuming posted and delayed tasks.
///
/// Cloneable handle; the worker stops when the last handle is dropped.
#[derive(Clone)]
pub struct TaskRunner {
    tx: Sender<Job>,
    shared: Arc<RunnerShared>,
}

struct RunnerShared {
    tx: Sender<Job>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(rx))
            .expect("failed to spawn task runner thread");
        Self {
            tx: tx.clone(),
            shared: Arc::new(RunnerShared {
                tx,
                handle: parking_lot::Mutex::new(Some(handle)),
            }),
        }
    }

    /// Run `task` on the worker thread, after everything already queued.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::Run(Box::new(task)));
    }

    /// Run `task` on the worker thread no earlier than `delay` from now.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::RunAt(Instant::now() + delay, Box::new(task)));
    }

    /// Block until every task posted before this call (including due delayed
    /// tasks) has run. Test and shutdown aid.
    pub fn flush(&self) {
        let (done_tx, done_rx) = bounded::<()>(1);
        let _ = self.tx.send(Job::Run(Box::new(move || {
            let _ = done_tx.send(());
        })));
        let _ = done_rx.recv();
    }
}

impl Drop for RunnerShared {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    let mut delayed: BinaryHeap<Pending> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        // Run everything that has come due before taking new jobs.
        while delayed
            .peek()
            .is_some_and(|p| p.deadline <= Instant::now())
        {
            let p = delayed.pop().unwrap();
            (p.task)();
        }

        let job = match delayed.peek() {
            Some(p) => {
                let timeout = p.deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        match job {
            Job::Run(task) => task(),
            Job::RunAt(deadline, task) => {
                seq += 1;
                delayed.push(Pending {
                    deadline,
                    seq,
                    task,
                });
            }
            Job::Shutdown => break,
        }
    }
    debug!(dropped = delayed.len(), "task runner stopped");
}
