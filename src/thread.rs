// SPDX-License-Identifier: MPL-2.0

//! `ThreadManager`/`PollEngine` (C9): a fixed pool of per-CPU worker
//! threads, each single-threaded over its own list of registered poll
//! operations, serviced in a round (§4.9).
//!
//! Workers park on a [`Notify`] rather than the source's bounded
//! semaphore (`sem_count <= 10`): [`WorkerNotify`] collapses any number
//! of wakeups arriving before the worker parks again into one pending
//! signal, the idempotent "work pending flag + park/unpark" primitive
//! §9's design notes ask for in place of that semaphore.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::platform::{JoinHandle, Notify, Platform};

/// A single registered poll operation. Returns `true` if it has more
/// work pending and should be re-run before the worker parks again
/// (the `SERVICE_CONTINUE` re-arm), `false` once it has drained.
pub type PollOp = Box<dyn FnMut() -> bool + Send>;

/// Identifies a previously registered poll op for [`ThreadManager::unregister`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollOpId {
    worker: usize,
    op: u64,
}

/// Wraps a host-provided [`Notify`] so concurrent wakeups collapse into
/// a single pending signal instead of accumulating.
struct WorkerNotify {
    pending: AtomicBool,
    inner: Arc<dyn Notify>,
}

impl Notify for WorkerNotify {
    fn notify(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.inner.notify();
        }
    }

    fn wait(&self) {
        self.inner.wait();
        self.pending.store(false, Ordering::Release);
    }
}

struct Worker {
    ops: Mutex<VecDeque<(u64, PollOp)>>,
    weight: AtomicU32,
    notify: Arc<WorkerNotify>,
}

fn worker_run(worker: Arc<Worker>, stopping: Arc<AtomicBool>) {
    loop {
        worker.notify.wait();
        if stopping.load(Ordering::Acquire) {
            return;
        }
        loop {
            let mut more = false;
            let mut ops = worker.ops.lock();
            for (_, op) in ops.iter_mut() {
                if op() {
                    more = true;
                }
            }
            drop(ops);
            if !more {
                break;
            }
        }
    }
}

/// A fixed pool of per-CPU worker threads servicing registered poll ops.
pub struct ThreadManager {
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<Box<dyn JoinHandle>>>,
    stopping: Arc<AtomicBool>,
    next_op_id: AtomicU64,
}

impl ThreadManager {
    /// Spawns one pinned worker per `platform.active_processors()`.
    /// `make_notify` is called once per worker to obtain the host
    /// park/unpark primitive backing that worker's semaphore.
    pub fn new(platform: &dyn Platform, make_notify: impl Fn() -> Arc<dyn Notify>) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(platform.active_processors());
        let mut handles = Vec::with_capacity(platform.active_processors());

        for cpu in 0..platform.active_processors() {
            let worker = Arc::new(Worker {
                ops: Mutex::new(VecDeque::new()),
                weight: AtomicU32::new(0),
                notify: Arc::new(WorkerNotify {
                    pending: AtomicBool::new(false),
                    inner: make_notify(),
                }),
            });
            let run_worker = worker.clone();
            let run_stopping = stopping.clone();
            let handle = platform.spawn_pinned(cpu, Box::new(move || worker_run(run_worker, run_stopping)));
            workers.push(worker);
            handles.push(handle);
        }

        Self {
            workers,
            handles: Mutex::new(handles),
            stopping,
            next_op_id: AtomicU64::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Places `op` on the least-loaded worker and increments its
    /// weight. Returns the id to later `unregister` it, and the
    /// worker's [`Notify`] handle for callers (queue enqueue paths) to
    /// wake it with.
    pub fn register(&self, op: PollOp) -> (PollOpId, Arc<dyn Notify>) {
        let (idx, worker) = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.weight.load(Ordering::Relaxed))
            .expect("ThreadManager must have at least one worker");
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        worker.ops.lock().push_back((op_id, op));
        worker.weight.fetch_add(1, Ordering::Relaxed);
        (PollOpId { worker: idx, op: op_id }, worker.notify.clone() as Arc<dyn Notify>)
    }

    /// Places both of a queue's direction poll ops on the same
    /// least-loaded worker, so the single [`Notify`] handle `QueuePair`
    /// holds wakes whichever direction's worker needs to run (§4.6:
    /// "register H2C and C2H request-processor and completion poll ops").
    pub fn register_paired(&self, h2c_op: PollOp, c2h_op: PollOp) -> (PollOpId, PollOpId, Arc<dyn Notify>) {
        let (idx, worker) = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.weight.load(Ordering::Relaxed))
            .expect("ThreadManager must have at least one worker");
        let h2c_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let c2h_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut ops = worker.ops.lock();
            ops.push_back((h2c_id, h2c_op));
            ops.push_back((c2h_id, c2h_op));
        }
        worker.weight.fetch_add(2, Ordering::Relaxed);
        (
            PollOpId { worker: idx, op: h2c_id },
            PollOpId { worker: idx, op: c2h_id },
            worker.notify.clone() as Arc<dyn Notify>,
        )
    }

    /// Removes a previously registered op and decrements its worker's
    /// weight. A no-op if the id is unknown (already unregistered).
    pub fn unregister(&self, id: PollOpId) {
        let Some(worker) = self.workers.get(id.worker) else {
            return;
        };
        let mut ops = worker.ops.lock();
        let before = ops.len();
        ops.retain(|(op_id, _)| *op_id != id.op);
        if ops.len() != before {
            worker.weight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Signals every worker to exit its poll loop and joins all of them.
    /// Queue lifecycles should `unregister` their ops before this runs;
    /// this only tears down the thread pool itself (driver `close()`).
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.notify.inner.notify();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Condvar, Mutex as StdMutex};
    use std::time::Duration;

    struct StdNotify {
        state: StdMutex<bool>,
        cv: Condvar,
    }
    impl StdNotify {
        fn new() -> Self {
            Self { state: StdMutex::new(false), cv: Condvar::new() }
        }
    }
    impl Notify for StdNotify {
        fn notify(&self) {
            let mut pending = self.state.lock().unwrap();
            *pending = true;
            self.cv.notify_one();
        }
        fn wait(&self) {
            let mut pending = self.state.lock().unwrap();
            while !*pending {
                pending = self.cv.wait(pending).unwrap();
            }
            *pending = false;
        }
    }

    struct StdJoinHandle(Option<std::thread::JoinHandle<()>>);
    impl JoinHandle for StdJoinHandle {
        fn join(mut self: Box<Self>) {
            if let Some(h) = self.0.take() {
                let _ = h.join();
            }
        }
    }

    struct StdPlatform {
        cpus: usize,
    }
    impl Platform for StdPlatform {
        fn active_processors(&self) -> usize {
            self.cpus
        }
        fn spawn_pinned(&self, _cpu: usize, f: Box<dyn FnOnce() + Send + 'static>) -> Box<dyn JoinHandle> {
            Box::new(StdJoinHandle(Some(std::thread::spawn(f))))
        }
        fn delay_us(&self, micros: u32) {
            std::thread::sleep(Duration::from_micros(micros as u64));
        }
    }

    #[test]
    fn registered_op_runs_after_notify_and_reruns_while_continuing() {
        let platform = StdPlatform { cpus: 1 };
        let mgr = ThreadManager::new(&platform, || Arc::new(StdNotify::new()));

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let (_id, notify) = mgr.register(Box::new(move || {
            let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            n < 2 // claims more work pending for the first two calls
        }));

        notify.notify();

        // Give the worker thread a bounded window to drain.
        let mut waited = 0;
        while calls.load(std::sync::atomic::Ordering::SeqCst) < 3 && waited < 2000 {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);

        mgr.shutdown();
    }

    #[test]
    fn unregister_stops_further_invocations() {
        let platform = StdPlatform { cpus: 1 };
        let mgr = ThreadManager::new(&platform, || Arc::new(StdNotify::new()));

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let (id, notify) = mgr.register(Box::new(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            false
        }));

        notify.notify();
        let mut waited = 0;
        while calls.load(std::sync::atomic::Ordering::SeqCst) < 1 && waited < 2000 {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        mgr.unregister(id);
        let seen_before = calls.load(std::sync::atomic::Ordering::SeqCst);
        notify.notify();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), seen_before);

        mgr.shutdown();
    }

    #[test]
    fn register_balances_across_workers() {
        let platform = StdPlatform { cpus: 2 };
        let mgr = ThreadManager::new(&platform, || Arc::new(StdNotify::new()));
        let (id_a, _) = mgr.register(Box::new(|| false));
        let (id_b, _) = mgr.register(Box::new(|| false));
        assert_ne!(id_a.worker, id_b.worker);
        mgr.shutdown();
    }
}
