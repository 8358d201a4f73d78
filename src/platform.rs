//! Host/OS glue the core consumes but does not implement: thread spawning,
//! CPU affinity, and blocking/notification primitives.
//!
//! Framework/driver-model glue is out of scope for this crate; `Platform`
//! is the seam a kernel driver or a user-space poll-mode driver plugs
//! into. The core's own short critical sections still use `spin` directly
//! (the same way the rest of this stack leans on `spin` for in-process
//! locking); `Platform` only covers things that genuinely differ between
//! a kernel build and a user-space one.

use alloc::boxed::Box;

/// A single OS thread handle, joinable by dropping or awaiting exit.
pub trait JoinHandle: Send {
    /// Blocks the calling context until the spawned thread has exited.
    fn join(self: Box<Self>);
}

/// Host-provided thread spawning and CPU affinity.
pub trait Platform: Send + Sync {
    /// Lower bound, in microseconds, below which `WB_TIMEOUT_US` must not
    /// be configured: ~100 polls at the core's 2 microsecond writeback
    /// polling granularity.
    const WB_TIMEOUT_FLOOR_US: u32 = 200;

    /// How long the writeback monitor waits for an expected CIDX to
    /// appear before giving up with [`crate::error::QdmaError::Timeout`].
    ///
    /// Hosts may raise this above [`Self::WB_TIMEOUT_FLOOR_US`]; lowering
    /// it below the floor is a logic error and implementations should
    /// clamp rather than honor a smaller value.
    fn wb_timeout_us(&self) -> u32 {
        Self::WB_TIMEOUT_FLOOR_US
    }

    /// Number of worker threads the [`crate::thread::ThreadManager`]
    /// should spawn, one per active processor.
    fn active_processors(&self) -> usize;

    /// Spawns `f` as a new worker thread pinned to `cpu`, returning a
    /// handle the caller can join on shutdown.
    fn spawn_pinned(
        &self,
        cpu: usize,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> Box<dyn JoinHandle>;

    /// Busy-waits for approximately `micros` microseconds.
    ///
    /// Used by the bounded writeback poll loop and the ~2 ms stop quiesce
    /// wait; never sleeps the calling thread, since both callers are
    /// themselves running on a poll-engine worker.
    fn delay_us(&self, micros: u32);
}

/// A coalescing wake/park primitive for a single poll-engine worker.
///
/// Multiple wakeups that arrive before the worker parks again collapse
/// into a single pending signal rather than accumulating unboundedly,
/// matching the bounded semaphore (`sem_count <= 10`) the design notes
/// call out as needing replacement with an idempotent primitive.
pub trait Notify: Send + Sync {
    /// Records a pending wakeup. May be called from interrupt context.
    fn notify(&self);

    /// Blocks until a pending wakeup is recorded, then consumes it.
    fn wait(&self);
}
