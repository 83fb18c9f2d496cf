//! Parallel executor: a fixed worker pool and one dispatch primitive,
//! `parallel_for`.
//!
//! Workers are long-lived — spawned once via `CoreRuntime` and parked in a
//! spin loop waiting for a job — rather than spawned per call, since on
//! bare metal there is no OS scheduler to hand threads back to between
//! calls. Job handoff and the join barrier are plain atomics: no condvars,
//! no OS wait primitives, because none exist below the `CoreRuntime`
//! boundary. The calling thread blocks (spins) until every worker has
//! joined; it does not itself run any work items.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::timer::TickSource;

pub const MAX_WORKERS: usize = 8;

/// Work function signature: `(context, item_index)`. `context` is an
/// opaque pointer the caller controls the lifetime of — it must outlive
/// the `parallel_for` call, which blocks until every worker has joined.
pub type WorkFn = fn(*mut (), usize);

/// Dispatch mode: racing cursor vs. fixed per-worker assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    WorkStealing,
    Deterministic,
}

#[derive(Debug, Default)]
pub struct PerCoreStats {
    pub ticks_total: AtomicU64,
    pub items_processed: AtomicU64,
    pub ticks_idle: AtomicU64,
    pub invocations: AtomicU64,
}

impl PerCoreStats {
    pub fn reset(&self) {
        self.ticks_total.store(0, Ordering::Relaxed);
        self.items_processed.store(0, Ordering::Relaxed);
        self.ticks_idle.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.ticks_total.load(Ordering::Relaxed),
            self.items_processed.load(Ordering::Relaxed),
            self.ticks_idle.load(Ordering::Relaxed),
            self.invocations.load(Ordering::Relaxed),
        )
    }
}

struct JobDesc {
    func: WorkFn,
    arg: usize,
    total_items: usize,
    chunk_size: usize,
    mode: DispatchMode,
}

/// Owns the worker pool's shared state. `parallel_for` is the only public
/// entry point for dispatching work; `worker_loop` is what every spawned
/// worker thread/core runs.
pub struct Dispatcher {
    n_workers: usize,
    stats: Vec<PerCoreStats>,
    job: Mutex<Option<JobDesc>>,
    generation: AtomicU32,
    cursor: AtomicUsize,
    done_count: AtomicUsize,
    busy: AtomicBool,
    shutdown: AtomicBool,
    tick: &'static dyn TickSource,
}

// `arg`'s raw pointer is the only non-`Sync` field, and it is only ever
// dereferenced inside the window `parallel_for` is blocked on (the caller
// guarantees it stays valid that long).
unsafe impl Sync for Dispatcher {}

impl Dispatcher {
    /// Builds a dispatcher for exactly `n_workers` workers (clamped to
    /// `[1, MAX_WORKERS]`). The caller must arrange for all `n_workers` of
    /// them to be running `worker_loop` (via `CoreRuntime::spawn_worker`)
    /// before the first `parallel_for` call — this constructor does not
    /// spawn anything itself. `tick` is the clock `PerCoreStats` busy/idle
    /// counters are measured against; it must outlive the dispatcher,
    /// which is itself always used as `'static` (see `spawn_dispatcher`).
    pub fn new(n_workers: usize, tick: &'static dyn TickSource) -> Self {
        let n_workers = n_workers.clamp(1, MAX_WORKERS);
        let mut stats = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            stats.push(PerCoreStats::default());
        }
        Dispatcher {
            n_workers,
            stats,
            job: Mutex::new(None),
            generation: AtomicU32::new(0),
            cursor: AtomicUsize::new(0),
            done_count: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            tick,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.n_workers
    }

    pub fn stats(&self, worker_id: usize) -> &PerCoreStats {
        &self.stats[worker_id]
    }

    pub fn reset_all_stats(&self) {
        for s in &self.stats {
            s.reset();
        }
    }

    /// Runs `func(arg, i)` for every `i` in `[0, total_items)`, partitioned
    /// into chunks of `chunk_size` (auto-derived as
    /// `ceil(total_items / (4 * n_workers))` when 0), then blocks until
    /// every worker has finished its share.
    ///
    /// # Safety
    /// `arg` must remain valid and not be mutably aliased outside what
    /// `func` does with it for the duration of this call.
    pub unsafe fn parallel_for(
        &self,
        func: WorkFn,
        arg: *mut (),
        total_items: usize,
        chunk_size: usize,
        mode: DispatchMode,
    ) -> EngineResult<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // No worker may re-enter parallel_for — single nesting level.
            return Err(EngineError::WrongState);
        }

        if total_items == 0 {
            self.busy.store(false, Ordering::Release);
            return Ok(());
        }

        let chunk_size = if chunk_size == 0 {
            (total_items + 4 * self.n_workers - 1) / (4 * self.n_workers)
        } else {
            chunk_size
        };

        *self.job.lock() = Some(JobDesc {
            func,
            arg: arg as usize,
            total_items,
            chunk_size,
            mode,
        });
        self.cursor.store(0, Ordering::Relaxed);
        self.done_count.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);

        while self.done_count.load(Ordering::Acquire) < self.n_workers {
            core::hint::spin_loop();
        }

        *self.job.lock() = None;
        self.busy.store(false, Ordering::Release);
        Ok(())
    }

    /// Signals every parked worker to exit its `worker_loop`. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Runs forever on a worker's thread/core: wait for a new job
    /// generation, run this worker's share, mark done, repeat. Returns
    /// when `shutdown()` has been called.
    pub fn worker_loop(&self, worker_id: usize) {
        let mut seen_gen = self.generation.load(Ordering::Acquire);
        let mut idle_start = self.tick.now();
        loop {
            if self.is_shutdown() {
                return;
            }
            let cur_gen = self.generation.load(Ordering::Acquire);
            if cur_gen == seen_gen {
                core::hint::spin_loop();
                continue;
            }
            seen_gen = cur_gen;
            let idle_ticks = self.tick.now().saturating_sub(idle_start);
            run_assigned_work(self, worker_id, idle_ticks);
            idle_start = self.tick.now();
        }
    }
}

fn run_assigned_work(dispatcher: &Dispatcher, worker_id: usize, idle_ticks: u64) {
    let busy_start = dispatcher.tick.now();
    let (func, arg, total_items, chunk_size, mode) = {
        let guard = dispatcher.job.lock();
        match guard.as_ref() {
            Some(j) => (j.func, j.arg as *mut (), j.total_items, j.chunk_size, j.mode),
            None => {
                // Job already cleared by the time we looked — nothing to
                // do this generation, but we still must mark done so the
                // join barrier in `parallel_for` isn't left short.
                let stats = dispatcher.stats(worker_id);
                stats.ticks_idle.fetch_add(idle_ticks, Ordering::Relaxed);
                dispatcher.done_count.fetch_add(1, Ordering::Release);
                return;
            }
        }
    };

    let mut processed = 0u64;
    match mode {
        DispatchMode::WorkStealing => loop {
            let start = dispatcher.cursor.fetch_add(chunk_size, Ordering::Relaxed);
            if start >= total_items {
                break;
            }
            let end = (start + chunk_size).min(total_items);
            for i in start..end {
                func(arg, i);
            }
            processed += (end - start) as u64;
        },
        DispatchMode::Deterministic => {
            let mut i = worker_id;
            while i < total_items {
                func(arg, i);
                processed += 1;
                i += dispatcher.n_workers;
            }
        }
    }

    let busy_ticks = dispatcher.tick.now().saturating_sub(busy_start);
    let stats = dispatcher.stats(worker_id);
    stats.items_processed.fetch_add(processed, Ordering::Relaxed);
    stats.invocations.fetch_add(1, Ordering::Relaxed);
    stats.ticks_total.fetch_add(busy_ticks, Ordering::Relaxed);
    stats.ticks_idle.fetch_add(idle_ticks, Ordering::Relaxed);

    dispatcher.done_count.fetch_add(1, Ordering::Release);
}

/// Spawns the worker threads/cores that run `Dispatcher::worker_loop`.
/// The real implementation is bare-metal CPU bring-up (an external
/// collaborator owning the SMP trampoline and per-core stacks); this
/// trait is the seam a kernel's SMP subsystem plugs into.
pub trait CoreRuntime {
    /// Spawns worker `worker_id` (`0..dispatcher.worker_count()`) so that
    /// it calls `dispatcher.worker_loop(worker_id)` and keeps running
    /// until the dispatcher is shut down.
    fn spawn_worker(&self, worker_id: usize, dispatcher: &'static Dispatcher);
}

/// Hosted `CoreRuntime` backed by OS threads, for the repl harness and
/// for this crate's own test suite (no SMP bring-up available there).
#[cfg(any(test, feature = "std-host"))]
pub mod std_host {
    use super::{CoreRuntime, Dispatcher};
    use crate::timer::std_host::StdTickSource;
    use std::thread;

    pub struct StdThreadRuntime;

    impl CoreRuntime for StdThreadRuntime {
        fn spawn_worker(&self, worker_id: usize, dispatcher: &'static Dispatcher) {
            thread::Builder::new()
                .name(alloc::format!("embodios-worker-{worker_id}"))
                .spawn(move || dispatcher.worker_loop(worker_id))
                .expect("failed to spawn worker thread");
        }
    }

    /// Builds a leaked (intentionally, for `'static`) dispatcher with
    /// `n_workers` OS-thread workers already spawned and parked, clocked
    /// by a leaked `StdTickSource`. Meant for tests and for the repl
    /// harness's one-shot process lifetime, not for long-running services
    /// that need to reclaim the memory.
    pub fn spawn_dispatcher(n_workers: usize) -> &'static Dispatcher {
        let tick: &'static StdTickSource =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(StdTickSource::new()));
        let dispatcher: &'static Dispatcher = alloc::boxed::Box::leak(alloc::boxed::Box::new(
            Dispatcher::new(n_workers, tick),
        ));
        let runtime = StdThreadRuntime;
        for id in 0..dispatcher.worker_count() {
            runtime.spawn_worker(id, dispatcher);
        }
        dispatcher
    }
}
