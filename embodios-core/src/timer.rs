//! Monotonic tick source and profiler.
//!
//! The tick source itself (TSC on x86, virtual counter on aarch64, HPET
//! fallback) is an external collaborator's job — calibrating a hardware
//! counter at boot is bring-up, out of scope here. This module only
//! consumes ticks through the `TickSource` trait and does the tick↔µs
//! arithmetic and the profiler bookkeeping, the same division of labor
//! drawn between `cpu::tsc`'s calibration/read primitives and a caller's
//! `Stopwatch`.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::string::String;
use alloc::vec::Vec;

/// A monotonic tick counter the core can convert to microseconds. Backed
/// by TSC, a virtual counter, or HPET below this crate; `freq_hz` is
/// whatever the boot-time calibration against a known-good reference
/// measured.
pub trait TickSource {
    fn now(&self) -> u64;
    fn freq_hz(&self) -> u64;
}

/// Lossless (up to 64-bit range, tick rate ≤ 10 GHz) tick↔µs conversion,
/// matching a `cycles_to_micros` shape but kept as free functions
/// parameterized on frequency rather than a global `TSC_FREQ_HZ`, since
/// this crate has no process-wide globals.
#[inline]
pub fn ticks_to_us(ticks: u64, freq_hz: u64) -> u64 {
    if freq_hz == 0 {
        return 0;
    }
    ((ticks as u128 * 1_000_000u128) / freq_hz as u128) as u64
}

#[inline]
pub fn us_to_ticks(us: u64, freq_hz: u64) -> u64 {
    ((us as u128 * freq_hz as u128) / 1_000_000u128) as u64
}

/// One profiler entry: a function's observed window. The ring buffer
/// holds these; overflow overwrites the oldest and bumps `drop_count`.
#[derive(Debug, Clone, Copy)]
pub struct TimingEntry {
    pub name: &'static str,
    pub start_ticks: u64,
    pub end_ticks: u64,
    pub duration_us: u64,
    pub worker_id: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct FunctionAgg {
    total_us: u64,
    calls: u64,
    min_us: u64,
    max_us: u64,
}

impl FunctionAgg {
    fn record(&mut self, us: u64) {
        if self.calls == 0 {
            self.min_us = us;
            self.max_us = us;
        } else {
            self.min_us = self.min_us.min(us);
            self.max_us = self.max_us.max(us);
        }
        self.total_us += us;
        self.calls += 1;
    }
}

/// Per-allocation-site counters: bytes requested out, bytes actually
/// returned/retired, the high-water mark, and call count. Named sites are
/// caller-chosen labels (e.g. `"kv_cache"`, `"embedding_cache"`), not
/// individual `alloc` call sites — this crate does not hook the global
/// allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocAgg {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub peak: u64,
    pub calls: u64,
}

const RING_CAPACITY: usize = 1024;
const MAX_FUNCTIONS: usize = 64;
const MAX_ALLOC_SITES: usize = 32;

struct NamedAgg<T> {
    name: &'static str,
    agg: T,
}

/// Ring buffer of timing entries plus per-function and per-allocation-site
/// aggregates. Enable/disable is a single flag; `start`/`stop` read the
/// tick source only when enabled.
pub struct Profiler {
    enabled: core::sync::atomic::AtomicBool,
    ring: spin::Mutex<Ring>,
    functions: spin::Mutex<Vec<NamedAgg<FunctionAgg>>>,
    alloc_sites: spin::Mutex<Vec<NamedAgg<AllocAgg>>>,
    drop_count: AtomicU64,
    head: AtomicU32,
}

struct Ring {
    entries: Vec<Option<TimingEntry>>,
}

impl Ring {
    fn new() -> Self {
        Ring {
            entries: (0..RING_CAPACITY).map(|_| None).collect(),
        }
    }
}

/// An open timing span returned by `Profiler::start`. Dropping it without
/// calling `stop` is allowed (no span is recorded) — callers that want a
/// recorded entry must call `stop` explicitly, an explicit start/stop
/// pairing rather than RAII (RAII would record spurious entries on
/// early-return paths that don't want timing).
pub struct Span {
    name: &'static str,
    start_ticks: u64,
    worker_id: u32,
    active: bool,
}

impl Profiler {
    pub fn new() -> Self {
        Profiler {
            enabled: core::sync::atomic::AtomicBool::new(cfg!(feature = "profiling")),
            ring: spin::Mutex::new(Ring::new()),
            functions: spin::Mutex::new(Vec::new()),
            alloc_sites: spin::Mutex::new(Vec::new()),
            drop_count: AtomicU64::new(0),
            head: AtomicU32::new(0),
        }
    }

    /// Runtime on/off switch, ANDed with the `profiling` compile-time
    /// feature (the profiling toggle is compile-time on bare metal; this
    /// crate's cargo feature stands in for it). With the feature off, this
    /// is a no-op — there is no ring buffer traffic to enable no matter
    /// what the caller asks for.
    pub fn set_enabled(&self, enabled: bool) {
        if cfg!(feature = "profiling") {
            self.enabled.store(enabled, Ordering::Release);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Opens a span. When profiling is disabled this does not touch the
    /// tick source at all — `start`/`stop` are free when disabled.
    pub fn start(&self, tick: &dyn TickSource, name: &'static str, worker_id: u32) -> Span {
        if !self.enabled() {
            return Span { name, start_ticks: 0, worker_id, active: false };
        }
        Span { name, start_ticks: tick.now(), worker_id, active: true }
    }

    /// Closes a span, appending to the ring buffer (CAS-claimed slot on a
    /// monotonic head index, a single-writer-per-slot claim via CAS) and
    /// folding into the per-function aggregate via a lock-free-ish add
    /// (the aggregate vector itself is behind a spin lock here since the
    /// set of distinct function names is small and fixed, not a full
    /// lock-free map).
    pub fn stop(&self, tick: &dyn TickSource, span: Span) {
        if !span.active || !self.enabled() {
            return;
        }
        let end_ticks = tick.now();
        let freq = tick.freq_hz();
        let duration_us = ticks_to_us(end_ticks.saturating_sub(span.start_ticks), freq);
        let entry = TimingEntry {
            name: span.name,
            start_ticks: span.start_ticks,
            end_ticks,
            duration_us,
            worker_id: span.worker_id,
        };

        let slot = self.head.fetch_add(1, Ordering::AcqRel) as usize % RING_CAPACITY;
        let mut ring = self.ring.lock();
        if ring.entries[slot].is_some() {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
        ring.entries[slot] = Some(entry);
        drop(ring);

        let mut functions = self.functions.lock();
        match functions.iter_mut().find(|f| f.name == span.name) {
            Some(f) => f.agg.record(duration_us),
            None if functions.len() < MAX_FUNCTIONS => {
                let mut agg = FunctionAgg::default();
                agg.record(duration_us);
                functions.push(NamedAgg { name: span.name, agg });
            }
            None => {}
        }
    }

    /// Records an allocation-site observation. `bytes_in` is typically 0
    /// for a pure allocation and `bytes_out` 0 for a pure free; callers
    /// that track net high-water marks pass both.
    pub fn record_alloc(&self, site: &'static str, bytes_out: u64, bytes_in: u64) {
        if !self.enabled() {
            return;
        }
        let mut sites = self.alloc_sites.lock();
        match sites.iter_mut().find(|s| s.name == site) {
            Some(s) => {
                s.agg.bytes_out += bytes_out;
                s.agg.bytes_in += bytes_in;
                s.agg.calls += 1;
                let net = s.agg.bytes_out.saturating_sub(s.agg.bytes_in);
                s.agg.peak = s.agg.peak.max(net);
            }
            None if sites.len() < MAX_ALLOC_SITES => {
                let mut agg = AllocAgg::default();
                agg.bytes_out = bytes_out;
                agg.bytes_in = bytes_in;
                agg.peak = bytes_out.saturating_sub(bytes_in);
                agg.calls = 1;
                sites.push(NamedAgg { name: site, agg });
            }
            None => {}
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Snapshot of every non-empty ring entry, oldest-claimed-slot first
    /// is not guaranteed (ring wrap reorders), but every live entry is
    /// included.
    pub fn ring_snapshot(&self) -> Vec<TimingEntry> {
        self.ring.lock().entries.iter().filter_map(|e| *e).collect()
    }

    /// `(name, total_us, calls, min_us, max_us)` per distinct function
    /// name observed so far.
    pub fn function_summary(&self) -> Vec<(String, u64, u64, u64, u64)> {
        self.functions
            .lock()
            .iter()
            .map(|f| (String::from(f.name), f.agg.total_us, f.agg.calls, f.agg.min_us, f.agg.max_us))
            .collect()
    }

    pub fn alloc_summary(&self) -> Vec<(String, AllocAgg)> {
        self.alloc_sites
            .lock()
            .iter()
            .map(|s| (String::from(s.name), s.agg))
            .collect()
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Host tick source backed by `std::time::Instant`, for the repl harness
/// and for this crate's own tests — the hosted equivalent of wiring TSC
/// in a kernel, behind the same `std-host`-style gate the executor uses
/// for its `StdThreadRuntime`.
#[cfg(any(test, feature = "std-host"))]
pub mod std_host {
    use super::TickSource;
    use std::time::Instant;

    /// Nanosecond-resolution tick source: `now()` returns elapsed
    /// nanoseconds since construction, `freq_hz()` is always 1 GHz so the
    /// tick↔µs conversion is exact.
    pub struct StdTickSource {
        origin: Instant,
    }

    impl StdTickSource {
        pub fn new() -> Self {
            StdTickSource { origin: Instant::now() }
        }
    }

    impl Default for StdTickSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TickSource for StdTickSource {
        fn now(&self) -> u64 {
            self.origin.elapsed().as_nanos() as u64
        }
        fn freq_hz(&self) -> u64 {
            1_000_000_000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_to_us_round_trip_at_low_rate() {
        let freq = 1_000_000u64; // 1 MHz
        let ticks = 5_000u64;
        let us = ticks_to_us(ticks, freq);
        assert_eq!(us, 5_000);
        assert_eq!(us_to_ticks(us, freq), ticks);
    }

    #[test]
    fn zero_freq_converts_to_zero() {
        assert_eq!(ticks_to_us(1234, 0), 0);
    }

    struct FakeTick {
        t: core::cell::Cell<u64>,
    }
    impl TickSource for FakeTick {
        fn now(&self) -> u64 {
            let v = self.t.get();
            self.t.set(v + 100);
            v
        }
        fn freq_hz(&self) -> u64 {
            1_000_000
        }
    }

    #[test]
    fn disabled_profiler_never_reads_clock() {
        let profiler = Profiler::new();
        profiler.set_enabled(false);
        let tick = FakeTick { t: core::cell::Cell::new(0) };
        let span = profiler.start(&tick, "noop", 0);
        profiler.stop(&tick, span);
        assert_eq!(tick.t.get(), 0);
        assert!(profiler.ring_snapshot().is_empty());
    }

    #[test]
    fn records_function_aggregate() {
        let profiler = Profiler::new();
        let tick = FakeTick { t: core::cell::Cell::new(0) };
        for _ in 0..3 {
            let span = profiler.start(&tick, "matmul", 0);
            profiler.stop(&tick, span);
        }
        let summary = profiler.function_summary();
        let (_, total, calls, min, max) = summary.iter().find(|(n, ..)| n == "matmul").unwrap();
        assert_eq!(*calls, 3);
        assert_eq!(*min, *max);
        assert!(*total > 0);
    }

    #[test]
    fn ring_overflow_increments_drop_count() {
        let profiler = Profiler::new();
        let tick = FakeTick { t: core::cell::Cell::new(0) };
        for _ in 0..(RING_CAPACITY + 10) {
            let span = profiler.start(&tick, "x", 0);
            profiler.stop(&tick, span);
        }
        assert!(profiler.drop_count() >= 10);
    }
}
