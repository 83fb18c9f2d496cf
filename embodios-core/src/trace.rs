//! Optional trace sink.
//!
//! A `no_std` library doesn't assume a console exists — a kernel-specific
//! `serial_println!`-style macro wouldn't compile for an arbitrary caller
//! of this crate. Instead, a caller that wants visibility
//! into what the engine is doing (backend selection, weight-tying
//! fallback, generation stop reasons) registers a narrow callback; the
//! hosted `embodios-repl` wires this straight into `tracing`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
}

/// `(ctx, level, message)`. `ctx` is an opaque caller-owned pointer,
/// exactly like `executor::WorkFn`'s `arg` — the caller guarantees it
/// outlives every `TraceSink` built over it.
pub type TraceFn = fn(*mut (), TraceLevel, &str);

#[derive(Clone, Copy)]
pub struct TraceSink {
    ctx: *mut (),
    log: TraceFn,
}

// Safety: `ctx` is only ever passed back to the caller's own `log`
// function, never dereferenced by this crate.
unsafe impl Send for TraceSink {}
unsafe impl Sync for TraceSink {}

impl TraceSink {
    pub fn new(ctx: *mut (), log: TraceFn) -> Self {
        TraceSink { ctx, log }
    }

    pub fn emit(&self, level: TraceLevel, msg: &str) {
        (self.log)(self.ctx, level, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_log(_ctx: *mut (), _level: TraceLevel, _msg: &str) {
        CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn emit_invokes_registered_callback() {
        let sink = TraceSink::new(core::ptr::null_mut(), counting_log);
        let before = CALLS.load(Ordering::Relaxed);
        sink.emit(TraceLevel::Info, "hello");
        assert_eq!(CALLS.load(Ordering::Relaxed), before + 1);
    }
}
