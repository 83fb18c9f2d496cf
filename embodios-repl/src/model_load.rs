//! Loads a GGUF file off disk into a ready `embodios_core::Engine`.

use std::path::Path;

use embodios_core::executor::std_host::spawn_dispatcher;
use embodios_core::executor::Dispatcher;
use embodios_core::{gguf, DispatchMode, Engine, Kernels, TraceLevel, TraceSink, Vocabulary, WeightStore};
use tracing::{debug, info, warn};

use crate::block_device::FileBlockDevice;

fn tracing_sink(_ctx: *mut (), level: TraceLevel, msg: &str) {
    match level {
        TraceLevel::Debug => debug!(target: "embodios_core", "{msg}"),
        TraceLevel::Info => info!(target: "embodios_core", "{msg}"),
        TraceLevel::Warn => warn!(target: "embodios_core", "{msg}"),
    }
}

pub fn load_bytes(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut device = FileBlockDevice::open(path)?;
    Ok(device.read_whole_file()?)
}

/// Parses `data` and builds a fully-initialized `Engine` over it. `n_workers
/// == 0` runs without a parallel executor (`dispatch_matvec` always takes
/// the scalar/SIMD direct path).
pub fn build_engine<'a>(data: &'a [u8], n_workers: usize) -> anyhow::Result<(Engine<'a>, &'static Dispatcher)> {
    let parsed = gguf::parse(data)?;
    let config = gguf::model_config(&parsed.metadata)?;
    let (tokens, merges) = gguf::tokenizer_vocab(&parsed.metadata)?;
    let vocab = Vocabulary::new(tokens, merges);
    let store = WeightStore::new(parsed.tensors, &data[parsed.blob_origin..]);
    let kernels = Kernels::detect();
    info!(backend = ?kernels.backend(), "kernel backend selected");

    let dispatcher = spawn_dispatcher(n_workers.max(1));
    let sink = TraceSink::new(std::ptr::null_mut(), tracing_sink);

    let engine = Engine::init(
        config,
        &store,
        vocab,
        kernels,
        Some(dispatcher),
        DispatchMode::WorkStealing,
        0,
        // Embedding hot-region precompute is a tunable, left off by
        // default (see DESIGN.md) — `0` disables it.
        0,
        &[],
        0x5EED,
        Some(sink),
    )?;
    Ok((engine, dispatcher))
}
