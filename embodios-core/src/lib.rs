//! Bare-metal transformer inference engine core.
//!
//! GGUF loading, quantized weight storage, dequant/matmul kernels, a fixed
//! worker-pool executor, the KV and embedding caches, the token sampler and
//! detokenizer, the streaming decode loop, and the tick-source-driven
//! profiler. Everything here is `no_std` + `alloc`: block device I/O,
//! console output, CPU bring-up, and memory allocator primitives are
//! external collaborators this crate only names through traits (`TickSource`,
//! `CoreRuntime`) or plain byte slices handed in by the caller.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
// `no_std` suppresses the implicit `extern crate std;` that a normal crate
// gets for free. The `std-host` feature's hosted stand-ins (`executor::
// std_host`, `timer::std_host` — OS threads and `Instant` in place of SMP
// bring-up and a calibrated tick source) need it back explicitly.
#[cfg(any(test, feature = "std-host"))]
extern crate std;

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gguf;
pub mod kernels;
pub mod kv_cache;
pub mod quant;
pub mod sampler;
pub mod timer;
pub mod tokenizer;
pub mod trace;

pub use config::{ModelConfig, QuantKind};
pub use embedding::EmbeddingCache;
pub use engine::{Engine, EngineState, GenerateReport, GenerateTiming, StopReason};
pub use error::{EngineError, EngineResult, PartialGeneration};
pub use executor::{CoreRuntime, DispatchMode, Dispatcher};
pub use gguf::{parse as parse_gguf, GgufFile};
pub use kernels::{Backend, Kernels};
pub use kv_cache::KvCache;
pub use quant::WeightStore;
pub use sampler::{Rng, SamplingMode};
pub use timer::{Profiler, TickSource};
pub use tokenizer::Vocabulary;
pub use trace::{TraceFn, TraceLevel, TraceSink};
