//! Streaming inference engine: the forward pass, composed per token from
//! every other module in this crate.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::ModelConfig;
use crate::embedding::EmbeddingCache;
use crate::error::{EngineError, EngineResult, PartialGeneration};
use crate::executor::{DispatchMode, Dispatcher};
use crate::kernels::scalar::dequant_row;
use crate::kernels::Kernels;
use crate::kv_cache::KvCache;
use crate::quant::{TensorView, WeightStore};
use crate::sampler::{sample, Rng, SamplingMode};
use crate::timer::{ticks_to_us, Profiler, TickSource};
use crate::tokenizer::Vocabulary;
use crate::trace::{TraceLevel, TraceSink};

/// Per-engine state machine: `Uninit → Loaded → Ready →
/// Running → Ready → …`. `Engine::init` collapses `Uninit`/`Loaded` into
/// construction (Rust's ownership model makes an engine with unresolved
/// weights simply not exist yet, rather than a distinct runtime state to
/// check); `Loaded` is still tracked as the post-`reset` state name, even
/// though weights remain resolved — see DESIGN.md for this Open Question
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Loaded,
    Ready,
    Running,
}

/// One transformer layer's weight tensors. Norm weights are dequantized
/// once at load (they're `embedding_dim`-long, trivial cost); the
/// projection matrices stay as quantized `TensorView`s — the matmul
/// kernels dequantize block-by-block on every forward pass without
/// materializing a full F32 copy.
struct LayerWeights<'a> {
    attn_norm: Vec<f32>,
    wq: TensorView<'a>,
    wk: TensorView<'a>,
    wv: TensorView<'a>,
    wo: TensorView<'a>,
    ffn_norm: Vec<f32>,
    w_gate: TensorView<'a>,
    w_up: TensorView<'a>,
    w_down: TensorView<'a>,
}

/// Scratch buffers for one forward pass. Preallocated once at `init` and
/// reused every step: no per-token heap traffic.
struct RunState {
    x: Vec<f32>,
    h: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    attn_scores: Vec<f32>,
    attn_out: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    hb: Vec<f32>,
    logits: Vec<f32>,
}

impl RunState {
    fn new(config: &ModelConfig) -> Self {
        RunState {
            x: vec![0.0; config.embedding_dim],
            h: vec![0.0; config.embedding_dim.max(config.ffn_hidden_dim)],
            q: vec![0.0; config.embedding_dim],
            k: vec![0.0; config.kv_dim()],
            v: vec![0.0; config.kv_dim()],
            attn_scores: vec![0.0; config.n_heads * config.max_seq_len],
            attn_out: vec![0.0; config.embedding_dim],
            gate: vec![0.0; config.ffn_hidden_dim],
            up: vec![0.0; config.ffn_hidden_dim],
            hb: vec![0.0; config.ffn_hidden_dim],
            logits: vec![0.0; config.vocab_size],
        }
    }

    /// Zero-capacity placeholder used to temporarily move the real
    /// buffers out of `Engine` for the duration of `forward_step`, so the
    /// rest of `Engine`'s fields stay freely borrowable without fighting
    /// the borrow checker over a single `self.run` path.
    fn empty() -> Self {
        RunState {
            x: Vec::new(),
            h: Vec::new(),
            q: Vec::new(),
            k: Vec::new(),
            v: Vec::new(),
            attn_scores: Vec::new(),
            attn_out: Vec::new(),
            gate: Vec::new(),
            up: Vec::new(),
            hb: Vec::new(),
            logits: Vec::new(),
        }
    }
}

/// Why `generate` stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Produced `max_out` tokens.
    MaxTokens,
    /// `position == max_seq_len` — clean termination, not an error.
    ContextLimit,
    /// Sampled the configured `eos_id`.
    Eos,
}

/// Integer-µs timing for one `generate` call: no floating-point fields
/// to zero on init, timing is integer µs end to end.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateTiming {
    pub prefill_us: u64,
    pub decode_total_us: u64,
    pub first_token_us: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateReport {
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
    pub timing: GenerateTiming,
}

/// The memory-resident inference engine: owns the KV cache, embedding
/// cache, run-state scratch, and a read-only view of the weight blob.
/// `'a` is the weight blob's lifetime — the model-load procedure
/// outlives every `Engine` built over it.
pub struct Engine<'a> {
    config: ModelConfig,
    layers: Vec<LayerWeights<'a>>,
    final_norm: Vec<f32>,
    output_weight: TensorView<'a>,
    kernels: Kernels,
    kv_cache: KvCache,
    embedding: EmbeddingCache,
    vocab: Vocabulary,
    dispatcher: Option<&'a Dispatcher>,
    dispatch_mode: DispatchMode,
    rng: Rng,
    state: EngineState,
    run: RunState,
    trace: Option<TraceSink>,
}

fn trace(sink: Option<&TraceSink>, level: TraceLevel, msg: &str) {
    if let Some(s) = sink {
        s.emit(level, msg);
    }
}

fn dequant_vector(view: &TensorView) -> Vec<f32> {
    let mut out = vec![0.0; view.element_count()];
    dequant_row(view, &mut out);
    out
}

impl<'a> Engine<'a> {
    /// Resolves every per-layer tensor by the llama.cpp-family GGUF naming
    /// convention (`blk.{l}.attn_norm.weight`, …), loads the embedding
    /// cache, and allocates the KV cache and run-state scratch. Weight
    /// tying: when `output.weight` is absent, the token-embedding tensor
    /// is reused for the final logit projection.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        config: ModelConfig,
        store: &WeightStore<'a>,
        vocab: Vocabulary,
        kernels: Kernels,
        dispatcher: Option<&'a Dispatcher>,
        dispatch_mode: DispatchMode,
        sliding_window: usize,
        hot_positions: usize,
        hot_prefill_ids: &[u32],
        rng_seed: u64,
        trace_sink: Option<TraceSink>,
    ) -> EngineResult<Self> {
        trace(trace_sink.as_ref(), TraceLevel::Info, "resolving layer weight tensors");
        let mut layers = Vec::with_capacity(config.n_layers);
        for l in 0..config.n_layers {
            let attn_norm = dequant_vector(&store.view_by_name(&format!("blk.{l}.attn_norm.weight"))?);
            let wq = store.view_by_name(&format!("blk.{l}.attn_q.weight"))?;
            let wk = store.view_by_name(&format!("blk.{l}.attn_k.weight"))?;
            let wv = store.view_by_name(&format!("blk.{l}.attn_v.weight"))?;
            let wo = store.view_by_name(&format!("blk.{l}.attn_output.weight"))?;
            let ffn_norm = dequant_vector(&store.view_by_name(&format!("blk.{l}.ffn_norm.weight"))?);
            let w_gate = store.view_by_name(&format!("blk.{l}.ffn_gate.weight"))?;
            let w_up = store.view_by_name(&format!("blk.{l}.ffn_up.weight"))?;
            let w_down = store.view_by_name(&format!("blk.{l}.ffn_down.weight"))?;
            layers.push(LayerWeights {
                attn_norm,
                wq,
                wk,
                wv,
                wo,
                ffn_norm,
                w_gate,
                w_up,
                w_down,
            });
        }

        let final_norm = dequant_vector(&store.view_by_name("output_norm.weight")?);
        let output_weight = match store.view_by_name("output.weight") {
            Ok(v) => v,
            Err(_) => {
                trace(
                    trace_sink.as_ref(),
                    TraceLevel::Debug,
                    "output.weight absent, tying to token_embd.weight",
                );
                store.view_by_name("token_embd.weight")?
            }
        };

        let mut embedding = EmbeddingCache::init(&config, hot_positions);
        embedding.load_from_gguf(store)?;
        embedding.precompute_hot(hot_prefill_ids);

        let kv_cache = KvCache::new(config.n_layers, config.max_seq_len, config.kv_dim(), sliding_window);
        let run = RunState::new(&config);

        trace(trace_sink.as_ref(), TraceLevel::Info, "engine ready");
        Ok(Engine {
            config,
            layers,
            final_norm,
            output_weight,
            kernels,
            kv_cache,
            embedding,
            vocab,
            dispatcher,
            dispatch_mode,
            rng: Rng::new(rng_seed),
            state: EngineState::Ready,
            run,
            trace: trace_sink,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kernels_backend(&self) -> crate::kernels::Backend {
        self.kernels.backend()
    }

    /// `Running/Ready → Loaded`: clears the KV cache so a fresh `generate`
    /// starts from an empty context. Weights, embedding cache, and the
    /// sampler RNG state are untouched.
    pub fn reset(&mut self) {
        self.kv_cache = KvCache::new(
            self.config.n_layers,
            self.config.max_seq_len,
            self.config.kv_dim(),
            self.kv_cache.sliding_window(),
        );
        self.state = EngineState::Loaded;
        // Ready for the next `generate` immediately — see `EngineState`'s
        // doc comment for why this crate collapses the Loaded→Ready leg
        // back into `reset` itself rather than requiring a second call.
        self.state = EngineState::Ready;
    }

    /// Detokenizes one id into `out`, returning the byte count written.
    pub fn get_token_text(&self, id: u32, out: &mut [u8]) -> EngineResult<usize> {
        self.vocab.decode_into(id, out)
    }

    pub fn kv_cache_stats(&self) -> crate::kv_cache::KvCacheStats {
        self.kv_cache.stats()
    }

    pub fn embedding_cache_stats(&self) -> crate::embedding::EmbeddingCacheStats {
        self.embedding.stats()
    }

    /// Runs prefill over `prompt_ids` then decodes up to `max_out` new
    /// tokens into `out_ids`, sampling with `mode`. `tick` drives both the
    /// returned `GenerateTiming` and (when `profiler` is `Some`) the
    /// `streaming_inference.{prefill,generate}` spans.
    pub fn generate(
        &mut self,
        prompt_ids: &[u32],
        max_out: usize,
        out_ids: &mut [u32],
        mode: SamplingMode,
        tick: &dyn TickSource,
        profiler: Option<&Profiler>,
    ) -> Result<GenerateReport, PartialGeneration> {
        if self.state != EngineState::Ready {
            return Err(PartialGeneration { tokens_produced: 0, error: EngineError::WrongState });
        }
        if prompt_ids.is_empty() {
            // Every forward pass requires at least one input token (spec
            // §8 Scenario C).
            return Err(PartialGeneration { tokens_produced: 0, error: EngineError::InvalidTokenId });
        }
        if out_ids.len() < max_out {
            return Err(PartialGeneration { tokens_produced: 0, error: EngineError::BufferTooSmall });
        }

        self.state = EngineState::Running;
        let freq = tick.freq_hz();
        let call_start = tick.now();

        let mut pos = 0usize;
        let prefill_span = profiler.map(|p| p.start(tick, "streaming_inference.prefill", 0));
        for &token in prompt_ids {
            if let Err(e) = self.forward_step(token, pos) {
                self.state = EngineState::Ready;
                return Err(PartialGeneration { tokens_produced: 0, error: e });
            }
            pos += 1;
        }
        if let (Some(p), Some(span)) = (profiler, prefill_span) {
            p.stop(tick, span);
        }
        let prefill_us = ticks_to_us(tick.now().saturating_sub(call_start), freq);

        let mut next_token = sample(&mut self.run.logits, mode, &mut self.rng);
        let first_token_us = ticks_to_us(tick.now().saturating_sub(call_start), freq);

        let mut produced = 0usize;
        let decode_start = tick.now();
        let gen_span = profiler.map(|p| p.start(tick, "streaming_inference.generate", 0));

        let stop_reason = loop {
            if produced >= max_out {
                break StopReason::MaxTokens;
            }
            if pos >= self.config.max_seq_len {
                break StopReason::ContextLimit;
            }
            out_ids[produced] = next_token;
            produced += 1;
            if next_token == self.config.eos_id {
                break StopReason::Eos;
            }
            if let Err(e) = self.forward_step(next_token, pos) {
                self.state = EngineState::Ready;
                return Err(PartialGeneration { tokens_produced: produced, error: e });
            }
            pos += 1;
            next_token = sample(&mut self.run.logits, mode, &mut self.rng);
        };

        if let (Some(p), Some(span)) = (profiler, gen_span) {
            p.stop(tick, span);
        }
        let decode_total_us = ticks_to_us(tick.now().saturating_sub(decode_start), freq);

        self.state = EngineState::Ready;
        trace(
            self.trace.as_ref(),
            TraceLevel::Debug,
            match stop_reason {
                StopReason::MaxTokens => "generate: stopped at max_out",
                StopReason::ContextLimit => "generate: stopped at context limit",
                StopReason::Eos => "generate: stopped at eos",
            },
        );
        Ok(GenerateReport {
            tokens_generated: produced,
            stop_reason,
            timing: GenerateTiming { prefill_us, decode_total_us, first_token_us },
        })
    }

    /// One forward pass at position `pos` for `token_id`: embedding
    /// lookup through every transformer layer to final logits. Leaves
    /// the result in `self.run.logits`. Moves `self.run` out
    /// into a local for the duration of the call so every other `Engine`
    /// field stays freely (and disjointly) borrowable.
    fn forward_step(&mut self, token_id: u32, pos: usize) -> EngineResult<()> {
        if pos >= self.config.max_seq_len {
            return Err(EngineError::ContextOverflow);
        }

        let mut run = core::mem::replace(&mut self.run, RunState::empty());
        let result = self.forward_step_inner(token_id, pos, &mut run);
        self.run = run;
        result
    }

    fn forward_step_inner(&mut self, token_id: u32, pos: usize, run: &mut RunState) -> EngineResult<()> {
        let embedding_dim = self.config.embedding_dim;
        let kv_dim = self.config.kv_dim();
        let eps = self.config.norm_eps;

        self.embedding.lookup(token_id, pos, &mut run.x)?;

        for l in 0..self.config.n_layers {
            let layer = &self.layers[l];

            rms_norm(&run.x, &layer.attn_norm, eps, &mut run.h[..embedding_dim]);

            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.wq,
                &run.h[..embedding_dim],
                embedding_dim,
                embedding_dim,
                &mut run.q,
            )?;
            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.wk,
                &run.h[..embedding_dim],
                kv_dim,
                embedding_dim,
                &mut run.k,
            )?;
            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.wv,
                &run.h[..embedding_dim],
                kv_dim,
                embedding_dim,
                &mut run.v,
            )?;

            apply_rope(&mut run.q, self.config.n_heads, self.config.head_dim, pos, self.config.rope_theta);
            apply_rope(&mut run.k, self.config.n_kv_heads, self.config.head_dim, pos, self.config.rope_theta);

            self.kv_cache.store(l, pos, &run.k, &run.v)?;

            compute_attention(&mut self.kv_cache, &self.config, l, pos, &run.q, &mut run.attn_scores, &mut run.attn_out)?;

            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.wo,
                &run.attn_out,
                embedding_dim,
                embedding_dim,
                &mut run.h[..embedding_dim],
            )?;
            for i in 0..embedding_dim {
                run.x[i] += run.h[i];
            }

            rms_norm(&run.x, &layer.ffn_norm, eps, &mut run.h[..embedding_dim]);

            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.w_gate,
                &run.h[..embedding_dim],
                self.config.ffn_hidden_dim,
                embedding_dim,
                &mut run.gate,
            )?;
            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.w_up,
                &run.h[..embedding_dim],
                self.config.ffn_hidden_dim,
                embedding_dim,
                &mut run.up,
            )?;
            for i in 0..self.config.ffn_hidden_dim {
                let g = run.gate[i];
                let sig = 1.0 / (1.0 + libm::expf(-g));
                run.hb[i] = g * sig * run.up[i];
            }
            dispatch_matvec(
                &self.kernels,
                self.dispatcher,
                self.dispatch_mode,
                &layer.w_down,
                &run.hb,
                embedding_dim,
                self.config.ffn_hidden_dim,
                &mut run.h[..embedding_dim],
            )?;
            for i in 0..embedding_dim {
                run.x[i] += run.h[i];
            }
        }

        rms_norm(&run.x, &self.final_norm, eps, &mut run.h[..embedding_dim]);
        dispatch_matvec(
            &self.kernels,
            self.dispatcher,
            self.dispatch_mode,
            &self.output_weight,
            &run.h[..embedding_dim],
            self.config.vocab_size,
            embedding_dim,
            &mut run.logits,
        )?;

        Ok(())
    }
}

/// Matrix–vector dispatch: scalar/SIMD kernel directly for small row
/// counts, or fanned across the parallel executor one row-chunk per
/// worker for large ones. Both paths compute the exact same per-row dot
/// product — no reduction, hence no risk of the associativity drift spec
/// §5 warns about between work-stealing and deterministic modes.
fn dispatch_matvec(
    kernels: &Kernels,
    dispatcher: Option<&Dispatcher>,
    mode: DispatchMode,
    view: &TensorView,
    x: &[f32],
    n_rows: usize,
    n_cols: usize,
    out: &mut [f32],
) -> EngineResult<()> {
    const PARALLEL_THRESHOLD: usize = 64;

    match dispatcher {
        Some(d) if n_rows >= PARALLEL_THRESHOLD => {
            struct Job<'a> {
                kernels: &'a Kernels,
                view: TensorView<'a>,
                x: &'a [f32],
                n_cols: usize,
                out: *mut f32,
            }

            fn work(ctx: *mut (), row: usize) {
                let job = unsafe { &*(ctx as *const Job) };
                let row_view = job
                    .view
                    .row_slice(row, row + 1, job.n_cols)
                    .expect("row index in range (bounds validated by caller before dispatch)");
                let mut tmp = [0f32; 1];
                job.kernels.matvec(&row_view, job.x, 1, job.n_cols, &mut tmp);
                // Safety: each work item owns exactly one `row` slot of
                // `out`, disjoint from every other item's slot.
                unsafe {
                    *job.out.add(row) = tmp[0];
                }
            }

            let job = Job { kernels, view: *view, x, n_cols, out: out.as_mut_ptr() };
            unsafe {
                d.parallel_for(work, &job as *const Job as *mut (), n_rows, 0, mode)?;
            }
            Ok(())
        }
        _ => {
            kernels.matvec(view, x, n_rows, n_cols, out);
            Ok(())
        }
    }
}

/// `h_i = x_i * w_i / sqrt(mean(x²) + eps)`.
fn rms_norm(x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    let n = x.len();
    let mut ss = 0f32;
    for &v in x {
        ss += v * v;
    }
    let inv_rms = 1.0 / libm::sqrtf(ss / n as f32 + eps);
    for i in 0..n {
        out[i] = x[i] * inv_rms * weight[i];
    }
}

/// Rotary position encoding applied in adjacent pairs `(2i, 2i+1)` with
/// `θ_i = rope_theta^(-2i/head_dim)`, angle `pos · θ_i`. This is the
/// NeoX/interleaved-pair variant, not llama.cpp's `(i, i + head_dim/2)`
/// split-half variant.
fn apply_rope(vec: &mut [f32], n_heads: usize, head_dim: usize, pos: usize, rope_theta: f32) {
    let half = head_dim / 2;
    for h in 0..n_heads {
        let base = h * head_dim;
        for i in 0..half {
            let exponent = -((2 * i) as f32) / head_dim as f32;
            let theta_i = libm::powf(rope_theta, exponent);
            let angle = pos as f32 * theta_i;
            let (sin_a, cos_a) = (libm::sinf(angle), libm::cosf(angle));
            let x0 = vec[base + 2 * i];
            let x1 = vec[base + 2 * i + 1];
            vec[base + 2 * i] = x0 * cos_a - x1 * sin_a;
            vec[base + 2 * i + 1] = x0 * sin_a + x1 * cos_a;
        }
    }
}

/// Grouped-query causal attention for layer `l` at position `pos` (spec
/// §4.4 step e): for each query head, map to its KV head, score against
/// every live past position, softmax, weight the cached values.
///
/// When a sliding window is configured, positions older than
/// `pos - (window - 1)` have already been evicted from `kv_cache` (FIFO),
/// so the live range is `[pos.saturating_sub(window - 1), pos]` rather
/// than the full `0..=pos` causal range — scoring against an evicted
/// position would hit `NotInitialized`. `kv_cache.window()` already
/// equals `max_seq_len` when no window is configured, so this one
/// expression covers both cases.
fn compute_attention(
    kv_cache: &mut KvCache,
    config: &ModelConfig,
    layer: usize,
    pos: usize,
    q: &[f32],
    attn_scores: &mut [f32],
    attn_out: &mut [f32],
) -> EngineResult<()> {
    let head_dim = config.head_dim;
    let n_heads = config.n_heads;
    let group = config.gqa_group_size();
    let scale = 1.0 / libm::sqrtf(head_dim as f32);

    let window = kv_cache.window();
    let start = pos.saturating_sub(window.saturating_sub(1));
    let live_len = pos - start + 1;

    for v in attn_out.iter_mut() {
        *v = 0.0;
    }

    for hq in 0..n_heads {
        let hkv = hq / group;
        let q_off = hq * head_dim;
        let row_off = hq * config.max_seq_len;
        let scores = &mut attn_scores[row_off..row_off + live_len];

        for p in start..=pos {
            let (k_p, _) = kv_cache.get_pair_at(layer, p)?;
            let k_head = &k_p[hkv * head_dim..(hkv + 1) * head_dim];
            let mut dot = 0f32;
            for d in 0..head_dim {
                dot += q[q_off + d] * k_head[d];
            }
            scores[p - start] = dot * scale;
        }

        crate::sampler::softmax_stable(scores);

        for p in start..=pos {
            let (_, v_p) = kv_cache.get_pair_at(layer, p)?;
            let v_head = &v_p[hkv * head_dim..(hkv + 1) * head_dim];
            let w = scores[p - start];
            for d in 0..head_dim {
                attn_out[q_off + d] += w * v_head[d];
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantKind;
    use crate::gguf;

    /// Hand-serializes a tiny but structurally complete GGUF v3 file: one
    /// transformer layer, every tensor F32, small enough to forward-pass
    /// in a unit test without a real model fixture.
    struct TinyModel {
        embedding_dim: usize,
        n_heads: usize,
        n_kv_heads: usize,
        head_dim: usize,
        ffn_hidden_dim: usize,
        vocab_size: usize,
        max_seq_len: usize,
    }

    impl TinyModel {
        fn build(&self) -> Vec<u8> {
            use gguf::tests_support::push_str;

            fn push_u32(buf: &mut Vec<u8>, key: &str, value: u32) {
                push_str(buf, key);
                buf.extend_from_slice(&4u32.to_le_bytes()); // type_tag::U32
                buf.extend_from_slice(&value.to_le_bytes());
            }
            fn push_f32(buf: &mut Vec<u8>, key: &str, value: f32) {
                push_str(buf, key);
                buf.extend_from_slice(&6u32.to_le_bytes()); // type_tag::F32
                buf.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            fn push_string_array(buf: &mut Vec<u8>, key: &str, items: &[&str]) {
                push_str(buf, key);
                buf.extend_from_slice(&9u32.to_le_bytes()); // ARRAY
                buf.extend_from_slice(&8u32.to_le_bytes()); // elem type STRING
                buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for it in items {
                    push_str(buf, it);
                }
            }

            let d = self.embedding_dim;
            let ff = self.ffn_hidden_dim;
            let kv = self.n_kv_heads * self.head_dim;
            let vocab = self.vocab_size;

            // (name, n_elems) for every tensor, in emission order; offsets
            // are assigned sequentially as F32 (4 bytes/elem, no padding
            // needed since block_elems==1 for F32).
            let tensor_specs: Vec<(alloc::string::String, usize)> = vec![
                (format!("blk.0.attn_norm.weight"), d),
                (format!("blk.0.attn_q.weight"), d * d),
                (format!("blk.0.attn_k.weight"), kv * d),
                (format!("blk.0.attn_v.weight"), kv * d),
                (format!("blk.0.attn_output.weight"), d * d),
                (format!("blk.0.ffn_norm.weight"), d),
                (format!("blk.0.ffn_gate.weight"), ff * d),
                (format!("blk.0.ffn_up.weight"), ff * d),
                (format!("blk.0.ffn_down.weight"), d * ff),
                (alloc::string::String::from("output_norm.weight"), d),
                (alloc::string::String::from("token_embd.weight"), vocab * d),
            ];

            let mut header = Vec::new();
            header.extend_from_slice(b"GGUF");
            header.extend_from_slice(&3u32.to_le_bytes());
            header.extend_from_slice(&(tensor_specs.len() as u64).to_le_bytes());
            header.extend_from_slice(&9u64.to_le_bytes()); // n_kv

            push_u32(&mut header, "llama.embedding_length", d as u32);
            push_u32(&mut header, "llama.block_count", 1);
            push_u32(&mut header, "llama.attention.head_count", self.n_heads as u32);
            push_u32(&mut header, "llama.attention.head_count_kv", self.n_kv_heads as u32);
            push_u32(&mut header, "llama.feed_forward_length", ff as u32);
            push_u32(&mut header, "llama.context_length", self.max_seq_len as u32);
            push_f32(&mut header, "llama.attention.layer_norm_rms_epsilon", 1e-5);
            push_f32(&mut header, "llama.rope.freq_base", 10000.0);
            let vocab_tokens: Vec<alloc::string::String> = (0..vocab).map(|i| format!("tok{i}")).collect();
            let vocab_refs: Vec<&str> = vocab_tokens.iter().map(|s| s.as_str()).collect();
            push_string_array(&mut header, "tokenizer.ggml.tokens", &vocab_refs);

            let mut offset = 0u64;
            for (name, n_elems) in &tensor_specs {
                push_str(&mut header, name);
                header.extend_from_slice(&1u32.to_le_bytes()); // n_dims
                header.extend_from_slice(&(*n_elems as u64).to_le_bytes());
                header.extend_from_slice(&0u32.to_le_bytes()); // F32 kind tag
                header.extend_from_slice(&offset.to_le_bytes());
                offset += (*n_elems * 4) as u64;
            }

            let pad = (256 - header.len() % 256) % 256;
            header.extend(core::iter::repeat(0u8).take(pad));

            // Blob: small deterministic values so the forward pass
            // produces finite, non-degenerate logits.
            let mut seed = 1u64;
            for (_, n_elems) in &tensor_specs {
                for _ in 0..*n_elems {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let v = ((seed >> 40) as i32 % 1000) as f32 / 10000.0;
                    header.extend_from_slice(&v.to_le_bytes());
                }
            }

            header
        }
    }

    fn build_engine(max_out_hot: &[u32]) -> (Vec<u8>, ModelConfig) {
        let spec = TinyModel {
            embedding_dim: 4,
            n_heads: 2,
            n_kv_heads: 1,
            head_dim: 2,
            ffn_hidden_dim: 6,
            vocab_size: 5,
            max_seq_len: 6,
        };
        let data = spec.build();
        let parsed = gguf::parse(&data).expect("parse tiny model");
        let cfg = gguf::model_config(&parsed.metadata).expect("config");
        let _ = max_out_hot;
        (data, cfg)
    }

    fn make_engine<'a>(data: &'a [u8], cfg: ModelConfig) -> Engine<'a> {
        make_engine_with_window(data, cfg, 0)
    }

    fn make_engine_with_window<'a>(data: &'a [u8], cfg: ModelConfig, sliding_window: usize) -> Engine<'a> {
        let parsed = gguf::parse(data).expect("parse");
        let store = WeightStore::new(parsed.tensors, &data[parsed.blob_origin..]);
        let (tokens, merges) = gguf::tokenizer_vocab(&parsed.metadata).expect("vocab");
        let vocab = Vocabulary::new(tokens, merges);
        Engine::init(
            cfg,
            &store,
            vocab,
            Kernels::detect(),
            None,
            DispatchMode::WorkStealing,
            sliding_window,
            0,
            &[],
            42,
            None,
        )
        .expect("engine init")
    }

    #[test]
    fn generate_produces_requested_token_count() {
        let (data, cfg) = build_engine(&[]);
        let mut engine = make_engine(&data, cfg);
        let tick = crate::timer::std_host::StdTickSource::new();

        let mut out = [0u32; 5];
        let report = engine
            .generate(&[0, 1, 2], 5, &mut out, SamplingMode::Greedy, &tick, None)
            .expect("generate");
        assert_eq!(report.tokens_generated, 5);
        assert_eq!(report.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn empty_prompt_is_invalid_token_id() {
        let (data, cfg) = build_engine(&[]);
        let mut engine = make_engine(&data, cfg);
        let tick = crate::timer::std_host::StdTickSource::new();
        let mut out = [0u32; 5];
        let err = engine
            .generate(&[], 5, &mut out, SamplingMode::Greedy, &tick, None)
            .unwrap_err();
        assert_eq!(err.error, EngineError::InvalidTokenId);
        assert_eq!(err.tokens_produced, 0);
    }

    #[test]
    fn context_overflow_terminates_cleanly_after_one_token() {
        let (data, cfg) = build_engine(&[]);
        let max_seq_len = cfg.max_seq_len;
        let mut engine = make_engine(&data, cfg);
        let tick = crate::timer::std_host::StdTickSource::new();

        let prompt: Vec<u32> = (0..(max_seq_len - 1) as u32).map(|i| i % 5).collect();
        let mut out = [0u32; 10];
        let report = engine
            .generate(&prompt, 10, &mut out, SamplingMode::Greedy, &tick, None)
            .expect("generate");
        assert_eq!(report.tokens_generated, 1);
        assert_eq!(report.stop_reason, StopReason::ContextLimit);
    }

    #[test]
    fn deterministic_mode_matches_work_stealing_output() {
        let (data, cfg) = build_engine(&[]);
        let parsed = gguf::parse(&data).unwrap();
        let store = WeightStore::new(parsed.tensors, &data[parsed.blob_origin..]);
        let (tokens, merges) = gguf::tokenizer_vocab(&parsed.metadata).unwrap();

        let dispatcher = crate::executor::std_host::spawn_dispatcher(2);
        let mut ws_engine = Engine::init(
            cfg.clone(),
            &store,
            Vocabulary::new(tokens.clone(), merges.clone()),
            Kernels::detect(),
            Some(dispatcher),
            DispatchMode::WorkStealing,
            0,
            0,
            &[],
            7,
            None,
        )
        .unwrap();
        let mut det_engine = Engine::init(
            cfg,
            &store,
            Vocabulary::new(tokens, merges),
            Kernels::detect(),
            Some(dispatcher),
            DispatchMode::Deterministic,
            0,
            0,
            &[],
            7,
            None,
        )
        .unwrap();

        let tick = crate::timer::std_host::StdTickSource::new();
        let mut ws_out = [0u32; 4];
        let mut det_out = [0u32; 4];
        ws_engine
            .generate(&[0, 1], 4, &mut ws_out, SamplingMode::Greedy, &tick, None)
            .unwrap();
        det_engine
            .generate(&[0, 1], 4, &mut det_out, SamplingMode::Greedy, &tick, None)
            .unwrap();
        assert_eq!(ws_out, det_out);
        dispatcher.shutdown();
    }

    /// Builds a `TinyModel` with room for a longer generation run than
    /// `build_engine`'s 6-token context, for scenarios that need to
    /// decode well past the first token without hitting the context limit.
    fn build_roomy_engine() -> (Vec<u8>, ModelConfig) {
        let spec = TinyModel {
            embedding_dim: 4,
            n_heads: 2,
            n_kv_heads: 1,
            head_dim: 2,
            ffn_hidden_dim: 6,
            vocab_size: 5,
            max_seq_len: 64,
        };
        let data = spec.build();
        let parsed = gguf::parse(&data).expect("parse roomy model");
        let cfg = gguf::model_config(&parsed.metadata).expect("config");
        (data, cfg)
    }

    #[test]
    fn single_token_prompt_prefill_is_cheaper_than_decode() {
        let (data, cfg) = build_roomy_engine();
        let mut engine = make_engine(&data, cfg);
        let tick = crate::timer::std_host::StdTickSource::new();

        let mut out = [0u32; 20];
        let report = engine
            .generate(&[0], 20, &mut out, SamplingMode::Greedy, &tick, None)
            .expect("generate");
        assert_eq!(report.tokens_generated, 20);
        assert_eq!(report.stop_reason, StopReason::MaxTokens);
        assert!(report.timing.prefill_us <= report.timing.decode_total_us);
        assert!(report.timing.first_token_us >= report.timing.prefill_us);
    }

    #[test]
    fn deterministic_mode_is_repeatable_across_runs() {
        let (data, cfg) = build_roomy_engine();
        let tick = crate::timer::std_host::StdTickSource::new();

        let mut runs: Vec<[u32; 20]> = Vec::new();
        for _ in 0..3 {
            let mut engine = make_engine(&data, cfg.clone());
            let mut out = [0u32; 20];
            engine
                .generate(&[0], 20, &mut out, SamplingMode::Greedy, &tick, None)
                .expect("generate");
            runs.push(out);
        }
        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[1], runs[2]);
    }

    /// Drives `generate` well past a configured sliding window's length —
    /// the scenario where `compute_attention` used to unconditionally
    /// query evicted positions and abort the whole call with
    /// `NotInitialized` the instant `pos` reached the window.
    #[test]
    fn generate_completes_past_configured_sliding_window() {
        let (data, cfg) = build_roomy_engine();
        let window = 4usize;
        let mut engine = make_engine_with_window(&data, cfg, window);
        let tick = crate::timer::std_host::StdTickSource::new();

        let mut out = [0u32; 20];
        let report = engine
            .generate(&[0, 1, 2], 20, &mut out, SamplingMode::Greedy, &tick, None)
            .expect("generate should not abort once positions fall outside the window");
        assert_eq!(report.tokens_generated, 20);
        assert_eq!(report.stop_reason, StopReason::MaxTokens);

        // Well past the window: the oldest prompt positions have been
        // evicted from the KV cache multiple times over by now.
        assert!(engine.kv_cache_stats().evictions > 0);
    }

    #[test]
    fn rope_is_identity_at_position_zero() {
        let mut v = [1.0f32, 2.0, 3.0, 4.0];
        apply_rope(&mut v, 1, 4, 0, 10000.0);
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn quant_kind_tag_zero_is_f32() {
        assert_eq!(QuantKind::from_gguf_tag(0), Some(QuantKind::F32));
    }
}
