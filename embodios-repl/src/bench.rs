//! The fixed benchmark scenario: a constant prompt, greedy decode, a
//! timing table, PASS/FAIL against a tokens/second floor.

use embodios_core::timer::std_host::StdTickSource;
use embodios_core::timer::Profiler;
use embodios_core::{Engine, SamplingMode};
use tracing::info;

use crate::encode::GreedyEncoder;

const BENCH_PROMPT: &str = "Once upon a time";
const BENCH_MAX_TOKENS: usize = 50;
/// Tokens/second floor a scalar-kernel debug build should clear; well
/// below what any SIMD-backed release build produces; exists so the
/// PASS/FAIL line means something rather than always printing PASS.
const BENCH_TOKENS_PER_SEC_FLOOR: f64 = 1.0;

/// One row of the printed timing table: a profiler span name with its
/// call count, total, min and max duration in microseconds.
pub struct TimingRow {
    pub name: String,
    pub calls: u64,
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

pub struct BenchReport {
    pub tokens_generated: usize,
    pub prefill_us: u64,
    pub decode_total_us: u64,
    pub first_token_us: u64,
    pub tokens_per_sec: f64,
    pub passed: bool,
    pub timing_table: Vec<TimingRow>,
}

pub fn run_bench(engine: &mut Engine, vocab_encoder: &GreedyEncoder) -> anyhow::Result<BenchReport> {
    let prompt_ids = vocab_encoder.encode(BENCH_PROMPT);
    if prompt_ids.is_empty() {
        anyhow::bail!("benchmark prompt encoded to zero tokens — vocabulary mismatch");
    }

    let tick = StdTickSource::new();
    let profiler = Profiler::new();
    profiler.set_enabled(true);
    let mut out_ids = vec![0u32; BENCH_MAX_TOKENS];
    let report = engine
        .generate(
            &prompt_ids,
            BENCH_MAX_TOKENS,
            &mut out_ids,
            SamplingMode::Greedy,
            &tick,
            Some(&profiler),
        )
        .map_err(|e| anyhow::anyhow!("generation aborted after {} tokens: {}", e.tokens_produced, e.error))?;

    let decode_secs = report.timing.decode_total_us as f64 / 1_000_000.0;
    let tokens_per_sec = if decode_secs > 0.0 {
        report.tokens_generated as f64 / decode_secs
    } else {
        0.0
    };
    let passed = tokens_per_sec >= BENCH_TOKENS_PER_SEC_FLOOR;

    info!(
        tokens = report.tokens_generated,
        prefill_us = report.timing.prefill_us,
        decode_us = report.timing.decode_total_us,
        first_token_us = report.timing.first_token_us,
        tokens_per_sec,
        passed,
        "benchmark complete"
    );

    let timing_table = profiler
        .function_summary()
        .into_iter()
        .map(|(name, total_us, calls, min_us, max_us)| TimingRow { name, calls, total_us, min_us, max_us })
        .collect();

    Ok(BenchReport {
        tokens_generated: report.tokens_generated,
        prefill_us: report.timing.prefill_us,
        decode_total_us: report.timing.decode_total_us,
        first_token_us: report.timing.first_token_us,
        tokens_per_sec,
        passed,
        timing_table,
    })
}
