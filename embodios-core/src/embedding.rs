//! Embedding cache: the token-embedding table plus an optional
//! precomputed (token + position) hot region for low positions (spec
//! §4.6). Read-only after `load_from_gguf`/precompute, shared across
//! every worker for the engine's lifetime.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::kernels::scalar::dequant_row;
use crate::quant::WeightStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddingCacheStats {
    pub lookups: u64,
    pub hot_hits: u64,
}

/// `vocab_size × embedding_dim` token table, plus an optional
/// `hot_positions × embedding_dim` table of precomputed token+position
/// sums for low positions. Owns one contiguous buffer per table — no
/// per-token heap allocations.
pub struct EmbeddingCache {
    embedding_dim: usize,
    vocab_size: usize,
    token_table: Vec<f32>,
    /// Sinusoidal or GGUF-provided position table, `max_seq_len ×
    /// embedding_dim`; always present (synthesized when the GGUF carries
    /// no position-embedding tensor) since RoPE handles relative rotation
    /// separately and this table exists purely to serve the hot-region
    /// precompute path below.
    position_table: Vec<f32>,
    hot_positions: usize,
    hot_table: Vec<f32>,
    hot_valid: bool,
    stats: spin::Mutex<EmbeddingCacheStats>,
}

impl EmbeddingCache {
    /// Allocates the token table and, if `hot_positions > 0`, the hot
    /// combined table. Tables start zeroed; `load_from_gguf` fills the
    /// token table, `precompute_hot` fills the hot region.
    pub fn init(config: &ModelConfig, hot_positions: usize) -> Self {
        let embedding_dim = config.embedding_dim;
        let vocab_size = config.vocab_size;
        EmbeddingCache {
            embedding_dim,
            vocab_size,
            token_table: vec![0.0; vocab_size * embedding_dim],
            position_table: vec![0.0; config.max_seq_len * embedding_dim],
            hot_positions,
            hot_table: vec![0.0; hot_positions * embedding_dim],
            hot_valid: false,
            stats: spin::Mutex::new(EmbeddingCacheStats::default()),
        }
    }

    /// Copies `token_embd.weight` out of the weight store into the token
    /// table, dequantizing row by row (a one-time load cost, unlike the
    /// block-resident matmul kernels). If the GGUF carries a learned
    /// position-embedding tensor (`position_embd.weight`) that is copied
    /// too; otherwise the position table is synthesized sinusoidally.
    pub fn load_from_gguf(&mut self, store: &WeightStore) -> EngineResult<()> {
        let view = store.view_by_name("token_embd.weight")?;
        if view.element_count() != self.token_table.len() {
            return Err(EngineError::MalformedTensor);
        }
        dequant_row(&view, &mut self.token_table);

        match store.view_by_name("position_embd.weight") {
            Ok(view) if view.element_count() == self.position_table.len() => {
                dequant_row(&view, &mut self.position_table);
            }
            _ => synthesize_sinusoidal(&mut self.position_table, self.embedding_dim),
        }
        Ok(())
    }

    /// Precomputes `token + position` for every token id at positions
    /// `0..hot_positions`, so `lookup` can return it directly instead of
    /// adding on every call. Must be re-run (or skipped) if the caller
    /// wants a different hot window; there is no incremental update.
    pub fn precompute_hot(&mut self, token_ids: &[u32]) {
        if self.hot_positions == 0 {
            return;
        }
        for (pos, &tok) in token_ids.iter().enumerate().take(self.hot_positions) {
            let tok = tok as usize;
            if tok >= self.vocab_size {
                continue;
            }
            let tok_off = tok * self.embedding_dim;
            let pos_off = pos * self.embedding_dim;
            let hot_off = pos * self.embedding_dim;
            for i in 0..self.embedding_dim {
                self.hot_table[hot_off + i] =
                    self.token_table[tok_off + i] + self.position_table[pos_off + i];
            }
        }
        self.hot_valid = true;
    }

    /// Copies the token embedding for `token_id` into `out` then adds the
    /// position embedding for `position`; when `position < hot_positions`
    /// and the hot table has been precomputed (and matches this
    /// `token_id` — callers only precompute for the exact token sequence
    /// they're about to decode), the combined value is returned directly.
    /// Guarantees byte-identical-within-1-ULP output to the direct sum
    /// either way.
    pub fn lookup(&self, token_id: u32, position: usize, out: &mut [f32]) -> EngineResult<()> {
        if token_id as usize >= self.vocab_size {
            return Err(EngineError::InvalidTokenId);
        }
        if out.len() != self.embedding_dim {
            return Err(EngineError::BufferTooSmall);
        }

        let mut stats = self.stats.lock();
        stats.lookups += 1;
        let use_hot = self.hot_valid && position < self.hot_positions;
        if use_hot {
            stats.hot_hits += 1;
        }
        drop(stats);

        if use_hot {
            let off = position * self.embedding_dim;
            out.copy_from_slice(&self.hot_table[off..off + self.embedding_dim]);
            return Ok(());
        }

        let tok_off = token_id as usize * self.embedding_dim;
        out.copy_from_slice(&self.token_table[tok_off..tok_off + self.embedding_dim]);
        if position < self.position_table.len() / self.embedding_dim {
            let pos_off = position * self.embedding_dim;
            for (o, p) in out.iter_mut().zip(&self.position_table[pos_off..pos_off + self.embedding_dim]) {
                *o += *p;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        *self.stats.lock()
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

/// Standard transformer sinusoidal position encoding:
/// `pe(pos, 2i) = sin(pos / 10000^(2i/d))`, `pe(pos, 2i+1) = cos(...)`.
/// Used only as a fallback when the GGUF carries no learned
/// position-embedding tensor (most llama.cpp-family models rely on RoPE
/// alone and never ship one).
fn synthesize_sinusoidal(table: &mut [f32], embedding_dim: usize) {
    let max_seq_len = table.len() / embedding_dim;
    for pos in 0..max_seq_len {
        let row = &mut table[pos * embedding_dim..(pos + 1) * embedding_dim];
        let mut i = 0;
        while i + 1 < embedding_dim {
            let exponent = (2 * (i / 2)) as f32 / embedding_dim as f32;
            let denom = libm::powf(10000.0, exponent);
            let angle = pos as f32 / denom;
            row[i] = libm::sinf(angle);
            row[i + 1] = libm::cosf(angle);
            i += 2;
        }
        if embedding_dim % 2 == 1 {
            row[embedding_dim - 1] = 0.0;
        }
    }
}
