//! Model configuration.

/// Quantization kind of a tensor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    F32,
    F16,
    Q4_0,
    Q8_0,
    Q4K,
    Q5K,
    Q6K,
}

impl QuantKind {
    /// Elements per quantization block.
    pub const fn block_elems(self) -> usize {
        match self {
            QuantKind::F32 | QuantKind::F16 => 1,
            QuantKind::Q4_0 | QuantKind::Q8_0 => 32,
            QuantKind::Q4K | QuantKind::Q5K | QuantKind::Q6K => 256,
        }
    }

    /// Bytes per quantization block.
    pub const fn block_bytes(self) -> usize {
        match self {
            QuantKind::F32 => 4,
            QuantKind::F16 => 2,
            QuantKind::Q4_0 => 18,
            QuantKind::Q8_0 => 34,
            QuantKind::Q4K => 144,
            QuantKind::Q5K => 176,
            // llama.cpp's Q6_K layout: 16 sub-blocks of 16 elements each,
            // 128 low nibble bytes + 64 high-bit bytes + 16 byte-scales,
            // plus one f16 super-block delta = 210 bytes.
            QuantKind::Q6K => 210,
        }
    }

    pub fn from_gguf_tag(tag: u32) -> Option<Self> {
        // GGML ggml_type tag values for the kinds this core supports.
        match tag {
            0 => Some(QuantKind::F32),
            1 => Some(QuantKind::F16),
            2 => Some(QuantKind::Q4_0),
            8 => Some(QuantKind::Q8_0),
            12 => Some(QuantKind::Q4K),
            13 => Some(QuantKind::Q5K),
            14 => Some(QuantKind::Q6K),
            _ => None,
        }
    }
}

/// Immutable, parsed model configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub ffn_hidden_dim: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
    pub bos_id: u32,
    pub eos_id: u32,
}

impl ModelConfig {
    /// `kv_dim = n_kv_heads * head_dim`.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// `n_heads / n_kv_heads` — the GQA group size each KV head serves.
    pub fn gqa_group_size(&self) -> usize {
        debug_assert!(self.n_heads >= self.n_kv_heads && self.n_heads % self.n_kv_heads == 0);
        self.n_heads / self.n_kv_heads
    }

    /// Sanity-check invariants a loader must uphold before handing this
    /// config to `Engine::init`.
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        use crate::error::EngineError;
        if self.n_heads == 0 || self.n_kv_heads == 0 || self.n_kv_heads > self.n_heads {
            return Err(EngineError::MalformedTensor);
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(EngineError::MalformedTensor);
        }
        if self.head_dim * self.n_heads != self.embedding_dim {
            return Err(EngineError::MalformedTensor);
        }
        if self.max_seq_len == 0 || self.vocab_size == 0 || self.n_layers == 0 {
            return Err(EngineError::MalformedTensor);
        }
        Ok(())
    }
}
