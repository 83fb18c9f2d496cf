//! GGUF model-file parser.
//!
//! Turns a byte range (already mapped/streamed in by the caller — block
//! device I/O is left to an external collaborator) into an immutable
//! `{ModelConfig, TensorDirectory, weight_blob_origin}` triple.

mod reader;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::{ModelConfig, QuantKind};
use crate::error::{EngineError, EngineResult};
use reader::Cursor;

const MAGIC: u32 = 0x4655_4747; // "GGUF" read as little-endian u32
const BLOB_ALIGN: usize = 256;
const MAX_TENSOR_NAME_LEN: usize = 127;
const MAX_TENSOR_DIMS: usize = 4;

/// One parsed GGUF metadata value. Arrays and strings own their bytes —
/// the source mapping may be reclaimed or streamed away once `parse`
/// returns — the directory is fully owned, not borrowed.
#[derive(Debug, Clone)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::U8(v) => Some(v as u64),
            GgufValue::U16(v) => Some(v as u64),
            GgufValue::U32(v) => Some(v as u64),
            GgufValue::U64(v) => Some(v),
            GgufValue::I8(v) if v >= 0 => Some(v as u64),
            GgufValue::I16(v) if v >= 0 => Some(v as u64),
            GgufValue::I32(v) if v >= 0 => Some(v as u64),
            GgufValue::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            GgufValue::F32(v) => Some(v),
            GgufValue::F64(v) => Some(v as f32),
            _ => self.as_u64().map(|v| v as f32),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

/// Key/value metadata map, keyed by the full dotted GGUF key.
#[derive(Debug, Default)]
pub struct KvMap(BTreeMap<String, GgufValue>);

impl KvMap {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.0.get(key)
    }

    /// Look up by suffix — GGUF keys are architecture-prefixed
    /// (`llama.embedding_length`, `qwen2.embedding_length`, ...), so callers
    /// name the keys by suffix (`*.embedding_length`) and let this match
    /// whatever architecture name precedes it.
    pub fn get_suffix(&self, suffix: &str) -> Option<&GgufValue> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == suffix || k.ends_with(suffix))
            .map(|(_, v)| v)
    }

    fn require_suffix(&self, suffix: &'static str) -> EngineResult<&GgufValue> {
        self.get_suffix(suffix)
            .ok_or(EngineError::MissingMetadata(suffix))
    }
}

/// One tensor's directory entry.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub name: String,
    pub n_dims: usize,
    pub dims: [u64; MAX_TENSOR_DIMS],
    pub kind: QuantKind,
    /// Byte offset into the weight blob, relative to the 256-byte-aligned
    /// blob origin.
    pub offset: u64,
    pub byte_size: u64,
}

impl TensorDescriptor {
    pub fn element_count(&self) -> u64 {
        self.dims[..self.n_dims].iter().product()
    }
}

/// The tensor directory: an ordered list plus a name index. A flat,
/// index-based design — `TensorId` into a directory vector — rather than
/// pointer-laden, cyclic weight structs.
#[derive(Debug, Default)]
pub struct TensorDirectory {
    tensors: Vec<TensorDescriptor>,
    by_name: BTreeMap<String, TensorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl TensorDirectory {
    pub fn get(&self, id: TensorId) -> &TensorDescriptor {
        &self.tensors[id.0]
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.by_name.get(name).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&TensorDescriptor> {
        self.find(name).map(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.tensors.iter()
    }
}

/// Parsed GGUF file: metadata map, tensor directory, and the byte offset
/// (from the start of `data`) where the weight blob begins.
pub struct GgufFile {
    pub metadata: KvMap,
    pub tensors: TensorDirectory,
    pub blob_origin: usize,
}

/// Parse a GGUF byte stream: header, key/value metadata, tensor records,
/// then align to the weight blob origin.
pub fn parse(data: &[u8]) -> EngineResult<GgufFile> {
    let mut c = Cursor::new(data);

    let magic = c.read_u32()?;
    if magic != MAGIC {
        return Err(EngineError::BadMagic);
    }

    let version = c.read_u32()?;
    if version != 2 && version != 3 {
        return Err(EngineError::UnsupportedVersion(version));
    }

    let n_tensors = c.read_u64()? as usize;
    let n_kv = c.read_u64()? as usize;

    let mut metadata = BTreeMap::new();
    for _ in 0..n_kv {
        let key = read_string(&mut c)?;
        let value = read_value(&mut c)?;
        metadata.insert(key, value);
    }
    let metadata = KvMap(metadata);

    let mut tensors = Vec::with_capacity(n_tensors);
    let mut by_name = BTreeMap::new();
    for _ in 0..n_tensors {
        let desc = read_tensor_record(&mut c)?;
        let id = TensorId(tensors.len());
        by_name.insert(desc.name.clone(), id);
        tensors.push(desc);
    }

    c.align_to(BLOB_ALIGN);
    let blob_origin = c.position();

    validate_tensor_offsets(&tensors, data.len().saturating_sub(blob_origin))?;

    Ok(GgufFile {
        metadata,
        tensors: TensorDirectory { tensors, by_name },
        blob_origin,
    })
}

fn read_string(c: &mut Cursor) -> EngineResult<String> {
    let bytes = c.read_gguf_string()?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// GGUF metadata value type tags (ggml `gguf_type`).
mod type_tag {
    pub const U8: u32 = 0;
    pub const I8: u32 = 1;
    pub const U16: u32 = 2;
    pub const I16: u32 = 3;
    pub const U32: u32 = 4;
    pub const I32: u32 = 5;
    pub const F32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const U64: u32 = 10;
    pub const I64: u32 = 11;
    pub const F64: u32 = 12;
}

fn read_value_of_type(c: &mut Cursor, tag: u32) -> EngineResult<GgufValue> {
    Ok(match tag {
        type_tag::U8 => GgufValue::U8(c.read_u8()?),
        type_tag::I8 => GgufValue::I8(c.read_i8()?),
        type_tag::U16 => GgufValue::U16(c.read_u16()?),
        type_tag::I16 => GgufValue::I16(c.read_i16()?),
        type_tag::U32 => GgufValue::U32(c.read_u32()?),
        type_tag::I32 => GgufValue::I32(c.read_i32()?),
        type_tag::F32 => GgufValue::F32(c.read_f32()?),
        type_tag::BOOL => GgufValue::Bool(c.read_bool()?),
        type_tag::STRING => GgufValue::String(read_string(c)?),
        type_tag::U64 => GgufValue::U64(c.read_u64()?),
        type_tag::I64 => GgufValue::I64(c.read_i64()?),
        type_tag::F64 => GgufValue::F64(c.read_f64()?),
        type_tag::ARRAY => {
            let elem_tag = c.read_u32()?;
            let count = c.read_u64()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(read_value_of_type(c, elem_tag)?);
            }
            GgufValue::Array(items)
        }
        _ => return Err(EngineError::MalformedTensor),
    })
}

fn read_value(c: &mut Cursor) -> EngineResult<GgufValue> {
    let tag = c.read_u32()?;
    read_value_of_type(c, tag)
}

fn read_tensor_record(c: &mut Cursor) -> EngineResult<TensorDescriptor> {
    let name_len = c.read_u64()? as usize;
    if name_len > MAX_TENSOR_NAME_LEN {
        return Err(EngineError::MalformedTensor);
    }
    let name_bytes = c.read_bytes(name_len)?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let n_dims = c.read_u32()? as usize;
    if n_dims == 0 || n_dims > MAX_TENSOR_DIMS {
        return Err(EngineError::MalformedTensor);
    }
    let mut dims = [1u64; MAX_TENSOR_DIMS];
    for d in dims.iter_mut().take(n_dims) {
        *d = c.read_u64()?;
    }

    let kind_tag = c.read_u32()?;
    let kind = QuantKind::from_gguf_tag(kind_tag).ok_or(EngineError::UnsupportedQuant)?;

    let offset = c.read_u64()?;

    let elem_count: u64 = dims[..n_dims].iter().product();
    let block_elems = kind.block_elems() as u64;
    if elem_count % block_elems != 0 {
        return Err(EngineError::MalformedTensor);
    }
    let n_blocks = elem_count / block_elems;
    let byte_size = n_blocks
        .checked_mul(kind.block_bytes() as u64)
        .ok_or(EngineError::NumericOverflow)?;

    Ok(TensorDescriptor {
        name,
        n_dims,
        dims,
        kind,
        offset,
        byte_size,
    })
}

fn validate_tensor_offsets(tensors: &[TensorDescriptor], blob_len: usize) -> EngineResult<()> {
    for t in tensors {
        let end = t
            .offset
            .checked_add(t.byte_size)
            .ok_or(EngineError::NumericOverflow)?;
        if end > blob_len as u64 {
            return Err(EngineError::MalformedTensor);
        }
    }
    Ok(())
}

/// Build a `ModelConfig` from the parsed metadata map. Always derived from
/// the file's own metadata — never a hard-coded fallback to some reference
/// model's dimensions.
pub fn model_config(meta: &KvMap) -> EngineResult<ModelConfig> {
    let vocab_size = meta
        .require_suffix("vocab_size")
        .ok()
        .and_then(|v| v.as_u64())
        .or_else(|| {
            meta.get_suffix("tokenizer.ggml.tokens")
                .and_then(|v| v.as_array())
                .map(|a| a.len() as u64)
        })
        .ok_or(EngineError::MissingMetadata("*.vocab_size"))? as usize;

    let embedding_dim = meta.require_suffix("embedding_length")?.as_u64().ok_or(
        EngineError::MissingMetadata("*.embedding_length"),
    )? as usize;

    let n_layers = meta
        .require_suffix("block_count")?
        .as_u64()
        .ok_or(EngineError::MissingMetadata("*.block_count"))? as usize;

    let n_heads = meta
        .require_suffix("attention.head_count")?
        .as_u64()
        .ok_or(EngineError::MissingMetadata("*.attention.head_count"))? as usize;

    let n_kv_heads = meta
        .get_suffix("attention.head_count_kv")
        .and_then(|v| v.as_u64())
        .unwrap_or(n_heads as u64) as usize;

    let ffn_hidden_dim = meta
        .require_suffix("feed_forward_length")?
        .as_u64()
        .ok_or(EngineError::MissingMetadata("*.feed_forward_length"))?
        as usize;

    let max_seq_len = meta
        .get_suffix("context_length")
        .and_then(|v| v.as_u64())
        .unwrap_or(2048) as usize;

    let rope_theta = meta
        .get_suffix("rope.freq_base")
        .and_then(|v| v.as_f32())
        .unwrap_or(10000.0);

    let norm_eps = meta
        .get_suffix("attention.layer_norm_rms_epsilon")
        .and_then(|v| v.as_f32())
        .unwrap_or(1e-5);

    let bos_id = meta
        .get_suffix("tokenizer.ggml.bos_token_id")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32;

    let eos_id = meta
        .get_suffix("tokenizer.ggml.eos_token_id")
        .and_then(|v| v.as_u64())
        .unwrap_or(2) as u32;

    if n_heads == 0 {
        return Err(EngineError::MalformedTensor);
    }
    let head_dim = embedding_dim / n_heads;

    let cfg = ModelConfig {
        vocab_size,
        embedding_dim,
        n_layers,
        n_heads,
        n_kv_heads,
        head_dim,
        ffn_hidden_dim,
        max_seq_len,
        rope_theta,
        norm_eps,
        bos_id,
        eos_id,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Decode the tokenizer vocabulary (`tokenizer.ggml.tokens`) and BPE merge
/// list (`tokenizer.ggml.merges`) out of the metadata map, for
/// `crate::tokenizer`.
pub fn tokenizer_vocab(meta: &KvMap) -> EngineResult<(Vec<String>, Vec<String>)> {
    let tokens = meta
        .get_suffix("tokenizer.ggml.tokens")
        .and_then(|v| v.as_array())
        .ok_or(EngineError::MissingMetadata("tokenizer.ggml.tokens"))?;
    let tokens: Vec<String> = tokens
        .iter()
        .map(|v| v.as_str().unwrap_or("").to_string())
        .collect();

    let merges = meta
        .get_suffix("tokenizer.ggml.merges")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .map(|v| v.as_str().unwrap_or("").to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok((tokens, merges))
}

/// Shared GGUF byte-buffer builders, reused by `quant`'s tests so they
/// don't have to hand-roll a second minimal file.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn push_kv_u32(buf: &mut Vec<u8>, key: &str, value: u32) {
        push_str(buf, key);
        buf.extend_from_slice(&type_tag::U32.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_kv_f32(buf: &mut Vec<u8>, key: &str, value: f32) {
        push_str(buf, key);
        buf.extend_from_slice(&type_tag::F32.to_le_bytes());
        buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Builds a minimal but structurally valid GGUF v3 byte stream with one
    /// F32 tensor named `"w"` with 8 elements, for cross-module tests.
    pub(crate) fn minimal_gguf_for_quant_tests() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&6u64.to_le_bytes());

        push_kv_u32(&mut buf, "llama.embedding_length", 8);
        push_kv_u32(&mut buf, "llama.block_count", 2);
        push_kv_u32(&mut buf, "llama.attention.head_count", 2);
        push_kv_u32(&mut buf, "llama.attention.head_count_kv", 1);
        push_kv_u32(&mut buf, "llama.feed_forward_length", 16);
        push_kv_f32(&mut buf, "llama.attention.layer_norm_rms_epsilon", 1e-5);

        push_str(&mut buf, "w");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // F32
        buf.extend_from_slice(&0u64.to_le_bytes());

        let pre_blob_len = buf.len();
        let pad = (BLOB_ALIGN - pre_blob_len % BLOB_ALIGN) % BLOB_ALIGN;
        buf.extend(core::iter::repeat(0u8).take(pad));
        buf.extend(core::iter::repeat(0u8).take(32));
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    use tests_support::push_str;

    /// Builds a minimal but structurally valid GGUF v3 byte stream with one
    /// F32 tensor, for parser unit tests.
    fn minimal_gguf() -> Vec<u8> {
        tests_support::minimal_gguf_for_quant_tests()
    }

    #[test]
    fn parses_minimal_file() {
        let data = minimal_gguf();
        let parsed = parse(&data).expect("parse");
        assert_eq!(parsed.tensors.len(), 1);
        let t = parsed.tensors.get_by_name("w").unwrap();
        assert_eq!(t.byte_size, 32);
        assert_eq!(parsed.blob_origin % BLOB_ALIGN, 0);

        let cfg = model_config(&parsed.metadata).expect("config");
        assert_eq!(cfg.embedding_dim, 8);
        assert_eq!(cfg.n_layers, 2);
        assert_eq!(cfg.n_heads, 2);
        assert_eq!(cfg.n_kv_heads, 1);
        assert_eq!(cfg.head_dim, 4);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = minimal_gguf();
        data[0] = 0;
        assert_eq!(parse(&data).unwrap_err(), EngineError::BadMagic);
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut data = minimal_gguf();
        data[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(parse(&data).unwrap_err(), EngineError::UnsupportedVersion(99));
    }

    #[test]
    fn truncated_file_rejected() {
        let data = minimal_gguf();
        let truncated = &data[..data.len() / 2];
        assert!(parse(truncated).is_err());
    }

    #[test]
    fn tensor_name_too_long_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        let long_name = "x".repeat(MAX_TENSOR_NAME_LEN + 1);
        push_str(&mut buf, &long_name);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&32u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(parse(&buf).unwrap_err(), EngineError::MalformedTensor);
    }

    #[test]
    fn partial_block_element_count_rejected() {
        // Q4_0 block = 32 elements; 33 elements is a partial block and must
        // be rejected.
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        push_str(&mut buf, "w");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&33u64.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes()); // Q4_0
        buf.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(parse(&buf).unwrap_err(), EngineError::MalformedTensor);
    }

    #[test]
    fn array_values_recurse() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // n_tensors
        buf.extend_from_slice(&1u64.to_le_bytes()); // n_kv

        push_str(&mut buf, "tokenizer.ggml.tokens");
        buf.extend_from_slice(&type_tag::ARRAY.to_le_bytes());
        buf.extend_from_slice(&type_tag::STRING.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        push_str(&mut buf, "<bos>");
        push_str(&mut buf, "hi");

        let parsed = parse(&buf).expect("parse");
        let toks = parsed
            .metadata
            .get_suffix("tokenizer.ggml.tokens")
            .and_then(|v| v.as_array())
            .unwrap();
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[1].as_str(), Some("hi"));
        let _ = vec![0u8]; // keep `vec!` import used across cfg combos
    }
}
