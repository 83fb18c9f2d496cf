//! Detokenizer: maps a token id back to UTF-8 bytes using the GGUF
//! vocabulary table.
//!
//! Encoding (text → token ids) is not part of this core: `generate`
//! takes `prompt_ids[]` already tokenized, and only the vocabulary/merge
//! *keys* the parser consults are named here, not a BPE encoder.
//! `tokenizer.ggml.merges` is retained on the directory (for a caller
//! that wants to build its own encoder against the same vocab) but this
//! module's own job is strictly id → bytes.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{EngineError, EngineResult};

/// Owns the decoded vocabulary (`tokenizer.ggml.tokens`) and merge list
/// (`tokenizer.ggml.merges`, carried for callers building an encoder —
/// unused by `detokenize` itself).
pub struct Vocabulary {
    tokens: Vec<String>,
    #[allow(dead_code)]
    merges: Vec<String>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>, merges: Vec<String>) -> Self {
        Vocabulary { tokens, merges }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Every raw vocabulary piece, indexed by token id. Exposed for callers
    /// that build their own encoder against this vocabulary — `tokens[]`/
    /// `merges[]` are parser outputs, with no encoder mandated inside
    /// this core.
    pub fn pieces(&self) -> &[String] {
        &self.tokens
    }

    /// The raw vocabulary piece for `id` (before space-marker/byte-fallback
    /// unescaping), e.g. `"▁the"` or `"<0x0A>"`.
    pub fn piece(&self, id: u32) -> EngineResult<&str> {
        self.tokens
            .get(id as usize)
            .map(|s| s.as_str())
            .ok_or(EngineError::InvalidTokenId)
    }

    /// Decodes one token id to its display bytes: GGUF/SentencePiece's
    /// `"▁"` word-boundary marker becomes a literal space, and llama.cpp's
    /// `"<0xXX>"` byte-fallback pieces become the single raw byte they
    /// name. Anything else passes through unchanged. Writes UTF-8 bytes
    /// into `out`, returning the number of bytes written.
    pub fn decode_into(&self, id: u32, out: &mut [u8]) -> EngineResult<usize> {
        let piece = self.piece(id)?;

        if let Some(byte) = byte_fallback(piece) {
            if out.is_empty() {
                return Err(EngineError::BufferTooSmall);
            }
            out[0] = byte;
            return Ok(1);
        }

        let mut written = 0;
        for ch in piece.chars() {
            let c = if ch == '\u{2581}' { ' ' } else { ch };
            let len = c.len_utf8();
            if written + len > out.len() {
                return Err(EngineError::BufferTooSmall);
            }
            c.encode_utf8(&mut out[written..written + len]);
            written += len;
        }
        Ok(written)
    }
}

/// `"<0x4A>"` → `Some(0x4A)`. llama.cpp byte-fallback tokens encode a
/// single raw byte the SentencePiece vocab couldn't otherwise name (used
/// for arbitrary binary/non-UTF-8-boundary bytes).
fn byte_fallback(piece: &str) -> Option<u8> {
    let inner = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if inner.len() != 2 {
        return None;
    }
    u8::from_str_radix(inner, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn space_marker_becomes_space() {
        let vocab = Vocabulary::new(vec![String::from("\u{2581}the")], vec![]);
        let mut out = [0u8; 8];
        let n = vocab.decode_into(0, &mut out).unwrap();
        assert_eq!(&out[..n], b" the");
    }

    #[test]
    fn byte_fallback_decodes_hex() {
        let vocab = Vocabulary::new(vec![String::from("<0x0A>")], vec![]);
        let mut out = [0u8; 1];
        let n = vocab.decode_into(0, &mut out).unwrap();
        assert_eq!(&out[..n], b"\n");
    }

    #[test]
    fn plain_piece_passes_through() {
        let vocab = Vocabulary::new(vec![String::from("hello")], vec![]);
        let mut out = [0u8; 8];
        let n = vocab.decode_into(0, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn invalid_id_errors() {
        let vocab = Vocabulary::new(vec![String::from("a")], vec![]);
        let mut out = [0u8; 8];
        assert_eq!(
            vocab.decode_into(5, &mut out).unwrap_err(),
            EngineError::InvalidTokenId
        );
    }

    #[test]
    fn buffer_too_small_errors() {
        let vocab = Vocabulary::new(vec![String::from("hello")], vec![]);
        let mut out = [0u8; 2];
        assert_eq!(
            vocab.decode_into(0, &mut out).unwrap_err(),
            EngineError::BufferTooSmall
        );
    }
}
