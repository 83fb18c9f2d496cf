//! Greedy longest-vocab-match prompt encoder.
//!
//! `embodios-core` is deliberately detokenize-only (`tokens[]`/`merges[]`
//! are parser outputs, not an encoder contract); the REPL still needs
//! *some* way to turn a typed prompt into `prompt_ids[]`. This is not a
//! real BPE encoder — no merge-rule ordering is applied — just a greedy
//! longest-match over the raw piece table, falling back to per-byte
//! `<0xXX>` tokens for anything unmatched. Good enough to drive the
//! harness; a real encoder is out of scope for this crate, which only
//! ever hands the core already-tokenized ids.

use std::collections::HashMap;

use embodios_core::Vocabulary;

pub struct GreedyEncoder {
    /// Display-form piece (space-marker unescaped) -> token id, longest
    /// pieces first so the greedy scan prefers them.
    by_piece: Vec<(String, u32)>,
    byte_fallback: HashMap<u8, u32>,
}

impl GreedyEncoder {
    pub fn build(vocab: &Vocabulary) -> Self {
        let mut by_piece = Vec::new();
        let mut byte_fallback = HashMap::new();

        for (id, raw) in vocab.pieces().iter().enumerate() {
            if let Some(byte) = parse_byte_fallback(raw) {
                byte_fallback.insert(byte, id as u32);
                continue;
            }
            let display: String = raw.chars().map(|c| if c == '\u{2581}' { ' ' } else { c }).collect();
            if !display.is_empty() {
                by_piece.push((display, id as u32));
            }
        }
        by_piece.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        GreedyEncoder { by_piece, byte_fallback }
    }

    /// Encodes `text` (prefixed with a leading space, the SentencePiece
    /// convention, so the first word can match a `"▁word"` piece) greedily:
    /// at each position, take the longest vocabulary piece that matches:
    /// otherwise fall back to the UTF-8 byte's `<0xXX>` token if present,
    /// otherwise skip the byte.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let prefixed = format!(" {text}");
        let bytes = prefixed.as_bytes();
        let mut ids = Vec::new();
        let mut pos = 0usize;

        'outer: while pos < bytes.len() {
            for (piece, id) in &self.by_piece {
                let plen = piece.len();
                // Byte-slice comparison, not `&prefixed[pos..pos+plen]`: once a
                // byte-fallback step has advanced `pos` by one raw byte, `pos`
                // may sit mid-codepoint, and string slicing panics on a
                // non-char-boundary index where byte comparison does not.
                if pos + plen <= bytes.len() && &bytes[pos..pos + plen] == piece.as_bytes() {
                    ids.push(*id);
                    pos += plen;
                    continue 'outer;
                }
            }
            if let Some(id) = self.byte_fallback.get(&bytes[pos]) {
                ids.push(*id);
            }
            pos += 1;
        }
        ids
    }
}

fn parse_byte_fallback(piece: &str) -> Option<u8> {
    let inner = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if inner.len() != 2 {
        return None;
    }
    u8::from_str_radix(inner, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab_with(pieces: &[&str]) -> Vocabulary {
        Vocabulary::new(pieces.iter().map(|s| s.to_string()).collect(), Vec::new())
    }

    #[test]
    fn greedy_prefers_longer_pieces() {
        let vocab = vocab_with(&["\u{2581}the", "\u{2581}t", "h", "e"]);
        let enc = GreedyEncoder::build(&vocab);
        let ids = enc.encode("the");
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn falls_back_to_byte_tokens() {
        let vocab = vocab_with(&["<0x78>"]); // 'x'
        let enc = GreedyEncoder::build(&vocab);
        let ids = enc.encode("x");
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn multibyte_utf8_does_not_panic_without_byte_fallback() {
        // No byte-fallback tokens registered for the individual bytes of
        // "é" (0xC3 0xA9) or "日" (0xE6 0x97 0xA5) — every byte is skipped
        // one at a time, which used to misalign `pos` mid-codepoint and
        // panic on the next string-slice comparison.
        let vocab = vocab_with(&["\u{2581}hi"]);
        let enc = GreedyEncoder::build(&vocab);
        let _ids = enc.encode("héllo 日本語");
    }
}
