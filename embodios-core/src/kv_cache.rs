//! Per-layer key/value cache: fixed-size ring buffers indexed by position,
//! FIFO sliding-window eviction, no LRU.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Clone, Copy)]
pub struct KvCacheStats {
    pub stores: u64,
    pub reads: u64,
    pub evictions: u64,
}

struct LayerRing {
    k: Vec<f32>,
    v: Vec<f32>,
    /// Logical position currently occupying each ring slot, or `None` if
    /// the slot has never been written. A slot can be written but hold a
    /// position other than the one being queried once the window has
    /// wrapped — a plain written-bit per slot can't tell an evicted
    /// position apart from the one that evicted it, since both map to the
    /// same slot. Tracking the actual position closes that gap.
    slot_pos: Vec<Option<usize>>,
}

impl LayerRing {
    fn new(window: usize, kv_dim: usize) -> Self {
        LayerRing {
            k: vec![0.0; window * kv_dim],
            v: vec![0.0; window * kv_dim],
            slot_pos: vec![None; window],
        }
    }
}

/// Per-layer ring buffers for the whole model. `max_seq_len` acts as the
/// window size when no sliding window is configured; `store`/`get_*` take
/// the true, unwrapped position and wrap internally.
pub struct KvCache {
    layers: Vec<LayerRing>,
    window: usize,
    sliding_window: usize,
    kv_dim: usize,
    stats: KvCacheStats,
}

impl KvCache {
    /// `sliding_window == 0` disables windowing (the cache simply covers
    /// the whole context up to `max_seq_len`).
    pub fn new(n_layers: usize, max_seq_len: usize, kv_dim: usize, sliding_window: usize) -> Self {
        let window = if sliding_window > 0 {
            sliding_window
        } else {
            max_seq_len
        };
        let layers = (0..n_layers).map(|_| LayerRing::new(window, kv_dim)).collect();
        KvCache {
            layers,
            window,
            sliding_window,
            kv_dim,
            stats: KvCacheStats::default(),
        }
    }

    pub fn stats(&self) -> KvCacheStats {
        self.stats
    }

    fn slot(&self, pos: usize) -> usize {
        pos % self.window
    }

    /// Writes `(k, v)` at slot `pos mod window` for `layer`. Evicts
    /// (silently overwrites, FIFO) whatever occupied that slot before.
    pub fn store(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) -> EngineResult<()> {
        let ring = self.layers.get_mut(layer).ok_or(EngineError::InvalidTokenId)?;
        if k.len() != self.kv_dim || v.len() != self.kv_dim {
            return Err(EngineError::BufferTooSmall);
        }
        let slot = pos % self.window;
        let was_occupied = ring.slot_pos[slot].is_some();
        let off = slot * self.kv_dim;
        ring.k[off..off + self.kv_dim].copy_from_slice(k);
        ring.v[off..off + self.kv_dim].copy_from_slice(v);
        ring.slot_pos[slot] = Some(pos);

        self.stats.stores += 1;
        if was_occupied {
            self.stats.evictions += 1;
        }
        Ok(())
    }

    /// One KV pair at a specific (layer, logical position). The attention
    /// step calls this once per past position in its causal loop — the
    /// ring buffer's physical layout is wrap-around, so there is no single
    /// contiguous slice covering an arbitrary `0..=pos` range once the
    /// window has wrapped. Returns `NotInitialized` both when the slot has
    /// never been written and when it now holds a different (more recent)
    /// position — the FIFO eviction case spec §8 property 7 requires.
    pub fn get_pair_at(&mut self, layer: usize, pos: usize) -> EngineResult<(&[f32], &[f32])> {
        let ring = self.layers.get(layer).ok_or(EngineError::InvalidTokenId)?;
        let slot = self.slot(pos);
        if ring.slot_pos[slot] != Some(pos) {
            return Err(EngineError::NotInitialized);
        }
        self.stats.reads += 1;
        let ring = &self.layers[layer];
        let off = slot * self.kv_dim;
        Ok((&ring.k[off..off + self.kv_dim], &ring.v[off..off + self.kv_dim]))
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn sliding_window(&self) -> usize {
        self.sliding_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_read_round_trips() {
        let mut cache = KvCache::new(2, 16, 4, 0);
        let k = [1.0, 2.0, 3.0, 4.0];
        let v = [5.0, 6.0, 7.0, 8.0];
        cache.store(0, 0, &k, &v).unwrap();
        let (rk, rv) = cache.get_pair_at(0, 0).unwrap();
        assert_eq!(rk, &k);
        assert_eq!(rv, &v);
    }

    #[test]
    fn read_before_write_is_not_initialized() {
        let mut cache = KvCache::new(1, 8, 4, 0);
        assert_eq!(
            cache.get_pair_at(0, 0).unwrap_err(),
            EngineError::NotInitialized
        );
    }

    #[test]
    fn sliding_window_evicts_fifo() {
        let mut cache = KvCache::new(1, 100, 2, 4);
        for p in 0..4 {
            cache.store(0, p, &[p as f32, p as f32], &[p as f32, p as f32]).unwrap();
        }
        assert_eq!(cache.stats().evictions, 0);
        // position 4 reuses slot 0, evicting position 0.
        cache.store(0, 4, &[9.0, 9.0], &[9.0, 9.0]).unwrap();
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(
            cache.get_pair_at(0, 0).unwrap_err(),
            EngineError::NotInitialized
        );
        let (k, _) = cache.get_pair_at(0, 4).unwrap();
        assert_eq!(k, &[9.0, 9.0]);
    }

    #[test]
    fn invalid_layer_index_errors() {
        let mut cache = KvCache::new(1, 8, 4, 0);
        assert_eq!(
            cache.store(5, 0, &[0.0; 4], &[0.0; 4]).unwrap_err(),
            EngineError::InvalidTokenId
        );
    }
}
