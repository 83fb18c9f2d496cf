//! Dequantization & matmul kernel dispatch.
//!
//! One `Kernels` table is built once (`Kernels::detect`) at engine init and
//! held for the engine's lifetime — the matmul hot loop never branches on
//! CPU features per call, it just calls through the function pointer
//! chosen at detect time. The scalar forms in `scalar` are the reference:
//! every SIMD form must agree with them to within the per-kind error bound
//! checked in this module's tests.

pub mod scalar;

#[cfg(all(target_arch = "x86_64", feature = "simd"))]
mod simd_x86;
#[cfg(all(target_arch = "aarch64", feature = "simd"))]
mod simd_aarch64;

use crate::config::QuantKind;
use crate::quant::TensorView;

type MatvecFn = fn(&TensorView, &[f32], usize, usize, &mut [f32]);

/// Which vectorized backend matvec calls were routed to, for `summary()`
/// reporting by the repl harness and for the "downgrade silently, log
/// once" feature-detect-failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Scalar,
    Sse2,
    Avx2,
    Neon,
}

/// Function-pointer dispatch table, chosen once per process.
pub struct Kernels {
    backend: Backend,
    f32_matvec: MatvecFn,
    q8_0_matvec: Option<MatvecFn>,
}

fn scalar_matvec(view: &TensorView, x: &[f32], n_rows: usize, n_cols: usize, out: &mut [f32]) {
    scalar::matvec(view, x, n_rows, n_cols, out)
}

impl Kernels {
    /// Probe CPU features once and build the dispatch table. Cheap enough
    /// to call at `Engine::init` without caching externally.
    pub fn detect() -> Self {
        #[cfg(all(target_arch = "x86_64", feature = "simd"))]
        {
            if simd_x86::has_avx2() {
                return Kernels {
                    backend: Backend::Avx2,
                    f32_matvec: simd_x86::matvec_f32_avx2,
                    q8_0_matvec: Some(simd_x86::matvec_q8_0_sse2),
                };
            }
            if simd_x86::has_sse2() {
                return Kernels {
                    backend: Backend::Sse2,
                    f32_matvec: simd_x86::matvec_f32_sse2,
                    q8_0_matvec: Some(simd_x86::matvec_q8_0_sse2),
                };
            }
        }
        #[cfg(all(target_arch = "aarch64", feature = "simd"))]
        {
            return Kernels {
                backend: Backend::Neon,
                f32_matvec: simd_aarch64::matvec_f32_neon,
                q8_0_matvec: Some(simd_aarch64::matvec_q8_0_neon),
            };
        }
        Kernels {
            backend: Backend::Scalar,
            f32_matvec: scalar_matvec,
            q8_0_matvec: None,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Matrix–vector product dispatched by quant kind. `F32` and `Q8_0`
    /// get the registered SIMD path when one exists; every other kind
    /// falls back to the scalar reference (block unpacking for `Q4_K` /
    /// `Q5_K` / `Q6_K` isn't worth hand-vectorizing at this model scale).
    pub fn matvec(&self, view: &TensorView, x: &[f32], n_rows: usize, n_cols: usize, out: &mut [f32]) {
        match view.kind {
            QuantKind::F32 => (self.f32_matvec)(view, x, n_rows, n_cols, out),
            QuantKind::Q8_0 => match self.q8_0_matvec {
                Some(f) => f(view, x, n_rows, n_cols, out),
                None => scalar_matvec(view, x, n_rows, n_cols, out),
            },
            _ => scalar_matvec(view, x, n_rows, n_cols, out),
        }
    }
}

impl Default for Kernels {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::TensorView;

    fn make_f32_view(rows: usize, cols: usize, data: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let _ = rows * cols;
        bytes
    }

    #[test]
    fn simd_matches_scalar_within_error_bound_f32() {
        let rows = 3;
        let cols = 17;
        let weights: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.37).sin()).collect();
        let x: Vec<f32> = (0..cols).map(|i| (i as f32 * 1.3).cos()).collect();
        let bytes = make_f32_view(rows, cols, &weights);
        let view = TensorView {
            kind: QuantKind::F32,
            dims: [rows as u64, cols as u64, 1, 1],
            n_dims: 2,
            bytes: &bytes,
        };

        let mut scalar_out = vec![0f32; rows];
        scalar::matvec(&view, &x, rows, cols, &mut scalar_out);

        let kernels = Kernels::detect();
        let mut simd_out = vec![0f32; rows];
        kernels.matvec(&view, &x, rows, cols, &mut simd_out);

        for (s, v) in scalar_out.iter().zip(simd_out.iter()) {
            let rel = (s - v).abs() / s.abs().max(1.0);
            assert!(rel <= 2f32.powi(-18), "scalar={s} simd={v} rel={rel}");
        }
    }
}
