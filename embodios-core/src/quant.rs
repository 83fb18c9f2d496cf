//! Quantized weight store.
//!
//! Wraps the raw weight blob (the byte range starting at
//! `GgufFile::blob_origin`) together with the tensor directory, and hands
//! out bounds-checked byte slices per tensor. No copying: the blob is
//! borrowed for the engine's whole lifetime, exactly like the tensor
//! directory's name strings are owned up front at load time.

use alloc::vec::Vec;

use crate::config::QuantKind;
use crate::error::{EngineError, EngineResult};
use crate::gguf::{TensorDescriptor, TensorDirectory, TensorId};

/// Raw per-block layouts, named the way llama.cpp/ggml names them. These
/// are read-only views constructed over slices of the weight blob; they
/// exist so `kernels::dequant` has a typed handle instead of doing its own
/// byte arithmetic at every call site.
pub mod block {
    /// `Q4_0`: 32 4-bit signed-ish nibbles sharing one `f16` delta.
    pub struct Q4_0<'a> {
        pub delta: &'a [u8; 2],
        pub nibbles: &'a [u8; 16],
    }

    /// `Q8_0`: 32 signed bytes sharing one `f16` delta.
    pub struct Q8_0<'a> {
        pub delta: &'a [u8; 2],
        pub quants: &'a [u8; 32],
    }

    /// `Q4_K`: 256-element super-block, 8 sub-blocks of 32, 6-bit scale and
    /// min pairs packed into 12 bytes, plus 2 f16 super-block scale/min.
    pub struct Q4K<'a> {
        pub raw: &'a [u8; 144],
    }

    /// `Q5_K`: 256-element super-block with an extra high-bit plane.
    pub struct Q5K<'a> {
        pub raw: &'a [u8; 176],
    }

    /// `Q6_K`: 256-element super-block, no separate min (symmetric).
    pub struct Q6K<'a> {
        pub raw: &'a [u8; 210],
    }
}

/// Borrowed, bounds-checked view of one tensor's bytes inside the weight
/// blob. `Copy` so kernel dispatch can hand a by-value copy into a
/// `parallel_for` work-item context without fighting the borrow checker
/// over a long-lived reference.
#[derive(Clone, Copy)]
pub struct TensorView<'a> {
    pub kind: QuantKind,
    pub dims: [u64; 4],
    pub n_dims: usize,
    pub bytes: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn element_count(&self) -> usize {
        self.dims[..self.n_dims].iter().product::<u64>() as usize
    }

    pub fn block_count(&self) -> usize {
        self.element_count() / self.kind.block_elems()
    }

    /// The `i`-th block's raw bytes, for quant kinds with a fixed block
    /// byte size.
    pub fn block_bytes(&self, i: usize) -> EngineResult<&'a [u8]> {
        let stride = self.kind.block_bytes();
        let start = i
            .checked_mul(stride)
            .ok_or(EngineError::NumericOverflow)?;
        let end = start.checked_add(stride).ok_or(EngineError::NumericOverflow)?;
        self.bytes.get(start..end).ok_or(EngineError::BufferTooSmall)
    }

    /// A sub-view covering rows `[row_start, row_end)` of a row-major
    /// matrix with `n_cols` columns, for handing a single row (or a
    /// contiguous row range) to a kernel as if it were the whole tensor —
    /// used to fan matmul out across workers one row-chunk at a time
    /// without reshaping `dims`, since every kernel only ever indexes
    /// `bytes` by row/block offset, never by `dims`.
    pub fn row_slice(&self, row_start: usize, row_end: usize, n_cols: usize) -> EngineResult<TensorView<'a>> {
        let block_elems = self.kind.block_elems();
        let blocks_per_row = n_cols / block_elems;
        let stride = blocks_per_row
            .checked_mul(self.kind.block_bytes())
            .ok_or(EngineError::NumericOverflow)?;
        let start = row_start.checked_mul(stride).ok_or(EngineError::NumericOverflow)?;
        let end = row_end.checked_mul(stride).ok_or(EngineError::NumericOverflow)?;
        let bytes = self.bytes.get(start..end).ok_or(EngineError::BufferTooSmall)?;
        Ok(TensorView {
            kind: self.kind,
            dims: self.dims,
            n_dims: self.n_dims,
            bytes,
        })
    }
}

/// Owns the tensor directory and borrows the weight blob; the single
/// entry point engine code uses to resolve a tensor name to bytes.
pub struct WeightStore<'a> {
    directory: TensorDirectory,
    blob: &'a [u8],
}

impl<'a> WeightStore<'a> {
    pub fn new(directory: TensorDirectory, blob: &'a [u8]) -> Self {
        WeightStore { directory, blob }
    }

    pub fn directory(&self) -> &TensorDirectory {
        &self.directory
    }

    pub fn view(&self, id: TensorId) -> EngineResult<TensorView<'a>> {
        let desc: &TensorDescriptor = self.directory.get(id);
        self.view_of(desc)
    }

    pub fn view_by_name(&self, name: &str) -> EngineResult<TensorView<'a>> {
        let id = self
            .directory
            .find(name)
            .ok_or(EngineError::MissingMetadata("tensor not found"))?;
        self.view(id)
    }

    fn view_of(&self, desc: &TensorDescriptor) -> EngineResult<TensorView<'a>> {
        let start = desc.offset as usize;
        let end = start
            .checked_add(desc.byte_size as usize)
            .ok_or(EngineError::NumericOverflow)?;
        let bytes = self
            .blob
            .get(start..end)
            .ok_or(EngineError::BufferTooSmall)?;
        Ok(TensorView {
            kind: desc.kind,
            dims: desc.dims,
            n_dims: desc.n_dims,
            bytes,
        })
    }

    /// Resolves every tensor name in `names`, in order, failing on the
    /// first miss. Used by the engine at init time to bind all per-layer
    /// weight tensors up front rather than re-resolving names on every
    /// forward pass.
    pub fn resolve_all(&self, names: &[&str]) -> EngineResult<Vec<TensorView<'a>>> {
        names.iter().map(|n| self.view_by_name(n)).collect()
    }
}
