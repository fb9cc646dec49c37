//! Copies `f64` vectors between native memory and Rust-owned buffers.
//!
//! Native buffers are never borrowed across a callback: every invocation copies
//! in, hands the owned copy to Rust code, and copies the result back out.

use strum_macros::Display;

use crate::error::{LevmarError, LevmarResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BufferKind {
    #[strum(to_string = "parameter")]
    Parameters,
    #[strum(to_string = "residual")]
    Residuals,
    #[strum(to_string = "jacobian")]
    Jacobian,
}

/// A Rust-side copy of one native buffer.
#[derive(Debug, Clone)]
pub struct OwnedBuffer {
    kind: BufferKind,
    data: Vec<f64>,
}

impl OwnedBuffer {
    pub fn new(kind: BufferKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Replaces the contents with `length` cells read from `native`.
    /// Allocates only when `length` exceeds the capacity from earlier calls.
    ///
    /// # Safety
    ///
    /// `native` must be null or valid for reads of `length` doubles.
    pub unsafe fn fill_from(&mut self, native: *const f64, length: usize) -> LevmarResult<()> {
        self.data.clear();
        if length == 0 {
            return Ok(());
        }
        if native.is_null() {
            return Err(LevmarError::NullBuffer { buffer: self.kind });
        }

        self.data
            .extend_from_slice(std::slice::from_raw_parts(native, length));
        Ok(())
    }

    /// Writes the contents back into `length` native cells.
    ///
    /// # Safety
    ///
    /// `native` must be null or valid for writes of `length` doubles.
    pub unsafe fn write_to(&self, native: *mut f64, length: usize) -> LevmarResult<()> {
        if self.data.len() != length {
            return Err(LevmarError::SizeMismatch {
                buffer: self.kind,
                expected: length,
                actual: self.data.len() as i64,
            });
        }
        if length == 0 {
            return Ok(());
        }
        if native.is_null() {
            return Err(LevmarError::NullBuffer { buffer: self.kind });
        }

        std::slice::from_raw_parts_mut(native, length).copy_from_slice(&self.data);
        Ok(())
    }
}

/// Duplicates `length` native cells into a fresh buffer.
///
/// # Safety
///
/// See [`OwnedBuffer::fill_from`].
pub unsafe fn copy_in(
    kind: BufferKind,
    native: *const f64,
    length: usize,
) -> LevmarResult<OwnedBuffer> {
    let mut buffer = OwnedBuffer::new(kind);
    buffer.data.reserve_exact(length);
    buffer.fill_from(native, length)?;
    Ok(buffer)
}

/// Writes `buffer` back into `length` native cells, failing on a length mismatch.
///
/// # Safety
///
/// See [`OwnedBuffer::write_to`].
pub unsafe fn copy_out(buffer: &OwnedBuffer, native: *mut f64, length: usize) -> LevmarResult<()> {
    buffer.write_to(native, length)
}

/// Overwrites `length` native cells with NaN so the solver stops on invalid values.
///
/// # Safety
///
/// `native` must be null or valid for writes of `length` doubles.
pub(crate) unsafe fn poison(native: *mut f64, length: usize) {
    if native.is_null() || length == 0 {
        return;
    }
    std::slice::from_raw_parts_mut(native, length).fill(f64::NAN);
}

/// Call-scoped buffers reused by every callback of one solve.
#[derive(Debug)]
pub(crate) struct MarshalBuffers {
    pub(crate) params: OwnedBuffer,
    pub(crate) residuals: OwnedBuffer,
    pub(crate) jacobian: OwnedBuffer,
}

impl Default for MarshalBuffers {
    fn default() -> Self {
        Self {
            params: OwnedBuffer::new(BufferKind::Parameters),
            residuals: OwnedBuffer::new(BufferKind::Residuals),
            jacobian: OwnedBuffer::new(BufferKind::Jacobian),
        }
    }
}

impl MarshalBuffers {
    /// Drops the contents but keeps the capacity for the next solve.
    pub(crate) fn clear(&mut self) {
        self.params.data.clear();
        self.residuals.data.clear();
        self.jacobian.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn copy_out_rejects_length_mismatch() {
        let source = [1.0, 2.0, 3.0];
        let mut target = [0.0; 4];

        let buffer = unsafe { copy_in(BufferKind::Residuals, source.as_ptr(), 3) }.unwrap();
        let err = unsafe { copy_out(&buffer, target.as_mut_ptr(), 4) }.unwrap_err();

        assert_eq!(
            err,
            LevmarError::SizeMismatch {
                buffer: BufferKind::Residuals,
                expected: 4,
                actual: 3,
            }
        );
        assert_eq!(target, [0.0; 4], "failed copy_out must not touch native memory");
    }

    #[test]
    fn null_native_buffer_is_rejected() {
        let err = unsafe { copy_in(BufferKind::Parameters, std::ptr::null(), 2) }.unwrap_err();
        assert_eq!(
            err,
            LevmarError::NullBuffer {
                buffer: BufferKind::Parameters
            }
        );

        let empty = unsafe { copy_in(BufferKind::Parameters, std::ptr::null(), 0) }.unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn refill_reuses_capacity() {
        let first = [1.0; 8];
        let second = [2.0; 4];
        let mut buffer = OwnedBuffer::new(BufferKind::Jacobian);

        unsafe { buffer.fill_from(first.as_ptr(), first.len()) }.unwrap();
        let capacity = buffer.data.capacity();
        unsafe { buffer.fill_from(second.as_ptr(), second.len()) }.unwrap();

        assert_eq!(buffer.as_slice(), &second);
        assert_eq!(buffer.data.capacity(), capacity);
    }

    #[test]
    fn poison_fills_with_nan() {
        let mut target = [1.0, 2.0];
        unsafe { poison(target.as_mut_ptr(), target.len()) };
        assert!(target.iter().all(|v| v.is_nan()));

        unsafe { poison(std::ptr::null_mut(), 3) };
    }

    fn bits(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    proptest! {
        #[test]
        fn round_trip_is_bit_identical(
            (m, n) in (1usize..8).prop_flat_map(|m| (Just(m), m..24)),
            seed in proptest::collection::vec(any::<f64>(), 24 * 8),
        ) {
            for length in [m, n, n * m] {
                let original = seed[..length].to_vec();
                let mut native = original.clone();

                let buffer = unsafe { copy_in(BufferKind::Residuals, native.as_ptr(), length) }.unwrap();
                unsafe { copy_out(&buffer, native.as_mut_ptr(), length) }.unwrap();

                prop_assert_eq!(bits(&native), bits(&original));
            }
        }
    }
}
