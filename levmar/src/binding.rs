use std::any::Any;
use std::ffi::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};

use strum_macros::Display;
use tracing::{trace, warn};

use crate::context::ContextHandle;
use crate::error::{LevmarError, LevmarResult};
use crate::marshal::{poison, BufferKind, MarshalBuffers};

/// Callback computing `hx = f(p)`: `(p, hx, m, n, context)`.
pub type ResidualFn<'f> = dyn FnMut(&[f64], &mut [f64], usize, usize, Option<ContextHandle>) + 'f;

/// Callback filling the row-major `n x m` Jacobian: `(p, jac, m, n, context)`.
pub type JacobianFn<'f> = dyn FnMut(&[f64], &mut [f64], usize, usize, Option<ContextHandle>) + 'f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CallbackKind {
    #[strum(to_string = "residual")]
    Residual,
    #[strum(to_string = "jacobian")]
    Jacobian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dims {
    pub(crate) m: usize,
    pub(crate) n: usize,
}

impl Dims {
    pub(crate) fn output_len(&self, kind: CallbackKind) -> usize {
        match kind {
            CallbackKind::Residual => self.n,
            CallbackKind::Jacobian => self.n * self.m,
        }
    }
}

/// Per-solve state reachable from the trampolines while the native call runs.
pub(crate) struct CallbackBinding<'a> {
    dims: Dims,
    residual: &'a mut ResidualFn<'a>,
    jacobian: Option<&'a mut JacobianFn<'a>>,
    buffers: &'a mut MarshalBuffers,
    failure: Option<LevmarError>,
    residual_calls: usize,
    jacobian_calls: usize,
}

/// What is left of a binding after release.
#[derive(Debug)]
pub(crate) struct BindingOutcome {
    pub(crate) failure: Option<LevmarError>,
    pub(crate) residual_calls: usize,
    pub(crate) jacobian_calls: usize,
}

impl<'a> CallbackBinding<'a> {
    pub(crate) fn new(
        dims: Dims,
        residual: &'a mut ResidualFn<'a>,
        jacobian: Option<&'a mut JacobianFn<'a>>,
        buffers: &'a mut MarshalBuffers,
    ) -> Self {
        buffers.clear();
        Self {
            dims,
            residual,
            jacobian,
            buffers,
            failure: None,
            residual_calls: 0,
            jacobian_calls: 0,
        }
    }

    pub(crate) fn into_outcome(self) -> BindingOutcome {
        BindingOutcome {
            failure: self.failure,
            residual_calls: self.residual_calls,
            jacobian_calls: self.jacobian_calls,
        }
    }

    /// Runs one callback on behalf of the native solver.
    ///
    /// Failures are recorded, not returned: the native frames above cannot
    /// unwind. The output is poisoned with NaN instead so the solver stops,
    /// and later invocations skip user code entirely.
    ///
    /// # Safety
    ///
    /// `p` and `out` must be the native buffers the solver passed in, sized by
    /// the solver's own `m` and `n`.
    pub(crate) unsafe fn invoke(
        &mut self,
        kind: CallbackKind,
        p: *mut f64,
        out: *mut f64,
        m: c_int,
        n: c_int,
        adata: *mut c_void,
    ) {
        let writable = self.dims.output_len(kind).min(native_len(kind, m, n));

        if self.failure.is_some() {
            poison(out, writable);
            return;
        }

        if let Err(err) = self.marshal_and_call(kind, p, out, m, n, adata) {
            warn!(callback = %kind, error = %err, "callback failed, aborting native solve");
            self.failure = Some(err);
            poison(out, writable);
        }
    }

    unsafe fn marshal_and_call(
        &mut self,
        kind: CallbackKind,
        p: *mut f64,
        out: *mut f64,
        m: c_int,
        n: c_int,
        adata: *mut c_void,
    ) -> LevmarResult<()> {
        let Dims { m: bound_m, n: bound_n } = self.dims;
        check_dim(BufferKind::Parameters, bound_m, m)?;
        check_dim(output_kind(kind), bound_n, n)?;

        let out_len = self.dims.output_len(kind);
        let buffers = &mut *self.buffers;
        let output = match kind {
            CallbackKind::Residual => &mut buffers.residuals,
            CallbackKind::Jacobian => &mut buffers.jacobian,
        };

        buffers.params.fill_from(p, bound_m)?;
        output.fill_from(out, out_len)?;

        let context = ContextHandle::from_raw(adata);
        let params = buffers.params.as_slice();
        let result = match kind {
            CallbackKind::Residual => {
                self.residual_calls += 1;
                let callback = &mut *self.residual;
                catch_unwind(AssertUnwindSafe(|| {
                    callback(params, output.as_mut_slice(), bound_m, bound_n, context)
                }))
            }
            CallbackKind::Jacobian => {
                // Only reachable if the native routine calls a Jacobian it was never given.
                let callback = self
                    .jacobian
                    .as_deref_mut()
                    .ok_or(LevmarError::UnboundCallback { callback: kind })?;
                self.jacobian_calls += 1;
                catch_unwind(AssertUnwindSafe(|| {
                    callback(params, output.as_mut_slice(), bound_m, bound_n, context)
                }))
            }
        };

        result.map_err(|payload| LevmarError::CallbackPanicked {
            callback: kind,
            message: panic_message(payload.as_ref()),
        })?;

        trace!(callback = %kind, m = bound_m, n = bound_n, "callback marshaled");
        output.write_to(out, out_len)
    }
}

fn output_kind(kind: CallbackKind) -> BufferKind {
    match kind {
        CallbackKind::Residual => BufferKind::Residuals,
        CallbackKind::Jacobian => BufferKind::Jacobian,
    }
}

fn check_dim(buffer: BufferKind, expected: usize, actual: c_int) -> LevmarResult<()> {
    if usize::try_from(actual).ok() == Some(expected) {
        Ok(())
    } else {
        Err(LevmarError::SizeMismatch {
            buffer,
            expected,
            actual: i64::from(actual),
        })
    }
}

/// Output length implied by the solver's own `m` and `n`.
pub(crate) fn native_len(kind: CallbackKind, m: c_int, n: c_int) -> usize {
    let m = usize::try_from(m).unwrap_or(0);
    let n = usize::try_from(n).unwrap_or(0);
    match kind {
        CallbackKind::Residual => n,
        CallbackKind::Jacobian => n.saturating_mul(m),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
