//! Native-callable entry points handed to the solver in place of Rust closures.

use std::ffi::{c_int, c_void};

use tracing::error;

use crate::binding::{native_len, CallbackKind};
use crate::lifetime::with_active_binding;
use crate::marshal::poison;

/// Matches [`levmar_sys::LevmarFunc`].
pub(crate) unsafe extern "C" fn residual_trampoline(
    p: *mut f64,
    hx: *mut f64,
    m: c_int,
    n: c_int,
    adata: *mut c_void,
) {
    dispatch(CallbackKind::Residual, p, hx, m, n, adata);
}

/// Matches [`levmar_sys::LevmarJacf`].
pub(crate) unsafe extern "C" fn jacobian_trampoline(
    p: *mut f64,
    jac: *mut f64,
    m: c_int,
    n: c_int,
    adata: *mut c_void,
) {
    dispatch(CallbackKind::Jacobian, p, jac, m, n, adata);
}

unsafe fn dispatch(
    kind: CallbackKind,
    p: *mut f64,
    out: *mut f64,
    m: c_int,
    n: c_int,
    adata: *mut c_void,
) {
    let dispatched = with_active_binding(|binding| binding.invoke(kind, p, out, m, n, adata));

    if dispatched.is_none() {
        error!(callback = %kind, m, n, "trampoline invoked without an active binding");
        poison(out, native_len(kind, m, n));
    }
}
