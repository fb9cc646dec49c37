#![deny(improper_ctypes_definitions)]

//! Raw C interface of the `levmar` library.
//!
//! Only the double precision, unconstrained entry points are declared. With the
//! `system` feature the symbols come from `liblevmar`; otherwise
//! [`NativeRoutines::stand_in`] provides C-ABI routines with the same contract.

use std::ffi::{c_int, c_void};
use std::fmt::{Debug, Formatter};

pub mod stand_in;

/// Length of the `opts` vector.
pub const LM_OPTS_SZ: usize = 5;
/// Length of the `info` vector.
pub const LM_INFO_SZ: usize = 10;
/// Return value signalling failure.
pub const LM_ERROR: c_int = -1;
pub const LM_INIT_MU: f64 = 1e-3;
pub const LM_STOP_THRESH: f64 = 1e-17;
pub const LM_DIFF_DELTA: f64 = 1e-6;

/// `void (*func)(double *p, double *hx, int m, int n, void *adata)`
pub type LevmarFunc =
    unsafe extern "C" fn(p: *mut f64, hx: *mut f64, m: c_int, n: c_int, adata: *mut c_void);

/// `void (*jacf)(double *p, double *j, int m, int n, void *adata)`
///
/// `j` is the row-major `n x m` Jacobian: `j[i * m + k] = d hx[i] / d p[k]`.
pub type LevmarJacf =
    unsafe extern "C" fn(p: *mut f64, j: *mut f64, m: c_int, n: c_int, adata: *mut c_void);

/// Signature of `dlevmar_dif`.
pub type LevmarDif = unsafe extern "C" fn(
    func: LevmarFunc,
    p: *mut f64,
    x: *mut f64,
    m: c_int,
    n: c_int,
    itmax: c_int,
    opts: *mut f64,
    info: *mut f64,
    work: *mut f64,
    covar: *mut f64,
    adata: *mut c_void,
) -> c_int;

/// Signature of `dlevmar_der`.
pub type LevmarDer = unsafe extern "C" fn(
    func: LevmarFunc,
    jacf: LevmarJacf,
    p: *mut f64,
    x: *mut f64,
    m: c_int,
    n: c_int,
    itmax: c_int,
    opts: *mut f64,
    info: *mut f64,
    work: *mut f64,
    covar: *mut f64,
    adata: *mut c_void,
) -> c_int;

#[cfg(feature = "system")]
extern "C" {
    pub fn dlevmar_dif(
        func: LevmarFunc,
        p: *mut f64,
        x: *mut f64,
        m: c_int,
        n: c_int,
        itmax: c_int,
        opts: *mut f64,
        info: *mut f64,
        work: *mut f64,
        covar: *mut f64,
        adata: *mut c_void,
    ) -> c_int;

    pub fn dlevmar_der(
        func: LevmarFunc,
        jacf: LevmarJacf,
        p: *mut f64,
        x: *mut f64,
        m: c_int,
        n: c_int,
        itmax: c_int,
        opts: *mut f64,
        info: *mut f64,
        work: *mut f64,
        covar: *mut f64,
        adata: *mut c_void,
    ) -> c_int;
}

/// The pair of solver entry points a caller drives.
#[derive(Clone, Copy)]
pub struct NativeRoutines {
    pub dif: LevmarDif,
    pub der: LevmarDer,
}

impl NativeRoutines {
    /// Entry points exported by the linked `liblevmar`.
    #[cfg(feature = "system")]
    pub fn linked() -> Self {
        Self {
            dif: dlevmar_dif,
            der: dlevmar_der,
        }
    }

    pub fn stand_in() -> Self {
        Self {
            dif: stand_in::dlevmar_dif,
            der: stand_in::dlevmar_der,
        }
    }
}

impl Default for NativeRoutines {
    #[cfg(feature = "system")]
    fn default() -> Self {
        Self::linked()
    }

    #[cfg(not(feature = "system"))]
    fn default() -> Self {
        Self::stand_in()
    }
}

impl Debug for NativeRoutines {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRoutines")
            .field("dif", &(self.dif as usize as *const c_void))
            .field("der", &(self.der as usize as *const c_void))
            .finish()
    }
}
