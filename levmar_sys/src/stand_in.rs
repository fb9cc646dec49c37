//! C-ABI routines with the contract of `dlevmar_dif` / `dlevmar_der`.
//!
//! Used when `liblevmar` is not linked. Damping follows Nielsen's update as
//! the library does; `dlevmar_dif` re-approximates the Jacobian with finite
//! differences on every iteration instead of using Broyden updates.

use std::ffi::{c_int, c_void};

use crate::{LevmarFunc, LevmarJacf, LM_DIFF_DELTA, LM_ERROR, LM_INFO_SZ, LM_INIT_MU, LM_STOP_THRESH};

const EPSILON: f64 = 1e-12;
const ONE_THIRD: f64 = 1.0 / 3.0;

const STOP_SMALL_GRADIENT: u8 = 1;
const STOP_SMALL_DP: u8 = 2;
const STOP_ITMAX: u8 = 3;
const STOP_SINGULAR: u8 = 4;
const STOP_NO_REDUCTION: u8 = 5;
const STOP_SMALL_ERROR: u8 = 6;
const STOP_INVALID_VALUES: u8 = 7;

/// # Safety
///
/// `p` must point to `m` doubles, `x` to `n` doubles or be null, `opts` to
/// [`crate::LM_OPTS_SZ`] doubles or be null, `info` to [`LM_INFO_SZ`] doubles
/// or be null. `func` must be safe to call with buffers of those sizes and
/// `adata`.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn dlevmar_dif(
    func: LevmarFunc,
    p: *mut f64,
    x: *mut f64,
    m: c_int,
    n: c_int,
    itmax: c_int,
    opts: *mut f64,
    info: *mut f64,
    _work: *mut f64,
    _covar: *mut f64,
    adata: *mut c_void,
) -> c_int {
    let delta = if opts.is_null() {
        LM_DIFF_DELTA
    } else {
        *opts.add(4)
    };
    let jacobian = if delta < 0.0 {
        JacobianSource::Central(-delta)
    } else {
        JacobianSource::Forward(delta)
    };

    solve(func, jacobian, p, x, m, n, itmax, opts, info, adata)
}

/// # Safety
///
/// Same requirements as [`dlevmar_dif`]; `jacf` must additionally accept an
/// output buffer of `n * m` doubles.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn dlevmar_der(
    func: LevmarFunc,
    jacf: LevmarJacf,
    p: *mut f64,
    x: *mut f64,
    m: c_int,
    n: c_int,
    itmax: c_int,
    opts: *mut f64,
    info: *mut f64,
    _work: *mut f64,
    _covar: *mut f64,
    adata: *mut c_void,
) -> c_int {
    solve(
        func,
        JacobianSource::Analytic(jacf),
        p,
        x,
        m,
        n,
        itmax,
        opts,
        info,
        adata,
    )
}

#[derive(Clone, Copy)]
enum JacobianSource {
    Analytic(LevmarJacf),
    Forward(f64),
    Central(f64),
}

struct Thresholds {
    tau: f64,
    eps1: f64,
    eps2: f64,
    eps2_sq: f64,
    eps3: f64,
}

impl Thresholds {
    unsafe fn read(opts: *const f64) -> Self {
        if opts.is_null() {
            return Self {
                tau: LM_INIT_MU,
                eps1: LM_STOP_THRESH,
                eps2: LM_STOP_THRESH,
                eps2_sq: LM_STOP_THRESH * LM_STOP_THRESH,
                eps3: LM_STOP_THRESH,
            };
        }

        let opts = std::slice::from_raw_parts(opts, 4);
        Self {
            tau: opts[0],
            eps1: opts[1],
            eps2: opts[2],
            eps2_sq: opts[2] * opts[2],
            eps3: opts[3],
        }
    }
}

#[derive(Default)]
struct Counters {
    nfev: usize,
    njev: usize,
    nlss: usize,
}

struct Callbacks {
    func: LevmarFunc,
    adata: *mut c_void,
    m: c_int,
    n: c_int,
}

impl Callbacks {
    unsafe fn eval(&self, p: &mut [f64], hx: &mut [f64]) {
        (self.func)(p.as_mut_ptr(), hx.as_mut_ptr(), self.m, self.n, self.adata);
    }

    /// Fills the row-major Jacobian at `p`; `hx` holds `func(p)`.
    unsafe fn jacobian(
        &self,
        source: JacobianSource,
        p: &mut [f64],
        hx: &[f64],
        jac: &mut [f64],
        scratch: &mut [f64],
        scratch_back: &mut [f64],
        counters: &mut Counters,
    ) {
        let m = p.len();
        match source {
            JacobianSource::Analytic(jacf) => {
                jacf(p.as_mut_ptr(), jac.as_mut_ptr(), self.m, self.n, self.adata);
            }
            JacobianSource::Forward(delta) => {
                for k in 0..m {
                    let d = (1e-4 * p[k]).abs().max(delta);
                    let saved = p[k];
                    p[k] += d;
                    self.eval(p, scratch);
                    p[k] = saved;

                    for (i, (&fwd, &cur)) in scratch.iter().zip(hx).enumerate() {
                        jac[i * m + k] = (fwd - cur) / d;
                    }
                }
                counters.nfev += m;
            }
            JacobianSource::Central(delta) => {
                for k in 0..m {
                    let d = (1e-4 * p[k]).abs().max(delta);
                    let saved = p[k];
                    p[k] = saved - d;
                    self.eval(p, scratch_back);
                    p[k] = saved + d;
                    self.eval(p, scratch);
                    p[k] = saved;

                    for (i, (&fwd, &back)) in scratch.iter().zip(scratch_back.iter()).enumerate()
                    {
                        jac[i * m + k] = 0.5 * (fwd - back) / d;
                    }
                }
                counters.nfev += 2 * m;
            }
        }
        counters.njev += 1;
    }
}

/// `e = x - hx` and returns `||e||^2`.
fn residual(x: Option<&[f64]>, hx: &[f64], e: &mut [f64]) -> f64 {
    match x {
        Some(x) => {
            for ((e, &x), &hx) in e.iter_mut().zip(x).zip(hx) {
                *e = x - hx;
            }
        }
        None => {
            for (e, &hx) in e.iter_mut().zip(hx) {
                *e = -hx;
            }
        }
    }
    e.iter().map(|v| v * v).sum()
}

#[allow(clippy::too_many_arguments)]
unsafe fn solve(
    func: LevmarFunc,
    jacobian: JacobianSource,
    p: *mut f64,
    x: *mut f64,
    m_c: c_int,
    n_c: c_int,
    itmax: c_int,
    opts: *mut f64,
    info: *mut f64,
    adata: *mut c_void,
) -> c_int {
    if p.is_null() || m_c <= 0 || n_c < m_c {
        return LM_ERROR;
    }
    let (m, n) = (m_c as usize, n_c as usize);
    let itmax = itmax.max(0) as usize;

    let p = std::slice::from_raw_parts_mut(p, m);
    let x = (!x.is_null()).then(|| std::slice::from_raw_parts(x as *const f64, n));
    let thresholds = Thresholds::read(opts);
    let callbacks = Callbacks {
        func,
        adata,
        m: m_c,
        n: n_c,
    };

    let mut hx = vec![0.0; n];
    let mut e = vec![0.0; n];
    let mut hx_trial = vec![0.0; n];
    let mut scratch = vec![0.0; n];
    let mut scratch_back = vec![0.0; n];
    let mut jac = vec![0.0; n * m];
    let mut jtj = vec![0.0; m * m];
    let mut factor = vec![0.0; m * m];
    let mut diag = vec![0.0; m];
    let mut jte = vec![0.0; m];
    let mut dp = vec![0.0; m];
    let mut p_trial = vec![0.0; m];

    let mut counters = Counters::default();
    let mut mu = 0.0;
    let mut nu: u32 = 2;
    let mut jte_inf = 0.0;
    let mut dp_l2 = 0.0;

    callbacks.eval(p, &mut hx);
    counters.nfev += 1;
    let mut p_el2 = residual(x, &hx, &mut e);
    let init_el2 = p_el2;

    let mut stop = if p_el2.is_finite() {
        0
    } else {
        STOP_INVALID_VALUES
    };

    let mut k = 0;
    while k < itmax && stop == 0 {
        if p_el2 <= thresholds.eps3 {
            stop = STOP_SMALL_ERROR;
            break;
        }

        callbacks.jacobian(
            jacobian,
            p,
            &hx,
            &mut jac,
            &mut scratch,
            &mut scratch_back,
            &mut counters,
        );

        normal_equations(&jac, &e, m, &mut jtj, &mut jte);
        // `f64::max` drops NaN, so non-finite entries are checked separately.
        jte_inf = jte.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if jte.iter().chain(&jtj).any(|v| !v.is_finite()) {
            stop = STOP_INVALID_VALUES;
            break;
        }
        if jte_inf <= thresholds.eps1 {
            dp_l2 = 0.0;
            stop = STOP_SMALL_GRADIENT;
            break;
        }

        let p_l2: f64 = p.iter().map(|v| v * v).sum();
        for (i, d) in diag.iter_mut().enumerate() {
            *d = jtj[i * m + i];
        }
        if k == 0 {
            mu = thresholds.tau * diag.iter().fold(f64::MIN_POSITIVE, |acc, &v| acc.max(v));
        }

        loop {
            for (i, &d) in diag.iter().enumerate() {
                jtj[i * m + i] = d + mu;
            }

            counters.nlss += 1;
            if cholesky_solve(&jtj, &jte, &mut dp, &mut factor, m) {
                for ((trial, &p), &dp) in p_trial.iter_mut().zip(p.iter()).zip(&dp) {
                    *trial = p + dp;
                }
                dp_l2 = dp.iter().map(|v| v * v).sum();

                if dp_l2 <= thresholds.eps2_sq * p_l2 {
                    stop = STOP_SMALL_DP;
                    break;
                }
                if dp_l2 >= (p_l2 + thresholds.eps2) / (EPSILON * EPSILON) {
                    stop = STOP_SINGULAR;
                    break;
                }

                callbacks.eval(&mut p_trial, &mut hx_trial);
                counters.nfev += 1;
                let trial_el2 = residual(x, &hx_trial, &mut scratch);
                if !trial_el2.is_finite() {
                    stop = STOP_INVALID_VALUES;
                    break;
                }

                let predicted: f64 = dp
                    .iter()
                    .zip(&jte)
                    .map(|(&dp, &g)| dp * (mu * dp + g))
                    .sum();
                let actual = p_el2 - trial_el2;

                if predicted > 0.0 && actual > 0.0 {
                    let ratio = 2.0 * actual / predicted - 1.0;
                    mu *= (1.0 - ratio * ratio * ratio).max(ONE_THIRD);
                    nu = 2;

                    p.copy_from_slice(&p_trial);
                    std::mem::swap(&mut hx, &mut hx_trial);
                    std::mem::swap(&mut e, &mut scratch);
                    p_el2 = trial_el2;
                    break;
                }
            }

            mu *= f64::from(nu);
            match nu.checked_mul(2) {
                Some(next) => nu = next,
                None => {
                    stop = STOP_NO_REDUCTION;
                    break;
                }
            }
        }

        k += 1;
    }

    if k >= itmax && stop == 0 {
        stop = STOP_ITMAX;
    }

    if !info.is_null() {
        let info = std::slice::from_raw_parts_mut(info, LM_INFO_SZ);
        let max_diag = diag.iter().fold(f64::MIN_POSITIVE, |acc, &v| acc.max(v));
        info[0] = init_el2;
        info[1] = p_el2;
        info[2] = jte_inf;
        info[3] = dp_l2;
        info[4] = mu / max_diag;
        info[5] = k as f64;
        info[6] = f64::from(stop);
        info[7] = counters.nfev as f64;
        info[8] = counters.njev as f64;
        info[9] = counters.nlss as f64;
    }

    if stop == STOP_SINGULAR || stop == STOP_INVALID_VALUES {
        LM_ERROR
    } else {
        k as c_int
    }
}

/// `jtj = J^T J` and `jte = J^T e` for a row-major `n x m` Jacobian.
fn normal_equations(jac: &[f64], e: &[f64], m: usize, jtj: &mut [f64], jte: &mut [f64]) {
    jtj.fill(0.0);
    jte.fill(0.0);

    for (row, &e) in jac.chunks_exact(m).zip(e) {
        for (a, &ja) in row.iter().enumerate() {
            jte[a] += ja * e;
            for (b, &jb) in row.iter().enumerate().skip(a) {
                jtj[a * m + b] += ja * jb;
            }
        }
    }

    for a in 0..m {
        for b in 0..a {
            jtj[a * m + b] = jtj[b * m + a];
        }
    }
}

/// Solves `a * x = b` for symmetric positive definite `a`.
/// Returns false when `a` is not positive definite.
fn cholesky_solve(a: &[f64], b: &[f64], x: &mut [f64], l: &mut [f64], m: usize) -> bool {
    l.copy_from_slice(a);

    for j in 0..m {
        let mut d = l[j * m + j];
        for k in 0..j {
            d -= l[j * m + k] * l[j * m + k];
        }
        if d <= 0.0 || d.is_nan() {
            return false;
        }
        let d = d.sqrt();
        l[j * m + j] = d;

        for i in j + 1..m {
            let mut s = l[i * m + j];
            for k in 0..j {
                s -= l[i * m + k] * l[j * m + k];
            }
            l[i * m + j] = s / d;
        }
    }

    for i in 0..m {
        let mut s = b[i];
        for k in 0..i {
            s -= l[i * m + k] * x[k];
        }
        x[i] = s / l[i * m + i];
    }
    for i in (0..m).rev() {
        let mut s = x[i];
        for k in i + 1..m {
            s -= l[k * m + i] * x[k];
        }
        x[i] = s / l[i * m + i];
    }

    x.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null_mut;

    unsafe extern "C" fn line(p: *mut f64, hx: *mut f64, m: c_int, n: c_int, _adata: *mut c_void) {
        let p = std::slice::from_raw_parts(p, m as usize);
        let hx = std::slice::from_raw_parts_mut(hx, n as usize);
        for (i, hx) in hx.iter_mut().enumerate() {
            *hx = p[0] + p[1] * i as f64;
        }
    }

    unsafe extern "C" fn line_jac(
        _p: *mut f64,
        j: *mut f64,
        m: c_int,
        n: c_int,
        _adata: *mut c_void,
    ) {
        let j = std::slice::from_raw_parts_mut(j, (m * n) as usize);
        for (i, row) in j.chunks_exact_mut(m as usize).enumerate() {
            row[0] = 1.0;
            row[1] = i as f64;
        }
    }

    #[test]
    fn cholesky_solves_spd_system() {
        let a = [4.0, 2.0, 2.0, 3.0];
        let b = [2.0, 1.0];
        let mut x = [0.0; 2];
        let mut l = [0.0; 4];

        assert!(cholesky_solve(&a, &b, &mut x, &mut l, 2));
        assert!((4.0 * x[0] + 2.0 * x[1] - 2.0).abs() < 1e-12);
        assert!((2.0 * x[0] + 3.0 * x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = [1.0, 2.0, 2.0, 1.0];
        let mut x = [0.0; 2];
        let mut l = [0.0; 4];

        assert!(!cholesky_solve(&a, &[1.0, 1.0], &mut x, &mut l, 2));
    }

    #[test]
    fn fewer_measurements_than_unknowns_is_an_error() {
        let mut p = [0.0; 3];
        let mut info = [-1.0; LM_INFO_SZ];
        let ret = unsafe {
            dlevmar_dif(
                line,
                p.as_mut_ptr(),
                null_mut(),
                3,
                2,
                10,
                null_mut(),
                info.as_mut_ptr(),
                null_mut(),
                null_mut(),
                null_mut(),
            )
        };

        assert_eq!(ret, LM_ERROR);
        assert_eq!(info, [-1.0; LM_INFO_SZ], "info is left untouched");
    }

    #[test]
    fn der_fits_a_line() {
        let mut p = [0.0, 0.0];
        let mut x = [1.0, 3.0, 5.0, 7.0];
        let mut info = [0.0; LM_INFO_SZ];
        let ret = unsafe {
            dlevmar_der(
                line,
                line_jac,
                p.as_mut_ptr(),
                x.as_mut_ptr(),
                2,
                4,
                100,
                null_mut(),
                info.as_mut_ptr(),
                null_mut(),
                null_mut(),
                null_mut(),
            )
        };

        assert!(ret >= 0, "solver failed: {ret}");
        assert!((p[0] - 1.0).abs() < 1e-6, "p = {p:?}");
        assert!((p[1] - 2.0).abs() < 1e-6, "p = {p:?}");
        assert_eq!(info[5], ret as f64);
        assert!(info[8] >= 1.0);
    }

    #[test]
    fn null_measurements_target_zero() {
        let mut p = [3.0, -1.0];
        let mut info = [0.0; LM_INFO_SZ];
        let ret = unsafe {
            dlevmar_dif(
                line,
                p.as_mut_ptr(),
                null_mut(),
                2,
                4,
                100,
                null_mut(),
                info.as_mut_ptr(),
                null_mut(),
                null_mut(),
                null_mut(),
            )
        };

        assert!(ret >= 0, "solver failed: {ret}");
        assert!(p[0].abs() < 1e-6 && p[1].abs() < 1e-6, "p = {p:?}");
        assert!(info[1] < 1e-10);
    }

    unsafe extern "C" fn nan_jac(
        _p: *mut f64,
        j: *mut f64,
        m: c_int,
        n: c_int,
        _adata: *mut c_void,
    ) {
        std::slice::from_raw_parts_mut(j, (m * n) as usize).fill(f64::NAN);
    }

    #[test]
    fn nan_jacobian_stops_with_invalid_values() {
        let mut p = [0.0, 0.0];
        let mut x = [1.0, 3.0, 5.0, 7.0];
        let mut info = [0.0; LM_INFO_SZ];
        let ret = unsafe {
            dlevmar_der(
                line,
                nan_jac,
                p.as_mut_ptr(),
                x.as_mut_ptr(),
                2,
                4,
                100,
                null_mut(),
                info.as_mut_ptr(),
                null_mut(),
                null_mut(),
                null_mut(),
            )
        };

        assert_eq!(ret, LM_ERROR);
        assert_eq!(info[6], f64::from(STOP_INVALID_VALUES));
        assert_eq!(info[8], 1.0);
        assert_eq!(p, [0.0, 0.0]);
    }
}
