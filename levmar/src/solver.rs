use std::ffi::c_int;
use std::ptr::null_mut;

use levmar_sys::{NativeRoutines, LM_INFO_SZ};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::binding::{CallbackBinding, Dims, JacobianFn, ResidualFn};
use crate::config::{ConcurrencyPolicy, SolverConfig};
use crate::context::ContextHandle;
use crate::error::{LevmarError, LevmarResult};
use crate::lifetime;
use crate::marshal::MarshalBuffers;
use crate::options::{Info, Options};
use crate::trampoline::{jacobian_trampoline, residual_trampoline};

/// Inputs of one solve. `params` holds the initial estimate and receives the
/// result, also on failure.
#[derive(Debug)]
pub struct Problem<'a> {
    pub params: &'a mut [f64],
    /// `None` fits against an all-zero target.
    pub measurements: Option<&'a [f64]>,
    pub m: usize,
    pub n: usize,
    pub max_iterations: usize,
    /// `None` lets the native defaults apply.
    pub options: Option<Options>,
    pub context: Option<ContextHandle>,
}

impl<'a> Problem<'a> {
    pub fn new(params: &'a mut [f64], m: usize, n: usize) -> Self {
        Self {
            params,
            measurements: None,
            m,
            n,
            max_iterations: SolverConfig::default().max_iterations,
            options: None,
            context: None,
        }
    }

    pub fn from_config(params: &'a mut [f64], m: usize, n: usize, config: &SolverConfig) -> Self {
        Self::new(params, m, n)
            .max_iterations(config.max_iterations)
            .options(config.options)
    }

    pub fn measurements(mut self, measurements: &'a [f64]) -> Self {
        self.measurements = Some(measurements);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn context(mut self, context: ContextHandle) -> Self {
        self.context = Some(context);
        self
    }

    fn validate(&self) -> LevmarResult<Dims> {
        let invalid = |message: String| Err(LevmarError::InvalidDimensions(message));

        if self.m == 0 {
            return invalid("parameter dimension m must be positive".to_string());
        }
        if self.n < self.m {
            return invalid(format!(
                "need at least as many measurements as parameters, got m = {} and n = {}",
                self.m, self.n
            ));
        }
        if self.params.len() != self.m {
            return invalid(format!(
                "parameter vector has length {}, expected m = {}",
                self.params.len(),
                self.m
            ));
        }
        if let Some(measurements) = self.measurements {
            if measurements.len() != self.n {
                return invalid(format!(
                    "measurement vector has length {}, expected n = {} (omit it for a zero target)",
                    measurements.len(),
                    self.n
                ));
            }
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be positive".to_string());
        }

        let fits_c_int = |value: usize| c_int::try_from(value).is_ok();
        let jacobian_len = self.n.checked_mul(self.m).unwrap_or(usize::MAX);
        if !fits_c_int(self.n) || !fits_c_int(jacobian_len) || !fits_c_int(self.max_iterations) {
            return invalid(format!(
                "dimensions exceed the native int range (m = {}, n = {}, max_iterations = {})",
                self.m, self.n, self.max_iterations
            ));
        }

        Ok(Dims {
            m: self.m,
            n: self.n,
        })
    }
}

/// Outcome of a successful solve. The estimate itself is in `Problem::params`.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Iterations reported by the native routine; 0 when the initial
    /// estimate already met the tolerances.
    pub iterations: usize,
    pub info: Info,
    pub residual_evaluations: usize,
    pub jacobian_evaluations: usize,
}

/// Entry point for both solve variants.
///
/// One instance runs one solve at a time; see [`ConcurrencyPolicy`]. Calling
/// back into any instance from inside a callback fails with
/// [`LevmarError::ReentrancyNotSupported`].
#[derive(Debug)]
pub struct Levmar {
    routines: NativeRoutines,
    policy: ConcurrencyPolicy,
    buffers: Mutex<MarshalBuffers>,
}

impl Default for Levmar {
    fn default() -> Self {
        Self::with_routines(NativeRoutines::default())
    }
}

impl Levmar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &SolverConfig) -> Self {
        Self::default().concurrency(config.concurrency)
    }

    pub fn with_routines(routines: NativeRoutines) -> Self {
        Self {
            routines,
            policy: ConcurrencyPolicy::default(),
            buffers: Mutex::new(MarshalBuffers::default()),
        }
    }

    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fits `problem` with a finite-difference Jacobian computed by the
    /// native routine.
    ///
    /// `residual(p, hx, m, n, context)` must fill `hx` with the model
    /// prediction at `p`; the solver minimises `||x - hx||^2`.
    pub fn solve_dif<F>(&self, problem: &mut Problem<'_>, mut residual: F) -> LevmarResult<Solution>
    where
        F: FnMut(&[f64], &mut [f64], usize, usize, Option<ContextHandle>),
    {
        self.solve(problem, &mut residual, None)
    }

    /// Fits `problem` with an analytic Jacobian.
    ///
    /// `jacobian(p, jac, m, n, context)` must fill the row-major `n x m`
    /// buffer: `jac[i * m + k] = d hx[i] / d p[k]`.
    pub fn solve_der<F, J>(
        &self,
        problem: &mut Problem<'_>,
        mut residual: F,
        mut jacobian: J,
    ) -> LevmarResult<Solution>
    where
        F: FnMut(&[f64], &mut [f64], usize, usize, Option<ContextHandle>),
        J: FnMut(&[f64], &mut [f64], usize, usize, Option<ContextHandle>),
    {
        self.solve(problem, &mut residual, Some(&mut jacobian))
    }

    fn solve(
        &self,
        problem: &mut Problem<'_>,
        residual: &mut ResidualFn<'_>,
        jacobian: Option<&mut JacobianFn<'_>>,
    ) -> LevmarResult<Solution> {
        let dims = problem.validate()?;
        if lifetime::is_active() {
            return Err(LevmarError::ReentrancyNotSupported);
        }
        let mut buffers = self.lock_buffers()?;

        let with_jacobian = jacobian.is_some();
        debug!(
            m = dims.m,
            n = dims.n,
            max_iterations = problem.max_iterations,
            with_jacobian,
            "starting levmar solve"
        );

        let mut info = [0.0; LM_INFO_SZ];
        let mut opts = problem.options.map(|options| options.to_native());
        let opts_ptr = opts.as_mut().map_or(null_mut(), |opts| opts.as_mut_ptr());
        // The solver only reads `x`; the C signature is not const-correct.
        let x_ptr = problem
            .measurements
            .map_or(null_mut(), |x| x.as_ptr().cast_mut());
        let adata = ContextHandle::into_raw(problem.context);
        // Validated above to fit.
        let m = dims.m as c_int;
        let n = dims.n as c_int;
        let itmax = problem.max_iterations as c_int;
        let p_ptr = problem.params.as_mut_ptr();

        // Shorten the trait object lifetime to the binding's scope.
        let jacobian = jacobian.map(|jacobian| jacobian as &mut JacobianFn<'_>);
        let installed = lifetime::install(CallbackBinding::new(
            dims,
            residual,
            jacobian,
            &mut buffers,
        ))?;

        // SAFETY: every pointer covers the length validated above, and the
        // binding the trampolines reach stays installed until `release`.
        let code = unsafe {
            if with_jacobian {
                (self.routines.der)(
                    residual_trampoline,
                    jacobian_trampoline,
                    p_ptr,
                    x_ptr,
                    m,
                    n,
                    itmax,
                    opts_ptr,
                    info.as_mut_ptr(),
                    null_mut(),
                    null_mut(),
                    adata,
                )
            } else {
                (self.routines.dif)(
                    residual_trampoline,
                    p_ptr,
                    x_ptr,
                    m,
                    n,
                    itmax,
                    opts_ptr,
                    info.as_mut_ptr(),
                    null_mut(),
                    null_mut(),
                    adata,
                )
            }
        };

        let outcome = installed.release();
        let info = Info::from(info);

        if let Some(failure) = outcome.failure {
            return Err(LevmarError::CallbackFailed {
                source: Box::new(failure),
                code,
                info,
            });
        }
        if code < 0 {
            warn!(code, reason = %info.reason_label(), "native solver reported failure");
            return Err(LevmarError::NativeSolverFailure { code, info });
        }

        debug!(
            iterations = code,
            reason = %info.reason_label(),
            final_error = info.final_error(),
            residual_calls = outcome.residual_calls,
            jacobian_calls = outcome.jacobian_calls,
            "levmar solve finished"
        );

        Ok(Solution {
            iterations: code as usize,
            info,
            residual_evaluations: outcome.residual_calls,
            jacobian_evaluations: outcome.jacobian_calls,
        })
    }

    fn lock_buffers(&self) -> LevmarResult<MutexGuard<'_, MarshalBuffers>> {
        match self.policy {
            ConcurrencyPolicy::Reject => self
                .buffers
                .try_lock()
                .ok_or(LevmarError::ReentrancyNotSupported),
            ConcurrencyPolicy::Block => Ok(self.buffers.lock()),
        }
    }
}
