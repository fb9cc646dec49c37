//! Safe bridge over the callback-driven `levmar` Levenberg-Marquardt solver.
//!
//! Rust closures are exposed to the native routine through `extern "C"`
//! trampolines. Each callback copies the native buffers into owned ones, runs
//! the closure, and copies the result back. A [`Levmar`] instance runs one
//! solve at a time.
//!
//! ```no_run
//! use levmar::{Levmar, Problem};
//!
//! let x = [0.0, 1.0, 2.0, 3.0];
//! let y = [1.0, 3.0, 5.0, 7.0];
//! let mut p = [0.0, 0.0];
//!
//! let mut problem = Problem::new(&mut p, 2, 4).measurements(&y).max_iterations(20);
//! let solution = Levmar::new()
//!     .solve_dif(&mut problem, |p, hx, _m, _n, _ctx| {
//!         for (hx, xi) in hx.iter_mut().zip(x) {
//!             *hx = p[0] + p[1] * xi;
//!         }
//!     })
//!     .unwrap();
//! println!("{} iterations, p = {:?}", solution.iterations, p);
//! ```

mod binding;
mod lifetime;
mod trampoline;

pub mod config;
pub mod context;
pub mod error;
pub mod marshal;
pub mod options;
pub mod solver;

pub use binding::{CallbackKind, JacobianFn, ResidualFn};
pub use config::{ConcurrencyPolicy, SolverConfig};
pub use context::{ContextHandle, ContextTable};
pub use error::{LevmarError, LevmarResult};
pub use levmar_sys::{
    NativeRoutines, LM_DIFF_DELTA, LM_ERROR, LM_INFO_SZ, LM_INIT_MU, LM_OPTS_SZ, LM_STOP_THRESH,
};
pub use options::{Info, Options, TerminationReason};
pub use solver::{Levmar, Problem, Solution};
