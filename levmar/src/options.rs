use levmar_sys::{LM_DIFF_DELTA, LM_INFO_SZ, LM_INIT_MU, LM_OPTS_SZ, LM_STOP_THRESH};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, FromRepr};

/// Solver tunables, laid out natively as `[mu, eps1, eps2, eps3, delta]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Scale factor for the initial damping `mu`.
    pub init_mu: f64,
    /// Stop when `||J^T e||_inf` falls below this.
    pub gradient_threshold: f64,
    /// Stop when `||Dp||_2` falls below this, relative to `||p||_2`.
    pub step_threshold: f64,
    /// Stop when `||e||_2^2` falls below this.
    pub error_threshold: f64,
    /// Finite difference step for the derivative-free solve.
    /// Negative values select central differences with step `-diff_delta`.
    pub diff_delta: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            init_mu: LM_INIT_MU,
            gradient_threshold: LM_STOP_THRESH,
            step_threshold: LM_STOP_THRESH,
            error_threshold: LM_STOP_THRESH,
            diff_delta: LM_DIFF_DELTA,
        }
    }
}

impl Options {
    pub fn to_native(&self) -> [f64; LM_OPTS_SZ] {
        [
            self.init_mu,
            self.gradient_threshold,
            self.step_threshold,
            self.error_threshold,
            self.diff_delta,
        ]
    }
}

impl From<[f64; LM_OPTS_SZ]> for Options {
    fn from(opts: [f64; LM_OPTS_SZ]) -> Self {
        Self {
            init_mu: opts[0],
            gradient_threshold: opts[1],
            step_threshold: opts[2],
            error_threshold: opts[3],
            diff_delta: opts[4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum TerminationReason {
    #[strum(to_string = "small gradient")]
    SmallGradient = 1,
    #[strum(to_string = "small step")]
    SmallStep = 2,
    #[strum(to_string = "iteration limit")]
    MaxIterations = 3,
    #[strum(to_string = "singular matrix")]
    SingularMatrix = 4,
    #[strum(to_string = "no further error reduction")]
    NoReduction = 5,
    #[strum(to_string = "small error")]
    SmallError = 6,
    #[strum(to_string = "invalid function values")]
    InvalidValues = 7,
}

/// Diagnostics written by the native routine once per solve.
///
/// | idx | meaning                          |
/// |-----|----------------------------------|
/// | 0   | `\|\|e\|\|_2^2` at the initial p |
/// | 1   | `\|\|e\|\|_2^2` at the estimate  |
/// | 2   | `\|\|J^T e\|\|_inf`              |
/// | 3   | `\|\|Dp\|\|_2^2`                 |
/// | 4   | `mu / max[J^T J]_ii`             |
/// | 5   | iterations                       |
/// | 6   | termination reason               |
/// | 7   | function evaluations             |
/// | 8   | Jacobian evaluations             |
/// | 9   | linear systems solved            |
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Info([f64; LM_INFO_SZ]);

impl Info {
    pub fn as_array(&self) -> &[f64; LM_INFO_SZ] {
        &self.0
    }

    pub fn initial_error(&self) -> f64 {
        self.0[0]
    }

    pub fn final_error(&self) -> f64 {
        self.0[1]
    }

    pub fn gradient_norm(&self) -> f64 {
        self.0[2]
    }

    pub fn step_norm(&self) -> f64 {
        self.0[3]
    }

    pub fn relative_damping(&self) -> f64 {
        self.0[4]
    }

    pub fn iterations(&self) -> usize {
        count(self.0[5])
    }

    pub fn reason_code(&self) -> f64 {
        self.0[6]
    }

    /// `None` when the native routine wrote an unknown code.
    pub fn reason(&self) -> Option<TerminationReason> {
        let code = self.0[6];
        if code.fract() != 0.0 || !(0.0..=f64::from(u8::MAX)).contains(&code) {
            return None;
        }
        TerminationReason::from_repr(code as u8)
    }

    pub fn function_evaluations(&self) -> usize {
        count(self.0[7])
    }

    pub fn jacobian_evaluations(&self) -> usize {
        count(self.0[8])
    }

    pub fn linear_solves(&self) -> usize {
        count(self.0[9])
    }

    pub(crate) fn reason_label(&self) -> String {
        match self.reason() {
            Some(reason) => reason.to_string(),
            None => format!("reason code {}", self.0[6]),
        }
    }
}

impl From<[f64; LM_INFO_SZ]> for Info {
    fn from(info: [f64; LM_INFO_SZ]) -> Self {
        Self(info)
    }
}

fn count(value: f64) -> usize {
    if value.is_finite() && value > 0.0 {
        value as usize
    } else {
        0
    }
}
