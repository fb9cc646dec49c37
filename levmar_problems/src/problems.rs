use std::fmt::{Display, Formatter};

use levmar::{
    Info, Levmar, LevmarError, LevmarResult, Options, Problem, Solution, SolverConfig,
    LM_DIFF_DELTA, LM_INIT_MU,
};

const OSBORNE_DATA: [f64; 33] = [
    8.44E-1, 9.08E-1, 9.32E-1, 9.36E-1, 9.25E-1, 9.08E-1, 8.81E-1, 8.5E-1, 8.18E-1, 7.84E-1,
    7.51E-1, 7.18E-1, 6.85E-1, 6.58E-1, 6.28E-1, 6.03E-1, 5.8E-1, 5.58E-1, 5.38E-1, 5.22E-1,
    5.06E-1, 4.9E-1, 4.78E-1, 4.67E-1, 4.57E-1, 4.48E-1, 4.38E-1, 4.31E-1, 4.24E-1, 4.2E-1,
    4.14E-1, 4.11E-1, 4.06E-1,
];

/// Tolerances tight enough to drive both problems to their minimum.
pub fn harness_config() -> SolverConfig {
    SolverConfig {
        options: Options {
            init_mu: LM_INIT_MU,
            gradient_threshold: 1e-15,
            step_threshold: 1e-15,
            error_threshold: 1e-20,
            diff_delta: LM_DIFF_DELTA,
        },
        max_iterations: 1000,
        ..SolverConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct ProblemReport {
    pub description: &'static str,
    /// Native return value: iterations, or the failure code.
    pub ret: i32,
    pub params: Vec<f64>,
    pub info: Info,
}

impl ProblemReport {
    fn new(
        description: &'static str,
        params: &[f64],
        result: LevmarResult<Solution>,
    ) -> LevmarResult<Self> {
        let (ret, info) = match result {
            Ok(solution) => (solution.iterations as i32, solution.info),
            Err(LevmarError::NativeSolverFailure { code, info }) => (code, info),
            Err(err) => return Err(err),
        };

        Ok(Self {
            description,
            ret,
            params: params.to_vec(),
            info,
        })
    }
}

impl Display for ProblemReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Results for {}", self.description)?;
        writeln!(
            f,
            "Levenberg-Marquardt returned {} in {} iterations, reason: {}",
            self.ret,
            self.info.iterations(),
            self.info.reason_code()
        )?;
        writeln!(f, "Solution:")?;
        for p in &self.params {
            write!(f, "{p:.7} ")?;
        }
        writeln!(f, "\n\nMinimization Info:")?;
        for v in self.info.as_array() {
            write!(f, "{v:e} ")?;
        }
        writeln!(f)
    }
}

/// Wood's function, derivative-free. Minimum at `[1, 1, 1, 1]`.
pub fn wood(levmar: &Levmar, config: &SolverConfig) -> LevmarResult<ProblemReport> {
    let mut p = [-3.0, -1.0, -3.0, -1.0];
    let x = [0.0; 6];
    let mut problem = Problem::from_config(&mut p, 4, 6, config).measurements(&x);

    let result = levmar.solve_dif(&mut problem, |p, hx, _m, n, _ctx| {
        for i in (0..n).step_by(6) {
            hx[i] = 10.0 * (p[1] - p[0] * p[0]);
            hx[i + 1] = 1.0 - p[0];
            hx[i + 2] = 90.0_f64.sqrt() * (p[3] - p[2] * p[2]);
            hx[i + 3] = 1.0 - p[2];
            hx[i + 4] = 10.0_f64.sqrt() * (p[1] + p[3] - 2.0);
            hx[i + 5] = (p[1] - p[3]) / 10.0_f64.sqrt();
        }
    });

    ProblemReport::new("Wood's function", &p, result)
}

/// Osborne's problem with its analytic Jacobian.
pub fn osborne(levmar: &Levmar, config: &SolverConfig) -> LevmarResult<ProblemReport> {
    let mut p = [0.5, 1.5, -1.0, 1.0E-2, 2.0E-2];
    let mut problem =
        Problem::from_config(&mut p, 5, OSBORNE_DATA.len(), config).measurements(&OSBORNE_DATA);

    let result = levmar.solve_der(
        &mut problem,
        |p, hx, _m, _n, _ctx| {
            for (i, hx) in hx.iter_mut().enumerate() {
                let t = 10.0 * i as f64;
                *hx = p[0] + p[1] * (-p[3] * t).exp() + p[2] * (-p[4] * t).exp();
            }
        },
        |p, jac, m, _n, _ctx| {
            for (i, row) in jac.chunks_exact_mut(m).enumerate() {
                let t = 10.0 * i as f64;
                let tmp1 = (-p[3] * t).exp();
                let tmp2 = (-p[4] * t).exp();

                row[0] = 1.0;
                row[1] = tmp1;
                row[2] = tmp2;
                row[3] = -p[1] * t * tmp1;
                row[4] = -p[2] * t * tmp2;
            }
        },
    );

    ProblemReport::new("Osborne's problem", &p, result)
}
