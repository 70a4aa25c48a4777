//! One-step formulas used by the adaptive driver in [`crate::integrator`].
//!
//! Each stepper attempts a single step of size `h` from `(t, y)` and reports
//! the propagated solution together with the raw local error of its embedded
//! lower-order companion. Acceptance and step-size control live in the
//! driver.

use crate::sdirk::Sdirk2;
use crate::traits::Dynamics;
use serde::{Deserialize, Serialize};

/// Integration method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Method {
    /// Tsitouras 5(4), FSAL.
    #[default]
    Tsit5,
    /// Dormand-Prince 5(4), FSAL.
    DormandPrince,
    /// Bogacki-Shampine 3(2), FSAL.
    BogackiShampine,
    /// Two-stage L-stable SDIRK of order 2 with an embedded order-1 estimate.
    Sdirk2,
}

impl Method {
    pub fn is_implicit(self) -> bool {
        matches!(self, Method::Sdirk2)
    }

    pub(crate) fn build(self, dim: usize) -> MethodStepper {
        match self {
            Method::Tsit5 => MethodStepper::Explicit(ExplicitRk::new(&TSIT5, dim)),
            Method::DormandPrince => MethodStepper::Explicit(ExplicitRk::new(&DORMAND_PRINCE, dim)),
            Method::BogackiShampine => {
                MethodStepper::Explicit(ExplicitRk::new(&BOGACKI_SHAMPINE, dim))
            }
            Method::Sdirk2 => MethodStepper::Implicit(Sdirk2::new(dim)),
        }
    }
}

/// Buffers filled by one step attempt.
#[derive(Debug, Clone)]
pub struct StepWork {
    /// Candidate state at `t + h`.
    pub y_new: Vec<f64>,
    /// Raw per-component local error estimate (unscaled).
    pub error: Vec<f64>,
    /// `f(t + h, y_new)`.
    pub f_new: Vec<f64>,
    pub evaluations: usize,
    pub jacobians: usize,
    /// False when an implicit stage solve failed; the attempt must be
    /// rejected regardless of `error`.
    pub converged: bool,
}

impl StepWork {
    pub fn new(dim: usize) -> Self {
        Self {
            y_new: vec![0.0; dim],
            error: vec![0.0; dim],
            f_new: vec![0.0; dim],
            evaluations: 0,
            jacobians: 0,
            converged: true,
        }
    }
}

/// Step-size limits and Newton settings an attempt may need.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptSettings {
    pub abstol: f64,
    pub reltol: f64,
    pub newton_max_iters: usize,
    pub newton_tol: f64,
}

pub(crate) enum MethodStepper {
    Explicit(ExplicitRk),
    Implicit(Sdirk2),
}

impl MethodStepper {
    /// Order of the embedded error estimate; the controller exponent is
    /// `1 / (order + 1)`.
    pub fn error_order(&self) -> usize {
        match self {
            MethodStepper::Explicit(s) => s.tableau.error_order,
            MethodStepper::Implicit(_) => Sdirk2::ERROR_ORDER,
        }
    }

    /// Order of the propagated solution.
    pub fn order(&self) -> usize {
        match self {
            MethodStepper::Explicit(s) => s.tableau.order,
            MethodStepper::Implicit(_) => Sdirk2::ORDER,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn attempt<D: Dynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        params: &[f64],
        t: f64,
        y: &[f64],
        f0: &[f64],
        h: f64,
        settings: &AttemptSettings,
        work: &mut StepWork,
    ) {
        match self {
            MethodStepper::Explicit(s) => s.attempt(dynamics, params, t, y, f0, h, work),
            MethodStepper::Implicit(s) => {
                s.attempt(dynamics, params, t, y, f0, h, settings, work)
            }
        }
    }
}

/// Coefficients of an explicit embedded Runge-Kutta pair.
///
/// `a` is stored row by row (strictly lower triangular, row `i` has `i`
/// entries). `e` holds `b - b̂`, so `h Σ e_j k_j` is the local error of the
/// lower-order companion.
#[derive(Debug)]
pub struct ButcherTableau {
    pub name: &'static str,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    pub e: &'static [f64],
    pub order: usize,
    pub error_order: usize,
    /// The last stage is evaluated at `(t + h, y_new)`.
    pub fsal: bool,
}

impl ButcherTableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

/// Tsitouras 5/4 coefficients.
pub static TSIT5: ButcherTableau = ButcherTableau {
    name: "Tsit5",
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.898, -6.359447987781783, 4.361447987781783],
        &[
            5.325864858437957,
            -11.748883564062828,
            7.495539342889693,
            -0.09249506636030195,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.02826857949054663,
        ],
        &[
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436099,
            2.324710524099774,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
        0.0,
    ],
    e: &[
        -0.00178001105222577714,
        -0.0008164344596567469,
        0.007880878010261995,
        -0.1447110071732629,
        0.5823571654525552,
        -0.45808210592918697,
        1.0 / 66.0,
    ],
    order: 5,
    error_order: 4,
    fsal: true,
};

/// Dormand-Prince 5(4) coefficients.
pub static DORMAND_PRINCE: ButcherTableau = ButcherTableau {
    name: "DormandPrince",
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    order: 5,
    error_order: 4,
    fsal: true,
};

/// Bogacki-Shampine 3(2) coefficients.
pub static BOGACKI_SHAMPINE: ButcherTableau = ButcherTableau {
    name: "BogackiShampine",
    c: &[0.0, 0.5, 0.75, 1.0],
    a: &[
        &[],
        &[0.5],
        &[0.0, 0.75],
        &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
    ],
    b: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
    e: &[-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0],
    order: 3,
    error_order: 2,
    fsal: true,
};

/// Explicit embedded Runge-Kutta stepper driven by a [`ButcherTableau`].
pub struct ExplicitRk {
    tableau: &'static ButcherTableau,
    k: Vec<Vec<f64>>,
    tmp: Vec<f64>,
}

impl ExplicitRk {
    pub fn new(tableau: &'static ButcherTableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![0.0; dim]; tableau.stages()],
            tmp: vec![0.0; dim],
        }
    }

    pub fn tableau(&self) -> &'static ButcherTableau {
        self.tableau
    }

    /// Attempts one step. `f0` must be `f(t, y)`.
    #[allow(clippy::too_many_arguments)]
    pub fn attempt<D: Dynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        params: &[f64],
        t: f64,
        y: &[f64],
        f0: &[f64],
        h: f64,
        work: &mut StepWork,
    ) {
        let tab = self.tableau;
        let stages = tab.stages();
        let n = y.len();
        self.k[0].copy_from_slice(f0);
        work.evaluations = 0;
        work.jacobians = 0;
        work.converged = true;

        for s in 1..stages {
            let row = tab.a[s];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, &a) in row.iter().enumerate() {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * acc;
            }
            dynamics.eval(t + tab.c[s] * h, &self.tmp, params, &mut self.k[s]);
            work.evaluations += 1;
        }

        if tab.fsal {
            // The last row of `a` equals `b`, so the last stage input is the
            // propagated solution and its derivative is already known.
            work.y_new.copy_from_slice(&self.tmp);
            work.f_new.copy_from_slice(&self.k[stages - 1]);
        } else {
            for i in 0..n {
                let mut acc = 0.0;
                for (j, &b) in tab.b.iter().enumerate() {
                    acc += b * self.k[j][i];
                }
                work.y_new[i] = y[i] + h * acc;
            }
            dynamics.eval(t + h, &work.y_new, params, &mut work.f_new);
            work.evaluations += 1;
        }

        for i in 0..n {
            let mut acc = 0.0;
            for (j, &e) in tab.e.iter().enumerate() {
                acc += e * self.k[j][i];
            }
            work.error[i] = h * acc;
        }
    }
}
