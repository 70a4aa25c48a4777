//! Two-stage, stiffly accurate SDIRK method of order 2.
//!
//! Both stages share the diagonal coefficient `γ = 1 - 1/√2`, so the Newton
//! matrix `I - hγJ` is factored once per step with the Jacobian frozen at
//! `(t, y)`. The embedded estimate is the first-order solution `y + hK₁`.

use crate::solvers::{AttemptSettings, StepWork};
use crate::traits::Dynamics;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

const GAMMA: f64 = 1.0 - std::f64::consts::FRAC_1_SQRT_2;

pub struct Sdirk2 {
    jacobian: DMatrix<f64>,
    k1: Vec<f64>,
    base: Vec<f64>,
    z: Vec<f64>,
    residual: Vec<f64>,
    f: Vec<f64>,
}

enum Stage {
    Converged,
    Failed,
}

impl Sdirk2 {
    pub const ORDER: usize = 2;
    pub const ERROR_ORDER: usize = 1;

    pub fn new(dim: usize) -> Self {
        Self {
            jacobian: DMatrix::zeros(dim, dim),
            k1: vec![0.0; dim],
            base: vec![0.0; dim],
            z: vec![0.0; dim],
            residual: vec![0.0; dim],
            f: vec![0.0; dim],
        }
    }

    /// Attempts one step of size `h` from `(t, y)`; `f0` must be `f(t, y)`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attempt<D: Dynamics + ?Sized>(
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
        let n = y.len();
        work.evaluations = 0;
        work.jacobians = 1;
        work.converged = false;

        dynamics.jacobian(t, y, params, &mut self.jacobian);
        let hg = h * GAMMA;
        let mut matrix = &self.jacobian * (-hg);
        for i in 0..n {
            matrix[(i, i)] += 1.0;
        }
        let lu = matrix.lu();

        // Stage 1: z₁ = y + hγ f(t + γh, z₁).
        self.base.copy_from_slice(y);
        for i in 0..n {
            self.z[i] = y[i] + hg * f0[i];
        }
        let stage = self.solve_stage(dynamics, params, t + GAMMA * h, hg, &lu, settings, work);
        if let Stage::Failed = stage {
            return;
        }
        for i in 0..n {
            self.k1[i] = (self.z[i] - self.base[i]) / hg;
        }

        // Stage 2: z₂ = y + h(1-γ)K₁ + hγ f(t + h, z₂).
        for i in 0..n {
            self.base[i] = y[i] + h * (1.0 - GAMMA) * self.k1[i];
            self.z[i] = self.base[i] + hg * self.k1[i];
        }
        let stage = self.solve_stage(dynamics, params, t + h, hg, &lu, settings, work);
        if let Stage::Failed = stage {
            return;
        }

        // Stiffly accurate: the last stage value is the solution, and
        // y₁ - (y + hK₁) = hγ(K₂ - K₁) = z₂ - base - hγK₁.
        for i in 0..n {
            work.y_new[i] = self.z[i];
            work.error[i] = self.z[i] - self.base[i] - hg * self.k1[i];
        }
        dynamics.eval(t + h, &work.y_new, params, &mut work.f_new);
        work.evaluations += 1;
        work.converged = true;
    }

    /// Simplified Newton on `G(z) = z - base - hγ f(tc, z)`, starting from
    /// the current contents of `self.z`.
    #[allow(clippy::too_many_arguments)]
    fn solve_stage<D: Dynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        params: &[f64],
        tc: f64,
        hg: f64,
        lu: &LU<f64, Dyn, Dyn>,
        settings: &AttemptSettings,
        work: &mut StepWork,
    ) -> Stage {
        let n = self.z.len();
        let mut previous = f64::INFINITY;
        for _ in 0..settings.newton_max_iters {
            dynamics.eval(tc, &self.z, params, &mut self.f);
            work.evaluations += 1;
            for i in 0..n {
                self.residual[i] = -(self.z[i] - self.base[i] - hg * self.f[i]);
            }
            let rhs = DVector::from_column_slice(&self.residual);
            let Some(delta) = lu.solve(&rhs) else {
                return Stage::Failed;
            };
            let mut sum = 0.0;
            for i in 0..n {
                let scale = settings.abstol + settings.reltol * self.z[i].abs();
                let ratio = delta[i] / scale;
                sum += ratio * ratio;
                self.z[i] += delta[i];
            }
            let norm = (sum / n.max(1) as f64).sqrt();
            if !norm.is_finite() {
                return Stage::Failed;
            }
            if norm <= settings.newton_tol {
                return Stage::Converged;
            }
            if norm > 2.0 * previous {
                return Stage::Failed;
            }
            previous = norm;
        }
        Stage::Failed
    }
}
