//! Analytic reference models, written once over [`Scalar`] so that
//! [`DualDynamics`] can differentiate them exactly.
//!
//! Parameters are taken from the parameter slice, never from the struct, so
//! the adjoint can report gradients with respect to them.

use crate::autodiff::DualDynamics;
use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};

/// Kermack-McKendrick SIR model on a closed population.
///
/// State `[S, I, R]`, parameters `[β, γ]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sir {
    pub population: f64,
}

impl Sir {
    pub fn new(population: f64) -> Self {
        Self { population }
    }

    pub fn lifted(self) -> DualDynamics<Self> {
        DualDynamics::new(self)
    }
}

impl<T: Scalar> DynamicalSystem<T> for Sir {
    fn dimension(&self) -> usize {
        3
    }

    fn num_params(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        let (beta, gamma) = (p[0], p[1]);
        let infection = beta * x[0] * x[1] / T::lit(self.population);
        let recovery = gamma * x[1];
        out[0] = -infection;
        out[1] = infection - recovery;
        out[2] = recovery;
    }
}

/// Damped pendulum. State `[θ, ω]`, parameters `[ω₀², damping]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pendulum;

impl Pendulum {
    pub fn lifted(self) -> DualDynamics<Self> {
        DualDynamics::new(self)
    }
}

impl<T: Scalar> DynamicalSystem<T> for Pendulum {
    fn dimension(&self) -> usize {
        2
    }

    fn num_params(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        out[0] = x[1];
        out[1] = -p[0] * x[0].sin() - p[1] * x[1];
    }
}

/// Predator-prey model. State `[prey, predator]`, parameters `[α, β, δ, γ]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LotkaVolterra;

impl LotkaVolterra {
    pub fn lifted(self) -> DualDynamics<Self> {
        DualDynamics::new(self)
    }
}

impl<T: Scalar> DynamicalSystem<T> for LotkaVolterra {
    fn dimension(&self) -> usize {
        2
    }

    fn num_params(&self) -> usize {
        4
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        let (alpha, beta, delta, gamma) = (p[0], p[1], p[2], p[3]);
        out[0] = alpha * x[0] - beta * x[0] * x[1];
        out[1] = delta * x[0] * x[1] - gamma * x[1];
    }
}

/// `u' = -k u` applied to every component; one parameter `k`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearDecay {
    pub dimension: usize,
}

impl LinearDecay {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn lifted(self) -> DualDynamics<Self> {
        DualDynamics::new(self)
    }
}

impl<T: Scalar> DynamicalSystem<T> for LinearDecay {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn num_params(&self) -> usize {
        1
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        for (o, &xi) in out.iter_mut().zip(x) {
            *o = -p[0] * xi;
        }
    }
}

/// Van der Pol oscillator, stiff for large `μ`. State `[x, y]`, parameter
/// `[μ]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VanDerPol;

impl VanDerPol {
    pub fn lifted(self) -> DualDynamics<Self> {
        DualDynamics::new(self)
    }
}

impl<T: Scalar> DynamicalSystem<T> for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn num_params(&self) -> usize {
        1
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        out[0] = x[1];
        out[1] = p[0] * ((T::one() - x[0] * x[0]) * x[1] - x[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{solve, IntegratorConfig, TimeSpan};
    use crate::solvers::Method;
    use crate::traits::{Differentiable, Dynamics};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    #[test]
    fn sir_conserves_population() {
        let model = Sir::new(100.0).lifted();
        let traj = solve(
            &model,
            &[0.5, 0.2],
            &[99.0, 1.0, 0.0],
            TimeSpan::new(0.0, 50.0),
            &IntegratorConfig::default(),
        )
        .expect("solve");
        for state in traj.states() {
            assert_relative_eq!(state.iter().sum::<f64>(), 100.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn lotka_volterra_jacobian_matches_closed_form() {
        let model = LotkaVolterra.lifted();
        let params = [1.5, 1.0, 0.75, 3.0];
        let x = [2.0, 0.5];
        let mut jac = DMatrix::zeros(2, 2);
        model.jacobian(0.0, &x, &params, &mut jac);
        assert_relative_eq!(jac[(0, 0)], 1.5 - 0.5);
        assert_relative_eq!(jac[(0, 1)], -2.0);
        assert_relative_eq!(jac[(1, 0)], 0.75 * 0.5);
        assert_relative_eq!(jac[(1, 1)], 0.75 * 2.0 - 3.0);

        let mut dx = [0.0; 2];
        let mut dp = [0.0; 4];
        model.vjp(0.0, &x, &params, &[1.0, 0.0], &mut dx, &mut dp);
        // Only the prey equation is weighted: ∂/∂α = x, ∂/∂β = -xy.
        assert_eq!(dp, [2.0, -1.0, 0.0, 0.0]);
        assert_eq!(dx, [1.0, -2.0]);
    }

    #[test]
    fn pendulum_with_damping_loses_energy() {
        let model = Pendulum.lifted();
        let params = [4.0, 0.3];
        let traj = solve(
            &model,
            &params,
            &[1.0, 0.0],
            TimeSpan::new(0.0, 10.0),
            &IntegratorConfig::default().with_tolerances(1e-9, 1e-7),
        )
        .expect("solve");
        let energy = |s: &[f64]| 0.5 * s[1] * s[1] + params[0] * (1.0 - s[0].cos());
        assert!(energy(traj.last_state()) < 0.5 * energy(traj.first_state()));
    }

    #[test]
    fn stiff_van_der_pol_solves_with_sdirk() {
        let model = VanDerPol.lifted();
        let config = IntegratorConfig::default()
            .with_method(Method::Sdirk2)
            .with_tolerances(1e-6, 1e-4);
        let traj = solve(&model, &[1000.0], &[2.0, 0.0], TimeSpan::new(0.0, 0.5), &config)
            .expect("stiff solve");
        // On the slow manifold y = x / (1 - x²), so ln x - x²/2 grows like t
        // and x(0.5) ≈ 1.597.
        let x = traj.last_state()[0];
        assert!(x > 1.55 && x < 1.65, "x(0.5) = {x}");
        assert!(traj.stats.accepted < 2_000);
    }

    #[test]
    fn linear_decay_acts_componentwise() {
        let model = LinearDecay::new(3).lifted();
        let mut out = [0.0; 3];
        model.eval(0.0, &[1.0, -2.0, 4.0], &[0.5], &mut out);
        assert_eq!(out, [-0.5, 1.0, -2.0]);
        assert_eq!(model.num_params(), 1);
    }
}
