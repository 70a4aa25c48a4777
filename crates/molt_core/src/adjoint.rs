//! Gradients of a trajectory loss by backward integration of the costate.
//!
//! For `dy/dt = f(t, y, θ)` and a loss made of pointwise terms `ℓ_k(y(t_k))`
//! the augmented backward system is
//!
//! ```text
//! dλ/dt = -(∂f/∂y)ᵀ λ        λ(t_N) = ∂ℓ_N/∂y
//! dμ/dt = -(∂f/∂θ)ᵀ λ        μ(t_N) = 0
//! ```
//!
//! integrated from the last observation back to `t0`, with `λ` jumping by
//! `∂ℓ_k/∂y` at every earlier observation. At `t0`, `λ` is the gradient with
//! respect to the initial state and `μ` the gradient with respect to `θ`.

use crate::error::{config_bail, SolveResult};
use crate::integrator::{solve, solve_controlled, IntegratorConfig, TimeSpan};
use crate::loss::{evaluate_loss, evaluate_with_gradients, Loss};
use crate::traits::{Differentiable, Dynamics};
use crate::trajectory::{SolveStats, Trajectory};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Where the backward pass reads the forward state from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardState {
    /// Dense output of the stored forward trajectory.
    #[default]
    Interpolate,
    /// Re-solve forward from a checkpoint at the start of every backward
    /// sub-interval; only the checkpoint states are read from the stored
    /// trajectory.
    Recompute,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjointConfig {
    pub forward_state: ForwardState,
    /// Include the parameter quadrature `μ` in the backward error norm.
    pub control_quadrature: bool,
    /// Extra uniformly spaced checkpoints used by [`ForwardState::Recompute`]
    /// on top of the observation times.
    pub checkpoints: usize,
    /// Backward tolerances; the forward ones are reused when absent.
    pub abstol: Option<f64>,
    pub reltol: Option<f64>,
}

impl Default for AdjointConfig {
    fn default() -> Self {
        Self {
            forward_state: ForwardState::Interpolate,
            control_quadrature: false,
            checkpoints: 0,
            abstol: None,
            reltol: None,
        }
    }
}

impl AdjointConfig {
    pub fn with_forward_state(mut self, forward_state: ForwardState) -> Self {
        self.forward_state = forward_state;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: usize) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_adjoint_tolerances(mut self, abstol: f64, reltol: f64) -> Self {
        self.abstol = Some(abstol);
        self.reltol = Some(reltol);
        self
    }

    fn backward_config(&self, forward: &IntegratorConfig) -> IntegratorConfig {
        IntegratorConfig {
            abstol: self.abstol.unwrap_or(forward.abstol),
            reltol: self.reltol.unwrap_or(forward.reltol),
            ..*forward
        }
    }
}

/// Loss value and its gradients.
///
/// Entries whose derivative was undefined somewhere along the backward pass
/// are NaN. If the costate itself was affected every entry is NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensitivity {
    pub loss: f64,
    pub param_gradient: Vec<f64>,
    pub initial_state_gradient: Vec<f64>,
    pub forward_stats: SolveStats,
    pub backward_stats: SolveStats,
    /// Parameter indices whose vector-Jacobian product came back undefined.
    pub poisoned_params: Vec<usize>,
    /// Whether an undefined state derivative reached the costate.
    pub state_poisoned: bool,
}

impl Sensitivity {
    pub fn is_defined(&self) -> bool {
        self.param_gradient.iter().all(|g| !g.is_nan())
    }

    pub fn gradient_norm(&self) -> f64 {
        self.param_gradient.iter().map(|g| g * g).sum::<f64>().sqrt()
    }
}

#[derive(Debug, Default)]
struct Poison {
    state: bool,
    params: Vec<bool>,
}

struct Scratch {
    x: Vec<f64>,
    dx: Vec<f64>,
    dp: Vec<f64>,
}

/// Augmented backward system `[λ; μ]` driven by a forward trajectory.
struct CostateDynamics<'a, D: ?Sized> {
    dynamics: &'a D,
    params: &'a [f64],
    forward: &'a Trajectory,
    poison: &'a RefCell<Poison>,
    scratch: RefCell<Scratch>,
}

impl<'a, D: Differentiable + ?Sized> CostateDynamics<'a, D> {
    fn new(
        dynamics: &'a D,
        params: &'a [f64],
        forward: &'a Trajectory,
        poison: &'a RefCell<Poison>,
    ) -> Self {
        let n = dynamics.dimension();
        Self {
            dynamics,
            params,
            forward,
            poison,
            scratch: RefCell::new(Scratch {
                x: vec![0.0; n],
                dx: vec![0.0; n],
                dp: vec![0.0; params.len()],
            }),
        }
    }
}

impl<D: Differentiable + ?Sized> Dynamics for CostateDynamics<'_, D> {
    fn dimension(&self) -> usize {
        self.dynamics.dimension() + self.params.len()
    }

    fn eval(&self, t: f64, z: &[f64], _params: &[f64], out: &mut [f64]) {
        let n = self.dynamics.dimension();
        let mut scratch = self.scratch.borrow_mut();
        let Scratch { x, dx, dp } = &mut *scratch;
        let tc = t.clamp(self.forward.start_time(), self.forward.end_time());
        self.forward.sample_into(tc, x);
        self.dynamics.vjp(tc, x, self.params, &z[..n], dx, dp);

        let mut poison = self.poison.borrow_mut();
        for (slot, d) in out[..n].iter_mut().zip(dx.iter()) {
            if d.is_finite() {
                *slot = -d;
            } else {
                poison.state = true;
                *slot = 0.0;
            }
        }
        for (j, (slot, d)) in out[n..].iter_mut().zip(dp.iter()).enumerate() {
            if d.is_finite() {
                *slot = -d;
            } else {
                poison.params[j] = true;
                *slot = 0.0;
            }
        }
    }
}

/// Solves forward, then computes the loss gradients by the adjoint method.
#[allow(clippy::too_many_arguments)]
pub fn adjoint_sensitivity<D, L>(
    dynamics: &D,
    params: &[f64],
    y0: &[f64],
    span: TimeSpan,
    loss: &L,
    config: &IntegratorConfig,
    adjoint: &AdjointConfig,
) -> SolveResult<Sensitivity>
where
    D: Differentiable + ?Sized,
    L: Loss + ?Sized,
{
    if span.direction() < 0.0 {
        config_bail!("adjoint sensitivities need a forward span");
    }
    loss.validate(dynamics.dimension())?;
    let forward = solve(dynamics, params, y0, span, config)?;
    adjoint_sensitivity_along(dynamics, params, &forward, loss, config, adjoint)
}

/// Adjoint gradients reusing an existing forward trajectory.
pub fn adjoint_sensitivity_along<D, L>(
    dynamics: &D,
    params: &[f64],
    forward: &Trajectory,
    loss: &L,
    config: &IntegratorConfig,
    adjoint: &AdjointConfig,
) -> SolveResult<Sensitivity>
where
    D: Differentiable + ?Sized,
    L: Loss + ?Sized,
{
    let n = dynamics.dimension();
    let p = params.len();
    if forward.dimension() != n {
        config_bail!(
            "trajectory dimension {} does not match system dimension {n}",
            forward.dimension()
        );
    }
    if p != dynamics.num_params() {
        config_bail!(
            "parameter dimension mismatch: expected {}, got {p}",
            dynamics.num_params()
        );
    }
    let backward_config = adjoint.backward_config(config);
    backward_config.validate()?;

    let evaluation = evaluate_with_gradients(loss, forward, params)?;
    let (t0, tf) = (forward.start_time(), forward.end_time());
    let times = loss.observation_times();

    let mut boundaries: Vec<f64> = times.to_vec();
    if adjoint.forward_state == ForwardState::Recompute && adjoint.checkpoints > 0 {
        let spacing = (tf - t0) / (adjoint.checkpoints as f64 + 1.0);
        boundaries.extend((1..=adjoint.checkpoints).map(|i| t0 + i as f64 * spacing));
        boundaries.sort_by(f64::total_cmp);
    }

    let poison = RefCell::new(Poison {
        state: false,
        params: vec![false; p],
    });
    let controlled = if adjoint.control_quadrature { n + p } else { n };
    let mut z = vec![0.0; n + p];
    let mut forward_stats = forward.stats;
    let mut backward_stats = SolveStats::default();
    let mut current = tf;
    let mut pending = times.len();
    let close = |a: f64, b: f64| (a - b).abs() <= 16.0 * f64::EPSILON * a.abs().max(b.abs());

    // Walk the sub-interval boundaries from the end back to t0, applying the
    // costate jump of every observation sitting on a boundary.
    for &stop in boundaries.iter().rev().chain(std::iter::once(&t0)) {
        if !close(current, stop) && stop < current {
            let span = TimeSpan::new(current, stop);
            let local;
            let source = match adjoint.forward_state {
                ForwardState::Interpolate => forward,
                ForwardState::Recompute => {
                    let Some(checkpoint) = forward.sample(stop) else {
                        config_bail!("checkpoint time {stop} lies outside the trajectory");
                    };
                    local = solve(
                        dynamics,
                        params,
                        &checkpoint,
                        TimeSpan::new(stop, current),
                        config,
                    )?;
                    forward_stats.absorb(&local.stats);
                    &local
                }
            };
            let costate = CostateDynamics::new(dynamics, params, source, &poison);
            let backward = solve_controlled(&costate, &[], &z, span, &backward_config, controlled)?;
            backward_stats.absorb(&backward.stats);
            z.copy_from_slice(backward.first_state());
            current = stop;
        }
        while pending > 0 && close(times[pending - 1], current) {
            pending -= 1;
            for (lambda, g) in z[..n].iter_mut().zip(&evaluation.gradients[pending]) {
                *lambda += g;
            }
        }
    }

    let poison = poison.into_inner();
    let mut param_gradient: Vec<f64> = z[n..]
        .iter()
        .zip(&evaluation.param_gradient)
        .map(|(mu, g)| mu + g)
        .collect();
    let mut initial_state_gradient = z[..n].to_vec();
    let poisoned_params: Vec<usize> = poison
        .params
        .iter()
        .enumerate()
        .filter_map(|(j, &bad)| bad.then_some(j))
        .collect();
    if poison.state {
        param_gradient.fill(f64::NAN);
        initial_state_gradient.fill(f64::NAN);
    } else {
        for &j in &poisoned_params {
            param_gradient[j] = f64::NAN;
        }
    }

    Ok(Sensitivity {
        loss: evaluation.value,
        param_gradient,
        initial_state_gradient,
        forward_stats,
        backward_stats,
        poisoned_params,
        state_poisoned: poison.state,
    })
}

/// Central finite-difference gradient of the loss with respect to `params`.
///
/// Each entry costs two forward solves; meant for checking adjoint results.
#[allow(clippy::too_many_arguments)]
pub fn finite_difference_gradient<D, L>(
    dynamics: &D,
    params: &[f64],
    y0: &[f64],
    span: TimeSpan,
    loss: &L,
    config: &IntegratorConfig,
    step: f64,
) -> SolveResult<Vec<f64>>
where
    D: Dynamics + ?Sized,
    L: Loss + ?Sized,
{
    if !(step.is_finite() && step > 0.0) {
        config_bail!("finite-difference step must be positive, got {step}");
    }
    let mut probe = params.to_vec();
    let mut gradient = Vec::with_capacity(params.len());
    for j in 0..params.len() {
        let h = step * params[j].abs().max(1.0);
        probe[j] = params[j] + h;
        let plus = evaluate_loss(loss, &solve(dynamics, &probe, y0, span, config)?, &probe)?;
        probe[j] = params[j] - h;
        let minus = evaluate_loss(loss, &solve(dynamics, &probe, y0, span, config)?, &probe)?;
        probe[j] = params[j];
        gradient.push((plus - minus) / (2.0 * h));
    }
    Ok(gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SolveError;
    use crate::loss::{SquaredError, TerminalLoss};
    use crate::models::{LinearDecay, LotkaVolterra};
    use approx::assert_relative_eq;

    fn tight() -> IntegratorConfig {
        IntegratorConfig::default().with_tolerances(1e-11, 1e-9)
    }

    #[test]
    fn terminal_loss_gradient_matches_closed_form() {
        // y' = -k y, J = y(T)², dJ/dk = -2 T y(T)², dJ/dy0 = 2 y(T) e^{-kT}.
        let model = LinearDecay::new(1).lifted();
        let (k, y0, end) = (0.8, 1.5, 2.0);
        let loss = TerminalLoss::new(end, |s: &[f64], g: &mut [f64]| {
            g[0] = 2.0 * s[0];
            s[0] * s[0]
        });
        let sens = adjoint_sensitivity(
            &model,
            &[k],
            &[y0],
            TimeSpan::new(0.0, end),
            &loss,
            &tight(),
            &AdjointConfig::default(),
        )
        .expect("sensitivity");
        let y_end = y0 * (-k * end).exp();
        assert_relative_eq!(sens.loss, y_end * y_end, max_relative = 1e-7);
        assert_relative_eq!(sens.param_gradient[0], -2.0 * end * y_end * y_end, max_relative = 1e-5);
        assert_relative_eq!(
            sens.initial_state_gradient[0],
            2.0 * y_end * (-k * end).exp(),
            max_relative = 1e-5
        );
        assert!(sens.backward_stats.accepted > 0);
    }

    #[test]
    fn interior_observations_match_finite_differences() {
        let model = LotkaVolterra.lifted();
        let params = [1.5, 1.0, 1.0, 3.0];
        let y0 = [1.0, 1.0];
        let span = TimeSpan::new(0.0, 5.0);
        let reference = solve(&model, &[1.4, 0.9, 1.1, 3.1], &y0, span, &tight())
            .expect("reference");
        let loss = SquaredError::from_trajectory(&reference, vec![0.0, 1.0, 2.5, 4.0, 5.0])
            .expect("loss");
        let fd = finite_difference_gradient(&model, &params, &y0, span, &loss, &tight(), 1e-4)
            .expect("fd");
        for mode in [ForwardState::Interpolate, ForwardState::Recompute] {
            let sens = adjoint_sensitivity(
                &model,
                &params,
                &y0,
                span,
                &loss,
                &tight(),
                &AdjointConfig::default()
                    .with_forward_state(mode)
                    .with_checkpoints(3),
            )
            .expect("adjoint");
            for (a, f) in sens.param_gradient.iter().zip(&fd) {
                assert_relative_eq!(*a, *f, max_relative = 1e-3, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn undefined_parameter_derivative_poisons_only_that_entry() {
        struct Kinked;
        impl Dynamics for Kinked {
            fn dimension(&self) -> usize {
                1
            }
            fn num_params(&self) -> usize {
                2
            }
            fn eval(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
                out[0] = -p[0] * x[0] + p[1].abs();
            }
        }
        impl Differentiable for Kinked {
            fn vjp(
                &self,
                _t: f64,
                x: &[f64],
                p: &[f64],
                v: &[f64],
                dx: &mut [f64],
                dp: &mut [f64],
            ) {
                dx[0] = -p[0] * v[0];
                dp[0] = -x[0] * v[0];
                dp[1] = if p[1] == 0.0 { f64::NAN } else { p[1].signum() * v[0] };
            }
        }
        let loss = TerminalLoss::new(1.0, |s: &[f64], g: &mut [f64]| {
            g[0] = 1.0;
            s[0]
        });
        let sens = adjoint_sensitivity(
            &Kinked,
            &[1.0, 0.0],
            &[1.0],
            TimeSpan::new(0.0, 1.0),
            &loss,
            &tight(),
            &AdjointConfig::default(),
        )
        .expect("sensitivity");
        assert!(sens.param_gradient[0].is_finite());
        assert!(sens.param_gradient[1].is_nan());
        assert_eq!(sens.poisoned_params, vec![1]);
        assert!(!sens.state_poisoned);
        assert!(!sens.is_defined());
    }

    #[test]
    fn rejects_backward_span_and_mismatched_params() {
        let model = LinearDecay::new(1).lifted();
        let loss = TerminalLoss::new(0.0, |s: &[f64], g: &mut [f64]| {
            g[0] = 1.0;
            s[0]
        });
        assert!(adjoint_sensitivity(
            &model,
            &[1.0],
            &[1.0],
            TimeSpan::new(1.0, 0.0),
            &loss,
            &tight(),
            &AdjointConfig::default(),
        )
        .is_err());
        assert!(adjoint_sensitivity(
            &model,
            &[1.0, 2.0],
            &[1.0],
            TimeSpan::new(0.0, 1.0),
            &loss,
            &tight(),
            &AdjointConfig::default(),
        )
        .is_err());
    }

    #[test]
    fn observed_component_outside_state_is_rejected() {
        let model = LinearDecay::new(1).lifted();
        let loss = SquaredError::new(vec![0.5], vec![vec![0.0]], vec![3]).expect("loss");
        let result = adjoint_sensitivity(
            &model,
            &[1.0],
            &[1.0],
            TimeSpan::new(0.0, 1.0),
            &loss,
            &tight(),
            &AdjointConfig::default(),
        );
        assert!(matches!(result, Err(SolveError::Config(_))), "{result:?}");
    }
}
