//! Scalar objectives over a trajectory.
//!
//! A [`Loss`] is a sum of pointwise terms at fixed observation times plus an
//! optional term in the parameters alone. Each pointwise term also reports
//! its gradient with respect to the state, which the adjoint pass injects as
//! a jump in the costate.

use crate::error::{config_bail, SolveError, SolveResult};
use crate::trajectory::Trajectory;
use serde::{Deserialize, Serialize};

pub trait Loss {
    /// Ascending observation times inside the forward span.
    fn observation_times(&self) -> &[f64];

    /// Value of the `k`-th pointwise term at `state`; writes its gradient
    /// with respect to `state` into `grad` (pre-zeroed by the caller).
    fn pointwise(&self, k: usize, t: f64, state: &[f64], grad: &mut [f64]) -> f64;

    /// Term depending only on the parameters; adds its gradient into `grad`.
    fn parameter_term(&self, _params: &[f64], _grad: &mut [f64]) -> f64 {
        0.0
    }

    /// Checks the loss against the state dimension of the system it observes.
    fn validate(&self, _dimension: usize) -> SolveResult<()> {
        Ok(())
    }
}

impl<L: Loss + ?Sized> Loss for &L {
    fn observation_times(&self) -> &[f64] {
        (**self).observation_times()
    }

    fn pointwise(&self, k: usize, t: f64, state: &[f64], grad: &mut [f64]) -> f64 {
        (**self).pointwise(k, t, state, grad)
    }

    fn parameter_term(&self, params: &[f64], grad: &mut [f64]) -> f64 {
        (**self).parameter_term(params, grad)
    }

    fn validate(&self, dimension: usize) -> SolveResult<()> {
        (**self).validate(dimension)
    }
}

/// Weighted sum of squared residuals on selected components, with an
/// optional L2 penalty on the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SquaredErrorFields")]
pub struct SquaredError {
    times: Vec<f64>,
    /// `observations[k][c]` is the target for `components[c]` at `times[k]`.
    observations: Vec<Vec<f64>>,
    components: Vec<usize>,
    weights: Vec<f64>,
    l2: f64,
}

impl SquaredError {
    pub fn new(
        times: Vec<f64>,
        observations: Vec<Vec<f64>>,
        components: Vec<usize>,
    ) -> SolveResult<Self> {
        if times.len() != observations.len() {
            config_bail!(
                "got {} observation times but {} observation rows",
                times.len(),
                observations.len()
            );
        }
        if components.is_empty() {
            config_bail!("at least one observed component is required");
        }
        if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[0] >= w[1]) {
            config_bail!("observation times must be finite and strictly increasing");
        }
        if let Some(row) = observations.iter().find(|row| row.len() != components.len()) {
            config_bail!(
                "observation row has {} values, expected {}",
                row.len(),
                components.len()
            );
        }
        let weights = vec![1.0; components.len()];
        Ok(Self {
            times,
            observations,
            components,
            weights,
            l2: 0.0,
        })
    }

    /// Observes every component of `trajectory` at the given times.
    pub fn from_trajectory(trajectory: &Trajectory, times: Vec<f64>) -> SolveResult<Self> {
        let mut rows = Vec::with_capacity(times.len());
        for &t in &times {
            match trajectory.sample(t) {
                Some(state) => rows.push(state),
                None => config_bail!("observation time {t} lies outside the trajectory"),
            }
        }
        Self::new(times, rows, (0..trajectory.dimension()).collect())
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> SolveResult<Self> {
        if weights.len() != self.components.len() {
            config_bail!(
                "got {} weights for {} components",
                weights.len(),
                self.components.len()
            );
        }
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            config_bail!("weights must be finite and non-negative");
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn components(&self) -> &[usize] {
        &self.components
    }
}

/// Wire form of [`SquaredError`]; deserialization goes through the same
/// checks as the constructors.
#[derive(Deserialize)]
struct SquaredErrorFields {
    times: Vec<f64>,
    observations: Vec<Vec<f64>>,
    components: Vec<usize>,
    #[serde(default)]
    weights: Option<Vec<f64>>,
    #[serde(default)]
    l2: f64,
}

impl TryFrom<SquaredErrorFields> for SquaredError {
    type Error = SolveError;

    fn try_from(fields: SquaredErrorFields) -> SolveResult<Self> {
        if !(fields.l2.is_finite() && fields.l2 >= 0.0) {
            config_bail!("l2 weight must be finite and non-negative, got {}", fields.l2);
        }
        let loss = Self::new(fields.times, fields.observations, fields.components)?;
        let loss = match fields.weights {
            Some(weights) => loss.with_weights(weights)?,
            None => loss,
        };
        Ok(loss.with_l2(fields.l2))
    }
}

impl Loss for SquaredError {
    fn observation_times(&self) -> &[f64] {
        &self.times
    }

    fn validate(&self, dimension: usize) -> SolveResult<()> {
        if let Some(&component) = self.components.iter().find(|&&c| c >= dimension) {
            config_bail!(
                "observed component {component} is out of range for a {dimension}-dimensional state"
            );
        }
        Ok(())
    }

    fn pointwise(&self, k: usize, _t: f64, state: &[f64], grad: &mut [f64]) -> f64 {
        let mut value = 0.0;
        for (c, &component) in self.components.iter().enumerate() {
            let residual = state[component] - self.observations[k][c];
            value += self.weights[c] * residual * residual;
            grad[component] += 2.0 * self.weights[c] * residual;
        }
        value
    }

    fn parameter_term(&self, params: &[f64], grad: &mut [f64]) -> f64 {
        if self.l2 == 0.0 {
            return 0.0;
        }
        let mut value = 0.0;
        for (g, &p) in grad.iter_mut().zip(params) {
            value += self.l2 * p * p;
            *g += 2.0 * self.l2 * p;
        }
        value
    }
}

/// Loss on the final state only.
pub struct TerminalLoss<F> {
    times: [f64; 1],
    f: F,
}

impl<F> TerminalLoss<F>
where
    F: Fn(&[f64], &mut [f64]) -> f64,
{
    /// `f(state, grad)` returns the value and writes its gradient.
    pub fn new(end_time: f64, f: F) -> Self {
        Self {
            times: [end_time],
            f,
        }
    }
}

impl<F> Loss for TerminalLoss<F>
where
    F: Fn(&[f64], &mut [f64]) -> f64,
{
    fn observation_times(&self) -> &[f64] {
        &self.times
    }

    fn pointwise(&self, _k: usize, _t: f64, state: &[f64], grad: &mut [f64]) -> f64 {
        (self.f)(state, grad)
    }
}

/// Loss value, the forward states it was evaluated on and the per-observation
/// state gradients.
#[derive(Debug, Clone)]
pub(crate) struct LossEvaluation {
    pub value: f64,
    pub gradients: Vec<Vec<f64>>,
    pub param_gradient: Vec<f64>,
}

pub(crate) fn evaluate_with_gradients<L: Loss + ?Sized>(
    loss: &L,
    trajectory: &Trajectory,
    params: &[f64],
) -> SolveResult<LossEvaluation> {
    let n = trajectory.dimension();
    loss.validate(n)?;
    let mut value = 0.0;
    let mut gradients = Vec::with_capacity(loss.observation_times().len());
    let mut state = vec![0.0; n];
    let mut previous = f64::NEG_INFINITY;
    for (k, &t) in loss.observation_times().iter().enumerate() {
        if t < previous {
            config_bail!("observation times must be ascending");
        }
        previous = t;
        if !trajectory.sample_into(t, &mut state) {
            config_bail!(
                "observation time {t} lies outside the solved span [{}, {}]",
                trajectory.start_time(),
                trajectory.end_time()
            );
        }
        let mut grad = vec![0.0; n];
        value += loss.pointwise(k, t, &state, &mut grad);
        gradients.push(grad);
    }
    let mut param_gradient = vec![0.0; params.len()];
    value += loss.parameter_term(params, &mut param_gradient);
    Ok(LossEvaluation {
        value,
        gradients,
        param_gradient,
    })
}

/// Evaluates `loss` on the dense output of `trajectory`.
pub fn evaluate_loss<L: Loss + ?Sized>(
    loss: &L,
    trajectory: &Trajectory,
    params: &[f64],
) -> SolveResult<f64> {
    evaluate_with_gradients(loss, trajectory, params).map(|e| e.value)
}
