//! Gradient-based fitting of parameters against a trajectory loss.
//!
//! Every iteration runs a forward solve, evaluates the loss, computes the
//! adjoint gradient and hands it to the active optimizer. The loop is written
//! as an explicit state machine over [`TrainerState`]; the final state and
//! the reason for stopping are reported in [`TrainingReport`].

use crate::adjoint::{adjoint_sensitivity_along, AdjointConfig};
use crate::error::{config_bail, SolveError, SolveResult};
use crate::integrator::{solve, IntegratorConfig, TimeSpan};
use crate::loss::{evaluate_loss, Loss};
use crate::optimizer::{Lbfgs, Optimizer, OptimizerConfig};
use crate::traits::Differentiable;
use crate::trajectory::Trajectory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    Init,
    Forward,
    Backward,
    Update,
    Converged,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Maximum number of parameter updates.
    pub max_iters: usize,
    /// Stop once the loss falls to this value.
    pub loss_tol: f64,
    /// Stop once the gradient norm falls to this value.
    pub grad_tol: f64,
    /// Switch from the first-order rule to L-BFGS after this many updates.
    pub switch_after: Option<usize>,
    /// Switch to L-BFGS when the relative loss improvement over
    /// `plateau_window` iterations drops below this.
    pub plateau_tol: Option<f64>,
    pub plateau_window: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_iters: 200,
            loss_tol: 0.0,
            grad_tol: 1e-8,
            switch_after: None,
            plateau_tol: None,
            plateau_window: 10,
        }
    }
}

impl TrainerConfig {
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_loss_tol(mut self, loss_tol: f64) -> Self {
        self.loss_tol = loss_tol;
        self
    }

    pub fn with_switch_after(mut self, iterations: usize) -> Self {
        self.switch_after = Some(iterations);
        self
    }

    pub fn with_plateau(mut self, tol: f64, window: usize) -> Self {
        self.plateau_tol = Some(tol);
        self.plateau_window = window;
        self
    }

    pub fn validate(&self) -> SolveResult<()> {
        if !(self.loss_tol >= 0.0) {
            config_bail!("loss_tol must be non-negative, got {}", self.loss_tol);
        }
        if !(self.grad_tol >= 0.0) {
            config_bail!("grad_tol must be non-negative, got {}", self.grad_tol);
        }
        if let Some(tol) = self.plateau_tol {
            if !(tol.is_finite() && tol >= 0.0) {
                config_bail!("plateau_tol must be non-negative, got {tol}");
            }
            if self.plateau_window == 0 {
                config_bail!("plateau_window must be at least 1");
            }
        }
        Ok(())
    }
}

/// Returned by an [`Observer`] after each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    Continue,
    Stop,
}

/// Per-iteration callback, given the iteration index, the current
/// parameters and their loss.
pub trait Observer {
    fn observe(&mut self, iteration: usize, params: &[f64], loss: f64) -> Control;
}

impl<F> Observer for F
where
    F: FnMut(usize, &[f64], f64) -> Control,
{
    fn observe(&mut self, iteration: usize, params: &[f64], loss: f64) -> Control {
        self(iteration, params, loss)
    }
}

/// Observer that never stops training.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl Observer for NoObserver {
    fn observe(&mut self, _iteration: usize, _params: &[f64], _loss: f64) -> Control {
        Control::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceReason {
    LossTolerance,
    GradientTolerance,
    MaxIterations,
    /// L-BFGS found no step satisfying the Armijo condition.
    LineSearchStalled,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum TrainingFailure {
    #[error("solve failed at iteration {iteration}: {error}")]
    Solve { iteration: usize, error: SolveError },

    #[error("undefined gradient at iteration {iteration} for parameters {params:?}")]
    Differentiation { iteration: usize, params: Vec<usize> },

    #[error("loss is not finite at iteration {iteration}")]
    NonFiniteLoss { iteration: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainingStatus {
    Converged(ConvergenceReason),
    Stopped,
    Failed(TrainingFailure),
}

impl TrainingStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TrainingStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Last parameters whose loss was successfully evaluated.
    pub params: Vec<f64>,
    /// One entry per forward evaluation, in order.
    pub loss_history: Vec<f64>,
    /// Number of parameter updates applied.
    pub iterations: usize,
    pub status: TrainingStatus,
    pub final_state: TrainerState,
    /// Update index at which L-BFGS took over, if it did.
    pub optimizer_switched_at: Option<usize>,
    /// Optimizer active when training ended.
    pub optimizer: String,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }
}

/// A fitting problem: dynamics, initial state, time span and loss, plus the
/// settings of every stage.
pub struct Trainer<'a, D: ?Sized, L: ?Sized> {
    dynamics: &'a D,
    loss: &'a L,
    y0: Vec<f64>,
    span: TimeSpan,
    integrator: IntegratorConfig,
    adjoint: AdjointConfig,
    optimizer: OptimizerConfig,
    config: TrainerConfig,
}

enum ActiveOptimizer {
    FirstOrder(Box<dyn Optimizer>),
    Lbfgs(Lbfgs),
}

impl<'a, D, L> Trainer<'a, D, L>
where
    D: Differentiable + ?Sized,
    L: Loss + ?Sized,
{
    pub fn new(dynamics: &'a D, loss: &'a L, y0: Vec<f64>, span: TimeSpan) -> Self {
        Self {
            dynamics,
            loss,
            y0,
            span,
            integrator: IntegratorConfig::default(),
            adjoint: AdjointConfig::default(),
            optimizer: OptimizerConfig::default(),
            config: TrainerConfig::default(),
        }
    }

    pub fn with_integrator(mut self, integrator: IntegratorConfig) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_adjoint(mut self, adjoint: AdjointConfig) -> Self {
        self.adjoint = adjoint;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_config(mut self, config: TrainerConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self, initial: &[f64]) -> SolveResult<()> {
        self.integrator.validate()?;
        self.optimizer.validate()?;
        self.config.validate()?;
        self.span.validate()?;
        if self.span.direction() < 0.0 {
            config_bail!("training needs a forward time span");
        }
        if initial.len() != self.dynamics.num_params() {
            config_bail!(
                "parameter dimension mismatch: expected {}, got {}",
                self.dynamics.num_params(),
                initial.len()
            );
        }
        if self.y0.len() != self.dynamics.dimension() {
            config_bail!(
                "initial state has {} components, system has {}",
                self.y0.len(),
                self.dynamics.dimension()
            );
        }
        self.loss.validate(self.dynamics.dimension())
    }

    /// Forward solve only; used by the line search and by `fit` callers
    /// that want the loss at given parameters.
    pub fn loss_at(&self, params: &[f64]) -> SolveResult<f64> {
        let trajectory = solve(self.dynamics, params, &self.y0, self.span, &self.integrator)?;
        evaluate_loss(self.loss, &trajectory, params)
    }

    pub fn fit(&self, initial: &[f64]) -> SolveResult<TrainingReport> {
        self.run(initial, &mut NoObserver)
    }

    /// Trains from `initial`. Configuration errors are returned before any
    /// solve; failures during training end up in the report status.
    pub fn run<O: Observer + ?Sized>(
        &self,
        initial: &[f64],
        observer: &mut O,
    ) -> SolveResult<TrainingReport> {
        let mut state = TrainerState::Init;
        let mut params = initial.to_vec();
        let mut last_valid = params.clone();
        let mut loss_history = Vec::new();
        let mut iterations = 0;
        let mut switched_at = None;
        let mut optimizer = ActiveOptimizer::FirstOrder(self.optimizer.build(params.len()));
        let mut forward: Option<Trajectory> = None;
        let mut gradient = Vec::new();
        let mut status = None;

        loop {
            state = match state {
                TrainerState::Init => {
                    self.validate(initial)?;
                    TrainerState::Forward
                }
                TrainerState::Forward => {
                    let evaluated = match forward.take() {
                        Some(trajectory) => Ok(trajectory),
                        None => solve(self.dynamics, &params, &self.y0, self.span, &self.integrator),
                    }
                    .and_then(|trajectory| {
                        let loss = evaluate_loss(self.loss, &trajectory, &params)?;
                        Ok((trajectory, loss))
                    });
                    match evaluated {
                        Ok((_, loss)) if !loss.is_finite() => {
                            status = Some(TrainingStatus::Failed(
                                TrainingFailure::NonFiniteLoss {
                                    iteration: iterations,
                                },
                            ));
                            TrainerState::Failed
                        }
                        Ok((trajectory, loss)) => {
                            loss_history.push(loss);
                            last_valid.clone_from(&params);
                            forward = Some(trajectory);
                            TrainerState::Backward
                        }
                        Err(error) => {
                            status = Some(TrainingStatus::Failed(TrainingFailure::Solve {
                                iteration: iterations,
                                error,
                            }));
                            TrainerState::Failed
                        }
                    }
                }
                TrainerState::Backward => {
                    let Some(trajectory) = forward.take() else {
                        config_bail!("backward pass reached without a forward trajectory");
                    };
                    let loss = loss_history.last().copied().unwrap_or(f64::NAN);
                    match adjoint_sensitivity_along(
                        self.dynamics,
                        &params,
                        &trajectory,
                        self.loss,
                        &self.integrator,
                        &self.adjoint,
                    ) {
                        Err(error) => {
                            status = Some(TrainingStatus::Failed(TrainingFailure::Solve {
                                iteration: iterations,
                                error,
                            }));
                            TrainerState::Failed
                        }
                        Ok(sensitivity) if !sensitivity.is_defined() => {
                            let mut poisoned = sensitivity.poisoned_params;
                            if poisoned.is_empty() {
                                poisoned = (0..params.len()).collect();
                            }
                            status = Some(TrainingStatus::Failed(
                                TrainingFailure::Differentiation {
                                    iteration: iterations,
                                    params: poisoned,
                                },
                            ));
                            TrainerState::Failed
                        }
                        Ok(sensitivity) => {
                            let grad_norm = sensitivity.gradient_norm();
                            gradient = sensitivity.param_gradient;
                            if observer.observe(iterations, &params, loss) == Control::Stop {
                                status = Some(TrainingStatus::Stopped);
                                TrainerState::Converged
                            } else if let Some(reason) =
                                self.convergence(loss, grad_norm, iterations)
                            {
                                status = Some(TrainingStatus::Converged(reason));
                                TrainerState::Converged
                            } else {
                                TrainerState::Update
                            }
                        }
                    }
                }
                TrainerState::Update => {
                    if switched_at.is_none() && self.should_switch(iterations, &loss_history) {
                        optimizer = ActiveOptimizer::Lbfgs(self.optimizer.lbfgs());
                        switched_at = Some(iterations);
                    }
                    match &mut optimizer {
                        ActiveOptimizer::FirstOrder(rule) => {
                            rule.step(&mut params, &gradient);
                            iterations += 1;
                            TrainerState::Forward
                        }
                        ActiveOptimizer::Lbfgs(lbfgs) => {
                            let loss = loss_history.last().copied().unwrap_or(f64::NAN);
                            let direction = lbfgs.direction(&params, &gradient);
                            let mut accepted: Option<Trajectory> = None;
                            let step = lbfgs.line_search(
                                &params,
                                loss,
                                &gradient,
                                &direction,
                                |trial| {
                                    let trajectory = solve(
                                        self.dynamics,
                                        trial,
                                        &self.y0,
                                        self.span,
                                        &self.integrator,
                                    )
                                    .ok()?;
                                    let value = evaluate_loss(self.loss, &trajectory, trial).ok()?;
                                    accepted = Some(trajectory);
                                    Some(value)
                                },
                            );
                            match step {
                                Some(step) => {
                                    params = step.params;
                                    forward = accepted;
                                    iterations += 1;
                                    TrainerState::Forward
                                }
                                None => {
                                    status = Some(TrainingStatus::Converged(
                                        ConvergenceReason::LineSearchStalled,
                                    ));
                                    TrainerState::Converged
                                }
                            }
                        }
                    }
                }
                TrainerState::Converged | TrainerState::Failed => break,
            };
        }

        let status = match status {
            Some(status) => status,
            None => config_bail!("training ended without a status"),
        };
        let optimizer = match &optimizer {
            ActiveOptimizer::FirstOrder(rule) => rule.name(),
            ActiveOptimizer::Lbfgs(_) => "lbfgs",
        };
        Ok(TrainingReport {
            params: last_valid,
            loss_history,
            iterations,
            status,
            final_state: state,
            optimizer_switched_at: switched_at,
            optimizer: optimizer.to_string(),
        })
    }

    fn convergence(&self, loss: f64, grad_norm: f64, iterations: usize) -> Option<ConvergenceReason> {
        if loss <= self.config.loss_tol {
            Some(ConvergenceReason::LossTolerance)
        } else if grad_norm <= self.config.grad_tol {
            Some(ConvergenceReason::GradientTolerance)
        } else if iterations >= self.config.max_iters {
            Some(ConvergenceReason::MaxIterations)
        } else {
            None
        }
    }

    fn should_switch(&self, iterations: usize, history: &[f64]) -> bool {
        if let Some(after) = self.config.switch_after {
            if iterations >= after {
                return true;
            }
        }
        let Some(tol) = self.config.plateau_tol else {
            return false;
        };
        let window = self.config.plateau_window;
        if history.len() <= window {
            return false;
        }
        let last = history[history.len() - 1];
        let earlier = history[history.len() - 1 - window];
        (earlier - last) / earlier.abs().max(f64::MIN_POSITIVE) < tol
    }
}
