//! Parameter update rules used by the trainer.
//!
//! First-order rules ([`Adam`], [`Momentum`]) consume one gradient per call.
//! [`Lbfgs`] proposes a direction from its curvature history and finds the
//! step length with an Armijo backtracking search over forward-only loss
//! evaluations supplied by the caller.

use crate::error::{config_bail, SolveResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Momentum,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Heavy-ball coefficient for [`OptimizerKind::Momentum`].
    pub momentum: f64,
    pub nesterov: bool,
    /// Number of curvature pairs kept by L-BFGS.
    pub lbfgs_memory: usize,
    /// Sufficient-decrease constant of the Armijo condition.
    pub armijo: f64,
    /// Step shrink factor per backtracking trial.
    pub backtrack: f64,
    pub max_line_search: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            momentum: 0.9,
            nesterov: false,
            lbfgs_memory: 10,
            armijo: 1e-4,
            backtrack: 0.5,
            max_line_search: 20,
        }
    }
}

impl OptimizerConfig {
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate,
            ..Self::default()
        }
    }

    pub fn momentum(learning_rate: f64, momentum: f64) -> Self {
        Self {
            kind: OptimizerKind::Momentum,
            learning_rate,
            momentum,
            ..Self::default()
        }
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn validate(&self) -> SolveResult<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            config_bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        for (name, value) in [
            ("beta1", self.beta1),
            ("beta2", self.beta2),
            ("momentum", self.momentum),
        ] {
            if !(0.0..1.0).contains(&value) {
                config_bail!("{name} must lie in [0, 1), got {value}");
            }
        }
        if !(self.epsilon > 0.0) {
            config_bail!("epsilon must be positive, got {}", self.epsilon);
        }
        if self.lbfgs_memory == 0 {
            config_bail!("lbfgs_memory must be at least 1");
        }
        if !(self.armijo > 0.0 && self.armijo < 1.0) {
            config_bail!("armijo constant must lie in (0, 1), got {}", self.armijo);
        }
        if !(self.backtrack > 0.0 && self.backtrack < 1.0) {
            config_bail!("backtrack factor must lie in (0, 1), got {}", self.backtrack);
        }
        if self.max_line_search == 0 {
            config_bail!("max_line_search must be at least 1");
        }
        Ok(())
    }

    /// First-order rule selected by `kind`, sized for `dim` parameters.
    pub fn build(&self, dim: usize) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Adam => Box::new(Adam::new(self, dim)),
            OptimizerKind::Momentum => Box::new(Momentum::new(self, dim)),
        }
    }

    pub fn lbfgs(&self) -> Lbfgs {
        Lbfgs::new(self)
    }
}

/// A gradient-driven in-place update of the parameter vector.
pub trait Optimizer {
    fn step(&mut self, params: &mut [f64], grad: &[f64]);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    pub fn new(config: &OptimizerConfig, dim: usize) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            m: vec![0.0; dim],
            v: vec![0.0; dim],
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        self.t = self.t.saturating_add(1);
        let correction1 = 1.0 - self.beta1.powi(self.t);
        let correction2 = 1.0 - self.beta2.powi(self.t);
        for i in 0..params.len() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * grad[i];
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * grad[i] * grad[i];
            let m_hat = self.m[i] / correction1;
            let v_hat = self.v[i] / correction2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn name(&self) -> &'static str {
        "adam"
    }
}

/// Heavy-ball momentum, optionally with the Nesterov look-ahead.
#[derive(Debug, Clone)]
pub struct Momentum {
    learning_rate: f64,
    momentum: f64,
    nesterov: bool,
    velocity: Vec<f64>,
}

impl Momentum {
    pub fn new(config: &OptimizerConfig, dim: usize) -> Self {
        Self {
            learning_rate: config.learning_rate,
            momentum: config.momentum,
            nesterov: config.nesterov,
            velocity: vec![0.0; dim],
        }
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        for i in 0..params.len() {
            self.velocity[i] = self.momentum * self.velocity[i] + grad[i];
            let update = if self.nesterov {
                grad[i] + self.momentum * self.velocity[i]
            } else {
                self.velocity[i]
            };
            params[i] -= self.learning_rate * update;
        }
    }

    fn name(&self) -> &'static str {
        if self.nesterov {
            "nesterov"
        } else {
            "momentum"
        }
    }
}

/// Accepted step of a line search.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSearchStep {
    pub params: Vec<f64>,
    pub loss: f64,
    pub step: f64,
    pub evaluations: usize,
}

struct CurvaturePair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Limited-memory BFGS with Armijo backtracking.
pub struct Lbfgs {
    memory: usize,
    armijo: f64,
    backtrack: f64,
    max_line_search: usize,
    history: VecDeque<CurvaturePair>,
    previous: Option<(Vec<f64>, Vec<f64>)>,
}

impl Lbfgs {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            memory: config.lbfgs_memory,
            armijo: config.armijo,
            backtrack: config.backtrack,
            max_line_search: config.max_line_search,
            history: VecDeque::with_capacity(config.lbfgs_memory),
            previous: None,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.previous = None;
    }

    /// Records the curvature pair reaching `(params, grad)` from the previous
    /// call, then returns the quasi-Newton descent direction.
    pub fn direction(&mut self, params: &[f64], grad: &[f64]) -> Vec<f64> {
        if let Some((x_prev, g_prev)) = self.previous.take() {
            let s: Vec<f64> = params.iter().zip(&x_prev).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = grad.iter().zip(&g_prev).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);
            // Skip pairs that would break positive definiteness.
            if sy > 1e-12 * dot(&y, &y).sqrt() * dot(&s, &s).sqrt() && sy.is_finite() {
                if self.history.len() == self.memory {
                    self.history.pop_front();
                }
                self.history.push_back(CurvaturePair { s, y, rho: 1.0 / sy });
            }
        }
        self.previous = Some((params.to_vec(), grad.to_vec()));

        if self.history.is_empty() {
            let scale = 1.0 / norm(grad).max(1.0);
            return grad.iter().map(|g| -scale * g).collect();
        }

        let mut q = grad.to_vec();
        let mut alphas = Vec::with_capacity(self.history.len());
        for pair in self.history.iter().rev() {
            let alpha = pair.rho * dot(&pair.s, &q);
            axpy(-alpha, &pair.y, &mut q);
            alphas.push(alpha);
        }
        if let Some(last) = self.history.back() {
            let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
            q.iter_mut().for_each(|v| *v *= gamma);
        }
        for (pair, alpha) in self.history.iter().zip(alphas.into_iter().rev()) {
            let beta = pair.rho * dot(&pair.y, &q);
            axpy(alpha - beta, &pair.s, &mut q);
        }
        let direction: Vec<f64> = q.into_iter().map(|v| -v).collect();
        if dot(&direction, grad) < 0.0 {
            direction
        } else {
            self.history.clear();
            let scale = 1.0 / norm(grad).max(1.0);
            grad.iter().map(|g| -scale * g).collect()
        }
    }

    /// Backtracks from a unit step along `direction` until the Armijo
    /// condition holds. `evaluate` returns `None` for trial points whose
    /// loss could not be computed; those count as rejected trials.
    pub fn line_search<F>(
        &self,
        params: &[f64],
        loss: f64,
        grad: &[f64],
        direction: &[f64],
        mut evaluate: F,
    ) -> Option<LineSearchStep>
    where
        F: FnMut(&[f64]) -> Option<f64>,
    {
        let slope = dot(grad, direction);
        if !(slope < 0.0) {
            return None;
        }
        let mut step = 1.0;
        let mut trial = params.to_vec();
        for evaluations in 1..=self.max_line_search {
            for ((t, &p), &d) in trial.iter_mut().zip(params).zip(direction) {
                *t = p + step * d;
            }
            if let Some(value) = evaluate(&trial) {
                if value.is_finite() && value <= loss + self.armijo * step * slope {
                    return Some(LineSearchStep {
                        params: trial,
                        loss: value,
                        step,
                        evaluations,
                    });
                }
            }
            step *= self.backtrack;
        }
        None
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x) = ½ Σ c_i x_i²
    const CURVATURE: [f64; 3] = [1.0, 4.0, 10.0];

    fn quadratic(x: &[f64]) -> f64 {
        0.5 * x.iter().zip(CURVATURE).map(|(v, c)| c * v * v).sum::<f64>()
    }

    fn quadratic_grad(x: &[f64]) -> Vec<f64> {
        x.iter().zip(CURVATURE).map(|(v, c)| c * v).collect()
    }

    fn run_first_order(config: OptimizerConfig, iters: usize) -> f64 {
        let mut optimizer = config.build(3);
        let mut x = vec![1.0, -1.0, 0.5];
        for _ in 0..iters {
            let g = quadratic_grad(&x);
            optimizer.step(&mut x, &g);
        }
        quadratic(&x)
    }

    #[test]
    fn first_order_rules_descend_on_a_quadratic() {
        let start = quadratic(&[1.0, -1.0, 0.5]);
        assert!(run_first_order(OptimizerConfig::adam(0.05), 500) < 1e-2 * start);
        assert!(run_first_order(OptimizerConfig::momentum(0.02, 0.8), 300) < 1e-6 * start);
        assert!(
            run_first_order(OptimizerConfig::momentum(0.02, 0.8).with_nesterov(true), 300)
                < 1e-6 * start
        );
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(&OptimizerConfig::adam(0.1), 2);
        let mut x = vec![0.0, 0.0];
        adam.step(&mut x, &[3.0, -0.5]);
        // Bias correction makes the first step ±lr regardless of scale.
        assert_relative_eq!(x[0], -0.1, epsilon = 1e-6);
        assert_relative_eq!(x[1], 0.1, epsilon = 1e-6);
        assert_eq!(adam.name(), "adam");
    }

    #[test]
    fn lbfgs_converges_quickly_on_a_quadratic() {
        let mut lbfgs = OptimizerConfig::default().lbfgs();
        let mut x = vec![1.0, -1.0, 0.5];
        for _ in 0..25 {
            if quadratic(&x) < 1e-14 {
                break;
            }
            let g = quadratic_grad(&x);
            let d = lbfgs.direction(&x, &g);
            let step = lbfgs
                .line_search(&x, quadratic(&x), &g, &d, |p| Some(quadratic(p)))
                .expect("armijo step");
            x = step.params;
        }
        assert!(quadratic(&x) < 1e-12);
        assert!(lbfgs.history_len() > 0);
    }

    #[test]
    fn line_search_treats_failed_trials_as_rejections() {
        let lbfgs = OptimizerConfig::default().lbfgs();
        let x = [1.0, 0.0, 0.0];
        let g = quadratic_grad(&x);
        let d = [-1.0, 0.0, 0.0];
        let mut calls = 0;
        let step = lbfgs
            .line_search(&x, quadratic(&x), &g, &d, |p| {
                calls += 1;
                if calls == 1 {
                    None
                } else {
                    Some(quadratic(p))
                }
            })
            .expect("second trial succeeds");
        assert_relative_eq!(step.step, 0.5);
        assert_eq!(step.evaluations, 2);

        // An ascent direction is refused outright.
        assert!(lbfgs
            .line_search(&x, quadratic(&x), &g, &[1.0, 0.0, 0.0], |p| Some(quadratic(p)))
            .is_none());
    }

    #[test]
    fn rejects_invalid_settings() {
        let bad = OptimizerConfig {
            learning_rate: 0.0,
            ..OptimizerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = OptimizerConfig {
            beta2: 1.0,
            ..OptimizerConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(OptimizerConfig::default().validate().is_ok());
    }
}
