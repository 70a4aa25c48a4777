//! Adaptive time integration with embedded error control.
//!
//! [`solve`] drives one of the [`Method`] steppers from `span.start` to
//! `span.end`, accepting a step when the RMS of the scaled local error is at
//! most one and resizing the step with the usual
//! `safety · err^(-1/(q+1))` controller. Every accepted step is appended to
//! the returned [`Trajectory`] together with the vector field at its end
//! point, which is what the Hermite dense output needs.

use crate::error::{config_bail, ensure_finite, SolveError, SolveResult, StepFailureReason};
use crate::solvers::{AttemptSettings, Method, StepWork};
use crate::traits::Dynamics;
use crate::trajectory::{SolveStats, Trajectory};
use serde::{Deserialize, Serialize};

/// Integration interval. `start > end` integrates backward in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: f64,
    pub end: f64,
}

impl TimeSpan {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> SolveResult<()> {
        if !self.start.is_finite() || !self.end.is_finite() {
            config_bail!("time span must be finite, got [{}, {}]", self.start, self.end);
        }
        if self.start == self.end {
            config_bail!("time span is empty (start = end = {})", self.start);
        }
        Ok(())
    }

    /// +1 for forward solves, -1 for backward ones.
    pub fn direction(&self) -> f64 {
        if self.end >= self.start {
            1.0
        } else {
            -1.0
        }
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).abs()
    }

    pub fn contains(&self, t: f64) -> bool {
        let (lo, hi) = if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        t >= lo && t <= hi
    }

    fn reached(&self, t: f64) -> bool {
        (self.end - t).abs() <= 16.0 * f64::EPSILON * t.abs().max(self.end.abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    pub method: Method,
    pub abstol: f64,
    pub reltol: f64,
    /// Upper bound on `|h|`.
    pub max_step: f64,
    /// Lower bound on `|h|`, as a fraction of the span length.
    pub min_step: f64,
    /// Ceiling on attempted (accepted + rejected) steps.
    pub max_steps: usize,
    /// Size of the first attempted step; estimated from `y0` and `f(y0)`
    /// when absent.
    pub initial_step: Option<f64>,
    pub safety: f64,
    pub facmin: f64,
    pub facmax: f64,
    /// Consecutive rejections tolerated before giving up.
    pub max_rejections: usize,
    pub newton_max_iters: usize,
    /// Convergence threshold on the scaled Newton update.
    pub newton_tol: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            abstol: 1e-6,
            reltol: 1e-3,
            max_step: f64::INFINITY,
            min_step: 1e-12,
            max_steps: 100_000,
            initial_step: None,
            safety: 0.9,
            facmin: 0.2,
            facmax: 5.0,
            max_rejections: 50,
            newton_max_iters: 8,
            newton_tol: 0.03,
        }
    }
}

impl IntegratorConfig {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerances(mut self, abstol: f64, reltol: f64) -> Self {
        self.abstol = abstol;
        self.reltol = reltol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_initial_step(mut self, h: f64) -> Self {
        self.initial_step = Some(h);
        self
    }

    pub fn validate(&self) -> SolveResult<()> {
        if !(self.abstol.is_finite() && self.abstol > 0.0) {
            config_bail!("abstol must be positive and finite, got {}", self.abstol);
        }
        if !(self.reltol.is_finite() && self.reltol > 0.0) {
            config_bail!("reltol must be positive and finite, got {}", self.reltol);
        }
        if self.max_step.is_nan() || self.max_step <= 0.0 {
            config_bail!("max_step must be positive, got {}", self.max_step);
        }
        if !(self.min_step.is_finite() && self.min_step >= 0.0) {
            config_bail!("min_step must be non-negative, got {}", self.min_step);
        }
        if let Some(h) = self.initial_step {
            if !(h.is_finite() && h > 0.0) {
                config_bail!("initial_step must be positive and finite, got {h}");
            }
        }
        if self.max_steps == 0 {
            config_bail!("max_steps must be greater than zero");
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            config_bail!("safety must lie in (0, 1], got {}", self.safety);
        }
        if !(self.facmin > 0.0 && self.facmin < 1.0) {
            config_bail!("facmin must lie in (0, 1), got {}", self.facmin);
        }
        if !(self.facmax > 1.0) {
            config_bail!("facmax must exceed 1, got {}", self.facmax);
        }
        if self.max_rejections == 0 {
            config_bail!("max_rejections must be greater than zero");
        }
        if self.method.is_implicit() {
            if self.newton_max_iters == 0 {
                config_bail!("newton_max_iters must be greater than zero");
            }
            if !(self.newton_tol.is_finite() && self.newton_tol > 0.0) {
                config_bail!("newton_tol must be positive, got {}", self.newton_tol);
            }
        }
        Ok(())
    }

    fn attempt_settings(&self) -> AttemptSettings {
        AttemptSettings {
            abstol: self.abstol,
            reltol: self.reltol,
            newton_max_iters: self.newton_max_iters,
            newton_tol: self.newton_tol,
        }
    }

    /// Step multiplier after an accepted step with scaled error `err`.
    fn grow_factor(&self, err: f64, order: usize) -> f64 {
        let raw = self.safety * err.powf(-1.0 / (order as f64 + 1.0));
        raw.clamp(self.facmin, self.facmax)
    }

    /// Step multiplier after a rejected step; never above one.
    fn shrink_factor(&self, err: f64, order: usize) -> f64 {
        let raw = self.safety * err.powf(-1.0 / (order as f64 + 1.0));
        raw.max(self.facmin).min(1.0)
    }
}

/// Mutable driver state, live for one solve.
#[derive(Debug, Clone)]
pub struct SolverState {
    pub t: f64,
    pub y: Vec<f64>,
    /// `f(t, y)`.
    pub f: Vec<f64>,
    /// Magnitude of the next step to attempt.
    pub h: f64,
    /// Order of the error estimate driving the controller.
    pub order: usize,
    pub last_error: f64,
    pub stats: SolveStats,
}

impl SolverState {
    fn failure(&self, reason: StepFailureReason) -> SolveError {
        SolveError::StepFailure {
            t: self.t,
            state: self.y.clone(),
            reason,
        }
    }
}

/// Result of one attempted step, before any acceptance decision.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAttempt {
    pub state: Vec<f64>,
    /// Raw local error estimate per component.
    pub error: Vec<f64>,
    /// RMS of `error` scaled by `abstol + reltol·max(|y|, |ŷ|)`.
    pub error_norm: f64,
    /// Order of the error estimate.
    pub order: usize,
    /// False when an implicit stage failed to converge.
    pub converged: bool,
}

/// RMS norm of `error` scaled componentwise against the old and new states.
/// Only the first `controlled` components take part.
pub fn error_norm(
    error: &[f64],
    y: &[f64],
    y_new: &[f64],
    abstol: f64,
    reltol: f64,
    controlled: usize,
) -> f64 {
    let m = controlled.min(error.len());
    if m == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..m {
        let scale = abstol + reltol * y[i].abs().max(y_new[i].abs());
        let r = error[i] / scale;
        sum += r * r;
    }
    (sum / m as f64).sqrt()
}

fn check_dimensions<D: Dynamics + ?Sized>(
    dynamics: &D,
    params: &[f64],
    y0: &[f64],
) -> SolveResult<()> {
    let dim = dynamics.dimension();
    if dim == 0 {
        config_bail!("system has zero dimension");
    }
    if y0.len() != dim {
        config_bail!(
            "initial state dimension mismatch: expected {dim}, got {}",
            y0.len()
        );
    }
    if params.len() != dynamics.num_params() {
        config_bail!(
            "parameter dimension mismatch: expected {}, got {}",
            dynamics.num_params(),
            params.len()
        );
    }
    Ok(())
}

/// Attempts a single step of signed size `h` from `(t, y)` without deciding
/// whether to accept it.
pub fn advance<D: Dynamics + ?Sized>(
    dynamics: &D,
    params: &[f64],
    t: f64,
    y: &[f64],
    h: f64,
    config: &IntegratorConfig,
) -> SolveResult<StepAttempt> {
    config.validate()?;
    check_dimensions(dynamics, params, y)?;
    if !(h.is_finite() && h != 0.0) {
        config_bail!("step size must be finite and non-zero, got {h}");
    }
    let n = y.len();
    let mut f0 = vec![0.0; n];
    dynamics.eval(t, y, params, &mut f0);
    let mut stepper = config.method.build(n);
    let mut work = StepWork::new(n);
    stepper.attempt(
        dynamics,
        params,
        t,
        y,
        &f0,
        h,
        &config.attempt_settings(),
        &mut work,
    );
    let error_norm = error_norm(&work.error, y, &work.y_new, config.abstol, config.reltol, n);
    Ok(StepAttempt {
        state: work.y_new,
        error: work.error,
        error_norm,
        order: stepper.error_order(),
        converged: work.converged,
    })
}

/// Integrates `dynamics` over `span` starting from `y0`.
pub fn solve<D: Dynamics + ?Sized>(
    dynamics: &D,
    params: &[f64],
    y0: &[f64],
    span: TimeSpan,
    config: &IntegratorConfig,
) -> SolveResult<Trajectory> {
    solve_controlled(dynamics, params, y0, span, config, y0.len())
}

/// Like [`solve`], but only the first `controlled` components enter the
/// error norm. The remaining ones are carried along as quadratures.
pub(crate) fn solve_controlled<D: Dynamics + ?Sized>(
    dynamics: &D,
    params: &[f64],
    y0: &[f64],
    span: TimeSpan,
    config: &IntegratorConfig,
    controlled: usize,
) -> SolveResult<Trajectory> {
    config.validate()?;
    span.validate()?;
    check_dimensions(dynamics, params, y0)?;

    let n = y0.len();
    let dir = span.direction();
    let mut y = y0.to_vec();
    dynamics.project(span.start, &mut y);
    ensure_finite(span.start, &y)?;
    let mut f = vec![0.0; n];
    dynamics.eval(span.start, &y, params, &mut f);
    ensure_finite(span.start, &f)?;

    let mut stepper = config.method.build(n);
    let mut state = SolverState {
        t: span.start,
        y,
        f,
        h: 0.0,
        order: stepper.error_order(),
        last_error: 0.0,
        stats: SolveStats {
            evaluations: 1,
            ..SolveStats::default()
        },
    };
    state.h = match config.initial_step {
        Some(h) => h,
        None => initial_step(dynamics, params, &mut state, dir, stepper.order(), config, controlled),
    }
    .min(config.max_step)
    .min(span.length());

    let mut trajectory = Trajectory::with_initial(state.t, state.y.clone(), state.f.clone());
    let settings = config.attempt_settings();
    let min_step = config.min_step * span.length();
    let mut work = StepWork::new(n);
    let mut consecutive_rejections = 0usize;

    while !span.reached(state.t) {
        if state.stats.attempts() >= config.max_steps {
            return Err(state.failure(StepFailureReason::MaxStepsExceeded(config.max_steps)));
        }

        let remaining = (span.end - state.t).abs();
        let mut h = state.h.min(config.max_step);
        let last = h >= remaining;
        if last {
            h = remaining;
        } else if h < min_step.max(16.0 * f64::EPSILON * state.t.abs())
            || state.t + dir * h == state.t
        {
            return Err(state.failure(StepFailureReason::StepSizeUnderflow(h)));
        }

        stepper.attempt(
            dynamics,
            params,
            state.t,
            &state.y,
            &state.f,
            dir * h,
            &settings,
            &mut work,
        );
        state.stats.evaluations += work.evaluations;
        state.stats.jacobians += work.jacobians;

        if !work.converged {
            state.stats.newton_failures += 1;
            state.stats.rejected += 1;
            consecutive_rejections += 1;
            if consecutive_rejections > config.max_rejections {
                return Err(state.failure(StepFailureReason::TooManyRejections(
                    consecutive_rejections,
                )));
            }
            state.h = h * 0.25;
            continue;
        }

        let t_new = if last { span.end } else { state.t + dir * h };
        ensure_finite(t_new, &work.y_new)?;
        let err = error_norm(
            &work.error,
            &state.y,
            &work.y_new,
            config.abstol,
            config.reltol,
            controlled,
        );

        if err <= 1.0 {
            let mut y_new = work.y_new.clone();
            let mut f_new = work.f_new.clone();
            dynamics.project(t_new, &mut y_new);
            if y_new != work.y_new {
                dynamics.eval(t_new, &y_new, params, &mut f_new);
                state.stats.evaluations += 1;
            }
            ensure_finite(t_new, &f_new)?;

            state.stats.accepted += 1;
            state.stats.last_error = err;
            state.stats.final_step = h;
            state.last_error = err;
            trajectory.push(t_new, y_new.clone(), f_new.clone());
            state.t = t_new;
            state.y = y_new;
            state.f = f_new;
            state.h = h * config.grow_factor(err, state.order);
            consecutive_rejections = 0;
        } else {
            state.stats.rejected += 1;
            consecutive_rejections += 1;
            if consecutive_rejections > config.max_rejections {
                return Err(state.failure(StepFailureReason::TooManyRejections(
                    consecutive_rejections,
                )));
            }
            state.h = h * config.shrink_factor(err, state.order);
        }
    }

    trajectory.stats = state.stats;
    if dir < 0.0 {
        trajectory.reverse();
    }
    Ok(trajectory)
}

/// Starting step from the Hairer-Wanner heuristic: balance `‖y0‖ / ‖f0‖`
/// against a second-derivative estimate from one explicit Euler probe.
fn initial_step<D: Dynamics + ?Sized>(
    dynamics: &D,
    params: &[f64],
    state: &mut SolverState,
    dir: f64,
    order: usize,
    config: &IntegratorConfig,
    controlled: usize,
) -> f64 {
    let m = controlled.min(state.y.len());
    if m == 0 {
        return 1e-6;
    }
    let scale: Vec<f64> = state.y[..m]
        .iter()
        .map(|v| config.abstol + config.reltol * v.abs())
        .collect();
    let rms = |values: &mut dyn Iterator<Item = f64>| -> f64 {
        let sum: f64 = values.map(|v| v * v).sum();
        (sum / m as f64).sqrt()
    };

    let d0 = rms(&mut (0..m).map(|i| state.y[i] / scale[i]));
    let d1 = rms(&mut (0..m).map(|i| state.f[i] / scale[i]));
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };

    let probe: Vec<f64> = state
        .y
        .iter()
        .zip(&state.f)
        .map(|(y, f)| y + dir * h0 * f)
        .collect();
    let mut f1 = vec![0.0; state.y.len()];
    dynamics.eval(state.t + dir * h0, &probe, params, &mut f1);
    state.stats.evaluations += 1;
    let d2 = rms(&mut (0..m).map(|i| (f1[i] - state.f[i]) / scale[i])) / h0;

    let dmax = d1.max(d2);
    let h1 = if dmax <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / dmax).powf(1.0 / (order as f64 + 1.0))
    };
    let h = (100.0 * h0).min(h1);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        h0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnDynamics;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn decay() -> FnDynamics<impl Fn(f64, &[f64], &[f64], &mut [f64])> {
        FnDynamics::new(1, 1, |_t, x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = -p[0] * x[0];
        })
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: SolveResult<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        let system = decay();
        let span = TimeSpan::new(0.0, 1.0);
        let base = IntegratorConfig::default();
        assert_err_contains(
            solve(&system, &[1.0], &[1.0], span, &base.with_tolerances(0.0, 1e-3)),
            "abstol",
        );
        assert_err_contains(
            solve(&system, &[1.0], &[1.0], span, &base.with_tolerances(1e-6, -1.0)),
            "reltol",
        );
        assert_err_contains(
            solve(&system, &[1.0], &[1.0], span, &base.with_max_steps(0)),
            "max_steps",
        );
        assert_err_contains(
            solve(&system, &[1.0], &[1.0], TimeSpan::new(1.0, 1.0), &base),
            "empty",
        );
        assert_err_contains(
            solve(&system, &[1.0], &[1.0, 2.0], span, &base),
            "initial state dimension",
        );
        assert_err_contains(solve(&system, &[], &[1.0], span, &base), "parameter dimension");
        let bad_factor = IntegratorConfig {
            facmax: 0.5,
            ..base
        };
        assert_err_contains(solve(&system, &[1.0], &[1.0], span, &bad_factor), "facmax");
    }

    #[test]
    fn every_method_tracks_exponential_decay() {
        let system = decay();
        for method in [
            Method::Tsit5,
            Method::DormandPrince,
            Method::BogackiShampine,
            Method::Sdirk2,
        ] {
            let config = IntegratorConfig::default()
                .with_method(method)
                .with_tolerances(1e-9, 1e-7);
            let traj = solve(&system, &[0.7], &[1.0], TimeSpan::new(0.0, 3.0), &config)
                .expect("decay should integrate");
            assert_eq!(traj.end_time(), 3.0);
            for (t, y) in traj.times().iter().zip(traj.states()) {
                assert!(
                    (y[0] - (-0.7 * t).exp()).abs() < 1e-5,
                    "{method:?} at t = {t}: {}",
                    y[0]
                );
            }
        }
    }

    #[test]
    fn backward_solve_returns_increasing_times() {
        let system = decay();
        let config = IntegratorConfig::default().with_tolerances(1e-10, 1e-8);
        let traj = solve(&system, &[1.0], &[1.0], TimeSpan::new(2.0, 0.0), &config)
            .expect("backward solve");
        assert!(traj.times().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(traj.start_time(), 0.0);
        assert_eq!(traj.end_time(), 2.0);
        // Integrating y' = -y backward from y(2) = 1 gives y(0) = e².
        assert_relative_eq!(traj.first_state()[0], 2.0f64.exp(), max_relative = 1e-6);
        assert_eq!(traj.last_state()[0], 1.0);
    }

    #[test]
    fn dense_output_is_accurate_between_steps() {
        let system = decay();
        let config = IntegratorConfig::default().with_tolerances(1e-10, 1e-8);
        let traj = solve(&system, &[1.0], &[1.0], TimeSpan::new(0.0, 4.0), &config)
            .expect("solve");
        for k in 0..=80 {
            let t = 0.05 * k as f64;
            let y = traj.sample(t).expect("inside span");
            assert!((y[0] - (-t).exp()).abs() < 5e-5, "t = {t}");
        }
        assert!(traj.sample(4.1).is_none());
    }

    #[test]
    fn max_steps_exhaustion_reports_last_valid_state() {
        let system = decay();
        let config = IntegratorConfig::default()
            .with_tolerances(1e-12, 1e-12)
            .with_max_steps(5);
        let err = solve(&system, &[1.0], &[1.0], TimeSpan::new(0.0, 10.0), &config)
            .expect_err("budget too small");
        match err {
            SolveError::StepFailure { t, state, reason } => {
                assert_eq!(reason, StepFailureReason::MaxStepsExceeded(5));
                assert!(t > 0.0 && t < 10.0);
                assert!((state[0] - (-t).exp()).abs() < 1e-8);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn finite_time_blow_up_underflows_the_step_size() {
        // y' = (1 - t)^-3, y(0) = 0 has y = ((1 - t)^-2 - 1) / 2.
        let system = FnDynamics::new(1, 0, |t: f64, _x: &[f64], _p: &[f64], out: &mut [f64]| {
            out[0] = (1.0 - t).powi(-3);
        });
        let err = solve(
            &system,
            &[],
            &[0.0],
            TimeSpan::new(0.0, 1.0),
            &IntegratorConfig::default(),
        )
        .expect_err("singular endpoint");
        match err {
            SolveError::StepFailure { t, state, reason } => {
                assert!(
                    matches!(reason, StepFailureReason::StepSizeUnderflow(h) if h < 1e-12),
                    "{reason:?}"
                );
                assert!(t > 1.0 - 1e-9 && t < 1.0, "t = {t}");
                let exact = 0.5 * ((1.0 - t).powi(-2) - 1.0);
                assert!(state[0].is_finite());
                assert_relative_eq!(state[0], exact, max_relative = 0.05);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejection_budget_stops_at_the_last_accepted_state() {
        let system = decay();
        let config = IntegratorConfig {
            max_rejections: 1,
            ..IntegratorConfig::default()
                .with_tolerances(1e-12, 1e-12)
                .with_initial_step(10.0)
        };
        let err = solve(&system, &[1.0], &[1.0], TimeSpan::new(0.0, 10.0), &config)
            .expect_err("oversized steps are rejected");
        assert_eq!(
            err,
            SolveError::StepFailure {
                t: 0.0,
                state: vec![1.0],
                reason: StepFailureReason::TooManyRejections(2),
            }
        );
    }

    #[test]
    fn nan_vector_field_aborts_with_non_finite_state() {
        let system = FnDynamics::new(1, 0, |t, x: &[f64], _p: &[f64], out: &mut [f64]| {
            out[0] = if t > 0.5 { f64::NAN } else { x[0] };
        });
        let config = IntegratorConfig::default().with_max_step(0.1);
        let err = solve(&system, &[], &[1.0], TimeSpan::new(0.0, 2.0), &config)
            .expect_err("NaN must abort");
        assert!(matches!(err, SolveError::NonFiniteState { t } if t > 0.5));
    }

    #[test]
    fn non_finite_initial_state_is_rejected() {
        let system = decay();
        let err = solve(
            &system,
            &[1.0],
            &[f64::INFINITY],
            TimeSpan::new(0.0, 1.0),
            &IntegratorConfig::default(),
        )
        .expect_err("infinite state");
        assert_eq!(err, SolveError::NonFiniteState { t: 0.0 });
    }

    #[test]
    fn implicit_method_takes_fewer_steps_on_stiff_problem() {
        let system = FnDynamics::new(1, 0, |t: f64, x: &[f64], _p: &[f64], out: &mut [f64]| {
            out[0] = -1000.0 * (x[0] - t.cos());
        });
        let span = TimeSpan::new(0.0, 1.0);
        let explicit = solve(&system, &[], &[1.0], span, &IntegratorConfig::default())
            .expect("explicit solve");
        let implicit = solve(
            &system,
            &[],
            &[1.0],
            span,
            &IntegratorConfig::default().with_method(Method::Sdirk2),
        )
        .expect("implicit solve");
        assert!(
            implicit.stats.accepted < explicit.stats.accepted,
            "implicit {} vs explicit {}",
            implicit.stats.accepted,
            explicit.stats.accepted
        );
        assert!(implicit.stats.jacobians > 0);
        assert!((implicit.last_state()[0] - 1.0f64.cos()).abs() < 1e-2);
    }

    #[test]
    fn advance_reports_error_estimate_without_accepting() {
        let system = decay();
        let config = IntegratorConfig::default();
        let attempt = advance(&system, &[1.0], 0.0, &[1.0], 0.1, &config).expect("attempt");
        assert_eq!(attempt.order, 4);
        assert!(attempt.converged);
        assert!(attempt.error_norm < 1.0);
        assert_relative_eq!(attempt.state[0], (-0.1f64).exp(), max_relative = 1e-7);

        let huge = advance(&system, &[1.0], 0.0, &[1.0], 5.0, &config).expect("attempt");
        assert!(huge.error_norm > 1.0);
    }

    #[test]
    fn error_norm_ignores_uncontrolled_components() {
        let norm = error_norm(&[1e-6, 1e3], &[1.0, 1.0], &[1.0, 1.0], 1e-6, 0.0, 1);
        assert_relative_eq!(norm, 1.0);
        assert_eq!(error_norm(&[1.0], &[0.0], &[0.0], 1.0, 1.0, 0), 0.0);
    }

    #[test]
    fn identical_solves_are_bitwise_identical() {
        let system = decay();
        let config = IntegratorConfig::default();
        let a = solve(&system, &[0.3], &[2.0], TimeSpan::new(0.0, 5.0), &config).expect("a");
        let b = solve(&system, &[0.3], &[2.0], TimeSpan::new(0.0, 5.0), &config).expect("b");
        assert_eq!(a, b);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_decay_stays_within_tolerance(
            rate in 0.1f64..5.0,
            y0 in 0.1f64..10.0,
            end in 0.5f64..4.0,
        ) {
            let system = decay();
            let config = IntegratorConfig::default().with_tolerances(1e-10, 1e-8);
            let traj = solve(&system, &[rate], &[y0], TimeSpan::new(0.0, end), &config)
                .expect("decay solve");
            prop_assert!(traj.times().windows(2).all(|w| w[0] < w[1]));
            for (t, y) in traj.times().iter().zip(traj.states()) {
                let exact = y0 * (-rate * t).exp();
                prop_assert!((y[0] - exact).abs() <= 1e-5 * y0);
            }
        }
    }
}
