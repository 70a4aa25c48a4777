use serde::{Deserialize, Serialize};

/// Counters collected while integrating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveStats {
    pub accepted: usize,
    pub rejected: usize,
    /// Right-hand-side evaluations, including the initial one.
    pub evaluations: usize,
    pub jacobians: usize,
    pub newton_failures: usize,
    /// Scaled error norm of the last accepted step.
    pub last_error: f64,
    /// Size of the last accepted step (always positive).
    pub final_step: f64,
}

impl SolveStats {
    /// Accepted plus rejected attempts.
    pub fn attempts(&self) -> usize {
        self.accepted + self.rejected
    }

    pub(crate) fn absorb(&mut self, other: &SolveStats) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.evaluations += other.evaluations;
        self.jacobians += other.jacobians;
        self.newton_failures += other.newton_failures;
        self.last_error = other.last_error;
        self.final_step = other.final_step;
    }
}

/// Accepted samples of a solve plus a piecewise cubic Hermite interpolant.
///
/// Times are strictly increasing even for backward solves. Each sample keeps
/// the vector field at that point, so the segment between two neighbouring
/// samples is the cubic matching both endpoint values and slopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    derivatives: Vec<Vec<f64>>,
    pub stats: SolveStats,
}

impl Trajectory {
    pub(crate) fn with_initial(t0: f64, y0: Vec<f64>, f0: Vec<f64>) -> Self {
        Self {
            times: vec![t0],
            states: vec![y0],
            derivatives: vec![f0],
            stats: SolveStats::default(),
        }
    }

    pub(crate) fn push(&mut self, t: f64, y: Vec<f64>, f: Vec<f64>) {
        self.times.push(t);
        self.states.push(y);
        self.derivatives.push(f);
    }

    /// Reorders samples collected by a backward solve.
    pub(crate) fn reverse(&mut self) {
        self.times.reverse();
        self.states.reverse();
        self.derivatives.reverse();
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.states.first().map_or(0, Vec::len)
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn derivatives(&self) -> &[Vec<f64>] {
        &self.derivatives
    }

    pub fn start_time(&self) -> f64 {
        self.times.first().copied().unwrap_or(f64::NAN)
    }

    pub fn end_time(&self) -> f64 {
        self.times.last().copied().unwrap_or(f64::NAN)
    }

    pub fn first_state(&self) -> &[f64] {
        self.states.first().map_or(&[], Vec::as_slice)
    }

    pub fn last_state(&self) -> &[f64] {
        self.states.last().map_or(&[], Vec::as_slice)
    }

    /// Values of one component at every sample, or `None` if `index` is not
    /// a component of the state.
    pub fn component(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.dimension() {
            return None;
        }
        Some(self.states.iter().map(|s| s[index]).collect())
    }

    /// Interpolated state at `t`, or `None` if `t` lies outside the span.
    pub fn sample(&self, t: f64) -> Option<Vec<f64>> {
        let mut out = vec![0.0; self.dimension()];
        self.sample_into(t, &mut out).then_some(out)
    }

    /// Writes the interpolated state at `t` into `out`. Returns false (and
    /// leaves `out` untouched) when `t` lies outside the span.
    pub fn sample_into(&self, t: f64, out: &mut [f64]) -> bool {
        let Some(segment) = self.locate(t) else {
            return false;
        };
        if self.times.len() == 1 {
            out.copy_from_slice(&self.states[0]);
            return true;
        }
        let (t0, t1) = (self.times[segment], self.times[segment + 1]);
        let h = t1 - t0;
        let s = (t - t0) / h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        let (y0, y1) = (&self.states[segment], &self.states[segment + 1]);
        let (f0, f1) = (&self.derivatives[segment], &self.derivatives[segment + 1]);
        for i in 0..out.len() {
            out[i] = h00 * y0[i] + h * h10 * f0[i] + h01 * y1[i] + h * h11 * f1[i];
        }
        true
    }

    pub fn sample_many(&self, ts: &[f64]) -> Vec<Option<Vec<f64>>> {
        ts.iter().map(|&t| self.sample(t)).collect()
    }

    /// Index of the segment `[times[k], times[k+1]]` containing `t`.
    fn locate(&self, t: f64) -> Option<usize> {
        let (&first, &last) = (self.times.first()?, self.times.last()?);
        let slack = 16.0 * f64::EPSILON * first.abs().max(last.abs());
        if !t.is_finite() || t < first - slack || t > last + slack {
            return None;
        }
        if self.times.len() == 1 {
            return Some(0);
        }
        let upper = self.times.partition_point(|&x| x < t);
        Some(upper.saturating_sub(1).min(self.times.len() - 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parabola() -> Trajectory {
        // y = t², y' = 2t sampled at 0, 1, 3.
        let mut traj = Trajectory::with_initial(0.0, vec![0.0], vec![0.0]);
        traj.push(1.0, vec![1.0], vec![2.0]);
        traj.push(3.0, vec![9.0], vec![6.0]);
        traj
    }

    #[test]
    fn hermite_segments_reproduce_quadratics() {
        let traj = parabola();
        for &t in &[0.0, 0.25, 0.5, 1.0, 1.7, 2.9, 3.0] {
            let y = traj.sample(t).expect("inside span");
            assert!((y[0] - t * t).abs() < 1e-12, "t = {t}");
        }
    }

    #[test]
    fn outside_span_returns_none() {
        let traj = parabola();
        assert!(traj.sample(-0.1).is_none());
        assert!(traj.sample(3.5).is_none());
        assert!(traj.sample(f64::NAN).is_none());
        let many = traj.sample_many(&[0.5, 4.0]);
        assert!(many[0].is_some());
        assert!(many[1].is_none());
    }

    #[test]
    fn component_is_checked_against_dimension() {
        let traj = parabola();
        let values = traj.component(0).expect("first component");
        assert_eq!(values.len(), traj.times().len());
        assert_eq!(values[0], 0.0);
        assert!(traj.component(1).is_none());
    }

    #[test]
    fn reversed_samples_are_increasing() {
        let mut traj = Trajectory::with_initial(2.0, vec![4.0], vec![4.0]);
        traj.push(1.0, vec![1.0], vec![2.0]);
        traj.push(0.0, vec![0.0], vec![0.0]);
        traj.reverse();
        assert_eq!(traj.times(), &[0.0, 1.0, 2.0]);
        assert_eq!(traj.first_state(), &[0.0]);
        assert_eq!(traj.last_state(), &[4.0]);
        assert!((traj.sample(1.5).expect("inside")[0] - 2.25).abs() < 1e-12);
    }

    #[test]
    fn stats_absorb_accumulates_counters() {
        let mut total = SolveStats::default();
        let step = SolveStats {
            accepted: 3,
            rejected: 1,
            evaluations: 20,
            jacobians: 0,
            newton_failures: 0,
            last_error: 0.5,
            final_step: 0.1,
        };
        total.absorb(&step);
        total.absorb(&step);
        assert_eq!(total.accepted, 6);
        assert_eq!(total.attempts(), 8);
        assert_eq!(total.final_step, 0.1);
    }
}
