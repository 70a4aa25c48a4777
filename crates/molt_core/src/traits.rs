use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our dynamical systems.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts an `f64` literal into the scalar type.
    fn lit(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A parametric vector field written once over a generic scalar.
///
/// Implementing this for both `f64` and [`Dual`](crate::autodiff::Dual) is
/// enough to get exact Jacobians and vector-Jacobian products through
/// [`DualDynamics`](crate::autodiff::DualDynamics).
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Number of entries the parameter slice must carry.
    fn num_params(&self) -> usize {
        0
    }

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// p: parameters (read-only for the whole solve)
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], p: &[T], out: &mut [T]);
}

/// The right-hand side consumed by the integrator.
pub trait Dynamics {
    fn dimension(&self) -> usize;

    fn num_params(&self) -> usize {
        0
    }

    /// Writes `f(t, x, params)` into `out`.
    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]);

    /// Dense Jacobian `∂f/∂x`, used by the implicit method's Newton solves.
    ///
    /// The default is a forward finite difference; implementations with exact
    /// derivatives should override it.
    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        let n = self.dimension();
        let mut base = vec![0.0; n];
        let mut shifted = vec![0.0; n];
        let mut probe = x.to_vec();
        self.eval(t, x, params, &mut base);
        let root_eps = f64::EPSILON.sqrt();
        for j in 0..n {
            let delta = root_eps * x[j].abs().max(1.0);
            probe[j] = x[j] + delta;
            self.eval(t, &probe, params, &mut shifted);
            probe[j] = x[j];
            for i in 0..n {
                out[(i, j)] = (shifted[i] - base[i]) / delta;
            }
        }
    }

    /// Hook run on every accepted state (and the initial state) to enforce
    /// algebraic constraints such as pinned boundary values.
    fn project(&self, _t: f64, _x: &mut [f64]) {}
}

/// Dynamics that can report vector-Jacobian products.
///
/// Entries whose derivative is undefined at the evaluation point must be
/// written as NaN; callers never treat them as zero silently.
pub trait Differentiable: Dynamics {
    /// Writes `(∂f/∂x)ᵀ v` into `dx` and `(∂f/∂θ)ᵀ v` into `dp`.
    #[allow(clippy::too_many_arguments)]
    fn vjp(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    );
}

impl<D: Dynamics + ?Sized> Dynamics for &D {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn num_params(&self) -> usize {
        (**self).num_params()
    }

    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        (**self).eval(t, x, params, out)
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        (**self).jacobian(t, x, params, out)
    }

    fn project(&self, t: f64, x: &mut [f64]) {
        (**self).project(t, x)
    }
}

impl<D: Differentiable + ?Sized> Differentiable for &D {
    fn vjp(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    ) {
        (**self).vjp(t, x, params, v, dx, dp)
    }
}

/// Adapts a plain closure `(t, x, params, out)` into [`Dynamics`].
pub struct FnDynamics<F> {
    dimension: usize,
    num_params: usize,
    f: F,
}

impl<F> FnDynamics<F>
where
    F: Fn(f64, &[f64], &[f64], &mut [f64]),
{
    pub fn new(dimension: usize, num_params: usize, f: F) -> Self {
        Self {
            dimension,
            num_params,
            f,
        }
    }
}

impl<F> Dynamics for FnDynamics<F>
where
    F: Fn(f64, &[f64], &[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn num_params(&self) -> usize {
        self.num_params
    }

    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        (self.f)(t, x, params, out)
    }
}
