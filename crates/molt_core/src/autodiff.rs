use crate::traits::{Differentiable, DynamicalSystem, Dynamics};
use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::cell::RefCell;
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Seeds a variable with unit tangent.
    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }

    fn chain(self, val: f64, slope: f64) -> Self {
        Self::new(val, slope * self.eps)
    }
}

/// Value and first derivative of a scalar function of time.
pub fn value_and_derivative(f: impl Fn(Dual) -> Dual, t: f64) -> (f64, f64) {
    let out = f(Dual::variable(t));
    (out.val, out.eps)
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod c) = 1 almost everywhere
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

/// Constants carry no tangent.
macro_rules! constants {
    ($($name:ident => $value:expr),* $(,)?) => {
        $(fn $name() -> Self { Self::constant($value) })*
    };
}

/// Classification reads the real part only.
macro_rules! predicates {
    ($($name:ident),* $(,)?) => {
        $(fn $name(self) -> bool { self.val.$name() })*
    };
}

/// Piecewise-constant functions have zero derivative almost everywhere.
macro_rules! steps {
    ($($name:ident),* $(,)?) => {
        $(fn $name(self) -> Self { Self::constant(self.val.$name()) })*
    };
}

/// Smooth unary functions: `f(x)` forwarded to `f64`, tangent scaled by the
/// given slope in terms of the real part `x`.
macro_rules! chain_rule {
    ($($name:ident => |$x:ident| $slope:expr),* $(,)?) => {
        $(fn $name(self) -> Self {
            let $x = self.val;
            self.chain($x.$name(), $slope)
        })*
    };
}

impl Float for Dual {
    constants! {
        nan => f64::NAN,
        infinity => f64::INFINITY,
        neg_infinity => f64::NEG_INFINITY,
        min_value => f64::MIN,
        min_positive_value => f64::MIN_POSITIVE,
        max_value => f64::MAX,
    }

    predicates!(is_nan, is_infinite, is_finite, is_normal, is_sign_positive, is_sign_negative);

    steps!(floor, ceil, round, trunc, signum);

    chain_rule! {
        sqrt => |x| 0.5 / x.sqrt(),
        cbrt => |x| 1.0 / (3.0 * x.cbrt().powi(2)),
        exp => |x| x.exp(),
        exp2 => |x| x.exp2() * std::f64::consts::LN_2,
        exp_m1 => |x| x.exp(),
        ln => |x| 1.0 / x,
        ln_1p => |x| 1.0 / (1.0 + x),
        log2 => |x| 1.0 / (x * std::f64::consts::LN_2),
        log10 => |x| 1.0 / (x * std::f64::consts::LN_10),
        sin => |x| x.cos(),
        cos => |x| -x.sin(),
        tan => |x| 1.0 + x.tan().powi(2),
        asin => |x| 1.0 / (1.0 - x * x).sqrt(),
        acos => |x| -1.0 / (1.0 - x * x).sqrt(),
        atan => |x| 1.0 / (1.0 + x * x),
        sinh => |x| x.cosh(),
        cosh => |x| x.sinh(),
        tanh => |x| 1.0 - x.tanh().powi(2),
        asinh => |x| 1.0 / (x * x + 1.0).sqrt(),
        acosh => |x| 1.0 / (x * x - 1.0).sqrt(),
        atanh => |x| 1.0 / (1.0 - x * x),
    }

    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        self.chain(self.val.powi(n), (n as f64) * self.val.powi(n - 1))
    }

    fn powf(self, n: Self) -> Self {
        let val_pow = self.val.powf(n.val);
        if n.eps == 0.0 {
            // Constant exponent: avoid ln(0) when the base touches zero.
            return self.chain(val_pow, n.val * self.val.powf(n.val - 1.0));
        }
        let eps_new = val_pow * (n.eps * self.val.ln() + n.val * self.eps / self.val);
        Self::new(val_pow, eps_new)
    }

    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

// --- Dual-number lift of a generic system ---

/// Lifts a [`DynamicalSystem`] written over a generic scalar into
/// [`Differentiable`] dynamics.
///
/// Jacobian columns are obtained by seeding one state (or parameter)
/// component at a time, so a full VJP costs `dimension + num_params` dual
/// evaluations. That is fine for the small analytic models this is meant for.
pub struct DualDynamics<S> {
    pub inner: S,
    scratch: RefCell<DualScratch>,
}

struct DualScratch {
    x: Vec<Dual>,
    p: Vec<Dual>,
    out: Vec<Dual>,
}

impl<S> DualDynamics<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    pub fn new(inner: S) -> Self {
        let n = DynamicalSystem::<f64>::dimension(&inner);
        let p = DynamicalSystem::<f64>::num_params(&inner);
        Self {
            inner,
            scratch: RefCell::new(DualScratch {
                x: vec![Dual::zero(); n],
                p: vec![Dual::zero(); p],
                out: vec![Dual::zero(); n],
            }),
        }
    }

    /// Evaluates the system with the tangent seeded on state component
    /// `state_seed` or parameter component `param_seed`; the tangent of the
    /// output is written into `column`.
    fn seeded_column(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        state_seed: Option<usize>,
        param_seed: Option<usize>,
        column: &mut [f64],
    ) {
        let mut scratch = self.scratch.borrow_mut();
        let DualScratch {
            x: dual_x,
            p: dual_p,
            out,
        } = &mut *scratch;
        for (i, slot) in dual_x.iter_mut().enumerate() {
            *slot = Dual::new(x[i], if state_seed == Some(i) { 1.0 } else { 0.0 });
        }
        for (i, slot) in dual_p.iter_mut().enumerate() {
            *slot = Dual::new(params[i], if param_seed == Some(i) { 1.0 } else { 0.0 });
        }
        DynamicalSystem::<Dual>::apply(
            &self.inner,
            Dual::constant(t),
            dual_x.as_slice(),
            dual_p.as_slice(),
            out.as_mut_slice(),
        );
        for (c, o) in column.iter_mut().zip(out.iter()) {
            *c = o.eps;
        }
    }
}

impl<S> Dynamics for DualDynamics<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    fn dimension(&self) -> usize {
        DynamicalSystem::<f64>::dimension(&self.inner)
    }

    fn num_params(&self) -> usize {
        DynamicalSystem::<f64>::num_params(&self.inner)
    }

    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        DynamicalSystem::<f64>::apply(&self.inner, t, x, params, out);
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        let n = self.dimension();
        let mut column = vec![0.0; n];
        for j in 0..n {
            self.seeded_column(t, x, params, Some(j), None, &mut column);
            for i in 0..n {
                out[(i, j)] = column[i];
            }
        }
    }
}

impl<S> Differentiable for DualDynamics<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    fn vjp(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    ) {
        let n = self.dimension();
        let mut column = vec![0.0; n];
        // (Jᵀ v)_j = column_j · v
        for (j, slot) in dx.iter_mut().enumerate() {
            self.seeded_column(t, x, params, Some(j), None, &mut column);
            *slot = dot(&column, v);
        }
        for (j, slot) in dp.iter_mut().enumerate() {
            self.seeded_column(t, x, params, None, Some(j), &mut column);
            *slot = dot(&column, v);
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
