//! Method-of-lines lowering of 1-D PDEs to ODE systems.
//!
//! A [`PdeSpec`] names one or more fields on a uniform grid, gives each field
//! an evolution equation built from [`Term`]s, and pins boundary nodes with
//! [`DirichletCondition`]s. [`discretize`] assembles the finite-difference
//! stencils into one sparse operator over the whole state and returns a
//! [`Discretization`] that the integrator consumes like any other
//! [`Dynamics`].

use crate::autodiff::Dual;
use crate::error::{config_bail, SolveResult};
use crate::traits::{Differentiable, Dynamics};
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

mod presets;

pub use presets::{
    discrete_norm, heat_equation, join_complex, schrodinger_equation, split_complex,
    wave_equation,
};

/// Uniform grid of `interior + 2` nodes, boundaries included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid1D {
    pub lower: f64,
    pub upper: f64,
    pub interior: usize,
}

impl Grid1D {
    pub fn new(lower: f64, upper: f64, interior: usize) -> Self {
        Self {
            lower,
            upper,
            interior,
        }
    }

    pub fn validate(&self) -> SolveResult<()> {
        if !(self.lower.is_finite() && self.upper.is_finite()) || self.lower >= self.upper {
            config_bail!(
                "grid bounds must be finite and increasing, got [{}, {}]",
                self.lower,
                self.upper
            );
        }
        if self.interior < 2 {
            config_bail!(
                "grid needs at least 2 interior nodes, got {}",
                self.interior
            );
        }
        Ok(())
    }

    /// Node count including both boundary nodes.
    pub fn node_count(&self) -> usize {
        self.interior + 2
    }

    pub fn dx(&self) -> f64 {
        (self.upper - self.lower) / (self.interior as f64 + 1.0)
    }

    pub fn position(&self, node: usize) -> f64 {
        if node + 1 == self.node_count() {
            self.upper
        } else {
            self.lower + node as f64 * self.dx()
        }
    }

    pub fn nodes(&self) -> GridNodes {
        GridNodes {
            positions: (0..self.node_count()).map(|i| self.position(i)).collect(),
            boundary: vec![0, self.node_count() - 1],
        }
    }
}

/// Node positions and the indices of the two end nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridNodes {
    pub positions: Vec<f64>,
    pub boundary: Vec<usize>,
}

/// Maps `(field, node)` to a state index; fields occupy contiguous blocks in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLayout {
    fields: Vec<String>,
    nodes: usize,
}

impl FieldLayout {
    pub fn new(fields: Vec<String>, nodes: usize) -> SolveResult<Self> {
        if fields.is_empty() {
            config_bail!("at least one field is required");
        }
        let mut seen = HashSet::new();
        for name in &fields {
            if !seen.insert(name.as_str()) {
                config_bail!("duplicate field '{name}'");
            }
        }
        Ok(Self { fields, nodes })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn dimension(&self) -> usize {
        self.fields.len() * self.nodes
    }

    pub fn index(&self, field: usize, node: usize) -> usize {
        field * self.nodes + node
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    fn require(&self, name: &str, context: &str) -> SolveResult<usize> {
        match self.field_index(name) {
            Some(index) => Ok(index),
            None => config_bail!("{context} references unknown field '{name}'"),
        }
    }

    /// Slice of `state` holding one field.
    pub fn block<'a>(&self, state: &'a [f64], field: usize) -> &'a [f64] {
        &state[field * self.nodes..(field + 1) * self.nodes]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivative {
    Value,
    First,
    Second,
}

/// Spatially varying coefficient given as a closure of `x`.
#[derive(Clone)]
pub struct ProfileFn(pub Arc<dyn Fn(f64) -> f64 + Send + Sync>);

impl fmt::Debug for ProfileFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProfileFn(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coefficient {
    Constant(f64),
    /// One value per grid node.
    Nodal(Vec<f64>),
    #[serde(skip)]
    Function(ProfileFn),
}

impl Coefficient {
    pub fn function(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Coefficient::Function(ProfileFn(Arc::new(f)))
    }

    fn at(&self, node: usize, x: f64) -> f64 {
        match self {
            Coefficient::Constant(c) => *c,
            Coefficient::Nodal(values) => values[node],
            Coefficient::Function(ProfileFn(f)) => f(x),
        }
    }
}

impl From<f64> for Coefficient {
    fn from(value: f64) -> Self {
        Coefficient::Constant(value)
    }
}

/// `coefficient · ∂ᵏ field / ∂xᵏ`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub coefficient: Coefficient,
    pub derivative: Derivative,
    pub field: String,
}

impl Term {
    pub fn new(coefficient: impl Into<Coefficient>, derivative: Derivative, field: &str) -> Self {
        Self {
            coefficient: coefficient.into(),
            derivative,
            field: field.to_string(),
        }
    }

    pub fn value(coefficient: impl Into<Coefficient>, field: &str) -> Self {
        Self::new(coefficient, Derivative::Value, field)
    }

    pub fn first(coefficient: impl Into<Coefficient>, field: &str) -> Self {
        Self::new(coefficient, Derivative::First, field)
    }

    pub fn second(coefficient: impl Into<Coefficient>, field: &str) -> Self {
        Self::new(coefficient, Derivative::Second, field)
    }
}

/// Source term `s(t, x)`.
#[derive(Clone)]
pub struct SourceFn(pub Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>);

impl fmt::Debug for SourceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceFn(..)")
    }
}

/// `∂field/∂t = Σ terms + source(t, x)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldEquation {
    pub field: String,
    pub terms: Vec<Term>,
    #[serde(skip)]
    pub source: Option<SourceFn>,
}

impl FieldEquation {
    pub fn new(field: &str, terms: Vec<Term>) -> Self {
        Self {
            field: field.to_string(),
            terms,
            source: None,
        }
    }

    pub fn with_source(mut self, f: impl Fn(f64, f64) -> f64 + Send + Sync + 'static) -> Self {
        self.source = Some(SourceFn(Arc::new(f)));
        self
    }
}

/// Boundary value written over generic dual time so its rate is exact.
#[derive(Clone)]
pub struct BoundaryFn(pub Arc<dyn Fn(Dual) -> Dual + Send + Sync>);

impl fmt::Debug for BoundaryFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoundaryFn(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryValue {
    Constant(f64),
    /// `offset + amplitude · sin(omega · t + phase)`.
    Sinusoid {
        offset: f64,
        amplitude: f64,
        omega: f64,
        phase: f64,
    },
    #[serde(skip)]
    Custom(BoundaryFn),
}

impl BoundaryValue {
    pub fn custom(f: impl Fn(Dual) -> Dual + Send + Sync + 'static) -> Self {
        BoundaryValue::Custom(BoundaryFn(Arc::new(f)))
    }

    fn dual(&self, t: f64) -> Dual {
        let t = Dual::variable(t);
        match self {
            BoundaryValue::Constant(c) => Dual::constant(*c),
            BoundaryValue::Sinusoid {
                offset,
                amplitude,
                omega,
                phase,
            } => {
                Dual::constant(*offset)
                    + Dual::constant(*amplitude)
                        * (Dual::constant(*omega) * t + Dual::constant(*phase)).sin()
            }
            BoundaryValue::Custom(BoundaryFn(f)) => f(t),
        }
    }

    /// `g(t)`.
    pub fn value(&self, t: f64) -> f64 {
        self.dual(t).val
    }

    /// `g'(t)`.
    pub fn rate(&self, t: f64) -> f64 {
        self.dual(t).eps
    }

    fn validate(&self) -> SolveResult<()> {
        if let BoundaryValue::Sinusoid {
            offset,
            amplitude,
            omega,
            phase,
        } = self
        {
            if ![offset, amplitude, omega, phase].iter().all(|v| v.is_finite()) {
                config_bail!("sinusoidal boundary parameters must be finite");
            }
        }
        if let BoundaryValue::Constant(c) = self {
            if !c.is_finite() {
                config_bail!("boundary constant must be finite, got {c}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryNode {
    Left,
    Right,
    Index(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirichletCondition {
    pub field: String,
    pub node: BoundaryNode,
    pub value: BoundaryValue,
}

impl DirichletCondition {
    pub fn new(field: &str, node: BoundaryNode, value: BoundaryValue) -> Self {
        Self {
            field: field.to_string(),
            node,
            value,
        }
    }
}

/// Full description of a PDE problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdeSpec {
    pub grid: Grid1D,
    pub fields: Vec<String>,
    pub equations: Vec<FieldEquation>,
    #[serde(default)]
    pub boundaries: Vec<DirichletCondition>,
}

impl PdeSpec {
    /// Pins both end nodes of `field` to `value`.
    pub fn pin_ends(mut self, field: &str, value: BoundaryValue) -> Self {
        self.boundaries.push(DirichletCondition::new(
            field,
            BoundaryNode::Left,
            value.clone(),
        ));
        self.boundaries
            .push(DirichletCondition::new(field, BoundaryNode::Right, value));
        self
    }
}

#[derive(Debug, Clone)]
struct Pin {
    index: usize,
    value: BoundaryValue,
}

#[derive(Debug, Clone)]
struct Source {
    field: usize,
    f: SourceFn,
}

/// The assembled semi-discrete system `du/dt = L u + s(t)`.
#[derive(Debug, Clone)]
pub struct Discretization {
    grid: Grid1D,
    layout: FieldLayout,
    positions: Vec<f64>,
    operator: CsrMatrix<f64>,
    sources: Vec<Source>,
    pins: Vec<Pin>,
    pinned: Vec<bool>,
}

/// Finite-difference weights for `derivative` at `node`, as
/// `(neighbour node, weight)` pairs. End nodes use one-sided second-order
/// formulas; pinned end nodes never reach here.
fn stencil(derivative: Derivative, node: usize, nodes: usize, dx: f64) -> Vec<(usize, f64)> {
    let last = nodes - 1;
    match derivative {
        Derivative::Value => vec![(node, 1.0)],
        Derivative::First => {
            let w = 1.0 / (2.0 * dx);
            if node == 0 {
                vec![(0, -3.0 * w), (1, 4.0 * w), (2, -w)]
            } else if node == last {
                vec![(last, 3.0 * w), (last - 1, -4.0 * w), (last - 2, w)]
            } else {
                vec![(node - 1, -w), (node + 1, w)]
            }
        }
        Derivative::Second => {
            let w = 1.0 / (dx * dx);
            if node == 0 {
                vec![(0, 2.0 * w), (1, -5.0 * w), (2, 4.0 * w), (3, -w)]
            } else if node == last {
                vec![
                    (last, 2.0 * w),
                    (last - 1, -5.0 * w),
                    (last - 2, 4.0 * w),
                    (last - 3, -w),
                ]
            } else {
                vec![(node - 1, w), (node, -2.0 * w), (node + 1, w)]
            }
        }
    }
}

/// Lowers `spec` to an ODE system over the stacked field blocks.
pub fn discretize(spec: &PdeSpec) -> SolveResult<Discretization> {
    let grid = spec.grid;
    grid.validate()?;
    let nodes = grid.node_count();
    let layout = FieldLayout::new(spec.fields.clone(), nodes)?;
    let dim = layout.dimension();
    let dx = grid.dx();
    let positions = grid.nodes().positions;

    let mut pins = Vec::new();
    let mut pinned = vec![false; dim];
    for condition in &spec.boundaries {
        let field = layout.require(&condition.field, "boundary condition")?;
        let node = match condition.node {
            BoundaryNode::Left => 0,
            BoundaryNode::Right => nodes - 1,
            BoundaryNode::Index(i) if i < nodes => i,
            BoundaryNode::Index(i) => config_bail!(
                "boundary condition on field '{}' references node {i}, grid has {nodes} nodes",
                condition.field
            ),
        };
        condition.value.validate()?;
        let index = layout.index(field, node);
        if pinned[index] {
            config_bail!(
                "duplicate boundary condition on field '{}' node {node}",
                condition.field
            );
        }
        pinned[index] = true;
        pins.push(Pin {
            index,
            value: condition.value.clone(),
        });
    }

    let mut has_equation = vec![false; layout.fields().len()];
    let mut coo = CooMatrix::new(dim, dim);
    let mut sources = Vec::new();
    for equation in &spec.equations {
        let target = layout.require(&equation.field, "equation")?;
        if has_equation[target] {
            config_bail!("field '{}' has more than one equation", equation.field);
        }
        has_equation[target] = true;

        let mut resolved = Vec::with_capacity(equation.terms.len());
        for term in &equation.terms {
            let source_field = layout.require(&term.field, "term")?;
            match &term.coefficient {
                Coefficient::Nodal(values) if values.len() != nodes => config_bail!(
                    "nodal coefficient for field '{}' has {} values, grid has {nodes} nodes",
                    term.field,
                    values.len()
                ),
                Coefficient::Constant(c) if !c.is_finite() => {
                    config_bail!("coefficient must be finite, got {c}")
                }
                _ => {}
            }
            resolved.push((term, source_field));
        }

        for node in 0..nodes {
            let row = layout.index(target, node);
            if pinned[row] {
                continue;
            }
            for (term, source_field) in &resolved {
                let c = term.coefficient.at(node, positions[node]);
                if c == 0.0 {
                    continue;
                }
                for (neighbour, weight) in stencil(term.derivative, node, nodes, dx) {
                    coo.push(row, layout.index(*source_field, neighbour), c * weight);
                }
            }
        }

        if let Some(f) = &equation.source {
            sources.push(Source {
                field: target,
                f: f.clone(),
            });
        }
    }

    if let Some(missing) = has_equation.iter().position(|&has| !has) {
        config_bail!("field '{}' has no equation", layout.fields()[missing]);
    }

    Ok(Discretization {
        grid,
        layout,
        positions,
        operator: CsrMatrix::from(&coo),
        sources,
        pins,
        pinned,
    })
}

impl Discretization {
    pub fn grid(&self) -> &Grid1D {
        &self.grid
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn operator(&self) -> &CsrMatrix<f64> {
        &self.operator
    }

    /// State indices held by Dirichlet conditions.
    pub fn pinned_indices(&self) -> Vec<usize> {
        self.pins.iter().map(|pin| pin.index).collect()
    }

    pub fn is_pinned(&self, index: usize) -> bool {
        self.pinned.get(index).copied().unwrap_or(false)
    }

    /// Prescribed boundary value for a pinned state index at time `t`.
    pub fn boundary_value(&self, index: usize, t: f64) -> Option<f64> {
        self.pins
            .iter()
            .find(|pin| pin.index == index)
            .map(|pin| pin.value.value(t))
    }

    /// Samples `profile(field, x)` at every node, then applies the boundary
    /// values at `t0`.
    pub fn initial_state(&self, t0: f64, profile: impl Fn(usize, f64) -> f64) -> Vec<f64> {
        let mut state = vec![0.0; self.layout.dimension()];
        for field in 0..self.layout.fields().len() {
            for (node, &x) in self.positions.iter().enumerate() {
                state[self.layout.index(field, node)] = profile(field, x);
            }
        }
        self.project(t0, &mut state);
        state
    }
}

impl Dynamics for Discretization {
    fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    fn eval(&self, t: f64, x: &[f64], _params: &[f64], out: &mut [f64]) {
        let offsets = self.operator.row_offsets();
        let cols = self.operator.col_indices();
        let values = self.operator.values();
        for (row, slot) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in offsets[row]..offsets[row + 1] {
                acc += values[k] * x[cols[k]];
            }
            *slot = acc;
        }
        for source in &self.sources {
            for (node, &position) in self.positions.iter().enumerate() {
                let row = self.layout.index(source.field, node);
                if !self.pinned[row] {
                    out[row] += (source.f.0)(t, position);
                }
            }
        }
        for pin in &self.pins {
            out[pin.index] = pin.value.rate(t);
        }
    }

    fn jacobian(&self, _t: f64, _x: &[f64], _params: &[f64], out: &mut DMatrix<f64>) {
        out.fill(0.0);
        for (row, col, value) in self.operator.triplet_iter() {
            out[(row, col)] += *value;
        }
    }

    fn project(&self, t: f64, x: &mut [f64]) {
        for pin in &self.pins {
            x[pin.index] = pin.value.value(t);
        }
    }
}

impl Differentiable for Discretization {
    fn vjp(
        &self,
        _t: f64,
        _x: &[f64],
        _params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        _dp: &mut [f64],
    ) {
        dx.fill(0.0);
        let offsets = self.operator.row_offsets();
        let cols = self.operator.col_indices();
        let values = self.operator.values();
        for (row, &weight) in v.iter().enumerate() {
            if weight == 0.0 {
                continue;
            }
            for k in offsets[row]..offsets[row + 1] {
                dx[cols[k]] += values[k] * weight;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{solve, IntegratorConfig, TimeSpan};
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: SolveResult<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn diffusion(interior: usize) -> PdeSpec {
        PdeSpec {
            grid: Grid1D::new(0.0, 1.0, interior),
            fields: vec!["u".into()],
            equations: vec![FieldEquation::new("u", vec![Term::second(1.0, "u")])],
            boundaries: Vec::new(),
        }
        .pin_ends("u", BoundaryValue::Constant(0.0))
    }

    #[test]
    fn grid_spacing_counts_boundary_nodes() {
        let grid = Grid1D::new(0.0, 1.0, 3);
        assert_eq!(grid.node_count(), 5);
        assert_relative_eq!(grid.dx(), 0.25);
        assert_eq!(grid.position(4), 1.0);
        assert_eq!(grid.nodes().boundary, vec![0, 4]);
    }

    #[test]
    fn rejects_malformed_specs() {
        let mut spec = diffusion(1);
        assert_err_contains(discretize(&spec), "at least 2 interior nodes");

        spec = diffusion(4);
        spec.grid.upper = -1.0;
        assert_err_contains(discretize(&spec), "finite and increasing");

        spec = diffusion(4);
        spec.equations[0].terms.push(Term::value(1.0, "w"));
        assert_err_contains(discretize(&spec), "unknown field 'w'");

        spec = diffusion(4);
        spec.boundaries.push(DirichletCondition::new(
            "u",
            BoundaryNode::Index(9),
            BoundaryValue::Constant(1.0),
        ));
        assert_err_contains(discretize(&spec), "node 9");

        spec = diffusion(4);
        spec.boundaries.push(DirichletCondition::new(
            "v",
            BoundaryNode::Left,
            BoundaryValue::Constant(1.0),
        ));
        assert_err_contains(discretize(&spec), "unknown field 'v'");

        spec = diffusion(4);
        spec.fields.push("v".into());
        assert_err_contains(discretize(&spec), "field 'v' has no equation");
    }

    #[test]
    fn second_derivative_stencil_is_exact_on_quadratics() {
        let spec = PdeSpec {
            grid: Grid1D::new(0.0, 2.0, 6),
            fields: vec!["u".into()],
            equations: vec![FieldEquation::new("u", vec![Term::second(1.0, "u")])],
            boundaries: Vec::new(),
        };
        let disc = discretize(&spec).expect("discretize");
        let x: Vec<f64> = disc.positions().iter().map(|p| 3.0 * p * p - p).collect();
        let mut out = vec![0.0; x.len()];
        disc.eval(0.0, &x, &[], &mut out);
        for value in out {
            assert_relative_eq!(value, 6.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn first_derivative_stencil_is_exact_on_quadratics() {
        let spec = PdeSpec {
            grid: Grid1D::new(-1.0, 1.0, 5),
            fields: vec!["u".into()],
            equations: vec![FieldEquation::new("u", vec![Term::first(2.0, "u")])],
            boundaries: Vec::new(),
        };
        let disc = discretize(&spec).expect("discretize");
        let x: Vec<f64> = disc.positions().iter().map(|p| p * p).collect();
        let mut out = vec![0.0; x.len()];
        disc.eval(0.0, &x, &[], &mut out);
        for (value, p) in out.iter().zip(disc.positions()) {
            assert_relative_eq!(*value, 4.0 * p, epsilon = 1e-9);
        }
    }

    #[test]
    fn pinned_nodes_follow_boundary_rate_and_value() {
        let mut spec = diffusion(4);
        spec.boundaries[0].value = BoundaryValue::Sinusoid {
            offset: 1.0,
            amplitude: 0.5,
            omega: 2.0,
            phase: 0.0,
        };
        let disc = discretize(&spec).expect("discretize");
        let x = vec![0.0; disc.dimension()];
        let mut out = vec![0.0; x.len()];
        disc.eval(0.3, &x, &[], &mut out);
        assert_relative_eq!(out[0], 0.5 * 2.0 * (0.6f64).cos(), epsilon = 1e-14);
        assert_eq!(out[5], 0.0);

        let mut state = vec![7.0; disc.dimension()];
        disc.project(0.3, &mut state);
        assert_relative_eq!(state[0], 1.0 + 0.5 * (0.6f64).sin(), epsilon = 1e-14);
        assert_eq!(state[5], 0.0);
        assert_eq!(state[2], 7.0);
        assert_eq!(disc.pinned_indices(), vec![0, 5]);
    }

    #[test]
    fn custom_boundary_rate_comes_from_dual_numbers() {
        let value = BoundaryValue::custom(|t| t * t * Dual::constant(3.0));
        assert_relative_eq!(value.value(2.0), 12.0);
        assert_relative_eq!(value.rate(2.0), 12.0);
        assert_eq!(BoundaryValue::Constant(4.0).rate(1.0), 0.0);
    }

    #[test]
    fn vjp_is_transpose_of_jacobian() {
        let spec = PdeSpec {
            grid: Grid1D::new(0.0, 1.0, 3),
            fields: vec!["u".into(), "v".into()],
            equations: vec![
                FieldEquation::new("u", vec![Term::value(1.0, "v")]),
                FieldEquation::new(
                    "v",
                    vec![Term::second(2.0, "u"), Term::first(Coefficient::function(|x| x), "v")],
                ),
            ],
            boundaries: Vec::new(),
        }
        .pin_ends("u", BoundaryValue::Constant(0.0))
        .pin_ends("v", BoundaryValue::Constant(0.0));
        let disc = discretize(&spec).expect("discretize");
        let n = disc.dimension();
        let mut jac = DMatrix::zeros(n, n);
        disc.jacobian(0.0, &vec![0.0; n], &[], &mut jac);
        let v: Vec<f64> = (0..n).map(|i| (i as f64 + 1.0).sin()).collect();
        let mut dx = vec![0.0; n];
        disc.vjp(0.0, &vec![0.0; n], &[], &v, &mut dx, &mut []);
        let expected = jac.transpose() * nalgebra::DVector::from_column_slice(&v);
        for i in 0..n {
            assert_relative_eq!(dx[i], expected[i], epsilon = 1e-12);
        }
        // Pinned rows have no stencil entries.
        for index in disc.pinned_indices() {
            assert!(jac.row(index).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn heat_mode_decays_at_discrete_rate() {
        let interior = 30;
        let spec = diffusion(interior);
        let disc = discretize(&spec).expect("discretize");
        let u0 = disc.initial_state(0.0, |_, x| (std::f64::consts::PI * x).sin());
        let config = IntegratorConfig::default().with_tolerances(1e-9, 1e-7);
        let traj = solve(&disc, &[], &u0, TimeSpan::new(0.0, 0.1), &config).expect("solve");
        // Semi-discrete eigenvalue of the sine mode.
        let dx = disc.grid().dx();
        let lambda = 4.0 / (dx * dx) * (std::f64::consts::PI * dx / 2.0).sin().powi(2);
        let decay = (-lambda * 0.1).exp();
        let last = traj.last_state();
        for (node, &x) in disc.positions().iter().enumerate() {
            let exact = (std::f64::consts::PI * x).sin() * decay;
            assert!((last[node] - exact).abs() < 1e-5, "node {node}");
        }
        assert_eq!(last[0], 0.0);
        assert_eq!(last[interior + 1], 0.0);
    }

    #[test]
    fn source_term_is_skipped_on_pinned_rows() {
        let mut spec = diffusion(3);
        spec.equations[0] = FieldEquation::new("u", Vec::new()).with_source(|t, x| t + x);
        let disc = discretize(&spec).expect("discretize");
        let mut out = vec![0.0; disc.dimension()];
        disc.eval(1.0, &vec![0.0; disc.dimension()], &[], &mut out);
        assert_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], 1.25);
        assert_eq!(out[4], 0.0);
    }
}
