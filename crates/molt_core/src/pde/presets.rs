use super::{BoundaryValue, Coefficient, FieldEquation, FieldLayout, Grid1D, PdeSpec, Term};
use crate::error::{config_bail, SolveResult};
use num_complex::Complex64;

/// `u_t = D u_xx` with `u` held at zero on both ends.
pub fn heat_equation(grid: Grid1D, diffusivity: f64) -> PdeSpec {
    PdeSpec {
        grid,
        fields: vec!["u".into()],
        equations: vec![FieldEquation::new("u", vec![Term::second(diffusivity, "u")])],
        boundaries: Vec::new(),
    }
    .pin_ends("u", BoundaryValue::Constant(0.0))
}

/// `u_tt = c² u_xx` as the first-order pair `u_t = v`, `v_t = c² u_xx`,
/// both fields fixed at zero on the ends.
pub fn wave_equation(grid: Grid1D, speed: f64) -> PdeSpec {
    PdeSpec {
        grid,
        fields: vec!["u".into(), "v".into()],
        equations: vec![
            FieldEquation::new("u", vec![Term::value(1.0, "v")]),
            FieldEquation::new("v", vec![Term::second(speed * speed, "u")]),
        ],
        boundaries: Vec::new(),
    }
    .pin_ends("u", BoundaryValue::Constant(0.0))
    .pin_ends("v", BoundaryValue::Constant(0.0))
}

/// `i ψ_t = -½ ψ_xx + V ψ` split into `ψ = re + i·im`:
/// `re_t = -½ im_xx + V im`, `im_t = ½ re_xx - V re`.
pub fn schrodinger_equation(grid: Grid1D, potential: Coefficient) -> PdeSpec {
    let negated = match &potential {
        Coefficient::Constant(v) => Coefficient::Constant(-v),
        Coefficient::Nodal(values) => Coefficient::Nodal(values.iter().map(|v| -v).collect()),
        Coefficient::Function(profile) => {
            let f = profile.0.clone();
            Coefficient::function(move |x| -f(x))
        }
    };
    PdeSpec {
        grid,
        fields: vec!["re".into(), "im".into()],
        equations: vec![
            FieldEquation::new(
                "re",
                vec![Term::second(-0.5, "im"), Term::value(potential, "im")],
            ),
            FieldEquation::new(
                "im",
                vec![Term::second(0.5, "re"), Term::value(negated, "re")],
            ),
        ],
        boundaries: Vec::new(),
    }
    .pin_ends("re", BoundaryValue::Constant(0.0))
    .pin_ends("im", BoundaryValue::Constant(0.0))
}

/// Real parts followed by imaginary parts.
pub fn split_complex(values: &[Complex64]) -> Vec<f64> {
    values
        .iter()
        .map(|c| c.re)
        .chain(values.iter().map(|c| c.im))
        .collect()
}

/// Inverse of [`split_complex`].
pub fn join_complex(state: &[f64]) -> SolveResult<Vec<Complex64>> {
    if state.len() % 2 != 0 {
        config_bail!(
            "complex state needs an even length, got {}",
            state.len()
        );
    }
    let (re, im) = state.split_at(state.len() / 2);
    Ok(re
        .iter()
        .zip(im)
        .map(|(&re, &im)| Complex64::new(re, im))
        .collect())
}

/// `Σ u² Δx` over interior nodes of the listed fields.
pub fn discrete_norm(
    state: &[f64],
    layout: &FieldLayout,
    fields: &[usize],
    dx: f64,
) -> SolveResult<f64> {
    if state.len() != layout.dimension() {
        config_bail!(
            "state has {} values, layout expects {}",
            state.len(),
            layout.dimension()
        );
    }
    if let Some(&field) = fields.iter().find(|&&f| f >= layout.fields().len()) {
        config_bail!(
            "field {field} is out of range for a layout with {} fields",
            layout.fields().len()
        );
    }
    let nodes = layout.nodes();
    let mut sum = 0.0;
    for &field in fields {
        for node in 1..nodes.saturating_sub(1) {
            let value = state[layout.index(field, node)];
            sum += value * value;
        }
    }
    Ok(sum * dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{solve, IntegratorConfig, TimeSpan};
    use crate::pde::discretize;
    use crate::traits::Dynamics;
    use approx::assert_relative_eq;

    #[test]
    fn complex_split_places_real_block_first() {
        let values = vec![Complex64::new(1.0, -1.0), Complex64::new(2.0, 3.0)];
        let state = split_complex(&values);
        assert_eq!(state, vec![1.0, 2.0, -1.0, 3.0]);
        assert_eq!(join_complex(&state).expect("even"), values);
        assert!(join_complex(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn wave_equation_returns_after_one_period() {
        let grid = Grid1D::new(0.0, 1.0, 40);
        let disc = discretize(&wave_equation(grid, 1.0)).expect("discretize");
        let u0 = disc.initial_state(0.0, |field, x| {
            if field == 0 {
                (std::f64::consts::PI * x).sin()
            } else {
                0.0
            }
        });
        let config = IntegratorConfig::default().with_tolerances(1e-10, 1e-8);
        let traj = solve(&disc, &[], &u0, TimeSpan::new(0.0, 2.0), &config).expect("solve");
        // After one period the string returns to its initial shape.
        let last = traj.last_state();
        let layout = disc.layout();
        for node in 0..layout.nodes() {
            assert!((last[layout.index(0, node)] - u0[node]).abs() < 1e-2);
        }
    }

    #[test]
    fn schrodinger_preset_uses_rotation_structure() {
        let grid = Grid1D::new(0.0, 1.0, 4);
        let disc = discretize(&schrodinger_equation(grid, Coefficient::Constant(2.0)))
            .expect("discretize");
        let layout = disc.layout().clone();
        let mut state = vec![0.0; disc.dimension()];
        state[layout.index(1, 2)] = 1.0;
        let mut out = vec![0.0; state.len()];
        disc.eval(0.0, &state, &[], &mut out);
        let dx = grid.dx();
        // re_t at node 2 picks up -½·(-2/dx²) + V from the unit imaginary bump.
        assert_relative_eq!(out[layout.index(0, 2)], 1.0 / (dx * dx) + 2.0, epsilon = 1e-9);
        assert_relative_eq!(out[layout.index(0, 1)], -0.5 / (dx * dx), epsilon = 1e-9);
        assert_eq!(out[layout.index(1, 2)], 0.0);
    }

    #[test]
    fn discrete_norm_skips_boundary_nodes() {
        let layout = FieldLayout::new(vec!["a".into(), "b".into()], 4).expect("layout");
        let state = vec![9.0, 1.0, 2.0, 9.0, 9.0, 3.0, 0.0, 9.0];
        assert_relative_eq!(discrete_norm(&state, &layout, &[0, 1], 0.5).expect("norm"), 7.0);
        assert_relative_eq!(discrete_norm(&state, &layout, &[1], 0.5).expect("norm"), 4.5);
    }

    #[test]
    fn discrete_norm_rejects_unknown_fields() {
        let layout = FieldLayout::new(vec!["a".into()], 3).expect("layout");
        assert!(discrete_norm(&[0.0; 3], &layout, &[1], 0.5).is_err());
        assert!(discrete_norm(&[0.0; 2], &layout, &[0], 0.5).is_err());
    }
}
