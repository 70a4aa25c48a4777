//! The `molt_core` crate is the numerical engine behind Molt: adaptive ODE
//! integration, method-of-lines PDE discretization, adjoint sensitivities and
//! gradient-based parameter fitting.
//!
//! Key components:
//! - **Traits**: `Scalar`, `DynamicalSystem` (generic right-hand sides),
//!   `Dynamics` (f64 evaluation and Jacobians) and `Differentiable` (VJPs).
//! - **Integrator**: embedded Runge-Kutta pairs (Tsit5, Dormand-Prince,
//!   Bogacki-Shampine) and an SDIRK method with Newton iterations, with
//!   error control and Hermite dense output.
//! - **PDE**: finite-difference discretization of 1-D field equations into a
//!   sparse operator with Dirichlet boundaries.
//! - **Adjoint**: loss gradients by backward costate integration.
//! - **Training**: MLP vector fields, optimizers and the training loop.
pub mod adjoint;
pub mod autodiff;
pub mod error;
pub mod integrator;
pub mod loss;
pub mod models;
pub mod nn;
pub mod optimizer;
pub mod pde;
pub mod sdirk;
pub mod solvers;
pub mod trainer;
pub mod trajectory;
pub mod traits;

pub use adjoint::{adjoint_sensitivity, AdjointConfig, ForwardState, Sensitivity};
pub use error::{SolveError, SolveResult, StepFailureReason};
pub use integrator::{solve, IntegratorConfig, TimeSpan};
pub use loss::{evaluate_loss, Loss, SquaredError, TerminalLoss};
pub use pde::{discretize, Discretization, Grid1D, PdeSpec};
pub use solvers::Method;
pub use trainer::{Control, Observer, Trainer, TrainerConfig, TrainingReport, TrainingStatus};
pub use trajectory::{SolveStats, Trajectory};
pub use traits::{Differentiable, DynamicalSystem, Dynamics};
