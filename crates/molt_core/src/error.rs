use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by a solve (forward or adjoint) or by problem setup.
///
/// Ordinary step rejection is not an error: the integrator retries silently
/// within its rejection budget and only reports once that budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum SolveError {
    /// Invalid tolerances, spans, grids or dimensions. Raised before any
    /// solve starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The integrator could not make progress. `t` and `state` are the last
    /// accepted values.
    #[error("step failure at t = {t}: {reason}")]
    StepFailure {
        t: f64,
        state: Vec<f64>,
        reason: StepFailureReason,
    },

    /// A NaN or infinite value appeared in the state vector.
    #[error("non-finite state encountered at t = {t}")]
    NonFiniteState { t: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepFailureReason {
    MaxStepsExceeded(usize),
    StepSizeUnderflow(f64),
    TooManyRejections(usize),
}

impl std::fmt::Display for StepFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailureReason::MaxStepsExceeded(n) => {
                write!(f, "exceeded maximum of {n} steps")
            }
            StepFailureReason::StepSizeUnderflow(h) => {
                write!(f, "step size underflow (h = {h:e})")
            }
            StepFailureReason::TooManyRejections(n) => {
                write!(f, "{n} consecutive step rejections")
            }
        }
    }
}

pub type SolveResult<T> = Result<T, SolveError>;

/// Shorthand used by the validation helpers, mirrors `anyhow::bail!` but
/// produces a typed configuration error.
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::SolveError::Config(format!($($arg)*)))
    };
}

pub(crate) use config_bail;

pub(crate) fn ensure_finite(t: f64, state: &[f64]) -> SolveResult<()> {
    if state.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SolveError::NonFiniteState { t })
    }
}
