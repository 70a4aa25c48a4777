//! WASM bindings for `molt_core`.
//!
//! Errors crossing into JavaScript are flattened to strings; inside the
//! bridge they travel as `anyhow::Error` so solve failures, decoding
//! problems and callback failures share one context chain.

mod solver;
mod system;
mod trajectory;

pub use solver::WasmSolver;
pub use system::{preset, JsDynamics, PresetOptions, PRESET_NAMES};
pub use trajectory::WasmTrajectory;

use wasm_bindgen::prelude::*;

pub(crate) fn to_js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

/// Names accepted by `WasmSolver.preset`.
#[wasm_bindgen]
pub fn preset_names() -> Vec<String> {
    PRESET_NAMES.iter().map(|name| name.to_string()).collect()
}
