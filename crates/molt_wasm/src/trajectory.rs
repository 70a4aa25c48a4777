//! JS view of a solved trajectory.

use js_sys::Float64Array;
use molt_core::trajectory::Trajectory;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmTrajectory {
    inner: Trajectory,
}

impl From<Trajectory> for WasmTrajectory {
    fn from(inner: Trajectory) -> Self {
        Self { inner }
    }
}

impl WasmTrajectory {
    pub fn inner(&self) -> &Trajectory {
        &self.inner
    }

    fn flat_states(&self) -> Vec<f64> {
        self.inner.states().iter().flatten().copied().collect()
    }
}

#[wasm_bindgen]
impl WasmTrajectory {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    pub fn times(&self) -> Float64Array {
        Float64Array::from(self.inner.times())
    }

    /// Row-major `len × dimension` block of states.
    pub fn states(&self) -> Float64Array {
        Float64Array::from(self.flat_states().as_slice())
    }

    pub fn component(&self, index: usize) -> Result<Float64Array, JsValue> {
        match self.inner.component(index) {
            Some(values) => Ok(Float64Array::from(values.as_slice())),
            None => Err(JsValue::from_str(&format!(
                "Component {index} out of range for dimension {}.",
                self.inner.dimension()
            ))),
        }
    }

    /// Dense-output state at `t`, or `undefined` outside the solved span.
    pub fn sample(&self, t: f64) -> Option<Vec<f64>> {
        self.inner.sample(t)
    }

    pub fn stats(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.inner.stats)
            .map_err(|err| JsValue::from_str(&format!("Failed to serialize stats: {err}")))
    }

    /// The whole trajectory as a plain JS object.
    pub fn to_js(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.inner)
            .map_err(|err| JsValue::from_str(&format!("Failed to serialize trajectory: {err}")))
    }
}
