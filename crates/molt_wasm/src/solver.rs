//! `WasmSolver`: one dynamics source plus integrator settings, solving and
//! differentiating on request.

use crate::system::{pde_from_spec, preset, JsDynamics, PresetOptions, SystemSource};
use crate::trajectory::WasmTrajectory;
use crate::to_js_error;
use anyhow::{bail, Context, Result};
use js_sys::Function;
use molt_core::adjoint::{adjoint_sensitivity, AdjointConfig, Sensitivity};
use molt_core::integrator::{solve, IntegratorConfig, TimeSpan};
use molt_core::loss::SquaredError;
use molt_core::pde::PdeSpec;
use molt_core::solvers::Method;
use molt_core::trajectory::Trajectory;
use std::cell::RefCell;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmSolver {
    pub(crate) source: SystemSource,
    pub(crate) params: Vec<f64>,
    pub(crate) config: IntegratorConfig,
    pub(crate) adjoint: AdjointConfig,
}

impl WasmSolver {
    pub(crate) fn from_source(source: SystemSource, params: Vec<f64>) -> Result<Self> {
        let expected = source.dynamics().num_params();
        if params.len() != expected {
            bail!(
                "parameter dimension mismatch: expected {expected}, got {}",
                params.len()
            );
        }
        Ok(Self {
            source,
            params,
            config: IntegratorConfig::default(),
            adjoint: AdjointConfig::default(),
        })
    }

    pub(crate) fn preset_with(
        name: &str,
        params: Vec<f64>,
        options: PresetOptions,
    ) -> Result<Self> {
        Self::from_source(SystemSource::Model(preset(name, options)?), params)
    }

    pub(crate) fn pde_with(spec: PdeSpec) -> Result<Self> {
        Self::from_source(SystemSource::Pde(Box::new(pde_from_spec(spec)?)), Vec::new())
    }

    pub(crate) fn set_method_name(&mut self, name: &str) -> Result<()> {
        self.config.method = match name {
            "tsit5" => Method::Tsit5,
            "dp5" | "dormand_prince" => Method::DormandPrince,
            "bs3" | "bogacki_shampine" => Method::BogackiShampine,
            "sdirk2" => Method::Sdirk2,
            other => bail!("unknown method '{other}'"),
        };
        Ok(())
    }

    pub(crate) fn set_integrator(&mut self, config: IntegratorConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub(crate) fn solve_span(&self, y0: &[f64], t0: f64, t1: f64) -> Result<Trajectory> {
        self.source.reset();
        let result = solve(
            self.source.dynamics(),
            &self.params,
            y0,
            TimeSpan::new(t0, t1),
            &self.config,
        );
        if self.source.callback_failed() {
            bail!("dynamics callback threw or returned a vector of the wrong length");
        }
        result.context("solve failed")
    }

    pub(crate) fn sensitivity_for(
        &self,
        y0: &[f64],
        t0: f64,
        t1: f64,
        loss: &SquaredError,
    ) -> Result<Sensitivity> {
        self.source.reset();
        let sensitivity = adjoint_sensitivity(
            self.source.dynamics(),
            &self.params,
            y0,
            TimeSpan::new(t0, t1),
            loss,
            &self.config,
            &self.adjoint,
        );
        if self.source.callback_failed() {
            bail!("dynamics callback threw or returned a vector of the wrong length");
        }
        sensitivity.context("sensitivity computation failed")
    }
}

#[wasm_bindgen]
impl WasmSolver {
    /// Dynamics given by a JS function `(t, x, p) => dxdt`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        callback: Function,
        dimension: usize,
        params: Vec<f64>,
    ) -> Result<WasmSolver, JsValue> {
        console_error_panic_hook::set_once();
        let num_params = params.len();
        JsDynamics::new(callback, dimension, num_params)
            .and_then(|js| Self::from_source(SystemSource::Callback(js), params))
            .map_err(to_js_error)
    }

    /// One of the built-in models: `sir` (needs `population`), `pendulum`,
    /// `lotka_volterra`, `linear_decay` (optional `dimension`) or
    /// `van_der_pol`.
    pub fn preset(
        name: &str,
        params: Vec<f64>,
        population: Option<f64>,
        dimension: Option<u32>,
    ) -> Result<WasmSolver, JsValue> {
        console_error_panic_hook::set_once();
        let options = PresetOptions {
            population,
            dimension: dimension.map(|d| d as usize),
        };
        Self::preset_with(name, params, options).map_err(to_js_error)
    }

    /// Method-of-lines system from a serialized `PdeSpec`.
    pub fn pde(spec: JsValue) -> Result<WasmSolver, JsValue> {
        console_error_panic_hook::set_once();
        let spec: PdeSpec = serde_wasm_bindgen::from_value(spec)
            .map_err(|err| JsValue::from_str(&format!("Invalid PDE spec: {err}")))?;
        Self::pde_with(spec).map_err(to_js_error)
    }

    pub fn dimension(&self) -> usize {
        self.source.dynamics().dimension()
    }

    pub fn set_params(&mut self, params: Vec<f64>) -> Result<(), JsValue> {
        let expected = self.source.dynamics().num_params();
        if params.len() != expected {
            return Err(JsValue::from_str(&format!(
                "Expected {expected} parameters, got {}.",
                params.len()
            )));
        }
        self.params = params;
        Ok(())
    }

    pub fn get_params(&self) -> Vec<f64> {
        self.params.clone()
    }

    pub fn set_method(&mut self, name: &str) -> Result<(), JsValue> {
        self.set_method_name(name).map_err(to_js_error)
    }

    pub fn set_tolerances(&mut self, abstol: f64, reltol: f64) -> Result<(), JsValue> {
        let config = self.config.with_tolerances(abstol, reltol);
        self.set_integrator(config).map_err(to_js_error)
    }

    /// Replaces every integrator setting from a serialized `IntegratorConfig`;
    /// missing fields take their defaults.
    pub fn set_config(&mut self, config: JsValue) -> Result<(), JsValue> {
        let config: IntegratorConfig = serde_wasm_bindgen::from_value(config)
            .map_err(|err| JsValue::from_str(&format!("Invalid integrator config: {err}")))?;
        self.set_integrator(config).map_err(to_js_error)
    }

    /// Initial PDE state from a JS profile `(field, x) => u`; boundary nodes
    /// take their prescribed values at `t0`.
    pub fn pde_initial_state(&self, t0: f64, profile: Function) -> Result<Vec<f64>, JsValue> {
        let SystemSource::Pde(disc) = &self.source else {
            return Err(JsValue::from_str("Solver does not hold a PDE system."));
        };
        let failure = RefCell::new(None);
        let state = disc.initial_state(t0, |field, x| {
            let field = JsValue::from(field as u32);
            match profile.call2(&JsValue::NULL, &field, &JsValue::from_f64(x)) {
                Ok(value) => value.as_f64().unwrap_or(f64::NAN),
                Err(err) => {
                    failure.borrow_mut().get_or_insert(err);
                    f64::NAN
                }
            }
        });
        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    pub fn solve(&self, y0: Vec<f64>, t0: f64, t1: f64) -> Result<WasmTrajectory, JsValue> {
        self.solve_span(&y0, t0, t1)
            .map(WasmTrajectory::from)
            .map_err(to_js_error)
    }

    /// Loss and gradients for a squared-error fit given as a serialized
    /// `SquaredError`.
    pub fn sensitivity(
        &self,
        y0: Vec<f64>,
        t0: f64,
        t1: f64,
        loss: JsValue,
    ) -> Result<JsValue, JsValue> {
        let loss: SquaredError = serde_wasm_bindgen::from_value(loss)
            .map_err(|err| JsValue::from_str(&format!("Invalid loss: {err}")))?;
        let sensitivity = self
            .sensitivity_for(&y0, t0, t1, &loss)
            .map_err(to_js_error)?;
        serde_wasm_bindgen::to_value(&sensitivity)
            .map_err(|err| JsValue::from_str(&format!("Failed to serialize sensitivity: {err}")))
    }
}
