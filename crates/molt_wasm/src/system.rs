//! Dynamics sources reachable from JavaScript: a user callback, a named
//! preset model or a discretized PDE.

use anyhow::{anyhow, bail, Context, Result};
use js_sys::{Float64Array, Function};
use molt_core::models::{LinearDecay, LotkaVolterra, Pendulum, Sir, VanDerPol};
use molt_core::pde::{discretize, Discretization, PdeSpec};
use molt_core::traits::{Differentiable, Dynamics};
use std::cell::Cell;
use wasm_bindgen::prelude::*;

/// Right-hand side evaluated by a JS function `(t, x, p) => dxdt`.
///
/// JS callbacks carry no derivative information, so VJPs are NaN and any
/// gradient computed through them is reported as undefined.
pub struct JsDynamics {
    callback: Function,
    dimension: usize,
    num_params: usize,
    failed: Cell<bool>,
}

impl JsDynamics {
    pub fn new(callback: Function, dimension: usize, num_params: usize) -> Result<Self> {
        if dimension == 0 {
            bail!("callback dynamics need a positive dimension");
        }
        Ok(Self {
            callback,
            dimension,
            num_params,
            failed: Cell::new(false),
        })
    }

    /// Whether any callback invocation threw or returned the wrong length.
    pub fn failed(&self) -> bool {
        self.failed.get()
    }

    pub fn reset(&self) {
        self.failed.set(false);
    }
}

impl Dynamics for JsDynamics {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn num_params(&self) -> usize {
        self.num_params
    }

    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        let x = Float64Array::from(x);
        let p = Float64Array::from(params);
        match self
            .callback
            .call3(&JsValue::NULL, &JsValue::from_f64(t), &x, &p)
        {
            Ok(value) => {
                let values = Float64Array::new(&value);
                if values.length() as usize == out.len() {
                    values.copy_to(out);
                } else {
                    self.failed.set(true);
                    out.fill(f64::NAN);
                }
            }
            Err(_) => {
                // A NaN derivative surfaces as NonFiniteState in the solve.
                self.failed.set(true);
                out.fill(f64::NAN);
            }
        }
    }
}

impl Differentiable for JsDynamics {
    fn vjp(
        &self,
        _t: f64,
        _x: &[f64],
        _params: &[f64],
        _v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    ) {
        dx.fill(f64::NAN);
        dp.fill(f64::NAN);
    }
}

/// Options consumed by some presets.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresetOptions {
    pub population: Option<f64>,
    pub dimension: Option<usize>,
}

pub const PRESET_NAMES: [&str; 5] = [
    "sir",
    "pendulum",
    "lotka_volterra",
    "linear_decay",
    "van_der_pol",
];

/// Builds a differentiable preset model by name.
pub fn preset(name: &str, options: PresetOptions) -> Result<Box<dyn Differentiable>> {
    let model: Box<dyn Differentiable> = match name {
        "sir" => {
            let population = options
                .population
                .ok_or_else(|| anyhow!("the sir preset needs a population"))?;
            if !(population.is_finite() && population > 0.0) {
                bail!("population must be positive, got {population}");
            }
            Box::new(Sir::new(population).lifted())
        }
        "pendulum" => Box::new(Pendulum.lifted()),
        "lotka_volterra" => Box::new(LotkaVolterra.lifted()),
        "linear_decay" => {
            let dimension = options.dimension.unwrap_or(1);
            if dimension == 0 {
                bail!("linear_decay needs a positive dimension");
            }
            Box::new(LinearDecay::new(dimension).lifted())
        }
        "van_der_pol" => Box::new(VanDerPol.lifted()),
        other => bail!(
            "unknown preset '{other}', expected one of {}",
            PRESET_NAMES.join(", ")
        ),
    };
    Ok(model)
}

/// Discretizes a PDE description given as JSON-like data.
pub fn pde_from_spec(spec: PdeSpec) -> Result<Discretization> {
    discretize(&spec).context("failed to discretize PDE")
}

pub(crate) enum SystemSource {
    Callback(JsDynamics),
    Model(Box<dyn Differentiable>),
    Pde(Box<Discretization>),
}

impl SystemSource {
    pub(crate) fn dynamics(&self) -> &dyn Differentiable {
        match self {
            SystemSource::Callback(js) => js,
            SystemSource::Model(model) => model.as_ref(),
            SystemSource::Pde(disc) => disc.as_ref(),
        }
    }

    pub(crate) fn callback_failed(&self) -> bool {
        match self {
            SystemSource::Callback(js) => js.failed(),
            _ => false,
        }
    }

    pub(crate) fn reset(&self) {
        if let SystemSource::Callback(js) = self {
            js.reset();
        }
    }
}
