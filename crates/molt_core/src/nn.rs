//! Small dense networks used as trainable vector fields.
//!
//! An [`Mlp`] only describes the architecture; its weights live in the flat
//! parameter vector handed to every call, laid out layer by layer as the
//! row-major weight matrix followed by the bias vector.

use crate::error::{config_bail, SolveResult};
use crate::traits::{Differentiable, Dynamics};
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Tanh,
    Softplus,
    Relu,
    Identity,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Tanh => z.tanh(),
            Activation::Softplus => {
                if z > 30.0 {
                    z
                } else {
                    z.exp().ln_1p()
                }
            }
            Activation::Relu => z.max(0.0),
            Activation::Identity => z,
        }
    }

    /// Derivative at the pre-activation `z`. ReLU has none at exactly zero
    /// and reports NaN there.
    fn derivative(self, z: f64) -> f64 {
        match self {
            Activation::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
            Activation::Softplus => 1.0 / (1.0 + (-z).exp()),
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else if z < 0.0 {
                    0.0
                } else {
                    f64::NAN
                }
            }
            Activation::Identity => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Layer widths, input first and output last.
    pub layers: Vec<usize>,
    pub activation: Activation,
    pub output_activation: Activation,
    pub seed: u64,
    /// Multiplier on the Glorot bound; small values start near the zero
    /// vector field.
    pub init_scale: f64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            layers: vec![2, 16, 2],
            activation: Activation::Tanh,
            output_activation: Activation::Identity,
            seed: 0,
            init_scale: 1.0,
        }
    }
}

impl MlpConfig {
    pub fn validate(&self) -> SolveResult<()> {
        if self.layers.len() < 2 {
            config_bail!("an MLP needs at least input and output layers");
        }
        if self.layers.iter().any(|&w| w == 0) {
            config_bail!("layer widths must be positive, got {:?}", self.layers);
        }
        if !(self.init_scale.is_finite() && self.init_scale >= 0.0) {
            config_bail!("init_scale must be non-negative, got {}", self.init_scale);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    config: MlpConfig,
    /// Offset of each layer's weights in the parameter vector.
    offsets: Vec<usize>,
    num_params: usize,
}

/// Pre-activations and activations of one forward pass.
#[derive(Debug, Clone, Default)]
pub struct MlpTape {
    pre: Vec<Vec<f64>>,
    post: Vec<Vec<f64>>,
    delta: Vec<f64>,
    next: Vec<f64>,
}

impl Mlp {
    pub fn new(config: MlpConfig) -> SolveResult<Self> {
        config.validate()?;
        let mut offsets = Vec::with_capacity(config.layers.len() - 1);
        let mut total = 0;
        for pair in config.layers.windows(2) {
            offsets.push(total);
            total += pair[0] * pair[1] + pair[1];
        }
        Ok(Self {
            config,
            offsets,
            num_params: total,
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    pub fn input_dim(&self) -> usize {
        self.config.layers[0]
    }

    pub fn output_dim(&self) -> usize {
        self.config.layers[self.config.layers.len() - 1]
    }

    pub fn tape(&self) -> MlpTape {
        MlpTape {
            pre: self.config.layers[1..].iter().map(|&w| vec![0.0; w]).collect(),
            post: self.config.layers.iter().map(|&w| vec![0.0; w]).collect(),
            delta: Vec::new(),
            next: Vec::new(),
        }
    }

    /// Glorot-uniform weights and zero biases from a seeded ChaCha8 stream.
    pub fn init_params(&self) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut params = vec![0.0; self.num_params];
        for (layer, pair) in self.config.layers.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let bound = self.config.init_scale * (6.0 / (fan_in + fan_out) as f64).sqrt();
            let start = self.offsets[layer];
            for w in &mut params[start..start + fan_in * fan_out] {
                *w = if bound > 0.0 {
                    rng.random_range(-bound..bound)
                } else {
                    0.0
                };
            }
        }
        params
    }

    fn activation(&self, layer: usize) -> Activation {
        if layer + 2 == self.config.layers.len() {
            self.config.output_activation
        } else {
            self.config.activation
        }
    }

    /// Runs the network on `input`, recording intermediate values in `tape`.
    pub fn forward(&self, params: &[f64], input: &[f64], tape: &mut MlpTape, out: &mut [f64]) {
        tape.post[0].copy_from_slice(input);
        for (layer, pair) in self.config.layers.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let weights = &params[self.offsets[layer]..];
            let bias = &weights[fan_in * fan_out..];
            let activation = self.activation(layer);
            let (head, tail) = tape.post.split_at_mut(layer + 1);
            let x = &head[layer];
            let y = &mut tail[0];
            for o in 0..fan_out {
                let row = &weights[o * fan_in..(o + 1) * fan_in];
                let z = row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + bias[o];
                tape.pre[layer][o] = z;
                y[o] = activation.apply(z);
            }
        }
        out.copy_from_slice(&tape.post[self.config.layers.len() - 1]);
    }

    /// Back-propagates `v` through the pass recorded in `tape`, writing
    /// `(∂out/∂input)ᵀ v` and `(∂out/∂params)ᵀ v`.
    pub fn backward(
        &self,
        params: &[f64],
        tape: &mut MlpTape,
        v: &[f64],
        d_input: &mut [f64],
        d_params: &mut [f64],
    ) {
        d_params.fill(0.0);
        let MlpTape {
            pre,
            post,
            delta,
            next,
        } = tape;
        delta.clear();
        delta.extend_from_slice(v);
        for layer in (0..self.config.layers.len() - 1).rev() {
            let (fan_in, fan_out) = (self.config.layers[layer], self.config.layers[layer + 1]);
            let activation = self.activation(layer);
            let start = self.offsets[layer];
            for o in 0..fan_out {
                delta[o] *= activation.derivative(pre[layer][o]);
            }
            let x = &post[layer];
            for o in 0..fan_out {
                let row = &mut d_params[start + o * fan_in..start + (o + 1) * fan_in];
                for (g, xi) in row.iter_mut().zip(x) {
                    *g = delta[o] * xi;
                }
                d_params[start + fan_in * fan_out + o] = delta[o];
            }
            next.clear();
            next.resize(fan_in, 0.0);
            for o in 0..fan_out {
                let row = &params[start + o * fan_in..start + (o + 1) * fan_in];
                for (acc, w) in next.iter_mut().zip(row) {
                    *acc += w * delta[o];
                }
            }
            std::mem::swap(delta, next);
        }
        d_input.copy_from_slice(&delta[..d_input.len()]);
    }
}

/// `dx/dt = MLP(x; θ)`.
pub struct NeuralOde {
    mlp: Mlp,
    tape: RefCell<MlpTape>,
}

impl NeuralOde {
    pub fn new(mlp: Mlp) -> SolveResult<Self> {
        if mlp.input_dim() != mlp.output_dim() {
            config_bail!(
                "neural ODE needs matching input and output widths, got {} and {}",
                mlp.input_dim(),
                mlp.output_dim()
            );
        }
        let tape = RefCell::new(mlp.tape());
        Ok(Self { mlp, tape })
    }

    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    pub fn init_params(&self) -> Vec<f64> {
        self.mlp.init_params()
    }
}

impl Dynamics for NeuralOde {
    fn dimension(&self) -> usize {
        self.mlp.input_dim()
    }

    fn num_params(&self) -> usize {
        self.mlp.num_params()
    }

    fn eval(&self, _t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        self.mlp.forward(params, x, &mut self.tape.borrow_mut(), out);
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        jacobian_from_vjp(self, t, x, params, out);
    }
}

impl Differentiable for NeuralOde {
    fn vjp(
        &self,
        _t: f64,
        x: &[f64],
        params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    ) {
        let mut tape = self.tape.borrow_mut();
        let mut out = vec![0.0; self.mlp.output_dim()];
        self.mlp.forward(params, x, &mut tape, &mut out);
        self.mlp.backward(params, &mut tape, v, dx, dp);
    }
}

/// `dx/dt = known(x) + MLP(x; θ)`. Only the network weights are trainable;
/// the known part runs with fixed parameters.
pub struct UniversalOde<K> {
    known: K,
    known_params: Vec<f64>,
    mlp: Mlp,
    tape: RefCell<MlpTape>,
}

impl<K: Differentiable> UniversalOde<K> {
    pub fn new(known: K, known_params: Vec<f64>, mlp: Mlp) -> SolveResult<Self> {
        let n = known.dimension();
        if mlp.input_dim() != n || mlp.output_dim() != n {
            config_bail!(
                "network widths {}→{} do not match system dimension {n}",
                mlp.input_dim(),
                mlp.output_dim()
            );
        }
        if known_params.len() != known.num_params() {
            config_bail!(
                "known model expects {} parameters, got {}",
                known.num_params(),
                known_params.len()
            );
        }
        let tape = RefCell::new(mlp.tape());
        Ok(Self {
            known,
            known_params,
            mlp,
            tape,
        })
    }

    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    pub fn init_params(&self) -> Vec<f64> {
        self.mlp.init_params()
    }
}

impl<K: Differentiable> Dynamics for UniversalOde<K> {
    fn dimension(&self) -> usize {
        self.known.dimension()
    }

    fn num_params(&self) -> usize {
        self.mlp.num_params()
    }

    fn eval(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        self.known.eval(t, x, &self.known_params, out);
        let mut learned = vec![0.0; out.len()];
        self.mlp
            .forward(params, x, &mut self.tape.borrow_mut(), &mut learned);
        for (o, l) in out.iter_mut().zip(&learned) {
            *o += l;
        }
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        jacobian_from_vjp(self, t, x, params, out);
    }
}

impl<K: Differentiable> Differentiable for UniversalOde<K> {
    fn vjp(
        &self,
        t: f64,
        x: &[f64],
        params: &[f64],
        v: &[f64],
        dx: &mut [f64],
        dp: &mut [f64],
    ) {
        let mut known_dp = vec![0.0; self.known_params.len()];
        self.known.vjp(t, x, &self.known_params, v, dx, &mut known_dp);
        let mut tape = self.tape.borrow_mut();
        let mut out = vec![0.0; self.mlp.output_dim()];
        self.mlp.forward(params, x, &mut tape, &mut out);
        let mut learned_dx = vec![0.0; dx.len()];
        self.mlp.backward(params, &mut tape, v, &mut learned_dx, dp);
        for (d, l) in dx.iter_mut().zip(&learned_dx) {
            *d += l;
        }
    }
}

/// Builds the Jacobian one row at a time from unit-vector VJPs.
fn jacobian_from_vjp<D: Differentiable + ?Sized>(
    dynamics: &D,
    t: f64,
    x: &[f64],
    params: &[f64],
    out: &mut DMatrix<f64>,
) {
    let n = dynamics.dimension();
    let mut v = vec![0.0; n];
    let mut row = vec![0.0; n];
    let mut dp = vec![0.0; params.len()];
    for i in 0..n {
        v[i] = 1.0;
        dynamics.vjp(t, x, params, &v, &mut row, &mut dp);
        v[i] = 0.0;
        for j in 0..n {
            out[(i, j)] = row[j];
        }
    }
}
