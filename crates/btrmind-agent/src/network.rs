//! Fixed-architecture Q-network on pure ndarray
//!
//! Four features in, three ReLU hidden layers of 128 units, one linear
//! output per action. Weights are stored `(in, out)` so a forward pass is
//! `x.dot(W) + b` per layer.

use btrmind_core::{Action, TrainingError, FEATURE_DIM};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Units per hidden layer
pub const HIDDEN_UNITS: usize = 128;
/// Number of hidden layers
pub const HIDDEN_LAYERS: usize = 3;

/// Layer widths from input to output
fn layer_dims() -> [usize; HIDDEN_LAYERS + 2] {
    [
        FEATURE_DIM,
        HIDDEN_UNITS,
        HIDDEN_UNITS,
        HIDDEN_UNITS,
        Action::COUNT,
    ]
}

/// Multi-layer perceptron estimating one return per action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    /// Weights for each layer
    weights: Vec<Array2<f32>>,
    /// Biases for each layer
    biases: Vec<Array1<f32>>,
}

/// Per-parameter gradients with the same shapes as a [`QNetwork`]
#[derive(Debug, Clone)]
pub struct Gradients {
    weights: Vec<Array2<f32>>,
    biases: Vec<Array1<f32>>,
}

/// Activations kept from a forward pass for backpropagation
struct Trace {
    /// Layer inputs: `inputs[0]` is the feature vector, `inputs[l]` the
    /// post-ReLU output of hidden layer `l - 1`
    inputs: Vec<Array1<f32>>,
    output: Array1<f32>,
}

impl QNetwork {
    /// Create a network with He-initialized weights and zero biases
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let dims = layer_dims();
        let mut weights = Vec::with_capacity(dims.len() - 1);
        let mut biases = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            weights.push(Self::he_init(pair[0], pair[1], rng));
            biases.push(Array1::zeros(pair[1]));
        }
        Self { weights, biases }
    }

    /// He initialization for ReLU layers
    fn he_init<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Array2<f32> {
        let std = (2.0 / in_dim as f32).sqrt();
        Array2::from_shape_fn((in_dim, out_dim), |_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
    }

    /// Estimated return for every action
    #[must_use]
    pub fn q_values(&self, features: &[f64; FEATURE_DIM]) -> [f64; Action::COUNT] {
        let input = Array1::from_iter(features.iter().map(|&v| v as f32));
        let output = self.forward_impl(input).output;
        let mut q = [0.0; Action::COUNT];
        for (slot, value) in q.iter_mut().zip(output.iter()) {
            *slot = f64::from(*value);
        }
        q
    }

    fn forward_impl(&self, input: Array1<f32>) -> Trace {
        let last = self.weights.len() - 1;
        let mut inputs = Vec::with_capacity(self.weights.len());
        let mut hidden = input;
        for layer in 0..last {
            let next = (hidden.dot(&self.weights[layer]) + &self.biases[layer]).mapv(|v| v.max(0.0));
            inputs.push(hidden);
            hidden = next;
        }
        let output = hidden.dot(&self.weights[last]) + &self.biases[last];
        inputs.push(hidden);
        Trace { inputs, output }
    }

    /// Backpropagate `dL/dQ(s, a)` for a single sample into `grads`.
    ///
    /// Only the output of the taken action receives gradient. Returns the
    /// network's estimate `Q(s, a)` from the forward pass.
    pub fn accumulate(
        &self,
        features: &[f64; FEATURE_DIM],
        action: Action,
        output_grad: impl FnOnce(f64) -> f64,
        grads: &mut Gradients,
    ) -> f64 {
        let input = Array1::from_iter(features.iter().map(|&v| v as f32));
        let trace = self.forward_impl(input);
        let q = f64::from(trace.output[action.index()]);

        let mut delta = Array1::<f32>::zeros(Action::COUNT);
        delta[action.index()] = output_grad(q) as f32;

        for layer in (0..self.weights.len()).rev() {
            let input = &trace.inputs[layer];
            let outer = input
                .view()
                .insert_axis(Axis(1))
                .dot(&delta.view().insert_axis(Axis(0)));
            grads.weights[layer] += &outer;
            grads.biases[layer] += &delta;
            if layer > 0 {
                // ReLU derivative taken from the post-activation value
                let back = self.weights[layer].dot(&delta);
                delta = ndarray::Zip::from(&back)
                    .and(input)
                    .map_collect(|&g, &a| if a > 0.0 { g } else { 0.0 });
            }
        }
        q
    }

    /// Plain SGD step
    pub fn apply(&mut self, grads: &Gradients, learning_rate: f32) {
        for (w, g) in self.weights.iter_mut().zip(&grads.weights) {
            w.scaled_add(-learning_rate, g);
        }
        for (b, g) in self.biases.iter_mut().zip(&grads.biases) {
            b.scaled_add(-learning_rate, g);
        }
    }

    /// Whether every parameter is finite
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.weights.iter().all(|w| w.iter().all(|v| v.is_finite()))
            && self.biases.iter().all(|b| b.iter().all(|v| v.is_finite()))
    }

    /// Check that the layer shapes match the fixed architecture
    pub fn validate_shape(&self) -> Result<(), TrainingError> {
        let dims = layer_dims();
        let layers = dims.len() - 1;
        if self.weights.len() != layers || self.biases.len() != layers {
            return Err(TrainingError::DimensionMismatch {
                expected: layers,
                actual: self.weights.len().min(self.biases.len()),
            });
        }
        for (layer, pair) in dims.windows(2).enumerate() {
            let (rows, cols) = self.weights[layer].dim();
            if rows != pair[0] {
                return Err(TrainingError::DimensionMismatch {
                    expected: pair[0],
                    actual: rows,
                });
            }
            if cols != pair[1] || self.biases[layer].len() != pair[1] {
                return Err(TrainingError::DimensionMismatch {
                    expected: pair[1],
                    actual: cols,
                });
            }
        }
        Ok(())
    }

    /// Total number of trainable parameters
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.weights.iter().map(Array2::len).sum::<usize>()
            + self.biases.iter().map(Array1::len).sum::<usize>()
    }
}

impl Gradients {
    /// Zero gradients shaped like `network`
    #[must_use]
    pub fn zeros_like(network: &QNetwork) -> Self {
        Self {
            weights: network
                .weights
                .iter()
                .map(|w| Array2::zeros(w.raw_dim()))
                .collect(),
            biases: network
                .biases
                .iter()
                .map(|b| Array1::zeros(b.raw_dim()))
                .collect(),
        }
    }

    /// L2 norm over every gradient entry
    #[must_use]
    pub fn global_norm(&self) -> f64 {
        let squares: f64 = self
            .weights
            .iter()
            .flat_map(|w| w.iter())
            .chain(self.biases.iter().flat_map(|b| b.iter()))
            .map(|&v| f64::from(v) * f64::from(v))
            .sum();
        squares.sqrt()
    }

    /// Rescale so the global norm does not exceed `max_norm`. Returns the norm before clipping.
    pub fn clip(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            let scale = (max_norm / norm) as f32;
            for w in &mut self.weights {
                w.mapv_inplace(|v| v * scale);
            }
            for b in &mut self.biases {
                b.mapv_inplace(|v| v * scale);
            }
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn network() -> QNetwork {
        QNetwork::new(&mut StdRng::seed_from_u64(42))
    }

    #[test]
    fn test_architecture() {
        let net = network();
        assert!(net.validate_shape().is_ok());
        let expected = (4 * 128 + 128) + 2 * (128 * 128 + 128) + (128 * 5 + 5);
        assert_eq!(net.parameter_count(), expected);
        assert!(net.is_finite());
    }

    #[test]
    fn test_deterministic_forward() {
        let net = network();
        let features = [0.9, 0.1, -0.2, 0.05];
        assert_eq!(net.q_values(&features), net.q_values(&features));
        assert_eq!(net, network());
    }

    #[test]
    fn test_gradient_step_moves_toward_target() {
        let mut net = network();
        let features = [0.95, 0.3, -0.1, 0.02];
        let target = 2.0;
        let before = net.q_values(&features)[Action::PruneSnapshots.index()];
        for _ in 0..100 {
            let mut grads = Gradients::zeros_like(&net);
            net.accumulate(&features, Action::PruneSnapshots, |q| q - target, &mut grads);
            grads.clip(10.0);
            net.apply(&grads, 0.005);
        }
        let after = net.q_values(&features)[Action::PruneSnapshots.index()];
        assert!((after - target).abs() < (before - target).abs());
    }

    #[test]
    fn test_clip_bounds_norm() {
        let net = network();
        let mut grads = Gradients::zeros_like(&net);
        net.accumulate(&[1.0, 1.0, 1.0, 1.0], Action::NoOp, |_| 1.0e4, &mut grads);
        let before = grads.clip(1.0);
        assert!(before > 1.0);
        assert!(grads.global_norm() <= 1.0 + 1e-4);
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let mut net = network();
        net.weights.pop();
        assert!(matches!(
            net.validate_shape(),
            Err(TrainingError::DimensionMismatch { .. })
        ));
    }
}
