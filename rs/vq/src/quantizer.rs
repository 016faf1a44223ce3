use anyhow::{anyhow, Result};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

use crate::rotation;

// Mass redistributed across the codebook so no effective cluster size can
// reach zero between updates.
pub const LAPLACE_EPS: f32 = 1e-5;
const PERPLEXITY_EPS: f32 = 1e-10;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VectorQuantizerConfig {
    pub num_codes: usize,
    pub dim: usize,
    pub commitment_cost: f32,
    pub use_rotation: bool,
    pub ema_decay: f32,
}

impl VectorQuantizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_codes == 0 {
            return Err(anyhow!("Codebook must contain at least one code"));
        }
        if self.dim == 0 {
            return Err(anyhow!("Code dimension must be at least 1"));
        }
        if self.commitment_cost < 0.0 {
            return Err(anyhow!(
                "Commitment cost {} must be non-negative",
                self.commitment_cost
            ));
        }
        if self.ema_decay < 0.0 || self.ema_decay >= 1.0 {
            return Err(anyhow!(
                "EMA decay {} must be within [0, 1)",
                self.ema_decay
            ));
        }
        Ok(())
    }

    /// A zero decay means the codebook is left to an external optimizer and
    /// the moving-average accumulators are never touched.
    pub fn uses_ema(&self) -> bool {
        self.ema_decay > 0.0
    }
}

/// Result of quantizing one batch.
pub struct ForwardOutput {
    pub output: Array2<f32>,
    pub loss: f32,
    pub perplexity: f32,
    pub indices: Vec<usize>,
}

/// Quantizes continuous vectors against a learned codebook. Instead of
/// substituting the nearest code directly, the rotation mode reflects each
/// input onto its code's direction, which keeps the output a smooth function
/// of the input.
///
/// Training loops that backpropagate through this layer should treat the
/// output as having identity gradient with respect to the input
/// (straight-through), and split the loss so the codebook term sees the
/// output as constant while the commitment term sees the input as constant.
pub struct VectorQuantizer {
    config: VectorQuantizerConfig,
    codebook: Array2<f32>,
    ema_cluster_size: Array1<f32>,
    ema_weight_sum: Array2<f32>,
    training: bool,
}

impl VectorQuantizer {
    /// Create a quantizer with a uniformly initialized codebook. Codes start
    /// in [-1/K, 1/K] per coordinate so the initial quantization error stays
    /// small relative to typical encoder output scale.
    pub fn new(config: VectorQuantizerConfig) -> Result<Self> {
        config.validate()?;

        let bound = 1.0 / config.num_codes as f32;
        let codebook = Array2::random(
            (config.num_codes, config.dim),
            Uniform::new(-bound, bound),
        );
        let ema_cluster_size = Array1::zeros(config.num_codes);
        let ema_weight_sum = codebook.clone();

        Ok(Self {
            config,
            codebook,
            ema_cluster_size,
            ema_weight_sum,
            training: true,
        })
    }

    /// Rebuild a quantizer from previously saved state. The codebook and the
    /// two accumulators are only consistent as a unit, so all three are
    /// required.
    pub fn with_state(
        config: VectorQuantizerConfig,
        codebook: Array2<f32>,
        ema_cluster_size: Array1<f32>,
        ema_weight_sum: Array2<f32>,
    ) -> Result<Self> {
        config.validate()?;

        let expected = (config.num_codes, config.dim);
        if codebook.dim() != expected {
            return Err(anyhow!(
                "Codebook shape {:?} does not match configured {:?}",
                codebook.dim(),
                expected
            ));
        }
        if ema_cluster_size.len() != config.num_codes {
            return Err(anyhow!(
                "Cluster size accumulator has {} entries, expected {}",
                ema_cluster_size.len(),
                config.num_codes
            ));
        }
        if ema_weight_sum.dim() != expected {
            return Err(anyhow!(
                "Weight accumulator shape {:?} does not match configured {:?}",
                ema_weight_sum.dim(),
                expected
            ));
        }

        Ok(Self {
            config,
            codebook,
            ema_cluster_size,
            ema_weight_sum,
            training: true,
        })
    }

    pub fn config(&self) -> &VectorQuantizerConfig {
        &self.config
    }

    pub fn codebook(&self) -> ArrayView2<f32> {
        self.codebook.view()
    }

    pub fn ema_cluster_size(&self) -> ArrayView1<f32> {
        self.ema_cluster_size.view()
    }

    pub fn ema_weight_sum(&self) -> ArrayView2<f32> {
        self.ema_weight_sum.view()
    }

    /// Training mode gates the codebook update and nothing else.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Quantize a batch of row vectors. Returns the surrogate output with
    /// the same shape as the input, the commitment loss, the batch
    /// perplexity, and the chosen code index per row.
    pub fn forward(&mut self, z_e: ArrayView2<f32>) -> Result<ForwardOutput> {
        let num_vectors = z_e.nrows();
        if num_vectors == 0 {
            return Err(anyhow!("Input batch is empty"));
        }
        if z_e.ncols() != self.config.dim {
            return Err(anyhow!(
                "Input dimension {} does not match quantizer dimension {}",
                z_e.ncols(),
                self.config.dim
            ));
        }

        let indices = self.nearest_codes(z_e);
        let quantized = self.codebook.select(Axis(0), &indices);

        let mut encodings = Array2::<f32>::zeros((num_vectors, self.config.num_codes));
        for (i, &index) in indices.iter().enumerate() {
            encodings[[i, index]] = 1.0;
        }

        let output = if self.config.use_rotation {
            rotation::rotate_toward_codes(z_e, quantized.view())
        } else {
            quantized
        };

        // The codebook and commitment terms share one value; a training
        // loop distinguishes them only by which operand it holds constant.
        let codebook_term = mean_squared_error(output.view(), z_e);
        let commitment_term = codebook_term;
        let loss = codebook_term + self.config.commitment_cost * commitment_term;

        // The update must see the assignments made against the codebook the
        // loss was computed from, so it runs last.
        if self.training && self.config.uses_ema() {
            self.apply_ema_update(&encodings, z_e);
        }

        let counts = encodings.sum_axis(Axis(0));
        let perplexity = perplexity_from_counts(counts.view(), num_vectors);
        debug!(
            "Quantized {} vectors, loss {:.6}, perplexity {:.2}",
            num_vectors, loss, perplexity
        );

        Ok(ForwardOutput {
            output,
            loss,
            perplexity,
            indices,
        })
    }

    /// Index of the nearest code per row, using
    /// ||a - b||^2 = ||a||^2 + ||b||^2 - 2 * a.b so the cross terms come
    /// from a single matrix multiply. Ties break to the lowest index.
    fn nearest_codes(&self, z_e: ArrayView2<f32>) -> Vec<usize> {
        let input_sq = z_e.map_axis(Axis(1), |row| row.dot(&row));
        let code_sq = self.codebook.map_axis(Axis(1), |row| row.dot(&row));
        let cross = z_e.dot(&self.codebook.t());

        let mut indices = Vec::with_capacity(z_e.nrows());
        for i in 0..z_e.nrows() {
            let mut best_index = 0;
            let mut best_distance = f32::MAX;
            for k in 0..self.config.num_codes {
                let distance = input_sq[i] + code_sq[k] - 2.0 * cross[[i, k]];
                if distance < best_distance {
                    best_distance = distance;
                    best_index = k;
                }
            }
            indices.push(best_index);
        }
        indices
    }

    fn apply_ema_update(&mut self, encodings: &Array2<f32>, z_e: ArrayView2<f32>) {
        let decay = self.config.ema_decay;

        let counts = encodings.sum_axis(Axis(0));
        self.ema_cluster_size = &self.ema_cluster_size * decay + &counts * (1.0 - decay);

        // Laplace smoothing: redistribute a small mass so unused codes keep
        // a strictly positive effective count.
        let total = self.ema_cluster_size.sum();
        let num_codes = self.config.num_codes as f32;
        self.ema_cluster_size
            .mapv_inplace(|size| (size + LAPLACE_EPS) / (total + num_codes * LAPLACE_EPS) * total);

        let batch_sums = encodings.t().dot(&z_e);
        self.ema_weight_sum = &self.ema_weight_sum * decay + &batch_sums * (1.0 - decay);

        let denominator = self.ema_cluster_size.clone().insert_axis(Axis(1));
        self.codebook = &self.ema_weight_sum / &denominator;
    }
}

fn mean_squared_error(a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    let diff = &a - &b;
    diff.mapv(|value| value * value).mean().unwrap_or(0.0)
}

/// Exponentiated entropy of the batch's code-usage distribution: 1.0 when
/// every vector lands on one code, K when usage is uniform.
fn perplexity_from_counts(counts: ArrayView1<f32>, num_vectors: usize) -> f32 {
    let avg_probs = counts.mapv(|count| count / num_vectors as f32);
    let entropy: f32 = avg_probs
        .iter()
        .map(|&p| p * (p + PERPLEXITY_EPS).ln())
        .sum();
    (-entropy).exp()
}
