//! Tensor operations for the CPU backend
//!
//! Dense layers store weights as `[out, in]`, so the forward pass multiplies
//! against the transposed weight matrix. Rows are processed in parallel.

use crate::tensor::{Tensor, TensorView};
use coreloop_common::{CoreLoopError, Result};
use num_traits::Float;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Rows below this count are computed on the calling thread
const PARALLEL_ROW_THRESHOLD: usize = 64;

/// Activation applied after a dense layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    /// Row-wise softmax
    Softmax,
}

impl Activation {
    /// Apply the activation in place to a `[rows, width]` buffer
    pub fn apply<T: Float + Send + Sync>(&self, data: &mut [T], width: usize) {
        match self {
            Activation::Identity => {}
            Activation::Relu => data.iter_mut().for_each(|x| *x = x.max(T::zero())),
            Activation::Sigmoid => data
                .iter_mut()
                .for_each(|x| *x = T::one() / (T::one() + (-*x).exp())),
            Activation::Tanh => data.iter_mut().for_each(|x| *x = x.tanh()),
            Activation::Gelu => {
                // tanh approximation
                let c = T::from(0.797_884_6).unwrap_or_else(T::one);
                let k = T::from(0.044_715).unwrap_or_else(T::zero);
                let half = T::from(0.5).unwrap_or_else(T::one);
                data.iter_mut().for_each(|x| {
                    let v = *x;
                    *x = half * v * (T::one() + (c * (v + k * v * v * v)).tanh());
                });
            }
            Activation::Softmax => {
                if width == 0 {
                    return;
                }
                for row in data.chunks_mut(width) {
                    let max = row.iter().copied().fold(T::neg_infinity(), T::max);
                    let mut sum = T::zero();
                    for x in row.iter_mut() {
                        *x = (*x - max).exp();
                        sum = sum + *x;
                    }
                    for x in row.iter_mut() {
                        *x = *x / sum;
                    }
                }
            }
        }
    }
}

/// Compute `input @ weights^T + bias`
///
/// `input` is `[m, k]`, `weights` is `[n, k]` row-major, `bias` has length `n`.
pub fn matmul_transposed(
    input: &TensorView<'_>,
    weights: &[f32],
    out_features: usize,
    bias: Option<&[f32]>,
) -> Result<Tensor> {
    if input.ndim() != 2 {
        return Err(CoreLoopError::tensor(format!(
            "Dense layer expects a rank-2 input, got shape {:?}",
            input.shape
        )));
    }

    let (m, k) = (input.shape[0], input.shape[1]);
    if weights.len() != out_features * k {
        return Err(CoreLoopError::tensor(format!(
            "Weight matrix has {} elements, expected {} x {}",
            weights.len(),
            out_features,
            k
        )));
    }
    if let Some(bias) = bias {
        if bias.len() != out_features {
            return Err(CoreLoopError::tensor(format!(
                "Bias has {} elements, expected {}",
                bias.len(),
                out_features
            )));
        }
    }

    let mut out = vec![0.0f32; m * out_features];
    let compute_row = |(i, out_row): (usize, &mut [f32])| {
        let x = input.row(i);
        for (j, o) in out_row.iter_mut().enumerate() {
            let w = &weights[j * k..(j + 1) * k];
            let dot: f32 = x.iter().zip(w).map(|(&a, &b)| a * b).sum();
            *o = dot + bias.map_or(0.0, |b| b[j]);
        }
    };

    if out_features > 0 {
        if m >= PARALLEL_ROW_THRESHOLD {
            out.par_chunks_mut(out_features).enumerate().for_each(compute_row);
        } else {
            out.chunks_mut(out_features).enumerate().for_each(compute_row);
        }
    }

    Tensor::new(out, vec![m, out_features])
}
