//! Reference CPU backend
//!
//! Executes compiled artifacts on the host. The core id is recorded on the
//! replica for routing and logging; threads are not pinned.

use crate::artifact::{ArtifactBuffer, ArtifactHeader};
use crate::backend::{ModelLoader, ModelReplica};
use crate::tensor::{matmul_transposed, Activation, Tensor};
use coreloop_common::{CoreLoopError, Result};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Decoded dense layer
struct CompiledLayer {
    name: String,
    weights: Vec<f32>,
    bias: Vec<f32>,
    out_features: usize,
    activation: Activation,
}

/// A model replica executing on one logical core
pub struct CpuReplica {
    core_id: usize,
    model_name: String,
    input_width: usize,
    layers: Vec<CompiledLayer>,
}

impl CpuReplica {
    /// Load an artifact for `core_id`
    pub fn load(artifact_path: &Path, core_id: usize) -> Result<Self> {
        let start = Instant::now();
        let buffer = ArtifactBuffer::open(artifact_path).map_err(|e| {
            CoreLoopError::load(format!("core {}: {}", core_id, e))
        })?;
        let header = buffer.header();

        check_layer_chain(header).map_err(|reason| {
            CoreLoopError::load(format!(
                "core {}: artifact {} is inconsistent: {}",
                core_id,
                artifact_path.display(),
                reason
            ))
        })?;

        let layers = header
            .layers
            .iter()
            .map(|entry| CompiledLayer {
                name: entry.name.clone(),
                weights: buffer.read_f32(&entry.weights),
                bias: buffer.read_f32(&entry.bias),
                out_features: entry.weights.shape[0],
                activation: entry.activation,
            })
            .collect();

        info!(
            core_id,
            model = %header.model_name,
            artifact_id = %header.artifact_id,
            size_bytes = buffer.size_bytes(),
            elapsed = ?start.elapsed(),
            "Model replica loaded"
        );

        Ok(Self {
            core_id,
            model_name: header.model_name.clone(),
            input_width: header.input_width,
            layers,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }
}

impl ModelReplica for CpuReplica {
    fn core_id(&self) -> usize {
        self.core_id
    }

    fn infer(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let input = match inputs {
            [input] => input,
            _ => {
                return Err(CoreLoopError::inference(format!(
                    "{} expects exactly one input tensor, got {}",
                    self.model_name,
                    inputs.len()
                )))
            }
        };

        if input.ndim() != 2 || input.shape()[1] != self.input_width {
            return Err(CoreLoopError::inference(format!(
                "{} expects input shape [batch, {}], got {:?}",
                self.model_name,
                self.input_width,
                input.shape()
            )));
        }

        debug!(core_id = self.core_id, batch = input.batch_len(), "Running forward pass");

        let mut hidden = input.clone();
        for layer in &self.layers {
            trace!(core_id = self.core_id, layer = %layer.name, "Forwarding through layer");
            let out = matmul_transposed(
                &hidden.view(),
                &layer.weights,
                layer.out_features,
                Some(&layer.bias),
            )
            .map_err(|e| CoreLoopError::inference(format!("layer '{}': {}", layer.name, e)))?;

            let shape = out.shape().to_vec();
            let mut data = out.into_data();
            layer.activation.apply(&mut data, layer.out_features);
            hidden = Tensor::new(data, shape)?;
        }

        Ok(vec![hidden])
    }
}

/// Layer shapes must chain from `input_width` to `output_width`
fn check_layer_chain(header: &ArtifactHeader) -> std::result::Result<(), String> {
    if header.layers.is_empty() {
        return Err("no layers".to_string());
    }

    let mut width = header.input_width;
    for layer in &header.layers {
        let (out, inp) = match layer.weights.shape.as_slice() {
            [out, inp] => (*out, *inp),
            shape => {
                return Err(format!(
                    "layer '{}' weights have shape {:?}, expected [out, in]",
                    layer.name, shape
                ))
            }
        };
        if inp != width {
            return Err(format!(
                "layer '{}' expects {} inputs but receives {}",
                layer.name, inp, width
            ));
        }
        if out == 0 {
            return Err(format!("layer '{}' has no output features", layer.name));
        }
        if layer.bias.shape != [out] {
            return Err(format!(
                "layer '{}' bias has shape {:?}, expected [{}]",
                layer.name, layer.bias.shape, out
            ));
        }
        width = out;
    }

    if width != header.output_width {
        return Err(format!(
            "last layer produces {} outputs, header declares {}",
            width, header.output_width
        ));
    }
    Ok(())
}

/// Loader for [`CpuReplica`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuLoader;

impl ModelLoader for CpuLoader {
    fn load(&self, artifact_path: &Path, core_id: usize) -> Result<Box<dyn ModelReplica>> {
        Ok(Box::new(CpuReplica::load(artifact_path, core_id)?))
    }
}
