//! Model compilation
//!
//! Turns a declarative [`ModelGraph`] into a hardware-ready artifact. The graph
//! is traced with example inputs first; any shape problem found while tracing
//! is a compilation failure and nothing is written.

use crate::artifact::{
    ArtifactHeader, ArtifactWriter, LayerEntry, TensorDType, ARTIFACT_FORMAT_VERSION,
};
use crate::tensor::{matmul_transposed, Activation, Tensor};
use coreloop_common::{CoreLoopError, Result, WeightDType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// A stack of dense layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGraph {
    pub name: String,
    pub input_width: usize,
    pub layers: Vec<DenseLayer>,
}

/// Fully connected layer with weights stored as `[out][in]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub name: String,
    pub weights: Vec<Vec<f32>>,
    #[serde(default)]
    pub bias: Option<Vec<f32>>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    fn out_features(&self) -> usize {
        self.weights.len()
    }

    fn in_features(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn flat_weights(&self) -> Vec<f32> {
        self.weights.iter().flatten().copied().collect()
    }

    fn flat_bias(&self) -> Vec<f32> {
        self.bias
            .clone()
            .unwrap_or_else(|| vec![0.0; self.out_features()])
    }
}

impl ModelGraph {
    /// Load a graph definition from YAML (or JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreLoopError::compilation(format!("Failed to read graph {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            CoreLoopError::compilation(format!("Failed to parse graph {}: {}", path.display(), e))
        })
    }

    /// Width of the final layer's output
    pub fn output_width(&self) -> usize {
        self.layers.last().map(DenseLayer::out_features).unwrap_or(0)
    }

    /// Check layer shapes chain together and every parameter is finite
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(CoreLoopError::compilation(format!(
                "Graph '{}' has no layers",
                self.name
            )));
        }
        if self.input_width == 0 {
            return Err(CoreLoopError::compilation("input_width must be at least 1"));
        }

        let mut width = self.input_width;
        for layer in &self.layers {
            if layer.out_features() == 0 {
                return Err(CoreLoopError::compilation(format!(
                    "Layer '{}' has no output features",
                    layer.name
                )));
            }
            if let Some(row) = layer.weights.iter().find(|r| r.len() != width) {
                return Err(CoreLoopError::compilation(format!(
                    "Layer '{}' expects {} inputs but receives {}",
                    layer.name,
                    row.len(),
                    width
                )));
            }
            if let Some(bias) = &layer.bias {
                if bias.len() != layer.out_features() {
                    return Err(CoreLoopError::compilation(format!(
                        "Layer '{}' bias has {} elements, expected {}",
                        layer.name,
                        bias.len(),
                        layer.out_features()
                    )));
                }
            }
            let params = layer.weights.iter().flatten().chain(layer.bias.iter().flatten());
            if params.into_iter().any(|v| !v.is_finite()) {
                return Err(CoreLoopError::compilation(format!(
                    "Layer '{}' contains non-finite parameters",
                    layer.name
                )));
            }
            width = layer.out_features();
        }

        Ok(())
    }

    /// Run the graph directly on a `[batch, input_width]` tensor
    pub fn trace(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() != 2 || input.shape()[1] != self.input_width {
            return Err(CoreLoopError::compilation(format!(
                "Example input shape {:?} does not match [batch, {}]",
                input.shape(),
                self.input_width
            )));
        }

        let mut hidden = input.clone();
        for layer in &self.layers {
            let weights = layer.flat_weights();
            let bias = layer.flat_bias();
            let out = matmul_transposed(&hidden.view(), &weights, layer.out_features(), Some(&bias))
                .map_err(|e| {
                    CoreLoopError::compilation(format!("Layer '{}': {}", layer.name, e))
                })?;
            let shape = out.shape().to_vec();
            let mut data = out.into_data();
            layer.activation.apply(&mut data, layer.out_features());
            hidden = Tensor::new(data, shape)?;
        }

        Ok(hidden)
    }
}

/// Every parameter must stay finite once cast to half precision
fn check_f16_range(graph: &ModelGraph) -> Result<()> {
    for layer in &graph.layers {
        let params = layer.weights.iter().flatten().chain(layer.bias.iter().flatten());
        if let Some(v) = params.into_iter().find(|v| !half::f16::from_f32(**v).is_finite()) {
            return Err(CoreLoopError::compilation(format!(
                "Layer '{}' parameter {} overflows f16 (max {})",
                layer.name,
                v,
                half::f16::MAX
            )));
        }
    }
    Ok(())
}

/// Compiler options
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Weight storage precision
    pub weight_dtype: WeightDType,
}

/// Description of a written artifact
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub artifact_id: Uuid,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub input_width: usize,
    pub output_width: usize,
    pub num_layers: usize,
    pub traced_examples: usize,
}

/// Compile `graph` into an artifact at `out_path`
///
/// Every example input is traced through the graph before anything is written.
pub fn compile(
    graph: &ModelGraph,
    example_inputs: &[Tensor],
    options: &CompileOptions,
    out_path: &Path,
) -> Result<ArtifactSummary> {
    let start = Instant::now();
    info!(
        model = %graph.name,
        layers = graph.layers.len(),
        dtype = ?options.weight_dtype,
        "Compiling model"
    );

    graph.validate()?;
    if options.weight_dtype == WeightDType::F16 {
        check_f16_range(graph)?;
    }

    if example_inputs.is_empty() {
        return Err(CoreLoopError::compilation(
            "At least one example input is required for tracing",
        ));
    }

    for (i, example) in example_inputs.iter().enumerate() {
        let output = graph.trace(example)?;
        if output.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(CoreLoopError::compilation(format!(
                "Example input {} produced non-finite outputs",
                i
            )));
        }
        debug!(example = i, output_shape = ?output.shape(), "Traced example input");
    }

    let dtype = TensorDType::from(options.weight_dtype);
    let mut writer = ArtifactWriter::new();
    let layers = graph
        .layers
        .iter()
        .map(|layer| {
            let shape = vec![layer.out_features(), layer.in_features()];
            LayerEntry {
                name: layer.name.clone(),
                activation: layer.activation,
                weights: writer.push_tensor(&layer.flat_weights(), shape, dtype),
                bias: writer.push_tensor(&layer.flat_bias(), vec![layer.out_features()], dtype),
            }
        })
        .collect();

    let header = ArtifactHeader {
        format_version: ARTIFACT_FORMAT_VERSION,
        artifact_id: Uuid::new_v4(),
        model_name: graph.name.clone(),
        input_width: graph.input_width,
        output_width: graph.output_width(),
        layers,
    };

    let size_bytes = writer.write(&header, out_path).map_err(|e| {
        CoreLoopError::compilation(format!(
            "Failed to write artifact {}: {}",
            out_path.display(),
            e
        ))
    })?;

    info!(
        model = %graph.name,
        artifact_id = %header.artifact_id,
        path = %out_path.display(),
        size_bytes,
        elapsed = ?start.elapsed(),
        "Model compiled"
    );

    Ok(ArtifactSummary {
        artifact_id: header.artifact_id,
        path: out_path.to_path_buf(),
        size_bytes,
        input_width: header.input_width,
        output_width: header.output_width,
        num_layers: header.layers.len(),
        traced_examples: example_inputs.len(),
    })
}
