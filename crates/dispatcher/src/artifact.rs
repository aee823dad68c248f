//! Compiled artifact format with memory-mapped loading
//!
//! Layout: `[u64 LE header length][JSON header][raw tensor bytes]`. Tensor
//! offsets in the header are relative to the start of the data region.

use coreloop_common::{CoreLoopError, Result, WeightDType};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::tensor::Activation;

/// Version written by [`ArtifactWriter`] and accepted by [`ArtifactBuffer`]
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Element type of a stored tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TensorDType {
    F32,
    F16,
}

impl TensorDType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            TensorDType::F32 => 4,
            TensorDType::F16 => 2,
        }
    }
}

impl From<WeightDType> for TensorDType {
    fn from(dtype: WeightDType) -> Self {
        match dtype {
            WeightDType::F32 => TensorDType::F32,
            WeightDType::F16 => TensorDType::F16,
        }
    }
}

/// Location of one tensor inside the data region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub dtype: TensorDType,
    pub shape: Vec<usize>,
    /// Byte range `[start, end)` in the data region
    pub data_offsets: [usize; 2],
}

impl TensorEntry {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }
}

/// One compiled dense layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub name: String,
    pub activation: Activation,
    /// `[out, in]`
    pub weights: TensorEntry,
    /// `[out]`
    pub bias: TensorEntry,
}

/// Artifact metadata header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format_version: u32,
    pub artifact_id: Uuid,
    pub model_name: String,
    pub input_width: usize,
    pub output_width: usize,
    pub layers: Vec<LayerEntry>,
}

/// Accumulates tensor bytes and writes a finished artifact
#[derive(Debug, Default)]
pub struct ArtifactWriter {
    data: Vec<u8>,
}

impl ArtifactWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tensor, converting to `dtype`, and return its header entry
    pub fn push_tensor(&mut self, values: &[f32], shape: Vec<usize>, dtype: TensorDType) -> TensorEntry {
        let start = self.data.len();
        match dtype {
            TensorDType::F32 => {
                for v in values {
                    self.data.extend_from_slice(&v.to_le_bytes());
                }
            }
            TensorDType::F16 => {
                for v in values {
                    self.data
                        .extend_from_slice(&half::f16::from_f32(*v).to_bits().to_le_bytes());
                }
            }
        }

        TensorEntry {
            dtype,
            shape,
            data_offsets: [start, self.data.len()],
        }
    }

    /// Write the artifact to `path`, replacing any existing file atomically
    pub fn write(self, header: &ArtifactHeader, path: &Path) -> Result<u64> {
        let header_json = serde_json::to_vec(header)?;
        let tmp_path = temp_path_for(path);

        let write_result = (|| -> Result<u64> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&(header_json.len() as u64).to_le_bytes())?;
            file.write_all(&header_json)?;
            file.write_all(&self.data)?;
            file.sync_all()?;
            Ok(8 + header_json.len() as u64 + self.data.len() as u64)
        })();

        match write_result {
            Ok(size) => {
                fs::rename(&tmp_path, path)?;
                debug!(path = %path.display(), size, "Artifact written");
                Ok(size)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

/// Memory-mapped artifact
///
/// The header is parsed and every tensor range is bounds-checked on open, so
/// later reads cannot run past the mapping.
pub struct ArtifactBuffer {
    mmap: Mmap,
    header: ArtifactHeader,
    data_start: usize,
}

impl ArtifactBuffer {
    /// Open and validate an artifact file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| {
            CoreLoopError::artifact(format!("Failed to open artifact {}: {}", path.display(), e))
        })?;

        let file_len = file.metadata()?.len();
        if file_len < 8 {
            return Err(CoreLoopError::artifact(format!(
                "Artifact {} is too small to contain a header",
                path.display()
            )));
        }

        // SAFETY: the mapping is read-only and artifacts are replaced by rename,
        // never rewritten in place.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                CoreLoopError::artifact(format!("Failed to mmap artifact {}: {}", path.display(), e))
            })?
        };

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;

        let data_start = 8usize
            .checked_add(header_len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                CoreLoopError::artifact("Artifact truncated: header length exceeds file size")
            })?;

        let header: ArtifactHeader = serde_json::from_slice(&mmap[8..data_start])
            .map_err(|e| CoreLoopError::artifact(format!("Failed to parse artifact header: {}", e)))?;

        if header.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(CoreLoopError::artifact(format!(
                "Unsupported artifact format version {} (expected {})",
                header.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }

        let buffer = Self {
            mmap,
            header,
            data_start,
        };
        buffer.check_entries()?;
        Ok(buffer)
    }

    fn check_entries(&self) -> Result<()> {
        let data_len = self.mmap.len() - self.data_start;
        for layer in &self.header.layers {
            for entry in [&layer.weights, &layer.bias] {
                let [start, end] = entry.data_offsets;
                if start > end || end > data_len || end - start != entry.size_bytes() {
                    return Err(CoreLoopError::artifact(format!(
                        "Tensor range {:?} of layer '{}' is invalid for shape {:?}",
                        entry.data_offsets, layer.name, entry.shape
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get the header
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Total mapped size in bytes
    pub fn size_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// Decode a tensor into `f32` values
    pub fn read_f32(&self, entry: &TensorEntry) -> Vec<f32> {
        let [start, end] = entry.data_offsets;
        let bytes = &self.mmap[self.data_start + start..self.data_start + end];

        match entry.dtype {
            TensorDType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            TensorDType::F16 => bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn single_layer_header(writer: &mut ArtifactWriter, dtype: TensorDType) -> ArtifactHeader {
        let weights = writer.push_tensor(&[1.0, 2.0, 3.0, 4.0], vec![2, 2], dtype);
        let bias = writer.push_tensor(&[0.5, -0.5], vec![2], dtype);
        ArtifactHeader {
            format_version: ARTIFACT_FORMAT_VERSION,
            artifact_id: Uuid::new_v4(),
            model_name: "tiny".to_string(),
            input_width: 2,
            output_width: 2,
            layers: vec![LayerEntry {
                name: "fc".to_string(),
                activation: Activation::Relu,
                weights,
                bias,
            }],
        }
    }

    #[test]
    fn test_artifact_write_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.artifact");

        let mut writer = ArtifactWriter::new();
        let header = single_layer_header(&mut writer, TensorDType::F32);
        writer.write(&header, &path).unwrap();

        let buffer = ArtifactBuffer::open(&path).unwrap();
        assert_eq!(buffer.header(), &header);

        let layer = &buffer.header().layers[0];
        assert_eq!(buffer.read_f32(&layer.weights), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.read_f32(&layer.bias), vec![0.5, -0.5]);
        assert!(!dir.path().join(".tiny.artifact.tmp").exists());
    }

    #[test]
    fn test_artifact_f16_storage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny16.artifact");

        let mut writer = ArtifactWriter::new();
        let header = single_layer_header(&mut writer, TensorDType::F16);
        assert_eq!(header.layers[0].weights.size_bytes(), 8);
        writer.write(&header, &path).unwrap();

        let buffer = ArtifactBuffer::open(&path).unwrap();
        let weights = buffer.read_f32(&buffer.header().layers[0].weights);
        assert_eq!(weights, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_artifact_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.artifact");

        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(ArtifactBuffer::open(&path).is_err());

        let mut bytes = 1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            ArtifactBuffer::open(&path),
            Err(CoreLoopError::Artifact(_))
        ));
    }

    #[test]
    fn test_artifact_rejects_out_of_range_tensor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("range.artifact");

        let mut writer = ArtifactWriter::new();
        let mut header = single_layer_header(&mut writer, TensorDType::F32);
        header.layers[0].bias.data_offsets = [16, 64];
        writer.write(&header, &path).unwrap();

        assert!(ArtifactBuffer::open(&path).is_err());
    }

    #[test]
    fn test_artifact_missing_file() {
        assert!(ArtifactBuffer::open("/nonexistent/model.artifact").is_err());
    }
}
