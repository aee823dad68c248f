//! Tensor data structures
//!
//! Requests and results carry owned, row-major `f32` tensors. Dimension 0 is
//! always the batch dimension, which is what the data-parallel helper splits on.

pub mod ops;

pub use ops::{matmul_transposed, Activation};

use coreloop_common::{CoreLoopError, Result};
use std::fmt;

/// Tensor shape
pub type Shape = Vec<usize>;

/// A borrowed, zero-copy view into tensor data
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    pub data: &'a [f32],
    pub shape: Shape,
}

impl<'a> TensorView<'a> {
    /// Create a new tensor view
    pub fn new(data: &'a [f32], shape: Shape) -> Result<Self> {
        check_len(data.len(), &shape)?;
        Ok(Self { data, shape })
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Row `i` of a rank-2 view
    pub fn row(&self, i: usize) -> &'a [f32] {
        let width = self.shape.last().copied().unwrap_or(0);
        &self.data[i * width..(i + 1) * width]
    }
}

/// Owned tensor with heap-allocated data
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Create a new tensor from data and shape
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self> {
        check_len(data.len(), &shape)?;
        Ok(Self { data, shape })
    }

    /// Create a zero tensor
    pub fn zeros(shape: Shape) -> Self {
        let size: usize = shape.iter().product();
        Self {
            data: vec![0.0; size],
            shape,
        }
    }

    /// Build a rank-2 tensor from equally sized rows
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return Err(CoreLoopError::tensor("All rows must have the same length"));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::new(data, vec![rows.len(), width])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the batch dimension (0 for scalars)
    pub fn batch_len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Get a view of this tensor
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            data: &self.data,
            shape: self.shape.clone(),
        }
    }

    /// Reshape the tensor
    pub fn reshape(mut self, new_shape: Shape) -> Result<Self> {
        check_len(self.len(), &new_shape)?;
        self.shape = new_shape;
        Ok(self)
    }

    /// Split along dimension 0 into chunks of at most `batch_size` rows
    pub fn split_batches(&self, batch_size: usize) -> Result<Vec<Tensor>> {
        if batch_size == 0 {
            return Err(CoreLoopError::invalid_input("batch_size must be at least 1"));
        }
        if self.shape.is_empty() {
            return Err(CoreLoopError::invalid_input(
                "Cannot split a scalar tensor into batches",
            ));
        }

        let rows = self.shape[0];
        let row_len: usize = self.shape[1..].iter().product();
        let mut batches = Vec::with_capacity(rows.div_ceil(batch_size));

        for start in (0..rows).step_by(batch_size) {
            let end = (start + batch_size).min(rows);
            let mut shape = self.shape.clone();
            shape[0] = end - start;
            batches.push(Tensor {
                data: self.data[start * row_len..end * row_len].to_vec(),
                shape,
            });
        }

        Ok(batches)
    }

    /// Concatenate tensors along dimension 0
    ///
    /// All parts must agree on every dimension but the first.
    pub fn concat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| CoreLoopError::tensor("Cannot concatenate zero tensors"))?;
        if first.shape.is_empty() {
            return Err(CoreLoopError::tensor("Cannot concatenate scalar tensors"));
        }

        let tail = &first.shape[1..];
        let mut rows = 0;
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::len).sum());

        for part in parts {
            if part.shape.len() != first.shape.len() || &part.shape[1..] != tail {
                return Err(CoreLoopError::tensor(format!(
                    "Concat shape mismatch: {:?} vs {:?}",
                    part.shape, first.shape
                )));
            }
            rows += part.shape[0];
            data.extend_from_slice(&part.data);
        }

        let mut shape = first.shape.clone();
        shape[0] = rows;
        Ok(Tensor { data, shape })
    }
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(CoreLoopError::tensor(format!(
            "Shape {:?} needs {} elements, got {}",
            shape, expected, len
        )));
    }
    Ok(())
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, size={})", self.shape, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_new_checks_shape() {
        assert!(Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]).is_err());
        let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        assert_eq!(tensor.ndim(), 2);
        assert_eq!(tensor.batch_len(), 2);
        assert_eq!(tensor.view().row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_tensor_reshape() {
        let tensor = Tensor::new(vec![1.0f32, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();

        let reshaped = tensor.clone().reshape(vec![4]).unwrap();
        assert_eq!(reshaped.shape(), &[4]);
        assert!(tensor.reshape(vec![3]).is_err());
    }

    #[test]
    fn test_split_batches_keeps_remainder() {
        let tensor = Tensor::new((0..10).map(|v| v as f32).collect(), vec![5, 2]).unwrap();
        let batches = tensor.split_batches(2).unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].shape(), &[2, 2]);
        assert_eq!(batches[2].shape(), &[1, 2]);
        assert_eq!(batches[2].as_slice(), &[8.0, 9.0]);

        assert_eq!(Tensor::concat(&batches).unwrap(), tensor);
    }

    #[test]
    fn test_split_batches_rejects_zero() {
        let tensor = Tensor::zeros(vec![4, 3]);
        assert!(matches!(
            tensor.split_batches(0),
            Err(CoreLoopError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_concat_shape_mismatch() {
        let a = Tensor::zeros(vec![1, 3]);
        let b = Tensor::zeros(vec![1, 4]);
        assert!(Tensor::concat(&[a, b]).is_err());
        assert!(Tensor::concat(&[]).is_err());
    }

    #[test]
    fn test_from_rows() {
        let tensor = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert!(Tensor::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
