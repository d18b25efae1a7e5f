//! Core tensor types and fundamental operations

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};

/// Runtime shape of a dense tensor (0-D scalar, 1-D vector or 2-D matrix)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Dense row-major `f32` tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Create from a vector, checking the element count against the shape
    pub fn from_vec(data: Vec<f32>, dims: &[usize]) -> ForgeResult<Self> {
        let shape = Shape::new(dims);
        if data.len() != shape.total_elements() {
            return Err(ForgeError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self { data, shape })
    }

    /// Build an (N, d) matrix from equal-length rows
    pub fn from_rows(rows: &[Vec<f32>]) -> ForgeResult<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(ForgeError::shape_error(
                &format!("rows of length {}", cols),
                &format!("a row of length {}", bad.len()),
                None,
            ));
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::from_vec(data, &[rows.len(), cols])
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            data: vec![value],
            shape: Shape::scalar(),
        }
    }

    pub fn full(dims: &[usize], value: f32) -> Self {
        let shape = Shape::new(dims);
        Self {
            data: vec![value; shape.total_elements()],
            shape,
        }
    }

    pub fn zeros(dims: &[usize]) -> Self {
        Self::full(dims, 0.0)
    }

    pub fn ones(dims: &[usize]) -> Self {
        Self::full(dims, 1.0)
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.shape.as_slice())
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.as_slice()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Number of rows: first dimension, or 1 for a scalar
    pub fn rows(&self) -> usize {
        self.shape.dims.first().copied().unwrap_or(1)
    }

    /// Number of columns of a matrix, 1 for vectors and scalars
    pub fn cols(&self) -> usize {
        if self.shape.ndim() >= 2 {
            self.shape.dims[1..].iter().product()
        } else {
            1
        }
    }

    /// Borrow row `i` of a matrix (a single element for a vector)
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.cols() + j]
    }

    /// Value of a one-element tensor
    pub fn item(&self) -> ForgeResult<f32> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(ForgeError::shape_error(
                "a single element",
                &format!("shape {}", self.shape),
                Some("reduce the tensor with sum() or mean() first"),
            )),
        }
    }

    pub fn require_matrix(&self, operation: &str) -> ForgeResult<(usize, usize)> {
        if self.shape.ndim() != 2 {
            return Err(ForgeError::shape_error(
                &format!("a 2-D matrix for {}", operation),
                &format!("shape {}", self.shape),
                None,
            ));
        }
        Ok((self.shape.dims[0], self.shape.dims[1]))
    }

    pub fn require_same_shape(&self, other: &Tensor, operation: &str) -> ForgeResult<()> {
        if self.shape != other.shape {
            return Err(ForgeError::shape_error(
                &format!("matching shapes for {} ({})", operation, self.shape),
                &format!("{}", other.shape),
                None,
            ));
        }
        Ok(())
    }

    pub fn transpose(&self) -> ForgeResult<Tensor> {
        let (rows, cols) = self.require_matrix("transpose")?;
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::from_vec(data, &[cols, rows])
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
        Tensor {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        }
    }

    /// In-place `self += other` for gradient accumulation
    pub fn add_assign(&mut self, other: &Tensor) -> ForgeResult<()> {
        self.require_same_shape(other, "accumulate")?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Elementwise comparison within an absolute tolerance
    pub fn allclose(&self, other: &Tensor, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{}{:?}", self.shape, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_creation() {
        let shape = Shape::new(&[2, 3]);
        assert_eq!(shape.total_elements(), 6);
        assert_eq!(shape.to_string(), "[2, 3]");
        assert!(Shape::scalar().is_scalar());
        assert_eq!(Shape::scalar().total_elements(), 1);
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).is_err());
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        assert_eq!(t.rows(), 2);
        assert_eq!(t.cols(), 2);
        assert_eq!(t.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let ragged = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(Tensor::from_rows(&ragged), Err(ForgeError::ShapeError(_))));
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let tt = t.transpose().unwrap();
        assert_eq!(tt.dims(), &[3, 2]);
        assert_eq!(tt.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_item() {
        assert_eq!(Tensor::scalar(2.5).item().unwrap(), 2.5);
        assert!(Tensor::zeros(&[3]).item().is_err());
    }
}
