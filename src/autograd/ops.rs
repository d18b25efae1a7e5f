//! Differentiable operations on variables
//!
//! Each operation computes its result eagerly and hands a backward rule to
//! [`Variable::from_op`], which keeps it only when an input requires
//! gradients. This is the whole tensor capability the distances and losses
//! are written against: elementwise arithmetic, matrix products, reductions
//! and gradient-preserving indexing.

use super::function::{Function, FunctionContext};
use super::variable::Variable;
use crate::{
    error::{ForgeError, ForgeResult},
    tensor::Tensor,
};

fn saved<'a>(ctx: &'a FunctionContext, index: usize, op: &str) -> ForgeResult<&'a Tensor> {
    ctx.saved(index)
        .ok_or_else(|| ForgeError::InternalError(format!("{} lost saved tensor {}", op, index)))
}

fn scalar_grad(grad_output: &Tensor) -> ForgeResult<f32> {
    grad_output.item()
}

/// Plain matrix product used by both the forward and backward passes
pub(crate) fn matmul_raw(a: &Tensor, b: &Tensor) -> ForgeResult<Tensor> {
    let (m, k) = a.require_matrix("matmul")?;
    let (k2, n) = b.require_matrix("matmul")?;
    if k != k2 {
        return Err(ForgeError::shape_error(
            &format!("inner dimensions to agree for {} @ {}", a.shape(), b.shape()),
            &format!("{} and {}", k, k2),
            None,
        ));
    }
    let (ad, bd) = (a.data(), b.data());
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let aip = ad[i * k + p];
            if aip == 0.0 {
                continue;
            }
            let row = &bd[p * n..(p + 1) * n];
            for (o, &bv) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                *o += aip * bv;
            }
        }
    }
    Tensor::from_vec(out, &[m, n])
}

fn check_labels(labels: &[usize], rows: usize, cols: usize, operation: &str) -> ForgeResult<()> {
    if labels.len() != rows {
        return Err(ForgeError::shape_error(
            &format!("{} labels for {}", rows, operation),
            &format!("{} labels", labels.len()),
            None,
        ));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y >= cols) {
        return Err(ForgeError::InvalidInput(format!(
            "label {} out of range for {} classes in {}",
            bad, cols, operation
        )));
    }
    Ok(())
}

// ============================================================================
// Backward rules
// ============================================================================

struct AddBackward;

impl Function for AddBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone()), Some(grad_output.clone())])
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

struct SubBackward;

impl Function for SubBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone()), Some(grad_output.map(|g| -g))])
    }

    fn name(&self) -> &'static str {
        "SubBackward"
    }
}

struct MulBackward {
    ctx: FunctionContext,
}

impl Function for MulBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let a = saved(&self.ctx, 0, self.name())?;
        let b = saved(&self.ctx, 1, self.name())?;
        Ok(vec![
            Some(grad_output.zip_map(b, |g, y| g * y)),
            Some(grad_output.zip_map(a, |g, x| g * x)),
        ])
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

struct DivBackward {
    ctx: FunctionContext,
}

impl Function for DivBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let a = saved(&self.ctx, 0, self.name())?;
        let b = saved(&self.ctx, 1, self.name())?;
        let grad_a = grad_output.zip_map(b, |g, y| g / y);
        let quotient = a.zip_map(b, |x, y| x / (y * y));
        let grad_b = grad_output.zip_map(&quotient, |g, q| -g * q);
        Ok(vec![Some(grad_a), Some(grad_b)])
    }

    fn name(&self) -> &'static str {
        "DivBackward"
    }
}

struct AddScalarBackward;

impl Function for AddScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.clone())])
    }

    fn name(&self) -> &'static str {
        "AddScalarBackward"
    }
}

struct MulScalarBackward {
    scalar: f32,
}

impl Function for MulScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let s = self.scalar;
        Ok(vec![Some(grad_output.map(|g| g * s))])
    }

    fn name(&self) -> &'static str {
        "MulScalarBackward"
    }
}

struct SquareBackward {
    input: Tensor,
}

impl Function for SquareBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.zip_map(&self.input, |g, x| 2.0 * x * g))])
    }

    fn name(&self) -> &'static str {
        "SquareBackward"
    }
}

struct SqrtBackward {
    output: Tensor,
}

impl Function for SqrtBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        // sqrt is not differentiable at 0; identical rows get a zero subgradient
        let grad = grad_output.zip_map(&self.output, |g, y| if y > 0.0 { g / (2.0 * y) } else { 0.0 });
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "SqrtBackward"
    }
}

struct ReluBackward {
    input: Tensor,
}

impl Function for ReluBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let grad = grad_output.zip_map(&self.input, |g, x| if x > 0.0 { g } else { 0.0 });
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "ReluBackward"
    }
}

struct ClampBackward {
    input: Tensor,
    min: f32,
    max: f32,
}

impl Function for ClampBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let (lo, hi) = (self.min, self.max);
        let grad = grad_output.zip_map(&self.input, |g, x| if x >= lo && x <= hi { g } else { 0.0 });
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "ClampBackward"
    }
}

struct AcosBackward {
    input: Tensor,
}

impl Function for AcosBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let grad = grad_output.zip_map(&self.input, |g, x| {
            -g / (1.0 - x * x).max(f32::EPSILON).sqrt()
        });
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "AcosBackward"
    }
}

struct CosBackward {
    input: Tensor,
}

impl Function for CosBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.zip_map(&self.input, |g, x| -g * x.sin()))])
    }

    fn name(&self) -> &'static str {
        "CosBackward"
    }
}

struct MatMulBackward {
    ctx: FunctionContext,
}

impl Function for MatMulBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let a = saved(&self.ctx, 0, self.name())?;
        let b = saved(&self.ctx, 1, self.name())?;
        let grad_a = matmul_raw(grad_output, &b.transpose()?)?;
        let grad_b = matmul_raw(&a.transpose()?, grad_output)?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }

    fn name(&self) -> &'static str {
        "MatMulBackward"
    }
}

struct TransposeBackward;

impl Function for TransposeBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.transpose()?)])
    }

    fn name(&self) -> &'static str {
        "TransposeBackward"
    }
}

struct SumBackward {
    input_dims: Vec<usize>,
}

impl Function for SumBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(Tensor::full(&self.input_dims, scalar_grad(grad_output)?))])
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

struct MeanBackward {
    input_dims: Vec<usize>,
    count: usize,
}

impl Function for MeanBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let g = scalar_grad(grad_output)? / self.count as f32;
        Ok(vec![Some(Tensor::full(&self.input_dims, g))])
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

struct SumRowsBackward {
    rows: usize,
    cols: usize,
}

impl Function for SumRowsBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let g = grad_output.data();
        let data = (0..self.rows)
            .flat_map(|i| std::iter::repeat(g[i]).take(self.cols))
            .collect();
        Ok(vec![Some(Tensor::from_vec(data, &[self.rows, self.cols])?)])
    }

    fn name(&self) -> &'static str {
        "SumRowsBackward"
    }
}

struct DivRowsBackward {
    ctx: FunctionContext,
}

impl Function for DivRowsBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let x = saved(&self.ctx, 0, self.name())?;
        let v = saved(&self.ctx, 1, self.name())?;
        let (rows, cols) = x.require_matrix(self.name())?;
        let (g, xd, vd) = (grad_output.data(), x.data(), v.data());

        let mut grad_x = vec![0.0f32; rows * cols];
        let mut grad_v = vec![0.0f32; rows];
        for i in 0..rows {
            let inv = 1.0 / vd[i];
            let mut acc = 0.0f32;
            for j in 0..cols {
                let k = i * cols + j;
                grad_x[k] = g[k] * inv;
                acc += g[k] * xd[k];
            }
            grad_v[i] = -acc * inv * inv;
        }
        Ok(vec![
            Some(Tensor::from_vec(grad_x, &[rows, cols])?),
            Some(Tensor::from_vec(grad_v, &[rows])?),
        ])
    }

    fn name(&self) -> &'static str {
        "DivRowsBackward"
    }
}

struct IndexSelectBackward {
    indices: Vec<usize>,
    input_dims: Vec<usize>,
}

impl Function for IndexSelectBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let mut grad = Tensor::zeros(&self.input_dims);
        let cols = grad.cols();
        let g = grad_output.data();
        let gd = grad.data_mut();
        for (k, &idx) in self.indices.iter().enumerate() {
            for c in 0..cols {
                gd[idx * cols + c] += g[k * cols + c];
            }
        }
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "IndexSelectBackward"
    }
}

struct GatherColsBackward {
    labels: Vec<usize>,
    rows: usize,
    cols: usize,
}

impl Function for GatherColsBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let mut grad = vec![0.0f32; self.rows * self.cols];
        for (i, (&y, &g)) in self.labels.iter().zip(grad_output.data()).enumerate() {
            grad[i * self.cols + y] = g;
        }
        Ok(vec![Some(Tensor::from_vec(grad, &[self.rows, self.cols])?)])
    }

    fn name(&self) -> &'static str {
        "GatherColsBackward"
    }
}

struct ReplaceColsBackward {
    labels: Vec<usize>,
    cols: usize,
}

impl Function for ReplaceColsBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let mut grad_x = grad_output.clone();
        let mut grad_v = Vec::with_capacity(self.labels.len());
        let gx = grad_x.data_mut();
        for (i, &y) in self.labels.iter().enumerate() {
            let k = i * self.cols + y;
            grad_v.push(gx[k]);
            gx[k] = 0.0;
        }
        let len = grad_v.len();
        Ok(vec![Some(grad_x), Some(Tensor::from_vec(grad_v, &[len])?)])
    }

    fn name(&self) -> &'static str {
        "ReplaceColsBackward"
    }
}

struct CatBackward {
    lengths: Vec<usize>,
}

impl Function for CatBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let g = grad_output.data();
        let mut start = 0;
        let mut grads = Vec::with_capacity(self.lengths.len());
        for &len in &self.lengths {
            grads.push(Some(Tensor::from_vec(g[start..start + len].to_vec(), &[len])?));
            start += len;
        }
        Ok(grads)
    }

    fn name(&self) -> &'static str {
        "CatBackward"
    }
}

struct CrossEntropyBackward {
    probs: Tensor,
    labels: Vec<usize>,
}

impl Function for CrossEntropyBackward {
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>> {
        let (rows, cols) = self.probs.require_matrix(self.name())?;
        let scale = scalar_grad(grad_output)? / rows as f32;
        let mut grad = self.probs.map(|p| p * scale);
        let gd = grad.data_mut();
        for (i, &y) in self.labels.iter().enumerate() {
            gd[i * cols + y] -= scale;
        }
        Ok(vec![Some(grad)])
    }

    fn name(&self) -> &'static str {
        "CrossEntropyBackward"
    }
}

// ============================================================================
// Operations
// ============================================================================

impl Variable {
    fn binary_inputs(&self, other: &Variable, operation: &str) -> ForgeResult<(Tensor, Tensor)> {
        let a = self.tensor();
        let b = other.tensor();
        a.require_same_shape(&b, operation)?;
        Ok((a, b))
    }

    /// Element-wise addition
    pub fn add(&self, other: &Variable) -> ForgeResult<Variable> {
        let (a, b) = self.binary_inputs(other, "add")?;
        let out = a.zip_map(&b, |x, y| x + y);
        Ok(Variable::from_op(out, vec![self.clone(), other.clone()], Box::new(AddBackward)))
    }

    /// Element-wise subtraction
    pub fn sub(&self, other: &Variable) -> ForgeResult<Variable> {
        let (a, b) = self.binary_inputs(other, "sub")?;
        let out = a.zip_map(&b, |x, y| x - y);
        Ok(Variable::from_op(out, vec![self.clone(), other.clone()], Box::new(SubBackward)))
    }

    /// Element-wise multiplication
    pub fn mul(&self, other: &Variable) -> ForgeResult<Variable> {
        let (a, b) = self.binary_inputs(other, "mul")?;
        let out = a.zip_map(&b, |x, y| x * y);
        let mut ctx = FunctionContext::new();
        ctx.save_for_backward(&a);
        ctx.save_for_backward(&b);
        Ok(Variable::from_op(out, vec![self.clone(), other.clone()], Box::new(MulBackward { ctx })))
    }

    /// Element-wise division
    pub fn div(&self, other: &Variable) -> ForgeResult<Variable> {
        let (a, b) = self.binary_inputs(other, "div")?;
        let out = a.zip_map(&b, |x, y| x / y);
        let mut ctx = FunctionContext::new();
        ctx.save_for_backward(&a);
        ctx.save_for_backward(&b);
        Ok(Variable::from_op(out, vec![self.clone(), other.clone()], Box::new(DivBackward { ctx })))
    }

    pub fn add_scalar(&self, scalar: f32) -> Variable {
        let out = self.value().map(|x| x + scalar);
        Variable::from_op(out, vec![self.clone()], Box::new(AddScalarBackward))
    }

    pub fn mul_scalar(&self, scalar: f32) -> Variable {
        let out = self.value().map(|x| x * scalar);
        Variable::from_op(out, vec![self.clone()], Box::new(MulScalarBackward { scalar }))
    }

    pub fn square(&self) -> Variable {
        let input = self.tensor();
        let out = input.map(|x| x * x);
        Variable::from_op(out, vec![self.clone()], Box::new(SquareBackward { input }))
    }

    pub fn sqrt(&self) -> Variable {
        let out = self.value().map(f32::sqrt);
        Variable::from_op(out.clone(), vec![self.clone()], Box::new(SqrtBackward { output: out }))
    }

    pub fn relu(&self) -> Variable {
        let input = self.tensor();
        let out = input.map(|x| x.max(0.0));
        Variable::from_op(out, vec![self.clone()], Box::new(ReluBackward { input }))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Variable {
        let input = self.tensor();
        let out = input.map(|x| x.clamp(min, max));
        Variable::from_op(out, vec![self.clone()], Box::new(ClampBackward { input, min, max }))
    }

    pub fn clamp_min(&self, min: f32) -> Variable {
        self.clamp(min, f32::INFINITY)
    }

    /// Element-wise arccos; inputs outside [-1, 1] produce NaN, so callers
    /// clamp first.
    pub fn acos(&self) -> Variable {
        let input = self.tensor();
        let out = input.map(f32::acos);
        Variable::from_op(out, vec![self.clone()], Box::new(AcosBackward { input }))
    }

    pub fn cos(&self) -> Variable {
        let input = self.tensor();
        let out = input.map(f32::cos);
        Variable::from_op(out, vec![self.clone()], Box::new(CosBackward { input }))
    }

    /// Matrix multiplication (for 2D variables)
    pub fn matmul(&self, other: &Variable) -> ForgeResult<Variable> {
        let a = self.tensor();
        let b = other.tensor();
        let out = matmul_raw(&a, &b)?;
        let mut ctx = FunctionContext::new();
        ctx.save_for_backward(&a);
        ctx.save_for_backward(&b);
        Ok(Variable::from_op(out, vec![self.clone(), other.clone()], Box::new(MatMulBackward { ctx })))
    }

    pub fn transpose(&self) -> ForgeResult<Variable> {
        let out = self.value().transpose()?;
        Ok(Variable::from_op(out, vec![self.clone()], Box::new(TransposeBackward)))
    }

    /// Sum of all elements
    pub fn sum(&self) -> Variable {
        let value = self.value();
        let total: f32 = value.data().iter().sum();
        let input_dims = value.dims().to_vec();
        drop(value);
        Variable::from_op(Tensor::scalar(total), vec![self.clone()], Box::new(SumBackward { input_dims }))
    }

    /// Mean of all elements; empty inputs are rejected rather than yielding NaN
    pub fn mean(&self) -> ForgeResult<Variable> {
        let value = self.value();
        let count = value.numel();
        if count == 0 {
            return Err(ForgeError::InvalidInput("mean of an empty tensor".to_string()));
        }
        let total: f32 = value.data().iter().sum();
        let input_dims = value.dims().to_vec();
        drop(value);
        Ok(Variable::from_op(
            Tensor::scalar(total / count as f32),
            vec![self.clone()],
            Box::new(MeanBackward { input_dims, count }),
        ))
    }

    /// Sum over the feature dimension: (N, d) -> (N)
    pub fn sum_rows(&self) -> ForgeResult<Variable> {
        let value = self.value();
        let (rows, cols) = value.require_matrix("sum_rows")?;
        let out: Vec<f32> = (0..rows).map(|i| value.row(i).iter().sum()).collect();
        drop(value);
        Ok(Variable::from_op(
            Tensor::from_vec(out, &[rows])?,
            vec![self.clone()],
            Box::new(SumRowsBackward { rows, cols }),
        ))
    }

    /// Divide every row i of an (N, d) matrix by `divisors[i]`
    pub fn div_rows(&self, divisors: &Variable) -> ForgeResult<Variable> {
        let x = self.tensor();
        let v = divisors.tensor();
        let (rows, cols) = x.require_matrix("div_rows")?;
        if v.dims() != [rows] {
            return Err(ForgeError::shape_error(
                &format!("divisors of shape [{}]", rows),
                &format!("{}", v.shape()),
                None,
            ));
        }
        let mut out = x.clone();
        for (i, chunk) in out.data_mut().chunks_mut(cols.max(1)).enumerate().take(rows) {
            let d = v.data()[i];
            chunk.iter_mut().for_each(|e| *e /= d);
        }
        let mut ctx = FunctionContext::new();
        ctx.save_for_backward(&x);
        ctx.save_for_backward(&v);
        Ok(Variable::from_op(out, vec![self.clone(), divisors.clone()], Box::new(DivRowsBackward { ctx })))
    }

    /// L2-normalize every row, with each norm clamped below by `eps`
    pub fn normalize_rows(&self, eps: f32) -> ForgeResult<Variable> {
        let norms = self.square().sum_rows()?.sqrt().clamp_min(eps);
        self.div_rows(&norms)
    }

    /// Select rows of a matrix (or elements of a vector); indices may repeat
    pub fn index_select(&self, indices: &[usize]) -> ForgeResult<Variable> {
        let value = self.value();
        let rows = value.rows();
        if value.shape().ndim() == 0 || value.shape().ndim() > 2 {
            return Err(ForgeError::shape_error(
                "a vector or matrix for index_select",
                &format!("shape {}", value.shape()),
                None,
            ));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= rows) {
            return Err(ForgeError::InvalidInput(format!(
                "index {} out of range for {} rows",
                bad, rows
            )));
        }
        let cols = value.cols();
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &i in indices {
            data.extend_from_slice(value.row(i));
        }
        let input_dims = value.dims().to_vec();
        let out_dims: Vec<usize> = if input_dims.len() == 2 {
            vec![indices.len(), cols]
        } else {
            vec![indices.len()]
        };
        drop(value);
        Ok(Variable::from_op(
            Tensor::from_vec(data, &out_dims)?,
            vec![self.clone()],
            Box::new(IndexSelectBackward {
                indices: indices.to_vec(),
                input_dims,
            }),
        ))
    }

    /// Pick column `labels[i]` from every row i: (N, C) -> (N)
    pub fn gather_cols(&self, labels: &[usize]) -> ForgeResult<Variable> {
        let value = self.value();
        let (rows, cols) = value.require_matrix("gather_cols")?;
        check_labels(labels, rows, cols, "gather_cols")?;
        let out: Vec<f32> = labels.iter().enumerate().map(|(i, &y)| value.get(i, y)).collect();
        drop(value);
        Ok(Variable::from_op(
            Tensor::from_vec(out, &[rows])?,
            vec![self.clone()],
            Box::new(GatherColsBackward {
                labels: labels.to_vec(),
                rows,
                cols,
            }),
        ))
    }

    /// Overwrite entry (i, labels[i]) with `values[i]`, leaving every other
    /// entry untouched
    pub fn replace_cols(&self, labels: &[usize], values: &Variable) -> ForgeResult<Variable> {
        let mut out = self.tensor();
        let v = values.tensor();
        let (rows, cols) = out.require_matrix("replace_cols")?;
        check_labels(labels, rows, cols, "replace_cols")?;
        if v.dims() != [rows] {
            return Err(ForgeError::shape_error(
                &format!("values of shape [{}]", rows),
                &format!("{}", v.shape()),
                None,
            ));
        }
        let od = out.data_mut();
        for (i, &y) in labels.iter().enumerate() {
            od[i * cols + y] = v.data()[i];
        }
        Ok(Variable::from_op(
            out,
            vec![self.clone(), values.clone()],
            Box::new(ReplaceColsBackward {
                labels: labels.to_vec(),
                cols,
            }),
        ))
    }

    /// Concatenate 1-D variables end to end
    pub fn cat(parts: &[Variable]) -> ForgeResult<Variable> {
        let mut data = Vec::new();
        let mut lengths = Vec::with_capacity(parts.len());
        for part in parts {
            let value = part.value();
            if value.shape().ndim() != 1 {
                return Err(ForgeError::shape_error(
                    "1-D parts for cat",
                    &format!("shape {}", value.shape()),
                    None,
                ));
            }
            lengths.push(value.numel());
            data.extend_from_slice(value.data());
        }
        let len = data.len();
        Ok(Variable::from_op(
            Tensor::from_vec(data, &[len])?,
            parts.to_vec(),
            Box::new(CatBackward { lengths }),
        ))
    }

    /// Mean softmax cross-entropy of (N, C) logits against integer labels
    pub fn cross_entropy(&self, labels: &[usize]) -> ForgeResult<Variable> {
        let logits = self.tensor();
        let (rows, cols) = logits.require_matrix("cross_entropy")?;
        if rows == 0 {
            return Err(ForgeError::InvalidInput("cross_entropy of an empty batch".to_string()));
        }
        check_labels(labels, rows, cols, "cross_entropy")?;

        let mut probs = Vec::with_capacity(rows * cols);
        let mut total = 0.0f32;
        for (i, &y) in labels.iter().enumerate() {
            let row = logits.row(i);
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
            total += log_sum - row[y];
            probs.extend(row.iter().map(|&x| (x - log_sum).exp()));
        }
        let probs = Tensor::from_vec(probs, &[rows, cols])?;
        Ok(Variable::from_op(
            Tensor::scalar(total / rows as f32),
            vec![self.clone()],
            Box::new(CrossEntropyBackward {
                probs,
                labels: labels.to_vec(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(data: Vec<f32>, dims: &[usize]) -> Variable {
        Variable::parameter(Tensor::from_vec(data, dims).unwrap())
    }

    /// Central finite differences of a scalar function of one leaf
    fn numeric_grad(x: &Variable, f: impl Fn(&Variable) -> Variable) -> Vec<f32> {
        let base = x.tensor();
        let h = 1e-2f32;
        (0..base.numel())
            .map(|k| {
                let mut plus = base.clone();
                plus.data_mut()[k] += h;
                let mut minus = base.clone();
                minus.data_mut()[k] -= h;
                let fp = f(&Variable::constant(plus)).item().unwrap();
                let fm = f(&Variable::constant(minus)).item().unwrap();
                (fp - fm) / (2.0 * h)
            })
            .collect()
    }

    fn assert_grad_matches(x: &Variable, f: impl Fn(&Variable) -> Variable) {
        x.zero_grad();
        f(x).backward().unwrap();
        let analytic = x.grad().unwrap();
        let numeric = numeric_grad(x, &f);
        for (a, n) in analytic.data().iter().zip(numeric.iter()) {
            assert!((a - n).abs() < 2e-2, "analytic {} vs numeric {}", a, n);
        }
    }

    #[test]
    fn test_elementwise_forward() {
        let a = param(vec![1.0, 2.0], &[2]);
        let b = param(vec![4.0, 8.0], &[2]);
        assert_eq!(a.add(&b).unwrap().value().data(), &[5.0, 10.0]);
        assert_eq!(a.sub(&b).unwrap().value().data(), &[-3.0, -6.0]);
        assert_eq!(a.mul(&b).unwrap().value().data(), &[4.0, 16.0]);
        assert_eq!(b.div(&a).unwrap().value().data(), &[4.0, 4.0]);
        assert!(a.add(&param(vec![1.0], &[1])).is_err());
    }

    #[test]
    fn test_div_gradient() {
        let b = Variable::constant(Tensor::from_vec(vec![2.0, 4.0], &[2]).unwrap());
        let a = param(vec![1.0, 3.0], &[2]);
        assert_grad_matches(&a, |x| b.div(x).unwrap().sum());
    }

    #[test]
    fn test_matmul_gradient() {
        let w = Variable::constant(Tensor::from_vec(vec![1.0, -2.0, 0.5, 3.0, 1.0, -1.0], &[2, 3]).unwrap());
        let x = param(vec![0.3, -0.7, 1.1, 0.2], &[2, 2]);
        assert_grad_matches(&x, |x| x.matmul(&w).unwrap().square().sum());
    }

    #[test]
    fn test_sqrt_zero_has_zero_gradient() {
        let x = param(vec![0.0, 4.0], &[2]);
        x.sqrt().sum().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.0, 0.25]);
    }

    #[test]
    fn test_clamp_blocks_gradient_outside_range() {
        let x = param(vec![-2.0, 0.5, 2.0], &[3]);
        x.clamp(-1.0, 1.0).sum().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_acos_cos_gradient() {
        let x = param(vec![0.2, -0.4, 0.7], &[3]);
        assert_grad_matches(&x, |x| x.acos().add_scalar(0.3).cos().sum());
    }

    #[test]
    fn test_normalize_rows() {
        let x = param(vec![3.0, 4.0, 0.0, 0.0], &[2, 2]);
        let n = x.normalize_rows(1e-8).unwrap();
        let value = n.tensor();
        assert!((value.get(0, 0) - 0.6).abs() < 1e-6);
        assert!((value.get(0, 1) - 0.8).abs() < 1e-6);
        assert_eq!(value.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_normalize_rows_gradient() {
        let x = param(vec![0.5, -1.0, 2.0, 1.5, 0.3, -0.2], &[2, 3]);
        let target = Variable::constant(Tensor::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.5, 2.0], &[2, 3]).unwrap());
        assert_grad_matches(&x, |x| x.normalize_rows(1e-8).unwrap().mul(&target).unwrap().sum());
    }

    #[test]
    fn test_index_select_scatters_back() {
        let x = param(vec![1.0, 2.0, 3.0], &[3]);
        let picked = x.index_select(&[2, 0, 2]).unwrap();
        assert_eq!(picked.value().data(), &[3.0, 1.0, 3.0]);
        picked.sum().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 0.0, 2.0]);
        assert!(x.index_select(&[3]).is_err());
    }

    #[test]
    fn test_index_select_rows() {
        let x = param(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let picked = x.index_select(&[1, 1]).unwrap();
        assert_eq!(picked.shape().dims, vec![2, 2]);
        assert_eq!(picked.value().data(), &[3.0, 4.0, 3.0, 4.0]);
        let empty = x.index_select(&[]).unwrap();
        assert_eq!(empty.shape().dims, vec![0, 2]);
    }

    #[test]
    fn test_gather_and_replace_cols() {
        let x = param(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let labels = [2, 0];
        let gathered = x.gather_cols(&labels).unwrap();
        assert_eq!(gathered.value().data(), &[3.0, 4.0]);

        let values = param(vec![-1.0, -2.0], &[2]);
        let replaced = x.replace_cols(&labels, &values).unwrap();
        assert_eq!(replaced.value().data(), &[1.0, 2.0, -1.0, -2.0, 5.0, 6.0]);

        replaced.sum().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(values.grad().unwrap().data(), &[1.0, 1.0]);
        assert!(x.gather_cols(&[3, 0]).is_err());
    }

    #[test]
    fn test_cat_splits_gradient() {
        let a = param(vec![1.0, 2.0], &[2]);
        let b = param(vec![3.0], &[1]);
        let joined = Variable::cat(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(joined.value().data(), &[1.0, 2.0, 3.0]);
        joined.square().sum().backward().unwrap();
        assert_eq!(a.grad().unwrap().data(), &[2.0, 4.0]);
        assert_eq!(b.grad().unwrap().data(), &[6.0]);
        assert_eq!(Variable::cat(&[]).unwrap().shape().dims, vec![0]);
    }

    #[test]
    fn test_cross_entropy_value() {
        // uniform logits over 4 classes => ln 4
        let logits = param(vec![0.0; 8], &[2, 4]);
        let loss = logits.cross_entropy(&[1, 3]).unwrap();
        assert!((loss.item().unwrap() - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_gradient() {
        let logits = param(vec![0.2, -1.0, 0.5, 1.5, 0.0, -0.3], &[2, 3]);
        assert_grad_matches(&logits, |x| x.cross_entropy(&[2, 0]).unwrap());
    }

    #[test]
    fn test_mean_of_empty_is_error() {
        let empty = Variable::constant(Tensor::zeros(&[0]));
        assert!(empty.mean().is_err());
        assert_eq!(empty.sum().item().unwrap(), 0.0);
    }
}
