//! Metric-learning loss functions
//!
//! Each loss consumes a differentiable (N, d) feature batch plus integer
//! labels and returns a scalar [`Variable`] whose backward pass reaches the
//! features and any matrix the loss owns.

pub mod arcface;
pub mod center;
pub mod contrastive;
pub mod triplet;

pub use arcface::{ArcMarginConfig, ArcMarginLoss};
pub use center::CenterLoss;
pub use contrastive::{ContrastiveLoss, PairBatch};
pub use triplet::{TripletBatch, TripletLoss};

use std::fmt::{self, Display};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
    nn::distance::Distance,
    tensor::Tensor,
};

/// Reduction types for loss functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Mean reduction - average over all kept terms
    #[default]
    Mean,
    /// Sum reduction - sum over all kept terms
    Sum,
}

impl Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Mean => write!(f, "mean"),
            Reduction::Sum => write!(f, "sum"),
        }
    }
}

impl FromStr for Reduction {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            other => Err(ForgeError::unknown_name("reduction", other, &["mean", "sum"])),
        }
    }
}

/// Base trait for all metric-learning losses
pub trait MetricLoss: Send + Sync {
    /// Compute the scalar loss for one batch
    fn forward(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable>;

    /// Get the name of the loss function
    fn name(&self) -> &'static str;

    /// Distance an external nearest-neighbour evaluator should use on the
    /// embeddings this loss trains
    fn test_distance(&self) -> Distance;

    /// Matrices owned by the loss that an optimizer must update
    fn parameters(&self) -> Vec<Variable> {
        Vec::new()
    }
}

/// Reduce per-term losses to a scalar; no terms at all is a zero loss
pub fn apply_reduction(losses: &Variable, reduction: Reduction) -> ForgeResult<Variable> {
    if losses.value().numel() == 0 {
        return Ok(Variable::scalar(0.0));
    }
    match reduction {
        Reduction::Mean => losses.mean(),
        Reduction::Sum => Ok(losses.sum()),
    }
}

/// Xavier-uniform (rows, cols) matrix: U(-b, b) with b = sqrt(6 / (rows + cols))
pub(crate) fn xavier_uniform<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> ForgeResult<Tensor> {
    let bound = (6.0 / (rows + cols) as f32).sqrt();
    let data = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    Tensor::from_vec(data, &[rows, cols])
}

/// Labels must pair up with feature rows
pub(crate) fn check_batch(features: &Variable, labels: &[usize]) -> ForgeResult<(usize, usize)> {
    let (n, d) = features.value().require_matrix("loss features")?;
    if labels.len() != n {
        return Err(ForgeError::shape_error(
            &format!("one label per feature row ({})", n),
            &format!("{} labels", labels.len()),
            None,
        ));
    }
    Ok((n, d))
}
