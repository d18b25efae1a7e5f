//! Function trait for automatic differentiation

use crate::{error::ForgeResult, tensor::Tensor};

/// Backward rule of a recorded operation.
///
/// `backward` receives the gradient of the loss with respect to the
/// operation's output and returns one entry per parent, in the order the
/// parents were recorded. `None` means the parent receives no gradient
/// from this operation (e.g. integer index inputs).
pub trait Function: Send + Sync {
    /// Backward pass - compute gradients with respect to inputs
    fn backward(&self, grad_output: &Tensor) -> ForgeResult<Vec<Option<Tensor>>>;

    /// Get function name for debugging
    fn name(&self) -> &'static str;
}

/// Tensors an operation keeps alive for its backward rule
#[derive(Debug, Clone, Default)]
pub struct FunctionContext {
    saved_tensors: Vec<Tensor>,
}

impl FunctionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save tensor for backward pass
    pub fn save_for_backward(&mut self, tensor: &Tensor) {
        self.saved_tensors.push(tensor.clone());
    }

    /// Get saved tensor by position
    pub fn saved(&self, index: usize) -> Option<&Tensor> {
        self.saved_tensors.get(index)
    }

    pub fn len(&self) -> usize {
        self.saved_tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved_tensors.is_empty()
    }
}
