//! Variable wrapper for tensors in the computation graph

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use super::function::Function;
use super::graph::{ComputationGraph, NodeId};
use super::is_grad_enabled;
use crate::{
    error::{ForgeError, ForgeResult},
    tensor::{Shape, Tensor},
};

fn next_node_id() -> NodeId {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) data: RwLock<Tensor>,
    pub(crate) grad: Mutex<Option<Tensor>>,
    pub(crate) requires_grad: bool,
    pub(crate) grad_fn: Option<Box<dyn Function>>,
    pub(crate) parents: Vec<Variable>,
}

/// A tensor that participates in automatic differentiation.
///
/// Cloning is cheap and shares the node: gradients accumulated through one
/// handle are visible through every clone.
#[derive(Clone)]
pub struct Variable {
    pub(crate) node: Arc<Node>,
}

impl Variable {
    /// Create a leaf variable
    pub fn new(tensor: Tensor, requires_grad: bool) -> Self {
        Self {
            node: Arc::new(Node {
                id: next_node_id(),
                data: RwLock::new(tensor),
                grad: Mutex::new(None),
                requires_grad,
                grad_fn: None,
                parents: Vec::new(),
            }),
        }
    }

    /// Leaf that accumulates gradients (model inputs, learned matrices)
    pub fn parameter(tensor: Tensor) -> Self {
        Self::new(tensor, true)
    }

    /// Leaf that never receives gradients
    pub fn constant(tensor: Tensor) -> Self {
        Self::new(tensor, false)
    }

    pub fn scalar(value: f32) -> Self {
        Self::constant(Tensor::scalar(value))
    }

    /// Result of a recorded operation.
    ///
    /// The backward rule is kept only when gradient tracking is enabled and
    /// at least one parent requires gradients; otherwise the result is a
    /// plain constant and the parents are released.
    pub(crate) fn from_op(tensor: Tensor, parents: Vec<Variable>, grad_fn: Box<dyn Function>) -> Self {
        let requires_grad = is_grad_enabled() && parents.iter().any(|p| p.requires_grad());
        if !requires_grad {
            return Self::constant(tensor);
        }
        Self {
            node: Arc::new(Node {
                id: next_node_id(),
                data: RwLock::new(tensor),
                grad: Mutex::new(None),
                requires_grad: true,
                grad_fn: Some(grad_fn),
                parents,
            }),
        }
    }

    /// Get node ID in computation graph
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Check if variable requires gradients
    pub fn requires_grad(&self) -> bool {
        self.node.requires_grad
    }

    /// Check if variable is a leaf node
    pub fn is_leaf(&self) -> bool {
        self.node.grad_fn.is_none()
    }

    /// Read access to the current value
    pub fn value(&self) -> RwLockReadGuard<'_, Tensor> {
        self.node.data.read()
    }

    /// Owned copy of the current value
    pub fn tensor(&self) -> Tensor {
        self.node.data.read().clone()
    }

    pub fn shape(&self) -> Shape {
        self.node.data.read().shape().clone()
    }

    /// Value of a one-element variable
    pub fn item(&self) -> ForgeResult<f32> {
        self.node.data.read().item()
    }

    /// Replace the value of a leaf, as an optimizer step does between calls.
    pub fn set_data(&self, tensor: Tensor) -> ForgeResult<()> {
        if !self.is_leaf() {
            return Err(ForgeError::InvalidInput(
                "only leaf variables can be updated in place".to_string(),
            ));
        }
        let mut data = self.node.data.write();
        data.require_same_shape(&tensor, "set_data")?;
        *data = tensor;
        Ok(())
    }

    /// Get accumulated gradient if available
    pub fn grad(&self) -> Option<Tensor> {
        self.node.grad.lock().clone()
    }

    /// Zero gradients
    pub fn zero_grad(&self) {
        *self.node.grad.lock() = None;
    }

    pub(crate) fn accumulate_grad(&self, grad: &Tensor) -> ForgeResult<()> {
        let mut slot = self.node.grad.lock();
        match slot.as_mut() {
            Some(existing) => existing.add_assign(grad),
            None => {
                *slot = Some(grad.clone());
                Ok(())
            }
        }
    }

    /// Detach variable from computation graph
    pub fn detach(&self) -> Self {
        Self::constant(self.tensor())
    }

    /// Back-propagate from this scalar through the recorded graph.
    ///
    /// Gradients accumulate into every leaf that requires them; call
    /// `zero_grad` on parameters between steps.
    pub fn backward(&self) -> ForgeResult<()> {
        ComputationGraph::from_root(self)?.backward()
    }

    pub(crate) fn parents(&self) -> &[Variable] {
        &self.node.parents
    }

    pub(crate) fn grad_fn(&self) -> Option<&dyn Function> {
        self.node.grad_fn.as_deref()
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.node.id)
            .field("shape", &self.shape())
            .field("requires_grad", &self.node.requires_grad)
            .field("grad_fn", &self.grad_fn().map(|g| g.name()))
            .finish()
    }
}
