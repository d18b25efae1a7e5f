//! Computation graph for automatic differentiation

use std::collections::{HashMap, HashSet};

use super::variable::Variable;
use crate::{
    error::{ForgeError, ForgeResult},
    tensor::Tensor,
};

pub type NodeId = usize;

/// Reverse-mode view of the graph reachable from a scalar root.
///
/// Built on demand from the parent links recorded by each operation, so no
/// global tape has to be cleared between training steps: dropping the loss
/// variable releases the whole graph.
pub struct ComputationGraph {
    root: Variable,
    topological_order: Vec<Variable>,
}

impl ComputationGraph {
    /// Collect every node that contributes to `root` in topological order
    pub fn from_root(root: &Variable) -> ForgeResult<Self> {
        if root.value().numel() != 1 {
            return Err(ForgeError::InvalidInput(format!(
                "backward requires a scalar root, got shape {}",
                root.shape()
            )));
        }
        let topological_order = Self::topological_sort(root);
        Ok(Self {
            root: root.clone(),
            topological_order,
        })
    }

    /// Iterative depth-first post-order over parent links; parents always
    /// precede their children in the result.
    fn topological_sort(root: &Variable) -> Vec<Variable> {
        let mut order = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut stack: Vec<(Variable, bool)> = vec![(root.clone(), false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.push((node.clone(), true));
            for parent in node.parents() {
                if parent.requires_grad() && !visited.contains(&parent.id()) {
                    stack.push((parent.clone(), false));
                }
            }
        }
        order
    }

    /// Get number of nodes in graph
    pub fn num_nodes(&self) -> usize {
        self.topological_order.len()
    }

    /// Perform backward pass from the root node
    pub fn backward(&self) -> ForgeResult<()> {
        if !self.root.requires_grad() {
            return Ok(());
        }

        let mut grads: HashMap<usize, Tensor> = HashMap::new();
        grads.insert(self.root.id(), Tensor::ones(self.root.shape().as_slice()));

        for node in self.topological_order.iter().rev() {
            let Some(grad_output) = grads.remove(&node.id()) else {
                continue;
            };

            let Some(grad_fn) = node.grad_fn() else {
                if node.requires_grad() {
                    node.accumulate_grad(&grad_output)?;
                }
                continue;
            };

            let parent_grads = grad_fn.backward(&grad_output)?;
            if parent_grads.len() != node.parents().len() {
                return Err(ForgeError::InternalError(format!(
                    "{} returned {} gradients for {} inputs",
                    grad_fn.name(),
                    parent_grads.len(),
                    node.parents().len()
                )));
            }

            for (parent, grad) in node.parents().iter().zip(parent_grads) {
                let Some(grad) = grad else { continue };
                if !parent.requires_grad() {
                    continue;
                }
                match grads.get_mut(&parent.id()) {
                    Some(existing) => existing.add_assign(&grad)?,
                    None => {
                        grads.insert(parent.id(), grad);
                    }
                }
            }
        }

        Ok(())
    }
}
