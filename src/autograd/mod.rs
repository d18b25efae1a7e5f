//! Automatic differentiation with a dynamic computation graph
//!
//! Every operation on a [`Variable`] computes its result eagerly and, when
//! any input requires gradients, records a [`Function`] holding the backward
//! rule together with links to its inputs. [`Variable::backward`] walks those
//! links from a scalar loss in reverse topological order and accumulates
//! gradients into the leaves: the feature batch handed in by the encoder
//! and the learned matrices owned by the loss modules.

pub mod function;
pub mod graph;
pub mod ops;
pub mod variable;

pub use function::{Function, FunctionContext};
pub use graph::{ComputationGraph, NodeId};
pub use variable::Variable;

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Execute a closure without gradient tracking.
///
/// Results computed inside are constants; restores the previous state on
/// return so nested calls compose.
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let prev = GRAD_ENABLED.with(|enabled| enabled.replace(false));
    let result = f();
    GRAD_ENABLED.with(|enabled| enabled.set(prev));
    result
}

/// Check if gradient tracking is currently enabled.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| enabled.get())
}
