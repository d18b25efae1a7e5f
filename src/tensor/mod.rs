//! Dense tensor storage backing the differentiable variables
//!
//! Row-major `f32` data with a runtime shape. Only the 0-D, 1-D and 2-D
//! cases appear in the loss engine: scalars, per-row distances and
//! (N, d) feature batches.

pub mod core;

// Re-export main types for convenience
pub use self::core::{Shape, Tensor};
