//! metricforge - metric-learning losses with reverse-mode autograd
//!
//! Features:
//! - Cosine and Euclidean distances with condensed pairwise computation
//! - Condensed-index addressing for batch pair lookups
//! - Triplet sampling: batch-all, hardest negative, hardest positive/negative
//!   and semi-hard negative
//! - Triplet loss (online and offline), ArcFace additive angular margin loss,
//!   contrastive loss and center loss
//! - Serializable loss configuration
//!
//! Losses take an already-encoded (N, d) feature [`Variable`] and integer
//! labels, and return a scalar [`Variable`]; calling `backward` on it fills
//! the gradients of the features and of any matrix owned by the loss.

pub mod autograd;
pub mod config;
pub mod error;
pub mod nn;
pub mod tensor;

pub use autograd::{no_grad, Variable};
pub use config::{ConfigBuilder, LossConfig};
pub use error::{ErrorCode, ForgeError, ForgeResult};
pub use nn::{
    ArcMarginConfig, ArcMarginLoss, CenterLoss, ContrastiveLoss, Distance, MetricLoss, PairBatch,
    Reduction, TripletBatch, TripletLoss, TripletSampling, Triplets,
};
pub use tensor::{Shape, Tensor};

/// Initialize the tracing subscriber.
///
/// Safe to call more than once; later calls leave the installed subscriber
/// in place.
pub fn init() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Get library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
