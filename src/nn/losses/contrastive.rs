//! Contrastive loss over labelled pairs
//!
//! Online mode scores every pair of one batch through its condensed
//! distances. Offline mode receives the pairs already aligned row by row,
//! together with a same-class flag per row.

use tracing::debug;

use super::{apply_reduction, check_batch, MetricLoss, Reduction};
use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
    nn::distance::Distance,
};

/// Input of a contrastive forward pass
#[derive(Debug, Clone, Copy)]
pub enum PairBatch<'a> {
    Online {
        features: &'a Variable,
        labels: &'a [usize],
    },
    Offline {
        left: &'a Variable,
        right: &'a Variable,
        /// Whether row k of `left` and `right` share a class
        same: &'a [bool],
    },
}

/// Pulls same-label pairs together (`d^2`) and pushes different-label pairs
/// at least `margin` apart (`max(0, margin - d)^2`)
#[derive(Debug, Clone)]
pub struct ContrastiveLoss {
    margin: f32,
    distance: Distance,
    reduction: Reduction,
    online: bool,
}

impl ContrastiveLoss {
    pub fn new(margin: f32, distance: Distance, reduction: Reduction, online: bool) -> ForgeResult<Self> {
        if !margin.is_finite() || margin <= 0.0 {
            return Err(ForgeError::ConfigurationError(format!(
                "contrastive margin must be positive, got {}",
                margin
            )));
        }
        Ok(Self {
            margin,
            distance,
            reduction,
            online,
        })
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Dispatch on the configured mode
    pub fn forward(&self, batch: PairBatch<'_>) -> ForgeResult<Variable> {
        match (self.online, batch) {
            (true, PairBatch::Online { features, labels }) => self.forward_online(features, labels),
            (false, PairBatch::Offline { left, right, same }) => self.forward_offline(left, right, same),
            (online, _) => Err(ForgeError::InvalidInput(format!(
                "contrastive loss is configured for {} batches",
                if online { "online" } else { "offline" }
            ))),
        }
    }

    /// Every pair of one labelled batch
    pub fn forward_online(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        let (n, _) = check_batch(features, labels)?;
        let condensed = self.distance.pdist(features)?;

        // condensed order: (i, j) with j varying fastest
        let mut same = Vec::with_capacity(condensed.value().numel());
        for i in 0..n {
            for j in (i + 1)..n {
                same.push(labels[i] == labels[j]);
            }
        }
        self.pair_losses(&condensed, &same)
    }

    /// Pairs already aligned as two (N, d) batches
    pub fn forward_offline(&self, left: &Variable, right: &Variable, same: &[bool]) -> ForgeResult<Variable> {
        let (l, r) = (left.shape(), right.shape());
        if l != r {
            return Err(ForgeError::shape_error(
                &format!("left and right pairs of one shape {}", l),
                &format!("{}", r),
                None,
            ));
        }
        let rows = left.value().require_matrix("contrastive pairs")?.0;
        if same.len() != rows {
            return Err(ForgeError::shape_error(
                &format!("one same-class flag per pair ({})", rows),
                &format!("{} flags", same.len()),
                None,
            ));
        }
        let distances = self.distance.dist(left, right)?;
        self.pair_losses(&distances, same)
    }

    fn pair_losses(&self, distances: &Variable, same: &[bool]) -> ForgeResult<Variable> {
        let (mut similar, mut dissimilar) = (Vec::new(), Vec::new());
        for (k, &is_same) in same.iter().enumerate() {
            if is_same {
                similar.push(k);
            } else {
                dissimilar.push(k);
            }
        }
        debug!(pairs = same.len(), similar = similar.len(), dissimilar = dissimilar.len(), "contrastive pairs");

        let pulled = distances.index_select(&similar)?.square();
        let pushed = distances
            .index_select(&dissimilar)?
            .mul_scalar(-1.0)
            .add_scalar(self.margin)
            .relu()
            .square();
        apply_reduction(&Variable::cat(&[pulled, pushed])?, self.reduction)
    }
}

impl MetricLoss for ContrastiveLoss {
    fn forward(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        ContrastiveLoss::forward(self, PairBatch::Online { features, labels })
    }

    fn name(&self) -> &'static str {
        "ContrastiveLoss"
    }

    fn test_distance(&self) -> Distance {
        self.distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_contrastive_value() {
        // d(0,1) = 1 (same label), d(0,2) = 2, d(1,2) = sqrt(5)
        let x = Variable::parameter(Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap());
        let loss = ContrastiveLoss::new(3.0, Distance::Euclidean, Reduction::Sum, true).unwrap();
        let value = MetricLoss::forward(&loss, &x, &[0, 0, 1]).unwrap().item().unwrap();
        let expected = 1.0 + 1.0 + (3.0 - 5f32.sqrt()).powi(2);
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn test_far_negatives_cost_nothing() {
        let x = Variable::parameter(Tensor::from_rows(&[vec![0.0], vec![10.0]]).unwrap());
        let loss = ContrastiveLoss::new(2.0, Distance::Euclidean, Reduction::Mean, true).unwrap();
        let value = MetricLoss::forward(&loss, &x, &[0, 1]).unwrap();
        assert_eq!(value.item().unwrap(), 0.0);
    }

    #[test]
    fn test_single_row_is_zero() {
        let x = Variable::parameter(Tensor::from_rows(&[vec![1.0, 1.0]]).unwrap());
        let loss = ContrastiveLoss::new(2.0, Distance::Cosine, Reduction::Mean, true).unwrap();
        assert_eq!(MetricLoss::forward(&loss, &x, &[0]).unwrap().item().unwrap(), 0.0);
    }

    #[test]
    fn test_offline_pairs() {
        let left = Variable::parameter(Tensor::from_rows(&[vec![0.0, 0.0], vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap());
        let right = Variable::parameter(Tensor::from_rows(&[vec![3.0, 4.0], vec![1.0, 0.0], vec![1.0, 1.0]]).unwrap());
        let loss = ContrastiveLoss::new(3.0, Distance::Euclidean, Reduction::Sum, false).unwrap();
        // same pair at 5, different pair at 1, different pair at 0
        let value = loss.forward_offline(&left, &right, &[true, false, false]).unwrap();
        assert!((value.item().unwrap() - (25.0 + 4.0 + 9.0)).abs() < 1e-4);

        let batch = PairBatch::Offline {
            left: &left,
            right: &right,
            same: &[true, false, false],
        };
        let value = ContrastiveLoss::forward(&loss, batch).unwrap();
        value.backward().unwrap();
        assert!(left.grad().unwrap().data().iter().all(|g| g.is_finite()));

        assert!(matches!(
            loss.forward_offline(&left, &right, &[true]),
            Err(ForgeError::ShapeError(_))
        ));
    }

    #[test]
    fn test_offline_matches_online_pairs() {
        let x = Variable::parameter(Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap());
        let online = ContrastiveLoss::new(3.0, Distance::Euclidean, Reduction::Mean, true).unwrap();
        let offline = ContrastiveLoss::new(3.0, Distance::Euclidean, Reduction::Mean, false).unwrap();
        let left = x.index_select(&[0, 0, 1]).unwrap();
        let right = x.index_select(&[1, 2, 2]).unwrap();
        let a = online.forward_online(&x, &[0, 0, 1]).unwrap().item().unwrap();
        let b = offline.forward_offline(&left, &right, &[true, false, false]).unwrap().item().unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_mode_mismatch() {
        let x = Variable::parameter(Tensor::from_rows(&[vec![0.0], vec![1.0]]).unwrap());
        let offline = ContrastiveLoss::new(1.0, Distance::Euclidean, Reduction::Mean, false).unwrap();
        assert!(matches!(
            MetricLoss::forward(&offline, &x, &[0, 1]),
            Err(ForgeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_margin() {
        assert!(ContrastiveLoss::new(-1.0, Distance::Cosine, Reduction::Mean, true).is_err());
    }
}
