//! Margin-based triplet loss
//!
//! Online mode computes the condensed distances of the whole batch once and
//! looks up every sampled (anchor, positive) and (anchor, negative) pair by
//! offset. Offline mode receives triplets already split into three batches
//! and compares them row by row.

use tracing::debug;

use super::{apply_reduction, check_batch, MetricLoss, Reduction};
use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
    nn::{
        condensed::condensed_indices,
        distance::Distance,
        sampling::{TripletSampling, Triplets},
    },
};

/// Input of a triplet forward pass
#[derive(Debug, Clone, Copy)]
pub enum TripletBatch<'a> {
    Online {
        features: &'a Variable,
        labels: &'a [usize],
    },
    Offline {
        anchors: &'a Variable,
        positives: &'a Variable,
        negatives: &'a Variable,
    },
}

/// Triplet loss: `max(0, d(a, p)^2 - d(a, n)^2 + margin)` per triplet
#[derive(Debug, Clone)]
pub struct TripletLoss {
    margin: f32,
    distance: Distance,
    reduction: Reduction,
    online: bool,
    sampling: TripletSampling,
}

impl TripletLoss {
    pub fn new(
        margin: f32,
        distance: Distance,
        reduction: Reduction,
        online: bool,
        sampling: TripletSampling,
    ) -> ForgeResult<Self> {
        if !margin.is_finite() || margin <= 0.0 {
            return Err(ForgeError::ConfigurationError(format!(
                "triplet margin must be positive, got {}",
                margin
            )));
        }
        sampling.validate()?;
        Ok(Self {
            margin,
            distance,
            reduction,
            online,
            sampling,
        })
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn sampling(&self) -> TripletSampling {
        self.sampling
    }

    /// Dispatch on the configured mode
    pub fn forward(&self, batch: TripletBatch<'_>) -> ForgeResult<Variable> {
        match (self.online, batch) {
            (true, TripletBatch::Online { features, labels }) => self.forward_online(features, labels),
            (false, TripletBatch::Offline { anchors, positives, negatives }) => {
                self.forward_offline(anchors, positives, negatives)
            }
            (online, _) => Err(ForgeError::InvalidInput(format!(
                "triplet loss is configured for {} batches",
                if online { "online" } else { "offline" }
            ))),
        }
    }

    /// Sample triplets inside one labelled batch and reduce their hinge
    pub fn forward_online(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        let (n, _) = check_batch(features, labels)?;
        let condensed = self.distance.pdist(features)?;
        let triplets = {
            let distances = condensed.value();
            let triplets = self.sampling.select_triplets(labels, distances.data())?;
            self.apply_filter(triplets, n, distances.data())?
        };
        debug!(
            batch = n,
            triplets = triplets.len(),
            sampling = self.sampling.name(),
            "online triplet selection"
        );
        if triplets.is_empty() {
            return Ok(Variable::scalar(0.0));
        }

        let pos = condensed_indices(n, &triplets.anchors, &triplets.positives)?;
        let neg = condensed_indices(n, &triplets.anchors, &triplets.negatives)?;
        self.hinge(&condensed.index_select(&pos)?, &condensed.index_select(&neg)?)
    }

    /// Triplets already split into three aligned (N, d) batches
    pub fn forward_offline(
        &self,
        anchors: &Variable,
        positives: &Variable,
        negatives: &Variable,
    ) -> ForgeResult<Variable> {
        let (a, p, n) = (anchors.shape(), positives.shape(), negatives.shape());
        if a != p || a != n {
            return Err(ForgeError::shape_error(
                &format!("anchors, positives and negatives of one shape {}", a),
                &format!("{} and {}", p, n),
                Some("offline triplets must be paired by the sampler"),
            ));
        }
        let dist_pos = self.distance.dist(anchors, positives)?;
        let dist_neg = self.distance.dist(anchors, negatives)?;

        let mask = self
            .sampling
            .filter(dist_pos.value().data(), dist_neg.value().data())?;
        let kept: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(k, &keep)| keep.then_some(k))
            .collect();
        debug!(batch = mask.len(), triplets = kept.len(), "offline triplets");
        if kept.is_empty() {
            return Ok(Variable::scalar(0.0));
        }
        if kept.len() == mask.len() {
            return self.hinge(&dist_pos, &dist_neg);
        }
        self.hinge(&dist_pos.index_select(&kept)?, &dist_neg.index_select(&kept)?)
    }

    /// Triplets the online path would use for this batch
    pub fn select(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Triplets> {
        let (n, _) = check_batch(features, labels)?;
        let condensed = crate::autograd::no_grad(|| self.distance.pdist(features))?;
        let distances = condensed.value();
        let triplets = self.sampling.select_triplets(labels, distances.data())?;
        self.apply_filter(triplets, n, distances.data())
    }

    fn apply_filter(&self, triplets: Triplets, n: usize, distances: &[f32]) -> ForgeResult<Triplets> {
        if !self.sampling.filters() || triplets.is_empty() {
            return Ok(triplets);
        }
        let dist_pos: Vec<f32> = condensed_indices(n, &triplets.anchors, &triplets.positives)?
            .into_iter()
            .map(|k| distances[k])
            .collect();
        let dist_neg: Vec<f32> = condensed_indices(n, &triplets.anchors, &triplets.negatives)?
            .into_iter()
            .map(|k| distances[k])
            .collect();
        let mask = self.sampling.filter(&dist_pos, &dist_neg)?;
        triplets.retain_mask(&mask)
    }

    fn hinge(&self, dist_pos: &Variable, dist_neg: &Variable) -> ForgeResult<Variable> {
        let losses = dist_pos
            .square()
            .sub(&dist_neg.square())?
            .add_scalar(self.margin)
            .relu();
        apply_reduction(&losses, self.reduction)
    }
}

impl MetricLoss for TripletLoss {
    fn forward(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        TripletLoss::forward(self, TripletBatch::Online { features, labels })
    }

    fn name(&self) -> &'static str {
        "TripletLoss"
    }

    fn test_distance(&self) -> Distance {
        self.distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn batch(rows: &[Vec<f32>]) -> Variable {
        Variable::parameter(Tensor::from_rows(rows).unwrap())
    }

    fn loss(margin: f32, sampling: TripletSampling) -> TripletLoss {
        TripletLoss::new(margin, Distance::Euclidean, Reduction::Mean, true, sampling).unwrap()
    }

    #[test]
    fn test_margin_must_be_positive() {
        for margin in [0.0, -1.0, f32::NAN] {
            assert!(matches!(
                TripletLoss::new(margin, Distance::Cosine, Reduction::Sum, true, TripletSampling::BatchAll),
                Err(ForgeError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn test_online_batch_all_value() {
        // d(0,1) = 1, d(0,2) = 2, d(1,2) = sqrt(5)
        let x = batch(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 2.0]]);
        let loss = loss(5.0, TripletSampling::BatchAll).forward_online(&x, &[0, 0, 1]).unwrap();
        // mean of (1 - 4 + 5) and (1 - 5 + 5)
        assert!((loss.item().unwrap() - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_online_gradient_reaches_features() {
        let x = batch(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]]);
        let loss = loss(2.0, TripletSampling::BatchAll).forward_online(&x, &[0, 0, 1]).unwrap();
        loss.backward().unwrap();
        let grad = x.grad().unwrap();
        assert!(grad.data().iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_all_same_label_is_zero_loss() {
        let x = batch(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![2.0, 2.0]]);
        let loss = loss(1.0, TripletSampling::HardestNegative).forward_online(&x, &[3, 3, 3]).unwrap();
        assert_eq!(loss.item().unwrap(), 0.0);
        assert!(loss.backward().is_ok());
    }

    #[test]
    fn test_online_label_mismatch() {
        let x = batch(&[vec![0.0, 1.0], vec![1.0, 0.0]]);
        assert!(matches!(
            loss(1.0, TripletSampling::BatchAll).forward_online(&x, &[0]),
            Err(ForgeError::ShapeError(_))
        ));
    }

    #[test]
    fn test_offline_margin_only() {
        let engine = TripletLoss::new(2.0, Distance::Euclidean, Reduction::Mean, false, TripletSampling::BatchAll).unwrap();
        let a = batch(&[vec![0.0, 0.0]]);
        let p = batch(&[vec![0.5, 0.0]]);
        let n = batch(&[vec![0.0, 0.5]]);
        let loss = engine
            .forward(TripletBatch::Offline { anchors: &a, positives: &p, negatives: &n })
            .unwrap();
        assert_eq!(loss.item().unwrap(), 2.0);
    }

    #[test]
    fn test_offline_shape_mismatch() {
        let engine = TripletLoss::new(1.0, Distance::Euclidean, Reduction::Sum, false, TripletSampling::BatchAll).unwrap();
        let a = batch(&[vec![0.0, 0.0], vec![1.0, 1.0]]);
        let p = batch(&[vec![0.5, 0.0]]);
        assert!(matches!(engine.forward_offline(&a, &p, &a), Err(ForgeError::ShapeError(_))));
    }

    #[test]
    fn test_mode_mismatch() {
        let x = batch(&[vec![0.0, 0.0]]);
        let engine = loss(1.0, TripletSampling::BatchAll);
        assert!(matches!(
            engine.forward(TripletBatch::Offline { anchors: &x, positives: &x, negatives: &x }),
            Err(ForgeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_semi_hard_mask_is_applied() {
        // d(a,p) = 1 for both; negatives at 1.5 and 4.0
        let a = batch(&[vec![0.0, 0.0], vec![0.0, 0.0]]);
        let p = batch(&[vec![1.0, 0.0], vec![1.0, 0.0]]);
        let n = batch(&[vec![0.0, 1.5], vec![0.0, 4.0]]);
        let sampling = TripletSampling::SemiHardNegative { margin: 1.0, deviation: 0.6 };
        let engine = TripletLoss::new(3.0, Distance::Euclidean, Reduction::Sum, false, sampling).unwrap();
        let loss = engine.forward_offline(&a, &p, &n).unwrap();
        // only the first triplet survives: 1 - 2.25 + 3
        assert!((loss.item().unwrap() - 1.75).abs() < 1e-5);
    }

    #[test]
    fn test_online_semi_hard_reduces_over_kept_triplets() {
        // every d(a,p) = 1; negatives sit at distance 2, 3 or 4
        let x = batch(&[vec![0.0], vec![1.0], vec![3.0], vec![4.0]]);
        let labels = [0, 0, 1, 1];
        let semi_hard = loss(10.0, TripletSampling::SemiHardNegative { margin: 1.0, deviation: 0.5 });
        let batch_all = loss(10.0, TripletSampling::BatchAll);

        assert_eq!(batch_all.select(&x, &labels).unwrap().len(), 8);
        let kept = semi_hard.select(&x, &labels).unwrap();
        // only gaps d(a,n) - d(a,p) = 1 fall inside the window
        assert_eq!(kept.iter().collect::<Vec<_>>(), vec![(1, 0, 2), (2, 3, 1)]);

        // mean over the two kept triplets: 1 - 4 + 10 each
        let value = semi_hard.forward_online(&x, &labels).unwrap();
        assert!((value.item().unwrap() - 7.0).abs() < 1e-5);
        // batch-all also averages the hinges of the far negatives
        let all = batch_all.forward_online(&x, &labels).unwrap();
        assert!((all.item().unwrap() - 22.0 / 8.0).abs() < 1e-5);

        let empty = loss(10.0, TripletSampling::SemiHardNegative { margin: 5.0, deviation: 0.5 });
        assert!(empty.select(&x, &labels).unwrap().is_empty());
        assert_eq!(empty.forward_online(&x, &labels).unwrap().item().unwrap(), 0.0);
    }

    #[test]
    fn test_select_hardest_positive_negative() {
        let x = batch(&[vec![0.0], vec![1.0], vec![5.0], vec![3.0]]);
        let triplets = loss(1.0, TripletSampling::HardestPositiveNegative)
            .select(&x, &[0, 0, 1, 2])
            .unwrap();
        // rows 2 and 3 are singletons
        assert_eq!(triplets.iter().collect::<Vec<_>>(), vec![(0, 1, 3), (1, 0, 3)]);
    }
}
