//! Center loss: softmax classification plus the squared distance of each
//! embedding to its class center

use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use super::{check_batch, xavier_uniform, MetricLoss};
use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
    nn::distance::Distance,
};

/// `cross_entropy(x W, y) + lambda / 2 * sqdist_sum(x, centers[y]) / N`
///
/// Owns a learned (nfeat, nclass) classifier `W` and a learned
/// (nclass, nfeat) center matrix. The softmax term keeps classes apart while
/// the center term pulls each embedding toward its own center.
#[derive(Debug)]
pub struct CenterLoss {
    nfeat: usize,
    nclass: usize,
    lambda: f32,
    distance: Distance,
    classifier: Variable,
    centers: Variable,
}

impl CenterLoss {
    pub fn new(nfeat: usize, nclass: usize, lambda: f32, distance: Distance) -> ForgeResult<Self> {
        Self::with_rng(nfeat, nclass, lambda, distance, &mut StdRng::from_entropy())
    }

    pub fn with_seed(nfeat: usize, nclass: usize, lambda: f32, distance: Distance, seed: u64) -> ForgeResult<Self> {
        Self::with_rng(nfeat, nclass, lambda, distance, &mut StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        nfeat: usize,
        nclass: usize,
        lambda: f32,
        distance: Distance,
        rng: &mut StdRng,
    ) -> ForgeResult<Self> {
        if nfeat == 0 || nclass == 0 {
            return Err(ForgeError::ConfigurationError(format!(
                "center loss needs nfeat and nclass > 0, got {} and {}",
                nfeat, nclass
            )));
        }
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(ForgeError::ConfigurationError(format!(
                "center loss weight must be non-negative, got {}",
                lambda
            )));
        }
        let classifier = Variable::parameter(xavier_uniform(nfeat, nclass, rng)?);
        let centers = Variable::parameter(xavier_uniform(nclass, nfeat, rng)?);
        Ok(Self {
            nfeat,
            nclass,
            lambda,
            distance,
            classifier,
            centers,
        })
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// The (nfeat, nclass) softmax classifier
    pub fn classifier(&self) -> &Variable {
        &self.classifier
    }

    /// The (nclass, nfeat) center matrix
    pub fn centers(&self) -> &Variable {
        &self.centers
    }

    /// Weighted center penalty alone, without the softmax term
    pub fn center_term(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        let n = self.check_inputs(features, labels)?;
        if n == 0 {
            return Ok(Variable::scalar(0.0));
        }
        let assigned = self.centers.index_select(labels)?;
        let squared = self.distance.sqdist_sum(features, &assigned)?;
        Ok(squared.mul_scalar(self.lambda / 2.0 / n as f32))
    }

    fn check_inputs(&self, features: &Variable, labels: &[usize]) -> ForgeResult<usize> {
        let (n, d) = check_batch(features, labels)?;
        if d != self.nfeat {
            return Err(ForgeError::shape_error(
                &format!("features of dimension {}", self.nfeat),
                &format!("dimension {}", d),
                None,
            ));
        }
        if let Some(&bad) = labels.iter().find(|&&y| y >= self.nclass) {
            return Err(ForgeError::InvalidInput(format!(
                "label {} out of range for {} classes",
                bad, self.nclass
            )));
        }
        Ok(n)
    }
}

impl MetricLoss for CenterLoss {
    fn forward(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        let n = self.check_inputs(features, labels)?;
        if n == 0 {
            return Ok(Variable::scalar(0.0));
        }
        debug!(batch = n, classes = self.nclass, "center loss forward");
        let softmax = features.matmul(&self.classifier)?.cross_entropy(labels)?;
        softmax.add(&self.center_term(features, labels)?)
    }

    fn name(&self) -> &'static str {
        "CenterLoss"
    }

    fn test_distance(&self) -> Distance {
        self.distance
    }

    fn parameters(&self) -> Vec<Variable> {
        vec![self.classifier.clone(), self.centers.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn with_fixed_parameters(lambda: f32) -> CenterLoss {
        let loss = CenterLoss::with_seed(2, 2, lambda, Distance::Euclidean, 0).unwrap();
        loss.classifier().set_data(Tensor::zeros(&[2, 2])).unwrap();
        loss.centers()
            .set_data(Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap())
            .unwrap();
        loss
    }

    #[test]
    fn test_value_is_softmax_plus_center_term() {
        let loss = with_fixed_parameters(2.0);
        let x = Variable::parameter(Tensor::from_rows(&[vec![3.0, 4.0], vec![1.0, 1.0]]).unwrap());
        let labels = [0, 1];

        // zero classifier: uniform softmax over two classes
        let softmax = 2.0f32.ln();
        // (25 + 0) * 2 / 2 / 2
        let center = loss.center_term(&x, &labels).unwrap().item().unwrap();
        assert_eq!(center, 12.5);

        let value = MetricLoss::forward(&loss, &x, &labels).unwrap();
        assert!((value.item().unwrap() - (softmax + center)).abs() < 1e-5);

        value.backward().unwrap();
        let centers_grad = loss.centers().grad().unwrap();
        assert_eq!(centers_grad.row(0), &[-3.0, -4.0]);
        assert_eq!(centers_grad.row(1), &[0.0, 0.0]);
        let classifier_grad = loss.classifier().grad().unwrap();
        assert!(classifier_grad.data().iter().any(|g| *g != 0.0));
    }

    #[test]
    fn test_softmax_term_matches_cross_entropy() {
        let loss = CenterLoss::with_seed(3, 4, 0.5, Distance::Euclidean, 3).unwrap();
        let x = Variable::parameter(
            Tensor::from_rows(&[vec![0.2, -0.4, 1.0], vec![0.7, 0.1, -0.3], vec![-0.5, 0.6, 0.2]]).unwrap(),
        );
        let labels = [3, 0, 2];
        let softmax = x.matmul(loss.classifier()).unwrap().cross_entropy(&labels).unwrap();
        let center = loss.center_term(&x, &labels).unwrap();
        let total = MetricLoss::forward(&loss, &x, &labels).unwrap().item().unwrap();
        assert!((total - softmax.item().unwrap() - center.item().unwrap()).abs() < 1e-5);
    }

    #[test]
    fn test_parameters_and_shapes() {
        let loss = CenterLoss::with_seed(3, 5, 1.0, Distance::Cosine, 0).unwrap();
        let params = loss.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].shape().dims, vec![3, 5]);
        assert_eq!(params[1].shape().dims, vec![5, 3]);
    }

    #[test]
    fn test_empty_batch_is_zero() {
        let loss = CenterLoss::with_seed(2, 2, 1.0, Distance::Euclidean, 0).unwrap();
        let x = Variable::parameter(Tensor::zeros(&[0, 2]));
        assert_eq!(MetricLoss::forward(&loss, &x, &[]).unwrap().item().unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_bad_labels() {
        let loss = CenterLoss::with_seed(2, 2, 1.0, Distance::Cosine, 0).unwrap();
        let x = Variable::parameter(Tensor::zeros(&[1, 2]));
        assert!(matches!(MetricLoss::forward(&loss, &x, &[2]), Err(ForgeError::InvalidInput(_))));
        let wide = Variable::parameter(Tensor::zeros(&[1, 3]));
        assert!(matches!(MetricLoss::forward(&loss, &wide, &[0]), Err(ForgeError::ShapeError(_))));
    }
}
