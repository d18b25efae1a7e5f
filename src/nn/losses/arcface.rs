//! Additive angular margin loss (ArcFace)
//!
//! Features and class centers are projected onto the unit sphere, the angle
//! between each sample and its own class center is widened by `margin`, and
//! the scaled cosines are classified with softmax cross-entropy.

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{check_batch, xavier_uniform, MetricLoss};
use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
    nn::distance::{Distance, COSINE_EPS},
    tensor::Tensor,
};

/// Keeps the target cosine strictly inside the domain of acos
const ACOS_CLAMP: f32 = 1e-7;

/// Hyperparameters of an [`ArcMarginLoss`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcMarginConfig {
    pub nfeat: usize,
    pub nclass: usize,
    /// Additive angular margin in radians
    #[serde(default = "ArcMarginConfig::default_margin")]
    pub margin: f32,
    #[serde(default = "ArcMarginConfig::default_scale")]
    pub scale: f32,
    /// Seed for the center initialization; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ArcMarginConfig {
    pub const DEFAULT_MARGIN: f32 = 0.35;
    pub const DEFAULT_SCALE: f32 = 4.0;

    pub fn new(nfeat: usize, nclass: usize) -> Self {
        Self {
            nfeat,
            nclass,
            margin: Self::DEFAULT_MARGIN,
            scale: Self::DEFAULT_SCALE,
            seed: None,
        }
    }

    fn default_margin() -> f32 {
        Self::DEFAULT_MARGIN
    }

    fn default_scale() -> f32 {
        Self::DEFAULT_SCALE
    }

    pub fn build(&self) -> ForgeResult<ArcMarginLoss> {
        match self.seed {
            Some(seed) => ArcMarginLoss::with_seed(self.nfeat, self.nclass, self.margin, self.scale, seed),
            None => ArcMarginLoss::new(self.nfeat, self.nclass, self.margin, self.scale),
        }
    }
}

/// ArcFace head owning a learned (nfeat, nclass) center matrix
#[derive(Debug)]
pub struct ArcMarginLoss {
    nfeat: usize,
    nclass: usize,
    margin: f32,
    scale: f32,
    centers: Variable,
}

impl ArcMarginLoss {
    pub fn new(nfeat: usize, nclass: usize, margin: f32, scale: f32) -> ForgeResult<Self> {
        Self::with_rng(nfeat, nclass, margin, scale, &mut StdRng::from_entropy())
    }

    /// Deterministic center initialization
    pub fn with_seed(nfeat: usize, nclass: usize, margin: f32, scale: f32, seed: u64) -> ForgeResult<Self> {
        Self::with_rng(nfeat, nclass, margin, scale, &mut StdRng::seed_from_u64(seed))
    }

    fn with_rng(nfeat: usize, nclass: usize, margin: f32, scale: f32, rng: &mut StdRng) -> ForgeResult<Self> {
        if nfeat == 0 || nclass == 0 {
            return Err(ForgeError::ConfigurationError(format!(
                "arc margin loss needs nfeat and nclass > 0, got {} and {}",
                nfeat, nclass
            )));
        }
        if !margin.is_finite() || !scale.is_finite() || scale <= 0.0 {
            return Err(ForgeError::ConfigurationError(format!(
                "arc margin loss needs a finite margin and a positive scale, got m={} s={}",
                margin, scale
            )));
        }
        let centers = Variable::parameter(xavier_uniform(nfeat, nclass, rng)?);
        Ok(Self {
            nfeat,
            nclass,
            margin,
            scale,
            centers,
        })
    }

    pub fn nfeat(&self) -> usize {
        self.nfeat
    }

    pub fn nclass(&self) -> usize {
        self.nclass
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// The (nfeat, nclass) center matrix, to be registered with an optimizer
    pub fn centers(&self) -> &Variable {
        &self.centers
    }

    /// Cosine between every normalized feature row and every normalized
    /// center column, shape (N, nclass)
    pub fn cosine_logits(&self, features: &Variable) -> ForgeResult<Variable> {
        let (_, d) = features.value().require_matrix("arc margin features")?;
        if d != self.nfeat {
            return Err(ForgeError::shape_error(
                &format!("features of dimension {}", self.nfeat),
                &format!("dimension {}", d),
                None,
            ));
        }
        let x = features.normalize_rows(COSINE_EPS)?;
        let w = self.centers.transpose()?.normalize_rows(COSINE_EPS)?.transpose()?;
        x.matmul(&w)
    }

    /// Scaled logits with the angular margin added to each target column
    pub fn logits(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        check_batch(features, labels)?;
        if let Some(&bad) = labels.iter().find(|&&y| y >= self.nclass) {
            return Err(ForgeError::InvalidInput(format!(
                "label {} out of range for {} classes",
                bad, self.nclass
            )));
        }
        let cosine = self.cosine_logits(features)?;
        // no second clamp: theta + m may pass pi
        let target = cosine
            .gather_cols(labels)?
            .clamp(-1.0 + ACOS_CLAMP, 1.0 - ACOS_CLAMP)
            .acos()
            .add_scalar(self.margin)
            .cos();
        Ok(cosine.replace_cols(labels, &target)?.mul_scalar(self.scale))
    }

    /// Persist the center matrix
    pub fn state_bytes(&self) -> ForgeResult<Vec<u8>> {
        Ok(bincode::serialize(&*self.centers.value())?)
    }

    /// Restore a center matrix written by [`state_bytes`](Self::state_bytes)
    pub fn load_state_bytes(&self, bytes: &[u8]) -> ForgeResult<()> {
        let stored: Tensor = bincode::deserialize(bytes)?;
        let dims = stored.dims().to_vec();
        if dims != [self.nfeat, self.nclass] {
            warn!(
                expected = ?[self.nfeat, self.nclass],
                got = ?dims,
                "rejecting arc margin state with a different center shape"
            );
            return Err(ForgeError::shape_error(
                &format!("centers of shape [{}, {}]", self.nfeat, self.nclass),
                &format!("{}", stored.shape()),
                None,
            ));
        }
        let centers = Tensor::from_vec(stored.into_vec(), &dims)?;
        self.centers.set_data(centers)
    }
}

impl MetricLoss for ArcMarginLoss {
    fn forward(&self, features: &Variable, labels: &[usize]) -> ForgeResult<Variable> {
        let logits = self.logits(features, labels)?;
        debug!(batch = labels.len(), classes = self.nclass, "arc margin forward");
        logits.cross_entropy(labels)
    }

    fn name(&self) -> &'static str {
        "ArcMarginLoss"
    }

    fn test_distance(&self) -> Distance {
        Distance::Cosine
    }

    fn parameters(&self) -> Vec<Variable> {
        vec![self.centers.clone()]
    }
}
