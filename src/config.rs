//! Loss configuration
//!
//! A [`LossConfig`] is the serializable description of one metric-learning
//! loss. Distance and sampling names stay plain strings in the JSON form and
//! are parsed by [`LossConfig::build`], so an unknown name fails when the
//! loss is constructed rather than on the first batch.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ForgeError, ForgeResult},
    nn::{
        distance::Distance,
        losses::{ArcMarginConfig, CenterLoss, ContrastiveLoss, MetricLoss, Reduction, TripletLoss},
        sampling::TripletSampling,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemiHardConfig {
    pub margin: f32,
    pub deviation: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripletConfig {
    pub margin: f32,
    pub distance: String,
    pub sampling: String,
    /// Parameters for `sampling = "semi-hard-negative"`
    pub semi_hard: Option<SemiHardConfig>,
    pub reduction: Reduction,
    pub online: bool,
}

impl Default for TripletConfig {
    fn default() -> Self {
        Self {
            margin: 2.0,
            distance: "euclidean".to_string(),
            sampling: "batch-all".to_string(),
            semi_hard: None,
            reduction: Reduction::Mean,
            online: true,
        }
    }
}

impl TripletConfig {
    pub fn sampling_strategy(&self) -> ForgeResult<TripletSampling> {
        let name = self.sampling.trim().to_lowercase().replace('_', "-");
        if name != "semi-hard-negative" {
            return name.parse();
        }
        match self.semi_hard {
            Some(SemiHardConfig { margin, deviation }) => Ok(TripletSampling::SemiHardNegative { margin, deviation }),
            None => Err(ForgeError::ConfigurationError(
                "semi-hard-negative sampling needs a semi_hard section".to_string(),
            )),
        }
    }

    pub fn build(&self) -> ForgeResult<TripletLoss> {
        TripletLoss::new(
            self.margin,
            self.distance.parse()?,
            self.reduction,
            self.online,
            self.sampling_strategy()?,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastiveConfig {
    pub margin: f32,
    pub distance: String,
    pub reduction: Reduction,
    pub online: bool,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            margin: 2.0,
            distance: "euclidean".to_string(),
            reduction: Reduction::Mean,
            online: true,
        }
    }
}

impl ContrastiveConfig {
    pub fn build(&self) -> ForgeResult<ContrastiveLoss> {
        ContrastiveLoss::new(self.margin, self.distance.parse()?, self.reduction, self.online)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterConfig {
    pub nfeat: usize,
    pub nclass: usize,
    #[serde(default = "CenterConfig::default_lambda")]
    pub lambda: f32,
    #[serde(default = "CenterConfig::default_distance")]
    pub distance: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl CenterConfig {
    pub fn new(nfeat: usize, nclass: usize) -> Self {
        Self {
            nfeat,
            nclass,
            lambda: Self::default_lambda(),
            distance: Self::default_distance(),
            seed: None,
        }
    }

    fn default_lambda() -> f32 {
        1.0
    }

    fn default_distance() -> String {
        "euclidean".to_string()
    }

    pub fn build(&self) -> ForgeResult<CenterLoss> {
        let distance: Distance = self.distance.parse()?;
        match self.seed {
            Some(seed) => CenterLoss::with_seed(self.nfeat, self.nclass, self.lambda, distance, seed),
            None => CenterLoss::new(self.nfeat, self.nclass, self.lambda, distance),
        }
    }
}

/// One metric-learning loss, tagged by `"loss"` in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "loss", rename_all = "lowercase")]
pub enum LossConfig {
    Triplet(TripletConfig),
    #[serde(rename = "arcface")]
    ArcFace(ArcMarginConfig),
    Contrastive(ContrastiveConfig),
    Center(CenterConfig),
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::Triplet(TripletConfig::default())
    }
}

impl LossConfig {
    pub fn name(&self) -> &'static str {
        match self {
            LossConfig::Triplet(_) => "triplet",
            LossConfig::ArcFace(_) => "arcface",
            LossConfig::Contrastive(_) => "contrastive",
            LossConfig::Center(_) => "center",
        }
    }

    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        tracing::info!(loss = config.name(), "Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ForgeResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string()?)?;
        tracing::info!(loss = self.name(), "Configuration saved to {:?}", path);
        Ok(())
    }

    /// Construct the configured loss, validating every name and parameter
    pub fn build(&self) -> ForgeResult<Box<dyn MetricLoss>> {
        let loss: Box<dyn MetricLoss> = match self {
            LossConfig::Triplet(c) => Box::new(c.build()?),
            LossConfig::ArcFace(c) => Box::new(c.build()?),
            LossConfig::Contrastive(c) => Box::new(c.build()?),
            LossConfig::Center(c) => Box::new(c.build()?),
        };
        Ok(loss)
    }
}

/// Create a loss configuration step by step
///
/// Each method switches the builder to that loss (starting from its
/// defaults when the previous step chose another one) and lets the closure
/// adjust it.
pub struct ConfigBuilder {
    config: LossConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LossConfig::default(),
        }
    }

    pub fn triplet(mut self, f: impl FnOnce(&mut TripletConfig)) -> Self {
        if !matches!(self.config, LossConfig::Triplet(_)) {
            self.config = LossConfig::Triplet(TripletConfig::default());
        }
        if let LossConfig::Triplet(c) = &mut self.config {
            f(c);
        }
        self
    }

    pub fn arcface(mut self, nfeat: usize, nclass: usize, f: impl FnOnce(&mut ArcMarginConfig)) -> Self {
        let mut c = ArcMarginConfig::new(nfeat, nclass);
        f(&mut c);
        self.config = LossConfig::ArcFace(c);
        self
    }

    pub fn contrastive(mut self, f: impl FnOnce(&mut ContrastiveConfig)) -> Self {
        if !matches!(self.config, LossConfig::Contrastive(_)) {
            self.config = LossConfig::Contrastive(ContrastiveConfig::default());
        }
        if let LossConfig::Contrastive(c) = &mut self.config {
            f(c);
        }
        self
    }

    pub fn center(mut self, nfeat: usize, nclass: usize, f: impl FnOnce(&mut CenterConfig)) -> Self {
        let mut c = CenterConfig::new(nfeat, nclass);
        f(&mut c);
        self.config = LossConfig::Center(c);
        self
    }

    pub fn build(self) -> LossConfig {
        self.config
    }

    pub fn build_loss(self) -> ForgeResult<Box<dyn MetricLoss>> {
        self.config.build()
    }
}
