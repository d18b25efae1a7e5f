//! Triplet sampling strategies
//!
//! A strategy turns a label batch and its condensed distance vector into
//! (anchor, positive, negative) index triples. Labels are compared as exact
//! integers and no strategy ever pairs a row with itself.

use std::fmt::{self, Display};
use std::str::FromStr;

use super::condensed::{condensed_len, square_form};
use crate::error::{ForgeError, ForgeResult};

/// Index triples into a batch, stored column-wise
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triplets {
    pub anchors: Vec<usize>,
    pub positives: Vec<usize>,
    pub negatives: Vec<usize>,
}

impl Triplets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, anchor: usize, positive: usize, negative: usize) {
        self.anchors.push(anchor);
        self.positives.push(positive);
        self.negatives.push(negative);
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.anchors
            .iter()
            .zip(&self.positives)
            .zip(&self.negatives)
            .map(|((&a, &p), &n)| (a, p, n))
    }

    /// Keep the triplets whose mask entry is set
    pub fn retain_mask(&self, mask: &[bool]) -> ForgeResult<Triplets> {
        if mask.len() != self.len() {
            return Err(ForgeError::shape_error(
                &format!("a mask of {} entries", self.len()),
                &format!("{}", mask.len()),
                None,
            ));
        }
        let mut kept = Triplets::new();
        for ((a, p, n), &keep) in self.iter().zip(mask) {
            if keep {
                kept.push(a, p, n);
            }
        }
        Ok(kept)
    }
}

/// How triplets are drawn from a batch
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TripletSampling {
    /// Every valid (anchor, positive, negative) combination
    #[default]
    BatchAll,
    /// Every positive of an anchor with its closest negative
    HardestNegative,
    /// One triplet per anchor: farthest positive, closest negative
    HardestPositiveNegative,
    /// Batch-all candidates kept only when the negative sits within
    /// `deviation` of `margin` past the positive
    SemiHardNegative { margin: f32, deviation: f32 },
}

impl TripletSampling {
    pub const NAMES: [&'static str; 4] = [
        "batch-all",
        "hardest-negative",
        "hardest-positive-negative",
        "semi-hard-negative",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TripletSampling::BatchAll => "batch-all",
            TripletSampling::HardestNegative => "hardest-negative",
            TripletSampling::HardestPositiveNegative => "hardest-positive-negative",
            TripletSampling::SemiHardNegative { .. } => "semi-hard-negative",
        }
    }

    /// Reject semi-hard parameters that make the filter meaningless
    pub fn validate(&self) -> ForgeResult<()> {
        if let TripletSampling::SemiHardNegative { margin, deviation } = *self {
            if !margin.is_finite() || !deviation.is_finite() || deviation < 0.0 {
                return Err(ForgeError::ConfigurationError(format!(
                    "semi-hard sampling needs a finite margin and a non-negative deviation, got m={} deviation={}",
                    margin, deviation
                )));
            }
        }
        Ok(())
    }

    /// Whether `filter` can drop triplets
    pub fn filters(&self) -> bool {
        matches!(self, TripletSampling::SemiHardNegative { .. })
    }

    /// Draw triplets for `labels` given the batch's condensed distances
    pub fn select_triplets(&self, labels: &[usize], distances: &[f32]) -> ForgeResult<Triplets> {
        let n = labels.len();
        if distances.len() != condensed_len(n) {
            return Err(ForgeError::shape_error(
                &format!("{} condensed distances for {} labels", condensed_len(n), n),
                &format!("{}", distances.len()),
                Some("features and labels must come from the same batch"),
            ));
        }

        match self {
            TripletSampling::BatchAll | TripletSampling::SemiHardNegative { .. } => Ok(batch_all(labels)),
            TripletSampling::HardestNegative => {
                let dense = square_form(n, distances)?;
                let mut triplets = Triplets::new();
                for anchor in 0..n {
                    let row = dense.row(anchor);
                    // labels with no other class have nothing to push away from
                    let Some(negative) = hardest(row, |k| labels[k] != labels[anchor], |d, best| d < best) else {
                        continue;
                    };
                    for positive in (0..n).filter(|&p| p != anchor && labels[p] == labels[anchor]) {
                        triplets.push(anchor, positive, negative);
                    }
                }
                Ok(triplets)
            }
            TripletSampling::HardestPositiveNegative => {
                let dense = square_form(n, distances)?;
                let mut triplets = Triplets::new();
                for anchor in 0..n {
                    let row = dense.row(anchor);
                    let positive = hardest(
                        row,
                        |k| k != anchor && labels[k] == labels[anchor],
                        |d, best| d > best,
                    );
                    let negative = hardest(row, |k| labels[k] != labels[anchor], |d, best| d < best);
                    if let (Some(positive), Some(negative)) = (positive, negative) {
                        triplets.push(anchor, positive, negative);
                    }
                }
                Ok(triplets)
            }
        }
    }

    /// Keep mask over already computed positive/negative distances.
    ///
    /// Only the semi-hard strategy drops anything. The window is symmetric
    /// around the margin: a triplet is kept when its gap
    /// `dist_neg - dist_pos` lies in `[margin - deviation, margin + deviation]`,
    /// i.e. `|(dist_neg - dist_pos) - margin| <= deviation`. Gaps just below
    /// the margin are kept as well as gaps just above it.
    pub fn filter(&self, dist_pos: &[f32], dist_neg: &[f32]) -> ForgeResult<Vec<bool>> {
        if dist_pos.len() != dist_neg.len() {
            return Err(ForgeError::shape_error(
                &format!("{} negative distances", dist_pos.len()),
                &format!("{}", dist_neg.len()),
                None,
            ));
        }
        match *self {
            TripletSampling::SemiHardNegative { margin, deviation } => Ok(dist_pos
                .iter()
                .zip(dist_neg)
                .map(|(&dp, &dn)| ((dn - dp) - margin).abs() <= deviation)
                .collect()),
            _ => Ok(vec![true; dist_pos.len()]),
        }
    }
}

fn batch_all(labels: &[usize]) -> Triplets {
    let mut triplets = Triplets::new();
    for (anchor, &y_anchor) in labels.iter().enumerate() {
        for (positive, &y_positive) in labels.iter().enumerate() {
            if positive == anchor || y_positive != y_anchor {
                continue;
            }
            for (negative, &y_negative) in labels.iter().enumerate() {
                if y_negative != y_anchor {
                    triplets.push(anchor, positive, negative);
                }
            }
        }
    }
    triplets
}

/// First index among the `eligible` ones whose distance wins `better`
fn hardest(
    row: &[f32],
    eligible: impl Fn(usize) -> bool,
    better: impl Fn(f32, f32) -> bool,
) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (k, &d) in row.iter().enumerate() {
        if !eligible(k) {
            continue;
        }
        match best {
            Some((_, best_d)) if !better(d, best_d) => {}
            _ => best = Some((k, d)),
        }
    }
    best.map(|(k, _)| k)
}

impl Display for TripletSampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripletSampling::SemiHardNegative { margin, deviation } => {
                write!(f, "semi-hard-negative(m={}, deviation={})", margin, deviation)
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

impl FromStr for TripletSampling {
    type Err = ForgeError;

    /// Parameterless strategies only; semi-hard sampling is built with its
    /// margin and deviation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "batch-all" => Ok(TripletSampling::BatchAll),
            "hardest-negative" => Ok(TripletSampling::HardestNegative),
            "hardest-positive-negative" => Ok(TripletSampling::HardestPositiveNegative),
            "semi-hard-negative" => Err(ForgeError::ConfigurationError(
                "semi-hard-negative sampling needs a margin and a deviation".to_string(),
            )),
            other => Err(ForgeError::unknown_name("sampling strategy", other, &Self::NAMES)),
        }
    }
}
