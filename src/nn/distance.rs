//! Distance functions over batches of embeddings
//!
//! Every distance offers a row-wise form (`dist`), a condensed pairwise form
//! (`pdist`) and a summed squared form (`sqdist_sum`). `pdist` walks row i
//! against the rows after it, so entry `condensed_index(n, i, j)` of the
//! result is bit-for-bit what `dist` returns for rows i and j.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    autograd::Variable,
    error::{ForgeError, ForgeResult},
};

/// Norm floor used by the cosine distance
pub const COSINE_EPS: f32 = 1e-8;

/// Distance geometry of the embedding space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    /// 1 - cosine similarity
    Cosine,
    /// Plain L2 distance
    Euclidean,
}

impl Distance {
    pub const NAMES: [&'static str; 2] = ["cosine", "euclidean"];

    /// Identifier understood by external nearest-neighbour evaluators
    pub fn metric_name(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Euclidean => "euclidean",
        }
    }

    /// Per-row distance between two (N, d) batches, shape (N)
    pub fn dist(&self, x: &Variable, y: &Variable) -> ForgeResult<Variable> {
        check_batches(x, y)?;
        match self {
            Distance::Cosine => {
                let similarity = x
                    .normalize_rows(COSINE_EPS)?
                    .mul(&y.normalize_rows(COSINE_EPS)?)?
                    .sum_rows()?;
                Ok(similarity.mul_scalar(-1.0).add_scalar(1.0))
            }
            Distance::Euclidean => Ok(x.sub(y)?.square().sum_rows()?.sqrt()),
        }
    }

    /// Condensed pairwise distances of one (N, d) batch, length N(N-1)/2
    pub fn pdist(&self, x: &Variable) -> ForgeResult<Variable> {
        let (n, _) = x.value().require_matrix("pdist")?;
        let mut segments = Vec::with_capacity(n.saturating_sub(1));
        for i in 0..n.saturating_sub(1) {
            let anchor = x.index_select(&vec![i; n - 1 - i])?;
            let rest = x.index_select(&((i + 1)..n).collect::<Vec<_>>())?;
            segments.push(self.dist(&anchor, &rest)?);
        }
        Variable::cat(&segments)
    }

    /// Sum over rows of the squared distance between two (N, d) batches
    pub fn sqdist_sum(&self, x: &Variable, y: &Variable) -> ForgeResult<Variable> {
        match self {
            Distance::Cosine => Ok(self.dist(x, y)?.square().sum()),
            Distance::Euclidean => {
                check_batches(x, y)?;
                Ok(x.sub(y)?.square().sum())
            }
        }
    }
}

fn check_batches(x: &Variable, y: &Variable) -> ForgeResult<()> {
    let (xs, ys) = (x.shape(), y.shape());
    if xs.ndim() != 2 || xs != ys {
        return Err(ForgeError::shape_error(
            &format!("two batches of the same (N, d) shape, first is {}", xs),
            &format!("{}", ys),
            None,
        ));
    }
    Ok(())
}

impl Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distance::Cosine => write!(f, "Cosine Distance"),
            Distance::Euclidean => write!(f, "Euclidean Distance"),
        }
    }
}

impl FromStr for Distance {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Distance::Cosine),
            "euclidean" => Ok(Distance::Euclidean),
            other => Err(ForgeError::unknown_name("distance", other, &Distance::NAMES)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::condensed::condensed_index;
    use crate::tensor::Tensor;

    fn batch(rows: &[Vec<f32>]) -> Variable {
        Variable::parameter(Tensor::from_rows(rows).unwrap())
    }

    #[test]
    fn test_euclidean_dist_is_per_row() {
        let x = batch(&[vec![0.0, 0.0], vec![1.0, 1.0]]);
        let y = batch(&[vec![3.0, 4.0], vec![1.0, 1.0]]);
        let d = Distance::Euclidean.dist(&x, &y).unwrap();
        assert_eq!(d.value().data(), &[5.0, 0.0]);
    }

    #[test]
    fn test_cosine_dist() {
        let x = batch(&[vec![1.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0]]);
        let y = batch(&[vec![0.0, 3.0], vec![-1.0, 0.0], vec![5.0, 0.0]]);
        let d = Distance::Cosine.dist(&x, &y).unwrap().tensor();
        assert!(d.allclose(&Tensor::from_vec(vec![1.0, 2.0, 0.0], &[3]).unwrap(), 1e-6));
    }

    #[test]
    fn test_cosine_zero_row_is_finite() {
        let x = batch(&[vec![0.0, 0.0]]);
        let y = batch(&[vec![1.0, 2.0]]);
        let d = Distance::Cosine.dist(&x, &y).unwrap();
        assert_eq!(d.item().unwrap(), 1.0);
        d.sum().backward().unwrap();
        assert!(x.grad().unwrap().data().iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_dist_rejects_mismatched_batches() {
        let x = batch(&[vec![1.0, 0.0]]);
        let y = batch(&[vec![1.0, 0.0, 0.0]]);
        assert!(matches!(Distance::Cosine.dist(&x, &y), Err(ForgeError::ShapeError(_))));
    }

    #[test]
    fn test_pdist_matches_condensed_layout() {
        let rows = vec![vec![0.0, 0.0], vec![3.0, 4.0], vec![6.0, 8.0], vec![0.0, 1.0]];
        let x = batch(&rows);
        for distance in [Distance::Cosine, Distance::Euclidean] {
            let condensed = distance.pdist(&x).unwrap().tensor();
            assert_eq!(condensed.numel(), 6);
            for i in 0..4 {
                for j in (i + 1)..4 {
                    let d = distance
                        .dist(&batch(&[rows[i].clone()]), &batch(&[rows[j].clone()]))
                        .unwrap()
                        .item()
                        .unwrap();
                    assert_eq!(condensed.data()[condensed_index(4, i, j).unwrap()], d);
                }
            }
        }
    }

    #[test]
    fn test_pdist_of_single_row_is_empty() {
        let x = batch(&[vec![1.0, 2.0]]);
        assert_eq!(Distance::Euclidean.pdist(&x).unwrap().shape().dims, vec![0]);
    }

    #[test]
    fn test_sqdist_sum() {
        let x = batch(&[vec![0.0, 0.0], vec![1.0, 1.0]]);
        let y = batch(&[vec![3.0, 4.0], vec![1.0, 2.0]]);
        assert_eq!(Distance::Euclidean.sqdist_sum(&x, &y).unwrap().item().unwrap(), 26.0);
    }

    #[test]
    fn test_names() {
        assert_eq!(Distance::Cosine.metric_name(), "cosine");
        assert_eq!(Distance::Euclidean.to_string(), "Euclidean Distance");
        assert_eq!("Cosine".parse::<Distance>().unwrap(), Distance::Cosine);
        assert!(matches!(
            "manhattan".parse::<Distance>(),
            Err(ForgeError::ConfigurationError(_))
        ));
    }
}
