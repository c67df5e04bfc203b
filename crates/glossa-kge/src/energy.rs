//! Translation energies and the margin ranking loss.
//!
//! TransE treats a relation as a translation, so a true triple should satisfy
//! `h + r ≈ t`. The energy of a triple is the distance left over:
//!
//! ```text
//! E(h, r, t) = ||h + r - t||_p        p ∈ {1, 2}
//! ```
//!
//! Lower energy means a more plausible triple. Training pushes each positive
//! at least `margin` below its corruptions:
//!
//! ```text
//! L = mean over (pos, neg) of max(0, margin + E(pos) - E(neg))
//! ```

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Keeps the L2 gradient finite when `h + r = t` exactly.
const L2_EPS: f64 = 1e-12;

/// Norm used to measure the translation residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PNorm {
    #[default]
    L1,
    L2,
}

impl TryFrom<usize> for PNorm {
    type Error = Error;

    fn try_from(p: usize) -> Result<Self> {
        match p {
            1 => Ok(Self::L1),
            2 => Ok(Self::L2),
            other => Err(Error::Unsupported(format!("p_norm must be 1 or 2, got {other}"))),
        }
    }
}

/// Norm over the last dimension.
pub fn norm(x: &Tensor, p: PNorm) -> Result<Tensor> {
    let reduced = match p {
        PNorm::L1 => x.abs()?.sum(D::Minus1)?,
        PNorm::L2 => (x.sqr()?.sum(D::Minus1)? + L2_EPS)?.sqrt()?,
    };
    Ok(reduced)
}

/// `||h + r - t||_p` with broadcasting over leading dimensions.
pub fn energy(heads: &Tensor, relations: &Tensor, tails: &Tensor, p: PNorm) -> Result<Tensor> {
    let residual = heads.broadcast_add(relations)?.broadcast_sub(tails)?;
    norm(&residual, p)
}

/// Margin ranking loss for `n` positive energies and `n * k` negative energies.
///
/// Negative `i * k + j` is paired with positive `i`.
pub fn margin_ranking_loss(positive: &Tensor, negative: &Tensor, margin: f64) -> Result<Tensor> {
    let n = positive.dims1()?;
    let m = negative.dims1()?;
    if n == 0 || m == 0 {
        return Err(Error::BatchShape(format!(
            "need both positives and negatives, got {n} positives and {m} negatives"
        )));
    }
    if m % n != 0 {
        return Err(Error::BatchShape(format!(
            "{m} negatives cannot be split evenly over {n} positives"
        )));
    }
    let negative = negative.reshape((n, m / n))?;
    let positive = positive.unsqueeze(1)?;
    let hinge = (positive.broadcast_sub(&negative)? + margin)?.relu()?;
    Ok(hinge.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(v: &[f32], rows: usize) -> Tensor {
        Tensor::from_slice(v, (rows, v.len() / rows), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_exact_translation_is_zero() {
        let h = t(&[1.0, 0.0, 0.0], 1);
        let r = t(&[0.0, 1.0, 0.0], 1);
        let tail = t(&[1.0, 1.0, 0.0], 1);

        let l1 = energy(&h, &r, &tail, PNorm::L1).unwrap().to_vec1::<f32>().unwrap();
        let l2 = energy(&h, &r, &tail, PNorm::L2).unwrap().to_vec1::<f32>().unwrap();
        assert!(l1[0].abs() < 1e-6);
        assert!(l2[0].abs() < 1e-5);
    }

    #[test]
    fn test_l1_and_l2_values() {
        let h = t(&[0.0, 0.0], 1);
        let r = t(&[3.0, 0.0], 1);
        let tail = t(&[0.0, -4.0], 1);

        let l1 = energy(&h, &r, &tail, PNorm::L1).unwrap().to_vec1::<f32>().unwrap();
        let l2 = energy(&h, &r, &tail, PNorm::L2).unwrap().to_vec1::<f32>().unwrap();
        assert!((l1[0] - 7.0).abs() < 1e-5);
        assert!((l2[0] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_head_equals_tail_is_not_zero() {
        let x = t(&[0.5, -0.5], 1);
        let r = t(&[1.0, 1.0], 1);
        let e = energy(&x, &r, &x, PNorm::L1).unwrap().to_vec1::<f32>().unwrap();
        assert!((e[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_margin_loss_pairs_negatives_with_their_positive() {
        let device = Device::Cpu;
        let pos = Tensor::new(&[1.0f32, 4.0], &device).unwrap();
        // Positive 0 -> [2, 10], positive 1 -> [3, 4]
        let neg = Tensor::new(&[2.0f32, 10.0, 3.0, 4.0], &device).unwrap();
        let loss = margin_ranking_loss(&pos, &neg, 2.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // hinges: max(0, 2+1-2)=1, 0, max(0, 2+4-3)=3, max(0, 2+4-4)=2
        assert!((loss - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_margin_loss_rejects_single_class() {
        let device = Device::Cpu;
        let pos = Tensor::new(&[1.0f32], &device).unwrap();
        let empty = Tensor::zeros(0, candle_core::DType::F32, &device).unwrap();
        assert!(matches!(
            margin_ranking_loss(&pos, &empty, 1.0),
            Err(Error::BatchShape(_))
        ));
        assert!(matches!(
            margin_ranking_loss(&empty, &pos, 1.0),
            Err(Error::BatchShape(_))
        ));
    }

    #[test]
    fn test_margin_loss_rejects_uneven_ratio() {
        let device = Device::Cpu;
        let pos = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        let neg = Tensor::new(&[1.0f32, 2.0, 3.0], &device).unwrap();
        assert!(matches!(
            margin_ranking_loss(&pos, &neg, 1.0),
            Err(Error::BatchShape(_))
        ));
    }

    #[test]
    fn test_p_norm_from_usize() {
        assert_eq!(PNorm::try_from(1).unwrap(), PNorm::L1);
        assert_eq!(PNorm::try_from(2).unwrap(), PNorm::L2);
        assert!(PNorm::try_from(3).is_err());
    }
}
