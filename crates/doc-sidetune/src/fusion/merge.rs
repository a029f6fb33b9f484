//! The merge operator used by the side-tuning models.

use candle_core::Tensor;

use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// Smoothing constant inside the reported Euclidean distance.
///
/// The distance is reported as `sqrt(d² + ε) - sqrt(ε)`, which is exactly zero
/// for identical branches and keeps a finite gradient there.
pub const DISTANCE_EPS: f64 = 1e-12;

/// Result of a merge: the fused embedding plus per-branch distances.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// Fused embedding, same shape as the base branch `[batch, dim]`.
    pub merged: Tensor,
    /// One `[batch]` tensor per side branch: Euclidean distance to the base.
    pub distances: Vec<Tensor>,
}

/// Distance-aware convex blend of a base embedding with side embeddings.
///
/// Alphas are fixed at construction: one per side branch, each in `(0, 1)`.
/// Their sum may exceed 1; the base weight then goes negative for side
/// branches close to the base.
#[derive(Debug, Clone)]
pub struct FusionOperator {
    alphas: Vec<f64>,
}

impl FusionOperator {
    /// Create a fusion operator for `alphas.len() + 1` branches.
    ///
    /// # Errors
    ///
    /// - `SideTuneError::ConfigError` if `alphas` is empty or any alpha lies
    ///   outside `(0, 1)`
    pub fn new(alphas: Vec<f64>) -> SideTuneResult<Self> {
        if alphas.is_empty() {
            return Err(SideTuneError::config(
                "fusion needs at least one side-branch alpha",
            ));
        }
        for (i, &alpha) in alphas.iter().enumerate() {
            if !(alpha > 0.0 && alpha < 1.0) {
                return Err(SideTuneError::config(format!(
                    "alpha[{}] = {} must lie in (0, 1)",
                    i, alpha
                )));
            }
        }
        let total: f64 = alphas.iter().sum();
        if total > 1.0 {
            tracing::warn!(
                "Fusion alphas sum to {}, base weight is negative for near-identical branches",
                total
            );
        }
        Ok(Self { alphas })
    }

    /// Blend coefficients, one per side branch.
    #[inline]
    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Number of branches this operator merges (base included).
    #[inline]
    pub fn num_branches(&self) -> usize {
        self.alphas.len() + 1
    }

    /// Merge `[base, side_1, …, side_k]` into one embedding.
    pub fn merge(&self, branches: &[&Tensor]) -> SideTuneResult<Tensor> {
        Ok(self.merge_with_distances(branches)?.merged)
    }

    /// Merge `[base, side_1, …, side_k]` and report the per-sample distance of
    /// every side branch to the base.
    ///
    /// # Errors
    ///
    /// - `SideTuneError::DimensionMismatch` if the branch count does not match
    ///   the alphas or any side width differs from the base width
    /// - `SideTuneError::InvalidShape` if a branch is not `[batch, dim]` or the
    ///   batch sizes disagree
    pub fn merge_with_distances(&self, branches: &[&Tensor]) -> SideTuneResult<MergeOutput> {
        if branches.len() != self.num_branches() {
            return Err(SideTuneError::DimensionMismatch {
                context: "fusion branch count".to_string(),
                expected: self.num_branches(),
                got: branches.len(),
            });
        }
        let base = branches[0];
        let (batch, dim) = dims2(base, "fusion base branch")?;

        // alphas are never empty and the count matches, so branches[1] exists
        let (mut side_sum, mut weight_sum, first_distance) =
            side_term(base, branches[1], self.alphas[0], batch, dim, 1)?;
        let mut distances = Vec::with_capacity(self.alphas.len());
        distances.push(first_distance);

        for (i, (side, &alpha)) in branches[2..].iter().zip(&self.alphas[1..]).enumerate() {
            let (weighted, weight, distance) = side_term(base, side, alpha, batch, dim, i + 2)?;
            side_sum = side_sum.add(&weighted).map_err(map_candle("fusion side sum"))?;
            weight_sum = weight_sum.add(&weight).map_err(map_candle("fusion weight sum"))?;
            distances.push(distance);
        }

        let base_weight = weight_sum
            .affine(-1.0, 1.0)
            .map_err(map_candle("fusion base weight"))?;
        let merged = base
            .broadcast_mul(&base_weight)
            .and_then(|b| b.add(&side_sum))
            .map_err(map_candle("fusion merge"))?;

        Ok(MergeOutput { merged, distances })
    }
}

/// Weighted side embedding `[batch, dim]`, its weight `[batch, 1]` and the
/// reported distance `[batch]` for one side branch.
fn side_term(
    base: &Tensor,
    side: &Tensor,
    alpha: f64,
    batch: usize,
    dim: usize,
    index: usize,
) -> SideTuneResult<(Tensor, Tensor, Tensor)> {
    let (side_batch, side_dim) = dims2(side, "fusion side branch")?;
    if side_dim != dim {
        return Err(SideTuneError::DimensionMismatch {
            context: format!("fusion side branch {}", index),
            expected: dim,
            got: side_dim,
        });
    }
    if side_batch != batch {
        return Err(SideTuneError::InvalidShape {
            context: format!("fusion side branch {}", index),
            reason: format!("batch {} differs from base batch {}", side_batch, batch),
        });
    }

    // [batch, 1] squared distance
    let sq = base
        .sub(side)
        .and_then(|d| d.sqr())
        .and_then(|d| d.sum_keepdim(1))
        .map_err(map_candle("fusion squared distance"))?;

    let distance = sq
        .affine(1.0, DISTANCE_EPS)
        .and_then(|d| d.sqrt())
        .and_then(|d| d.affine(1.0, -DISTANCE_EPS.sqrt()))
        // f32 rounding can leave -1ulp at identity
        .and_then(|d| d.relu())
        .and_then(|d| d.squeeze(1))
        .map_err(map_candle("fusion distance"))?;

    let weight = sq
        .affine(-1.0 / dim as f64, 0.0)
        .and_then(|w| w.exp())
        .and_then(|w| w.affine(alpha, 0.0))
        .map_err(map_candle("fusion side weight"))?;

    let weighted = side
        .broadcast_mul(&weight)
        .map_err(map_candle("fusion weighted side"))?;
    Ok((weighted, weight, distance))
}

fn dims2(t: &Tensor, context: &str) -> SideTuneResult<(usize, usize)> {
    t.dims2().map_err(|_| SideTuneError::InvalidShape {
        context: context.to_string(),
        reason: format!("expected [batch, dim], got {:?}", t.dims()),
    })
}
