//! Cross-entropy with optional per-class weights.
//!
//! Class weights come from the training split's label distribution:
//! 1. `none`: every class weighs 1
//! 2. `min`: `min_count / count`, down-weighting majority classes
//! 3. `max`: `max_count / count`, which up-weights every class relative to
//!    the largest one and is kept as an ablation mode

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// How to derive class weights from the training labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeighting {
    #[default]
    None,
    Min,
    Max,
}

impl ClassWeighting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Per-class weights for `targets`, or `None` in `none` mode.
    ///
    /// # Errors
    /// - `LabelOutOfRange` if a target is not below `num_classes`
    /// - `ConfigError` if a class never occurs (its weight would be infinite)
    pub fn compute(&self, targets: &[u32], num_classes: usize) -> SideTuneResult<Option<Vec<f32>>> {
        let counts = class_counts(targets, num_classes)?;
        if *self == Self::None {
            return Ok(None);
        }
        if let Some(missing) = counts.iter().position(|&c| c == 0) {
            return Err(SideTuneError::config(format!(
                "class {} has no training samples, cannot compute '{}' class weights",
                missing,
                self.as_str()
            )));
        }

        let reference = match self {
            Self::Min => counts.iter().copied().min(),
            _ => counts.iter().copied().max(),
        }
        .unwrap_or(1) as f32;

        Ok(Some(counts.iter().map(|&c| reference / c as f32).collect()))
    }
}

impl fmt::Display for ClassWeighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassWeighting {
    type Err = SideTuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(SideTuneError::config(format!(
                "unknown class weighting '{}', expected none, min or max",
                other
            ))),
        }
    }
}

/// Samples per class.
pub fn class_counts(targets: &[u32], num_classes: usize) -> SideTuneResult<Vec<usize>> {
    let mut counts = vec![0usize; num_classes];
    for &label in targets {
        let slot = counts
            .get_mut(label as usize)
            .ok_or(SideTuneError::LabelOutOfRange {
                label: label as i64,
                num_classes,
            })?;
        *slot += 1;
    }
    Ok(counts)
}

/// Fail on the first label outside `[0, num_classes)`.
pub fn validate_labels(labels: &[u32], num_classes: usize) -> SideTuneResult<()> {
    match labels.iter().find(|&&l| l as usize >= num_classes) {
        Some(&label) => Err(SideTuneError::LabelOutOfRange {
            label: label as i64,
            num_classes,
        }),
        None => Ok(()),
    }
}

/// `-sum_i w[y_i] * log p_i[y_i] / sum_i w[y_i]`, or the plain mean when
/// unweighted.
pub struct WeightedCrossEntropy {
    num_classes: usize,
    weights: Option<Tensor>,
}

impl WeightedCrossEntropy {
    pub fn new(num_classes: usize, weights: Option<Vec<f32>>, device: &Device) -> SideTuneResult<Self> {
        let weights = match weights {
            Some(w) => {
                if w.len() != num_classes {
                    return Err(SideTuneError::DimensionMismatch {
                        context: "class weight vector".to_string(),
                        expected: num_classes,
                        got: w.len(),
                    });
                }
                Some(Tensor::new(w.as_slice(), device).map_err(map_candle("class weights"))?)
            }
            None => None,
        };
        Ok(Self {
            num_classes,
            weights,
        })
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    /// Scalar loss for `[batch, num_classes]` logits and `[batch]` u32 labels.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> SideTuneResult<Tensor> {
        let (batch, classes) = logits.dims2().map_err(|_| SideTuneError::InvalidShape {
            context: "cross-entropy logits".to_string(),
            reason: format!("expected [batch, num_classes], got {:?}", logits.dims()),
        })?;
        if classes != self.num_classes {
            return Err(SideTuneError::DimensionMismatch {
                context: "cross-entropy logits".to_string(),
                expected: self.num_classes,
                got: classes,
            });
        }
        if batch == 0 {
            return Err(SideTuneError::EmptyInput {
                context: "cross-entropy batch".to_string(),
            });
        }

        let host_labels = labels
            .to_vec1::<u32>()
            .map_err(map_candle("cross-entropy labels"))?;
        if host_labels.len() != batch {
            return Err(SideTuneError::InvalidShape {
                context: "cross-entropy labels".to_string(),
                reason: format!("{} labels for {} logits rows", host_labels.len(), batch),
            });
        }
        validate_labels(&host_labels, self.num_classes)?;

        let ctx = map_candle("cross-entropy");
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1).map_err(&ctx)?;
        let picked = labels
            .unsqueeze(1)
            .and_then(|idx| log_probs.gather(&idx, 1))
            .and_then(|p| p.squeeze(1))
            .map_err(&ctx)?;

        match &self.weights {
            Some(weights) => {
                let w = weights.index_select(labels, 0).map_err(&ctx)?;
                let numerator = picked.mul(&w).and_then(|t| t.sum_all()).map_err(&ctx)?;
                let denominator = w.sum_all().map_err(&ctx)?;
                numerator
                    .div(&denominator)
                    .and_then(|t| t.neg())
                    .map_err(&ctx)
            }
            None => picked.mean_all().and_then(|t| t.neg()).map_err(&ctx),
        }
    }
}
