//! Dropout + linear classification heads.

use candle_core::{Module, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// Classification head: `Dropout -> Linear` with an optional hidden layer
/// (`Dropout -> Linear -> Dropout -> Linear`).
///
/// Parameter names follow a sequential layout (`1.weight`, `3.weight`) so a
/// head saved elsewhere with the same layout loads unchanged. The hidden
/// layer has no activation: it is a plain capacity dial.
#[derive(Debug, Clone)]
pub struct ClassificationHead {
    dropout: Dropout,
    hidden: Option<Linear>,
    output: Linear,
    in_dim: usize,
    num_classes: usize,
}

impl ClassificationHead {
    /// Single-layer head `in_dim -> num_classes`.
    pub fn new(
        in_dim: usize,
        num_classes: usize,
        dropout_prob: f32,
        vb: VarBuilder,
    ) -> SideTuneResult<Self> {
        Self::build(in_dim, None, num_classes, dropout_prob, vb)
    }

    /// Two-layer head `in_dim -> hidden_dim -> num_classes`.
    pub fn with_hidden(
        in_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        dropout_prob: f32,
        vb: VarBuilder,
    ) -> SideTuneResult<Self> {
        Self::build(in_dim, Some(hidden_dim), num_classes, dropout_prob, vb)
    }

    fn build(
        in_dim: usize,
        hidden_dim: Option<usize>,
        num_classes: usize,
        dropout_prob: f32,
        vb: VarBuilder,
    ) -> SideTuneResult<Self> {
        if num_classes == 0 {
            return Err(SideTuneError::config("classification head needs at least one class"));
        }
        if !(0.0..1.0).contains(&dropout_prob) {
            return Err(SideTuneError::config(format!(
                "dropout probability {} must lie in [0, 1)",
                dropout_prob
            )));
        }

        let (hidden, output) = match hidden_dim {
            Some(h) => {
                let hidden = linear(in_dim, h, vb.pp("1")).map_err(map_candle("head hidden layer"))?;
                let output =
                    linear(h, num_classes, vb.pp("3")).map_err(map_candle("head output layer"))?;
                (Some(hidden), output)
            }
            None => {
                let output = linear(in_dim, num_classes, vb.pp("1"))
                    .map_err(map_candle("head output layer"))?;
                (None, output)
            }
        };

        Ok(Self {
            dropout: Dropout::new(dropout_prob),
            hidden,
            output,
            in_dim,
            num_classes,
        })
    }

    /// Expected input width.
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Number of output logits.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Map `[batch, in_dim]` embeddings to `[batch, num_classes]` logits.
    pub fn forward(&self, x: &Tensor, train: bool) -> SideTuneResult<Tensor> {
        let width = x.dims().last().copied().unwrap_or(0);
        if width != self.in_dim {
            return Err(SideTuneError::DimensionMismatch {
                context: "classification head input".to_string(),
                expected: self.in_dim,
                got: width,
            });
        }

        let mut x = self
            .dropout
            .forward(x, train)
            .map_err(map_candle("head dropout"))?;
        if let Some(hidden) = &self.hidden {
            x = hidden.forward(&x).map_err(map_candle("head hidden layer"))?;
            x = self
                .dropout
                .forward(&x, train)
                .map_err(map_candle("head dropout"))?;
        }
        self.output
            .forward(&x)
            .map_err(map_candle("head output layer"))
    }
}
