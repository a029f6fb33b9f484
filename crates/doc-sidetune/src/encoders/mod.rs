//! Branch encoders for the side-tuning models.
//!
//! # Components
//!
//! - [`Encoder`]: capability every branch exposes: `embed(input) -> [batch, dim]`
//!   plus the parameters it wants the optimizer to see
//! - [`MobileNetV2`]: image backbone (pooled feature stage)
//! - [`TextCnnEncoder`]: multi-window convolutional text encoder
//! - [`ClassificationHead`]: dropout + linear head shared by encoders and models
//!
//! Trainability is fixed when an encoder is built. A frozen encoder reports no
//! trainable parameters, runs in inference mode and detaches its output, so
//! the optimizer never sees or touches its weights.

mod head;
mod mobilenet;
mod text_cnn;

pub use head::ClassificationHead;
pub use mobilenet::{MobileNetConfig, MobileNetV2};
pub use text_cnn::{TextCnnConfig, TextCnnEncoder};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{SideTuneError, SideTuneResult};

/// A branch network that turns a batch of inputs into fixed-width embeddings.
pub trait Encoder {
    /// Width of the embeddings produced by [`Encoder::embed`].
    fn output_dim(&self) -> usize;

    /// Whether the optimizer may update this encoder's parameters.
    fn is_trainable(&self) -> bool;

    /// Embed a batch. `train` enables dropout and batch statistics; it is
    /// ignored by frozen encoders.
    fn embed(&self, input: &Tensor, train: bool) -> SideTuneResult<Tensor>;

    /// Every parameter owned by the encoder, sorted by name.
    fn named_vars(&self) -> SideTuneResult<Vec<(String, Var)>>;

    /// Parameters the optimizer should register: empty for frozen encoders.
    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        if self.is_trainable() {
            self.named_vars()
        } else {
            Ok(Vec::new())
        }
    }
}

/// Snapshot the variables of a `VarMap` as `(prefix.name, var)` pairs, sorted
/// by name so that ordering is stable across calls.
pub(crate) fn varmap_named_vars(
    varmap: &VarMap,
    prefix: &str,
) -> SideTuneResult<Vec<(String, Var)>> {
    let data = varmap.data().lock().map_err(|e| SideTuneError::TensorError {
        message: format!("VarMap lock poisoned for '{}': {}", prefix, e),
    })?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (format!("{}.{}", prefix, name), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Total number of scalar parameters in a list of variables.
pub fn count_params(vars: &[(String, Var)]) -> usize {
    vars.iter()
        .map(|(_, v)| v.as_tensor().shape().elem_count())
        .sum()
}
