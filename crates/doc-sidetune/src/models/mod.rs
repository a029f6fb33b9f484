//! Document classifiers built from the branch encoders.
//!
//! # Variants
//!
//! | Variant | Branches | Fusion | Head |
//! |---------|----------|--------|------|
//! | [`ConcatNet`] | base image, side image, side text | shared projection + concat | dropout, linear |
//! | [`SideTuneNet::direct`] | base image, side image, side text | distance-aware merge | dropout, linear |
//! | [`SideTuneNet::fc`] | base image, side image, side text | distance-aware merge | dropout, linear, dropout, linear |
//! | [`SideTuneNet::text_side`] | base image, side text | distance-aware merge | dropout, linear |
//! | [`ImageClassifier`] | image | none | dropout, linear |
//! | [`TextClassifier`] | text | none | dropout, linear |
//!
//! The base image backbone is always frozen. Every other component is
//! trainable and contributes to [`DocumentClassifier::trainable_vars`].

mod baseline;
mod factory;
mod fusion_nets;

pub use baseline::{ImageClassifier, TextClassifier};
pub use factory::{build_classifier, ModelConfig, ModelVariant};
pub use fusion_nets::{BranchConfig, ConcatNet, SideTuneNet};

use candle_core::{Tensor, Var};

use crate::encoders::count_params;
use crate::error::SideTuneResult;

/// Forward pass result.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, num_classes]` logits.
    pub logits: Tensor,

    /// Per-sample `[batch]` distances of each side branch to the base, in
    /// branch order. Empty for variants that do not merge.
    pub distances: Vec<Tensor>,
}

impl ModelOutput {
    pub fn logits_only(logits: Tensor) -> Self {
        Self {
            logits,
            distances: Vec::new(),
        }
    }
}

/// A classifier over `(image_batch, text_batch)` pairs.
pub trait DocumentClassifier {
    /// Short identifier used in logs and results.
    fn name(&self) -> &str;

    fn num_classes(&self) -> usize;

    /// Run the model. `train` enables dropout and batch statistics in the
    /// trainable components.
    fn forward_t(&self, images: &Tensor, texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput>;

    /// Parameters the optimizer should update, sorted by name. Frozen
    /// components contribute nothing.
    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>>;

    /// Number of trainable scalars.
    fn num_trainable_params(&self) -> SideTuneResult<usize> {
        Ok(count_params(&self.trainable_vars()?))
    }
}

impl<M: DocumentClassifier + ?Sized> DocumentClassifier for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn forward_t(&self, images: &Tensor, texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput> {
        (**self).forward_t(images, texts, train)
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        (**self).trainable_vars()
    }
}

/// Merge several sorted var lists into one sorted list.
pub(crate) fn collect_vars(
    parts: Vec<Vec<(String, Var)>>,
) -> Vec<(String, Var)> {
    let mut vars: Vec<(String, Var)> = parts.into_iter().flatten().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}
