//! Build any classifier variant from a [`ModelConfig`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use super::{
    BranchConfig, ConcatNet, DocumentClassifier, ImageClassifier, SideTuneNet, TextClassifier,
};
use crate::encoders::{MobileNetConfig, TextCnnConfig};
use crate::error::{SideTuneError, SideTuneResult};
use crate::fusion::FusionOperator;

/// Which classifier to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Shared projection of every branch, concatenated.
    Concat,
    /// Distance-aware merge, linear head.
    Direct,
    /// Distance-aware merge, head with a hidden layer.
    Fc,
    /// Merge of base image and text only.
    TextSide,
    /// Fine-tuned MobileNetV2 alone.
    ImageOnly,
    /// Text encoder alone.
    TextOnly,
}

impl ModelVariant {
    pub fn all() -> [ModelVariant; 6] {
        [
            Self::Concat,
            Self::Direct,
            Self::Fc,
            Self::TextSide,
            Self::ImageOnly,
            Self::TextOnly,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concat => "concat",
            Self::Direct => "direct",
            Self::Fc => "fc",
            Self::TextSide => "text_side",
            Self::ImageOnly => "image_only",
            Self::TextOnly => "text_only",
        }
    }

    /// Alphas used when the configuration does not set any.
    pub fn default_alphas(&self) -> Vec<f64> {
        match self {
            Self::Direct | Self::Fc => vec![0.3, 0.3],
            Self::TextSide => vec![0.3],
            Self::Concat | Self::ImageOnly | Self::TextOnly => Vec::new(),
        }
    }

    /// Number of alphas the variant consumes.
    pub fn num_alphas(&self) -> usize {
        self.default_alphas().len()
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = SideTuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        Self::all()
            .into_iter()
            .find(|v| v.as_str() == normalized)
            .ok_or_else(|| {
                SideTuneError::config(format!(
                    "unknown model variant '{}', expected one of {:?}",
                    s,
                    Self::all().map(|v| v.as_str())
                ))
            })
    }
}

/// Model section of the experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_variant")]
    pub variant: ModelVariant,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Blend coefficients; `None` uses [`ModelVariant::default_alphas`].
    #[serde(default)]
    pub alphas: Option<Vec<f64>>,

    /// Dropout before every final linear layer.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Hidden width of the `fc` head.
    #[serde(default = "default_side_fc")]
    pub side_fc: usize,

    /// Shared projection width of the `concat` variant.
    #[serde(default = "default_concat_dim")]
    pub concat_dim: usize,

    #[serde(default)]
    pub image: MobileNetConfig,

    #[serde(default)]
    pub text: TextCnnConfig,

    /// Pretrained MobileNetV2 safetensors loaded into every image backbone.
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
}

fn default_variant() -> ModelVariant {
    ModelVariant::Fc
}

fn default_num_classes() -> usize {
    10
}

fn default_dropout() -> f32 {
    0.5
}

fn default_side_fc() -> usize {
    512
}

fn default_concat_dim() -> usize {
    128
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            variant: default_variant(),
            num_classes: default_num_classes(),
            alphas: None,
            dropout: default_dropout(),
            side_fc: default_side_fc(),
            concat_dim: default_concat_dim(),
            image: MobileNetConfig::default(),
            text: TextCnnConfig::default(),
            backbone_weights: None,
        }
    }
}

impl ModelConfig {
    /// Alphas the model will be built with.
    pub fn effective_alphas(&self) -> Vec<f64> {
        self.alphas
            .clone()
            .unwrap_or_else(|| self.variant.default_alphas())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// - `SideTuneError::ConfigError` for zero classes, a dropout outside
    ///   `[0, 1)`, alphas that do not fit the variant, or an invalid encoder
    ///   layout
    pub fn validate(&self) -> SideTuneResult<()> {
        if self.num_classes == 0 {
            return Err(SideTuneError::config("num_classes must be > 0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SideTuneError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.side_fc == 0 || self.concat_dim == 0 {
            return Err(SideTuneError::config("side_fc and concat_dim must be > 0"));
        }

        let alphas = self.effective_alphas();
        if alphas.len() != self.variant.num_alphas() {
            return Err(SideTuneError::config(format!(
                "variant '{}' takes {} alphas, got {}",
                self.variant,
                self.variant.num_alphas(),
                alphas.len()
            )));
        }
        if !alphas.is_empty() {
            FusionOperator::new(alphas)?;
        }

        self.image.validate()?;
        self.text.validate()
    }
}

/// Build the classifier described by `config` on `device`.
///
/// Loads `backbone_weights` into every image backbone when set.
pub fn build_classifier(
    config: &ModelConfig,
    device: &Device,
) -> SideTuneResult<Box<dyn DocumentClassifier>> {
    config.validate()?;

    let branches = BranchConfig::new(config.num_classes, config.image.clone(), config.text.clone())
        .with_dropout(config.dropout);
    let alphas = config.effective_alphas();
    let weights = config.backbone_weights.as_ref();

    let model: Box<dyn DocumentClassifier> = match config.variant {
        ModelVariant::Concat => {
            let mut net = ConcatNet::new(&branches, config.concat_dim, device)?;
            if let Some(path) = weights {
                net.load_backbone_weights(path)?;
            }
            Box::new(net)
        }
        ModelVariant::Direct | ModelVariant::Fc | ModelVariant::TextSide => {
            let mut net = match config.variant {
                ModelVariant::Direct => SideTuneNet::direct(&branches, alphas, device)?,
                ModelVariant::Fc => SideTuneNet::fc(&branches, alphas, config.side_fc, device)?,
                _ => SideTuneNet::text_side(&branches, alphas, device)?,
            };
            if let Some(path) = weights {
                net.load_backbone_weights(path)?;
            }
            Box::new(net)
        }
        ModelVariant::ImageOnly => {
            let mut net =
                ImageClassifier::new(config.image.clone(), config.num_classes, config.dropout, device)?;
            if let Some(path) = weights {
                net.load_backbone_weights(path)?;
            }
            Box::new(net)
        }
        ModelVariant::TextOnly => {
            let text = TextCnnConfig {
                dropout: config.dropout,
                ..config.text.clone()
            };
            Box::new(TextClassifier::new(text, config.num_classes, device)?)
        }
    };

    tracing::info!(
        "Built {} classifier: {} classes, {} trainable parameters",
        model.name(),
        model.num_classes(),
        model.num_trainable_params()?
    );
    Ok(model)
}
