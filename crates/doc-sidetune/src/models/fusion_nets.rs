//! Image + text fusion classifiers around a frozen MobileNetV2 base.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use super::{collect_vars, DocumentClassifier, ModelOutput};
use crate::encoders::{
    varmap_named_vars, ClassificationHead, Encoder, MobileNetConfig, MobileNetV2, TextCnnConfig,
    TextCnnEncoder,
};
use crate::error::{map_candle, SideTuneError, SideTuneResult};
use crate::fusion::FusionOperator;

/// Branch layout shared by every fusion variant.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub num_classes: usize,
    pub image: MobileNetConfig,
    pub text: TextCnnConfig,
    /// Dropout before every final linear layer.
    pub dropout: f32,
}

impl BranchConfig {
    pub fn new(num_classes: usize, image: MobileNetConfig, text: TextCnnConfig) -> Self {
        Self {
            num_classes,
            image,
            text,
            dropout: 0.2,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }
}

/// The three encoders every fusion variant starts from.
struct Branches {
    base: MobileNetV2,
    side_image: Option<MobileNetV2>,
    side_text: TextCnnEncoder,
}

impl Branches {
    fn build(config: &BranchConfig, with_side_image: bool, device: &Device) -> SideTuneResult<Self> {
        if config.num_classes == 0 {
            return Err(SideTuneError::config("fusion model needs at least one class"));
        }
        let base = MobileNetV2::new(config.image.clone(), false, device)?;
        let side_image = if with_side_image {
            Some(MobileNetV2::new(config.image.clone(), true, device)?)
        } else {
            None
        };
        let side_text = TextCnnEncoder::new(config.text.clone(), true, device)?;
        Ok(Self {
            base,
            side_image,
            side_text,
        })
    }

    /// Load the same pretrained weights into the base and side image backbones.
    fn load_backbone_weights(&mut self, path: &Path) -> SideTuneResult<()> {
        self.base.load_pretrained(path)?;
        if let Some(side) = self.side_image.as_mut() {
            side.load_pretrained(path)?;
        }
        Ok(())
    }

    fn check_batch(images: &Tensor, texts: &Tensor) -> SideTuneResult<()> {
        let image_batch = images.dims().first().copied().unwrap_or(0);
        let text_batch = texts.dims().first().copied().unwrap_or(0);
        if image_batch != text_batch {
            return Err(SideTuneError::InvalidShape {
                context: "fusion model input".to_string(),
                reason: format!(
                    "image batch {} differs from text batch {}",
                    image_batch, text_batch
                ),
            });
        }
        Ok(())
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        let mut parts = vec![self.base.trainable_vars()?];
        if let Some(side) = &self.side_image {
            parts.push(
                side.trainable_vars()?
                    .into_iter()
                    .map(|(n, v)| (format!("side_image.{}", n), v))
                    .collect(),
            );
        }
        parts.push(
            self.side_text
                .trainable_vars()?
                .into_iter()
                .map(|(n, v)| (format!("side_text.{}", n), v))
                .collect(),
        );
        Ok(collect_vars(parts))
    }
}

fn linear_layer(in_dim: usize, out_dim: usize, vb: VarBuilder, what: &'static str) -> SideTuneResult<Linear> {
    linear(in_dim, out_dim, vb).map_err(map_candle(what))
}

/// Side-tuned classifier that blends its branches with a [`FusionOperator`].
///
/// The text embedding is projected to the backbone width, then
/// `[base_image, side_image?, side_text]` is merged and classified.
pub struct SideTuneNet {
    name: &'static str,
    num_classes: usize,
    branches: Branches,
    fusion_vars: VarMap,
    text_projection: Linear,
    fusion: FusionOperator,
    head: ClassificationHead,
}

impl SideTuneNet {
    /// Merge image and text side branches, classify the merged embedding directly.
    pub fn direct(config: &BranchConfig, alphas: Vec<f64>, device: &Device) -> SideTuneResult<Self> {
        Self::build("fusion-direct", config, alphas, true, None, device)
    }

    /// Like [`SideTuneNet::direct`] with a hidden layer of `side_fc` units in the head.
    pub fn fc(
        config: &BranchConfig,
        alphas: Vec<f64>,
        side_fc: usize,
        device: &Device,
    ) -> SideTuneResult<Self> {
        if side_fc == 0 {
            return Err(SideTuneError::config("side_fc must be non-zero"));
        }
        Self::build("fusion-fc", config, alphas, true, Some(side_fc), device)
    }

    /// Merge only the base image and the text side branch (one alpha).
    pub fn text_side(config: &BranchConfig, alphas: Vec<f64>, device: &Device) -> SideTuneResult<Self> {
        Self::build("text-side", config, alphas, false, None, device)
    }

    fn build(
        name: &'static str,
        config: &BranchConfig,
        alphas: Vec<f64>,
        with_side_image: bool,
        side_fc: Option<usize>,
        device: &Device,
    ) -> SideTuneResult<Self> {
        let fusion = FusionOperator::new(alphas)?;
        let expected_sides = if with_side_image { 2 } else { 1 };
        if fusion.num_branches() != expected_sides + 1 {
            return Err(SideTuneError::config(format!(
                "{} merges {} side branches but got {} alphas",
                name,
                expected_sides,
                fusion.alphas().len()
            )));
        }

        let branches = Branches::build(config, with_side_image, device)?;
        let dim = branches.base.output_dim();

        let fusion_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&fusion_vars, DType::F32, device);
        let text_projection = linear_layer(
            branches.side_text.output_dim(),
            dim,
            vb.pp("fc1fus"),
            "text projection",
        )?;
        let head = match side_fc {
            Some(hidden) => ClassificationHead::with_hidden(
                dim,
                hidden,
                config.num_classes,
                config.dropout,
                vb.pp("classifier"),
            )?,
            None => ClassificationHead::new(dim, config.num_classes, config.dropout, vb.pp("classifier"))?,
        };

        Ok(Self {
            name,
            num_classes: config.num_classes,
            branches,
            fusion_vars,
            text_projection,
            fusion,
            head,
        })
    }

    /// Load pretrained MobileNetV2 weights into every image backbone.
    pub fn load_backbone_weights(&mut self, path: impl AsRef<Path>) -> SideTuneResult<()> {
        self.branches.load_backbone_weights(path.as_ref())
    }

    pub fn fusion(&self) -> &FusionOperator {
        &self.fusion
    }
}

impl DocumentClassifier for SideTuneNet {
    fn name(&self) -> &str {
        self.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_t(&self, images: &Tensor, texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput> {
        Branches::check_batch(images, texts)?;

        let base = self.branches.base.embed(images, train)?;
        let side_image = match &self.branches.side_image {
            Some(side) => Some(side.embed(images, train)?),
            None => None,
        };
        let text = self.branches.side_text.embed(texts, train)?;
        let text = self
            .text_projection
            .forward(&text)
            .map_err(map_candle("text projection"))?;

        let mut branches: Vec<&Tensor> = vec![&base];
        if let Some(side) = &side_image {
            branches.push(side);
        }
        branches.push(&text);

        let merged = self.fusion.merge_with_distances(&branches)?;
        let logits = self.head.forward(&merged.merged, train)?;
        Ok(ModelOutput {
            logits,
            distances: merged.distances,
        })
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        Ok(collect_vars(vec![
            self.branches.trainable_vars()?,
            varmap_named_vars(&self.fusion_vars, "fusion")?,
        ]))
    }
}

/// Concatenation baseline: every branch goes through one shared projection
/// to `concat_dim` (the text branch is first lifted to the backbone width),
/// then the three projections are concatenated and classified.
pub struct ConcatNet {
    num_classes: usize,
    branches: Branches,
    fusion_vars: VarMap,
    text_projection: Linear,
    shared_projection: Linear,
    head: ClassificationHead,
}

impl ConcatNet {
    pub fn new(config: &BranchConfig, concat_dim: usize, device: &Device) -> SideTuneResult<Self> {
        if concat_dim == 0 {
            return Err(SideTuneError::config("concat_dim must be non-zero"));
        }
        let branches = Branches::build(config, true, device)?;
        let dim = branches.base.output_dim();

        let fusion_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&fusion_vars, DType::F32, device);
        let text_projection = linear_layer(
            branches.side_text.output_dim(),
            dim,
            vb.pp("fc1fus"),
            "text projection",
        )?;
        let shared_projection = linear_layer(dim, concat_dim, vb.pp("fc2fus"), "shared projection")?;
        let head = ClassificationHead::new(
            concat_dim * 3,
            config.num_classes,
            config.dropout,
            vb.pp("classifier"),
        )?;

        Ok(Self {
            num_classes: config.num_classes,
            branches,
            fusion_vars,
            text_projection,
            shared_projection,
            head,
        })
    }

    pub fn load_backbone_weights(&mut self, path: impl AsRef<Path>) -> SideTuneResult<()> {
        self.branches.load_backbone_weights(path.as_ref())
    }

    fn project(&self, x: &Tensor) -> SideTuneResult<Tensor> {
        self.shared_projection
            .forward(x)
            .map_err(map_candle("shared projection"))
    }
}

impl DocumentClassifier for ConcatNet {
    fn name(&self) -> &str {
        "fusion-concat"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_t(&self, images: &Tensor, texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput> {
        Branches::check_batch(images, texts)?;

        let base = self.project(&self.branches.base.embed(images, train)?)?;
        let side_image = match &self.branches.side_image {
            Some(side) => self.project(&side.embed(images, train)?)?,
            None => {
                return Err(SideTuneError::config("concat model requires a side image branch"))
            }
        };
        let text = self.branches.side_text.embed(texts, train)?;
        let text = self
            .text_projection
            .forward(&text)
            .map_err(map_candle("text projection"))?;
        let text = self.project(&text)?;

        let joined =
            Tensor::cat(&[&base, &side_image, &text], 1).map_err(map_candle("concat branches"))?;
        let logits = self.head.forward(&joined, train)?;
        Ok(ModelOutput::logits_only(logits))
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        Ok(collect_vars(vec![
            self.branches.trainable_vars()?,
            varmap_named_vars(&self.fusion_vars, "fusion")?,
        ]))
    }
}
