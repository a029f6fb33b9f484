//! MobileNetV2 feature extractor.
//!
//! # Architecture
//!
//! ```text
//! Input: [batch, 3, H, W]
//!        |
//!   [ConvBnReLU6 3x3, stride 2] ----> features.0
//!        |
//!   [InvertedResidual x N] ---------> features.1 .. features.N
//!        |   expand 1x1 -> depthwise 3x3 -> project 1x1 (+ skip)
//!        v
//!   [ConvBnReLU6 1x1] --------------> features.N+1 (last_channel)
//!        |
//!   [Spatial mean] -----------------> [batch, last_channel]
//!        |
//!   [Dropout -> Linear] (optional) -> [batch, num_classes]
//! ```
//!
//! Parameter names mirror the torchvision layout so pretrained weights
//! converted to safetensors load with [`MobileNetV2::load_pretrained`].

use std::path::Path;

use candle_core::{DType, Device, Module, ModuleT, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder,
    VarMap,
};
use serde::{Deserialize, Serialize};

use super::{varmap_named_vars, ClassificationHead, Encoder};
use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// MobileNetV2 layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileNetConfig {
    /// Channel multiplier applied to every stage.
    #[serde(default = "default_width_mult")]
    pub width_mult: f64,

    /// Channel counts are rounded to a multiple of this value.
    #[serde(default = "default_round_nearest")]
    pub round_nearest: usize,

    /// Input image channels.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Output channels of the stem convolution (before `width_mult`).
    #[serde(default = "default_stem_channels")]
    pub stem_channels: usize,

    /// Inverted residual stages as `[expand_ratio, channels, repeats, stride]`.
    #[serde(default = "default_stages")]
    pub stages: Vec<[usize; 4]>,

    /// Width of the final 1x1 convolution, i.e. the embedding width.
    #[serde(default = "default_last_channel")]
    pub last_channel: usize,
}

fn default_width_mult() -> f64 {
    1.0
}

fn default_round_nearest() -> usize {
    8
}

fn default_in_channels() -> usize {
    3
}

fn default_stem_channels() -> usize {
    32
}

fn default_stages() -> Vec<[usize; 4]> {
    vec![
        [1, 16, 1, 1],
        [6, 24, 2, 2],
        [6, 32, 3, 2],
        [6, 64, 4, 2],
        [6, 96, 3, 1],
        [6, 160, 3, 2],
        [6, 320, 1, 1],
    ]
}

fn default_last_channel() -> usize {
    1280
}

impl Default for MobileNetConfig {
    fn default() -> Self {
        Self {
            width_mult: default_width_mult(),
            round_nearest: default_round_nearest(),
            in_channels: default_in_channels(),
            stem_channels: default_stem_channels(),
            stages: default_stages(),
            last_channel: default_last_channel(),
        }
    }
}

impl MobileNetConfig {
    /// A two-stage network for tests and smoke runs on CPU.
    pub fn tiny() -> Self {
        Self {
            width_mult: 1.0,
            round_nearest: 4,
            in_channels: 3,
            stem_channels: 8,
            stages: vec![[1, 8, 1, 1], [2, 12, 2, 2]],
            last_channel: 16,
        }
    }

    /// Embedding width after rounding.
    pub fn output_dim(&self) -> usize {
        make_divisible(
            self.last_channel as f64 * self.width_mult.max(1.0),
            self.round_nearest,
        )
    }

    /// Validate the layout.
    ///
    /// # Errors
    /// - `SideTuneError::ConfigError` for a non-positive multiplier, an empty
    ///   stage table or a zero entry in it
    pub fn validate(&self) -> SideTuneResult<()> {
        if !(self.width_mult > 0.0) {
            return Err(SideTuneError::config("width_mult must be positive"));
        }
        if self.round_nearest == 0 || self.in_channels == 0 || self.stem_channels == 0 {
            return Err(SideTuneError::config(
                "round_nearest, in_channels and stem_channels must be non-zero",
            ));
        }
        if self.stages.is_empty() {
            return Err(SideTuneError::config("MobileNetV2 needs at least one stage"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.iter().any(|&v| v == 0) {
                return Err(SideTuneError::config(format!(
                    "stage {} has a zero entry: {:?}",
                    i, stage
                )));
            }
        }
        if self.last_channel == 0 {
            return Err(SideTuneError::config("last_channel must be non-zero"));
        }
        Ok(())
    }
}

/// Round `v` to the nearest multiple of `divisor`, never going below 90% of `v`.
fn make_divisible(v: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut new_v = (((v + d / 2.0) / d).floor() * d).max(d);
    if new_v < 0.9 * v {
        new_v += d;
    }
    new_v as usize
}

/// Conv -> BatchNorm -> ReLU6.
#[derive(Debug, Clone)]
struct ConvBnAct {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnAct {
    fn new(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            groups,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, vb.pp("0"))?;
        let bn = batch_norm(out_c, BatchNormConfig::default(), vb.pp("1"))?;
        Ok(Self { conv, bn })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.bn.forward_t(&x, train)?.clamp(0f32, 6f32)
    }
}

/// Expand -> depthwise -> linear projection, with a skip when shapes allow.
#[derive(Debug, Clone)]
struct InvertedResidual {
    expand: Option<ConvBnAct>,
    depthwise: ConvBnAct,
    project: Conv2d,
    project_bn: BatchNorm,
    use_residual: bool,
}

impl InvertedResidual {
    fn new(
        in_c: usize,
        out_c: usize,
        stride: usize,
        expand_ratio: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let hidden = in_c * expand_ratio;
        let vb = vb.pp("conv");
        let mut idx = 0usize;

        let expand = if expand_ratio != 1 {
            let layer = ConvBnAct::new(in_c, hidden, 1, 1, 1, vb.pp(idx.to_string()))?;
            idx += 1;
            Some(layer)
        } else {
            None
        };

        let depthwise = ConvBnAct::new(hidden, hidden, 3, stride, hidden, vb.pp(idx.to_string()))?;
        idx += 1;

        let project = conv2d_no_bias(
            hidden,
            out_c,
            1,
            Conv2dConfig::default(),
            vb.pp(idx.to_string()),
        )?;
        idx += 1;
        let project_bn = batch_norm(out_c, BatchNormConfig::default(), vb.pp(idx.to_string()))?;

        Ok(Self {
            expand,
            depthwise,
            project,
            project_bn,
            use_residual: stride == 1 && in_c == out_c,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut h = match &self.expand {
            Some(expand) => expand.forward_t(x, train)?,
            None => x.clone(),
        };
        h = self.depthwise.forward_t(&h, train)?;
        h = self.project.forward(&h)?;
        h = self.project_bn.forward_t(&h, train)?;
        if self.use_residual {
            h.add(x)
        } else {
            Ok(h)
        }
    }
}

/// MobileNetV2 image backbone.
///
/// `embed` returns the spatially averaged output of the feature stage;
/// `forward` additionally applies the classification head when one was
/// requested at construction.
pub struct MobileNetV2 {
    config: MobileNetConfig,
    varmap: VarMap,
    stem: ConvBnAct,
    blocks: Vec<InvertedResidual>,
    last: ConvBnAct,
    head: Option<ClassificationHead>,
    output_dim: usize,
    trainable: bool,
}

impl MobileNetV2 {
    /// Build a randomly initialized backbone without a classification head.
    pub fn new(config: MobileNetConfig, trainable: bool, device: &Device) -> SideTuneResult<Self> {
        Self::build(config, trainable, None, device)
    }

    /// Build a backbone with a `Dropout -> Linear(num_classes)` head.
    pub fn with_classifier(
        config: MobileNetConfig,
        trainable: bool,
        num_classes: usize,
        dropout_prob: f32,
        device: &Device,
    ) -> SideTuneResult<Self> {
        Self::build(config, trainable, Some((num_classes, dropout_prob)), device)
    }

    fn build(
        config: MobileNetConfig,
        trainable: bool,
        head: Option<(usize, f32)>,
        device: &Device,
    ) -> SideTuneResult<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let features = vb.pp("features");

        let mut in_c = make_divisible(
            config.stem_channels as f64 * config.width_mult,
            config.round_nearest,
        );
        let output_dim = config.output_dim();

        let stem = ConvBnAct::new(config.in_channels, in_c, 3, 2, 1, features.pp("0"))
            .map_err(map_candle("MobileNetV2 stem"))?;

        let mut blocks = Vec::new();
        let mut idx = 1usize;
        for &[t, c, n, s] in &config.stages {
            let out_c = make_divisible(c as f64 * config.width_mult, config.round_nearest);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                let block = InvertedResidual::new(in_c, out_c, stride, t, features.pp(idx.to_string()))
                    .map_err(map_candle("MobileNetV2 inverted residual"))?;
                blocks.push(block);
                in_c = out_c;
                idx += 1;
            }
        }

        let last = ConvBnAct::new(in_c, output_dim, 1, 1, 1, features.pp(idx.to_string()))
            .map_err(map_candle("MobileNetV2 last conv"))?;

        let head = match head {
            Some((num_classes, dropout_prob)) => Some(ClassificationHead::new(
                output_dim,
                num_classes,
                dropout_prob,
                vb.pp("classifier"),
            )?),
            None => None,
        };

        tracing::debug!(
            "MobileNetV2 built: {} blocks, embedding dim {}, trainable={}, head={}",
            blocks.len(),
            output_dim,
            trainable,
            head.is_some()
        );

        Ok(Self {
            config,
            varmap,
            stem,
            blocks,
            last,
            head,
            output_dim,
            trainable,
        })
    }

    /// Overwrite the feature-stage weights with a pretrained safetensors
    /// checkpoint.
    ///
    /// Every `features.*` parameter of this network must be present in the
    /// file with a matching shape. Classifier weights are left untouched, so
    /// a checkpoint trained on a different label set still loads.
    pub fn load_pretrained(&mut self, path: impl AsRef<Path>) -> SideTuneResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SideTuneError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("pretrained weights not found at {}", path.display()),
            )));
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(map_candle("MobileNetV2 pretrained load"))?;

        let vars = self.varmap.data().lock().map_err(|_| SideTuneError::TensorError {
            message: "MobileNetV2 varmap lock poisoned".to_string(),
        })?;
        let mut loaded = 0usize;
        for (name, var) in vars.iter().filter(|(n, _)| n.starts_with("features.")) {
            let saved = tensors.get(name).ok_or_else(|| SideTuneError::ConfigError {
                message: format!("'{}' missing from {}", name, path.display()),
            })?;
            if saved.dims() != var.as_tensor().dims() {
                return Err(SideTuneError::InvalidShape {
                    context: format!("pretrained tensor '{}'", name),
                    reason: format!(
                        "file has {:?}, network has {:?}",
                        saved.dims(),
                        var.as_tensor().dims()
                    ),
                });
            }
            let saved = saved
                .to_dtype(var.dtype())
                .and_then(|t| t.to_device(var.device()))
                .map_err(map_candle("MobileNetV2 pretrained load"))?;
            var.set(&saved).map_err(map_candle("MobileNetV2 pretrained load"))?;
            loaded += 1;
        }
        tracing::info!(
            "Loaded {} MobileNetV2 tensors from {}",
            loaded,
            path.display()
        );
        Ok(())
    }

    /// Layout this network was built from.
    pub fn config(&self) -> &MobileNetConfig {
        &self.config
    }

    /// Whether a classification head is attached.
    pub fn has_classifier(&self) -> bool {
        self.head.is_some()
    }

    /// Embedding (no head) or logits (with head).
    pub fn forward(&self, images: &Tensor, train: bool) -> SideTuneResult<Tensor> {
        let embedding = self.embed(images, train)?;
        match &self.head {
            Some(head) => head.forward(&embedding, train && self.trainable),
            None => Ok(embedding),
        }
    }
}

impl Encoder for MobileNetV2 {
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn embed(&self, images: &Tensor, train: bool) -> SideTuneResult<Tensor> {
        let (_, channels, _, _) = images.dims4().map_err(|_| SideTuneError::InvalidShape {
            context: "MobileNetV2 input".to_string(),
            reason: format!("expected [batch, channels, H, W], got {:?}", images.dims()),
        })?;
        if channels != self.config.in_channels {
            return Err(SideTuneError::DimensionMismatch {
                context: "MobileNetV2 input channels".to_string(),
                expected: self.config.in_channels,
                got: channels,
            });
        }

        let train = train && self.trainable;
        let mut x = self
            .stem
            .forward_t(images, train)
            .map_err(map_candle("MobileNetV2 stem"))?;
        for block in &self.blocks {
            x = block
                .forward_t(&x, train)
                .map_err(map_candle("MobileNetV2 block"))?;
        }
        let x = self
            .last
            .forward_t(&x, train)
            .map_err(map_candle("MobileNetV2 last conv"))?;
        let pooled = x.mean((2, 3)).map_err(map_candle("MobileNetV2 pooling"))?;

        if self.trainable {
            Ok(pooled)
        } else {
            Ok(pooled.detach())
        }
    }

    fn named_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        varmap_named_vars(&self.varmap, "mobilenet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(batch: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch, 3, 16, 16), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_make_divisible_matches_reference_rounding() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(1280.0, 8), 1280);
        assert_eq!(make_divisible(24.0 * 0.75, 8), 24);
        assert_eq!(make_divisible(3.0, 8), 8);
    }

    #[test]
    fn test_default_config_embedding_dim() {
        assert_eq!(MobileNetConfig::default().output_dim(), 1280);
        assert_eq!(MobileNetConfig::tiny().output_dim(), 16);
    }

    #[test]
    fn test_embed_produces_pooled_features() {
        let net = MobileNetV2::new(MobileNetConfig::tiny(), true, &Device::Cpu).unwrap();
        let emb = net.embed(&images(2), false).unwrap();
        assert_eq!(emb.dims(), &[2, 16]);
        assert_eq!(net.output_dim(), 16);
    }

    #[test]
    fn test_classifier_head_outputs_logits() {
        let net =
            MobileNetV2::with_classifier(MobileNetConfig::tiny(), true, 5, 0.2, &Device::Cpu)
                .unwrap();
        assert!(net.has_classifier());
        assert_eq!(net.forward(&images(3), true).unwrap().dims(), &[3, 5]);
        // embed always skips the head
        assert_eq!(net.embed(&images(3), false).unwrap().dims(), &[3, 16]);
    }

    #[test]
    fn test_frozen_backbone_exposes_no_trainable_vars() {
        let frozen = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        assert!(frozen.trainable_vars().unwrap().is_empty());
        assert!(!frozen.named_vars().unwrap().is_empty());

        let side = MobileNetV2::new(MobileNetConfig::tiny(), true, &Device::Cpu).unwrap();
        assert_eq!(
            side.trainable_vars().unwrap().len(),
            side.named_vars().unwrap().len()
        );
    }

    #[test]
    fn test_frozen_backbone_ignores_train_flag() {
        let frozen = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        let x = images(2);
        let a = frozen.embed(&x, true).unwrap().to_vec2::<f32>().unwrap();
        let b = frozen.embed(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let net = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        let gray = Tensor::zeros((1, 1, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            net.embed(&gray, false),
            Err(SideTuneError::DimensionMismatch { expected: 3, got: 1, .. })
        ));
    }

    #[test]
    fn test_parameter_names_follow_feature_layout() {
        let net = MobileNetV2::new(MobileNetConfig::tiny(), true, &Device::Cpu).unwrap();
        let names: Vec<String> = net.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"mobilenet.features.0.0.weight".to_string()));
        assert!(names.contains(&"mobilenet.features.0.1.running_mean".to_string()));
        // stage 2 has expand ratio 2, so its first block has an expand conv
        assert!(names.contains(&"mobilenet.features.2.conv.0.0.weight".to_string()));
        assert!(names.contains(&"mobilenet.features.4.0.weight".to_string()));
    }

    #[test]
    fn test_load_pretrained_missing_file() {
        let mut net = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        assert!(matches!(
            net.load_pretrained("/nonexistent/mobilenet.safetensors"),
            Err(SideTuneError::IoError(_))
        ));
    }

    #[test]
    fn test_load_pretrained_skips_classifier() {
        let source = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone.safetensors");
        source.varmap.save(&path).unwrap();

        let mut target =
            MobileNetV2::with_classifier(MobileNetConfig::tiny(), true, 3, 0.2, &Device::Cpu)
                .unwrap();
        target.load_pretrained(&path).unwrap();

        let x = images(2);
        let a = source.embed(&x, false).unwrap().to_vec2::<f32>().unwrap();
        let b = target.embed(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_pretrained_rejects_other_layout() {
        let source = MobileNetV2::new(MobileNetConfig::tiny(), false, &Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone.safetensors");
        source.varmap.save(&path).unwrap();

        let wider = MobileNetConfig {
            last_channel: 32,
            ..MobileNetConfig::tiny()
        };
        let mut target = MobileNetV2::new(wider, false, &Device::Cpu).unwrap();
        assert!(matches!(
            target.load_pretrained(&path),
            Err(SideTuneError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MobileNetConfig {
            stages: vec![],
            ..MobileNetConfig::tiny()
        };
        assert!(MobileNetV2::new(config, true, &Device::Cpu).is_err());
    }
}
