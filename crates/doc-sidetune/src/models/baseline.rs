//! Single-modality baselines: fine-tune the image backbone or the text encoder alone.

use std::path::Path;

use candle_core::{Device, Tensor, Var};

use super::{DocumentClassifier, ModelOutput};
use crate::encoders::{Encoder, MobileNetConfig, MobileNetV2, TextCnnConfig, TextCnnEncoder};
use crate::error::{SideTuneError, SideTuneResult};

/// Fully trainable MobileNetV2 with a classification head. Ignores text.
pub struct ImageClassifier {
    net: MobileNetV2,
    num_classes: usize,
}

impl ImageClassifier {
    pub fn new(
        config: MobileNetConfig,
        num_classes: usize,
        dropout: f32,
        device: &Device,
    ) -> SideTuneResult<Self> {
        if num_classes == 0 {
            return Err(SideTuneError::config("image classifier needs at least one class"));
        }
        let net = MobileNetV2::with_classifier(config, true, num_classes, dropout, device)?;
        Ok(Self { net, num_classes })
    }

    /// Load pretrained backbone weights. The classifier weights stay random
    /// unless the file carries them too.
    pub fn load_backbone_weights(&mut self, path: impl AsRef<Path>) -> SideTuneResult<()> {
        self.net.load_pretrained(path)
    }
}

impl DocumentClassifier for ImageClassifier {
    fn name(&self) -> &str {
        "image-only"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_t(&self, images: &Tensor, _texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput> {
        Ok(ModelOutput::logits_only(self.net.forward(images, train)?))
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        self.net.trainable_vars()
    }
}

/// Trainable text encoder with a classification head. Ignores images.
pub struct TextClassifier {
    net: TextCnnEncoder,
    num_classes: usize,
}

impl TextClassifier {
    pub fn new(
        config: TextCnnConfig,
        num_classes: usize,
        device: &Device,
    ) -> SideTuneResult<Self> {
        if num_classes == 0 {
            return Err(SideTuneError::config("text classifier needs at least one class"));
        }
        let net = TextCnnEncoder::with_classifier(config, true, num_classes, device)?;
        Ok(Self { net, num_classes })
    }
}

impl DocumentClassifier for TextClassifier {
    fn name(&self) -> &str {
        "text-only"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_t(&self, _images: &Tensor, texts: &Tensor, train: bool) -> SideTuneResult<ModelOutput> {
        Ok(ModelOutput::logits_only(self.net.forward(texts, train)?))
    }

    fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        self.net.trainable_vars()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_baseline_ignores_text() {
        let model = ImageClassifier::new(MobileNetConfig::tiny(), 4, 0.2, &Device::Cpu).unwrap();
        let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        let unused = Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = model.forward_t(&images, &unused, false).unwrap();
        assert_eq!(out.logits.dims(), &[2, 4]);
        assert!(model
            .trainable_vars()
            .unwrap()
            .iter()
            .any(|(n, _)| n == "mobilenet.classifier.1.weight"));
    }

    #[test]
    fn test_text_baseline_ignores_images() {
        let model = TextClassifier::new(TextCnnConfig::tiny(6), 4, &Device::Cpu).unwrap();
        let texts = Tensor::randn(0f32, 1.0, (3, 5, 6), &Device::Cpu).unwrap();
        let unused = Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = model.forward_t(&unused, &texts, true).unwrap();
        assert_eq!(out.logits.dims(), &[3, 4]);
        assert_eq!(model.name(), "text-only");
        assert!(model.num_trainable_params().unwrap() > 0);
    }

    #[test]
    fn test_zero_classes_rejected() {
        assert!(TextClassifier::new(TextCnnConfig::tiny(6), 0, &Device::Cpu).is_err());
    }
}
