//! Multi-window convolutional text encoder.
//!
//! Each window size `w` gets its own 1-D convolution spanning `w` tokens and
//! the full embedding width. The per-window feature maps go through ReLU,
//! are max-pooled over the sequence and concatenated, giving an embedding
//! of width `num_filters * windows.len()`.

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{conv1d, embedding, Conv1d, Conv1dConfig, Embedding, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::{varmap_named_vars, ClassificationHead, Encoder};
use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// Text encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCnnConfig {
    /// Width of each token embedding.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Feature maps per window.
    #[serde(default = "default_num_filters")]
    pub num_filters: usize,

    /// Convolution window sizes in tokens.
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,

    /// Dropout before the classification head.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Take token ids and look them up in an internal table instead of
    /// taking precomputed embeddings.
    #[serde(default)]
    pub custom_embedding: bool,

    /// Size of the lookup table when `custom_embedding` is set.
    #[serde(default)]
    pub vocab_size: usize,
}

fn default_embedding_dim() -> usize {
    300
}

fn default_num_filters() -> usize {
    512
}

fn default_windows() -> Vec<usize> {
    vec![3, 4, 5]
}

fn default_dropout() -> f32 {
    0.2
}

impl Default for TextCnnConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            num_filters: default_num_filters(),
            windows: default_windows(),
            dropout: default_dropout(),
            custom_embedding: false,
            vocab_size: 0,
        }
    }
}

impl TextCnnConfig {
    /// Small encoder for tests.
    pub fn tiny(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            num_filters: 4,
            windows: vec![2, 3],
            ..Default::default()
        }
    }

    /// Embedding width produced by the encoder.
    pub fn output_dim(&self) -> usize {
        self.num_filters * self.windows.len()
    }

    /// Shortest sequence the widest window can slide over.
    pub fn min_sequence_len(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(1)
    }

    pub fn validate(&self) -> SideTuneResult<()> {
        if self.embedding_dim == 0 || self.num_filters == 0 {
            return Err(SideTuneError::config(
                "embedding_dim and num_filters must be non-zero",
            ));
        }
        if self.windows.is_empty() || self.windows.contains(&0) {
            return Err(SideTuneError::config(format!(
                "windows must be non-empty and positive, got {:?}",
                self.windows
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SideTuneError::config(format!(
                "text dropout {} must lie in [0, 1)",
                self.dropout
            )));
        }
        if self.custom_embedding && self.vocab_size == 0 {
            return Err(SideTuneError::config(
                "custom_embedding requires a non-zero vocab_size",
            ));
        }
        Ok(())
    }
}

/// Convolutional text encoder over token embeddings.
pub struct TextCnnEncoder {
    config: TextCnnConfig,
    varmap: VarMap,
    lookup: Option<Embedding>,
    convs: Vec<Conv1d>,
    head: Option<ClassificationHead>,
    trainable: bool,
}

impl TextCnnEncoder {
    /// Encoder returning raw embeddings.
    pub fn new(config: TextCnnConfig, trainable: bool, device: &Device) -> SideTuneResult<Self> {
        Self::build(config, trainable, None, device)
    }

    /// Encoder with a `Dropout -> Linear(num_classes)` head.
    pub fn with_classifier(
        config: TextCnnConfig,
        trainable: bool,
        num_classes: usize,
        device: &Device,
    ) -> SideTuneResult<Self> {
        Self::build(config, trainable, Some(num_classes), device)
    }

    fn build(
        config: TextCnnConfig,
        trainable: bool,
        num_classes: Option<usize>,
        device: &Device,
    ) -> SideTuneResult<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let lookup = if config.custom_embedding {
            Some(
                embedding(config.vocab_size, config.embedding_dim, vb.pp("embedding"))
                    .map_err(map_candle("text embedding table"))?,
            )
        } else {
            None
        };

        let convs = config
            .windows
            .iter()
            .enumerate()
            .map(|(i, &window)| {
                conv1d(
                    config.embedding_dim,
                    config.num_filters,
                    window,
                    Conv1dConfig::default(),
                    vb.pp(format!("convs.{}", i)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_candle("text convolutions"))?;

        let head = match num_classes {
            Some(n) => Some(ClassificationHead::new(
                config.output_dim(),
                n,
                config.dropout,
                vb.pp("classifier"),
            )?),
            None => None,
        };

        Ok(Self {
            config,
            varmap,
            lookup,
            convs,
            head,
            trainable,
        })
    }

    pub fn config(&self) -> &TextCnnConfig {
        &self.config
    }

    /// Embedding (no head) or logits (with head).
    pub fn forward(&self, input: &Tensor, train: bool) -> SideTuneResult<Tensor> {
        let embedding = self.embed(input, train)?;
        match &self.head {
            Some(head) => head.forward(&embedding, train && self.trainable),
            None => Ok(embedding),
        }
    }

    /// Resolve the input to `[batch, seq_len, embedding_dim]` floats.
    fn token_embeddings(&self, input: &Tensor) -> SideTuneResult<Tensor> {
        match &self.lookup {
            Some(table) => {
                if input.dtype().is_float() {
                    return Err(SideTuneError::InvalidShape {
                        context: "text encoder token ids".to_string(),
                        reason: format!("expected integer ids, got {:?}", input.dtype()),
                    });
                }
                if input.rank() != 2 {
                    return Err(SideTuneError::InvalidShape {
                        context: "text encoder token ids".to_string(),
                        reason: format!("expected [batch, seq_len], got {:?}", input.dims()),
                    });
                }
                table
                    .forward(input)
                    .map_err(map_candle("text embedding lookup"))
            }
            None => Ok(input.clone()),
        }
    }
}

impl Encoder for TextCnnEncoder {
    fn output_dim(&self) -> usize {
        self.config.output_dim()
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn embed(&self, input: &Tensor, _train: bool) -> SideTuneResult<Tensor> {
        let x = self.token_embeddings(input)?;
        let (_, seq_len, width) = x.dims3().map_err(|_| SideTuneError::InvalidShape {
            context: "text encoder input".to_string(),
            reason: format!("expected [batch, seq_len, embedding_dim], got {:?}", x.dims()),
        })?;
        if width != self.config.embedding_dim {
            return Err(SideTuneError::DimensionMismatch {
                context: "text encoder embedding width".to_string(),
                expected: self.config.embedding_dim,
                got: width,
            });
        }
        let min_len = self.config.min_sequence_len();
        if seq_len < min_len {
            return Err(SideTuneError::InvalidShape {
                context: "text encoder input".to_string(),
                reason: format!(
                    "sequence length {} is shorter than the widest window {}",
                    seq_len, min_len
                ),
            });
        }

        // [batch, seq, dim] -> [batch, dim, seq] for conv1d
        let x = x
            .transpose(1, 2)
            .and_then(|t| t.contiguous())
            .map_err(map_candle("text encoder transpose"))?;

        let mut pooled = Vec::with_capacity(self.convs.len());
        for conv in &self.convs {
            let h = conv
                .forward(&x)
                .and_then(|h| h.relu())
                .and_then(|h| h.max(D::Minus1))
                .map_err(map_candle("text encoder window"))?;
            pooled.push(h);
        }
        let out = Tensor::cat(&pooled, 1).map_err(map_candle("text encoder concat"))?;

        if self.trainable {
            Ok(out)
        } else {
            Ok(out.detach())
        }
    }

    fn named_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        varmap_named_vars(&self.varmap, "text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(batch: usize, seq: usize, dim: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch, seq, dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_dim_is_filters_times_windows() {
        assert_eq!(TextCnnConfig::default().output_dim(), 1536);
        let enc = TextCnnEncoder::new(TextCnnConfig::tiny(6), true, &Device::Cpu).unwrap();
        assert_eq!(enc.output_dim(), 8);
        assert_eq!(enc.embed(&tokens(3, 10, 6), true).unwrap().dims(), &[3, 8]);
    }

    #[test]
    fn test_pooled_features_are_non_negative() {
        let enc = TextCnnEncoder::new(TextCnnConfig::tiny(6), true, &Device::Cpu).unwrap();
        let out = enc.embed(&tokens(2, 7, 6), false).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_embed_concatenates_window_maxima_in_order() {
        let enc = TextCnnEncoder::new(TextCnnConfig::tiny(6), true, &Device::Cpu).unwrap();
        let input = tokens(2, 7, 6);
        let out = enc.embed(&input, false).unwrap().to_vec2::<f32>().unwrap();

        let x = input.transpose(1, 2).unwrap().contiguous().unwrap();
        let pooled: Vec<Tensor> = enc
            .convs
            .iter()
            .map(|conv| conv.forward(&x).unwrap().relu().unwrap().max(D::Minus1).unwrap())
            .collect();
        let expected = Tensor::cat(&pooled, 1).unwrap().to_vec2::<f32>().unwrap();
        for (row, want) in out.iter().zip(&expected) {
            for (a, b) in row.iter().zip(want) {
                assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
            }
        }

        // first block of columns belongs to the first window, recomputed by hand
        let conv = &enc.convs[0];
        let weight = conv.weight().to_vec3::<f32>().unwrap();
        let bias = conv.bias().unwrap().to_vec1::<f32>().unwrap();
        let docs = input.to_vec3::<f32>().unwrap();
        let width = weight[0][0].len();
        for (b, doc) in docs.iter().enumerate() {
            for (f, kernel) in weight.iter().enumerate() {
                let best = (0..=doc.len() - width)
                    .map(|t| {
                        let mut acc = bias[f];
                        for (c, taps) in kernel.iter().enumerate() {
                            for (j, w) in taps.iter().enumerate() {
                                acc += w * doc[t + j][c];
                            }
                        }
                        acc.max(0.0)
                    })
                    .fold(f32::MIN, f32::max);
                assert!((out[b][f] - best).abs() < 1e-5, "{} vs {}", out[b][f], best);
            }
        }
    }

    #[test]
    fn test_wrong_embedding_width_is_rejected() {
        let enc = TextCnnEncoder::new(TextCnnConfig::tiny(6), true, &Device::Cpu).unwrap();
        assert!(matches!(
            enc.embed(&tokens(2, 7, 5), false),
            Err(SideTuneError::DimensionMismatch { expected: 6, got: 5, .. })
        ));
    }

    #[test]
    fn test_short_sequence_is_rejected() {
        let enc = TextCnnEncoder::new(TextCnnConfig::tiny(6), true, &Device::Cpu).unwrap();
        assert!(matches!(
            enc.embed(&tokens(2, 2, 6), false),
            Err(SideTuneError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_custom_embedding_takes_token_ids() {
        let config = TextCnnConfig {
            custom_embedding: true,
            vocab_size: 20,
            ..TextCnnConfig::tiny(6)
        };
        let enc = TextCnnEncoder::new(config, true, &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[1u32, 4, 7, 2], [0, 19, 3, 3]], &Device::Cpu).unwrap();
        assert_eq!(enc.embed(&ids, false).unwrap().dims(), &[2, 8]);

        let floats = tokens(2, 4, 6);
        assert!(enc.embed(&floats, false).is_err());
    }

    #[test]
    fn test_classifier_head_and_frozen_vars() {
        let enc =
            TextCnnEncoder::with_classifier(TextCnnConfig::tiny(6), false, 4, &Device::Cpu)
                .unwrap();
        assert_eq!(enc.forward(&tokens(2, 5, 6), true).unwrap().dims(), &[2, 4]);
        assert!(enc.trainable_vars().unwrap().is_empty());
        // two convs + head, weight and bias each
        assert_eq!(enc.named_vars().unwrap().len(), 6);
    }

    #[test]
    fn test_invalid_config() {
        let config = TextCnnConfig {
            windows: vec![],
            ..TextCnnConfig::default()
        };
        assert!(config.validate().is_err());
        let config = TextCnnConfig {
            custom_embedding: true,
            vocab_size: 0,
            ..TextCnnConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
