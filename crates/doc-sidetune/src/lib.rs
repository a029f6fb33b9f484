//! Multimodal side-tuning for document image classification.
//!
//! A frozen pretrained image backbone is blended with trainable side
//! networks (a second image network and a convolutional text encoder over
//! OCR embeddings). The blend weight of every side branch shrinks with its
//! distance from the base embedding, see [`FusionOperator`].
//!
//! # Architecture
//!
//! - **Encoders**: [`MobileNetV2`] image backbone, [`TextCnnEncoder`]
//! - **Models**: [`DocumentClassifier`] implementations for every fusion
//!   variant plus single-modality baselines, built by [`build_classifier`]
//! - **Training**: [`TrainingPipeline`] runs the epoch loop, keeps the best
//!   validation snapshot and tests with it
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use doc_sidetune::FusionOperator;
//!
//! let device = Device::Cpu;
//! let fusion = FusionOperator::new(vec![0.3])?;
//! let base = Tensor::ones((2, 4), candle_core::DType::F32, &device)?;
//! let side = Tensor::zeros((2, 4), candle_core::DType::F32, &device)?;
//! let merged = fusion.merge(&[&base, &side])?;
//! assert_eq!(merged.dims(), &[2, 4]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod encoders;
pub mod error;
pub mod fusion;
pub mod models;
pub mod seed;
pub mod training;

pub use config::ExperimentConfig;
pub use encoders::{Encoder, MobileNetConfig, MobileNetV2, TextCnnConfig, TextCnnEncoder};
pub use error::{SideTuneError, SideTuneResult};
pub use fusion::{FusionOperator, MergeOutput};
pub use models::{
    build_classifier, ConcatNet, DocumentClassifier, ImageClassifier, ModelConfig, ModelOutput,
    ModelVariant, SideTuneNet, TextClassifier,
};
pub use seed::{draw_seeds, seed_everything};
pub use training::{
    run_experiment, BatchLoader, ClassWeighting, ConfusionMatrix, DocumentDataLoader,
    DocumentDataset, DocumentSample, InMemoryDataset, OptimizerConfig, RunResult, TrainingConfig,
    TrainingPipeline,
};
