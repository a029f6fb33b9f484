//! Training and evaluation of document classifiers.
//!
//! # Components
//!
//! - `data`: dataset contract, seeded splits, batch loader
//! - `loss`: class weighting and weighted cross-entropy
//! - `optimizer`: Adam and SGD with momentum, per-epoch LR schedule
//! - `metrics`: confusion matrix
//! - `snapshot`: deep-copy parameter snapshots, best-model tracking
//! - `pipeline`: the epoch loop and full experiment runner

pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod snapshot;

pub use data::{
    random_split, BatchLoader, DocumentBatch, DocumentDataLoader, DocumentDataset,
    DocumentSample, InMemoryDataset,
};
pub use loss::{class_counts, validate_labels, ClassWeighting, WeightedCrossEntropy};
pub use metrics::ConfusionMatrix;
pub use optimizer::{Adam, AdamConfig, LrSchedule, Optimizer, OptimizerConfig, SgdMomentum};
pub use pipeline::{
    run_experiment, save_run_result, EpochRecord, EvaluationPass, PipelinePhase, RunResult,
    TrainingConfig, TrainingPipeline,
};
pub use snapshot::{BestModelTracker, ParamSnapshot};
