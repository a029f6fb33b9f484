//! Epoch loop: train, validate, keep the best snapshot, test.
//!
//! ```text
//! Idle -> Training(1) -> Validating(1) -> Training(2) -> ... -> Validating(N)
//!      -> Testing -> Done
//! ```
//!
//! Class weights are computed once from the training split before the first
//! epoch. The learning-rate schedule steps once per epoch. After the last
//! epoch the best validation snapshot is restored and the test split is
//! evaluated with it.

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Var, D};
use serde::{Deserialize, Serialize};

use super::data::{random_split, BatchLoader, DocumentDataLoader, DocumentDataset};
use super::loss::{ClassWeighting, WeightedCrossEntropy};
use super::metrics::ConfusionMatrix;
use super::optimizer::{Optimizer, OptimizerConfig};
use super::snapshot::BestModelTracker;
use crate::config::ExperimentConfig;
use crate::error::{map_candle, SideTuneError, SideTuneResult};
use crate::models::{build_classifier, DocumentClassifier};
use crate::seed::{draw_seeds, seed_everything};

/// Training section of the experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs (default: 100).
    #[serde(default = "default_epochs")]
    pub epochs: u32,

    /// Seed for weight init, splits and shuffling (default: 42).
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub class_weighting: ClassWeighting,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Training batch size (default: 16).
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,

    /// Validation batch size (default: 4).
    #[serde(default = "default_val_batch_size")]
    pub val_batch_size: usize,

    /// Test batch size (default: 32).
    #[serde(default = "default_test_batch_size")]
    pub test_batch_size: usize,

    /// Global gradient-norm clipping, off when unset.
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

fn default_epochs() -> u32 {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_train_batch_size() -> usize {
    16
}

fn default_val_batch_size() -> usize {
    4
}

fn default_test_batch_size() -> usize {
    32
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            class_weighting: ClassWeighting::default(),
            optimizer: OptimizerConfig::default(),
            train_batch_size: default_train_batch_size(),
            val_batch_size: default_val_batch_size(),
            test_batch_size: default_test_batch_size(),
            max_grad_norm: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> SideTuneResult<()> {
        if self.epochs == 0 {
            return Err(SideTuneError::config("epochs must be > 0"));
        }
        if self.train_batch_size == 0 || self.val_batch_size == 0 || self.test_batch_size == 0 {
            return Err(SideTuneError::config("batch sizes must be > 0"));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return Err(SideTuneError::config(format!(
                    "max_grad_norm must be > 0, got {}",
                    norm
                )));
            }
        }
        self.optimizer.validate()
    }
}

/// Where the pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelinePhase {
    Idle,
    Training(u32),
    Validating(u32),
    Testing,
    Done,
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: u32,
    /// Mean batch loss.
    pub train_loss: f32,
    pub learning_rate: f64,
    pub num_batches: usize,
    pub validation_accuracy: f64,
    /// Whether this epoch produced the new best snapshot.
    pub is_best: bool,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvaluationPass {
    pub confusion: ConfusionMatrix,
    /// Per side branch, the distance of every evaluated sample in pass order.
    pub branch_distances: Vec<Vec<f32>>,
}

impl EvaluationPass {
    pub fn accuracy(&self) -> f64 {
        self.confusion.accuracy()
    }
}

/// Output of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub model: String,
    pub best_validation_accuracy: f64,
    /// `None` when no epoch beat 0.0 accuracy; the test pass then used the
    /// final parameters.
    pub best_epoch: Option<u32>,
    pub test_accuracy: f64,
    pub test_confusion: ConfusionMatrix,
    /// Distances reported by the fusion operator on the test split, one
    /// list per side branch. Empty for variants that do not merge.
    pub branch_distances: Vec<Vec<f32>>,
    pub history: Vec<EpochRecord>,
}

impl RunResult {
    pub fn to_json(&self) -> SideTuneResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SideTuneError::config(format!(
            "Failed to serialize run result: {}",
            e
        )))
    }
}

/// Drives training and evaluation of one model.
///
/// The pipeline owns the model for the duration of the run; nothing else
/// may update its parameters concurrently.
pub struct TrainingPipeline<M: DocumentClassifier> {
    model: M,
    config: TrainingConfig,
    device: Device,
    phase: PipelinePhase,
}

impl<M: DocumentClassifier> TrainingPipeline<M> {
    pub fn new(model: M, config: TrainingConfig, device: Device) -> SideTuneResult<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            device,
            phase: PipelinePhase::Idle,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Train for `config.epochs`, then test with the best snapshot.
    ///
    /// # Errors
    /// - `EmptyInput` if any split is empty
    /// - `LabelOutOfRange` on the first out-of-range label in any split
    /// - `ConfigError` if the model has nothing to train or class weights
    ///   cannot be computed
    pub fn run(
        &mut self,
        train: &mut dyn BatchLoader,
        validation: &mut dyn BatchLoader,
        test: &mut dyn BatchLoader,
    ) -> SideTuneResult<RunResult> {
        for (name, loader) in [
            ("training split", &*train),
            ("validation split", &*validation),
            ("test split", &*test),
        ] {
            if loader.is_empty() {
                return Err(SideTuneError::EmptyInput {
                    context: name.to_string(),
                });
            }
        }

        let num_classes = self.model.num_classes();
        let weights = self
            .config
            .class_weighting
            .compute(&train.targets()?, num_classes)?;
        if let Some(w) = &weights {
            tracing::info!("Class weights ({}): {:?}", self.config.class_weighting, w);
        }
        let criterion = WeightedCrossEntropy::new(num_classes, weights, &self.device)?;

        let vars = self.model.trainable_vars()?;
        if vars.is_empty() {
            return Err(SideTuneError::config(format!(
                "model '{}' has no trainable parameters",
                self.model.name()
            )));
        }
        let mut optimizer = self.config.optimizer.build(
            vars.iter().map(|(_, v)| v.clone()).collect(),
            self.config.max_grad_norm,
        )?;
        let schedule = self.config.optimizer.schedule(self.config.epochs as usize);
        let base_lr = self.config.optimizer.base_lr();

        tracing::info!(
            "Training {} for {} epochs: {} train / {} val / {} test samples, {} trainable tensors, optimizer={}",
            self.model.name(),
            self.config.epochs,
            train.len(),
            validation.len(),
            test.len(),
            vars.len(),
            self.config.optimizer.name()
        );

        let mut tracker = BestModelTracker::new();
        let mut history = Vec::with_capacity(self.config.epochs as usize);

        for epoch in 1..=self.config.epochs {
            self.phase = PipelinePhase::Training(epoch);
            let lr = schedule.lr(base_lr, (epoch - 1) as usize);
            optimizer.set_learning_rate(lr);
            let (train_loss, num_batches) =
                self.train_epoch(train, &criterion, optimizer.as_mut())?;

            self.phase = PipelinePhase::Validating(epoch);
            let accuracy = self.evaluate(validation)?.accuracy();
            let is_best = tracker.observe(epoch, accuracy, &vars)?;

            tracing::info!(
                "Epoch {}/{}: loss={:.4} lr={:.2e} batches={} val_acc={:.4}{}",
                epoch,
                self.config.epochs,
                train_loss,
                lr,
                num_batches,
                accuracy,
                if is_best { " (best)" } else { "" }
            );

            history.push(EpochRecord {
                epoch,
                train_loss,
                learning_rate: lr,
                num_batches,
                validation_accuracy: accuracy,
                is_best,
            });
        }

        self.phase = PipelinePhase::Testing;
        if tracker.restore_best(&vars)? {
            tracing::info!(
                "Restored best snapshot from epoch {} (val_acc={:.4})",
                tracker.best_epoch().unwrap_or(0),
                tracker.best_accuracy()
            );
        } else {
            tracing::warn!("No epoch improved on 0.0 validation accuracy, testing final parameters");
        }
        let test_pass = self.evaluate(test)?;
        self.phase = PipelinePhase::Done;

        tracing::info!(
            "Test accuracy {:.4} ({} / {})",
            test_pass.accuracy(),
            test_pass.confusion.correct(),
            test_pass.confusion.total()
        );

        Ok(RunResult {
            model: self.model.name().to_string(),
            best_validation_accuracy: tracker.best_accuracy(),
            best_epoch: tracker.best_epoch(),
            test_accuracy: test_pass.accuracy(),
            test_confusion: test_pass.confusion,
            branch_distances: test_pass.branch_distances,
            history,
        })
    }

    /// One pass over the training split. Returns the mean loss and the
    /// number of batches.
    fn train_epoch(
        &self,
        loader: &mut dyn BatchLoader,
        criterion: &WeightedCrossEntropy,
        optimizer: &mut dyn Optimizer,
    ) -> SideTuneResult<(f32, usize)> {
        loader.start_epoch();
        let mut total_loss = 0.0f64;
        let mut num_batches = 0usize;

        while let Some(batch) = loader.next_batch()? {
            let output = self.model.forward_t(&batch.images, &batch.texts, true)?;
            let loss = criterion.forward(&output.logits, &batch.labels)?;
            let value: f32 = loss.to_scalar().map_err(map_candle("loss readback"))?;
            if !value.is_finite() {
                tracing::warn!("Non-finite loss {} at batch {}", value, num_batches);
            }
            optimizer.step(&loss)?;

            total_loss += value as f64;
            num_batches += 1;
            tracing::debug!("batch {}: loss={:.4} size={}", num_batches, value, batch.len());
        }

        if num_batches == 0 {
            return Err(SideTuneError::EmptyInput {
                context: "training epoch produced no batches".to_string(),
            });
        }
        Ok(((total_loss / num_batches as f64) as f32, num_batches))
    }

    /// Forward-only pass over a split into a fresh confusion matrix.
    pub fn evaluate(&self, loader: &mut dyn BatchLoader) -> SideTuneResult<EvaluationPass> {
        loader.start_epoch();
        let mut confusion = ConfusionMatrix::new(self.model.num_classes());
        let mut branch_distances: Vec<Vec<f32>> = Vec::new();

        while let Some(batch) = loader.next_batch()? {
            let output = self.model.forward_t(&batch.images, &batch.texts, false)?;
            let ctx = map_candle("evaluation readback");
            let predictions = output
                .logits
                .argmax(D::Minus1)
                .and_then(|p| p.to_vec1::<u32>())
                .map_err(&ctx)?;
            let targets = batch.labels.to_vec1::<u32>().map_err(&ctx)?;
            confusion.update(&targets, &predictions)?;

            if branch_distances.len() < output.distances.len() {
                branch_distances.resize_with(output.distances.len(), Vec::new);
            }
            for (slot, distances) in branch_distances.iter_mut().zip(&output.distances) {
                slot.extend(distances.to_vec1::<f32>().map_err(&ctx)?);
            }
        }

        if confusion.total() == 0 {
            return Err(SideTuneError::EmptyInput {
                context: "evaluation pass produced no samples".to_string(),
            });
        }
        Ok(EvaluationPass {
            confusion,
            branch_distances,
        })
    }

    /// Trainable parameters of the model, in snapshot order.
    pub fn trainable_vars(&self) -> SideTuneResult<Vec<(String, Var)>> {
        self.model.trainable_vars()
    }
}

/// Seed, split, build and train the model described by `config` on `dataset`.
///
/// `split_sizes` are the `[train, validation, test]` sample counts and must
/// add up to the dataset length. Only the training loader shuffles.
pub fn run_experiment<D: DocumentDataset>(
    config: &ExperimentConfig,
    dataset: Arc<D>,
    split_sizes: [usize; 3],
    device: &Device,
) -> SideTuneResult<RunResult> {
    config.validate()?;
    let training = &config.training;
    if dataset.classes().len() != config.model.num_classes {
        return Err(SideTuneError::DimensionMismatch {
            context: "dataset classes vs model num_classes".to_string(),
            expected: config.model.num_classes,
            got: dataset.classes().len(),
        });
    }

    let mut root = seed_everything(training.seed, device);
    let [split_seed, train_seed, val_seed, test_seed] = draw_seeds(&mut root);
    let mut splits = random_split(dataset.len(), &split_sizes, split_seed)?.into_iter();
    let mut next_split = || splits.next().unwrap_or_default();

    let mut train = DocumentDataLoader::new(
        Arc::clone(&dataset),
        next_split(),
        training.train_batch_size,
        true,
        train_seed,
        device.clone(),
    )?;
    let mut validation = DocumentDataLoader::new(
        Arc::clone(&dataset),
        next_split(),
        training.val_batch_size,
        false,
        val_seed,
        device.clone(),
    )?;
    let mut test = DocumentDataLoader::new(
        dataset,
        next_split(),
        training.test_batch_size,
        false,
        test_seed,
        device.clone(),
    )?;

    let model = build_classifier(&config.model, device)?;
    let mut pipeline = TrainingPipeline::new(model, training.clone(), device.clone())?;
    pipeline.run(&mut train, &mut validation, &mut test)
}

/// Write a run result as pretty JSON.
pub fn save_run_result(result: &RunResult, path: impl AsRef<Path>) -> SideTuneResult<()> {
    std::fs::write(path.as_ref(), result.to_json()?)?;
    Ok(())
}
