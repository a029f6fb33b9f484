//! End-to-end runs of every model variant on a small synthetic corpus.
//!
//! All networks use the tiny encoder layouts and run on the CPU.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use doc_sidetune::training::ParamSnapshot;
use doc_sidetune::{
    run_experiment, ClassWeighting, DocumentClassifier, DocumentDataset, DocumentSample,
    ExperimentConfig, MobileNetConfig, ModelConfig, ModelVariant, OptimizerConfig, SideTuneError,
    SideTuneResult, TextCnnConfig, TrainingConfig,
};

const IMAGE_SIZE: usize = 16;
const SEQ_LEN: usize = 5;
const TEXT_DIM: usize = 6;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("doc_sidetune=debug")
        .with_test_writer()
        .try_init();
}

/// Generates samples on demand; class 1 documents are brighter and their
/// text embeddings are shifted.
struct SyntheticCorpus {
    len: usize,
    classes: Vec<String>,
}

impl SyntheticCorpus {
    fn new(len: usize) -> Self {
        Self {
            len,
            classes: vec!["form".to_string(), "invoice".to_string()],
        }
    }

    fn label(index: usize) -> u32 {
        (index % 2) as u32
    }
}

impl DocumentDataset for SyntheticCorpus {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> SideTuneResult<DocumentSample> {
        if index >= self.len {
            return Err(SideTuneError::EmptyInput {
                context: format!("sample {} of {}", index, self.len),
            });
        }
        let label = Self::label(index);
        let shift = label as f64;
        let tensor_err = |e: candle_core::Error| SideTuneError::TensorError {
            message: e.to_string(),
        };
        let image = Tensor::randn(0f32, 1.0, (3, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu)
            .and_then(|t| t.affine(0.5, shift))
            .map_err(tensor_err)?;
        let text = Tensor::randn(0f32, 1.0, (SEQ_LEN, TEXT_DIM), &Device::Cpu)
            .and_then(|t| t.affine(0.5, -shift))
            .map_err(tensor_err)?;
        Ok(DocumentSample { image, text, label })
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn targets(&self) -> Vec<u32> {
        (0..self.len).map(Self::label).collect()
    }
}

fn experiment(variant: ModelVariant) -> ExperimentConfig {
    ExperimentConfig {
        model: ModelConfig {
            variant,
            num_classes: 2,
            side_fc: 8,
            concat_dim: 8,
            image: MobileNetConfig::tiny(),
            text: TextCnnConfig::tiny(TEXT_DIM),
            ..Default::default()
        },
        training: TrainingConfig {
            epochs: 2,
            seed: 7,
            train_batch_size: 4,
            val_batch_size: 3,
            test_batch_size: 5,
            ..Default::default()
        },
    }
}

const SPLITS: [usize; 3] = [12, 6, 6];

#[test]
fn test_every_variant_trains_and_tests() {
    init_tracing();
    let corpus = Arc::new(SyntheticCorpus::new(24));

    for variant in ModelVariant::all() {
        let result = run_experiment(&experiment(variant), Arc::clone(&corpus), SPLITS, &Device::Cpu)
            .unwrap_or_else(|e| panic!("{} failed: {}", variant, e));

        assert_eq!(result.history.len(), 2, "{}", variant);
        assert_eq!(result.history[0].num_batches, 3, "{}", variant);
        assert!(result.history.iter().all(|r| r.train_loss.is_finite()));
        assert_eq!(result.test_confusion.total(), 6, "{}", variant);
        assert!((0.0..=1.0).contains(&result.test_accuracy));

        let expected_branches = match variant {
            ModelVariant::Direct | ModelVariant::Fc => 2,
            ModelVariant::TextSide => 1,
            _ => 0,
        };
        assert_eq!(result.branch_distances.len(), expected_branches, "{}", variant);
        for branch in &result.branch_distances {
            assert_eq!(branch.len(), 6);
            assert!(branch.iter().all(|d| d.is_finite() && *d >= 0.0));
        }

        match result.best_epoch {
            Some(epoch) => {
                assert!(result.history[epoch as usize - 1].is_best);
                assert!(result.best_validation_accuracy > 0.0);
            }
            None => assert_eq!(result.best_validation_accuracy, 0.0),
        }
    }
}

#[test]
fn test_sgd_with_max_weighting() {
    init_tracing();
    let mut config = experiment(ModelVariant::Fc);
    config.training.optimizer = OptimizerConfig::sgd();
    config.training.class_weighting = ClassWeighting::Max;
    config.training.max_grad_norm = Some(5.0);

    let result = run_experiment(&config, Arc::new(SyntheticCorpus::new(24)), SPLITS, &Device::Cpu)
        .unwrap();

    let lrs: Vec<f64> = result.history.iter().map(|r| r.learning_rate).collect();
    assert!((lrs[0] - 0.01).abs() < 1e-12);
    assert!((lrs[1] - 0.01 * 0.5f64.sqrt()).abs() < 1e-12);

    let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(json["model"], "fusion-fc");
    assert_eq!(json["history"].as_array().unwrap().len(), 2);
}

#[test]
fn test_split_sizes_must_cover_dataset() {
    let err = run_experiment(
        &experiment(ModelVariant::Direct),
        Arc::new(SyntheticCorpus::new(24)),
        [12, 6, 5],
        &Device::Cpu,
    )
    .unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn test_trainable_parameters_checkpoint() {
    let config = experiment(ModelVariant::Direct);
    let model = doc_sidetune::build_classifier(&config.model, &Device::Cpu).unwrap();
    let vars = model.trainable_vars().unwrap();
    assert!(vars.iter().all(|(name, _)| !name.starts_with("base")));
    let scalars: usize = vars.iter().map(|(_, v)| v.as_tensor().elem_count()).sum();
    assert_eq!(model.num_trainable_params().unwrap(), scalars);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("best.safetensors");
    ParamSnapshot::capture(&vars).unwrap().save(&path).unwrap();

    let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
    assert_eq!(loaded.len(), vars.len());
    for (name, var) in &vars {
        assert_eq!(loaded[name].dims(), var.as_tensor().dims());
    }
}
