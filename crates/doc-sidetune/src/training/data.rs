//! Dataset contract, splits and batch loading.
//!
//! A dataset yields `(image, text, label)` samples by index and exposes its
//! class names and per-sample targets. A loader walks an index subset of a
//! dataset in batches, reshuffling each epoch when asked to. The last batch
//! of an epoch may be smaller than `batch_size`.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::loss::validate_labels;
use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// One document: image `[channels, H, W]`, text `[seq_len, dim]` (or
/// `[seq_len]` token ids) and its class.
#[derive(Debug, Clone)]
pub struct DocumentSample {
    pub image: Tensor,
    pub text: Tensor,
    pub label: u32,
}

/// Indexed source of document samples.
pub trait DocumentDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> SideTuneResult<DocumentSample>;

    /// Class names, ordered by class index.
    fn classes(&self) -> &[String];

    /// Label of every sample, aligned with sample indices.
    fn targets(&self) -> Vec<u32>;
}

/// Dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Vec<DocumentSample>,
    classes: Vec<String>,
}

impl InMemoryDataset {
    /// # Errors
    /// - `LabelOutOfRange` if a sample's label has no class name
    pub fn new(samples: Vec<DocumentSample>, classes: Vec<String>) -> SideTuneResult<Self> {
        let labels: Vec<u32> = samples.iter().map(|s| s.label).collect();
        validate_labels(&labels, classes.len())?;
        Ok(Self { samples, classes })
    }

    pub fn samples(&self) -> &[DocumentSample] {
        &self.samples
    }
}

impl DocumentDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> SideTuneResult<DocumentSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| SideTuneError::InvalidShape {
                context: "dataset index".to_string(),
                reason: format!("index {} out of bounds for {} samples", index, self.samples.len()),
            })
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn targets(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

/// Shuffle `0..len` with `seed` and cut it into consecutive parts of the
/// given sizes. The sizes must add up to `len`.
pub fn random_split(len: usize, sizes: &[usize], seed: u64) -> SideTuneResult<Vec<Vec<usize>>> {
    let total: usize = sizes.iter().sum();
    if total != len {
        return Err(SideTuneError::DimensionMismatch {
            context: "random split sizes".to_string(),
            expected: len,
            got: total,
        });
    }

    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut parts = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for &size in sizes {
        parts.push(indices[start..start + size].to_vec());
        start += size;
    }
    Ok(parts)
}

/// A collated batch.
#[derive(Debug, Clone)]
pub struct DocumentBatch {
    /// `[batch, channels, H, W]`
    pub images: Tensor,
    /// `[batch, seq_len, dim]` or `[batch, seq_len]`
    pub texts: Tensor,
    /// `[batch]` u32 class indices
    pub labels: Tensor,
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
}

impl DocumentBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Stack samples into a batch on `device`.
    pub fn collate(
        samples: &[DocumentSample],
        indices: Vec<usize>,
        device: &Device,
    ) -> SideTuneResult<Self> {
        if samples.is_empty() {
            return Err(SideTuneError::EmptyInput {
                context: "batch collation".to_string(),
            });
        }
        let ctx = map_candle("batch collation");
        let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
        let texts: Vec<&Tensor> = samples.iter().map(|s| &s.text).collect();
        let labels: Vec<u32> = samples.iter().map(|s| s.label).collect();

        Ok(Self {
            images: Tensor::stack(&images, 0)
                .and_then(|t| t.to_device(device))
                .map_err(&ctx)?,
            texts: Tensor::stack(&texts, 0)
                .and_then(|t| t.to_device(device))
                .map_err(&ctx)?,
            labels: Tensor::new(labels.as_slice(), device).map_err(&ctx)?,
            indices,
        })
    }
}

/// Restartable source of batches for one split.
pub trait BatchLoader {
    /// Rewind to the start of the split (reshuffling if the loader shuffles).
    fn start_epoch(&mut self);

    /// Next batch of the current epoch, `None` once the split is exhausted.
    fn next_batch(&mut self) -> SideTuneResult<Option<DocumentBatch>>;

    /// Labels of every sample in the split.
    ///
    /// # Errors
    /// - `SideTuneError::InvalidShape` if the dataset has no label for a split index
    fn targets(&self) -> SideTuneResult<Vec<u32>>;

    /// Number of samples in the split.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_batches(&self) -> usize;
}

/// Batches over an index subset of a shared dataset.
pub struct DocumentDataLoader<D: DocumentDataset> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    order: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    position: usize,
    rng: StdRng,
    device: Device,
}

impl<D: DocumentDataset> DocumentDataLoader<D> {
    pub fn new(
        dataset: Arc<D>,
        indices: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: Device,
    ) -> SideTuneResult<Self> {
        if batch_size == 0 {
            return Err(SideTuneError::config("batch_size must be > 0"));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(SideTuneError::InvalidShape {
                context: "data loader indices".to_string(),
                reason: format!("index {} out of bounds for {} samples", bad, dataset.len()),
            });
        }
        Ok(Self {
            order: indices.clone(),
            dataset,
            indices,
            batch_size,
            shuffle,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
            device,
        })
    }

    /// Loader over the whole dataset.
    pub fn full(
        dataset: Arc<D>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: Device,
    ) -> SideTuneResult<Self> {
        let indices = (0..dataset.len()).collect();
        Self::new(dataset, indices, batch_size, shuffle, seed, device)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<D: DocumentDataset> BatchLoader for DocumentDataLoader<D> {
    fn start_epoch(&mut self) {
        self.order.clone_from(&self.indices);
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.position = 0;
    }

    fn next_batch(&mut self) -> SideTuneResult<Option<DocumentBatch>> {
        if self.position >= self.order.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch_indices = self.order[self.position..end].to_vec();
        self.position = end;

        let samples = batch_indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<SideTuneResult<Vec<_>>>()?;
        DocumentBatch::collate(&samples, batch_indices, &self.device).map(Some)
    }

    fn targets(&self) -> SideTuneResult<Vec<u32>> {
        let all = self.dataset.targets();
        self.indices
            .iter()
            .map(|&i| {
                all.get(i).copied().ok_or_else(|| SideTuneError::InvalidShape {
                    context: "dataset targets".to_string(),
                    reason: format!("no target for index {} ({} targets)", i, all.len()),
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn dataset(labels: &[u32]) -> Arc<InMemoryDataset> {
        let samples = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| DocumentSample {
                image: Tensor::full(i as f32, (3, 4, 4), &Device::Cpu).unwrap(),
                text: Tensor::zeros((5, 2), DType::F32, &Device::Cpu).unwrap(),
                label,
            })
            .collect();
        let classes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        Arc::new(InMemoryDataset::new(samples, classes).unwrap())
    }

    fn drain(loader: &mut impl BatchLoader) -> Vec<Vec<usize>> {
        loader.start_epoch();
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            out.push(batch.indices);
        }
        out
    }

    #[test]
    fn test_partial_final_batch_is_kept() {
        let data = dataset(&[0, 1, 2, 0, 1]);
        let mut loader = DocumentDataLoader::full(data, 2, false, 0, Device::Cpu).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn test_collated_shapes() {
        let data = dataset(&[0, 1, 2]);
        let mut loader = DocumentDataLoader::full(data, 3, false, 0, Device::Cpu).unwrap();
        loader.start_epoch();
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[3, 3, 4, 4]);
        assert_eq!(batch.texts.dims(), &[3, 5, 2]);
        assert_eq!(batch.labels.to_vec1::<u32>().unwrap(), vec![0, 1, 2]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_shuffle_is_seeded_and_restartable() {
        let labels = [0u32; 20];
        let mut a = DocumentDataLoader::full(dataset(&labels), 4, true, 7, Device::Cpu).unwrap();
        let mut b = DocumentDataLoader::full(dataset(&labels), 4, true, 7, Device::Cpu).unwrap();
        let first = drain(&mut a);
        assert_eq!(first, drain(&mut b));

        let mut seen: Vec<usize> = first.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        // next epoch reshuffles
        assert_ne!(drain(&mut a), first);
    }

    #[test]
    fn test_unshuffled_epochs_repeat() {
        let mut loader =
            DocumentDataLoader::full(dataset(&[0, 1, 2, 0]), 3, false, 0, Device::Cpu).unwrap();
        assert_eq!(drain(&mut loader), drain(&mut loader));
    }

    #[test]
    fn test_subset_targets() {
        let data = dataset(&[0, 1, 2, 1]);
        let loader = DocumentDataLoader::new(data, vec![3, 0], 2, false, 0, Device::Cpu).unwrap();
        assert_eq!(loader.targets().unwrap(), vec![1, 0]);
        assert_eq!(loader.len(), 2);
    }

    /// Reports fewer labels than samples.
    struct ShortTargets(Arc<InMemoryDataset>);

    impl DocumentDataset for ShortTargets {
        fn len(&self) -> usize {
            self.0.len()
        }

        fn get(&self, index: usize) -> SideTuneResult<DocumentSample> {
            self.0.get(index)
        }

        fn classes(&self) -> &[String] {
            self.0.classes()
        }

        fn targets(&self) -> Vec<u32> {
            let mut all = self.0.targets();
            all.truncate(2);
            all
        }
    }

    #[test]
    fn test_targets_shorter_than_dataset_is_an_error() {
        let data = Arc::new(ShortTargets(dataset(&[0, 1, 2, 1])));
        let loader = DocumentDataLoader::new(data, vec![1, 3], 2, false, 0, Device::Cpu).unwrap();
        match loader.targets().unwrap_err() {
            SideTuneError::InvalidShape { context, reason } => {
                assert_eq!(context, "dataset targets");
                assert!(reason.contains("index 3"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_random_split_partitions_indices() {
        let parts = random_split(10, &[6, 3, 1], 42).unwrap();
        assert_eq!(parts.iter().map(Vec::len).collect::<Vec<_>>(), vec![6, 3, 1]);
        let mut all = parts.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(parts, random_split(10, &[6, 3, 1], 42).unwrap());
        assert!(random_split(10, &[6, 3], 42).is_err());
    }

    #[test]
    fn test_dataset_rejects_unknown_label() {
        let sample = DocumentSample {
            image: Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu).unwrap(),
            text: Tensor::zeros((5, 2), DType::F32, &Device::Cpu).unwrap(),
            label: 4,
        };
        assert!(InMemoryDataset::new(vec![sample], vec!["a".into()]).is_err());
    }

    #[test]
    fn test_bad_loader_arguments() {
        assert!(DocumentDataLoader::full(dataset(&[0]), 0, false, 0, Device::Cpu).is_err());
        assert!(DocumentDataLoader::new(dataset(&[0]), vec![1], 1, false, 0, Device::Cpu).is_err());
    }
}
