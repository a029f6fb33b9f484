//! Confusion matrix accumulated over one evaluation pass.

use serde::{Deserialize, Serialize};

use super::loss::validate_labels;
use crate::error::{SideTuneError, SideTuneResult};

/// `num_classes x num_classes` counts; rows are true classes, columns are
/// predicted classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Add one batch of `(true, predicted)` pairs.
    pub fn update(&mut self, targets: &[u32], predictions: &[u32]) -> SideTuneResult<()> {
        if targets.len() != predictions.len() {
            return Err(SideTuneError::InvalidShape {
                context: "confusion matrix update".to_string(),
                reason: format!(
                    "{} targets for {} predictions",
                    targets.len(),
                    predictions.len()
                ),
            });
        }
        validate_labels(targets, self.num_classes)?;
        validate_labels(predictions, self.num_classes)?;
        for (&t, &p) in targets.iter().zip(predictions) {
            self.counts[t as usize][p as usize] += 1;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for row in &mut self.counts {
            row.iter_mut().for_each(|c| *c = 0);
        }
    }

    pub fn counts(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..self.num_classes).map(|i| self.counts[i][i]).sum()
    }

    /// `trace / total`, or 0 for an empty matrix.
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f64 / total as f64,
        }
    }

    /// Each row divided by its sum (all zeros for a class with no samples).
    pub fn row_fractions(&self) -> Vec<Vec<f64>> {
        self.counts
            .iter()
            .map(|row| {
                let sum: u64 = row.iter().sum();
                row.iter()
                    .map(|&c| if sum == 0 { 0.0 } else { c as f64 / sum as f64 })
                    .collect()
            })
            .collect()
    }

    /// Diagonal of [`ConfusionMatrix::row_fractions`]: per-class recall.
    pub fn per_class_accuracy(&self) -> Vec<f64> {
        self.row_fractions()
            .into_iter()
            .enumerate()
            .map(|(i, row)| row[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulation_rows_are_true_class() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[0, 1, 1, 0], &[0, 1, 0, 0]).unwrap();
        assert_eq!(cm.counts(), &[vec![2u64, 0], vec![1u64, 1]]);
        assert_eq!(cm.total(), 4);
        assert!((cm.accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_accumulates_across_batches_and_resets() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[0, 1], &[0, 1]).unwrap();
        cm.update(&[1], &[0]).unwrap();
        assert_eq!(cm.total(), 3);
        cm.reset();
        assert_eq!(cm, ConfusionMatrix::new(2));
        assert_eq!(cm.accuracy(), 0.0);
    }

    #[test]
    fn test_row_fractions() {
        let mut cm = ConfusionMatrix::new(3);
        cm.update(&[0, 1, 1, 0], &[0, 1, 0, 0]).unwrap();
        let fractions = cm.row_fractions();
        assert_eq!(fractions[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(fractions[1], vec![0.5, 0.5, 0.0]);
        assert_eq!(fractions[2], vec![0.0, 0.0, 0.0]);
        assert_eq!(cm.per_class_accuracy(), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_out_of_range_and_length_mismatch() {
        let mut cm = ConfusionMatrix::new(2);
        assert!(matches!(
            cm.update(&[2], &[0]),
            Err(SideTuneError::LabelOutOfRange { label: 2, .. })
        ));
        assert!(cm.update(&[0, 1], &[0]).is_err());
    }

    #[test]
    fn test_serializes_to_json() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[0], &[1]).unwrap();
        let json = serde_json::to_string(&cm).unwrap();
        let back: ConfusionMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cm);
    }
}
