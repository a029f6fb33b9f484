//! Deep copies of parameter state and best-model bookkeeping.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Tensor, Var};

use crate::error::{map_candle, SideTuneError, SideTuneResult};

/// Owned copy of a set of named variables.
///
/// Every tensor is copied into fresh storage, so later `Var::set` calls on
/// the live parameters leave the snapshot untouched.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    tensors: Vec<(String, Tensor)>,
}

impl ParamSnapshot {
    pub fn capture(vars: &[(String, Var)]) -> SideTuneResult<Self> {
        let tensors = vars
            .iter()
            .map(|(name, var)| {
                let copy = var
                    .as_tensor()
                    .copy()
                    .map_err(map_candle("snapshot copy"))?
                    .detach();
                Ok((name.clone(), copy))
            })
            .collect::<SideTuneResult<Vec<_>>>()?;
        Ok(Self { tensors })
    }

    /// Write the snapshot back into `vars`, which must have the same names
    /// and shapes in the same order.
    pub fn restore(&self, vars: &[(String, Var)]) -> SideTuneResult<()> {
        if vars.len() != self.tensors.len() {
            return Err(SideTuneError::DimensionMismatch {
                context: "snapshot restore parameter count".to_string(),
                expected: self.tensors.len(),
                got: vars.len(),
            });
        }
        for ((name, var), (saved_name, saved)) in vars.iter().zip(&self.tensors) {
            if name != saved_name {
                return Err(SideTuneError::config(format!(
                    "snapshot restore: expected parameter '{}', got '{}'",
                    saved_name, name
                )));
            }
            if var.as_tensor().dims() != saved.dims() {
                return Err(SideTuneError::InvalidShape {
                    context: format!("snapshot restore of '{}'", name),
                    reason: format!("live {:?} vs saved {:?}", var.as_tensor().dims(), saved.dims()),
                });
            }
            // set copies the data, the snapshot stays reusable
            var.set(saved).map_err(map_candle("snapshot restore"))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Save as safetensors keyed by parameter name.
    pub fn save(&self, path: impl AsRef<Path>) -> SideTuneResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let map: HashMap<String, Tensor> = self.tensors.iter().cloned().collect();
        candle_core::safetensors::save(&map, path).map_err(map_candle("snapshot save"))?;
        tracing::info!("Saved {} parameters to {}", self.tensors.len(), path.display());
        Ok(())
    }
}

/// Keeps the snapshot with the highest validation accuracy.
///
/// Only strict improvements replace the snapshot; the bar starts at 0.0.
#[derive(Debug, Default)]
pub struct BestModelTracker {
    best_accuracy: f64,
    best_epoch: Option<u32>,
    snapshot: Option<ParamSnapshot>,
}

impl BestModelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an epoch's validation accuracy, snapshotting `vars` on a new
    /// best. Returns whether the snapshot was replaced.
    pub fn observe(&mut self, epoch: u32, accuracy: f64, vars: &[(String, Var)]) -> SideTuneResult<bool> {
        if accuracy > self.best_accuracy {
            self.snapshot = Some(ParamSnapshot::capture(vars)?);
            self.best_accuracy = accuracy;
            self.best_epoch = Some(epoch);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn best_epoch(&self) -> Option<u32> {
        self.best_epoch
    }

    pub fn snapshot(&self) -> Option<&ParamSnapshot> {
        self.snapshot.as_ref()
    }

    /// Restore the best snapshot into `vars`. Returns false (and leaves the
    /// parameters alone) if no epoch ever beat the initial bar.
    pub fn restore_best(&self, vars: &[(String, Var)]) -> SideTuneResult<bool> {
        match &self.snapshot {
            Some(snapshot) => {
                snapshot.restore(vars)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn read(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    fn set(var: &Var, values: &[f32]) {
        var.set(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap();
    }

    #[test]
    fn test_snapshot_is_immune_to_later_updates() {
        let w = var(&[1.0, 2.0]);
        let vars = vec![("w".to_string(), w.clone())];
        let snapshot = ParamSnapshot::capture(&vars).unwrap();

        set(&w, &[9.0, 9.0]);
        assert_eq!(snapshot.get("w").unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);

        snapshot.restore(&vars).unwrap();
        assert_eq!(read(&w), vec![1.0, 2.0]);

        // restoring does not alias the snapshot either
        set(&w, &[5.0, 5.0]);
        snapshot.restore(&vars).unwrap();
        assert_eq!(read(&w), vec![1.0, 2.0]);
    }

    #[test]
    fn test_best_epoch_selection() {
        let w = var(&[0.0]);
        let vars = vec![("w".to_string(), w.clone())];
        let mut tracker = BestModelTracker::new();

        let accuracies = [0.70, 0.65, 0.80, 0.75];
        let mut improved = Vec::new();
        for (i, acc) in accuracies.iter().enumerate() {
            let epoch = i as u32 + 1;
            set(&w, &[epoch as f32]);
            improved.push(tracker.observe(epoch, *acc, &vars).unwrap());
        }

        assert_eq!(improved, vec![true, false, true, false]);
        assert_eq!(tracker.best_epoch(), Some(3));
        assert!((tracker.best_accuracy() - 0.80).abs() < 1e-12);

        assert_eq!(read(&w), vec![4.0]);
        assert!(tracker.restore_best(&vars).unwrap());
        assert_eq!(read(&w), vec![3.0]);
    }

    #[test]
    fn test_ties_do_not_replace_snapshot() {
        let w = var(&[1.0]);
        let vars = vec![("w".to_string(), w.clone())];
        let mut tracker = BestModelTracker::new();
        assert!(tracker.observe(1, 0.5, &vars).unwrap());
        set(&w, &[2.0]);
        assert!(!tracker.observe(2, 0.5, &vars).unwrap());
        assert_eq!(tracker.best_epoch(), Some(1));
    }

    #[test]
    fn test_zero_accuracy_never_snapshots() {
        let w = var(&[7.0]);
        let vars = vec![("w".to_string(), w.clone())];
        let mut tracker = BestModelTracker::new();
        assert!(!tracker.observe(1, 0.0, &vars).unwrap());
        assert!(!tracker.restore_best(&vars).unwrap());
        assert_eq!(read(&w), vec![7.0]);
    }

    #[test]
    fn test_restore_rejects_mismatched_layout() {
        let vars = vec![("w".to_string(), var(&[1.0]))];
        let snapshot = ParamSnapshot::capture(&vars).unwrap();
        let other = vec![("v".to_string(), var(&[1.0]))];
        assert!(snapshot.restore(&other).is_err());
        let wider = vec![("w".to_string(), var(&[1.0, 2.0]))];
        assert!(snapshot.restore(&wider).is_err());
    }

    #[test]
    fn test_save_writes_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best").join("model.safetensors");
        let vars = vec![("w".to_string(), var(&[1.0, 2.0]))];
        ParamSnapshot::capture(&vars).unwrap().save(&path).unwrap();

        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded["w"].to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }
}
