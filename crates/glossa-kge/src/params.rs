//! Trainable parameters with a version counter.
//!
//! Every optimizer step bumps the version. Anything derived from the
//! parameters (an entity embedding cache, say) records the version it was
//! built at and is rejected once the two disagree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::MutexGuard;

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};

/// A [`VarMap`] plus the number of updates applied to it.
pub struct ParameterStore {
    varmap: VarMap,
    device: Device,
    version: AtomicU64,
}

impl ParameterStore {
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
            version: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder that creates new variables inside this store.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Every variable, ordered by name.
    pub fn all_vars(&self) -> Vec<Var> {
        self.vars_with_prefix("")
    }

    /// Variables whose path starts with `prefix`, ordered by name.
    pub fn vars_with_prefix(&self, prefix: &str) -> Vec<Var> {
        let data = lock(self.varmap.data());
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, var)| var.clone()).collect()
    }

    /// Scalar count across all variables.
    pub fn num_parameters(&self) -> usize {
        lock(self.varmap.data())
            .values()
            .map(|var| var.elem_count())
            .sum()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Record one parameter update; returns the new version.
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("device", &self.device)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

fn lock(
    data: &std::sync::Mutex<HashMap<String, Var>>,
) -> MutexGuard<'_, HashMap<String, Var>> {
    // A poisoned map still holds valid variables.
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_is_monotonic() {
        let store = ParameterStore::new(Device::Cpu);
        assert_eq!(store.version(), 0);
        assert_eq!(store.bump(), 1);
        assert_eq!(store.bump(), 2);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_prefix_selection() {
        let store = ParameterStore::new(Device::Cpu);
        let vb = store.var_builder();
        candle_nn::linear(4, 3, vb.pp("encoder")).unwrap();
        candle_nn::embedding(5, 3, vb.pp("relations")).unwrap();

        assert_eq!(store.vars_with_prefix("encoder").len(), 2);
        assert_eq!(store.vars_with_prefix("relations").len(), 1);
        assert_eq!(store.all_vars().len(), 3);
        assert_eq!(store.num_parameters(), 4 * 3 + 3 + 5 * 3);
    }
}
