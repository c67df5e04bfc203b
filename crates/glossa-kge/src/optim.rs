//! AdamW with per-group learning rates, linear warmup, and gradient accumulation.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::ParamGroup;

/// Linear warmup to the base rate, then linear decay to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearWarmup {
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearWarmup {
    /// `warmup_fraction` of `total_steps` spent warming up.
    pub fn new(total_steps: usize, warmup_fraction: f64) -> Self {
        Self {
            warmup_steps: (total_steps as f64 * warmup_fraction) as usize,
            total_steps,
        }
    }

    /// Multiplier applied to the base rate at `step`.
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / span).max(0.0)
    }
}

struct Group {
    name: String,
    optimizer: AdamW,
    vars: Vec<Var>,
    base_lr: f64,
}

/// One AdamW per parameter group, stepped together under a shared schedule.
pub struct GroupedOptimizer {
    groups: Vec<Group>,
    schedule: Option<LinearWarmup>,
    step: usize,
}

impl GroupedOptimizer {
    pub fn new(groups: Vec<ParamGroup>, schedule: Option<LinearWarmup>) -> Result<Self> {
        let factor = schedule.map_or(1.0, |s| s.factor(0));
        let groups = groups
            .into_iter()
            .map(|group| {
                let params = ParamsAdamW {
                    lr: group.lr * factor,
                    weight_decay: 0.0,
                    ..Default::default()
                };
                Ok(Group {
                    optimizer: AdamW::new(group.vars.clone(), params)?,
                    name: group.name,
                    vars: group.vars,
                    base_lr: group.lr,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            groups,
            schedule,
            step: 0,
        })
    }

    /// Apply one update from `grads` and advance the schedule.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &mut self.groups {
            group.optimizer.step(grads)?;
        }
        self.step += 1;
        if let Some(schedule) = self.schedule {
            let factor = schedule.factor(self.step);
            for group in &mut self.groups {
                group.optimizer.set_learning_rate(group.base_lr * factor);
            }
        }
        Ok(())
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn num_steps(&self) -> usize {
        self.step
    }

    /// Current `(group name, learning rate)` pairs.
    pub fn learning_rates(&self) -> Vec<(&str, f64)> {
        self.groups
            .iter()
            .map(|g| (g.name.as_str(), g.optimizer.learning_rate()))
            .collect()
    }

    /// Every variable this optimizer updates.
    pub fn vars(&self) -> Vec<Var> {
        self.groups.iter().flat_map(|g| g.vars.iter().cloned()).collect()
    }
}

/// Sums gradients over several backward passes before one optimizer step.
pub struct GradientAccumulator {
    vars: Vec<Var>,
    grads: Option<GradStore>,
    passes: usize,
}

impl GradientAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            grads: None,
            passes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.grads = None;
        self.passes = 0;
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        let merged = match self.grads.take() {
            None => grads,
            Some(mut acc) => {
                for var in &self.vars {
                    let Some(g) = grads.get(var.as_tensor()) else {
                        continue;
                    };
                    let sum = match acc.get(var.as_tensor()) {
                        Some(prev) => (prev + g)?,
                        None => g.clone(),
                    };
                    acc.insert(var.as_tensor(), sum);
                }
                acc
            }
        };
        self.grads = Some(merged);
        self.passes += 1;
        Ok(())
    }

    pub fn grads(&self) -> Option<&GradStore> {
        self.grads.as_ref()
    }

    /// Smallest and largest accumulated gradient entry across all vars.
    pub fn extrema(&self) -> Result<Option<(f32, f32)>> {
        let Some(grads) = &self.grads else {
            return Ok(None);
        };
        let mut extrema: Option<(f32, f32)> = None;
        for var in &self.vars {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let flat = g.flatten_all()?;
            if flat.elem_count() == 0 {
                continue;
            }
            let lo = flat.min(0)?.to_scalar::<f32>()?;
            let hi = flat.max(0)?.to_scalar::<f32>()?;
            extrema = Some(match extrema {
                None => (lo, hi),
                Some((a, b)) => (a.min(lo), b.max(hi)),
            });
        }
        Ok(extrema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_warmup_then_decay() {
        let schedule = LinearWarmup::new(10, 0.2);
        assert_eq!(schedule.warmup_steps, 2);
        assert_eq!(schedule.factor(0), 0.0);
        assert!((schedule.factor(1) - 0.5).abs() < 1e-12);
        assert!((schedule.factor(2) - 1.0).abs() < 1e-12);
        assert!((schedule.factor(6) - 0.5).abs() < 1e-12);
        assert_eq!(schedule.factor(10), 0.0);
        assert_eq!(schedule.factor(50), 0.0);
    }

    #[test]
    fn test_groups_follow_schedule() {
        let device = Device::Cpu;
        let a = Var::zeros(3, DType::F32, &device).unwrap();
        let b = Var::zeros(3, DType::F32, &device).unwrap();
        let groups = vec![
            ParamGroup {
                name: "encoder".into(),
                vars: vec![a.clone()],
                lr: 2e-5,
            },
            ParamGroup {
                name: "head".into(),
                vars: vec![b.clone()],
                lr: 1e-4,
            },
        ];
        let mut opt = GroupedOptimizer::new(groups, Some(LinearWarmup::new(4, 0.5))).unwrap();
        assert_eq!(opt.learning_rates()[1].1, 0.0);

        let loss = (a.as_tensor().sum_all().unwrap() + b.as_tensor().sum_all().unwrap()).unwrap();
        opt.backward_step(&loss).unwrap();
        let rates = opt.learning_rates();
        assert!((rates[0].1 - 1e-5).abs() < 1e-12);
        assert!((rates[1].1 - 5e-5).abs() < 1e-12);
        assert_eq!(opt.vars().len(), 2);
    }

    #[test]
    fn test_accumulator_sums_passes() {
        let device = Device::Cpu;
        let w = Var::new(&[1.0f32, 2.0], &device).unwrap();
        let mut acc = GradientAccumulator::new(vec![w.clone()]);

        for scale in [1.0, 3.0] {
            let loss = (w.as_tensor() * scale).unwrap().sum_all().unwrap();
            acc.accumulate(loss.backward().unwrap()).unwrap();
        }
        assert_eq!(acc.passes(), 2);
        let g = acc.grads().unwrap().get(w.as_tensor()).unwrap();
        assert_eq!(g.to_vec1::<f32>().unwrap(), vec![4.0, 4.0]);
        assert_eq!(acc.extrema().unwrap(), Some((4.0, 4.0)));

        acc.reset();
        assert!(acc.grads().is_none());
        assert_eq!(acc.extrema().unwrap(), None);
    }
}
