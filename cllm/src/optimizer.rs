//! The `{SGD, SGD+Momentum, SGD+Nesterov, Adam, AdamW, RMSProp, Adagrad}` optimizer family,
//! its learning-rate schedulers, and gradient clipping.

use serde::{Deserialize, Serialize};

/// Which update rule [`Optimizer::step`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
    RmsProp,
    Adagrad,
}

/// Learning-rate schedule applied on top of the base `lr`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    None,
    Warmup,
    Linear,
    Cosine,
    Step,
    Exponential,
    Cyclic,
}

/// The enumerated optimizer configuration surface: update rule, schedule, and clipping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub amsgrad: bool,
    pub weight_decay: f32,
    pub decoupled_wd: bool,
    pub clip_value: f32,
    pub clip_norm: f32,
    pub scheduler: Scheduler,
    pub warmup_steps: u64,
    pub total_steps: u64,
    pub decay_rate: f32,
    pub decay_steps: u64,
    pub cycle_steps: u64,
    pub min_lr: f32,
    pub max_lr: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            lr: 1e-3,
            momentum: 0.9,
            nesterov: false,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            amsgrad: false,
            weight_decay: 0.0,
            decoupled_wd: true,
            clip_value: 0.0,
            clip_norm: 0.0,
            scheduler: Scheduler::None,
            warmup_steps: 0,
            total_steps: 0,
            decay_rate: 1.0,
            decay_steps: 1,
            cycle_steps: 1,
            min_lr: 0.0,
            max_lr: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Resolves the learning rate for step `s` (1-indexed: "current LR =
    /// `schedule(step+1)`"). Warmup always wins while `s < warmup_steps`; afterwards the
    /// configured scheduler runs over the adjusted step/horizon.
    pub fn lr_at(&self, s: u64) -> f32 {
        if self.warmup_steps > 0 && s < self.warmup_steps {
            return self.lr * (s as f32) / (self.warmup_steps as f32);
        }
        let adjusted_step = s.saturating_sub(self.warmup_steps);
        let adjusted_total = self.total_steps.saturating_sub(self.warmup_steps);

        match self.scheduler {
            Scheduler::None | Scheduler::Warmup => self.lr,
            Scheduler::Linear => {
                if adjusted_total == 0 {
                    return self.lr;
                }
                let frac = (adjusted_step as f32 / adjusted_total as f32).min(1.0);
                (self.lr - (self.lr - self.min_lr) * frac).max(self.min_lr)
            }
            Scheduler::Cosine => {
                if adjusted_total == 0 {
                    return self.lr;
                }
                let frac = (adjusted_step as f32 / adjusted_total as f32).min(1.0);
                self.min_lr + (self.lr - self.min_lr) * 0.5 * (1.0 + (std::f32::consts::PI * frac).cos())
            }
            Scheduler::Step => {
                let exponent = (adjusted_step / self.decay_steps.max(1)) as i32;
                (self.lr * self.decay_rate.powi(exponent)).max(self.min_lr)
            }
            Scheduler::Exponential => {
                let exponent = adjusted_step as f32 / self.decay_steps.max(1) as f32;
                (self.lr * self.decay_rate.powf(exponent)).max(self.min_lr)
            }
            Scheduler::Cyclic => {
                let period = self.cycle_steps.max(1);
                let phase = adjusted_step % period;
                let half = period as f32 / 2.0;
                let triangle = if (phase as f32) <= half { phase as f32 / half } else { 2.0 - phase as f32 / half };
                self.min_lr + (self.max_lr - self.min_lr) * triangle
            }
        }
    }
}

/// Clips `grad` in place: elementwise value clamp, then global ℓ2-norm clamp (
/// order: value-clip, then norm-clip, then the optimizer step). Returns whether norm
/// clipping actually scaled anything, for the `FEATURE_GRADIENT_CLIPPED` metrics flag.
pub fn clip_gradient(grad: &mut [f32], clip_value: f32, clip_norm: f32) -> bool {
    if clip_value > 0.0 {
        for g in grad.iter_mut() {
            *g = g.clamp(-clip_value, clip_value);
        }
    }
    if clip_norm > 0.0 {
        let norm = l2_norm(grad);
        if norm > clip_norm {
            let scale = clip_norm / norm;
            for g in grad.iter_mut() {
                *g *= scale;
            }
            return true;
        }
    }
    false
}

/// The global ℓ2 norm of a flat vector.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Owns the moment buffers and step counter for one parameter vector. Coordinator-
/// exclusive: no other thread ever touches `m`, `v`, or `v_max`.
pub struct Optimizer {
    config: OptimizerConfig,
    step: u64,
    m: Vec<f32>,
    v: Vec<f32>,
    v_max: Vec<f32>,
}

impl Optimizer {
    /// Allocates zeroed moment buffers sized for `num_params` parameters.
    pub fn new(config: OptimizerConfig, num_params: usize) -> Self {
        Self { config, step: 0, m: vec![0.0; num_params], v: vec![0.0; num_params], v_max: vec![0.0; num_params] }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Current learning rate, were a step to run right now.
    pub fn current_lr(&self) -> f32 {
        self.config.lr_at(self.step + 1)
    }

    /// Applies one optimizer step: `grad` is consumed as the already-clipped, reduced
    /// gradient; `params` is updated in place.
    pub fn step(&mut self, params: &mut [f32], grad: &[f32]) {
        assert_eq!(params.len(), grad.len());
        assert_eq!(params.len(), self.m.len());

        self.step += 1;
        let lr = self.config.lr_at(self.step);
        let c = &self.config;

        match c.kind {
            OptimizerKind::Sgd => {
                for i in 0..params.len() {
                    let mut g = grad[i];
                    if c.weight_decay > 0.0 {
                        g += c.weight_decay * params[i];
                    }
                    if c.momentum > 0.0 {
                        self.m[i] = c.momentum * self.m[i] + g;
                        let update = if c.nesterov { c.momentum * self.m[i] + g } else { self.m[i] };
                        params[i] -= lr * update;
                    } else {
                        params[i] -= lr * g;
                    }
                }
            }
            OptimizerKind::Adam | OptimizerKind::AdamW => {
                let bias_correction1 = 1.0 - c.beta1.powi(self.step as i32);
                let bias_correction2 = 1.0 - c.beta2.powi(self.step as i32);
                for i in 0..params.len() {
                    let mut g = grad[i];
                    if c.kind == OptimizerKind::Adam && c.weight_decay > 0.0 {
                        g += c.weight_decay * params[i];
                    }
                    self.m[i] = c.beta1 * self.m[i] + (1.0 - c.beta1) * g;
                    self.v[i] = c.beta2 * self.v[i] + (1.0 - c.beta2) * g * g;

                    let m_hat = self.m[i] / bias_correction1;
                    let mut v_hat = self.v[i] / bias_correction2;
                    if c.amsgrad {
                        v_hat = v_hat.max(self.v_max[i]);
                        self.v_max[i] = v_hat;
                    }

                    let denom = v_hat.sqrt() + c.epsilon;
                    if c.kind == OptimizerKind::AdamW {
                        params[i] -= lr * (m_hat / denom + c.weight_decay * params[i]);
                    } else {
                        params[i] -= lr * (m_hat / denom);
                    }
                }
            }
            OptimizerKind::RmsProp => {
                for i in 0..params.len() {
                    let mut g = grad[i];
                    if c.weight_decay > 0.0 {
                        g += c.weight_decay * params[i];
                    }
                    self.v[i] = c.beta2 * self.v[i] + (1.0 - c.beta2) * g * g;
                    params[i] -= lr * g / (self.v[i].sqrt() + c.epsilon);
                }
            }
            OptimizerKind::Adagrad => {
                for i in 0..params.len() {
                    let mut g = grad[i];
                    if c.weight_decay > 0.0 {
                        g += c.weight_decay * params[i];
                    }
                    self.v[i] += g * g;
                    params[i] -= lr * g / (self.v[i].sqrt() + c.epsilon);
                }
            }
        }
    }

    /// Restores moments to zero and the step counter to zero ( idempotence: not
    /// idempotent itself, but always returns to the same zero state).
    pub fn reset(&mut self) {
        self.step = 0;
        self.m.iter_mut().for_each(|x| *x = 0.0);
        self.v.iter_mut().for_each(|x| *x = 0.0);
        self.v_max.iter_mut().for_each(|x| *x = 0.0);
    }

    /// Concatenated `[m, v]`, the layout the optimizer checkpoint persists.
    pub fn moments(&self) -> (&[f32], &[f32]) {
        (&self.m, &self.v)
    }

    /// Restores `m` and `v` from a loaded checkpoint (`v_max` is not persisted; it
    /// recomputes from `v` on the first post-load step if `amsgrad` is enabled).
    pub fn load_moments(&mut self, m: &[f32], v: &[f32], step: u64) {
        self.m.copy_from_slice(m);
        self.v.copy_from_slice(v);
        self.v_max.iter_mut().for_each(|x| *x = 0.0);
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> OptimizerConfig {
        OptimizerConfig { lr: 0.01, scheduler: Scheduler::Cosine, warmup_steps: 10, total_steps: 100, min_lr: 0.001, ..OptimizerConfig::default() }
    }

    #[test]
    fn schedule_matches_literal_scenario() {
        let c = base_config();
        assert!((c.lr_at(1) - 0.001).abs() < 1e-4);
        assert!((c.lr_at(5) - 0.005).abs() < 1e-4);
        assert!((c.lr_at(10) - 0.01).abs() < 1e-4);
        assert!((c.lr_at(55) - 0.00505).abs() < 1e-4);
        assert!((c.lr_at(100) - 0.001).abs() < 1e-4);
    }

    #[test]
    fn cosine_and_linear_are_non_increasing_outside_warmup() {
        for scheduler in [Scheduler::Cosine, Scheduler::Linear] {
            let c = OptimizerConfig { lr: 0.1, scheduler, warmup_steps: 0, total_steps: 50, min_lr: 0.0, ..OptimizerConfig::default() };
            let mut prev = c.lr_at(1);
            for s in 2..=50 {
                let next = c.lr_at(s);
                assert!(next <= prev + 1e-6, "schedule {:?} increased at step {s}: {prev} -> {next}", scheduler);
                prev = next;
            }
        }
    }

    #[test]
    fn clip_value_then_norm_matches_literal_scenarios() {
        let mut g = vec![3.0, 4.0];
        clip_gradient(&mut g, 0.0, 5.0);
        assert!((l2_norm(&g) - 5.0).abs() < 1e-5);
        assert_eq!(g, vec![3.0, 4.0]);

        let mut g = vec![6.0, 8.0];
        clip_gradient(&mut g, 0.0, 5.0);
        assert!((g[0] - 3.0).abs() < 1e-5);
        assert!((g[1] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn zero_gradient_leaves_params_unchanged_with_no_weight_decay() {
        let config = OptimizerConfig { kind: OptimizerKind::AdamW, weight_decay: 0.0, ..OptimizerConfig::default() };
        let mut opt = Optimizer::new(config, 4);
        let mut params = vec![1.0, 2.0, 3.0, 4.0];
        let grad = vec![0.0; 4];
        let before = params.clone();
        opt.step(&mut params, &grad);
        assert_eq!(params, before);
    }

    #[test]
    fn reset_restores_zero_state() {
        let mut opt = Optimizer::new(OptimizerConfig::default(), 2);
        let mut params = vec![1.0, 1.0];
        opt.step(&mut params, &[1.0, 1.0]);
        assert_eq!(opt.step_count(), 1);
        opt.reset();
        assert_eq!(opt.step_count(), 0);
        let (m, v) = opt.moments();
        assert!(m.iter().all(|&x| x == 0.0));
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn sgd_matches_hand_computed_step() {
        let config = OptimizerConfig { kind: OptimizerKind::Sgd, lr: 0.1, momentum: 0.0, weight_decay: 0.0, ..OptimizerConfig::default() };
        let mut opt = Optimizer::new(config, 1);
        let mut params = vec![1.0];
        opt.step(&mut params, &[2.0]);
        assert!((params[0] - 0.8).abs() < 1e-6);
    }
}
