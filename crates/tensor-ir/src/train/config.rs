use serde::{Deserialize, Serialize};

use crate::graph::SgdParams;

/// Optimizer settings baked into the SGD nodes emitted by differentiation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub l1_decay: f32,
    pub l2_decay: f32,
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            learning_rate: 0.01,
            momentum: 0.0,
            l1_decay: 0.0,
            l2_decay: 0.0,
            batch_size: 1,
        }
    }
}

impl TrainingConfig {
    pub fn new(learning_rate: f32) -> Self {
        TrainingConfig {
            learning_rate,
            ..Default::default()
        }
    }

    /// Returns the first invalid setting, if any.
    pub fn validate(&self) -> Result<(), String> {
        if !self.learning_rate.is_finite() {
            return Err(format!("learning rate {} is not finite", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(format!("momentum {} is outside [0, 1)", self.momentum));
        }
        if self.l1_decay < 0.0 || self.l2_decay < 0.0 {
            return Err("decay coefficients must be non-negative".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch size must be positive".to_string());
        }
        Ok(())
    }

    pub(crate) fn sgd_params(&self) -> SgdParams {
        SgdParams {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            l1_decay: self.l1_decay,
            l2_decay: self.l2_decay,
            batch_size: self.batch_size,
        }
    }
}
