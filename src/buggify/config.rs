//! Fault probabilities for buggify

use super::faults::ALL_FAULTS;
use std::collections::HashMap;

/// Per-fault probabilities plus a global switch
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    /// Scales every configured probability (clamped to 1.0)
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultConfig {
    /// Enabled, with no per-fault probabilities configured
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// 1% on every catalogued fault
    pub fn moderate() -> Self {
        Self::uniform(0.01)
    }

    /// 5% on every catalogued fault
    pub fn chaos() -> Self {
        Self::uniform(0.05)
    }

    fn uniform(prob: f64) -> Self {
        let mut config = Self::new();
        for fault in ALL_FAULTS {
            config.set(fault, prob);
        }
        config
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
    }

    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.set(fault_id, probability);
        self
    }

    /// Effective probability for a fault (0.0 when disabled or unset)
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.probabilities
            .get(fault_id)
            .map(|p| (p * self.global_multiplier).min(1.0))
            .unwrap_or(0.0)
    }
}
