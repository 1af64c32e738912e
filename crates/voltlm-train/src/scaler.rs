//! Dynamic loss scaling for mixed-precision training

use serde::{Deserialize, Serialize};

/// Initial loss scale
const INITIAL_SCALE: f32 = 65536.0;
/// Multiplier applied after a stretch of overflow-free steps
const GROWTH_FACTOR: f32 = 2.0;
/// Multiplier applied after an overflow
const BACKOFF_FACTOR: f32 = 0.5;
/// Overflow-free steps required before the scale grows
const GROWTH_INTERVAL: usize = 2000;
/// Upper bound on the scale
const MAX_SCALE: f32 = 1.0e9;
/// Lower bound on the scale
const MIN_SCALE: f32 = 1.0;

/// Serializable scaler state for checkpointing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerState {
    /// Current loss scale
    pub scale: f32,
    /// Overflow-free steps since the last scale change
    pub good_steps: usize,
}

/// Dynamic loss scaler
///
/// Micro-batch gradients are folded into the accumulation buffer multiplied
/// by the current scale; at the commit boundary the buffer is checked for
/// overflow. An overflow skips the optimizer and scheduler step and halves
/// the scale; a long enough run of clean commits doubles it. When disabled
/// the scale is pinned at 1 and overflow never skips a step.
pub struct LossScaler {
    enabled: bool,
    scale: f32,
    good_steps: usize,
}

impl LossScaler {
    /// Create a scaler; `enabled` follows the mixed-precision toggle
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { INITIAL_SCALE } else { 1.0 },
            good_steps: 0,
        }
    }

    /// Whether dynamic scaling is active
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The current loss scale (1.0 when disabled)
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Record the outcome of a commit boundary
    ///
    /// # Arguments
    /// * `found_overflow` - True when the accumulated gradients contained
    ///   NaN/Inf and the step was skipped
    pub fn update(&mut self, found_overflow: bool) {
        if !self.enabled {
            return;
        }
        if found_overflow {
            self.scale = (self.scale * BACKOFF_FACTOR).max(MIN_SCALE);
            self.good_steps = 0;
        } else {
            self.good_steps += 1;
            if self.good_steps >= GROWTH_INTERVAL {
                self.scale = (self.scale * GROWTH_FACTOR).min(MAX_SCALE);
                self.good_steps = 0;
            }
        }
    }

    /// Snapshot for checkpointing
    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            good_steps: self.good_steps,
        }
    }

    /// Restore a snapshot
    pub fn restore(&mut self, state: &ScalerState) {
        if self.enabled {
            self.scale = state.scale;
            self.good_steps = state.good_steps;
        }
    }
}
