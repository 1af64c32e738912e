//! Learning-rate scheduling

use serde::{Deserialize, Serialize};

/// Serializable schedule state for checkpointing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Committed optimizer steps
    pub step: usize,
}

/// Linear warmup followed by cosine decay to a floor
///
/// The schedule advances exactly once per committed optimizer step, never
/// per micro-batch; a skipped step (loss-scale overflow) does not advance it.
pub struct LrSchedule {
    base_lr: f32,
    min_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl LrSchedule {
    /// Create a schedule
    ///
    /// # Arguments
    /// * `base_lr` - Peak learning rate reached at the end of warmup
    /// * `min_lr` - Floor of the cosine decay
    /// * `warmup_steps` - Linear warmup length
    /// * `total_steps` - Total optimizer steps of the run
    pub fn new(base_lr: f32, min_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps: total_steps.max(1),
            step: 0,
        }
    }

    /// Learning rate at a given optimizer step
    pub fn lr_at(&self, step: usize) -> f32 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }

        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f32 / decay_steps as f32).min(1.0);
        self.min_lr
            + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (std::f32::consts::PI * progress).cos())
    }

    /// Advance one optimizer step and return the new learning rate
    pub fn advance(&mut self) -> f32 {
        self.step += 1;
        self.lr_at(self.step)
    }

    /// Learning rate at the current step
    pub fn current_lr(&self) -> f32 {
        self.lr_at(self.step)
    }

    /// Committed optimizer steps so far
    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Snapshot for checkpointing
    pub fn state(&self) -> ScheduleState {
        ScheduleState { step: self.step }
    }

    /// Restore a snapshot
    pub fn restore(&mut self, state: &ScheduleState) {
        self.step = state.step;
    }
}
