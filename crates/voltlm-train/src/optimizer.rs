//! Optimizer construction, gradient accumulation and clipping

use crate::config::OptimizerSection;
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::optim::AdamW;
use aprender::nn::Module;
use voltlm_model::VoltLM;

/// Build the AdamW optimizer over every model parameter
///
/// # Errors
/// Fails when the model exposes no parameters.
pub fn setup_optimizer(model: &mut VoltLM, settings: &OptimizerSection) -> Result<AdamW> {
    let parameters = model.parameters_mut();
    if parameters.is_empty() {
        anyhow::bail!("model has no parameters to optimize");
    }
    Ok(AdamW::new(parameters, settings.learning_rate))
}

/// Explicit gradient-accumulation buffer
///
/// Each micro-batch's parameter gradients are folded into this buffer with a
/// caller-chosen factor (the loss-division and loss-scale contracts applied
/// through gradient linearity), then the parameter gradients are zeroed.
/// At the accumulation boundary the buffered gradients are written back and
/// committed by a single optimizer step, so a step is atomic at micro-batch
/// granularity.
pub struct GradAccumulator {
    bufs: Vec<Vec<f32>>,
    micro_batches: usize,
}

impl GradAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self {
            bufs: Vec::new(),
            micro_batches: 0,
        }
    }

    /// Fold the current parameter gradients into the buffer
    ///
    /// # Arguments
    /// * `params` - The model parameters (their gradients are consumed and zeroed)
    /// * `factor` - Multiplier applied to each incoming gradient
    pub fn absorb(&mut self, params: &mut [&mut Tensor], factor: f32) {
        if self.bufs.is_empty() {
            self.bufs = params
                .iter()
                .map(|p| vec![0.0; p.data().len()])
                .collect();
        }

        for (buf, param) in self.bufs.iter_mut().zip(params.iter_mut()) {
            if let Some(grad) = param.grad() {
                for (b, g) in buf.iter_mut().zip(grad.iter()) {
                    *b += g * factor;
                }
                param.set_grad(vec![0.0; buf.len()]);
            }
        }
        self.micro_batches += 1;
    }

    /// Micro-batches folded in since the last write-back or clear
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// True when any buffered gradient is NaN or Inf
    pub fn any_non_finite(&self) -> bool {
        self.bufs
            .iter()
            .any(|buf| buf.iter().any(|v| !v.is_finite()))
    }

    /// Multiply every buffered gradient by `factor`
    pub fn scale_all(&mut self, factor: f32) {
        for buf in &mut self.bufs {
            for v in buf.iter_mut() {
                *v *= factor;
            }
        }
    }

    /// Write the buffered gradients back onto the parameters and reset
    pub fn write_back(&mut self, params: &mut [&mut Tensor]) {
        for (buf, param) in self.bufs.iter().zip(params.iter_mut()) {
            param.set_grad(buf.clone());
        }
        self.clear();
    }

    /// Drop all buffered gradients
    pub fn clear(&mut self) {
        for buf in &mut self.bufs {
            for v in buf.iter_mut() {
                *v = 0.0;
            }
        }
        self.micro_batches = 0;
    }
}

impl Default for GradAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Clip parameter gradients to a maximum global L2 norm
///
/// # Arguments
/// * `params` - Parameters whose gradients are clipped in place
/// * `max_norm` - Norm threshold (0.0 disables clipping)
///
/// # Returns
/// The global gradient norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Tensor], max_norm: f32) -> f32 {
    let mut total_sq = 0.0f32;
    for param in params.iter() {
        if let Some(grad) = param.grad() {
            total_sq += grad.iter().map(|g| g * g).sum::<f32>();
        }
    }
    let norm = total_sq.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let coef = max_norm / (norm + 1e-6);
        for param in params.iter_mut() {
            if let Some(grad) = param.grad() {
                let scaled: Vec<f32> = grad.iter().map(|g| g * coef).collect();
                param.set_grad(scaled);
            }
        }
    }

    norm
}
