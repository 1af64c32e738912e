//! Training loop
//!
//! Drives the model through epochs of micro-batches: forward/backward per
//! micro-batch, one optimizer commit per accumulation window, periodic
//! evaluation and checkpointing, a final evaluation and save. The model is
//! the single mutable shared resource and only this loop mutates it.

use crate::config::{OptimizerSection, TrainingSection};
use crate::dataloader::{DataLoader, DataLoaderState};
use crate::history::TrainingHistory;
use crate::optimizer::{clip_grad_norm, setup_optimizer, GradAccumulator};
use crate::scaler::{LossScaler, ScalerState};
use crate::schedule::{LrSchedule, ScheduleState};
use anyhow::{Context, Result};
use aprender::nn::optim::{AdamW, Optimizer};
use aprender::nn::Module;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use voltlm_model::{generate, save_checkpoint, GenerationConfig, VoltLM};
use voltlm_tokenizer::Tokenizer;

/// Trainer-state blob file name inside a checkpoint directory
pub const TRAINING_STATE_FILE: &str = "training_state.json";
/// Training-history file name inside a checkpoint directory
pub const HISTORY_FILE: &str = "training_history.json";
/// Directory name of the always-latest-best checkpoint
pub const BEST_CHECKPOINT_DIR: &str = "checkpoint_best";
/// Directory name of the final checkpoint
pub const FINAL_CHECKPOINT_DIR: &str = "checkpoint_final";
/// Prefix of step checkpoints, suffixed with the optimizer step
pub const STEP_CHECKPOINT_PREFIX: &str = "checkpoint_step_";

/// Fatal training errors
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("non-finite loss {value} at step {step}; aborting run")]
    NumericalInstability { step: usize, value: f32 },
    #[error("non-finite gradients at step {step} outside mixed precision; aborting run")]
    GradientOverflow { step: usize },
}

/// Result of one evaluation pass
#[derive(Debug, Clone, Copy)]
pub struct EvalReport {
    /// Token-weighted average validation loss
    pub avg_loss: f32,
    /// exp(avg_loss)
    pub perplexity: f32,
}

/// Optimizer/scheduler/progress state persisted with every checkpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct TrainerState {
    /// Committed optimizer steps
    pub global_step: usize,
    /// Current epoch
    pub epoch: usize,
    /// Best validation loss seen so far
    pub best_eval_loss: Option<f32>,
    /// Learning rate after the last committed step
    pub learning_rate: f32,
    /// Scheduler state
    pub schedule: ScheduleState,
    /// Loss-scaler state
    pub scaler: ScalerState,
    /// Training data-loader state
    pub dataloader: DataLoaderState,
    /// Optimizer hyperparameters the run was started with
    pub optimizer: OptimizerSection,
}

/// Single-process trainer over one model
pub struct Trainer {
    model: VoltLM,
    train_loader: DataLoader,
    val_loader: Option<DataLoader>,
    tokenizer: Option<Tokenizer>,
    training: TrainingSection,
    optimizer_settings: OptimizerSection,
    schedule: LrSchedule,
    scaler: LossScaler,
    history: TrainingHistory,
    global_step: usize,
    epoch: usize,
    best_eval_loss: Option<f32>,
    stop_flag: Arc<AtomicBool>,
    output_dir: PathBuf,
}

impl Trainer {
    /// Create a trainer
    ///
    /// # Arguments
    /// * `model` - The model to train (taken by ownership; the trainer is its
    ///   only mutator)
    /// * `train_loader` - Training batches
    /// * `val_loader` - Validation batches; evaluation is skipped when absent
    /// * `tokenizer` - Used only to decode the monitoring sample
    /// * `training` - Loop hyperparameters
    /// * `optimizer_settings` - Optimizer and scheduler hyperparameters
    /// * `output_dir` - Directory receiving checkpoints and the history log
    pub fn new(
        model: VoltLM,
        train_loader: DataLoader,
        val_loader: Option<DataLoader>,
        tokenizer: Option<Tokenizer>,
        training: TrainingSection,
        optimizer_settings: OptimizerSection,
        output_dir: PathBuf,
    ) -> Result<Self> {
        if training.accumulation_steps == 0 {
            anyhow::bail!("accumulation_steps must be greater than zero");
        }

        let steps_per_epoch =
            (train_loader.batches_per_epoch() / training.accumulation_steps).max(1);
        let total_steps = (training.num_epochs * steps_per_epoch).max(1);
        let schedule = LrSchedule::new(
            optimizer_settings.learning_rate,
            optimizer_settings.min_lr,
            optimizer_settings.warmup_steps,
            total_steps,
        );
        let scaler = LossScaler::new(training.mixed_precision);

        Ok(Self {
            model,
            train_loader,
            val_loader,
            tokenizer,
            training,
            optimizer_settings,
            schedule,
            scaler,
            history: TrainingHistory::new(),
            global_step: 0,
            epoch: 0,
            best_eval_loss: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            output_dir,
        })
    }

    /// Shared stop flag; setting it requests a best-effort checkpoint and a
    /// clean return at the next micro-batch boundary
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Restore progress from a checkpoint's trainer state
    pub fn restore(&mut self, state: &TrainerState, history: TrainingHistory) {
        self.global_step = state.global_step;
        self.epoch = state.epoch;
        self.best_eval_loss = state.best_eval_loss;
        self.schedule.restore(&state.schedule);
        self.scaler.restore(&state.scaler);
        self.train_loader.restore_state(&state.dataloader);
        self.history = history;
    }

    /// The trained model
    pub fn model(&self) -> &VoltLM {
        &self.model
    }

    /// The training history so far
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Best validation loss seen so far
    pub fn best_eval_loss(&self) -> Option<f32> {
        self.best_eval_loss
    }

    /// Committed optimizer steps
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Run the full training loop
    ///
    /// # Errors
    /// Aborts on missing data, non-finite loss
    /// ([`TrainError::NumericalInstability`]), gradient overflow outside
    /// mixed precision, and any checkpoint I/O failure.
    pub fn run(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output directory: {}", self.output_dir.display())
        })?;

        let mut optimizer = setup_optimizer(&mut self.model, &self.optimizer_settings)?;
        optimizer.set_lr(self.schedule.current_lr());

        let mut accumulator = GradAccumulator::new();
        let mut window_loss_sum = 0.0f32;
        self.model.set_training(true);

        let start_epoch = self.epoch;
        let mut interrupted = false;

        'epochs: for epoch in start_epoch..self.training.num_epochs {
            self.epoch = epoch;

            loop {
                if self.stop_flag.load(Ordering::Relaxed) {
                    interrupted = true;
                    break 'epochs;
                }

                let Some(batch) = self.train_loader.next_batch() else {
                    break;
                };

                let output = self.model.forward_training(
                    &batch.input_ids,
                    Some(&batch.attention_mask),
                    &batch.labels,
                    batch.domain_ids.as_ref(),
                )?;

                let loss_value = output.loss.item();
                if !loss_value.is_finite() {
                    return Err(TrainError::NumericalInstability {
                        step: self.global_step,
                        value: loss_value,
                    }
                    .into());
                }

                output.loss.backward();
                window_loss_sum += loss_value;

                let factor = self.scaler.scale() / self.training.accumulation_steps as f32;
                let mut params = self.model.parameters_mut();
                accumulator.absorb(&mut params, factor);
                drop(params);

                if accumulator.micro_batches() >= self.training.accumulation_steps {
                    let window_avg =
                        window_loss_sum / self.training.accumulation_steps as f32;
                    window_loss_sum = 0.0;

                    let committed =
                        self.commit_step(&mut optimizer, &mut accumulator, window_avg)?;
                    if committed {
                        self.after_step()?;
                    }
                }
            }

            self.train_loader.reset();
        }

        // A partial accumulation window never commits: steps are atomic at
        // micro-batch granularity.
        accumulator.clear();
        optimizer.zero_grad();

        if interrupted {
            self.save_full_checkpoint(FINAL_CHECKPOINT_DIR)
                .context("failed to save interrupt checkpoint")?;
            println!(
                "Interrupted at step {}; checkpoint saved to {}",
                self.global_step,
                self.output_dir.join(FINAL_CHECKPOINT_DIR).display()
            );
            return Ok(());
        }

        if self.val_loader.is_some() {
            let report = self.run_evaluation()?;
            println!(
                "Final evaluation | val_loss={:.4} | ppl={:.2}",
                report.avg_loss, report.perplexity
            );
        }

        self.save_full_checkpoint(FINAL_CHECKPOINT_DIR)
            .context("failed to save final checkpoint")?;
        Ok(())
    }

    /// Commit one optimizer step from the accumulated gradients
    ///
    /// Returns false when the loss scaler skipped the step after detecting
    /// overflow; the scheduler does not advance in that case.
    fn commit_step(
        &mut self,
        optimizer: &mut AdamW,
        accumulator: &mut GradAccumulator,
        window_avg_loss: f32,
    ) -> Result<bool> {
        if accumulator.any_non_finite() {
            if !self.scaler.enabled() {
                return Err(TrainError::GradientOverflow {
                    step: self.global_step,
                }
                .into());
            }
            accumulator.clear();
            optimizer.zero_grad();
            self.scaler.update(true);
            return Ok(false);
        }

        // Unscale before clipping, then commit.
        accumulator.scale_all(1.0 / self.scaler.scale());
        let mut params = self.model.parameters_mut();
        accumulator.write_back(&mut params);
        let grad_norm = clip_grad_norm(&mut params, self.training.max_grad_norm);
        drop(params);

        optimizer.step();
        optimizer.zero_grad();
        self.scaler.update(false);

        let lr = self.schedule.advance();
        optimizer.set_lr(lr);
        self.global_step += 1;

        self.history
            .record_step(self.global_step, self.epoch, window_avg_loss, lr);

        if self.training.log_interval > 0 && self.global_step % self.training.log_interval == 0 {
            println!(
                "Step {}: loss={:.4}, lr={:.2e}, grad_norm={:.3}",
                self.global_step, window_avg_loss, lr, grad_norm
            );
        }

        Ok(true)
    }

    /// Periodic evaluation and checkpointing after a committed step
    fn after_step(&mut self) -> Result<()> {
        if self.training.eval_steps > 0
            && self.global_step % self.training.eval_steps == 0
            && self.val_loader.is_some()
        {
            self.run_evaluation()?;
            self.model.set_training(true);
        }

        if self.training.save_steps > 0 && self.global_step % self.training.save_steps == 0 {
            let name = format!("{STEP_CHECKPOINT_PREFIX}{}", self.global_step);
            self.save_full_checkpoint(&name)?;
            enforce_retention(&self.output_dir, self.training.save_total_limit)?;
        }

        Ok(())
    }

    /// Evaluate the full validation set in no-gradient mode
    ///
    /// Leaves the model in eval mode; callers resume training mode.
    pub fn evaluate(&mut self) -> Result<EvalReport> {
        let val_loader = self
            .val_loader
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no validation data loader configured"))?;

        self.model.set_training(false);
        val_loader.reset();

        let mut total_loss = 0.0f64;
        let mut total_tokens = 0usize;

        while let Some(batch) = val_loader.next_batch() {
            let output = self.model.forward_training(
                &batch.input_ids,
                Some(&batch.attention_mask),
                &batch.labels,
                batch.domain_ids.as_ref(),
            )?;
            total_loss += output.lm_loss as f64 * output.target_tokens as f64;
            total_tokens += output.target_tokens;
        }

        if total_tokens == 0 {
            anyhow::bail!("validation set produced no loss targets");
        }

        let avg_loss = (total_loss / total_tokens as f64) as f32;
        Ok(EvalReport {
            avg_loss,
            perplexity: avg_loss.exp(),
        })
    }

    /// Evaluation plus best-checkpoint bookkeeping and the monitoring sample
    fn run_evaluation(&mut self) -> Result<EvalReport> {
        let report = self.evaluate()?;
        let lr = self.schedule.current_lr();
        self.history
            .record_eval(self.global_step, self.epoch, report.avg_loss, lr, report.avg_loss);

        let improved = self.best_eval_loss.map_or(true, |best| report.avg_loss < best);
        println!(
            "Step {:05} | val_loss={:.4} | ppl={:.2}{}",
            self.global_step,
            report.avg_loss,
            report.perplexity,
            if improved { " | new best" } else { "" }
        );

        if improved {
            self.best_eval_loss = Some(report.avg_loss);
            self.save_full_checkpoint(BEST_CHECKPOINT_DIR)
                .context("failed to save best checkpoint")?;
        }

        self.print_monitor_sample();
        Ok(report)
    }

    /// Print a short greedy sample for human inspection (observational only)
    fn print_monitor_sample(&self) {
        let Some(tokenizer) = &self.tokenizer else {
            return;
        };

        let sample = (|| -> Result<String> {
            let mut prompt = vec![self.model.config().bos_token_id];
            prompt.extend(tokenizer.encode(&self.training.monitor_prompt)?);

            let config = GenerationConfig {
                max_new_tokens: 24,
                ..GenerationConfig::default()
            };
            let mut rng = StdRng::seed_from_u64(self.training.seed ^ self.global_step as u64);
            let ids = generate(&self.model, &prompt, &config, &mut rng)?;
            tokenizer.decode(&ids)
        })();

        match sample {
            Ok(text) => println!("Sample: {text}"),
            Err(e) => println!("Sample generation failed: {e}"),
        }
    }

    /// Save model weights, config, trainer state and history under `name`
    fn save_full_checkpoint(&self, name: &str) -> Result<PathBuf> {
        let dir = self.output_dir.join(name);
        save_checkpoint(&self.model, &dir)?;

        let state = TrainerState {
            global_step: self.global_step,
            epoch: self.epoch,
            best_eval_loss: self.best_eval_loss,
            learning_rate: self.schedule.current_lr(),
            schedule: self.schedule.state(),
            scaler: self.scaler.state(),
            dataloader: self.train_loader.state(),
            optimizer: self.optimizer_settings.clone(),
        };
        let json =
            serde_json::to_string_pretty(&state).context("failed to serialize trainer state")?;
        std::fs::write(dir.join(TRAINING_STATE_FILE), json)
            .with_context(|| format!("failed to write trainer state in {}", dir.display()))?;

        self.history.save(&dir.join(HISTORY_FILE))?;
        Ok(dir)
    }
}

/// Load the trainer state blob from a checkpoint directory
pub fn load_trainer_state(dir: &Path) -> Result<TrainerState> {
    let path = dir.join(TRAINING_STATE_FILE);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read trainer state: {}", path.display()))?;
    serde_json::from_str(&json).context("failed to parse trainer state")
}

/// Delete step checkpoints beyond the retention limit, oldest first
///
/// Only directories named `checkpoint_step_<N>` participate; the best and
/// final checkpoints are never touched.
///
/// # Returns
/// Number of checkpoints removed.
pub fn enforce_retention(output_dir: &Path, limit: usize) -> Result<usize> {
    let mut steps: Vec<(usize, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("failed to read output directory: {}", output_dir.display()))?
    {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(step) = name
            .strip_prefix(STEP_CHECKPOINT_PREFIX)
            .and_then(|s| s.parse::<usize>().ok())
        {
            steps.push((step, path));
        }
    }

    steps.sort_by_key(|(step, _)| *step);

    let mut removed = 0;
    while steps.len() > limit {
        let (_, path) = steps.remove(0);
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove old checkpoint: {}", path.display()))?;
        removed += 1;
    }

    Ok(removed)
}
