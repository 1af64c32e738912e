//! Training binary for the voltlm language model
//!
//! Maps CLI flags onto the configuration file, loads the tokenizer and the
//! pre-tokenized dataset, builds (or resumes) the model, and runs the
//! trainer.
//!
//! # Usage
//!
//! ```bash
//! voltlm-train \
//!   --data-dir ./data \
//!   --output-dir ./checkpoints \
//!   [--config config.json] \
//!   [--model-size tiny|small|base] \
//!   [--batch-size 16] [--learning-rate 3e-4] [--epochs 3] \
//!   [--mixed-precision] [--resume ./checkpoints/checkpoint_step_500] \
//!   [--seed 42] [--quiet]
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use voltlm_model::{load_checkpoint, VoltLM};
use voltlm_tokenizer::Tokenizer;
use voltlm_train::{
    config::{ModelSection, TrainConfigFile},
    dataloader::DataLoader,
    dataset::{Dataset, TRAIN_FILE, VAL_FILE},
    history::TrainingHistory,
    trainer::{load_trainer_state, Trainer, HISTORY_FILE},
};

/// Train the voltlm causal language model
#[derive(Parser, Debug)]
#[command(name = "voltlm-train")]
#[command(about = "Train the voltlm causal language model", long_about = None)]
struct Args {
    /// Path to a JSON training configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory with tokenizer.json, train.jsonl and optional val.jsonl
    #[arg(long, value_name = "PATH", required = true)]
    data_dir: PathBuf,

    /// Directory for checkpoints and the training history
    #[arg(long, value_name = "PATH", required = true)]
    output_dir: PathBuf,

    /// Model size preset (tiny, small or base)
    #[arg(long, value_name = "SIZE")]
    model_size: Option<String>,

    /// Micro-batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    learning_rate: Option<f32>,

    /// Number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Enable mixed precision (dynamic loss scaling)
    #[arg(long)]
    mixed_precision: bool,

    /// Checkpoint directory to resume from
    #[arg(long, value_name = "PATH")]
    resume: Option<PathBuf>,

    /// Random seed for initialization, shuffling and sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Suppress step logs
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainConfigFile::from_file(path).context("failed to load config file")?,
        None => TrainConfigFile::default(),
    };
    apply_overrides(&mut config, &args)?;

    // The tokenizer and the preprocessed dataset must exist before any model
    // is constructed.
    let tokenizer = Tokenizer::from_directory(&args.data_dir)
        .context("the data-preparation pipeline must provide a tokenizer")?;

    let max_seq_len = config.model.max_position_embeddings;
    let train_dataset = Dataset::load(&args.data_dir.join(TRAIN_FILE), max_seq_len)
        .context("failed to load training split")?;
    let val_path = args.data_dir.join(VAL_FILE);
    let val_dataset = if val_path.exists() {
        Some(Dataset::load(&val_path, max_seq_len).context("failed to load validation split")?)
    } else {
        None
    };

    let vocab_size = tokenizer.vocab_size();
    let model_config = config.model.to_model_config(
        vocab_size,
        tokenizer.bos_id()?,
        tokenizer.eos_id()?,
        tokenizer.pad_id()?,
        Some(config.training.seed),
    )?;

    train_dataset.validate_against(vocab_size, model_config.num_domains)?;
    if let Some(ref val) = val_dataset {
        val.validate_against(vocab_size, model_config.num_domains)?;
    }

    let model = match &args.resume {
        Some(dir) => {
            let mut model = load_checkpoint(dir, Some(vocab_size))
                .with_context(|| format!("failed to resume from {}", dir.display()))?;
            model.set_training(true);
            model
        }
        None => VoltLM::new(model_config)?,
    };

    let train_loader = DataLoader::new(
        train_dataset,
        config.training.batch_size,
        config.training.seed,
    )?;
    let val_loader = val_dataset
        .map(|dataset| DataLoader::new(dataset, config.training.batch_size, config.training.seed))
        .transpose()?;

    let mut trainer = Trainer::new(
        model,
        train_loader,
        val_loader,
        Some(tokenizer),
        config.training.clone(),
        config.optimizer.clone(),
        args.output_dir.clone(),
    )?;

    if let Some(dir) = &args.resume {
        let state = load_trainer_state(dir)
            .with_context(|| format!("failed to load trainer state from {}", dir.display()))?;
        let history_path = dir.join(HISTORY_FILE);
        let history = if history_path.exists() {
            TrainingHistory::load(&history_path)?
        } else {
            TrainingHistory::new()
        };
        trainer.restore(&state, history);
        println!("Resumed at step {} (epoch {})", state.global_step, state.epoch);
    }

    trainer.run().context("training failed")?;

    if !args.quiet {
        println!(
            "Training complete: {} optimizer steps, checkpoints in {}",
            trainer.global_step(),
            args.output_dir.display()
        );
    }

    Ok(())
}

/// Fold CLI overrides into the loaded configuration
fn apply_overrides(config: &mut TrainConfigFile, args: &Args) -> Result<()> {
    if let Some(size) = &args.model_size {
        config.model = ModelSection::preset(size)?;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.optimizer.learning_rate = lr;
    }
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if args.mixed_precision {
        config.training.mixed_precision = true;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if args.quiet {
        config.training.log_interval = 0;
    }
    Ok(())
}
