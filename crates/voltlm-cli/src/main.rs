//! Generation CLI over saved voltlm checkpoints
//!
//! Loads a checkpoint directory and its tokenizer, encodes the prompt, and
//! prints the generated continuation.
//!
//! # Usage
//!
//! ```bash
//! voltlm generate \
//!   --checkpoint ./checkpoints/checkpoint_best \
//!   --tokenizer-dir ./data \
//!   --prompt "Grid demand in the region" \
//!   [--max-new-tokens 64] [--temperature 1.0] \
//!   [--sample] [--top-k 50] [--top-p 0.9] [--seed 42]
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use voltlm_model::{generate, load_checkpoint, GenerationConfig};
use voltlm_tokenizer::Tokenizer;

/// Inference over saved voltlm checkpoints
#[derive(Parser, Debug)]
#[command(name = "voltlm")]
#[command(about = "Inference over saved voltlm checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a continuation of a prompt
    Generate {
        /// Checkpoint directory to load
        #[arg(long, value_name = "PATH")]
        checkpoint: PathBuf,

        /// Directory holding tokenizer.json
        #[arg(long, value_name = "PATH")]
        tokenizer_dir: PathBuf,

        /// Prompt text
        #[arg(long)]
        prompt: String,

        /// Maximum tokens appended after the prompt
        #[arg(long, default_value = "64")]
        max_new_tokens: usize,

        /// Logit divisor; must be positive
        #[arg(long, default_value = "1.0")]
        temperature: f32,

        /// Sample instead of greedy decoding
        #[arg(long)]
        sample: bool,

        /// Keep only the k highest-logit tokens when sampling
        #[arg(long)]
        top_k: Option<usize>,

        /// Nucleus sampling threshold in (0, 1]
        #[arg(long)]
        top_p: Option<f32>,

        /// Sampling seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            checkpoint,
            tokenizer_dir,
            prompt,
            max_new_tokens,
            temperature,
            sample,
            top_k,
            top_p,
            seed,
        } => {
            let tokenizer = Tokenizer::from_directory(&tokenizer_dir)
                .with_context(|| format!("failed to load tokenizer from {}", tokenizer_dir.display()))?;

            let model = load_checkpoint(&checkpoint, Some(tokenizer.vocab_size()))
                .with_context(|| format!("failed to load checkpoint from {}", checkpoint.display()))?;

            let mut prompt_ids = vec![model.config().bos_token_id];
            prompt_ids.extend(tokenizer.encode(&prompt)?);

            let config = GenerationConfig {
                max_new_tokens,
                temperature,
                do_sample: sample,
                top_k,
                top_p,
                eos_token_id: None,
            };
            let mut rng = StdRng::seed_from_u64(seed);

            let ids = generate(&model, &prompt_ids, &config, &mut rng)
                .context("generation failed")?;
            let text = tokenizer.decode(&ids).context("failed to decode output")?;

            println!("{text}");
        }
    }

    Ok(())
}
