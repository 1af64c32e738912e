//! Training loop for the voltlm language model
//!
//! This crate owns everything between a pre-tokenized dataset on disk and a
//! finished checkpoint directory: configuration files, batching, optimizer
//! and scheduler construction, gradient accumulation and clipping, dynamic
//! loss scaling, evaluation, checkpoint retention, and the training binary.

pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod history;
pub mod optimizer;
pub mod scaler;
pub mod schedule;
pub mod trainer;

/// Configuration file sections
pub use config::{ModelSection, OptimizerSection, TrainConfigFile, TrainingSection};

/// Dataset loading and its errors
pub use dataset::{DataError, Dataset, TrainingExample, TRAIN_FILE, VAL_FILE};

/// Batching
pub use dataloader::{Batch, DataLoader, DataLoaderState};

/// Training history
pub use history::{HistoryRecord, TrainingHistory};

/// The trainer and its fatal errors
pub use trainer::{
    enforce_retention, load_trainer_state, EvalReport, TrainError, Trainer, TrainerState,
    BEST_CHECKPOINT_DIR, FINAL_CHECKPOINT_DIR, HISTORY_FILE, STEP_CHECKPOINT_PREFIX,
    TRAINING_STATE_FILE,
};
