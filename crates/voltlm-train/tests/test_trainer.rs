//! Integration tests for the training loop

use std::path::Path;
use tempfile::TempDir;
use voltlm_model::{VoltConfig, VoltLM};
use voltlm_train::{
    config::{OptimizerSection, TrainingSection},
    dataloader::DataLoader,
    dataset::{Dataset, TrainingExample},
    enforce_retention,
    trainer::{Trainer, BEST_CHECKPOINT_DIR, FINAL_CHECKPOINT_DIR},
};

fn tiny_model_config() -> VoltConfig {
    VoltConfig {
        vocab_size: 32,
        max_position_embeddings: 8,
        hidden_size: 16,
        num_attention_heads: 4,
        num_hidden_layers: 1,
        intermediate_size: 32,
        dropout: 0.0,
        seed: Some(42),
        ..VoltConfig::default()
    }
}

fn synthetic_example(seed: u32) -> TrainingExample {
    let ids: Vec<u32> = (0..4).map(|i| (seed * 7 + i * 3) % 32).collect();
    TrainingExample {
        labels: ids.iter().map(|&id| id as i64).collect(),
        attention_mask: vec![1; 4],
        input_ids: ids,
        domain_id: None,
    }
}

fn synthetic_dataset(n: u32) -> Dataset {
    Dataset::from_examples((0..n).map(synthetic_example).collect()).expect("valid examples")
}

fn quiet_training(batch_size: usize) -> TrainingSection {
    TrainingSection {
        batch_size,
        num_epochs: 1,
        accumulation_steps: 1,
        eval_steps: 0,
        save_steps: 0,
        log_interval: 0,
        ..TrainingSection::default()
    }
}

fn make_checkpoint_dir(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), b"{}").unwrap();
}

#[test]
fn test_retention_deletes_oldest_first_and_spares_best() {
    let root = TempDir::new().unwrap();
    // save_total_limit + 2 step checkpoints, plus best and final.
    for step in [100, 200, 300, 400, 500] {
        make_checkpoint_dir(root.path(), &format!("checkpoint_step_{step}"));
    }
    make_checkpoint_dir(root.path(), BEST_CHECKPOINT_DIR);
    make_checkpoint_dir(root.path(), FINAL_CHECKPOINT_DIR);

    let removed = enforce_retention(root.path(), 3).unwrap();
    assert_eq!(removed, 2);

    assert!(!root.path().join("checkpoint_step_100").exists());
    assert!(!root.path().join("checkpoint_step_200").exists());
    assert!(root.path().join("checkpoint_step_300").exists());
    assert!(root.path().join("checkpoint_step_400").exists());
    assert!(root.path().join("checkpoint_step_500").exists());
    assert!(root.path().join(BEST_CHECKPOINT_DIR).exists());
    assert!(root.path().join(FINAL_CHECKPOINT_DIR).exists());
}

#[test]
fn test_retention_is_stable_when_under_limit() {
    let root = TempDir::new().unwrap();
    make_checkpoint_dir(root.path(), "checkpoint_step_10");
    let removed = enforce_retention(root.path(), 3).unwrap();
    assert_eq!(removed, 0);
    assert!(root.path().join("checkpoint_step_10").exists());
}

#[test]
fn test_accumulated_micro_losses_match_large_batch() {
    // Four micro-batches of size 1 against one batch of the same four
    // examples: every example contributes the same number of targets, so the
    // mean of the micro losses equals the combined-batch loss.
    let model = VoltLM::new(tiny_model_config()).unwrap();
    let dataset = synthetic_dataset(4);

    let mut micro_loader = DataLoader::new(synthetic_dataset(4), 1, 9).unwrap();
    let mut micro_losses = Vec::new();
    while let Some(batch) = micro_loader.next_batch() {
        let out = model
            .forward_training(
                &batch.input_ids,
                Some(&batch.attention_mask),
                &batch.labels,
                None,
            )
            .unwrap();
        micro_losses.push(out.loss.item());
    }
    assert_eq!(micro_losses.len(), 4);
    let micro_mean: f32 = micro_losses.iter().sum::<f32>() / 4.0;

    let mut full_loader = DataLoader::new(dataset, 4, 9).unwrap();
    let batch = full_loader.next_batch().unwrap();
    let full = model
        .forward_training(
            &batch.input_ids,
            Some(&batch.attention_mask),
            &batch.labels,
            None,
        )
        .unwrap();

    assert!(
        (micro_mean - full.loss.item()).abs() < 1e-4,
        "micro mean {micro_mean} vs full-batch {}",
        full.loss.item()
    );
}

#[test]
fn test_trainer_run_produces_final_checkpoint_and_history() {
    let model = VoltLM::new(tiny_model_config()).unwrap();
    let train_loader = DataLoader::new(synthetic_dataset(8), 2, 42).unwrap();
    let val_loader = DataLoader::new(synthetic_dataset(4), 2, 42).unwrap();
    let output = TempDir::new().unwrap();

    let training = TrainingSection {
        eval_steps: 2,
        save_steps: 2,
        save_total_limit: 1,
        ..quiet_training(2)
    };
    let mut trainer = Trainer::new(
        model,
        train_loader,
        Some(val_loader),
        None,
        training,
        OptimizerSection::default(),
        output.path().to_path_buf(),
    )
    .unwrap();

    trainer.run().unwrap();

    assert_eq!(trainer.global_step(), 4);
    assert!(!trainer.history().is_empty());
    assert!(trainer.best_eval_loss().is_some());

    let final_dir = output.path().join(FINAL_CHECKPOINT_DIR);
    assert!(final_dir.join("model.safetensors").exists());
    assert!(final_dir.join("config.json").exists());
    assert!(final_dir.join("training_state.json").exists());
    assert!(final_dir.join("training_history.json").exists());

    // save_steps=2 over 4 steps creates two step checkpoints; limit 1 keeps
    // only the newest.
    assert!(!output.path().join("checkpoint_step_2").exists());
    assert!(output.path().join("checkpoint_step_4").exists());
    assert!(output.path().join(BEST_CHECKPOINT_DIR).exists());
}

#[test]
fn test_stop_flag_saves_best_effort_checkpoint() {
    let model = VoltLM::new(tiny_model_config()).unwrap();
    let train_loader = DataLoader::new(synthetic_dataset(8), 2, 42).unwrap();
    let output = TempDir::new().unwrap();

    let mut trainer = Trainer::new(
        model,
        train_loader,
        None,
        None,
        quiet_training(2),
        OptimizerSection::default(),
        output.path().to_path_buf(),
    )
    .unwrap();

    trainer
        .stop_handle()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    trainer.run().unwrap();

    // No step was taken, but the interrupt checkpoint exists.
    assert_eq!(trainer.global_step(), 0);
    assert!(output
        .path()
        .join(FINAL_CHECKPOINT_DIR)
        .join("config.json")
        .exists());
}

#[test]
fn test_evaluate_reports_perplexity() {
    let model = VoltLM::new(tiny_model_config()).unwrap();
    let train_loader = DataLoader::new(synthetic_dataset(4), 2, 42).unwrap();
    let val_loader = DataLoader::new(synthetic_dataset(4), 2, 42).unwrap();
    let output = TempDir::new().unwrap();

    let mut trainer = Trainer::new(
        model,
        train_loader,
        Some(val_loader),
        None,
        quiet_training(2),
        OptimizerSection::default(),
        output.path().to_path_buf(),
    )
    .unwrap();

    let report = trainer.evaluate().unwrap();
    assert!(report.avg_loss.is_finite());
    assert!(report.avg_loss >= 0.0);
    assert!((report.perplexity - report.avg_loss.exp()).abs() < 1e-4);
}
