use anyhow::{bail, ensure, Context, Result};
use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use procare_seg::{
    calculate_average_ssim,
    config::{Command, EvaluateArgs, PredictArgs, TrainArgs},
    Config, MaskProcessor, ModelArtifact, Trainer,
};

type TrainingBackend = Autodiff<NdArray<f32>>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    match config.command {
        Command::Train(args) => train(args),
        Command::Predict(args) => predict(args),
        Command::Evaluate(args) => evaluate(args),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    ensure!(args.images_dir.is_dir(), "Images directory does not exist");
    ensure!(args.masks_dir.is_dir(), "Masks directory does not exist");

    let artifact = ModelArtifact::create(&args.artifact_dir)
        .with_context(|| format!("Failed to prepare {}", args.artifact_dir.display()))?;
    let trainer =
        Trainer::<TrainingBackend>::new(args.training_config(), artifact, Default::default());
    let outcome = trainer.run(&args.layout()).context("Training failed")?;

    let report = outcome.report;
    println!(
        "Validation Loss: {}, Validation Accuracy: {}",
        report.final_validation.loss, report.final_validation.accuracy
    );
    if let (Some(epoch), Some(loss)) = (report.best_epoch, report.best_validation_loss) {
        println!("Best epoch: {epoch} (val_loss {loss:.4}), epochs run: {}", report.epochs_run);
    }
    Ok(())
}

fn predict(args: PredictArgs) -> Result<()> {
    ensure!(args.input_dir.exists(), "Input directory does not exist");
    ensure!(args.model_path.is_dir(), "Model path does not exist");

    let processor = MaskProcessor::with_trained_model(args).context("Failed to load model")?;
    let written = processor.process_directory()?;
    println!("{written} masks written");
    Ok(())
}

fn evaluate(args: EvaluateArgs) -> Result<()> {
    match calculate_average_ssim(&args.reference_dir, &args.candidate_dir) {
        Some(average) => {
            println!("Average Structural Similarity Index (SSIM): {average:.4}");
            Ok(())
        }
        None => bail!("SSIM evaluation failed"),
    }
}
