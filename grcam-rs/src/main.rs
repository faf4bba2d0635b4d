//! CLI entry point for grcam-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grcam_rs::data::SyntheticDataset;
use grcam_rs::{GrcamConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "grcam")]
#[command(about = "Glimpse-based recurrent attention model trained with REINFORCE")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Train on a synthetic dataset
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint directory
        #[arg(long)]
        resume: Option<String>,
        /// Number of synthetic examples
        #[arg(long, default_value_t = 256)]
        samples: usize,
    },
    /// Evaluate a checkpoint on a synthetic dataset
    Evaluate {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: String,
        /// Number of synthetic examples
        #[arg(long, default_value_t = 128)]
        samples: usize,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (tiny, mnist)
        #[arg(long, default_value = "tiny")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = GrcamConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Signal: {}x{}, glimpse {}x{}",
                config.model.img_height,
                config.model.img_width,
                config.model.glimpse_height,
                config.model.glimpse_width
            );
            println!("  Glimpses: {}", config.model.nb_glimpses);
            println!("  Classes: {}", config.model.nb_classes);
        }
        Commands::Train {
            config,
            resume,
            samples,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = GrcamConfig::from_file(&config)?;
            config.validate()?;
            let dataset = SyntheticDataset::generate(&config.model, samples, config.seed);

            let mut trainer = Trainer::new(config)?;
            if let Some(checkpoint) = resume {
                trainer.resume_from(&checkpoint)?;
            }
            trainer.train(&dataset)?;
            println!("✓ Trained to global step {}", trainer.global_step());
        }
        Commands::Evaluate {
            config,
            checkpoint,
            samples,
        } => {
            tracing::info!("Evaluating checkpoint: {}", checkpoint);
            let config = GrcamConfig::from_file(&config)?;
            config.validate()?;
            // Held-out examples: a different stream from the training default.
            let dataset = SyntheticDataset::generate(&config.model, samples, config.seed.wrapping_add(1));

            let mut trainer = Trainer::new(config)?;
            trainer.load_checkpoint(&checkpoint)?;

            let batch_size = trainer.config().training.batch_size;
            let batches = dataset.batches(batch_size, trainer.device())?;
            let mut correct = 0.0;
            for batch in &batches {
                let eval = trainer.evaluate(batch)?;
                correct += eval.accuracy * batch.len() as f64;
            }
            let accuracy = if dataset.is_empty() {
                0.0
            } else {
                correct / dataset.len() as f64
            };
            println!("✓ Accuracy: {:.4} over {} examples", accuracy, dataset.len());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = GrcamConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
