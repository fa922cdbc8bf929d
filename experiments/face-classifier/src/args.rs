use std::path::PathBuf;

use clap::Parser;
use gilnet_core::ExperimentMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be positive")]
    NotPositive { name: &'static str },
    #[error("dropout keep probability must be in (0, 1], got {0}")]
    KeepProbability(f64),
    #[error("{name} must be a finite non-negative number, got {value}")]
    InvalidRate { name: &'static str, value: f64 },
    #[error("image size {size} is too small for the network (minimum {minimum})")]
    ImageTooSmall { size: usize, minimum: usize },
}

/// Train the gilnet face classifier on one cross-validation fold.
#[derive(Parser, Debug, Clone)]
#[command(name = "gilnet-experiment-faces")]
pub struct Args {
    /// Root directory holding the `fold_<k>/<class>/` image folders
    #[arg(long, default_value = "faces_dataset")]
    pub dataset_file: PathBuf,

    /// Fold number used as the held-out set
    #[arg(long, default_value_t = 1)]
    pub folder_to_test: usize,

    /// Dropout keep probability during training
    #[arg(long, default_value_t = 0.5)]
    pub dropout_keep_prob: f64,

    /// L2 regularization lambda
    #[arg(long, default_value_t = 0.001)]
    pub l2_reg_lambda: f64,

    /// Starter learning rate
    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 200)]
    pub num_epochs: usize,

    /// Evaluate on the held-out fold after this many steps
    #[arg(long, default_value_t = 50)]
    pub evaluate_every: usize,

    /// Evaluate with an exponential moving average of the parameters
    #[arg(long)]
    pub enable_moving_average: bool,

    /// Side length images are resized to
    #[arg(long, default_value_t = 227)]
    pub image_size: usize,

    #[arg(long, short, value_enum, default_value_t = ExperimentMode::Full)]
    pub mode: ExperimentMode,

    /// Directory for config.json, report.md and benchmark.json
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// Validated run hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub folder_to_test: usize,
    pub dropout_keep_prob: f64,
    pub l2_reg_lambda: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub evaluate_every: usize,
    pub enable_moving_average: bool,
    pub image_size: usize,
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("folder_to_test", self.folder_to_test),
            ("batch_size", self.batch_size),
            ("num_epochs", self.num_epochs),
            ("evaluate_every", self.evaluate_every),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }

        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(ConfigError::KeepProbability(self.dropout_keep_prob));
        }

        for (name, value) in [
            ("l2_reg_lambda", self.l2_reg_lambda),
            ("learning_rate", self.learning_rate),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidRate { name, value });
            }
        }

        Ok(())
    }

    /// `name=value` pairs for the startup banner.
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("folder_to_test", self.folder_to_test.to_string()),
            ("dropout_keep_prob", self.dropout_keep_prob.to_string()),
            ("l2_reg_lambda", self.l2_reg_lambda.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("num_epochs", self.num_epochs.to_string()),
            ("evaluate_every", self.evaluate_every.to_string()),
            (
                "enable_moving_average",
                self.enable_moving_average.to_string(),
            ),
            ("image_size", self.image_size.to_string()),
        ]
    }
}

impl Args {
    pub fn hyperparameters(&self) -> Result<Hyperparameters, ConfigError> {
        let hyperparameters = Hyperparameters {
            folder_to_test: self.folder_to_test,
            dropout_keep_prob: self.dropout_keep_prob,
            l2_reg_lambda: self.l2_reg_lambda,
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            num_epochs: self.num_epochs,
            evaluate_every: self.evaluate_every,
            enable_moving_average: self.enable_moving_average,
            image_size: self.image_size,
        };
        hyperparameters.validate()?;
        Ok(hyperparameters)
    }
}
