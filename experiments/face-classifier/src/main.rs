mod args;
mod average;
mod benchmark;
mod clip;
mod dataset;
mod model;
mod notebook;
mod training;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use gilnet_core::{
    ensure_report_file, load_json, load_or_init, logging, save_json, stream_rng, ExperimentMode,
    RngStream, DEFAULT_REPORT_TEMPLATE,
};
use log::info;

use crate::{
    args::{Args, Hyperparameters},
    benchmark::{validate_benchmark, BenchmarkSnapshot, BENCHMARK_TOLERANCE},
    dataset::{load_dataset, FaceDataset},
    notebook::{sample_predictions, write_report, RunSummary},
    training::{ExperimentConstants, Trainer},
};

const SAMPLE_COUNT: usize = 3;
const TEST_EPOCHS: usize = 1;

type TrainingBackend = Autodiff<NdArray<f32>>;

struct ExperimentPaths {
    config: PathBuf,
    report: PathBuf,
    benchmark: PathBuf,
}

fn main() -> Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let mut hyperparameters = args.hyperparameters()?;
    hyperparameters.num_epochs = args
        .mode
        .select(hyperparameters.num_epochs, hyperparameters.num_epochs.min(TEST_EPOCHS));

    let paths = initialize_paths(args.output_dir.as_deref())?;
    let constants: ExperimentConstants = load_or_init(&paths.config, ExperimentConstants::default)?;
    ensure_report_file(&paths.report, DEFAULT_REPORT_TEMPLATE)?;
    let benchmark: Option<BenchmarkSnapshot> = load_json(&paths.benchmark)?;

    info!("running gilnet face classifier in {} mode", args.mode);
    logging::emit_parameters(hyperparameters.parameters());

    println!("Loading data...");
    let dataset = load_dataset(
        &args.dataset_file,
        hyperparameters.folder_to_test,
        hyperparameters.image_size,
    )?;

    let snapshot = run_experiment(&hyperparameters, &constants, &dataset, &paths.report)?;

    match args.mode {
        ExperimentMode::Full => {
            if benchmark.is_none() {
                info!("no benchmark snapshot recorded yet; run with --mode test to capture one.");
            }
        }
        ExperimentMode::Test => {
            if let Some(reference) = benchmark {
                validate_benchmark(&snapshot, &reference)?;
                info!(
                    "benchmark check passed (tolerance {:.1e})",
                    BENCHMARK_TOLERANCE
                );
            } else {
                save_json(&paths.benchmark, &snapshot)?;
                info!(
                    "saved new benchmark snapshot to {}",
                    paths.benchmark.display()
                );
            }
        }
    }

    Ok(())
}

fn initialize_paths(output_dir: Option<&Path>) -> Result<ExperimentPaths> {
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("experiments/face_gilnet"),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create experiment directory {}", dir.display()))?;

    Ok(ExperimentPaths {
        config: dir.join("config.json"),
        report: dir.join("report.md"),
        benchmark: dir.join("benchmark.json"),
    })
}

fn run_experiment(
    hyperparameters: &Hyperparameters,
    constants: &ExperimentConstants,
    dataset: &FaceDataset,
    report: &Path,
) -> Result<BenchmarkSnapshot> {
    let device = NdArrayDevice::Cpu;
    let mut trainer: Trainer<TrainingBackend> = Trainer::new(
        hyperparameters,
        constants,
        dataset.num_classes(),
        dataset.channel_means.clone(),
        &device,
    )?;

    trainer.fit(
        &dataset.train,
        &dataset.test,
        stream_rng(constants.seed, RngStream::Shuffle),
    )?;

    let final_test = trainer.measure(&dataset.test)?;
    let state = trainer.state();
    let final_train = state
        .last_step
        .clone()
        .ok_or_else(|| anyhow!("training produced no steps"))?;
    info!(
        "finished after {} steps: held-out loss {:.4}, accuracy {:.4}",
        state.global_step, final_test.loss, final_test.accuracy
    );

    let model = trainer.evaluation_model();
    let test_samples = sample_predictions(
        &model,
        &dataset.test,
        &dataset.classes,
        dataset.image_size,
        SAMPLE_COUNT,
    )?;
    let train_samples = sample_predictions(
        &model,
        &dataset.train,
        &dataset.classes,
        dataset.image_size,
        SAMPLE_COUNT,
    )?;

    write_report(
        report,
        &RunSummary {
            hyperparameters,
            constants,
            channel_means: &dataset.channel_means,
            classes: &dataset.classes,
            history: &state.history,
            final_train: Some(&final_train),
            final_test,
            test_samples: &test_samples,
            train_samples: &train_samples,
        },
    )?;
    info!("report written to {}", report.display());

    Ok(BenchmarkSnapshot {
        final_train,
        final_test,
        best: state.history.best(),
    })
}
