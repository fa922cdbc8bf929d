use anyhow::{bail, ensure, Result};
use gilnet_core::{BestAccuracy, EvaluationMetrics, StepMetrics};
use serde::{Deserialize, Serialize};

pub const BENCHMARK_TOLERANCE: f32 = 5e-3;

/// Final metrics of a capped run, replayed to detect nondeterminism or regressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSnapshot {
    pub final_train: StepMetrics,
    pub final_test: EvaluationMetrics,
    pub best: Option<BestAccuracy>,
}

/// Compare a fresh run against the stored snapshot within `BENCHMARK_TOLERANCE`.
pub fn validate_benchmark(actual: &BenchmarkSnapshot, reference: &BenchmarkSnapshot) -> Result<()> {
    ensure!(
        actual.final_train.step == reference.final_train.step,
        "run finished at step {} but the benchmark ended at step {}",
        actual.final_train.step,
        reference.final_train.step
    );

    let pairs = [
        ("final train loss", actual.final_train.loss, reference.final_train.loss),
        (
            "final train accuracy",
            actual.final_train.accuracy,
            reference.final_train.accuracy,
        ),
        ("final held-out loss", actual.final_test.loss, reference.final_test.loss),
        (
            "final held-out accuracy",
            actual.final_test.accuracy,
            reference.final_test.accuracy,
        ),
    ];
    for (label, value, expected) in pairs {
        ensure_close(label, value, expected)?;
    }

    match (actual.best, reference.best) {
        (None, None) => Ok(()),
        (Some(best), Some(expected)) => {
            ensure_close("best held-out accuracy", best.accuracy, expected.accuracy)?;
            ensure!(
                best.step == expected.step,
                "best held-out accuracy moved from step {} to step {}",
                expected.step,
                best.step
            );
            Ok(())
        }
        (best, _) => bail!(
            "benchmark {} an evaluation checkpoint but this run {}; re-record it if the schedule changed",
            if reference.best.is_some() { "has" } else { "lacks" },
            if best.is_some() { "has one" } else { "has none" }
        ),
    }
}

fn ensure_close(label: &str, value: f32, expected: f32) -> Result<()> {
    ensure!(
        (value - expected).abs() <= BENCHMARK_TOLERANCE,
        "{label} drifted from the benchmark: {value:.4} vs {expected:.4} (tolerance {BENCHMARK_TOLERANCE})"
    );
    Ok(())
}
