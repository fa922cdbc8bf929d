use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub learning_rate: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// Aggregates one pass over a held-out set.
///
/// Every sample gets a slot in a result buffer sized to the whole set; a batch
/// writes `|predicted - true|` into the slots at the current cumulative
/// position. Slots never written keep a non-zero residual and count as misses.
#[derive(Clone, Debug)]
pub struct EvaluationAccumulator {
    residuals: Vec<usize>,
    position: usize,
    loss_sum: f64,
    batches: usize,
}

impl EvaluationAccumulator {
    pub fn new(total_samples: usize) -> Self {
        Self {
            residuals: vec![1; total_samples],
            position: 0,
            loss_sum: 0.0,
            batches: 0,
        }
    }

    pub fn push_batch(&mut self, loss: f32, predictions: &[usize], targets: &[usize]) -> Result<()> {
        if predictions.len() != targets.len() {
            bail!(
                "prediction count {} does not match target count {}",
                predictions.len(),
                targets.len()
            );
        }
        let end = self.position + predictions.len();
        if end > self.residuals.len() {
            bail!(
                "evaluation batch overflows result buffer ({} > {})",
                end,
                self.residuals.len()
            );
        }

        for (slot, (&predicted, &target)) in self.residuals[self.position..end]
            .iter_mut()
            .zip(predictions.iter().zip(targets))
        {
            *slot = predicted.abs_diff(target);
        }

        self.position = end;
        self.loss_sum += f64::from(loss);
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Average batch loss and exact-match accuracy over the whole buffer.
    pub fn finish(&self) -> EvaluationMetrics {
        let loss = if self.batches == 0 {
            0.0
        } else {
            (self.loss_sum / self.batches as f64) as f32
        };
        let accuracy = if self.residuals.is_empty() {
            0.0
        } else {
            let hits = self.residuals.iter().filter(|&&residual| residual == 0).count();
            hits as f32 / self.residuals.len() as f32
        };

        EvaluationMetrics { loss, accuracy }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub step: usize,
    pub metrics: EvaluationMetrics,
}

/// Best accuracy seen so far and the step of its first occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestAccuracy {
    pub accuracy: f32,
    pub step: usize,
}

/// Append-only log of evaluation results.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccuracyHistory {
    records: Vec<EvaluationRecord>,
    best: Option<BestAccuracy>,
}

impl AccuracyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: usize, metrics: EvaluationMetrics) -> BestAccuracy {
        self.records.push(EvaluationRecord { step, metrics });
        let candidate = BestAccuracy {
            accuracy: metrics.accuracy,
            step,
        };
        let best = keep_best(self.best, candidate);
        self.best = Some(best);
        best
    }

    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn best(&self) -> Option<BestAccuracy> {
        self.best
    }

    /// Running maximum after each evaluation; ties keep the earlier step.
    pub fn running_best(&self) -> impl Iterator<Item = BestAccuracy> + '_ {
        self.records
            .iter()
            .scan(None::<BestAccuracy>, |best, record| {
                let candidate = BestAccuracy {
                    accuracy: record.metrics.accuracy,
                    step: record.step,
                };
                let next = keep_best(*best, candidate);
                *best = Some(next);
                Some(next)
            })
    }
}

/// Ties keep `current`, so the earliest step reaching the maximum wins.
fn keep_best(current: Option<BestAccuracy>, candidate: BestAccuracy) -> BestAccuracy {
    match current {
        Some(current) if current.accuracy >= candidate.accuracy => current,
        _ => candidate,
    }
}
