use std::fmt::Display;

use chrono::{DateTime, Local, SecondsFormat};

use crate::metrics::{BestAccuracy, EvaluationMetrics, StepMetrics};

/// Install the `env_logger` backend, defaulting to `info` unless `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

pub fn timestamp() -> String {
    format_timestamp(&Local::now())
}

fn format_timestamp(time: &DateTime<Local>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn step_line(metrics: &StepMetrics) -> String {
    format!(
        "Step {}, Loss {}, Acc {}",
        metrics.step, metrics.loss, metrics.accuracy
    )
}

pub fn evaluation_line(metrics: &EvaluationMetrics) -> String {
    format!(
        "Evaluation Summary, Loss {}, Acc {}",
        metrics.loss, metrics.accuracy
    )
}

pub fn best_line(best: &BestAccuracy) -> String {
    format!(
        "Current Max Acc {} with in Iteration {}",
        best.accuracy, best.step
    )
}

/// Print a console progress line prefixed with the current local time.
pub fn emit(line: impl Display) {
    println!("{}: {}", timestamp(), line);
}

/// Print `name=value` pairs sorted by name, as a parameter banner.
pub fn emit_parameters<'a, I>(parameters: I)
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    println!("Parameters:");
    for line in parameter_lines(parameters) {
        println!("{line}");
    }
    println!();
}

fn parameter_lines<'a, I>(parameters: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut pairs: Vec<_> = parameters.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn step_line_format() {
        let line = step_line(&StepMetrics {
            step: 12,
            loss: 0.25,
            accuracy: 0.5,
            learning_rate: 1e-3,
        });
        assert_eq!(line, "Step 12, Loss 0.25, Acc 0.5");
    }

    #[test]
    fn evaluation_lines_format() {
        let summary = evaluation_line(&EvaluationMetrics {
            loss: 1.5,
            accuracy: 0.95,
        });
        assert_eq!(summary, "Evaluation Summary, Loss 1.5, Acc 0.95");

        let best = best_line(&BestAccuracy {
            accuracy: 0.95,
            step: 300,
        });
        assert_eq!(best, "Current Max Acc 0.95 with in Iteration 300");
    }

    #[test]
    fn parameters_are_sorted_by_name() {
        let lines = parameter_lines([
            ("num_epochs", "200".to_string()),
            ("batch_size", "64".to_string()),
            ("learning_rate", "0.001".to_string()),
        ]);
        assert_eq!(
            lines,
            vec!["batch_size=64", "learning_rate=0.001", "num_epochs=200"]
        );
    }

    #[test]
    fn timestamp_is_iso8601() {
        let time = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().unwrap();
        let formatted = format_timestamp(&time);
        assert!(formatted.starts_with("2024-03-09T14:05:07.000000"));
    }
}
