use std::{fmt::Write, path::Path};

use anyhow::Result;
use burn::tensor::backend::Backend;
use gilnet_core::{
    encode_planar_png_data_url, markdown_table, update_sections, AccuracyHistory,
    EvaluationMetrics, ReportSection, StepMetrics,
};

use crate::{
    args::Hyperparameters,
    dataset::{FaceItem, FaceSplit, CHANNELS},
    model::GilNet,
    training::{evaluation_step, ExperimentConstants},
};

#[derive(Clone, Debug)]
pub struct SamplePrediction {
    pub index: usize,
    pub label: String,
    pub prediction: String,
    pub image_data_url: String,
}

/// Everything the notebook shows about one finished run.
pub struct RunSummary<'a> {
    pub hyperparameters: &'a Hyperparameters,
    pub constants: &'a ExperimentConstants,
    pub channel_means: &'a [f32],
    pub classes: &'a [String],
    pub history: &'a AccuracyHistory,
    pub final_train: Option<&'a StepMetrics>,
    pub final_test: EvaluationMetrics,
    pub test_samples: &'a [SamplePrediction],
    pub train_samples: &'a [SamplePrediction],
}

pub fn write_report(path: &Path, summary: &RunSummary<'_>) -> Result<()> {
    let sections = [
        ReportSection::new("configuration", render_configuration_section(summary)),
        ReportSection::new("metrics", render_metrics_section(summary)),
        ReportSection::new(
            "samples-primary",
            render_samples_section("Held-out fold", summary.test_samples),
        ),
        ReportSection::new(
            "samples-secondary",
            render_samples_section("Training folds", summary.train_samples),
        ),
    ];

    update_sections(path, &sections)
}

fn render_configuration_section(summary: &RunSummary<'_>) -> String {
    let params = summary.hyperparameters;
    let constants = summary.constants;
    let means: Vec<String> = summary
        .channel_means
        .iter()
        .map(|mean| format!("{mean:.2}"))
        .collect();

    format!(
        "- Seed: {}\n- Held-out fold: {}\n- Classes: {}\n- Image size: {}\n- Channel means: [{}]\n- Batch size: {}\n- Epochs: {}\n- Evaluate every: {} steps\n- Learning rate: {} (x{} every {} steps)\n- Momentum: {}\n- Gradient clip norm: {}\n- Dropout keep probability: {}\n- L2 lambda: {}\n- Moving average: {}\n- Conv channels: {:?}\n- Hidden units: {}\n",
        constants.seed,
        params.folder_to_test,
        summary.classes.join(", "),
        params.image_size,
        means.join(", "),
        params.batch_size,
        params.num_epochs,
        params.evaluate_every,
        params.learning_rate,
        constants.decay_rate,
        constants.decay_steps,
        constants.momentum,
        constants.clip_norm,
        params.dropout_keep_prob,
        params.l2_reg_lambda,
        if params.enable_moving_average {
            format!("on (decay {})", constants.moving_average_decay)
        } else {
            "off".to_string()
        },
        constants.network.conv_channels,
        constants.network.hidden_units,
    )
}

fn render_metrics_section(summary: &RunSummary<'_>) -> String {
    let mut output = String::new();

    if let Some(train) = summary.final_train {
        let _ = writeln!(
            &mut output,
            "- Final step: {}\n- Final train loss: {:.4}\n- Final train accuracy: {:.2}%",
            train.step,
            train.loss,
            train.accuracy * 100.0
        );
    }

    let _ = writeln!(
        &mut output,
        "- Final held-out loss: {:.4}\n- Final held-out accuracy: {:.2}%",
        summary.final_test.loss,
        summary.final_test.accuracy * 100.0
    );

    if let Some(best) = summary.history.best() {
        let _ = writeln!(
            &mut output,
            "- Best held-out accuracy: {:.2}% at step {}",
            best.accuracy * 100.0,
            best.step
        );
    }

    if !summary.history.is_empty() {
        let rows: Vec<Vec<String>> = summary
            .history
            .records()
            .iter()
            .zip(summary.history.running_best())
            .map(|(record, best)| {
                vec![
                    record.step.to_string(),
                    format!("{:.4}", record.metrics.loss),
                    format!("{:.2}", record.metrics.accuracy * 100.0),
                    format!("{:.2}", best.accuracy * 100.0),
                ]
            })
            .collect();

        output.push('\n');
        output.push_str(&markdown_table(
            &["Step", "Loss", "Accuracy (%)", "Best so far (%)"],
            &rows,
        ));
    }

    output
}

fn render_samples_section(title: &str, samples: &[SamplePrediction]) -> String {
    let rows: Vec<Vec<String>> = samples
        .iter()
        .map(|sample| {
            let verdict = if sample.label == sample.prediction { "yes" } else { "no" };
            vec![
                sample.index.to_string(),
                format!("![face {}]({})", sample.index, sample.image_data_url),
                sample.label.clone(),
                sample.prediction.clone(),
                verdict.to_string(),
            ]
        })
        .collect();

    if rows.is_empty() {
        return format!("### {title}\n\nNo samples available for this split.");
    }
    format!(
        "### {title}\n\n{}",
        markdown_table(&["#", "Face", "True class", "Predicted", "Correct"], &rows)
    )
}

/// Predict the first `count` items of `split` and encode them for the notebook.
pub fn sample_predictions<E: Backend>(
    model: &GilNet<E>,
    split: &FaceSplit,
    classes: &[String],
    image_size: usize,
    count: usize,
) -> Result<Vec<SamplePrediction>> {
    let items: Vec<&FaceItem> = split.items().iter().take(count).collect();
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let (predicted, _) = evaluation_step(model, &items, image_size)?;
    let side = image_size as u32;
    let class_name = |index: usize| {
        classes
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    };

    items
        .iter()
        .zip(predicted)
        .enumerate()
        .map(|(index, (item, prediction))| -> Result<SamplePrediction> {
            Ok(SamplePrediction {
                index,
                label: class_name(item.class_index()),
                prediction: class_name(prediction),
                image_data_url: encode_planar_png_data_url(CHANNELS, side, side, &item.pixels)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{solid_item, tiny_config, TestBackend, TEST_IMAGE_SIZE};
    use burn_ndarray::NdArrayDevice;
    use gilnet_core::{ensure_report_file, seeded_rng, DEFAULT_REPORT_TEMPLATE};
    use std::fs;

    fn hyperparameters() -> Hyperparameters {
        Hyperparameters {
            folder_to_test: 2,
            dropout_keep_prob: 0.5,
            l2_reg_lambda: 0.001,
            learning_rate: 0.001,
            batch_size: 8,
            num_epochs: 3,
            evaluate_every: 10,
            enable_moving_average: false,
            image_size: TEST_IMAGE_SIZE,
        }
    }

    #[test]
    fn report_lists_history_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        ensure_report_file(&path, DEFAULT_REPORT_TEMPLATE).unwrap();

        let mut history = AccuracyHistory::new();
        history.record(
            10,
            EvaluationMetrics {
                loss: 0.9,
                accuracy: 0.5,
            },
        );
        history.record(
            20,
            EvaluationMetrics {
                loss: 0.7,
                accuracy: 0.75,
            },
        );
        let params = hyperparameters();
        let constants = ExperimentConstants::default();
        let classes = vec!["female".to_string(), "male".to_string()];

        write_report(
            &path,
            &RunSummary {
                hyperparameters: &params,
                constants: &constants,
                channel_means: &[120.5, 100.25, 90.0],
                classes: &classes,
                history: &history,
                final_train: None,
                final_test: EvaluationMetrics {
                    loss: 0.7,
                    accuracy: 0.75,
                },
                test_samples: &[],
                train_samples: &[],
            },
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("- Held-out fold: 2"));
        assert!(content.contains("- Channel means: [120.50, 100.25, 90.00]"));
        assert!(content.contains("- Best held-out accuracy: 75.00% at step 20"));
        assert!(content.contains("| 10 | 0.9000 | 50.00 | 50.00 |"));
        assert!(content.contains("| 20 | 0.7000 | 75.00 | 75.00 |"));
        assert!(content.contains("No samples available for this split."));
    }

    #[test]
    fn sample_rows_mark_mistakes() {
        let samples = [SamplePrediction {
            index: 0,
            label: "female".to_string(),
            prediction: "male".to_string(),
            image_data_url: "data:image/png;base64,AAAA".to_string(),
        }];

        let section = render_samples_section("Held-out fold", &samples);
        assert!(section.starts_with("### Held-out fold\n\n| # | Face |"));
        assert!(section
            .contains("| 0 | ![face 0](data:image/png;base64,AAAA) | female | male | no |"));
    }

    #[test]
    fn samples_carry_class_names_and_images() {
        let model: GilNet<TestBackend> = tiny_config()
            .init(
                2,
                TEST_IMAGE_SIZE,
                vec![0.0; 3],
                0.0,
                &mut seeded_rng(1),
                &NdArrayDevice::Cpu,
            )
            .unwrap();
        let split = FaceSplit::new(vec![
            solid_item(30, 1, 2),
            solid_item(60, 0, 2),
            solid_item(90, 1, 2),
        ]);
        let classes = vec!["female".to_string(), "male".to_string()];

        let samples = sample_predictions(&model, &split, &classes, TEST_IMAGE_SIZE, 2).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, "male");
        assert_eq!(samples[1].label, "female");
        assert!(classes.contains(&samples[0].prediction));
        assert!(samples[0].image_data_url.starts_with("data:image/png;base64,"));
    }
}
