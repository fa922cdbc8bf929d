pub mod batch;
pub mod config;
pub mod experiment;
pub mod logging;
pub mod metrics;
pub mod report;
pub mod rng;
pub mod schedule;
pub mod visualization;

pub use batch::{Batch, BatchIter};
pub use config::{load_json, load_or_init, save_json};
pub use experiment::ExperimentMode;
pub use metrics::{
    AccuracyHistory, BestAccuracy, EvaluationAccumulator, EvaluationMetrics, EvaluationRecord,
    StepMetrics,
};
pub use report::{
    ensure_report_file, markdown_table, update_sections, ReportSection, DEFAULT_REPORT_TEMPLATE,
};
pub use rng::{seeded_rng, stream_rng, RngStream};
pub use schedule::{exponential_decay, ExponentialDecay};
pub use visualization::encode_planar_png_data_url;
