use std::fmt;

use clap::ValueEnum;

/// How much of a run to execute.
///
/// `Full` trains for the configured number of epochs. `Test` caps the run so it
/// can be replayed against a stored benchmark snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum ExperimentMode {
    #[default]
    Full,
    Test,
}

impl ExperimentMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Test => "test",
        }
    }

    pub fn select<T>(&self, full: T, test: T) -> T {
        match self {
            Self::Full => full,
            Self::Test => test,
        }
    }
}

impl fmt::Display for ExperimentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
