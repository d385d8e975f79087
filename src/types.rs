#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Which feeds a sync run enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelection {
    TaggedImages,
    Observations,
    Both,
}

impl SourceSelection {
    pub fn from_flags(observations: bool, observations_only: bool) -> Self {
        if observations_only {
            SourceSelection::Observations
        } else if observations {
            SourceSelection::Both
        } else {
            SourceSelection::TaggedImages
        }
    }

    pub fn includes_tagged_images(&self) -> bool {
        matches!(self, SourceSelection::TaggedImages | SourceSelection::Both)
    }

    pub fn includes_observations(&self) -> bool {
        matches!(self, SourceSelection::Observations | SourceSelection::Both)
    }
}
