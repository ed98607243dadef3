use thiserror::Error;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("I/O error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("control system error: {0}")]
    ControlSystem(String),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),
    #[error("cannot parse command file {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("errors were found in command file, cannot continue:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
    #[error("failed to find correct gain in {iterations} autoscale iterations")]
    Convergence {
        iterations: usize,
        channels: Vec<String>,
    },
    #[error("could not set gain to {requested}, not in the amplifier's gain table")]
    InvalidGain { requested: String },
    #[error("command '{command}' (line {line}) failed: {source}")]
    Dispatch {
        command: String,
        line: usize,
        #[source]
        source: Box<SequencerError>,
    },
    #[error("abort requested by operator")]
    Abort,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SequencerError {
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        SequencerError::Io {
            source,
            context: context.into(),
        }
    }

    /// Short class name used in notification subjects and journal records.
    pub fn kind(&self) -> &'static str {
        match self {
            SequencerError::Io { .. } => "IoError",
            SequencerError::ControlSystem(_) => "ControlSystemError",
            SequencerError::Timeout(..) => "TimeoutError",
            SequencerError::Parse { .. } => "ParseError",
            SequencerError::Validation(_) => "ValidationError",
            SequencerError::Convergence { .. } => "ConvergenceError",
            SequencerError::InvalidGain { .. } => "InvalidGainError",
            SequencerError::Dispatch { .. } => "ActionDispatchError",
            SequencerError::Abort => "AbortRequested",
            SequencerError::Json(_) => "JsonError",
        }
    }

    /// An operator abort is a clean stop, not a failure.
    pub fn is_abort(&self) -> bool {
        match self {
            SequencerError::Abort => true,
            SequencerError::Dispatch { source, .. } => source.is_abort(),
            _ => false,
        }
    }
}
