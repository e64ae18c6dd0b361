use std::fmt;

#[derive(Debug)]
pub enum TaggerError {
    /// Checkpoint missing, unreadable, or not a valid safetensors container.
    CheckpointLoad(String),
    /// Operation called in the wrong lifecycle state (e.g. `end_pass` while idle).
    IllegalState(String),
    Shape(String),
    Config(String),
    Candle(String),
    Io(String),
    /// The driver cancelled a pass; partial results were discarded.
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, TaggerError>;

impl fmt::Display for TaggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggerError::CheckpointLoad(msg) => write!(f, "checkpoint load error: {msg}"),
            TaggerError::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            TaggerError::Shape(msg) => write!(f, "shape error: {msg}"),
            TaggerError::Config(msg) => write!(f, "config error: {msg}"),
            TaggerError::Candle(msg) => write!(f, "candle error: {msg}"),
            TaggerError::Io(msg) => write!(f, "io error: {msg}"),
            TaggerError::Aborted(msg) => write!(f, "aborted: {msg}"),
        }
    }
}

impl std::error::Error for TaggerError {}

impl From<candle_core::Error> for TaggerError {
    fn from(err: candle_core::Error) -> Self {
        TaggerError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TaggerError {
    fn from(err: std::io::Error) -> Self {
        TaggerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TaggerError {
    fn from(err: serde_json::Error) -> Self {
        TaggerError::Config(err.to_string())
    }
}
