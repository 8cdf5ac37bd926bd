use std::fmt;

/// Crate-wide error type.
///
/// Variants map onto the taxonomy in the design doc: `RangeEvicted` and
/// `InferenceFailed` are recoverable at the tick level, `Config` is a
/// construction-time programmer error, the rest are context-tagged wrappers
/// around whatever failed underneath.
#[derive(Debug)]
pub enum Error {
    Audio(String),
    Tokenizer(String),
    Model(String),
    Config(String),
    /// A ring read targeted a range that has already been evicted.
    RangeEvicted { start: u64, base: u64 },
    /// The external encoder/joiner session returned an error.
    InferenceFailed { component: String, cause: String },
    /// `tick()`/`decode` called before a model was installed via `set_model`.
    NotReady,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Audio(msg) => write!(f, "audio error: {msg}"),
            Error::Tokenizer(msg) => write!(f, "tokenizer error: {msg}"),
            Error::Model(msg) => write!(f, "model error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::RangeEvicted { start, base } => {
                write!(f, "range evicted: requested start {start} < base {base}")
            }
            Error::InferenceFailed { component, cause } => {
                write!(f, "inference failed in {component}: {cause}")
            }
            Error::NotReady => write!(f, "stream not ready: no model installed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::Audio(format!("wav I/O failed: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(format!("I/O failed: {e}"))
    }
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::InferenceFailed {
            component: "ort".to_string(),
            cause: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(format!("invalid JSON config: {e}"))
    }
}
