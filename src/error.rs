use std::path::PathBuf;

/// The closed set of failures this crate surfaces.
///
/// Adapters and the inference engine never swallow errors. The agent loop
/// converts [`Error::ToolInvocation`] into a regular tool message so the model
/// can reason about it; every other kind terminates the current turn.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A download or provider call failed at the transport level. Retry the
    /// whole operation.
    #[error("network error: {0}")]
    Network(String),

    /// A cached file did not hash to the value its manifest declares. The
    /// offending file has already been deleted.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The process-wide stop flag was raised mid-download. Partial files are
    /// kept for a later resume.
    #[error("operation interrupted")]
    Interrupted,

    /// No manifest exists for this model/quantization/target combination.
    #[error("no such model: {0}")]
    NoSuchModel(String),

    /// The compiled model library could not be loaded or initialized.
    #[error("failed to load model library: {0}")]
    LibraryLoad(String),

    /// The KV cache cannot hold the requested tokens. The caller should
    /// shorten its input.
    #[error("context length limit exceeded: {requested} tokens requested, {available} available")]
    ContextOverflow { requested: usize, available: usize },

    /// Chat template rendering failed. Fatal for the turn.
    #[error("chat template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A registered tool rejected its arguments or its callback failed.
    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    /// A remote provider answered with a non-success status or a body we
    /// could not interpret.
    #[error("provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    /// The caller cancelled the in-flight inference.
    #[error("cancelled")]
    Cancelled,

    /// A tokenizer or tensor-VM call failed during inference.
    #[error("inference error: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
