use std::path::PathBuf;

/// Errors that can occur across fwdelta.
///
/// Library crates use this type directly; the binary converts to `miette`
/// diagnostics at the boundary. Most variants are local to one artifact or
/// one input line and are degraded by the pipeline instead of aborting it.
///
/// # Examples
///
/// ```
/// use fwdelta_core::FwdeltaError;
///
/// let err = FwdeltaError::Format("no ELF magic".into());
/// assert!(err.to_string().contains("no ELF magic"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum FwdeltaError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic parse failure of an input document.
    #[error("parse error: {0}")]
    Parse(String),

    /// A single input line could not be understood.
    #[error("malformed line {line}: {reason}")]
    MalformedLine {
        /// 1-based line number in the input.
        line: usize,
        /// Why the line was rejected.
        reason: String,
    },

    /// An external tool exited unsuccessfully or could not be started.
    #[error("{tool} failed: {message}")]
    Tool {
        /// Program name.
        tool: String,
        /// Exit status or spawn error, plus captured stderr.
        message: String,
    },

    /// An external tool exceeded its wall-clock limit and was killed.
    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout {
        /// Program name.
        tool: String,
        /// Limit that was exceeded.
        seconds: u64,
    },

    /// An expected binary signature or structure is absent.
    #[error("format error: {0}")]
    Format(String),

    /// An archive could not be expanded.
    #[error("archive error: {0}")]
    Archive(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}
