//! Crate-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::utils::format::{format_size, tail_chars, truncate_chars};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Longest diagnostic shown to a job owner.
pub const USER_MESSAGE_LIMIT: usize = 300;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session expired, please send the file or link again")]
    SessionExpired,

    #[error("Unexpected input, waiting for {expected}")]
    UnexpectedInput { expected: String },

    #[error("File too large: {actual} bytes exceeds the {limit} byte limit")]
    TooLarge { limit: u64, actual: u64 },

    #[error("Source unreachable or rejected: {0}")]
    UnreachableOrRejected(String),

    #[error("Required tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Target size too small, minimum for this video is {minimum_bytes} bytes")]
    TargetTooSmall { minimum_bytes: u64 },

    #[error("Process failed with exit code {code:?}: {diagnostic}")]
    ProcessFailed { code: Option<i32>, diagnostic: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    #[error("Links from {0} are not supported")]
    Blocked(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::UnreachableOrRejected(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short diagnostic suitable for a chat message.
    pub fn user_message(&self) -> String {
        let text = match self {
            Self::TooLarge { limit, actual } => format!(
                "File too large ({}), the limit is {}",
                format_size(*actual),
                format_size(*limit)
            ),
            Self::TargetTooSmall { minimum_bytes } => format!(
                "Target size is too small for this video, minimum is about {}",
                format_size(*minimum_bytes)
            ),
            Self::ProcessFailed { diagnostic, .. } => {
                const PREFIX: &str = "Processing failed: ";
                // ffmpeg prints the actual error last.
                let room = USER_MESSAGE_LIMIT - PREFIX.len();
                return format!("{PREFIX}{}", tail_chars(diagnostic.trim(), room));
            }
            other => other.to_string(),
        };
        truncate_chars(&text, USER_MESSAGE_LIMIT)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::UnreachableOrRejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_truncated() {
        let err = Error::ProcessFailed {
            code: Some(1),
            diagnostic: "x".repeat(2000),
        };
        assert!(err.user_message().chars().count() <= USER_MESSAGE_LIMIT);
    }

    #[test]
    fn process_failure_keeps_last_error_line() {
        let diagnostic = format!(
            "{}\n[libx264 @ 0x1] height not divisible by 2 (853x480)",
            "frame=  10 fps=0.0 q=0.0 size=0kB\n".repeat(40)
        );
        let err = Error::ProcessFailed {
            code: Some(1),
            diagnostic,
        };
        let message = err.user_message();
        assert!(message.starts_with("Processing failed: "));
        assert!(message.ends_with("height not divisible by 2 (853x480)"));
        assert!(message.chars().count() <= USER_MESSAGE_LIMIT);
    }

    #[test]
    fn target_too_small_mentions_minimum() {
        let err = Error::TargetTooSmall {
            minimum_bytes: 3 * 1024 * 1024,
        };
        assert!(err.user_message().contains("3.0 MB"));
    }
}
