//! Error types for Tubegrab core operations.
//!
//! Every failure a session can end with is one of a small number of stable
//! categories (see [`ErrorKind`]). Each pipeline stage has its own error enum,
//! and the crate-wide [`Error`] wraps them so stages can use `?` freely.
//!
//! Only [`NetworkError::Timeout`], [`NetworkError::ConnectionReset`] and
//! [`NetworkError::ServerBusy`] are transient; the download executor retries
//! those internally. Everything else propagates to the caller unchanged.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::MediaKind;
use crate::selection::QualityCeiling;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while fetching or interpreting upstream metadata.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The upstream metadata contained no usable download candidates.
    #[error("No downloadable formats found for {url}")]
    NoFormats {
        /// Source URL the metadata was fetched for.
        url: String,
    },

    /// The extraction service could not be reached or could not run.
    #[error("Extraction service unavailable: {reason}")]
    UpstreamUnavailable {
        /// What went wrong.
        reason: String,
    },

    /// The source is unsupported, private, or otherwise restricted.
    #[error("Source {url} is not supported: {reason}")]
    Unsupported {
        /// Source URL.
        url: String,
        /// Reason reported by the extraction service.
        reason: String,
    },

    /// The metadata could not be parsed.
    #[error("Malformed metadata: {reason}")]
    MalformedMetadata {
        /// Parse failure details.
        reason: String,
    },
}

/// Errors raised by the selection policy.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// No descriptor of the requested kind satisfies the quality ceiling.
    #[error("No {kind} format matches{}", ceiling_suffix(.ceiling.as_ref()))]
    NoMatch {
        /// Requested media kind.
        kind: MediaKind,
        /// Requested ceiling, if any.
        ceiling: Option<QualityCeiling>,
    },
}

fn ceiling_suffix(ceiling: Option<&QualityCeiling>) -> String {
    ceiling.map_or_else(String::new, |c| format!(" at or below {c}"))
}

/// Errors raised while transferring bytes over the network.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The connection or a read timed out.
    #[error("Network timeout: {reason}")]
    Timeout {
        /// Details from the transport.
        reason: String,
    },

    /// The connection was reset or the body ended early.
    #[error("Connection reset: {reason}")]
    ConnectionReset {
        /// Details from the transport.
        reason: String,
    },

    /// The server answered with a temporary failure status (408, 429, 5xx).
    #[error("Server temporarily unavailable (HTTP {status})")]
    ServerBusy {
        /// HTTP status code.
        status: u16,
    },

    /// The server refused the request with a permanent status.
    #[error("Request rejected by server (HTTP {status})")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The body was longer than the size the server announced.
    #[error("Received {actual} bytes but expected {expected}")]
    LengthMismatch {
        /// Announced size.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Download failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error observed.
        last_error: String,
    },
}

impl NetworkError {
    /// Whether the executor should retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionReset { .. } | Self::ServerBusy { .. }
        )
    }
}

/// Errors raised by local storage.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The destination filesystem is full.
    #[error("Not enough disk space to write {path}")]
    InsufficientSpace {
        /// Path being written.
        path: PathBuf,
    },

    /// The destination is not writable.
    #[error("Permission denied for {path}")]
    PermissionDenied {
        /// Path being accessed.
        path: PathBuf,
    },

    /// Any other I/O failure on a local path.
    #[error("File system error at {path}: {reason}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}

impl DiskError {
    /// Classify an I/O error that happened on `path`.
    #[must_use]
    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::StorageFull => Self::InsufficientSpace { path },
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied { path }
            }
            _ if err.raw_os_error().is_some_and(is_out_of_space) => {
                Self::InsufficientSpace { path }
            }
            _ => Self::Io {
                path,
                reason: err.to_string(),
            },
        }
    }
}

const fn is_out_of_space(code: i32) -> bool {
    if cfg!(windows) {
        // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        matches!(code, 39 | 112)
    } else {
        // ENOSPC, EDQUOT
        matches!(code, 28 | 122)
    }
}

/// Errors raised by the external transcoder once it has been located.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The transcoder could not be started.
    #[error("Failed to launch transcoder {program}: {reason}")]
    Launch {
        /// Program path.
        program: PathBuf,
        /// Spawn failure details.
        reason: String,
    },

    /// The transcoder exited unsuccessfully.
    #[error("Transcoder exited with {}: {stderr}", exit_label(.status.as_ref()))]
    Failed {
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Tail of the transcoder's stderr.
        stderr: String,
    },

    /// The transcoder reported success but the output is missing or empty.
    #[error("Transcoder produced no output at {path}")]
    EmptyOutput {
        /// Expected output path.
        path: PathBuf,
    },

    /// The transcoder ran longer than allowed and was killed.
    #[error("Transcoder timed out after {secs}s")]
    TimedOut {
        /// Timeout in seconds.
        secs: u64,
    },
}

fn exit_label(status: Option<&i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| format!("code {code}"))
}

/// Errors that can occur in Tubegrab core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Metadata retrieval or cataloging failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// No format satisfied the request.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Byte transfer failed.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Local storage failed.
    #[error(transparent)]
    Disk(#[from] DiskError),

    /// The transcoder binary could not be found anywhere.
    #[error("ffmpeg not found (searched {searched} locations); install ffmpeg or set its path")]
    TranscoderMissing {
        /// Number of candidate locations probed.
        searched: usize,
    },

    /// The transcoder ran but conversion failed.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A session tried to move between incompatible states.
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State name before the transition.
        from: &'static str,
        /// Requested state name.
        to: &'static str,
    },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable error categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream metadata had no usable formats.
    NoFormats,
    /// Extraction service unreachable or not runnable.
    UpstreamUnavailable,
    /// Source unsupported or restricted.
    UnsupportedSource,
    /// Metadata could not be parsed.
    MalformedMetadata,
    /// Selection policy found nothing.
    NoMatch,
    /// Network timeout.
    Timeout,
    /// Connection reset or truncated body.
    ConnectionReset,
    /// Server temporarily unavailable.
    ServerBusy,
    /// Server rejected the request.
    Rejected,
    /// Body length disagreed with the announced size.
    LengthMismatch,
    /// Retry budget exhausted.
    NetworkExhausted,
    /// Disk full.
    InsufficientSpace,
    /// Destination not writable.
    PermissionDenied,
    /// Other disk failure.
    DiskIo,
    /// Transcoder binary missing.
    TranscoderMissing,
    /// Transcoder failed.
    TranscodeFailed,
    /// Cancelled by the caller.
    Cancelled,
    /// Invalid configuration.
    Configuration,
    /// Internal invariant violated.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NoFormats => "no_formats",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UnsupportedSource => "unsupported_source",
            Self::MalformedMetadata => "malformed_metadata",
            Self::NoMatch => "no_match",
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection_reset",
            Self::ServerBusy => "server_busy",
            Self::Rejected => "rejected",
            Self::LengthMismatch => "length_mismatch",
            Self::NetworkExhausted => "network_exhausted",
            Self::InsufficientSpace => "insufficient_space",
            Self::PermissionDenied => "permission_denied",
            Self::DiskIo => "disk_io",
            Self::TranscoderMissing => "transcoder_missing",
            Self::TranscodeFailed => "transcode_failed",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

impl Error {
    /// The stable category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Extraction(e) => match e {
                ExtractionError::NoFormats { .. } => ErrorKind::NoFormats,
                ExtractionError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
                ExtractionError::Unsupported { .. } => ErrorKind::UnsupportedSource,
                ExtractionError::MalformedMetadata { .. } => ErrorKind::MalformedMetadata,
            },
            Self::Selection(SelectionError::NoMatch { .. }) => ErrorKind::NoMatch,
            Self::Network(e) => match e {
                NetworkError::Timeout { .. } => ErrorKind::Timeout,
                NetworkError::ConnectionReset { .. } => ErrorKind::ConnectionReset,
                NetworkError::ServerBusy { .. } => ErrorKind::ServerBusy,
                NetworkError::Rejected { .. } => ErrorKind::Rejected,
                NetworkError::LengthMismatch { .. } => ErrorKind::LengthMismatch,
                NetworkError::Exhausted { .. } => ErrorKind::NetworkExhausted,
            },
            Self::Disk(e) => match e {
                DiskError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
                DiskError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
                DiskError::Io { .. } => ErrorKind::DiskIo,
            },
            Self::TranscoderMissing { .. } => ErrorKind::TranscoderMissing,
            Self::Transcode(_) => ErrorKind::TranscodeFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::InvalidTransition { .. } | Self::Serialization(_) => ErrorKind::Internal,
            Self::Io(_) => ErrorKind::DiskIo,
        }
    }

    /// Whether the download executor retries this error internally.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether resubmitting the same request later might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::ConnectionReset
                | ErrorKind::ServerBusy
                | ErrorKind::NetworkExhausted
                | ErrorKind::UpstreamUnavailable
        )
    }

    /// Suggested delay before the caller resubmits, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::ConnectionReset => Some(2),
            ErrorKind::ServerBusy => Some(30),
            ErrorKind::NetworkExhausted | ErrorKind::UpstreamUnavailable => Some(60),
            _ => None,
        }
    }
}

/// Attach local path context to I/O results.
pub trait ErrorContext<T> {
    /// Convert an I/O failure on `path` into a classified [`DiskError`].
    fn disk_context(self, path: &Path) -> Result<T>;
}

impl<T> ErrorContext<T> for io::Result<T> {
    fn disk_context(self, path: &Path) -> Result<T> {
        self.map_err(|e| Error::Disk(DiskError::from_io(&e, path)))
    }
}
