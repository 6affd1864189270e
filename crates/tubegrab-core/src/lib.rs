//! `Tubegrab` Core Library
//!
//! This crate provides the engine behind `Tubegrab`, a media download
//! orchestrator:
//! - Format catalog construction from upstream metadata
//! - Quality selection with optional ceilings or explicit format ids
//! - Streamed, resumable downloads with retry and progress reporting
//! - MP3 conversion and video/audio merging through ffmpeg
//! - Concurrent download sessions with cancellation
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`]. Errors carry a stable
//! [`ErrorKind`] for callers that need to branch on the failure category.
//!
//! ```rust,ignore
//! use tubegrab_core::{DownloadRequest, EngineConfig, SessionController};
//!
//! async fn grab(url: &str) -> tubegrab_core::Result<()> {
//!     let controller = SessionController::with_defaults(EngineConfig::load()?)?;
//!     let outcome = controller.submit(DownloadRequest::audio(url)).await.wait().await;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod fs;
pub mod logging;
pub mod metadata;
pub mod progress;
pub mod selection;
pub mod session;
pub mod transcode;
pub mod transport;

pub use cancel::CancellationToken;
pub use catalog::{FormatCatalog, FormatDescriptor, MediaKind, build_catalog, height_label};
pub use config::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_CONCURRENT_SESSIONS, DEFAULT_MP3_BITRATE_KBPS,
    DEFAULT_PROGRESS_BYTE_THRESHOLD, DEFAULT_PROGRESS_INTERVAL, EngineConfig, NetworkConfig,
    ProgressConfig, RetryConfig, TranscodeConfig, default_download_directory,
};
pub use download::DownloadExecutor;
pub use error::{
    DiskError, Error, ErrorContext, ErrorKind, ExtractionError, NetworkError, Result,
    SelectionError, TranscodeError,
};
pub use fs::sanitize_filename;
pub use logging::{LogRotation, LoggingConfig, LoggingError, LoggingGuard};
pub use metadata::{
    MediaSource, MetadataProvider, RawFormat, RawMetadata, YtDlpProvider, parse_metadata,
};
pub use progress::{
    ProgressEvent, ProgressSink, ProgressStage, ProgressTracker, format_bytes_per_second,
    format_duration,
};
pub use selection::{QualityCeiling, Selection, find_format_id, resolve, select};
pub use session::{
    DownloadRequest, SessionController, SessionHandle, SessionId, SessionInfo, SessionOutcome,
    SessionState,
};
pub use transcode::{
    FfmpegTranscoder, MERGED_EXTENSION, Transcoder, ffmpeg_candidates, locate_ffmpeg,
};
pub use transport::{ChunkStream, HttpTransport, MediaTransport};
