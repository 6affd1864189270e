//! Download sessions and the controller that runs them.
//!
//! A session takes one [`DownloadRequest`] through
//! `Pending -> FetchingInfo -> CatalogReady -> Downloading -> [PostProcessing] -> Completed`,
//! ending in `Failed` or `Cancelled` when something stops it. Each session
//! runs as its own task; callers observe it through a [`SessionHandle`] or
//! by id through the [`SessionController`].
//!
//! A finished session stays registered until its outcome is collected,
//! through [`SessionHandle::wait`] or [`SessionController::outcome`], and is
//! removed from the registry at that point.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore, broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::catalog::{FormatDescriptor, MediaKind, build_catalog};
use crate::config::EngineConfig;
use crate::download::DownloadExecutor;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{publish, remove_quietly, sanitize_filename};
use crate::metadata::{MediaSource, MetadataProvider, YtDlpProvider};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStage};
use crate::selection::{QualityCeiling, Selection, resolve};
use crate::transcode::{FfmpegTranscoder, Transcoder};
use crate::transport::{HttpTransport, MediaTransport};

// =============================================================================
// Identifiers and requests
// =============================================================================

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What the caller wants downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source URL or identifier understood by the metadata provider.
    pub url: String,
    /// Desired media kind.
    pub kind: MediaKind,
    /// Optional quality ceiling.
    pub ceiling: Option<QualityCeiling>,
    /// Destination directory; the configured download directory when `None`.
    pub destination: Option<PathBuf>,
    /// File stem to use instead of the source title.
    pub filename_override: Option<String>,
    /// Format id, or `video+audio` ids, to download instead of the best match.
    #[serde(default)]
    pub format_id: Option<String>,
    /// Keep downloaded audio in its original container instead of converting.
    #[serde(default)]
    pub keep_original: bool,
    /// Pair a video-only stream with the best audio and merge them.
    #[serde(default = "default_merge_audio")]
    pub merge_audio: bool,
}

const fn default_merge_audio() -> bool {
    true
}

impl DownloadRequest {
    /// Request for `url` of the given kind.
    #[must_use]
    pub fn new(url: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            url: url.into(),
            kind,
            ceiling: None,
            destination: None,
            filename_override: None,
            format_id: None,
            keep_original: false,
            merge_audio: true,
        }
    }

    /// Request an MP3 of `url`.
    #[must_use]
    pub fn audio(url: impl Into<String>) -> Self {
        Self::new(url, MediaKind::Audio)
    }

    /// Request the video of `url`, with audio merged in.
    #[must_use]
    pub fn video(url: impl Into<String>) -> Self {
        Self::new(url, MediaKind::Video)
    }

    /// Limit quality.
    #[must_use]
    pub const fn with_ceiling(mut self, ceiling: QualityCeiling) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// Download into `destination`.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Name the output `stem` instead of the source title.
    #[must_use]
    pub fn with_filename(mut self, stem: impl Into<String>) -> Self {
        self.filename_override = Some(stem.into());
        self
    }

    /// Download format `id` (or `video+audio` ids) when the source lists it.
    #[must_use]
    pub fn with_format(mut self, id: impl Into<String>) -> Self {
        self.format_id = Some(id.into());
        self
    }

    /// Skip MP3 conversion and keep the audio as downloaded.
    #[must_use]
    pub const fn keep_original(mut self) -> Self {
        self.keep_original = true;
        self
    }

    /// Download a video-only stream as is, without merging audio.
    #[must_use]
    pub const fn without_audio(mut self) -> Self {
        self.merge_audio = false;
        self
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting to start.
    Pending,
    /// Querying the metadata provider.
    FetchingInfo,
    /// Formats cataloged; choosing one.
    CatalogReady,
    /// Transferring bytes.
    Downloading,
    /// Converting to MP3 or merging streams.
    PostProcessing,
    /// Finished successfully.
    Completed {
        /// Final output file.
        output: PathBuf,
    },
    /// Stopped by an error.
    Failed {
        /// Stable error category.
        kind: ErrorKind,
        /// Human-readable cause.
        message: String,
        /// Completed download left on disk when post-processing failed.
        retained_download: Option<PathBuf>,
    },
    /// Stopped by the caller.
    Cancelled,
}

impl SessionState {
    /// Short name of the state.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::FetchingInfo => "fetching_info",
            Self::CatalogReady => "catalog_ready",
            Self::Downloading => "downloading",
            Self::PostProcessing => "post_processing",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the session has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Self::Failed { .. } | Self::Cancelled) => true,
            (Self::Pending, Self::FetchingInfo)
            | (Self::FetchingInfo, Self::CatalogReady)
            | (Self::CatalogReady, Self::Downloading)
            | (Self::Downloading, Self::PostProcessing | Self::Completed { .. })
            | (Self::PostProcessing, Self::Completed { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The output file is ready.
    Completed {
        /// Final output file.
        output: PathBuf,
    },
    /// The session failed.
    Failed {
        /// Stable error category.
        kind: ErrorKind,
        /// Human-readable cause.
        message: String,
        /// Completed download left on disk when post-processing failed.
        retained_download: Option<PathBuf>,
    },
    /// The caller cancelled the session.
    Cancelled,
}

impl SessionOutcome {
    /// Outcome for a terminal state; `None` while the session is running.
    #[must_use]
    pub fn from_state(state: &SessionState) -> Option<Self> {
        match state {
            SessionState::Completed { output } => Some(Self::Completed {
                output: output.clone(),
            }),
            SessionState::Failed {
                kind,
                message,
                retained_download,
            } => Some(Self::Failed {
                kind: *kind,
                message: message.clone(),
                retained_download: retained_download.clone(),
            }),
            SessionState::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the session produced its output.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// One-line report suitable for showing to a user.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Completed { output } => format!("Saved to {}", output.display()),
            Self::Failed {
                message,
                retained_download: Some(path),
                ..
            } => format!(
                "Download succeeded and was saved to {}, but post-processing failed: {message}",
                path.display()
            ),
            Self::Failed { kind, message, .. } => format!("Failed ({kind}): {message}"),
            Self::Cancelled => "Cancelled".to_string(),
        }
    }
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: SessionId,
    /// Requested source.
    pub url: String,
    /// Current state.
    pub state: SessionState,
}

// =============================================================================
// Handle
// =============================================================================

/// Caller-side view of one running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    state: watch::Receiver<SessionState>,
    sink: ProgressSink,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

impl SessionHandle {
    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sink.subscribe()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to finish and return how it ended.
    ///
    /// The session is removed from its controller's registry.
    pub async fn wait(mut self) -> SessionOutcome {
        let outcome = self
            .state
            .wait_for(SessionState::is_terminal)
            .await
            .ok()
            .and_then(|state| SessionOutcome::from_state(&state));
        if let Some(registry) = self.registry.upgrade() {
            registry.write().await.remove(&self.id);
        }
        outcome.unwrap_or_else(|| SessionOutcome::Failed {
            kind: ErrorKind::Internal,
            message: "session task ended without a final state".to_string(),
            retained_download: None,
        })
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug)]
struct SessionEntry {
    url: String,
    state: watch::Receiver<SessionState>,
    sink: ProgressSink,
    cancel: CancellationToken,
}

type Registry = RwLock<HashMap<SessionId, SessionEntry>>;

/// Collaborators shared by every session task.
#[derive(Clone)]
struct Pipeline {
    metadata: Arc<dyn MetadataProvider>,
    executor: DownloadExecutor,
    transcoder: Arc<dyn Transcoder>,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
}

/// A session failure, with the download kept on disk if there is one.
struct Failure {
    error: Error,
    retained: Option<PathBuf>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            retained: None,
        }
    }
}

/// Runs download sessions concurrently.
pub struct SessionController {
    pipeline: Pipeline,
    sessions: Arc<Registry>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.pipeline.config)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` is invalid.
    pub fn new(
        config: EngineConfig,
        metadata: Arc<dyn MetadataProvider>,
        transport: Arc<dyn MediaTransport>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        config.validate()?;
        let executor =
            DownloadExecutor::new(transport, config.retry.clone(), config.progress.clone());
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sessions));

        Ok(Self {
            pipeline: Pipeline {
                metadata,
                executor,
                transcoder,
                config: Arc::new(config),
                permits,
            },
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Create a controller using yt-dlp, HTTP and ffmpeg.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` is invalid or the HTTP
    /// client cannot be built.
    pub fn with_defaults(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.network)?);
        let transcoder = Arc::new(FfmpegTranscoder::new(&config.transcode));
        Self::new(config, Arc::new(YtDlpProvider::new()), transport, transcoder)
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.pipeline.config
    }

    /// Start a session for `request`.
    ///
    /// The session stays `Pending` while `max_concurrent_sessions` others run.
    pub async fn submit(&self, request: DownloadRequest) -> SessionHandle {
        let id = SessionId::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Pending);
        let sink = ProgressSink::new(id, self.pipeline.config.progress.channel_capacity);
        let cancel = CancellationToken::new();

        info!(session = %id, "Submitted {} request for {}", request.kind, request.url);
        self.sessions.write().await.insert(
            id,
            SessionEntry {
                url: request.url.clone(),
                state: state_rx.clone(),
                sink: sink.clone(),
                cancel: cancel.clone(),
            },
        );

        let pipeline = self.pipeline.clone();
        let task_sink = sink.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            pipeline.run(request, state_tx, task_sink, task_cancel).await;
        });

        SessionHandle {
            id,
            state: state_rx,
            sink,
            cancel,
            registry: Arc::downgrade(&self.sessions),
        }
    }

    /// Request cancellation of session `id`.
    ///
    /// Returns `false` if the session is unknown or already finished.
    pub async fn cancel(&self, id: SessionId) -> bool {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(&id) else {
            return false;
        };
        if entry.state.borrow().is_terminal() {
            return false;
        }
        info!(session = %id, "Cancellation requested");
        entry.cancel.cancel();
        true
    }

    /// Current state of session `id`.
    pub async fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.state.borrow().clone())
    }

    /// Final outcome of session `id`, removing the finished session.
    ///
    /// `None` if the session is unknown or still running.
    pub async fn outcome(&self, id: SessionId) -> Option<SessionOutcome> {
        let mut sessions = self.sessions.write().await;
        let outcome = SessionOutcome::from_state(&sessions.get(&id)?.state.borrow())?;
        sessions.remove(&id);
        debug!(session = %id, "Outcome collected");
        Some(outcome)
    }

    /// Subscribe to progress events of session `id`.
    pub async fn subscribe(&self, id: SessionId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.sink.subscribe())
    }

    /// Snapshot of every registered session.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                url: entry.url.clone(),
                state: entry.state.borrow().clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Forget finished sessions whose outcome nobody collected. Returns how many.
    pub async fn prune_finished(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.state.borrow().is_terminal());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("Pruned {} finished sessions", removed);
        }
        removed
    }
}

// =============================================================================
// Session task
// =============================================================================

/// Moves a session's published state forward, refusing illegal transitions.
struct StateWriter {
    id: SessionId,
    tx: watch::Sender<SessionState>,
}

impl StateWriter {
    fn advance(&self, next: SessionState) -> Result<()> {
        let mut refused = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                debug!(session = %self.id, "{} -> {}", current.name(), next.name());
                *current = next;
                true
            } else {
                refused = Some(Error::InvalidTransition {
                    from: current.name(),
                    to: next.name(),
                });
                false
            }
        });
        refused.map_or(Ok(()), Err)
    }
}

/// Fail with `Cancelled` if cancellation has been requested.
fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

impl Pipeline {
    async fn run(
        self,
        request: DownloadRequest,
        state_tx: watch::Sender<SessionState>,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) {
        let writer = StateWriter {
            id: sink.session_id(),
            tx: state_tx,
        };

        let permit = tokio::select! {
            () = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let result = match permit {
            Some(_permit) => self.execute(&request, &writer, &sink, &cancel).await,
            None if cancel.is_cancelled() => Err(Failure::from(Error::Cancelled)),
            None => Err(Failure::from(Error::Configuration(
                "session limiter closed".to_string(),
            ))),
        };

        let id = writer.id;
        let terminal = match result {
            Ok(output) => {
                info!(session = %id, "Completed: {}", output.display());
                SessionState::Completed { output }
            }
            Err(Failure {
                error: Error::Cancelled,
                retained,
            }) => {
                if let Some(path) = retained {
                    info!(session = %id, "Cancelled; keeping finished download {}", path.display());
                } else {
                    info!(session = %id, "Cancelled");
                }
                SessionState::Cancelled
            }
            Err(Failure { error, retained }) => {
                error!(session = %id, kind = %error.kind(), "Failed: {}", error);
                SessionState::Failed {
                    kind: error.kind(),
                    message: error.to_string(),
                    retained_download: retained,
                }
            }
        };

        if let Err(e) = writer.advance(terminal) {
            warn!(session = %id, "Could not publish final state: {}", e);
        }
    }

    async fn execute(
        &self,
        request: &DownloadRequest,
        writer: &StateWriter,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, Failure> {
        checkpoint(cancel)?;
        writer.advance(SessionState::FetchingInfo)?;
        let raw = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled.into()),
            raw = self.metadata.fetch_raw_metadata(&request.url) => raw?,
        };
        let source = MediaSource::from_raw(&request.url, &raw);
        let catalog = build_catalog(&raw)?;
        debug!(
            session = %writer.id,
            "'{}' has {} candidate formats",
            source.title,
            catalog.len()
        );

        checkpoint(cancel)?;
        writer.advance(SessionState::CatalogReady)?;
        let selection = resolve(
            &catalog,
            request.kind,
            request.ceiling,
            request.format_id.as_deref(),
            request.merge_audio,
        )?;

        checkpoint(cancel)?;
        writer.advance(SessionState::Downloading)?;
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| self.config.download_directory.clone());
        let stem = sanitize_filename(
            request
                .filename_override
                .as_deref()
                .unwrap_or(&source.title),
        );

        let Selection { primary, audio } = selection;
        if let Some(audio) = audio {
            return self
                .download_and_merge(&primary, &audio, &destination, &stem, writer, sink, cancel)
                .await;
        }

        let downloaded = self
            .executor
            .download(&primary, &destination, &stem, sink, cancel)
            .await?;

        let convert = request.kind == MediaKind::Audio
            && primary.requires_post_processing
            && !request.keep_original;
        if !convert {
            return Ok(downloaded);
        }

        if cancel.is_cancelled() {
            return Err(Failure {
                error: Error::Cancelled,
                retained: Some(downloaded),
            });
        }
        writer.advance(SessionState::PostProcessing)?;
        sink.report(ProgressStage::Converting, 0, None, None);

        // Cancellation is not observed while the transcoder runs
        let bitrate = self.config.transcode.mp3_bitrate_kbps;
        match self
            .transcoder
            .convert_to_mp3(&downloaded, &stem, bitrate)
            .await
        {
            Ok(output) => Ok(output),
            Err(error) => {
                warn!(
                    session = %writer.id,
                    "Keeping {} after failed conversion",
                    downloaded.display()
                );
                Err(Failure {
                    error,
                    retained: Some(downloaded),
                })
            }
        }
    }

    /// Download `video` and `audio` under hidden names, then mux them into
    /// `stem`. If muxing fails the video alone is published under `stem`.
    #[allow(clippy::too_many_arguments)]
    async fn download_and_merge(
        &self,
        video: &FormatDescriptor,
        audio: &FormatDescriptor,
        destination: &Path,
        stem: &str,
        writer: &StateWriter,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, Failure> {
        let video_stem = format!(".tubegrab-{}-video", writer.id);
        let audio_stem = format!(".tubegrab-{}-audio", writer.id);

        let video_path = self
            .executor
            .download(video, destination, &video_stem, sink, cancel)
            .await?;
        let audio_path = match self
            .executor
            .download(audio, destination, &audio_stem, sink, cancel)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                remove_quietly(&video_path).await;
                return Err(e.into());
            }
        };

        let ready = checkpoint(cancel).and_then(|()| writer.advance(SessionState::PostProcessing));
        if let Err(e) = ready {
            remove_quietly(&video_path).await;
            remove_quietly(&audio_path).await;
            return Err(e.into());
        }
        sink.report(ProgressStage::Merging, 0, None, None);

        // Cancellation is not observed while the transcoder runs
        match self
            .transcoder
            .merge_streams(&video_path, &audio_path, stem)
            .await
        {
            Ok(output) => Ok(output),
            Err(error) => {
                remove_quietly(&audio_path).await;
                let kept = publish(&video_path, destination, stem, video.extension()).await;
                let retained = match kept {
                    Ok(path) => {
                        warn!(
                            session = %writer.id,
                            "Keeping video without audio at {} after failed merge",
                            path.display()
                        );
                        Some(path)
                    }
                    Err(e) => {
                        warn!(session = %writer.id, "Could not keep video stream: {}", e);
                        remove_quietly(&video_path).await;
                        None
                    }
                };
                Err(Failure { error, retained })
            }
        }
    }
}
