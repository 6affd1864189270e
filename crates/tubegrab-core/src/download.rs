//! Streamed download of a selected format.
//!
//! Bytes go to a hidden per-session temporary file in the destination
//! directory. The file is published under its final name only after the
//! transfer completes and its length checks out, so readers never see a
//! partial file under the final name.
//!
//! Transient network failures are retried with exponential backoff, resuming
//! from the bytes already on disk when the server honors range requests.
//! Disk failures and cancellation stop the transfer immediately; in every
//! failure case the temporary file is removed.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::FormatDescriptor;
use crate::config::{ProgressConfig, RetryConfig};
use crate::error::{Error, ErrorContext, NetworkError, Result};
use crate::fs::{ensure_dir, publish, remove_quietly, temp_path};
use crate::progress::{ProgressSink, ProgressStage, ProgressThrottle, ProgressTracker};
use crate::transport::{ChunkStream, MediaTransport};

/// Downloads descriptors through a [`MediaTransport`].
#[derive(Clone)]
pub struct DownloadExecutor {
    transport: Arc<dyn MediaTransport>,
    retry: RetryConfig,
    progress: ProgressConfig,
}

impl std::fmt::Debug for DownloadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadExecutor")
            .field("retry", &self.retry)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

/// Per-transfer bookkeeping carried across attempts.
struct TransferState<'a> {
    file: File,
    path: &'a Path,
    written: u64,
    total: Option<u64>,
    tracker: ProgressTracker,
    throttle: ProgressThrottle,
}

impl DownloadExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        retry: RetryConfig,
        progress: ProgressConfig,
    ) -> Self {
        Self {
            transport,
            retry,
            progress,
        }
    }

    /// Download `descriptor` into `destination` as `file_stem.<ext>`.
    ///
    /// The final name gets a numeric suffix if `file_stem.<ext>` is taken.
    /// Returns the path of the published file.
    ///
    /// # Errors
    ///
    /// - `Error::Cancelled` if `cancel` fires before completion
    /// - `NetworkError::Exhausted` once transient failures use up the retry budget
    /// - other `NetworkError`s for permanent refusals
    /// - `DiskError` if the destination cannot be written
    pub async fn download(
        &self,
        descriptor: &FormatDescriptor,
        destination: &Path,
        file_stem: &str,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        ensure_dir(destination).await?;

        let session_id = sink.session_id().to_string();
        let extension = descriptor.extension();
        let temp = temp_path(destination, &session_id, extension);
        info!(
            session = %session_id,
            format = %descriptor.format_id,
            "Downloading {} format into {}",
            descriptor.kind,
            destination.display()
        );

        let bytes = match self.transfer(descriptor, &temp, sink, cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(&temp).await;
                return Err(e);
            }
        };

        match publish(&temp, destination, file_stem, extension).await {
            Ok(path) => {
                info!(
                    session = %session_id,
                    bytes,
                    "Download complete: {}",
                    path.display()
                );
                Ok(path)
            }
            Err(e) => {
                remove_quietly(&temp).await;
                Err(e)
            }
        }
    }

    /// Fill `temp` with the full body, retrying transient failures.
    async fn transfer(
        &self,
        descriptor: &FormatDescriptor,
        temp: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp)
            .await
            .disk_context(temp)?;

        let mut state = TransferState {
            file,
            path: temp,
            written: 0,
            total: descriptor.exact_size(),
            tracker: ProgressTracker::new(),
            throttle: ProgressThrottle::new(&self.progress),
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            debug!(attempt, offset = state.written, "Opening {}", descriptor.format_id);
            match self.attempt(descriptor, &mut state, sink, cancel).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_attempts,
                        offset = state.written,
                        "Retrying download after {:?}: {}",
                        delay,
                        e
                    );
                    sink.report(
                        ProgressStage::Retrying {
                            attempt,
                            max_attempts,
                            reason: e.to_string(),
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        },
                        state.written,
                        state.total,
                        Some(&state.tracker),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Download failed after {} attempts: {}", attempt, e);
                    return Err(Error::Network(NetworkError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    }));
                }
                Err(e) => return Err(e),
            }
        }

        state.file.flush().await.disk_context(temp)?;
        state.file.sync_all().await.disk_context(temp)?;
        sink.report(
            ProgressStage::Downloading,
            state.written,
            state.total.or(Some(state.written)),
            Some(&state.tracker),
        );
        Ok(state.written)
    }

    /// One request: open at the current offset and stream to the end.
    async fn attempt(
        &self,
        descriptor: &FormatDescriptor,
        state: &mut TransferState<'_>,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream: Box<dyn ChunkStream> = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            opened = self
                .transport
                .open(&descriptor.locator, &descriptor.http_headers, state.written) => opened?,
        };

        let start = stream.resumed_from();
        if start != state.written {
            if start != 0 {
                return Err(Error::Network(NetworkError::ConnectionReset {
                    reason: format!(
                        "server resumed at byte {start}, expected {}",
                        state.written
                    ),
                }));
            }
            debug!("Restarting transfer from byte 0");
            state.file.set_len(0).await.disk_context(state.path)?;
            state.file.seek(SeekFrom::Start(0)).await.disk_context(state.path)?;
            state.written = 0;
            state.tracker.reset();
            state.throttle.reset();
        }
        if let Some(length) = stream.content_length() {
            state.total = Some(length);
        }

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next_chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };

            state
                .file
                .write_all(&chunk)
                .await
                .disk_context(state.path)?;
            state.written += chunk.len() as u64;
            state.tracker.record(state.written);

            if state.throttle.should_emit(state.written) {
                sink.report(
                    ProgressStage::Downloading,
                    state.written,
                    state.total,
                    Some(&state.tracker),
                );
            }
        }

        verify_length(state.written, state.total)
    }
}

/// Check the finished body against the announced size.
fn verify_length(written: u64, total: Option<u64>) -> Result<()> {
    match total {
        Some(expected) if written < expected => {
            Err(Error::Network(NetworkError::ConnectionReset {
                reason: format!("body ended at byte {written} of {expected}"),
            }))
        }
        Some(expected) if written > expected => {
            Err(Error::Network(NetworkError::LengthMismatch {
                expected,
                actual: written,
            }))
        }
        None if written == 0 => Err(Error::Network(NetworkError::ConnectionReset {
            reason: "empty response body".to_string(),
        })),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaKind;
    use crate::error::{DiskError, ErrorKind};
    use crate::progress::ProgressEvent;
    use crate::session::SessionId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// How the fake server answers one request.
    #[derive(Debug, Clone)]
    enum Plan {
        /// Serve the body from the requested offset, cutting the connection
        /// after `cut_after` bytes when set.
        Serve { honor_range: bool, cut_after: Option<usize> },
        /// Fail before any byte is sent.
        Refuse(u16),
        /// Time out before any byte is sent.
        Timeout,
        /// Stall until cancelled.
        Stall,
    }

    struct FakeStream {
        chunks: VecDeque<Result<Option<Bytes>>>,
        total: Option<u64>,
        resumed_from: u64,
        stall: bool,
    }

    #[async_trait]
    impl ChunkStream for FakeStream {
        fn content_length(&self) -> Option<u64> {
            self.total
        }

        fn resumed_from(&self) -> u64 {
            self.resumed_from
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.chunks.pop_front().unwrap_or(Ok(None))
        }
    }

    struct FakeTransport {
        body: Bytes,
        plans: Mutex<VecDeque<Plan>>,
        offsets: Mutex<Vec<u64>>,
    }

    impl FakeTransport {
        fn new(body: &[u8], plans: Vec<Plan>) -> Arc<Self> {
            Arc::new(Self {
                body: Bytes::copy_from_slice(body),
                plans: Mutex::new(plans.into()),
                offsets: Mutex::new(Vec::new()),
            })
        }

        fn offsets(&self) -> Vec<u64> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaTransport for FakeTransport {
        async fn open(
            &self,
            _locator: &str,
            _headers: &HashMap<String, String>,
            offset: u64,
        ) -> Result<Box<dyn ChunkStream>> {
            self.offsets.lock().unwrap().push(offset);
            let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Serve {
                honor_range: true,
                cut_after: None,
            });

            let total = Some(self.body.len() as u64);
            match plan {
                Plan::Refuse(status) => Err(Error::Network(NetworkError::Rejected { status })),
                Plan::Timeout => Err(Error::Network(NetworkError::Timeout {
                    reason: "fake".to_string(),
                })),
                Plan::Stall => Ok(Box::new(FakeStream {
                    chunks: VecDeque::new(),
                    total,
                    resumed_from: offset,
                    stall: true,
                })),
                Plan::Serve {
                    honor_range,
                    cut_after,
                } => {
                    let start = if honor_range { offset } else { 0 };
                    let data = self.body.slice(usize::try_from(start).unwrap()..);
                    let end = cut_after.map_or(data.len(), |n| n.min(data.len()));
                    let mut chunks: VecDeque<Result<Option<Bytes>>> = data
                        .slice(..end)
                        .chunks(4)
                        .map(|c| Ok(Some(Bytes::copy_from_slice(c))))
                        .collect();
                    if cut_after.is_some() {
                        chunks.push_back(Err(Error::Network(NetworkError::ConnectionReset {
                            reason: "fake reset".to_string(),
                        })));
                    }
                    Ok(Box::new(FakeStream {
                        chunks,
                        total,
                        resumed_from: start,
                        stall: false,
                    }))
                }
            }
        }
    }

    fn descriptor() -> FormatDescriptor {
        FormatDescriptor {
            format_id: "140".to_string(),
            locator: "https://cdn.example.com/140".to_string(),
            http_headers: HashMap::new(),
            kind: MediaKind::Audio,
            container: Some("m4a".to_string()),
            codec: Some("mp4a.40.2".to_string()),
            height: None,
            fps: None,
            bitrate_kbps: Some(128),
            filesize: None,
            filesize_exact: false,
            requires_post_processing: true,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            multiplier: 2.0,
            max_backoff_ms: 4,
        }
    }

    fn executor(transport: Arc<FakeTransport>, max_attempts: u32) -> DownloadExecutor {
        DownloadExecutor::new(transport, fast_retry(max_attempts), ProgressConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn leftover_parts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    const BODY: &[u8] = b"The quick brown fox jumps over the lazy dog";

    #[tokio::test]
    async fn test_download_publishes_final_file() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(BODY, vec![]);
        let sink = ProgressSink::new(SessionId::new(), 64);
        let mut rx = sink.subscribe();

        let path = executor(transport, 3)
            .download(&descriptor(), temp_dir.path(), "Song", &sink, &CancellationToken::new())
            .await
            .expect("download");

        assert_eq!(path, temp_dir.path().join("Song.m4a"));
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert_eq!(leftover_parts(temp_dir.path()), 0);

        let events = drain(&mut rx);
        let last = events.last().expect("progress events");
        assert_eq!(last.stage, ProgressStage::Downloading);
        assert_eq!(last.bytes_transferred, BODY.len() as u64);
        assert_eq!(last.percent(), Some(100.0));
    }

    #[tokio::test]
    async fn test_progress_is_throttled() {
        let temp_dir = TempDir::new().unwrap();
        let body = vec![7u8; 4000];
        let transport = FakeTransport::new(&body, vec![]);
        let sink = ProgressSink::new(SessionId::new(), 4096);
        let mut rx = sink.subscribe();

        let exec = DownloadExecutor::new(
            transport,
            fast_retry(1),
            ProgressConfig {
                min_interval_ms: 60_000,
                byte_threshold: 1000,
                channel_capacity: 4096,
            },
        );
        exec.download(&descriptor(), temp_dir.path(), "Big", &sink, &CancellationToken::new())
            .await
            .expect("download");

        // 1000 chunks of 4 bytes: first chunk, every 1000 bytes, then the final event
        let events = drain(&mut rx);
        assert!(events.len() <= 6, "got {} events", events.len());
        assert!(events.len() >= 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(BODY, vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor(Arc::clone(&transport), 3)
            .download(
                &descriptor(),
                temp_dir.path(),
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(transport.offsets().is_empty());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_removes_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(BODY, vec![Plan::Stall]);
        let cancel = CancellationToken::new();
        let exec = executor(transport, 3);
        let dir = temp_dir.path().to_path_buf();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                exec.download(
                    &descriptor(),
                    &dir,
                    "Song",
                    &ProgressSink::new(SessionId::new(), 8),
                    &cancel,
                )
                .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_download_resumes_to_full_length() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(
            BODY,
            vec![
                Plan::Serve {
                    honor_range: true,
                    cut_after: Some(10),
                },
                Plan::Timeout,
                Plan::Serve {
                    honor_range: true,
                    cut_after: None,
                },
            ],
        );
        let sink = ProgressSink::new(SessionId::new(), 64);
        let mut rx = sink.subscribe();

        let path = executor(Arc::clone(&transport), 4)
            .download(&descriptor(), temp_dir.path(), "Song", &sink, &CancellationToken::new())
            .await
            .expect("download");

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), BODY.len());
        assert_eq!(content, BODY);
        assert_eq!(transport.offsets(), vec![0, 10, 10]);

        let retries: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.stage {
                ProgressStage::Retrying { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(
            BODY,
            vec![
                Plan::Serve {
                    honor_range: true,
                    cut_after: Some(12),
                },
                Plan::Serve {
                    honor_range: false,
                    cut_after: None,
                },
            ],
        );

        let path = executor(transport, 3)
            .download(
                &descriptor(),
                temp_dir.path(),
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &CancellationToken::new(),
            )
            .await
            .expect("download");

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(BODY, vec![Plan::Timeout, Plan::Timeout, Plan::Timeout]);

        let err = executor(Arc::clone(&transport), 3)
            .download(
                &descriptor(),
                temp_dir.path(),
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Network(NetworkError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(transport.offsets().len(), 3);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_refusal_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(BODY, vec![Plan::Refuse(403)]);

        let err = executor(Arc::clone(&transport), 5)
            .download(
                &descriptor(),
                temp_dir.path(),
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(transport.offsets().len(), 1);
        assert_eq!(leftover_parts(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("Song.m4a"), b"keep me").unwrap();
        let transport = FakeTransport::new(BODY, vec![]);

        let path = executor(transport, 1)
            .download(
                &descriptor(),
                temp_dir.path(),
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &CancellationToken::new(),
            )
            .await
            .expect("download");

        assert_eq!(path, temp_dir.path().join("Song_2.m4a"));
        assert_eq!(std::fs::read(temp_dir.path().join("Song.m4a")).unwrap(), b"keep me");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwritable_destination_is_disk_error() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let locked = temp_dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores directory permissions
        if std::fs::write(locked.join("probe"), b"x").is_ok() {
            return;
        }

        let transport = FakeTransport::new(BODY, vec![]);
        let err = executor(Arc::clone(&transport), 3)
            .download(
                &descriptor(),
                &locked,
                "Song",
                &ProgressSink::new(SessionId::new(), 8),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Disk(DiskError::PermissionDenied { .. })));
        assert!(transport.offsets().is_empty());
    }

    #[test]
    fn test_verify_length() {
        assert!(verify_length(10, Some(10)).is_ok());
        assert!(verify_length(5, None).is_ok());
        assert!(verify_length(5, Some(10)).unwrap_err().is_transient());
        assert_eq!(
            verify_length(12, Some(10)).unwrap_err().kind(),
            ErrorKind::LengthMismatch
        );
        assert!(verify_length(0, None).unwrap_err().is_transient());
    }
}
