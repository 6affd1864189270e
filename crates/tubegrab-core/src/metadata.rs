//! Metadata retrieval from the upstream extraction service.
//!
//! The engine never scrapes sites itself. A [`MetadataProvider`] returns the
//! raw, loosely typed description of a source; [`crate::catalog`] turns that
//! into something selectable. [`YtDlpProvider`] is the stock provider and
//! shells out to `yt-dlp --dump-json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, ExtractionError, Result};

/// Default time allowed for one metadata fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Title used when the upstream reports none.
const FALLBACK_TITLE: &str = "download";

/// One format entry as reported upstream. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    /// Opaque upstream format identifier.
    pub format_id: Option<String>,
    /// Download locator. For streaming protocols this is a manifest, not media.
    pub url: Option<String>,
    /// Transfer protocol, e.g. `"https"`, `"m3u8_native"` or `"http_dash_segments"`.
    pub protocol: Option<String>,
    /// Headers the locator expects on every request.
    pub http_headers: HashMap<String, String>,
    /// Container extension.
    pub ext: Option<String>,
    /// Video codec, `"none"` when the stream carries no video.
    pub vcodec: Option<String>,
    /// Audio codec, `"none"` when the stream carries no audio.
    pub acodec: Option<String>,
    /// Frame width in pixels.
    pub width: Option<u32>,
    /// Frame height in pixels.
    pub height: Option<u32>,
    /// Frames per second.
    pub fps: Option<f64>,
    /// Total bitrate in kbps.
    pub tbr: Option<f64>,
    /// Audio bitrate in kbps.
    pub abr: Option<f64>,
    /// Exact size in bytes.
    pub filesize: Option<u64>,
    /// Estimated size in bytes.
    pub filesize_approx: Option<f64>,
    /// Resolution label, e.g. `"1920x1080"` or `"audio only"`.
    pub resolution: Option<String>,
    /// Free-form quality note, e.g. `"medium"` or `"128kbps"`.
    pub format_note: Option<String>,
}

/// Raw metadata for one source as reported upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMetadata {
    /// Upstream identifier of the source.
    pub id: Option<String>,
    /// Human-readable title.
    pub title: Option<String>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// Thumbnail URL.
    pub thumbnail: Option<String>,
    /// Canonical page URL.
    pub webpage_url: Option<String>,
    /// Candidate formats in upstream order.
    pub formats: Vec<RawFormat>,
}

/// Resolved identity of the media a session downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    /// URL or identifier the caller submitted.
    pub url: String,
    /// Upstream identifier, when known.
    pub id: Option<String>,
    /// Resolved title.
    pub title: String,
    /// Duration, when known.
    pub duration: Option<Duration>,
    /// Thumbnail reference.
    pub thumbnail: Option<String>,
}

impl MediaSource {
    /// Resolve the source identity from fetched metadata.
    #[must_use]
    pub fn from_raw(url: &str, raw: &RawMetadata) -> Self {
        let title = raw
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| raw.id.as_deref().filter(|id| !id.is_empty()))
            .unwrap_or(FALLBACK_TITLE)
            .to_string();

        let duration = raw
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);

        Self {
            url: url.to_string(),
            id: raw.id.clone(),
            title,
            duration,
            thumbnail: raw.thumbnail.clone(),
        }
    }
}

/// Source of raw metadata for a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fetch the raw description of `url`.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::UpstreamUnavailable` when the service cannot be
    /// reached and `ExtractionError::Unsupported` when it refuses the source.
    async fn fetch_raw_metadata(&self, url: &str) -> Result<RawMetadata>;
}

/// Parse `yt-dlp --dump-json` output.
///
/// # Errors
///
/// Returns `ExtractionError::MalformedMetadata` if the bytes are not valid metadata JSON.
pub fn parse_metadata(json: &[u8]) -> Result<RawMetadata> {
    serde_json::from_slice(json).map_err(|e| {
        Error::Extraction(ExtractionError::MalformedMetadata {
            reason: e.to_string(),
        })
    })
}

/// Metadata provider backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpProvider {
    program: PathBuf,
    timeout: Duration,
}

impl Default for YtDlpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpProvider {
    /// Provider running `yt-dlp` from the search path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Provider using the first `yt-dlp` found on the search path.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::UpstreamUnavailable` if no executable is found.
    pub fn locate() -> Result<Self> {
        let program = which::which("yt-dlp").map_err(|e| {
            Error::Extraction(ExtractionError::UpstreamUnavailable {
                reason: format!("yt-dlp not found: {e}"),
            })
        })?;
        debug!("Found yt-dlp at {}", program.display());
        Ok(Self::new().with_program(program))
    }

    /// Use a specific executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the fetch timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MetadataProvider for YtDlpProvider {
    async fn fetch_raw_metadata(&self, url: &str) -> Result<RawMetadata> {
        info!("Fetching metadata for {}", url);

        let mut command = Command::new(&self.program);
        command
            .args([
                "--dump-json",
                "--no-download",
                "--no-playlist",
                "--no-warnings",
            ])
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Extraction(ExtractionError::UpstreamUnavailable {
                    reason: format!("failed to run {}: {e}", self.program.display()),
                }));
            }
            Err(_) => {
                warn!("yt-dlp timed out after {:?} for {}", self.timeout, url);
                return Err(Error::Extraction(ExtractionError::UpstreamUnavailable {
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                }));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed for {}: {}", url, stderr.trim());
            return Err(classify_failure(url, &stderr));
        }

        let raw = parse_metadata(&output.stdout)?;
        debug!("yt-dlp reported {} formats for {}", raw.formats.len(), url);
        Ok(raw)
    }
}

/// Map a failed extraction's stderr to an error.
fn classify_failure(url: &str, stderr: &str) -> Error {
    const REFUSALS: [&str; 6] = [
        "unsupported url",
        "private video",
        "video unavailable",
        "sign in to confirm your age",
        "members-only",
        "is not a valid url",
    ];

    let reason = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("extraction failed")
        .trim_start_matches("ERROR:")
        .trim()
        .to_string();

    let lowered = stderr.to_lowercase();
    if REFUSALS.iter().any(|needle| lowered.contains(needle)) {
        Error::Extraction(ExtractionError::Unsupported {
            url: url.to_string(),
            reason,
        })
    } else {
        Error::Extraction(ExtractionError::UpstreamUnavailable { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SAMPLE: &str = r#"{
        "id": "abc123",
        "title": "Sample Video",
        "duration": 212.5,
        "thumbnail": "https://img.example.com/abc123.jpg",
        "formats": [
            {"format_id": "140", "url": "https://cdn.example.com/140", "ext": "m4a",
             "protocol": "https", "http_headers": {"User-Agent": "Mozilla/5.0"},
             "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3400000},
            {"format_id": "137", "url": "https://cdn.example.com/137", "ext": "mp4",
             "vcodec": "avc1.640028", "acodec": "none", "height": 1080, "width": 1920,
             "fps": 30, "tbr": 4400.2, "unknown_field": [1, 2, 3]}
        ]
    }"#;

    #[test]
    fn test_parse_metadata() {
        let raw = parse_metadata(SAMPLE.as_bytes()).expect("should parse");
        assert_eq!(raw.id.as_deref(), Some("abc123"));
        assert_eq!(raw.formats.len(), 2);
        assert_eq!(raw.formats[0].abr, Some(129.5));
        assert_eq!(raw.formats[1].height, Some(1080));
        assert_eq!(raw.formats[1].fps, Some(30.0));
        assert_eq!(raw.formats[0].protocol.as_deref(), Some("https"));
        assert_eq!(
            raw.formats[0].http_headers.get("User-Agent").map(String::as_str),
            Some("Mozilla/5.0")
        );
        assert!(raw.formats[1].http_headers.is_empty());
    }

    #[test]
    fn test_parse_metadata_rejects_garbage() {
        let err = parse_metadata(b"<html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMetadata);
    }

    #[test]
    fn test_media_source_from_raw() {
        let raw = parse_metadata(SAMPLE.as_bytes()).expect("should parse");
        let source = MediaSource::from_raw("https://example.com/watch?v=abc123", &raw);
        assert_eq!(source.title, "Sample Video");
        assert_eq!(source.duration, Some(Duration::from_secs_f64(212.5)));
        assert_eq!(source.id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_media_source_title_fallbacks() {
        let raw = RawMetadata {
            id: Some("xyz".to_string()),
            title: Some("   ".to_string()),
            ..RawMetadata::default()
        };
        assert_eq!(MediaSource::from_raw("u", &raw).title, "xyz");
        assert_eq!(
            MediaSource::from_raw("u", &RawMetadata::default()).title,
            FALLBACK_TITLE
        );
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "https://example.com/x",
            "ERROR: [youtube] x: Private video. Sign in if you've been granted access\n",
        );
        assert_eq!(err.kind(), ErrorKind::UnsupportedSource);
        assert!(err.to_string().contains("Private video"));

        let err = classify_failure("https://example.com/x", "ERROR: Unable to download webpage\n");
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn test_missing_program_is_upstream_unavailable() {
        let provider =
            YtDlpProvider::new().with_program("/nonexistent/tubegrab-test/yt-dlp-missing");
        let err = provider
            .fetch_raw_metadata("https://example.com/watch?v=abc123")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let mut mock = MockMetadataProvider::new();
        mock.expect_fetch_raw_metadata()
            .returning(|_| Ok(RawMetadata::default()));
        let raw = mock.fetch_raw_metadata("abc123").await.expect("mock");
        assert!(raw.formats.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires yt-dlp and network access"]
    async fn test_fetch_real_metadata() {
        let provider = YtDlpProvider::locate().expect("yt-dlp installed");
        let raw = provider
            .fetch_raw_metadata("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await
            .expect("fetch");
        assert!(!raw.formats.is_empty());
    }
}
