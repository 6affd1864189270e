//! Post-processing through ffmpeg: MP3 conversion and stream merging.
//!
//! The transcoder is located once, on first use, by probing candidates with
//! `-version`: an explicitly configured path, then well-known install
//! locations, then the search path. A missing binary is reported as
//! [`Error::TranscoderMissing`] and leaves the inputs untouched.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TranscodeConfig;
use crate::error::{DiskError, Error, ErrorContext, Result, TranscodeError};
use crate::fs::{publish, remove_quietly};

/// Time allowed for a `-version` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines of transcoder stderr kept in error reports.
const STDERR_TAIL_LINES: usize = 5;

/// Container separately downloaded streams are merged into.
pub const MERGED_EXTENSION: &str = "mp4";

/// Post-processes finished downloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` to `stem.mp3` at `bitrate_kbps` in the same directory.
    ///
    /// The name only avoids existing MP3 files, so a download published as
    /// `Song_2.m4a` still becomes `Song.mp3` when that name is free. On
    /// success the input is deleted and the MP3 path returned. On failure
    /// the input is left in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::TranscoderMissing` if no transcoder is installed, or a
    /// `TranscodeError` if conversion fails.
    async fn convert_to_mp3(
        &self,
        input: &Path,
        stem: &str,
        bitrate_kbps: u32,
    ) -> Result<PathBuf>;

    /// Mux the `video` and `audio` streams into `stem.mp4` beside `video`
    /// without re-encoding.
    ///
    /// On success both inputs are deleted. On failure they are left in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::TranscoderMissing` if no transcoder is installed, or a
    /// `TranscodeError` if muxing fails.
    async fn merge_streams(&self, video: &Path, audio: &Path, stem: &str) -> Result<PathBuf>;
}

/// Transcoder backed by the `ffmpeg` executable.
#[derive(Debug)]
pub struct FfmpegTranscoder {
    candidates: Vec<PathBuf>,
    timeout: Duration,
    located: OnceCell<Option<PathBuf>>,
}

impl FfmpegTranscoder {
    /// Create a transcoder searching the standard candidate list.
    #[must_use]
    pub fn new(config: &TranscodeConfig) -> Self {
        Self::with_candidates(
            ffmpeg_candidates(config.ffmpeg_path.as_deref()),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Create a transcoder searching exactly `candidates`, in order.
    #[must_use]
    pub fn with_candidates(candidates: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
            located: OnceCell::new(),
        }
    }

    /// The located ffmpeg, probing candidates on first call.
    ///
    /// # Errors
    ///
    /// Returns `Error::TranscoderMissing` if no candidate responds to `-version`.
    pub async fn program(&self) -> Result<&Path> {
        let located = self
            .located
            .get_or_init(|| locate_ffmpeg(&self.candidates))
            .await;
        located.as_deref().ok_or(Error::TranscoderMissing {
            searched: self.candidates.len(),
        })
    }

    async fn run(&self, program: &Path, args: Vec<OsString>) -> Result<()> {
        let mut command = Command::new(program);
        command
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| TranscodeError::Launch {
            program: program.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Dropping the child on timeout kills it
        let output_result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::TimedOut {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| TranscodeError::Launch {
                program: program.to_path_buf(),
                reason: e.to_string(),
            })?;

        if !output_result.status.success() {
            return Err(TranscodeError::Failed {
                status: output_result.status.code(),
                stderr: stderr_tail(&output_result.stderr),
            }
            .into());
        }
        Ok(())
    }

    /// Run ffmpeg writing to a hidden file in `directory`, then publish the
    /// result as `stem.extension`. Nothing is left behind on failure.
    async fn produce(
        &self,
        program: &Path,
        mut args: Vec<OsString>,
        directory: &Path,
        stem: &str,
        extension: &str,
    ) -> Result<(PathBuf, u64)> {
        let temp = directory.join(format!(".tubegrab-{}.{extension}.part", Uuid::new_v4()));
        args.push(temp.clone().into_os_string());

        if let Err(e) = self.run(program, args).await {
            remove_quietly(&temp).await;
            return Err(e);
        }

        let produced = tokio::fs::metadata(&temp).await.map(|m| m.len()).unwrap_or(0);
        if produced == 0 {
            remove_quietly(&temp).await;
            return Err(TranscodeError::EmptyOutput { path: temp }.into());
        }

        match publish(&temp, directory, stem, extension).await {
            Ok(output) => Ok((output, produced)),
            Err(e) => {
                remove_quietly(&temp).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert_to_mp3(
        &self,
        input: &Path,
        stem: &str,
        bitrate_kbps: u32,
    ) -> Result<PathBuf> {
        let program = self.program().await?;
        require_file(input).await?;
        let directory = input.parent().unwrap_or_else(|| Path::new("."));

        info!(
            "Converting {} to MP3 at {} kbps",
            input.display(),
            bitrate_kbps
        );
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-vn".into(),
            "-codec:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            format!("{bitrate_kbps}k").into(),
            "-f".into(),
            "mp3".into(),
        ];
        let (output, produced) = self
            .produce(program, args, directory, stem, "mp3")
            .await
            .inspect_err(|e| warn!("Conversion of {} failed: {}", input.display(), e))?;
        remove_quietly(input).await;

        info!("Converted to {} ({} bytes)", output.display(), produced);
        Ok(output)
    }

    async fn merge_streams(&self, video: &Path, audio: &Path, stem: &str) -> Result<PathBuf> {
        let program = self.program().await?;
        require_file(video).await?;
        require_file(audio).await?;
        let directory = video.parent().unwrap_or_else(|| Path::new("."));

        info!("Merging {} with {}", video.display(), audio.display());
        let args: Vec<OsString> = vec![
            "-i".into(),
            video.as_os_str().to_owned(),
            "-i".into(),
            audio.as_os_str().to_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "copy".into(),
            "-f".into(),
            MERGED_EXTENSION.into(),
        ];
        let (output, produced) = self
            .produce(program, args, directory, stem, MERGED_EXTENSION)
            .await
            .inspect_err(|e| warn!("Merge into {} failed: {}", stem, e))?;
        remove_quietly(video).await;
        remove_quietly(audio).await;

        info!("Merged to {} ({} bytes)", output.display(), produced);
        Ok(output)
    }
}

async fn require_file(path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await.disk_context(path)?;
    if metadata.is_file() {
        Ok(())
    } else {
        Err(Error::Disk(DiskError::Io {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        }))
    }
}

/// Candidate ffmpeg locations, in search order.
#[must_use]
pub fn ffmpeg_candidates(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = configured.map(Path::to_path_buf).into_iter().collect();

    if cfg!(windows) {
        candidates.extend(
            [
                r"C:\ffmpeg\bin\ffmpeg.exe",
                r"C:\Program Files\ffmpeg\bin\ffmpeg.exe",
                r"C:\Program Files (x86)\ffmpeg\bin\ffmpeg.exe",
            ]
            .map(PathBuf::from),
        );
        if let Some(home) = dirs::home_dir() {
            candidates.push(
                home.join(r"AppData\Local\Microsoft\WinGet\Packages")
                    .join("Gyan.FFmpeg_Microsoft.Winget.Source_8wekyb3d8bbwe")
                    .join("ffmpeg.exe"),
            );
        }
    } else {
        candidates.extend(
            [
                "/usr/bin/ffmpeg",
                "/usr/local/bin/ffmpeg",
                "/opt/homebrew/bin/ffmpeg",
            ]
            .map(PathBuf::from),
        );
    }

    if let Ok(on_path) = which::which("ffmpeg")
        && !candidates.contains(&on_path)
    {
        candidates.push(on_path);
    }
    candidates
}

/// First candidate that answers `-version` successfully.
pub async fn locate_ffmpeg(candidates: &[PathBuf]) -> Option<PathBuf> {
    for candidate in candidates {
        if !candidate.is_file() {
            continue;
        }
        if probe(candidate).await {
            info!("Using ffmpeg at {}", candidate.display());
            return Some(candidate.clone());
        }
        debug!("ffmpeg candidate {} failed its probe", candidate.display());
    }
    warn!("ffmpeg not found in {} candidate locations", candidates.len());
    None
}

async fn probe(program: &Path) -> bool {
    let status = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, status).await,
        Ok(Ok(s)) if s.success()
    )
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ")
}
