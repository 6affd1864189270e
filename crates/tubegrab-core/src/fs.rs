//! Destination filesystem helpers.
//!
//! Downloads are written under a hidden temporary name derived from the
//! session id and only appear under their final name once complete. Final
//! names come from the source title and never overwrite an existing file:
//! collisions get a numeric suffix (`Title_2.mp3`, `Title_3.mp3`, ...).

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DiskError, Error, ErrorContext, Result};

/// Maximum length in bytes of a sanitized file stem.
pub const MAX_STEM_BYTES: usize = 200;

/// Stem used when a title sanitizes to nothing.
const FALLBACK_STEM: &str = "download";

/// Device names Windows refuses as file names, with or without an extension.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Give up after this many occupied candidates.
const MAX_NAME_CANDIDATES: u32 = 10_000;

/// Make a title safe to use as a file stem on every platform.
///
/// Replaces path separators and reserved characters with `_`, drops control
/// characters, trims whitespace and dots from the ends, and caps the length.
/// A Windows device name (`CON`, `nul.txt`, ...) gets `_` appended to the
/// part before its first dot.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .filter(|c| *c == '\0' || !c.is_control())
        .map(|c| if invalid_chars.contains(&c) { '_' } else { c })
        .collect();

    let trimmed = sanitized.trim().trim_matches('.').trim();
    let mut end = trimmed.len().min(MAX_STEM_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let capped = trimmed[..end].trim_end();

    if capped.is_empty() {
        return FALLBACK_STEM.to_string();
    }

    let (base, rest) = capped.split_at(capped.find('.').unwrap_or(capped.len()));
    if RESERVED_STEMS.iter().any(|r| r.eq_ignore_ascii_case(base)) {
        format!("{base}_{rest}")
    } else {
        capped.to_string()
    }
}

/// Temporary path for a session's in-flight download.
#[must_use]
pub fn temp_path(dir: &Path, session_id: &str, extension: &str) -> PathBuf {
    dir.join(format!(".tubegrab-{session_id}.{extension}.part"))
}

/// Create `dir` and its parents if missing.
///
/// # Errors
///
/// Returns a `DiskError` if the directory cannot be created or `dir` is a file.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.disk_context(dir)?;
    let metadata = tokio::fs::metadata(dir).await.disk_context(dir)?;
    if !metadata.is_dir() {
        return Err(Error::Disk(DiskError::Io {
            path: dir.to_path_buf(),
            reason: "destination exists and is not a directory".to_string(),
        }));
    }
    Ok(())
}

/// Candidate final path number `n` (1-based) for `stem.extension`.
#[must_use]
pub fn candidate_path(dir: &Path, stem: &str, extension: &str, n: u32) -> PathBuf {
    if n <= 1 {
        dir.join(format!("{stem}.{extension}"))
    } else {
        dir.join(format!("{stem}_{n}.{extension}"))
    }
}

/// Move a finished file to the first free `stem[_n].extension` in `dir`.
///
/// The file is linked under its final name in one step, so a concurrent
/// publisher can never claim the same name and no existing file is replaced.
/// Filesystems without hard links fall back to reserving the name with an
/// exclusive create followed by a rename over the reservation.
///
/// # Errors
///
/// Returns a `DiskError` if no name can be claimed or the file cannot be moved.
pub async fn publish(source: &Path, dir: &Path, stem: &str, extension: &str) -> Result<PathBuf> {
    for n in 1..=MAX_NAME_CANDIDATES {
        let candidate = candidate_path(dir, stem, extension, n);

        match tokio::fs::hard_link(source, &candidate).await {
            Ok(()) => {
                remove_quietly(source).await;
                debug!("Published {} as {}", source.display(), candidate.display());
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                debug!("Hard link unavailable ({}), reserving {}", e, candidate.display());
                if reserve(&candidate).await? {
                    tokio::fs::rename(source, &candidate)
                        .await
                        .disk_context(&candidate)?;
                    debug!("Published {} as {}", source.display(), candidate.display());
                    return Ok(candidate);
                }
            }
        }
    }

    Err(Error::Disk(DiskError::Io {
        path: candidate_path(dir, stem, extension, 1),
        reason: format!("no free file name after {MAX_NAME_CANDIDATES} attempts"),
    }))
}

/// Claim `path` with an exclusive create. `Ok(false)` if it is taken.
async fn reserve(path: &Path) -> Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::Disk(DiskError::from_io(&e, path))),
    }
}

/// Delete `path`, logging anything other than a missing file.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Hello World"), "Hello World");
        assert_eq!(sanitize_filename("AC/DC: Back in Black"), "AC_DC_ Back in Black");
        assert_eq!(sanitize_filename("what?*<>|\"\\"), "what_______");
        assert_eq!(sanitize_filename("  ..hidden.. "), "hidden");
        assert_eq!(sanitize_filename("tab\there"), "tabhere");
        assert_eq!(sanitize_filename("   "), FALLBACK_STEM);
        assert_eq!(sanitize_filename("..."), FALLBACK_STEM);
    }

    #[test]
    fn test_sanitize_avoids_windows_device_names() {
        assert_eq!(sanitize_filename("CON"), "CON_");
        assert_eq!(sanitize_filename("nul"), "nul_");
        assert_eq!(sanitize_filename("Com7"), "Com7_");
        assert_eq!(sanitize_filename("lpt1.live"), "lpt1_.live");
        assert_eq!(sanitize_filename("aux.tar.gz"), "aux_.tar.gz");
        assert_eq!(sanitize_filename("CONCERT"), "CONCERT");
        assert_eq!(sanitize_filename("COM10"), "COM10");
        assert_eq!(sanitize_filename("My CON"), "My CON");
    }

    #[test]
    fn test_sanitize_caps_length_on_char_boundary() {
        let long = "é".repeat(150);
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.len() <= MAX_STEM_BYTES);
        assert_eq!(sanitized.chars().count(), MAX_STEM_BYTES / 2);
    }

    #[test]
    fn test_temp_path_is_hidden_and_unique_per_session() {
        let dir = Path::new("/downloads");
        let a = temp_path(dir, "a1", "m4a");
        let b = temp_path(dir, "b2", "m4a");
        assert_ne!(a, b);
        assert_eq!(a, Path::new("/downloads/.tubegrab-a1.m4a.part"));
    }

    #[test]
    fn test_candidate_path() {
        let dir = Path::new("/music");
        assert_eq!(candidate_path(dir, "Song", "mp3", 1), Path::new("/music/Song.mp3"));
        assert_eq!(candidate_path(dir, "Song", "mp3", 2), Path::new("/music/Song_2.mp3"));
    }

    #[tokio::test]
    async fn test_publish_uses_free_name() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path();
        let source = dir.join(".part");
        tokio::fs::write(&source, b"data").await.expect("write");

        let published = publish(&source, dir, "Song", "mp3").await.expect("publish");
        assert_eq!(published, dir.join("Song.mp3"));
        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&published).await.expect("read"), b"data");
    }

    #[tokio::test]
    async fn test_publish_never_overwrites() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path();
        tokio::fs::write(dir.join("Song.mp3"), b"old").await.expect("write");
        tokio::fs::write(dir.join("Song_2.mp3"), b"older").await.expect("write");

        let source = dir.join(".part");
        tokio::fs::write(&source, b"new").await.expect("write");
        let published = publish(&source, dir, "Song", "mp3").await.expect("publish");

        assert_eq!(published, dir.join("Song_3.mp3"));
        assert_eq!(tokio::fs::read(dir.join("Song.mp3")).await.expect("read"), b"old");
        assert_eq!(tokio::fs::read(dir.join("Song_2.mp3")).await.expect("read"), b"older");
    }

    #[tokio::test]
    async fn test_concurrent_publish_claims_distinct_names() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();

        let mut handles = Vec::new();
        for i in 0..8 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move {
                let source = dir.join(format!(".part{i}"));
                tokio::fs::write(&source, format!("{i}")).await.expect("write");
                publish(&source, &dir, "Same Title", "mp3").await.expect("publish")
            }));
        }

        let mut names = Vec::new();
        for handle in handles {
            names.push(handle.await.expect("join"));
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn test_ensure_dir_creates_nested() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let nested = temp_dir.path().join("a").join("b");
        ensure_dir(&nested).await.expect("ensure");
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_ensure_dir_rejects_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let file = temp_dir.path().join("file");
        tokio::fs::write(&file, b"x").await.expect("write");
        assert!(ensure_dir(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_quietly_ignores_missing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        remove_quietly(&temp_dir.path().join("missing")).await;
    }
}
