//! Format catalog construction.
//!
//! Turns raw upstream format entries into normalized [`FormatDescriptor`]s,
//! ordered best-first within each media kind.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, ExtractionError, Result};
use crate::metadata::{RawFormat, RawMetadata};

/// Codec value upstream uses for an absent stream.
const NO_CODEC: &str = "none";

/// Protocols whose locator is the media body itself.
const DIRECT_PROTOCOLS: &[&str] = &["http", "https"];

static KBPS_NOTE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*kbps").ok());

/// What a downloadable variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video stream without audio.
    Video,
    /// Audio stream without video.
    Audio,
    /// Video and audio muxed together.
    Combined,
}

impl MediaKind {
    /// Position of this kind in a catalog.
    const fn rank(self) -> u8 {
        match self {
            Self::Combined => 0,
            Self::Video => 1,
            Self::Audio => 2,
        }
    }

    /// Whether entries of this kind are ranked by frame height.
    #[must_use]
    pub const fn is_visual(self) -> bool {
        matches!(self, Self::Video | Self::Combined)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Combined => write!(f, "combined"),
        }
    }
}

/// One downloadable variant of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Opaque upstream identifier.
    pub format_id: String,
    /// Where the bytes are fetched from.
    pub locator: String,
    /// Headers to send with every request for `locator`.
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    /// Stream content.
    pub kind: MediaKind,
    /// Container extension hint (`"mp4"`, `"webm"`, `"m4a"`).
    pub container: Option<String>,
    /// Primary codec hint.
    pub codec: Option<String>,
    /// Frame height in pixels; `None` for audio.
    pub height: Option<u32>,
    /// Frames per second, when known.
    pub fps: Option<f64>,
    /// Bitrate in kbps (audio bitrate for audio, total otherwise).
    pub bitrate_kbps: Option<u32>,
    /// Size in bytes, exact or estimated.
    pub filesize: Option<u64>,
    /// Whether `filesize` is exact rather than an estimate.
    pub filesize_exact: bool,
    /// Whether the download must be converted to MP3 afterwards.
    pub requires_post_processing: bool,
}

impl FormatDescriptor {
    /// File extension for the raw download.
    #[must_use]
    pub fn extension(&self) -> &str {
        self.container
            .as_deref()
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin")
    }

    /// Exact size in bytes, if upstream reported one.
    #[must_use]
    pub fn exact_size(&self) -> Option<u64> {
        self.filesize.filter(|_| self.filesize_exact)
    }

    /// Human-readable quality, e.g. `"1080p"`, `"4K"` or `"128 kbps"`.
    #[must_use]
    pub fn quality_label(&self) -> String {
        if self.kind.is_visual() {
            return self
                .height
                .map_or_else(|| "unknown".to_string(), height_label);
        }
        self.bitrate_kbps
            .map_or_else(|| "unknown".to_string(), |kbps| format!("{kbps} kbps"))
    }

    /// Compare quality against another descriptor of the same kind.
    fn quality_cmp(&self, other: &Self) -> Ordering {
        if self.kind.is_visual() {
            self.height
                .unwrap_or(0)
                .cmp(&other.height.unwrap_or(0))
                .then_with(|| self.fps.unwrap_or(0.0).total_cmp(&other.fps.unwrap_or(0.0)))
                .then_with(|| {
                    self.bitrate_kbps
                        .unwrap_or(0)
                        .cmp(&other.bitrate_kbps.unwrap_or(0))
                })
        } else {
            self.bitrate_kbps
                .unwrap_or(0)
                .cmp(&other.bitrate_kbps.unwrap_or(0))
        }
    }
}

/// Label a frame height the way players do.
#[must_use]
pub fn height_label(height: u32) -> String {
    match height {
        h if h >= 4320 => "8K".to_string(),
        h if h >= 2160 => "4K".to_string(),
        h => format!("{h}p"),
    }
}

/// Ordered descriptors for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatCatalog {
    entries: Vec<FormatDescriptor>,
}

impl FormatCatalog {
    /// All entries, grouped by kind and best-first within each kind.
    #[must_use]
    pub fn entries(&self) -> &[FormatDescriptor] {
        &self.entries
    }

    /// Entries of one kind, best-first.
    pub fn of_kind(&self, kind: MediaKind) -> impl Iterator<Item = &FormatDescriptor> {
        self.entries.iter().filter(move |d| d.kind == kind)
    }

    /// Find an entry by upstream identifier.
    #[must_use]
    pub fn get(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.entries.iter().find(|d| d.format_id == format_id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a catalog from raw metadata.
///
/// Entries without a format id or URL are dropped, as are entries delivered
/// over a streaming protocol (HLS, DASH) whose URL is a manifest rather than
/// the media, and entries that carry neither an audio nor a video stream.
///
/// # Errors
///
/// Returns `ExtractionError::NoFormats` if no usable entry remains.
pub fn build_catalog(raw: &RawMetadata) -> Result<FormatCatalog> {
    let mut entries: Vec<FormatDescriptor> = raw.formats.iter().filter_map(normalize).collect();

    if entries.is_empty() {
        let url = raw
            .webpage_url
            .clone()
            .or_else(|| raw.id.clone())
            .unwrap_or_default();
        return Err(Error::Extraction(ExtractionError::NoFormats { url }));
    }

    // Stable sort keeps upstream order among equal quality
    entries.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| b.quality_cmp(a))
    });

    debug!(
        "Cataloged {} of {} formats ({} audio)",
        entries.len(),
        raw.formats.len(),
        entries.iter().filter(|d| d.kind == MediaKind::Audio).count()
    );
    Ok(FormatCatalog { entries })
}

fn normalize(format: &RawFormat) -> Option<FormatDescriptor> {
    let format_id = non_empty(format.format_id.as_deref())?;
    let Some(locator) = non_empty(format.url.as_deref()) else {
        trace!("Skipping format {} without a locator", format_id);
        return None;
    };
    if let Some(protocol) = non_empty(format.protocol.as_deref())
        && !DIRECT_PROTOCOLS.contains(&protocol.to_ascii_lowercase().as_str())
    {
        trace!("Skipping format {} served over {}", format_id, protocol);
        return None;
    }

    let video_codec = present_codec(format.vcodec.as_deref());
    let audio_codec = present_codec(format.acodec.as_deref());
    let audio_only_label = format.resolution.as_deref() == Some("audio only");

    let kind = match (video_codec, audio_codec) {
        (Some(_), Some(_)) => MediaKind::Combined,
        (Some(_), None) => MediaKind::Video,
        (None, Some(_)) => MediaKind::Audio,
        (None, None) if audio_only_label => MediaKind::Audio,
        (None, None) => {
            trace!("Skipping format {} without stream hints", format_id);
            return None;
        }
    };

    let (height, fps, bitrate_kbps) = match kind {
        MediaKind::Audio => (None, None, audio_bitrate(format)),
        MediaKind::Video | MediaKind::Combined => (
            format.height.filter(|h| *h > 0),
            format.fps.filter(|f| f.is_finite() && *f > 0.0),
            positive_kbps(format.tbr).or_else(|| positive_kbps(format.abr)),
        ),
    };

    let (filesize, filesize_exact) = match (format.filesize, format.filesize_approx) {
        (Some(exact), _) if exact > 0 => (Some(exact), true),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        (_, Some(approx)) if approx.is_finite() && approx > 0.0 => (Some(approx as u64), false),
        _ => (None, false),
    };

    Some(FormatDescriptor {
        format_id: format_id.to_string(),
        locator: locator.to_string(),
        http_headers: format.http_headers.clone(),
        kind,
        container: non_empty(format.ext.as_deref()).map(str::to_string),
        codec: video_codec.or(audio_codec).map(str::to_string),
        height,
        fps,
        bitrate_kbps,
        filesize,
        filesize_exact,
        requires_post_processing: kind == MediaKind::Audio,
    })
}

/// Audio bitrate: `abr`, then `tbr`, then the format note.
fn audio_bitrate(format: &RawFormat) -> Option<u32> {
    positive_kbps(format.abr)
        .or_else(|| positive_kbps(format.tbr))
        .or_else(|| format.format_note.as_deref().and_then(bitrate_from_note))
}

/// Infer a bitrate from notes like `"128kbps"` or `"medium"`.
fn bitrate_from_note(note: &str) -> Option<u32> {
    let lowered = note.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if let Some(kbps) = KBPS_NOTE
        .as_ref()
        .and_then(|re| re.captures(&lowered))
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|kbps| *kbps > 0)
    {
        return Some(kbps);
    }
    if lowered.contains("low") {
        Some(64)
    } else if lowered.contains("high") {
        Some(128)
    } else {
        Some(96)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn positive_kbps(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v >= 0.5)
        .map(|v| v.round().min(f64::from(u32::MAX)) as u32)
}

fn present_codec(codec: Option<&str>) -> Option<&str> {
    non_empty(codec).filter(|c| *c != NO_CODEC)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
