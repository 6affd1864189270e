//! Format selection policy.
//!
//! Picks the best descriptor of a requested kind that does not exceed an
//! optional quality ceiling. The catalog is already ordered best-first, so
//! selection is the first survivor of a filter and is fully deterministic.
//!
//! Callers may instead name a format id, or a `video+audio` pair of ids. An
//! id the catalog does not list falls back to the best format of the
//! requested kind. A video-only choice is paired with the best audio so the
//! output is not silent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{FormatCatalog, FormatDescriptor, MediaKind};
use crate::error::{Error, Result, SelectionError};

/// Upper bound on the quality a caller accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCeiling {
    /// Maximum frame height in pixels; applies to video and combined entries.
    Height(u32),
    /// Maximum bitrate in kbps; applies to audio entries.
    Bitrate(u32),
}

impl QualityCeiling {
    /// Parse a ceiling such as `"720p"`, `"1920x1080"`, `"4K"` or `"128kbps"`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the text is not a recognized ceiling.
    pub fn parse(text: &str) -> Result<Self> {
        let lowered = text.trim().to_lowercase();
        let invalid = || Error::Configuration(format!("Invalid quality ceiling: '{text}'"));

        let ceiling = match lowered.as_str() {
            "8k" => Self::Height(4320),
            "4k" => Self::Height(2160),
            "2k" => Self::Height(1440),
            other => {
                if let Some(kbps) = other
                    .strip_suffix("kbps")
                    .or_else(|| other.strip_suffix('k'))
                {
                    Self::Bitrate(kbps.trim().parse().map_err(|_| invalid())?)
                } else if let Some(height) = other.strip_suffix('p') {
                    Self::Height(height.trim().parse().map_err(|_| invalid())?)
                } else if let Some((_, height)) = other.split_once('x') {
                    Self::Height(height.trim().parse().map_err(|_| invalid())?)
                } else {
                    Self::Height(other.parse().map_err(|_| invalid())?)
                }
            }
        };

        match ceiling {
            Self::Height(0) | Self::Bitrate(0) => Err(invalid()),
            valid => Ok(valid),
        }
    }

    /// Whether `descriptor` is at or below this ceiling.
    ///
    /// A ceiling for another dimension does not constrain the descriptor;
    /// an entry whose measured dimension is unknown never satisfies it.
    #[must_use]
    pub fn admits(&self, descriptor: &FormatDescriptor) -> bool {
        match (self, descriptor.kind.is_visual()) {
            (Self::Height(max), true) => descriptor.height.is_some_and(|h| h <= *max),
            (Self::Bitrate(max), false) => descriptor.bitrate_kbps.is_some_and(|b| b <= *max),
            _ => true,
        }
    }
}

impl fmt::Display for QualityCeiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Height(h) => write!(f, "{h}p"),
            Self::Bitrate(kbps) => write!(f, "{kbps} kbps"),
        }
    }
}

impl FromStr for QualityCeiling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Pick the best descriptor of `kind` not exceeding `ceiling`.
///
/// # Errors
///
/// Returns `SelectionError::NoMatch` if no descriptor qualifies.
pub fn select(
    catalog: &FormatCatalog,
    kind: MediaKind,
    ceiling: Option<QualityCeiling>,
) -> Result<&FormatDescriptor> {
    let chosen = catalog
        .of_kind(kind)
        .find(|d| ceiling.is_none_or(|c| c.admits(d)));

    match chosen {
        Some(descriptor) => {
            debug!(
                "Selected format {} ({}, {}) for {} request",
                descriptor.format_id,
                descriptor.quality_label(),
                descriptor.extension(),
                kind
            );
            Ok(descriptor)
        }
        None => Err(Error::Selection(SelectionError::NoMatch { kind, ceiling })),
    }
}

/// Formats chosen for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Stream the output is built from.
    pub primary: FormatDescriptor,
    /// Audio stream to merge into a video-only `primary`.
    pub audio: Option<FormatDescriptor>,
}

impl Selection {
    /// Whether two streams must be downloaded and merged.
    #[must_use]
    pub const fn needs_merge(&self) -> bool {
        self.audio.is_some()
    }
}

/// Look up `format_id`, either a single id or `video+audio`.
///
/// `None` when any named id is missing from the catalog.
#[must_use]
pub fn find_format_id<'a>(
    catalog: &'a FormatCatalog,
    format_id: &str,
) -> Option<(&'a FormatDescriptor, Option<&'a FormatDescriptor>)> {
    match format_id.split_once('+') {
        Some((video, audio)) => {
            let video = catalog.get(video.trim())?;
            let audio = catalog.get(audio.trim())?;
            Some((video, Some(audio)))
        }
        None => catalog.get(format_id.trim()).map(|d| (d, None)),
    }
}

/// Choose the formats for a request.
///
/// An explicit `format_id` wins when the catalog lists it; otherwise the best
/// `kind` under `ceiling` is used. With `pair_audio`, a video-only choice
/// gets the best audio under `ceiling`, when there is one.
///
/// # Errors
///
/// Returns `SelectionError::NoMatch` if the fallback finds nothing.
pub fn resolve(
    catalog: &FormatCatalog,
    kind: MediaKind,
    ceiling: Option<QualityCeiling>,
    format_id: Option<&str>,
    pair_audio: bool,
) -> Result<Selection> {
    let requested = format_id.and_then(|id| {
        let found = find_format_id(catalog, id);
        if found.is_none() {
            warn!(
                "Format {} is not available, falling back to the best {} format",
                id, kind
            );
        }
        found
    });

    let (primary, audio) = match requested {
        Some(found) => found,
        None => (select(catalog, kind, ceiling)?, None),
    };

    let audio = match audio {
        Some(audio) => Some(audio),
        None if pair_audio && primary.kind == MediaKind::Video => {
            let paired = select(catalog, MediaKind::Audio, ceiling).ok();
            match paired {
                Some(audio) => debug!(
                    "Pairing video {} with audio {}",
                    primary.format_id, audio.format_id
                ),
                None => warn!("No audio to pair with video {}", primary.format_id),
            }
            paired
        }
        None => None,
    };

    Ok(Selection {
        primary: primary.clone(),
        audio: audio.cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_catalog;
    use crate::error::ErrorKind;
    use crate::metadata::{RawFormat, RawMetadata};

    fn sample_catalog() -> FormatCatalog {
        let video = |id: &str, height: u32| RawFormat {
            format_id: Some(id.to_string()),
            url: Some(format!("https://cdn.example.com/{id}")),
            ext: Some("mp4".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some("none".to_string()),
            height: Some(height),
            ..RawFormat::default()
        };
        let audio = |id: &str, abr: f64| RawFormat {
            format_id: Some(id.to_string()),
            url: Some(format!("https://cdn.example.com/{id}")),
            ext: Some("webm".to_string()),
            vcodec: Some("none".to_string()),
            acodec: Some("opus".to_string()),
            abr: Some(abr),
            ..RawFormat::default()
        };
        let raw = RawMetadata {
            formats: vec![
                video("360", 360),
                audio("a128", 128.0),
                video("1080", 1080),
                audio("a256", 256.0),
                video("720", 720),
            ],
            ..RawMetadata::default()
        };
        build_catalog(&raw).expect("catalog")
    }

    #[test]
    fn test_best_without_ceiling() {
        let catalog = sample_catalog();
        let audio = select(&catalog, MediaKind::Audio, None).expect("audio");
        assert_eq!(audio.format_id, "a256");
        let video = select(&catalog, MediaKind::Video, None).expect("video");
        assert_eq!(video.format_id, "1080");
    }

    #[test]
    fn test_best_under_ceiling() {
        let catalog = sample_catalog();
        let chosen = select(&catalog, MediaKind::Video, Some(QualityCeiling::Height(720)))
            .expect("video");
        assert_eq!(chosen.format_id, "720");

        let chosen = select(&catalog, MediaKind::Video, Some(QualityCeiling::Height(719)))
            .expect("video");
        assert_eq!(chosen.format_id, "360");

        let chosen = select(&catalog, MediaKind::Audio, Some(QualityCeiling::Bitrate(200)))
            .expect("audio");
        assert_eq!(chosen.format_id, "a128");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let catalog = sample_catalog();
        let ceiling = Some(QualityCeiling::Height(1000));
        let first = select(&catalog, MediaKind::Video, ceiling).expect("video");
        for _ in 0..10 {
            let again = select(&catalog, MediaKind::Video, ceiling).expect("video");
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_ceiling_excluding_everything_is_no_match() {
        let catalog = sample_catalog();
        let err = select(&catalog, MediaKind::Video, Some(QualityCeiling::Height(240)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMatch);

        let err = select(&catalog, MediaKind::Audio, Some(QualityCeiling::Bitrate(64)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMatch);
    }

    #[test]
    fn test_missing_kind_is_no_match() {
        let catalog = sample_catalog();
        let err = select(&catalog, MediaKind::Combined, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Selection(SelectionError::NoMatch {
                kind: MediaKind::Combined,
                ceiling: None
            })
        ));
    }

    #[test]
    fn test_foreign_ceiling_does_not_constrain() {
        let catalog = sample_catalog();
        let chosen = select(&catalog, MediaKind::Audio, Some(QualityCeiling::Height(144)))
            .expect("audio");
        assert_eq!(chosen.format_id, "a256");
    }

    #[test]
    fn test_explicit_format_id_is_honored() {
        let catalog = sample_catalog();
        let chosen = resolve(&catalog, MediaKind::Video, None, Some("720"), false)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "720");
        assert!(!chosen.needs_merge());

        let chosen = resolve(&catalog, MediaKind::Audio, None, Some("a128"), false)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "a128");
    }

    #[test]
    fn test_explicit_pair_is_honored() {
        let catalog = sample_catalog();
        let chosen = resolve(&catalog, MediaKind::Video, None, Some("360+a128"), true)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "360");
        assert_eq!(
            chosen.audio.map(|a| a.format_id).as_deref(),
            Some("a128")
        );
    }

    #[test]
    fn test_unknown_format_id_falls_back_to_best_of_kind() {
        let catalog = sample_catalog();
        let ceiling = Some(QualityCeiling::Height(720));
        let chosen = resolve(&catalog, MediaKind::Video, ceiling, Some("999"), false)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "720");

        let chosen = resolve(&catalog, MediaKind::Video, None, Some("1080+999"), false)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "1080");
        assert!(chosen.audio.is_none());

        assert!(find_format_id(&catalog, "999").is_none());
        assert!(find_format_id(&catalog, "+a128").is_none());
    }

    #[test]
    fn test_video_only_choice_is_paired_with_best_audio() {
        let catalog = sample_catalog();
        let chosen = resolve(&catalog, MediaKind::Video, None, None, true).expect("resolve");
        assert_eq!(chosen.primary.format_id, "1080");
        assert_eq!(
            chosen.audio.as_ref().map(|a| a.format_id.as_str()),
            Some("a256")
        );

        let chosen = resolve(&catalog, MediaKind::Audio, None, None, true).expect("resolve");
        assert!(chosen.audio.is_none());
    }

    #[test]
    fn test_pairing_without_audio_keeps_video_alone() {
        let raw = RawMetadata {
            formats: vec![RawFormat {
                format_id: Some("137".to_string()),
                url: Some("https://cdn.example.com/137".to_string()),
                vcodec: Some("avc1".to_string()),
                acodec: Some("none".to_string()),
                height: Some(1080),
                ..RawFormat::default()
            }],
            ..RawMetadata::default()
        };
        let catalog = build_catalog(&raw).expect("catalog");
        let chosen = resolve(&catalog, MediaKind::Video, None, None, true).expect("resolve");
        assert_eq!(chosen.primary.format_id, "137");
        assert!(!chosen.needs_merge());
    }

    #[test]
    fn test_combined_request_skips_manifest_entries() {
        let json = r#"{
            "id": "abc123",
            "title": "Clip",
            "formats": [
                {"format_id": "18", "url": "https://cdn.example.com/18", "protocol": "https",
                 "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a.40.2", "height": 360},
                {"format_id": "96", "url": "https://manifest.example.com/96.m3u8",
                 "protocol": "m3u8_native", "ext": "mp4", "vcodec": "avc1",
                 "acodec": "mp4a.40.2", "height": 1080}
            ]
        }"#;
        let raw = crate::metadata::parse_metadata(json.as_bytes()).expect("parse");
        let catalog = build_catalog(&raw).expect("catalog");

        let chosen = select(&catalog, MediaKind::Combined, None).expect("combined");
        assert_eq!(chosen.format_id, "18");
        let chosen = resolve(&catalog, MediaKind::Combined, None, Some("96"), true)
            .expect("resolve");
        assert_eq!(chosen.primary.format_id, "18");
    }

    #[test]
    fn test_parse_ceilings() {
        assert_eq!(QualityCeiling::parse("720p").unwrap(), QualityCeiling::Height(720));
        assert_eq!(QualityCeiling::parse("1080").unwrap(), QualityCeiling::Height(1080));
        assert_eq!(
            QualityCeiling::parse("1920x1080").unwrap(),
            QualityCeiling::Height(1080)
        );
        assert_eq!(QualityCeiling::parse("4K").unwrap(), QualityCeiling::Height(2160));
        assert_eq!(QualityCeiling::parse("8k").unwrap(), QualityCeiling::Height(4320));
        assert_eq!(QualityCeiling::parse("128k").unwrap(), QualityCeiling::Bitrate(128));
        assert_eq!(
            QualityCeiling::parse(" 160kbps ").unwrap(),
            QualityCeiling::Bitrate(160)
        );
        assert_eq!("480p".parse::<QualityCeiling>().unwrap(), QualityCeiling::Height(480));

        for bad in ["", "best", "0p", "xp", "1920x"] {
            assert!(QualityCeiling::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(QualityCeiling::Height(720).to_string(), "720p");
        assert_eq!(QualityCeiling::Bitrate(128).to_string(), "128 kbps");
    }
}
