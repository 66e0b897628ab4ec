//! Stream format model, the quality selection policy, and the small
//! formatting helpers used in API payloads.

use serde::Serialize;

/// Sentinel quality that picks the tallest matching stream.
pub const HIGHEST_QUALITY: &str = "highest";

/// One downloadable stream reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFormat {
    pub format_id: String,
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub ext: Option<String>,
    pub mime_type: Option<String>,
    pub quality_label: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bitrate: Option<f64>,
    pub filesize: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
}

impl StreamFormat {
    pub fn is_mp4(&self) -> bool {
        self.ext.as_deref() == Some("mp4")
            || self
                .mime_type
                .as_deref()
                .is_some_and(|mime| mime.contains("video/mp4"))
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// Which streams are candidates for a given endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFilter {
    /// MP4 carrying both audio and video; what gets cached, so audio can be
    /// extracted from it later.
    Muxed,
    /// Any MP4 with a video track, adaptive video-only streams included.
    VideoMp4,
}

impl FormatFilter {
    pub fn accepts(self, format: &StreamFormat) -> bool {
        if !format.is_mp4() || !format.has_video {
            return false;
        }
        match self {
            Self::Muxed => format.has_audio,
            Self::VideoMp4 => true,
        }
    }
}

/// Picks a stream: `highest` selects the maximum height (first one wins on
/// ties); any other quality must match a label exactly, otherwise the first
/// candidate is used. Returns `None` when the filter leaves nothing.
pub fn select_format<'a>(
    formats: &'a [StreamFormat],
    quality: &str,
    filter: FormatFilter,
) -> Option<&'a StreamFormat> {
    let mut candidates = formats.iter().filter(|format| filter.accepts(format));

    if quality.trim().is_empty() || quality == HIGHEST_QUALITY {
        let first = candidates.next()?;
        return Some(candidates.fold(first, |best, current| {
            if current.height.unwrap_or(0) > best.height.unwrap_or(0) {
                current
            } else {
                best
            }
        }));
    }

    let candidates: Vec<&StreamFormat> = candidates.collect();
    candidates
        .iter()
        .copied()
        .find(|format| format.quality_label.as_deref() == Some(quality))
        .or_else(|| candidates.first().copied())
}

/// Builds a YouTube style label such as `720p` or `1080p60`.
pub fn quality_label(height: Option<u32>, fps: Option<f64>) -> Option<String> {
    let height = height.filter(|value| *value > 0)?;
    match fps {
        Some(fps) if fps > 30.5 => Some(format!("{height}p{}", fps.round() as u32)),
        _ => Some(format!("{height}p")),
    }
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Human readable byte count using 1024 steps, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}
