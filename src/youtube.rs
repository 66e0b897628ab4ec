//! YouTube URL helpers.

use std::sync::LazyLock;

use regex::Regex;

static VIDEO_ID_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?:youtube\.com/(?:watch\?(?:[^"\s]*&)?v=|embed/|v/|shorts/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})"#,
    )
    .ok()
});

/// Returns the 11 character video id embedded in a watch, embed, shorts or
/// short-link URL.
pub fn extract_video_id(url: &str) -> Option<&str> {
    let pattern = VIDEO_ID_PATTERN.as_ref()?;
    pattern
        .captures(url.trim())
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

pub fn is_youtube_url(url: &str) -> bool {
    extract_video_id(url).is_some()
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

pub fn oembed_url(video_id: &str) -> String {
    format!(
        "https://www.youtube.com/oembed?url={}&format=json",
        watch_url(video_id)
    )
}
