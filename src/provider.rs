//! Metadata and stream provider abstraction.
//!
//! The orchestrator only talks to [`MediaProvider`]; the production
//! implementation shells out to yt-dlp for metadata and uses `ureq` for the
//! oEmbed endpoint and raw stream downloads.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::UpstreamError;
use crate::fallback::ClientIdentity;
use crate::formats::{StreamFormat, quality_label};
use crate::youtube;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

static HTTP_STATUS_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)HTTP Error (\d{3})").ok());

/// Minimal preview from the oEmbed endpoint, used when full extraction fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OEmbedInfo {
    pub title: String,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
}

/// Normalized metadata for one video.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoDetails {
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub length_seconds: Option<u64>,
    pub view_count: Option<u64>,
    /// `YYYY-MM-DD`.
    pub upload_date: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<StreamFormat>,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_info(&self, url: &str, client: ClientIdentity) -> Result<VideoDetails, UpstreamError>;

    async fn fetch_oembed(&self, url: &str) -> Result<OEmbedInfo, UpstreamError>;

    /// Streams `stream_url` into `dest` and returns the number of bytes written.
    async fn download(&self, stream_url: &str, dest: &Path) -> Result<u64, UpstreamError>;
}

pub struct YtDlpProvider {
    program: PathBuf,
    agent: ureq::Agent,
}

impl YtDlpProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            program: program.into(),
            agent,
        }
    }
}

#[async_trait]
impl MediaProvider for YtDlpProvider {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn fetch_info(&self, url: &str, client: ClientIdentity) -> Result<VideoDetails, UpstreamError> {
        let output = Command::new(&self.program)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--extractor-args")
            .arg(format!("youtube:player_client={}", client.as_str()))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| launch_error(&self.program, &err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ytdlp_failure(&stderr, output.status.code()));
        }

        let raw: RawVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| UpstreamError::new(format!("parsing yt-dlp metadata: {err}")))?;
        Ok(raw.into_details())
    }

    async fn fetch_oembed(&self, url: &str) -> Result<OEmbedInfo, UpstreamError> {
        let video_id = youtube::extract_video_id(url)
            .ok_or_else(|| UpstreamError::new("Not a YouTube URL"))?;
        let endpoint = youtube::oembed_url(video_id);
        let agent = self.agent.clone();

        let raw: RawOEmbed = tokio::task::spawn_blocking(move || {
            let response = agent.get(&endpoint).call().map_err(http_error)?;
            response
                .into_json::<RawOEmbed>()
                .map_err(|err| UpstreamError::new(format!("parsing oEmbed response: {err}")))
        })
        .await
        .map_err(|err| UpstreamError::new(format!("oEmbed task failed: {err}")))??;

        Ok(OEmbedInfo {
            title: raw.title,
            author: raw.author_name,
            thumbnail: raw.thumbnail_url,
        })
    }

    async fn download(&self, stream_url: &str, dest: &Path) -> Result<u64, UpstreamError> {
        let agent = self.agent.clone();
        let stream_url = stream_url.to_string();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let response = agent.get(&stream_url).call().map_err(http_error)?;
            let mut reader = response.into_reader();
            let mut file = File::create(&dest).map_err(|err| {
                UpstreamError::new(format!("creating {}: {err}", dest.display()))
            })?;
            io::copy(&mut reader, &mut file).map_err(|err| {
                UpstreamError::new(format!("Failed to download video: {err}"))
                    .with_code(io_error_code(&err))
            })
        })
        .await
        .map_err(|err| UpstreamError::new(format!("download task failed: {err}")))?
    }
}

fn launch_error(program: &Path, err: &io::Error) -> UpstreamError {
    UpstreamError::new(format!("failed to launch {}: {err}", program.display()))
}

/// Builds an upstream error from yt-dlp's stderr, lifting `HTTP Error NNN`
/// into the status code.
pub fn ytdlp_failure(stderr: &str, exit_code: Option<i32>) -> UpstreamError {
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .map(|line| line.trim().trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| match exit_code {
            Some(code) => format!("yt-dlp exited with status {code}"),
            None => "yt-dlp terminated by signal".to_string(),
        });

    let status = HTTP_STATUS_PATTERN
        .as_ref()
        .and_then(|pattern| pattern.captures(stderr))
        .and_then(|captures| captures.get(1))
        .and_then(|code| code.as_str().parse::<u16>().ok());

    let error = UpstreamError::new(message);
    match status {
        Some(status) => error.with_status(status),
        None => error,
    }
}

fn http_error(err: ureq::Error) -> UpstreamError {
    match err {
        ureq::Error::Status(status, response) => UpstreamError::new(format!(
            "HTTP Error {status}: {}",
            response.status_text()
        ))
        .with_status(status),
        ureq::Error::Transport(transport) => {
            let code = match transport.kind() {
                ureq::ErrorKind::Dns => Some("ENOTFOUND"),
                ureq::ErrorKind::ConnectionFailed => Some("ECONNREFUSED"),
                ureq::ErrorKind::Io => Some("ECONNRESET"),
                _ => None,
            };
            let error = UpstreamError::new(format!("network request failed: {transport}"));
            match code {
                Some(code) => error.with_code(code),
                None => error,
            }
        }
    }
}

fn io_error_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        _ => "ECONNRESET",
    }
}

#[derive(Debug, Deserialize)]
struct RawOEmbed {
    title: String,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.first(),
        }
    }
}

/// yt-dlp reports some numbers as floats and older extractors as strings.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(untagged)]
enum Numeric {
    Int(u64),
    Float(f64),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum LooseNumber {
    Number(Numeric),
    Text(String),
}

impl LooseNumber {
    fn as_u64(&self) -> Option<u64> {
        match self {
            LooseNumber::Number(Numeric::Int(value)) => Some(*value),
            LooseNumber::Number(Numeric::Float(value)) if value.is_finite() && *value >= 0.0 => {
                Some(value.round() as u64)
            }
            LooseNumber::Number(Numeric::Float(_)) => None,
            LooseNumber::Text(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

/// Subset of the `yt-dlp --dump-single-json` payload. Everything is optional
/// because older videos may lack metadata.
#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    uploader: Option<OneOrMany<String>>,
    channel: Option<OneOrMany<String>>,
    view_count: Option<LooseNumber>,
    duration: Option<LooseNumber>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    tbr: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

impl RawVideoInfo {
    fn into_details(self) -> VideoDetails {
        let title = self
            .title
            .or(self.fulltitle)
            .unwrap_or_else(|| "Untitled".to_string());
        let author = self
            .channel
            .as_ref()
            .and_then(OneOrMany::first)
            .or_else(|| self.uploader.as_ref().and_then(OneOrMany::first))
            .cloned();
        // yt-dlp orders thumbnails from worst to best.
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.iter().rev().find_map(|thumb| thumb.url.clone()));

        VideoDetails {
            id: self.id,
            title,
            description: self.description,
            author,
            length_seconds: self.duration.as_ref().and_then(LooseNumber::as_u64),
            view_count: self.view_count.as_ref().and_then(LooseNumber::as_u64),
            upload_date: self.upload_date.as_deref().and_then(normalize_upload_date),
            thumbnail,
            formats: self.formats.into_iter().filter_map(RawFormat::into_stream).collect(),
        }
    }
}

impl RawFormat {
    fn into_stream(self) -> Option<StreamFormat> {
        let format_id = self.format_id?;
        let has_video = codec_present(self.vcodec.as_deref()) || self.height.is_some_and(|h| h > 0);
        let has_audio = codec_present(self.acodec.as_deref());
        // Storyboards and manifests carry neither track.
        if !has_video && !has_audio {
            return None;
        }

        let mime_type = self.ext.as_deref().map(|ext| {
            let kind = if has_video { "video" } else { "audio" };
            format!("{kind}/{ext}")
        });
        let label = if has_video {
            quality_label(self.height, self.fps).or(self.format_note)
        } else {
            None
        };

        Some(StreamFormat {
            format_id,
            url: self.url,
            ext: self.ext,
            mime_type,
            quality_label: label,
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate: self.tbr,
            filesize: self
                .filesize
                .or_else(|| self.filesize_approx.map(|size| size.max(0.0).round() as u64)),
            has_video,
            has_audio,
        })
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

/// Accepts yt-dlp's `YYYYMMDD` or an ISO date and renders `YYYY-MM-DD`.
pub fn normalize_upload_date(value: &str) -> Option<String> {
    let value = value.trim();
    let date = if value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()) {
        NaiveDate::from_ymd_opt(
            value[0..4].parse().ok()?,
            value[4..6].parse().ok()?,
            value[6..8].parse().ok()?,
        )?
    } else {
        NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()?
    };
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::tests::install_script;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE_JSON: &str = r#"{
  "id": "dQw4w9WgXcQ",
  "title": "Sample Title",
  "description": "Sample description",
  "channel": "Channel",
  "view_count": 1234,
  "duration": 125.0,
  "upload_date": "20240102",
  "thumbnails": [
    {"url": "https://i.ytimg.com/low.jpg"},
    {"url": "https://i.ytimg.com/high.jpg"}
  ],
  "formats": [
    {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none"},
    {"format_id": "140", "url": "https://cdn/140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "tbr": 130.0},
    {"format_id": "18", "url": "https://cdn/18", "ext": "mp4", "width": 640, "height": 360, "fps": 25, "vcodec": "avc1", "acodec": "mp4a", "filesize": 4096},
    {"format_id": "299", "url": "https://cdn/299", "ext": "mp4", "width": 1920, "height": 1080, "fps": 60, "vcodec": "avc1", "acodec": "none", "filesize_approx": 99.6}
  ]
}"#;

    fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let log = dir.join("yt-dlp.args");
        let payload = dir.join("payload.json");
        fs::write(&payload, SAMPLE_JSON).unwrap();
        install_script(
            dir,
            "yt-dlp",
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\ncat '{}'\n",
                log.display(),
                payload.display()
            ),
        )
    }

    #[tokio::test]
    async fn fetch_info_maps_ytdlp_payload() {
        let dir = tempdir().unwrap();
        let provider = YtDlpProvider::new(install_ytdlp_stub(dir.path()));

        let details = provider
            .fetch_info("https://youtu.be/dQw4w9WgXcQ", ClientIdentity::Ios)
            .await
            .unwrap();

        assert_eq!(details.title, "Sample Title");
        assert_eq!(details.author.as_deref(), Some("Channel"));
        assert_eq!(details.length_seconds, Some(125));
        assert_eq!(details.view_count, Some(1234));
        assert_eq!(details.upload_date.as_deref(), Some("2024-01-02"));
        assert_eq!(details.thumbnail.as_deref(), Some("https://i.ytimg.com/high.jpg"));

        let ids: Vec<&str> = details.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, vec!["140", "18", "299"]);
        assert!(details.formats[0].is_audio_only());
        assert_eq!(details.formats[1].quality_label.as_deref(), Some("360p"));
        assert_eq!(details.formats[2].quality_label.as_deref(), Some("1080p60"));
        assert_eq!(details.formats[2].filesize, Some(100));

        let args = fs::read_to_string(dir.path().join("yt-dlp.args")).unwrap();
        assert!(args.contains("--extractor-args\nyoutube:player_client=ios\n"));
        assert!(args.trim_end().ends_with("https://youtu.be/dQw4w9WgXcQ"));
    }

    #[tokio::test]
    async fn failing_ytdlp_carries_http_status() {
        let dir = tempdir().unwrap();
        let script = install_script(
            dir.path(),
            "yt-dlp",
            "echo 'WARNING: retrying' >&2\necho 'ERROR: [youtube] abc: Unable to download webpage: HTTP Error 403: Forbidden' >&2\nexit 1\n",
        );
        let provider = YtDlpProvider::new(script);

        let err = provider
            .fetch_info("https://youtu.be/dQw4w9WgXcQ", ClientIdentity::Tv)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(403));
        assert!(err.message.starts_with("[youtube] abc"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_upstream_error() {
        let provider = YtDlpProvider::new("/nonexistent/yt-dlp");
        let err = provider
            .fetch_info("https://youtu.be/dQw4w9WgXcQ", ClientIdentity::WebEmbedded)
            .await
            .unwrap_err();
        assert!(err.message.contains("failed to launch"));
    }

    #[tokio::test]
    async fn oembed_rejects_non_youtube_urls_without_network() {
        let provider = YtDlpProvider::new("yt-dlp");
        let err = provider.fetch_oembed("https://vimeo.com/1").await.unwrap_err();
        assert_eq!(err.message, "Not a YouTube URL");
    }

    #[test]
    fn duration_accepts_strings_and_floats() {
        let raw: RawVideoInfo =
            serde_json::from_str(r#"{"title": "T", "duration": "125", "view_count": 3.0}"#).unwrap();
        let details = raw.into_details();
        assert_eq!(details.length_seconds, Some(125));
        assert_eq!(details.view_count, Some(3));
    }

    #[test]
    fn upload_dates_are_normalized() {
        assert_eq!(normalize_upload_date("20231231").as_deref(), Some("2023-12-31"));
        assert_eq!(normalize_upload_date("2023-12-31T10:00:00Z").as_deref(), Some("2023-12-31"));
        assert_eq!(normalize_upload_date("yesterday"), None);
    }

    #[test]
    fn ytdlp_failure_without_stderr_uses_exit_code() {
        let err = ytdlp_failure("", Some(2));
        assert_eq!(err.message, "yt-dlp exited with status 2");
        assert_eq!(err.status_code, None);
    }
}
