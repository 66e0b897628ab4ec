//! Extraction orchestrator.
//!
//! Every operation follows the same shape: check the cache, fetch through the
//! client rotation and retry policy when needed, persist, optionally derive
//! (transcode), then hand a response-ready value back to the HTTP layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tempfile::TempDir;

use crate::cache::{
    Artifact, ArtifactCategory, CacheKey, CacheStats, CachedArtifact, DiskCache, PurgeReport,
    PurgeTarget,
};
use crate::error::{Error, IoContext, Result, UpstreamError};
use crate::fallback::ClientRotation;
use crate::formats::{FormatFilter, HIGHEST_QUALITY, StreamFormat, format_duration, select_format};
use crate::provider::{MediaProvider, OEmbedInfo, VideoDetails};
use crate::retry::RetryPolicy;
use crate::transcode::{AudioFormat, FrameSampling, Transcoder};
use crate::youtube;

pub const CACHE_FIRST_SUGGESTION: &str =
    "Cache the video first by calling /api/download-cache with the same URL.";
const PNG_DATA_PREFIX: &str = "data:image/png;base64,";

/// What audio/frame extraction does when the source video is not cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingSourceBehavior {
    /// Answer 404 with a suggestion to cache first.
    #[default]
    NotFound,
    /// Download and cache the source on demand.
    Fetch,
}

impl MissingSourceBehavior {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "404" | "not_found" | "notfound" => Some(Self::NotFound),
            "fetch" | "download" | "on_demand" => Some(Self::Fetch),
            _ => None,
        }
    }
}

/// Input of the derive operations: a fresh URL or a key returned earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    Key(CacheKey),
}

impl MediaSource {
    /// `url` wins when both are given. A URL must point at YouTube even when
    /// the source turns out to be cached.
    pub fn from_request(url: Option<&str>, video_id: Option<&str>) -> Result<Self> {
        if let Some(url) = url.map(str::trim).filter(|url| !url.is_empty()) {
            return validate_url(url).map(|url| Self::Url(url.to_string()));
        }
        match video_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => CacheKey::parse(id)
                .map(Self::Key)
                .ok_or_else(|| Error::invalid_input("videoId is not a valid cache key")),
            None => Err(Error::invalid_input("URL or videoId is required")),
        }
    }

    pub fn key(&self) -> CacheKey {
        match self {
            Self::Url(url) => CacheKey::for_url(url),
            Self::Key(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    /// `M:SS` or `H:MM:SS`.
    pub duration: Option<String>,
    pub length_seconds: Option<u64>,
    pub author: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub description: Option<String>,
    pub formats: Vec<StreamFormat>,
    pub audio_formats: Vec<StreamFormat>,
    /// Set when only the oEmbed preview could be fetched.
    pub limited: bool,
}

impl VideoInfo {
    fn from_details(details: VideoDetails) -> Self {
        let (audio_formats, formats): (Vec<_>, Vec<_>) = details
            .formats
            .into_iter()
            .partition(StreamFormat::is_audio_only);
        Self {
            title: details.title,
            thumbnail: details.thumbnail,
            duration: details.length_seconds.map(format_duration),
            length_seconds: details.length_seconds,
            author: details.author,
            view_count: details.view_count,
            upload_date: details.upload_date,
            description: details.description,
            formats,
            audio_formats,
            limited: false,
        }
    }

    fn from_preview(preview: OEmbedInfo) -> Self {
        Self {
            title: preview.title,
            thumbnail: preview.thumbnail,
            duration: None,
            length_seconds: None,
            author: preview.author,
            view_count: None,
            upload_date: None,
            description: None,
            formats: Vec::new(),
            audio_formats: Vec::new(),
            limited: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectDownload {
    pub download_url: String,
    pub title: String,
    pub quality: Option<String>,
    pub filesize: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedVideo {
    pub video_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub cached: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioPayload {
    pub filename: String,
    /// `data:audio/<fmt>;base64,...`
    pub data: String,
    pub format: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedAudio {
    pub audio: AudioPayload,
    pub video_id: String,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FramePayload {
    pub filename: String,
    pub data: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFrames {
    pub frames: Vec<FramePayload>,
    pub video_id: String,
    pub frame_count: usize,
}

/// Construction parameters; everything that used to be ambient module state.
#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub cache_root: PathBuf,
    pub public_root: PathBuf,
    pub temp_root: PathBuf,
    pub transcoder: Transcoder,
    pub retry: RetryPolicy,
    pub rotation: ClientRotation,
    pub missing_source: MissingSourceBehavior,
}

pub struct Extractor {
    provider: Arc<dyn MediaProvider>,
    cache: DiskCache,
    transcoder: Transcoder,
    retry: RetryPolicy,
    rotation: ClientRotation,
    public_root: PathBuf,
    temp_root: PathBuf,
    missing_source: MissingSourceBehavior,
}

impl Extractor {
    pub fn new(provider: Arc<dyn MediaProvider>, options: ExtractorOptions) -> Self {
        Self {
            provider,
            cache: DiskCache::new(options.cache_root),
            transcoder: options.transcoder,
            retry: options.retry,
            rotation: options.rotation,
            public_root: options.public_root,
            temp_root: options.temp_root,
            missing_source: options.missing_source,
        }
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    pub async fn video_info(&self, url: &str) -> Result<VideoInfo> {
        let url = validate_url(url)?;
        match self.fetch_details(url).await {
            Ok(details) => Ok(VideoInfo::from_details(details)),
            Err(err) => match self.provider.fetch_oembed(url).await {
                Ok(preview) => {
                    tracing::warn!(%url, error = %err, "full extraction failed, serving oEmbed preview");
                    Ok(VideoInfo::from_preview(preview))
                }
                Err(oembed_err) => {
                    tracing::warn!(%url, error = %oembed_err, "oEmbed fallback failed");
                    Err(Error::upstream(err))
                }
            },
        }
    }

    /// Resolves a direct stream URL without proxying any bytes.
    pub async fn direct_download(&self, url: &str, quality: &str) -> Result<DirectDownload> {
        let url = validate_url(url)?;
        let details = self.fetch_details(url).await.map_err(Error::upstream)?;
        let format = select_format(&details.formats, quality, FormatFilter::VideoMp4)
            .ok_or(Error::NoSuitableFormat)?;
        let download_url = format.url.clone().ok_or(Error::NoSuitableFormat)?;

        Ok(DirectDownload {
            download_url,
            title: details.title.clone(),
            quality: format.quality_label.clone(),
            filesize: format.filesize,
        })
    }

    pub async fn cache_video(&self, url: &str, quality: &str) -> Result<CachedVideo> {
        let url = validate_url(url)?;
        let key = CacheKey::for_url(url);
        let file_name = Artifact::Video.file_name(&key);
        let _guard = self.cache.lock(ArtifactCategory::Videos, &key).await;

        if let Some(file_size) = self.cached_size(Artifact::Video, &key).await {
            tracing::info!(%key, "video cache hit");
            return Ok(CachedVideo {
                video_id: key.to_string(),
                file_name,
                file_size,
                cached: true,
                message: "Video already cached and ready for processing".into(),
                title: None,
                quality: None,
            });
        }
        tracing::info!(%key, %url, "video cache miss");

        let details = match self.fetch_details(url).await {
            Ok(details) => details,
            Err(err) => return Err(self.unavailable(url, err).await),
        };
        let format = select_format(&details.formats, quality, FormatFilter::Muxed)
            .ok_or(Error::NoSuitableFormat)?;
        let stream_url = format.url.as_deref().ok_or(Error::NoSuitableFormat)?;

        let scratch = self.scratch_dir().await?;
        let download_path = scratch.path().join(&file_name);
        let downloaded = self
            .retry
            .run_observed(
                || self.provider.download(stream_url, &download_path),
                |attempt| {
                    tracing::warn!(
                        attempt = attempt.attempt,
                        delay_ms = attempt.delay.as_millis() as u64,
                        error = %attempt.error,
                        "stream download failed, retrying"
                    );
                },
            )
            .await;
        if let Err(err) = downloaded {
            return Err(self.unavailable(url, err).await);
        }

        let file_size = self
            .cache
            .put_file(Artifact::Video, &key, &download_path)
            .await?;
        tracing::info!(%key, bytes = file_size, "video cached");

        Ok(CachedVideo {
            video_id: key.to_string(),
            file_name,
            file_size,
            cached: false,
            message: "Video downloaded and cached successfully".into(),
            title: Some(details.title.clone()),
            quality: format.quality_label.clone(),
        })
    }

    pub async fn extract_audio(&self, source: &MediaSource, format: AudioFormat) -> Result<ExtractedAudio> {
        let key = source.key();
        let artifact = Artifact::Audio(format);
        let _guard = self.cache.lock(ArtifactCategory::Audio, &key).await;

        let (bytes, cached) = match self.cache.get(artifact, &key).await? {
            Some(CachedArtifact::Bytes(bytes)) => {
                tracing::info!(%key, %format, "audio cache hit");
                (bytes, true)
            }
            _ => {
                let video = self.ensure_source(source, &key).await?;
                let scratch = self.scratch_dir().await?;
                let output = scratch.path().join(artifact.file_name(&key));
                self.transcoder.extract_audio(&video, &output, format).await?;
                self.cache.put_file(artifact, &key, &output).await?;
                let cached_path = self.cache.path_for(artifact, &key);
                let bytes = tokio::fs::read(&cached_path)
                    .await
                    .io_context(|| format!("reading {}", cached_path.display()))?;
                (bytes, false)
            }
        };

        let size = bytes.len() as u64;
        Ok(ExtractedAudio {
            audio: AudioPayload {
                filename: artifact.file_name(&key),
                data: format!("{}{}", format.data_url_prefix(), STANDARD.encode(&bytes)),
                format: format.to_string(),
                size,
            },
            video_id: key.to_string(),
            cached,
        })
    }

    /// Frames always get regenerated since they depend on the sampling. The
    /// cached frame-set is replaced and mirrored into the public root.
    pub async fn extract_frames(&self, source: &MediaSource, sampling: FrameSampling) -> Result<ExtractedFrames> {
        let key = source.key();
        let _guard = self.cache.lock(ArtifactCategory::Frames, &key).await;

        let video = self.ensure_source(source, &key).await?;
        let scratch = self.scratch_dir().await?;
        let extracted = self
            .transcoder
            .extract_frames(&video, &scratch.path().join("frames"), sampling)
            .await?;
        let stored = self.cache.put_frames(&key, extracted).await?;

        self.clear_public_frames(&key).await?;
        let mut frames = Vec::with_capacity(stored.len());
        for path in &stored {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let filename = format!("{key}_{name}");
            let bytes = tokio::fs::read(path)
                .await
                .io_context(|| format!("reading {}", path.display()))?;
            let public_path = self.public_root.join(&filename);
            tokio::fs::write(&public_path, &bytes)
                .await
                .io_context(|| format!("writing {}", public_path.display()))?;

            frames.push(FramePayload {
                url: format!("/api/files/{filename}"),
                data: format!("{PNG_DATA_PREFIX}{}", STANDARD.encode(&bytes)),
                filename,
            });
        }
        tracing::info!(%key, count = frames.len(), "frames extracted");

        Ok(ExtractedFrames {
            frame_count: frames.len(),
            frames,
            video_id: key.to_string(),
        })
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    pub async fn purge(&self, target: PurgeTarget) -> Result<PurgeReport> {
        self.cache.purge(target).await
    }

    /// Client rotation over retry around the provider's metadata call.
    async fn fetch_details(&self, url: &str) -> std::result::Result<VideoDetails, UpstreamError> {
        self.rotation
            .run(|client| {
                self.retry.run_observed(
                    move || self.provider.fetch_info(url, client),
                    move |attempt| {
                        tracing::warn!(
                            provider = self.provider.name(),
                            %client,
                            attempt = attempt.attempt,
                            delay_ms = attempt.delay.as_millis() as u64,
                            error = %attempt.error,
                            "metadata fetch failed, retrying"
                        );
                    },
                )
            })
            .await
    }

    /// Path of the cached source video for `source`, fetching it first when
    /// policy allows.
    async fn ensure_source(&self, source: &MediaSource, key: &CacheKey) -> Result<PathBuf> {
        let path = self.cache.path_for(Artifact::Video, key);
        if self.cache.has(Artifact::Video, key).await {
            return Ok(path);
        }

        match (source, self.missing_source) {
            (MediaSource::Url(url), MissingSourceBehavior::Fetch) => {
                tracing::info!(%key, "source video missing, fetching on demand");
                self.cache_video(url, HIGHEST_QUALITY).await?;
                Ok(path)
            }
            _ => Err(Error::NotFound {
                message: "Source video not found in cache".into(),
                suggestion: Some(CACHE_FIRST_SUGGESTION.into()),
            }),
        }
    }

    async fn unavailable(&self, url: &str, err: UpstreamError) -> Error {
        tracing::warn!(%url, error = %err, "upstream extraction failed");
        let preview = match self.provider.fetch_oembed(url).await {
            Ok(preview) => Some(preview),
            Err(oembed_err) => {
                tracing::warn!(%url, error = %oembed_err, "oEmbed fallback failed");
                None
            }
        };
        Error::UpstreamUnavailable {
            source: err,
            preview,
        }
    }

    async fn cached_size(&self, artifact: Artifact, key: &CacheKey) -> Option<u64> {
        tokio::fs::metadata(self.cache.path_for(artifact, key))
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    async fn scratch_dir(&self) -> Result<TempDir> {
        tokio::fs::create_dir_all(&self.temp_root)
            .await
            .io_context(|| format!("creating {}", self.temp_root.display()))?;
        tempfile::Builder::new()
            .prefix("ytbshow-")
            .tempdir_in(&self.temp_root)
            .io_context(|| format!("creating scratch dir in {}", self.temp_root.display()))
    }

    async fn clear_public_frames(&self, key: &CacheKey) -> Result<()> {
        tokio::fs::create_dir_all(&self.public_root)
            .await
            .io_context(|| format!("creating {}", self.public_root.display()))?;
        let prefix = format!("{key}_frame_");
        let mut entries = tokio::fs::read_dir(&self.public_root)
            .await
            .io_context(|| format!("listing {}", self.public_root.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .io_context(|| format!("listing {}", self.public_root.display()))?
        {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::invalid_input("URL is required"));
    }
    if !youtube::is_youtube_url(url) {
        return Err(Error::invalid_input("Please provide a valid YouTube URL."));
    }
    Ok(url)
}
