#![forbid(unsafe_code)]

//! HTTP front end for the extraction orchestrator.
//!
//! Every `/api/*` route is a thin adapter: decode the JSON body, call the
//! matching [`Extractor`] operation, and translate the crate error into a
//! status code plus a classified, user-safe message.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State, rejection::JsonRejection},
    http::{HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;
use ytbshow_tools::cache::{CacheStats, PurgeReport, PurgeTarget};
use ytbshow_tools::classify::{classify_error, classify_upstream};
use ytbshow_tools::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use ytbshow_tools::extractor::{
    CachedVideo, DirectDownload, ExtractedAudio, ExtractedFrames, Extractor, MediaSource, VideoInfo,
};
use ytbshow_tools::formats::{HIGHEST_QUALITY, format_bytes};
use ytbshow_tools::provider::YtDlpProvider;
use ytbshow_tools::security::{ensure_not_root, is_safe_path_segment};
use ytbshow_tools::transcode::{AudioFormat, FrameSampling};
use ytbshow_tools::{Error, youtube};

const FILE_CACHE_CONTROL: &str = "public, max-age=3600";
const PREVIEW_UNAVAILABLE: &str =
    "Direct video download is currently unavailable due to YouTube API restrictions.";
const PREVIEW_SUGGESTION: &str = "You can still view video information and use external tools to download the video manually.";

#[derive(Debug, Clone)]
struct BackendArgs {
    settings: RuntimeSettings,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--cache-root" => overrides.cache_root = Some(PathBuf::from(value()?)),
                "--public-root" => overrides.public_root = Some(PathBuf::from(value()?)),
                "--temp-root" => overrides.temp_root = Some(PathBuf::from(value()?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                "--port" => overrides.port = Some(parse_port_arg(&value()?)?),
                "--host" => {
                    let host = value()?;
                    parse_host_arg(&host)?;
                    overrides.host = Some(host);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(overrides)?;
        let listen_host = parse_host_arg(&settings.host)?;
        Ok(Self {
            settings,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YTBSHOW_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    extractor: Arc<Extractor>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
    extra: Map<String, Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
            extra: Map::new(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn with_extra(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidInput(message) => Self::bad_request(message),
            Error::NoSuitableFormat => Self::bad_request("No suitable format found"),
            Error::UpstreamUnavailable { source, preview } => {
                tracing::warn!(
                    error = %source,
                    status = ?source.status_code,
                    code = ?source.code,
                    "upstream extraction unavailable"
                );
                let class = classify_upstream(&source);
                match preview {
                    Some(preview) => Self::new(StatusCode::SERVICE_UNAVAILABLE, PREVIEW_UNAVAILABLE)
                        .with_details(class.message())
                        .with_extra("suggestion", PREVIEW_SUGGESTION)
                        .with_extra("videoInfo", preview),
                    None => Self::new(StatusCode::SERVICE_UNAVAILABLE, class.message()),
                }
            }
            Error::NotFound {
                message,
                suggestion,
            } => {
                let error = Self::not_found(message);
                match suggestion {
                    Some(suggestion) => error.with_extra("suggestion", suggestion),
                    None => error,
                }
            }
            err @ (Error::Transcode(_) | Error::Io { .. }) => {
                tracing::error!(error = %err, "request failed");
                Self::internal(classify_error(&err).message())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Request body must be valid JSON").with_details(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(self.message));
        if let Some(details) = self.details {
            body.insert("details".into(), Value::String(details));
        }
        body.extend(self.extra);
        (self.status, Json(Value::Object(body))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `{ "success": true, ...payload }`
#[derive(Debug, Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

impl<T> Success<T> {
    fn new(body: T) -> Json<Self> {
        Json(Self {
            success: true,
            body,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct UrlRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioRequest {
    url: Option<String>,
    video_id: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FramesRequest {
    url: Option<String>,
    video_id: Option<String>,
    frame_count: Option<u32>,
    frame_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PurgeQuery {
    #[serde(rename = "type")]
    target: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SizeReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    size: u64,
    size_formatted: String,
}

impl SizeReport {
    fn new(count: Option<u64>, size: u64) -> Self {
        Self {
            count,
            size,
            size_formatted: format_bytes(size),
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheReport {
    videos: SizeReport,
    frames: SizeReport,
    audio: SizeReport,
    total: SizeReport,
}

impl From<CacheStats> for CacheReport {
    fn from(stats: CacheStats) -> Self {
        Self {
            videos: SizeReport::new(Some(stats.videos.count), stats.videos.size),
            frames: SizeReport::new(Some(stats.frames.count), stats.frames.size),
            audio: SizeReport::new(Some(stats.audio.count), stats.audio.size),
            total: SizeReport::new(None, stats.total_size()),
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheBody {
    cache: CacheReport,
}

#[derive(Debug, Serialize)]
struct PurgeBody {
    message: String,
    deleted: SizeReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let BackendArgs {
        settings,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    tokio::fs::create_dir_all(&settings.cache_root)
        .await
        .with_context(|| format!("creating cache root {}", settings.cache_root.display()))?;
    tokio::fs::create_dir_all(&settings.public_root)
        .await
        .with_context(|| format!("creating public root {}", settings.public_root.display()))?;

    let provider = Arc::new(YtDlpProvider::new(&settings.yt_dlp));
    let extractor = Extractor::new(provider, settings.extractor_options());
    let state = AppState {
        extractor: Arc::new(extractor),
    };
    tracing::info!(
        cache_root = %settings.cache_root.display(),
        public_root = %settings.public_root.display(),
        clients = ?settings.clients.clients(),
        missing_source = ?settings.missing_source,
        "extractor configured"
    );

    let app = router(state);

    let addr = SocketAddr::new(listen_host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video-info", post(video_info))
        .route("/api/download-video", post(download_video))
        .route("/api/download-cache", post(download_cache))
        .route("/api/extract-audio", post(extract_audio))
        .route("/api/extract-frames", post(extract_frames))
        .route("/api/files/{filename}", get(serve_file))
        .route(
            "/api/cache-management",
            get(cache_stats).delete(purge_cache),
        )
        .fallback(not_found_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; Ctrl+C still terminates the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn not_found_fallback(req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    ApiError::not_found("not found").into_response()
}

fn required_url(url: Option<String>) -> ApiResult<String> {
    url.map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<VideoInfo>> {
    let Json(request) = payload?;
    let url = required_url(request.url)?;
    tracing::info!(%url, video = ?youtube::extract_video_id(&url), "video info requested");
    Ok(Json(state.extractor.video_info(&url).await?))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<DirectDownload>> {
    let Json(request) = payload?;
    let url = required_url(request.url)?;
    let quality = request.quality.unwrap_or_else(|| HIGHEST_QUALITY.to_string());
    Ok(Json(state.extractor.direct_download(&url, &quality).await?))
}

async fn download_cache(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<Success<CachedVideo>>> {
    let Json(request) = payload?;
    let url = required_url(request.url)?;
    let quality = request.quality.unwrap_or_else(|| HIGHEST_QUALITY.to_string());
    let outcome = state.extractor.cache_video(&url, &quality).await?;
    Ok(Success::new(outcome))
}

async fn extract_audio(
    State(state): State<AppState>,
    payload: Result<Json<AudioRequest>, JsonRejection>,
) -> ApiResult<Json<Success<ExtractedAudio>>> {
    let Json(request) = payload?;
    let source = MediaSource::from_request(request.url.as_deref(), request.video_id.as_deref())?;
    let format = match request.format.as_deref() {
        Some(format) => format.parse::<AudioFormat>()?,
        None => AudioFormat::default(),
    };
    let outcome = state.extractor.extract_audio(&source, format).await?;
    Ok(Success::new(outcome))
}

async fn extract_frames(
    State(state): State<AppState>,
    payload: Result<Json<FramesRequest>, JsonRejection>,
) -> ApiResult<Json<Success<ExtractedFrames>>> {
    let Json(request) = payload?;
    let source = MediaSource::from_request(request.url.as_deref(), request.video_id.as_deref())?;
    let sampling = FrameSampling::from_request(request.frame_count, request.frame_rate)?;
    let outcome = state.extractor.extract_frames(&source, sampling).await?;
    Ok(Success::new(outcome))
}

/// Serves a frame image previously written into the public root.
async fn serve_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    if !is_safe_path_segment(&filename) {
        return Err(ApiError::not_found("File not found"));
    }
    let path = state.extractor.public_root().join(&filename);
    stream_file(path).await
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mime = MimeGuess::from_path(&path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(mime_guess::mime::IMAGE_PNG);

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(FILE_CACHE_CONTROL),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    Ok(response)
}

async fn cache_stats(State(state): State<AppState>) -> ApiResult<Json<Success<CacheBody>>> {
    let stats = state.extractor.cache_stats().await?;
    Ok(Success::new(CacheBody {
        cache: stats.into(),
    }))
}

async fn purge_cache(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> ApiResult<Json<Success<PurgeBody>>> {
    let raw = query
        .target
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Cache type is required (all, videos, frames, audio)"))?;
    let target = raw.parse::<PurgeTarget>()?;
    let PurgeReport { count, size } = state.extractor.purge(target).await?;
    let label = match target {
        PurgeTarget::All => "all".to_string(),
        PurgeTarget::Category(category) => category.dir_name().to_string(),
    };

    Ok(Success::new(PurgeBody {
        message: format!("Cleared {label} cache: {} item(s), {}", count, format_bytes(size)),
        deleted: SizeReport::new(Some(count), size),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use ytbshow_tools::UpstreamError;
    use ytbshow_tools::classify::ErrorClass;
    use ytbshow_tools::cache::{Artifact, CacheKey};
    use ytbshow_tools::extractor::{ExtractorOptions, MissingSourceBehavior};
    use ytbshow_tools::fallback::{ClientIdentity, ClientRotation};
    use ytbshow_tools::formats::StreamFormat;
    use ytbshow_tools::provider::{MediaProvider, OEmbedInfo, VideoDetails};
    use ytbshow_tools::retry::RetryPolicy;
    use ytbshow_tools::transcode::Transcoder;

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    #[derive(Default)]
    struct StubProvider {
        details: Option<VideoDetails>,
        preview: Option<OEmbedInfo>,
        info_calls: AtomicUsize,
        downloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_info(
            &self,
            _url: &str,
            _client: ClientIdentity,
        ) -> Result<VideoDetails, UpstreamError> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            self.details
                .clone()
                .ok_or_else(|| UpstreamError::new("Status code: 410"))
        }

        async fn fetch_oembed(&self, _url: &str) -> Result<OEmbedInfo, UpstreamError> {
            self.preview
                .clone()
                .ok_or_else(|| UpstreamError::new("oEmbed unavailable"))
        }

        async fn download(&self, stream_url: &str, dest: &Path) -> Result<u64, UpstreamError> {
            self.downloads.lock().push(stream_url.to_string());
            tokio::fs::write(dest, b"video")
                .await
                .map_err(|err| UpstreamError::new(err.to_string()))?;
            Ok(5)
        }
    }

    fn details() -> VideoDetails {
        VideoDetails {
            title: "T".into(),
            length_seconds: Some(125),
            formats: vec![StreamFormat {
                format_id: "18".into(),
                url: Some("https://cdn.test/18".into()),
                ext: Some("mp4".into()),
                mime_type: Some("video/mp4".into()),
                quality_label: Some("360p".into()),
                width: Some(640),
                height: Some(360),
                fps: Some(25.0),
                bitrate: None,
                filesize: Some(5),
                has_video: true,
                has_audio: true,
            }],
            ..VideoDetails::default()
        }
    }

    struct TestContext {
        _temp: tempfile::TempDir,
        provider: Arc<StubProvider>,
        state: AppState,
    }

    impl TestContext {
        fn new(provider: StubProvider) -> Self {
            let temp = tempdir().unwrap();
            let provider = Arc::new(provider);
            let extractor = Extractor::new(
                provider.clone(),
                ExtractorOptions {
                    cache_root: temp.path().join("cache"),
                    public_root: temp.path().join("public"),
                    temp_root: temp.path().join("tmp"),
                    transcoder: Transcoder::new(
                        temp.path().join("missing-ffmpeg"),
                        temp.path().join("missing-ffprobe"),
                    ),
                    retry: RetryPolicy {
                        max_attempts: 1,
                        initial_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(1),
                        backoff_factor: 2.0,
                    },
                    rotation: ClientRotation::default(),
                    missing_source: MissingSourceBehavior::NotFound,
                },
            );
            Self {
                _temp: temp,
                provider,
                state: AppState {
                    extractor: Arc::new(extractor),
                },
            }
        }

        fn public_root(&self) -> PathBuf {
            self.state.extractor.public_root().to_path_buf()
        }
    }

    async fn json_body(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn url_request(url: &str) -> Result<Json<UrlRequest>, JsonRejection> {
        Ok(Json(UrlRequest {
            url: Some(url.into()),
            quality: None,
        }))
    }

    #[tokio::test]
    async fn video_info_returns_title_and_formatted_duration() {
        let ctx = TestContext::new(StubProvider {
            details: Some(details()),
            ..StubProvider::default()
        });
        let response = video_info(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "T");
        assert_eq!(body["duration"], "2:05");
        assert_eq!(body["lengthSeconds"], 125);
        assert_eq!(body["formats"][0]["qualityLabel"], "360p");
        assert!(body["formats"][0].get("url").is_none());
    }

    #[tokio::test]
    async fn video_info_requires_url() {
        let ctx = TestContext::new(StubProvider::default());
        let response = video_info(State(ctx.state.clone()), Ok(Json(UrlRequest::default())))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "URL is required");
    }

    #[tokio::test]
    async fn video_info_upstream_failure_is_classified() {
        let ctx = TestContext::new(StubProvider::default());
        let response = video_info(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], ErrorClass::Gone.message());
        assert_eq!(ctx.provider.info_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn download_video_returns_direct_url() {
        let ctx = TestContext::new(StubProvider {
            details: Some(details()),
            ..StubProvider::default()
        });
        let response = download_video(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["downloadUrl"], "https://cdn.test/18");
        assert_eq!(body["quality"], "360p");
        assert!(ctx.provider.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn download_cache_hit_performs_no_fetch() {
        let ctx = TestContext::new(StubProvider {
            details: Some(details()),
            ..StubProvider::default()
        });
        let key = CacheKey::for_url(URL);
        ctx.state
            .extractor
            .cache()
            .put_bytes(Artifact::Video, &key, b"cached video".to_vec())
            .await
            .unwrap();

        let response = download_cache(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["cached"], true);
        assert_eq!(body["videoId"], key.as_str());
        assert_eq!(body["fileSize"], 12);
        assert_eq!(ctx.provider.info_calls.load(Ordering::SeqCst), 0);
        assert!(ctx.provider.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn download_cache_miss_downloads_and_reports_metadata() {
        let ctx = TestContext::new(StubProvider {
            details: Some(details()),
            ..StubProvider::default()
        });
        let response = download_cache(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cached"], false);
        assert_eq!(body["title"], "T");
        assert_eq!(body["quality"], "360p");
        assert_eq!(
            *ctx.provider.downloads.lock(),
            vec!["https://cdn.test/18".to_string()]
        );
    }

    #[tokio::test]
    async fn download_cache_failure_returns_preview() {
        let ctx = TestContext::new(StubProvider {
            preview: Some(OEmbedInfo {
                title: "Preview".into(),
                author: Some("Author".into()),
                thumbnail: Some("https://i.ytimg.com/t.jpg".into()),
            }),
            ..StubProvider::default()
        });
        let response = download_cache(State(ctx.state.clone()), url_request(URL))
            .await
            .into_response();
        let (status, body) = json_body(response).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], PREVIEW_UNAVAILABLE);
        assert_eq!(body["details"], ErrorClass::Gone.message());
        assert_eq!(body["suggestion"], PREVIEW_SUGGESTION);
        assert_eq!(body["videoInfo"]["title"], "Preview");
        assert_eq!(body["videoInfo"]["author"], "Author");
    }

    #[tokio::test]
    async fn extract_audio_without_cached_source_suggests_caching() {
        let ctx = TestContext::new(StubProvider::default());
        let request = AudioRequest {
            url: Some(URL.into()),
            ..AudioRequest::default()
        };
        let response = extract_audio(State(ctx.state.clone()), Ok(Json(request)))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["suggestion"].as_str().unwrap().contains("/api/download-cache"));
    }

    #[tokio::test]
    async fn extract_audio_rejects_unknown_format() {
        let ctx = TestContext::new(StubProvider::default());
        let request = AudioRequest {
            url: Some(URL.into()),
            format: Some("flac".into()),
            ..AudioRequest::default()
        };
        let response = extract_audio(State(ctx.state.clone()), Ok(Json(request)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn derive_endpoints_reject_non_youtube_urls() {
        let ctx = TestContext::new(StubProvider::default());

        let audio = AudioRequest {
            url: Some("hello world".into()),
            ..AudioRequest::default()
        };
        let response = extract_audio(State(ctx.state.clone()), Ok(Json(audio)))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Please provide a valid YouTube URL.");

        let frames = FramesRequest {
            url: Some("hello world".into()),
            ..FramesRequest::default()
        };
        let response = extract_frames(State(ctx.state.clone()), Ok(Json(frames)))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Please provide a valid YouTube URL.");
        assert_eq!(ctx.provider.info_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extract_frames_requires_a_source() {
        let ctx = TestContext::new(StubProvider::default());
        let response = extract_frames(State(ctx.state.clone()), Ok(Json(FramesRequest::default())))
            .await
            .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "URL or videoId is required");
    }

    #[tokio::test]
    async fn serve_file_streams_png_with_cache_headers() {
        let ctx = TestContext::new(StubProvider::default());
        std::fs::create_dir_all(ctx.public_root()).unwrap();
        std::fs::write(ctx.public_root().join("abc_frame_0001.png"), b"png").unwrap();

        let response = serve_file(
            State(ctx.state.clone()),
            AxumPath("abc_frame_0001.png".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[header::CACHE_CONTROL], FILE_CACHE_CONTROL);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"png");
    }

    #[tokio::test]
    async fn serve_file_rejects_missing_and_traversal() {
        let ctx = TestContext::new(StubProvider::default());
        for name in ["missing.png", "..", "../cache.png"] {
            let err = serve_file(State(ctx.state.clone()), AxumPath(name.to_string()))
                .await
                .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND, "{name}");
        }
    }

    #[tokio::test]
    async fn cache_management_reports_and_purges() {
        let ctx = TestContext::new(StubProvider::default());
        let key = CacheKey::for_url(URL);
        ctx.state
            .extractor
            .cache()
            .put_bytes(Artifact::Video, &key, vec![0; 1536])
            .await
            .unwrap();

        let response = cache_stats(State(ctx.state.clone())).await.into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache"]["videos"]["count"], 1);
        assert_eq!(body["cache"]["videos"]["sizeFormatted"], "1.5 KB");
        assert_eq!(body["cache"]["total"]["size"], 1536);
        assert!(body["cache"]["total"].get("count").is_none());

        let response = purge_cache(
            State(ctx.state.clone()),
            Query(PurgeQuery {
                target: Some("all".into()),
            }),
        )
        .await
        .into_response();
        let (status, body) = json_body(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"]["count"], 1);
        assert_eq!(body["deleted"]["size"], 1536);
        assert!(!ctx.state.extractor.cache().has(Artifact::Video, &key).await);
    }

    #[tokio::test]
    async fn purge_requires_known_type() {
        let ctx = TestContext::new(StubProvider::default());
        for target in [None, Some("thumbnails".to_string())] {
            let response = purge_cache(State(ctx.state.clone()), Query(PurgeQuery { target }))
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn unknown_api_paths_return_json_404() {
        let request = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = json_body(not_found_fallback(request).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "endpoint not found");
    }

    #[test]
    fn internal_failures_are_not_leaked() {
        let err = ApiError::from(Error::Transcode("ffmpeg exited with 1: secret path".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, ErrorClass::Generic.message());
        assert!(err.details.is_none());

        let err = ApiError::from(Error::Io {
            context: "reading /srv/cache/videos/x.mp4".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, ErrorClass::Generic.message());
        assert!(!err.message.contains("/srv/cache"));

        let err = ApiError::from(Error::NoSuitableFormat);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn backend_args_read_env_file_and_flags() {
        let dir = tempdir().unwrap();
        let env_file = dir.path().join("backend.env");
        std::fs::write(
            &env_file,
            "YTBSHOW_CACHE_ROOT=\"/data/cache\"\nYTBSHOW_PORT=\"4242\"\nYTBSHOW_HOST=\"0.0.0.0\"\n",
        )
        .unwrap();

        let args = BackendArgs::from_iter(vec![
            format!("--env-file={}", env_file.display()),
            "--port".to_string(),
            "5000".to_string(),
        ])
        .unwrap();

        assert_eq!(args.settings.cache_root, PathBuf::from("/data/cache"));
        assert_eq!(args.settings.port, 5000);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_reject_bad_values() {
        assert!(BackendArgs::from_iter(vec!["--port".to_string(), "99999".to_string()]).is_err());
        assert!(BackendArgs::from_iter(vec!["--host=localhost".to_string()]).is_err());
        assert!(BackendArgs::from_iter(vec!["--bogus".to_string()]).is_err());
        assert!(BackendArgs::from_iter(vec!["--cache-root".to_string()]).is_err());
    }
}
