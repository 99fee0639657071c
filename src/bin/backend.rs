#![forbid(unsafe_code)]

//! Axum backend for SaveTube.
//!
//! Two live API routes: one resolves a pasted video URL into its title,
//! thumbnail and resolution picker entries, the other pipes the chosen
//! encoded variant straight from the extraction tool into the client's
//! download manager. Every request re-resolves the video on its own; there
//! is no cache and no state shared across requests beyond the immutable
//! extractor handle.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use savetube_tools::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use savetube_tools::extractor::{
    Resolution, VideoExtractor, is_watch_url, sanitize_title, unique_resolutions, watch_url_for_id,
};
use savetube_tools::security::ensure_not_root;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, net::TcpListener, signal};
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct BackendArgs {
    host: Option<String>,
    port: Option<u16>,
    www_root: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                parsed.www_root = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(value);
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    parsed.www_root = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            www_root: self.www_root,
            env_path: None,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/SAVETUBE_HOST")
}

/// Shared state injected into every Axum handler. Immutable once the server
/// is up, so concurrent requests never take a lock.
#[derive(Clone)]
struct AppState {
    extractor: Arc<VideoExtractor>,
    www_root: Arc<Option<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Envelope around the metadata payload, matching what the frontend reads.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetailsResponse {
    video_info: VideoInfoPayload,
}

/// Per-request snapshot of one video: display fields plus the deduplicated
/// resolution picker. `last_res` is the entry the frontend preselects; it is
/// the FIRST deduplicated entry, not the highest quality, and the frontend
/// overwrites it with whatever the user picks afterwards.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInfoPayload {
    title: String,
    thumbnail: String,
    video_res: Vec<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_res: Option<Resolution>,
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: Option<String>,
    quality: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    ensure_not_root("backend")?;

    let RuntimeSettings {
        host,
        port,
        www_root,
    } = resolve_runtime_settings(args.into_overrides())?;
    let host = parse_host_arg(&host)?;

    let state = AppState {
        extractor: Arc::new(VideoExtractor::new()),
        www_root: Arc::new(www_root),
    };

    let server = Server::bind(SocketAddr::new(host, port), state).await?;
    info!("API server listening on http://{}", server.local_addr()?);

    server.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {err}");
    }
}

/// One server instance: bound listener plus its routes. Constructed
/// explicitly in `main` (and in tests, where several instances coexist in a
/// single process) rather than living in process-wide state.
struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    async fn bind(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding to {}", addr))?;
        Ok(Self {
            listener,
            router: build_router(state),
        })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("reading bound address")
    }

    /// Runs until the provided shutdown future resolves; in-flight requests
    /// are drained before returning.
    async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("running API server")
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/api/get-video-details/{video_id}", get(get_video_details))
        .route("/download", get(download))
        .fallback(static_fallback)
        .with_state(state)
}

async fn liveness() -> &'static str {
    "Server is running"
}

/// Resolves a video id into the payload behind the resolution picker.
///
/// The video is re-fetched from the extraction tool on every call; failures
/// of any kind collapse into one generic 500 while the cause stays in the
/// server log.
async fn get_video_details(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<VideoDetailsResponse>> {
    let url = watch_url_for_id(&video_id);
    let info = state
        .extractor
        .fetch_video_info(&url)
        .await
        .map_err(|err| {
            error!("fetching video details for {video_id}: {err:#}");
            ApiError::internal("Failed to fetch video details")
        })?;

    let video_res = unique_resolutions(&info.formats);
    let last_res = video_res.first().copied();

    Ok(Json(VideoDetailsResponse {
        video_info: VideoInfoPayload {
            title: info.display_title().to_string(),
            thumbnail: info.thumbnail_url().unwrap_or_default().to_string(),
            video_res,
            last_res,
        },
    }))
}

/// Streams one encoded variant to the client as a file download.
///
/// Validation happens before any extractor subprocess is spawned. Once the
/// headers are out the body is a live pipe from the subprocess; a failure
/// mid-transfer aborts the response, and a client disconnect drops the pipe
/// which kills the subprocess.
async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    let url = params
        .url
        .filter(|value| is_watch_url(value))
        .ok_or_else(|| ApiError::bad_request("Invalid YouTube URL"))?;
    let quality = params
        .quality
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing quality parameter"))?;

    let info = state.extractor.fetch_video_info(&url).await.map_err(|err| {
        error!("resolving download for {url}: {err:#}");
        ApiError::internal("Failed to download video")
    })?;

    if info.find_format(&quality).is_none() {
        return Err(ApiError::bad_request(format!(
            "No such format found for itag: {quality}"
        )));
    }

    let filename = format!("{}.mp4", sanitize_title(info.display_title()));
    let stream = state
        .extractor
        .stream_format(&url, &quality)
        .await
        .map_err(|err| {
            error!("starting download stream for {url}: {err:#}");
            ApiError::internal("Failed to download video")
        })?;

    let body = Body::from_stream(ReaderStream::new(stream));
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"")
            .parse()
            .unwrap(),
    );
    Ok(response)
}

/// Everything that is not an API route is either a frontend asset or an SPA
/// route. Unknown `/api` paths stay JSON 404s so the frontend never receives
/// HTML where it expects an API payload.
async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_www_file(root.join("index.html")).await,
        Ok(_) => stream_www_file(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_www_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    // Extensionless paths are SPA routes; anything with an extension is a
    // genuinely missing asset.
    Path::new(trimmed).extension().is_none()
}

async fn stream_www_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
