#![forbid(unsafe_code)]

//! Axum backend for the converter pages.
//!
//! Video links are handed to yt-dlp (and ffmpeg when the download is not
//! already mp4), uploaded fonts to fontTools. Results land in two flat
//! directories that are served back by name and swept after a day.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use converter_tools::{
    artifacts::{ArtifactFamily, ArtifactNamer, ArtifactStore},
    clock::{Clock, SystemClock},
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    error::ConvertError,
    font::{FontConversionRequest, FontConverter},
    security::ensure_not_root,
    sweeper::{RetentionPolicy, RetentionSweeper},
    tools::{FontTools, Ffmpeg, YtDlp, probe_all},
    video::{ConversionRequest, VideoConverter},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "converter_tools=info,backend=info,tower_http=info";

/// Command line flags. Anything left out falls back to the environment, then
/// to the `.env` file, then to built-in defaults.
#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Media and font conversion backend")]
struct BackendArgs {
    /// Alternative `.env` file to read settings from.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    video_root: Option<PathBuf>,
    #[arg(long)]
    font_root: Option<PathBuf>,
    #[arg(long)]
    upload_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Public base URL used when building font download links.
    #[arg(long)]
    public_url: Option<String>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            video_root: self.video_root,
            font_root: self.font_root,
            upload_root: self.upload_root,
            port: self.port,
            host: self.host,
            public_url: self.public_url,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/CONVERTER_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    store: Arc<ArtifactStore>,
    videos: Arc<VideoConverter>,
    fonts: Arc<FontConverter>,
}

/// Router level knobs that do not belong to the handlers themselves.
#[derive(Debug, Clone)]
struct HttpOptions {
    allowed_origins: Vec<String>,
    max_upload_bytes: usize,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<ConvertError> for ApiError {
    fn from(err: ConvertError) -> Self {
        let status = match &err {
            ConvertError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ConvertError::ConversionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ConvertError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ConvertVideoBody {
    url: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConvertVideoResponse {
    filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertFontResponse {
    download_url: String,
    filename: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    let host = parse_host_arg(&settings.host)?;

    let store = Arc::new(ArtifactStore::new(
        settings.video_root.clone(),
        settings.font_root.clone(),
        settings.upload_root.clone(),
    ));
    store.prepare().await.context("preparing output directories")?;
    probe_all(&settings.tools).await;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = build_state(&settings, store.clone(), clock.clone());

    let sweeper = Arc::new(RetentionSweeper::new(
        store.artifact_roots(),
        RetentionPolicy {
            interval: settings.sweep_interval,
            max_age: settings.max_age,
        },
        clock,
    ));
    let sweeper_task = sweeper.spawn();

    let app = build_router(
        state,
        &HttpOptions {
            allowed_origins: settings.allowed_origins.clone(),
            max_upload_bytes: settings.max_upload_bytes,
        },
    );

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, video_root = %settings.video_root.display(), font_root = %settings.font_root.display(), "converter backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper_task.abort();
    Ok(())
}

fn build_state(settings: &RuntimeSettings, store: Arc<ArtifactStore>, clock: Arc<dyn Clock>) -> AppState {
    let timeout = settings.tool_timeout;
    let videos = VideoConverter::new(
        store.clone(),
        Arc::new(ArtifactNamer::new(clock.clone())),
        Arc::new(YtDlp::new(settings.tools.ytdlp.clone(), timeout)),
        Arc::new(Ffmpeg::new(settings.tools.ffmpeg.clone(), timeout)),
    );
    let fonts = FontConverter::new(
        store.clone(),
        Arc::new(FontTools::new(settings.tools.fonttools.clone(), timeout)),
        clock,
        settings.public_url.clone(),
    );
    AppState {
        store,
        videos: Arc::new(videos),
        fonts: Arc::new(fonts),
    }
}

fn build_router(state: AppState, options: &HttpOptions) -> Router {
    Router::new()
        .route("/convert-video", post(convert_video))
        .route("/download-video/{filename}", get(download_video))
        .route("/convert-font", post(convert_font))
        .route("/converted-videos/{name}", get(serve_converted_video))
        .route("/converted-fonts/{name}", get(serve_converted_font))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(cors_layer(&options.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still stops the process.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn convert_video(
    State(state): State<AppState>,
    payload: Result<Json<ConvertVideoBody>, JsonRejection>,
) -> ApiResult<Json<ConvertVideoResponse>> {
    let Json(body) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "rejected conversion body");
        ApiError::bad_request("request body must be JSON with url and format")
    })?;
    let request = ConversionRequest::parse(body.url.as_deref(), body.format.as_deref())?;
    let artifact = state.videos.convert(&request).await?;
    Ok(Json(ConvertVideoResponse {
        filename: artifact.filename,
    }))
}

async fn download_video(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    let path = state.store.resolve(ArtifactFamily::Video, &filename).await?;
    stream_file(path, Some(&filename)).await
}

async fn convert_font(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ConvertFontResponse>> {
    let mut multipart =
        multipart.map_err(|_| ApiError::bad_request("request must be multipart/form-data"))?;

    let mut font: Option<(Option<String>, Vec<u8>)> = None;
    let mut format: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("font") => {
                let original_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                font = Some((original_name, bytes.to_vec()));
            }
            Some("format") => {
                format = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let request = FontConversionRequest::parse(font, format.as_deref())?;
    let converted = state.fonts.convert(request).await?;
    Ok(Json(ConvertFontResponse {
        download_url: converted.download_url,
        filename: converted.artifact.filename,
    }))
}

fn multipart_error(err: MultipartError) -> ApiError {
    warn!(error = %err.body_text(), "rejected multipart upload");
    ApiError {
        status: err.status(),
        kind: "invalid_request",
        message: "could not read the uploaded form".to_string(),
    }
}

async fn serve_converted_video(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Response> {
    serve_artifact(&state, ArtifactFamily::Video, &name).await
}

async fn serve_converted_font(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Response> {
    serve_artifact(&state, ArtifactFamily::Font, &name).await
}

async fn serve_artifact(state: &AppState, family: ArtifactFamily, name: &str) -> ApiResult<Response> {
    let path = state.store.resolve(family, name).await?;
    stream_file(path, None).await
}

/// Streams a whole file. `attachment` asks the browser to save it under the
/// given name instead of displaying it.
async fn stream_file(path: PathBuf, attachment: Option<&str>) -> ApiResult<Response> {
    let not_found = || ApiError::from(ConvertError::not_found("file not found"));
    let file = File::open(&path).await.map_err(|_| not_found())?;
    let size = file.metadata().await.map_err(|_| not_found())?.len();

    let mut headers = HeaderMap::new();
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(name) = attachment
        && let Ok(value) =
            HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name.replace('"', "_")))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}
