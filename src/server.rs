use std::{collections::HashSet, io::ErrorKind, net::SocketAddr, path::Path as FsPath, sync::Arc};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{ConnectInfo, Multipart, Path, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    credentials::CredentialStore,
    error::{ApiError, FetchError},
    fetcher::{FetchItem, FetchMode, FetchRequest, Fetcher, GalleryDl, RemoteItem},
    retention::{RetainedFile, RetentionManager},
    throttle::RateLimiter,
};

const INDEX_HTML: &str = include_str!("../templates/kitsunegram.html");
const EXPIRES_HEADER: &str = "x-expires-at";

#[derive(Clone)]
pub struct AppState {
    fetcher: Arc<Fetcher>,
    credentials: Arc<CredentialStore>,
    retention: Arc<RetentionManager>,
    limiter: Arc<RateLimiter>,
    trust_proxy_headers: bool,
}

impl AppState {
    pub async fn from_config(config: &Config) -> Result<Self, FetchError> {
        let retention = Arc::new(
            RetentionManager::start(
                &config.download_root,
                config.file_prefix.clone(),
                config.retention,
            )
            .await?,
        );
        let credentials = Arc::new(CredentialStore::new(config.credentials.clone()));
        let fetcher = Fetcher::new(
            GalleryDl::from_config(config),
            Arc::clone(&credentials),
            Arc::clone(&retention),
        );

        Ok(Self {
            fetcher: Arc::new(fetcher),
            credentials,
            retention,
            limiter: Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
            trust_proxy_headers: config.trust_proxy_headers,
        })
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }
}

pub fn router(state: AppState, config: &Config) -> Result<Router, ApiError> {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/kitsunegram", get(index))
        .route("/kitsunegram/", get(index))
        .route("/health", get(health))
        .route("/kitsunegram/get_urls", post(get_urls))
        .route("/kitsunegram/download", post(download))
        .route("/kitsunegram/update-cookies", post(update_cookies))
        .route("/kitsunegram/upload-cookies", post(upload_cookies))
        .route("/kitsunegram/preview/{*path}", get(preview_file))
        .route("/kitsunegram/download-file/{*path}", get(download_file))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = build_cors_layer(&config.allowed_origins)? {
        app = app.layer(cors);
    }

    Ok(app)
}

#[derive(Debug, Deserialize)]
struct SubmitForm {
    url: String,
}

#[derive(Debug, Deserialize)]
struct CookiesForm {
    cookies: String,
}

#[derive(Debug, Serialize)]
struct RetainedEntry {
    filename: String,
    local_path: String,
    preview_url: String,
    download_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ManifestItem {
    Remote(RemoteItem),
    Retained(RetainedEntry),
}

#[derive(Debug, Serialize)]
struct Manifest {
    success: bool,
    data: Vec<ManifestItem>,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    success: bool,
    message: &'static str,
}

#[derive(Debug, Clone, Copy)]
enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Attachment => "attachment",
        }
    }
}

async fn index() -> Html<&'static str> {
    debug!("Landing page requested");
    Html(INDEX_HTML)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_urls(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<SubmitForm>,
) -> Result<Json<Manifest>, ApiError> {
    submit(&state, &headers, addr, form.url, FetchMode::ListUrls).await
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<SubmitForm>,
) -> Result<Json<Manifest>, ApiError> {
    submit(&state, &headers, addr, form.url, FetchMode::Download).await
}

async fn submit(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
    url: String,
    mode: FetchMode,
) -> Result<Json<Manifest>, ApiError> {
    let client_ip = request_client_ip(state.trust_proxy_headers, headers, addr);
    if let Err(retry_after_seconds) = state.limiter.register(&client_ip).await {
        warn!("Rate limit hit for {client_ip}");
        return Err(ApiError::rate_limited(
            state.limiter.max_requests(),
            retry_after_seconds,
        ));
    }

    info!("{mode:?} request from {client_ip} for {:?}", url.trim());
    let result = state
        .fetcher
        .fetch(&FetchRequest { url, mode })
        .await
        .map_err(|error| {
            warn!("Fetch failed for {client_ip}: {error}");
            ApiError::failure(error.to_string())
        })?;
    if !result.diagnostics.is_empty() {
        debug!("gallery-dl reported for {client_ip}: {}", result.diagnostics);
    }

    let data = result
        .items
        .into_iter()
        .map(|item| match item {
            FetchItem::Remote(remote) => ManifestItem::Remote(remote),
            FetchItem::Retained(file) => ManifestItem::Retained(retained_entry(file)),
        })
        .collect();

    Ok(Json(Manifest {
        success: true,
        data,
    }))
}

fn retained_entry(file: RetainedFile) -> RetainedEntry {
    let encoded = file
        .relative_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    RetainedEntry {
        preview_url: format!("/kitsunegram/preview/{encoded}"),
        download_url: format!("/kitsunegram/download-file/{encoded}"),
        filename: file.filename,
        local_path: file.relative_path,
        expires_at: file.expires_at,
    }
}

async fn update_cookies(
    State(state): State<AppState>,
    Form(form): Form<CookiesForm>,
) -> Result<Json<MessageBody>, ApiError> {
    state.credentials.set(form.cookies).await?;
    Ok(Json(MessageBody {
        success: true,
        message: "Cookies data updated successfully",
    }))
}

async fn upload_cookies(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<MessageBody>, ApiError> {
    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::failure(format!("Invalid upload: {error}")))?
    {
        if matches!(field.name(), Some("file" | "cookies")) {
            let text = field
                .text()
                .await
                .map_err(|error| ApiError::failure(format!("Could not read upload: {error}")))?;
            content = Some(text);
            break;
        }
    }

    let content = content.ok_or_else(|| ApiError::failure("No cookies file was uploaded."))?;
    state.credentials.set(content).await?;
    Ok(Json(MessageBody {
        success: true,
        message: "Cookies file uploaded successfully",
    }))
}

async fn preview_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    serve_retained(&state, &path, Disposition::Inline).await
}

async fn download_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    serve_retained(&state, &path, Disposition::Attachment).await
}

/// Streams a retained file. The reaper may delete it at any point, in which
/// case the caller gets a 404.
async fn serve_retained(
    state: &AppState,
    relative_path: &str,
    disposition: Disposition,
) -> Result<Response, ApiError> {
    let resolved = state.retention.resolve(relative_path).await?;
    let path = resolved.path;

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ApiError::from(FetchError::FileNotFound(relative_path.to_string()))
        } else {
            ApiError::internal(format!("Could not open retained file: {error}"))
        }
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download.bin")
        .to_string();

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(disposition, &filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    if let Some(expires_at) = resolved.expires_at
        && let Ok(value) = HeaderValue::from_str(&expires_at.to_rfc3339())
    {
        headers.insert(HeaderName::from_static(EXPIRES_HEADER), value);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// Checked in order; only the first entry of a list is used.
const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "cf-connecting-ip", "x-real-ip"];

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    CLIENT_IP_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)?
            .to_str()
            .ok()?
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    })
}

fn request_client_ip(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    trust_proxy_headers
        .then(|| extract_client_ip(headers))
        .flatten()
        .unwrap_or_else(|| addr.ip().to_string())
}

fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed_origins.contains(&value))
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION, HeaderName::from_static(EXPIRES_HEADER)]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(disposition: Disposition, filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "{}; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        disposition.as_str(),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.trim_matches('_').is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
