//! HTTP request handlers
//!
//! Implements handlers for the playback, HLS and debug endpoints.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::auth::{parse_basic_credentials, AuthAction, AuthRequest};
use crate::config::ResolvedPath;
use crate::error::PlaybackError;
use crate::playlist::{base_url, rewrite_manifest};
use crate::request::{Format, PlaybackRequest};
use crate::segment::Segment;
use crate::state::AppState;
use crate::transcode::{
    self, compute_token, generate, is_complete, HlsJobSpec, JobInfo, PLAYLIST_NAME,
};

use super::body::{stream_mux, MuxJob};

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    NotFound(String),
    Unauthorized { message: String, ask_credentials: bool },
    Conflict(String),
    InternalError(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::Unauthorized {
                message,
                ask_credentials,
            } => {
                let mut response = (StatusCode::UNAUTHORIZED, message).into_response();
                if ask_credentials {
                    response.headers_mut().insert(
                        header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=\"playback\""),
                    );
                }
                return response;
            }
            HttpError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            HttpError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, body).into_response()
    }
}

impl From<PlaybackError> for HttpError {
    fn from(err: PlaybackError) -> Self {
        match err {
            PlaybackError::InvalidRequest(_)
            | PlaybackError::MalformedContainer(_)
            | PlaybackError::UnsupportedFormat(_) => HttpError::BadRequest(err.to_string()),
            PlaybackError::NotFound(msg) => HttpError::NotFound(msg),
            PlaybackError::Unauthorized {
                message,
                ask_credentials,
            } => HttpError::Unauthorized {
                message,
                ask_credentials,
            },
            _ => HttpError::InternalError(err.to_string()),
        }
    }
}

/// Identity of the caller used to scope HLS jobs: the first
/// `X-Forwarded-For` hop, else the peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientKey(pub IpAddr);

impl ClientKey {
    fn from_parts(parts: &Parts) -> Self {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip())
            })
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        ClientKey(ip)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientKey::from_parts(parts))
    }
}

/// Authenticate the request, delaying rejected credentials.
async fn authorize(
    state: &AppState,
    client: ClientKey,
    headers: &HeaderMap,
    uri: &Uri,
    path: &str,
) -> Result<(), HttpError> {
    let req = AuthRequest {
        action: AuthAction::Playback,
        path: path.to_string(),
        query: uri.query().unwrap_or("").to_string(),
        credentials: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic_credentials),
        ip: client.0,
    };

    match state.auth.authenticate(&req) {
        Ok(()) => Ok(()),
        Err(PlaybackError::Unauthorized {
            message,
            ask_credentials,
        }) => {
            if !ask_credentials {
                tracing::warn!("Authentication failed: {}", message);
                tokio::time::sleep(state.auth_pause).await;
            }
            Err(HttpError::Unauthorized {
                message: "unauthorized".into(),
                ask_credentials,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Look up the segments covering a request on the blocking pool.
async fn lookup(
    state: &Arc<AppState>,
    req: &PlaybackRequest,
) -> Result<(ResolvedPath, Vec<Segment>), HttpError> {
    let state = Arc::clone(state);
    let (path, start, end) = (req.path.clone(), req.start, req.end());
    tokio::task::spawn_blocking(move || state.find_segments(&path, start, end))
        .await
        .map_err(|e| HttpError::InternalError(format!("segment lookup failed: {}", e)))?
        .map_err(HttpError::from)
}

/// Rejects names that could leave the job's output directory.
fn validate_file_name(name: &str) -> Result<(), HttpError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(HttpError::BadRequest(format!("invalid file: {}", name)));
    }
    Ok(())
}

fn content_type_for(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") | Some("m4s") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// In-flight transcode jobs
/// GET /debug/jobs
pub async fn active_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobInfo>> {
    Json(state.coordinator.jobs())
}

/// Playback endpoint
/// GET /get?path=&start=&duration=[&format=][&file=]
pub async fn playback(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, HttpError> {
    let req = PlaybackRequest::from_query(&query)?;
    authorize(&state, client, &headers, &uri, &req.path).await?;

    tracing::info!(
        "Playback of {} from {} for {:?} as {} for {}",
        req.path,
        req.start,
        req.duration,
        req.format,
        client.0
    );

    if req.format == Format::Hls {
        return hls(state, client, &uri, req).await;
    }

    let (conf, segments) = lookup(&state, &req).await?;
    let job = MuxJob {
        format: req.format,
        record_format: conf.record_format,
        segments,
        start: req.start,
        duration: req.duration,
        tolerance: state.config.concat_tolerance(),
    };
    Ok(stream_mux(req.path, job).await?)
}

async fn hls(
    state: Arc<AppState>,
    client: ClientKey,
    uri: &Uri,
    req: PlaybackRequest,
) -> Result<Response, HttpError> {
    let client_key = client.0.to_string();
    let token = compute_token(&client_key, &req.path, &req.start, req.duration);
    let dir = state.hls_dir(&token);

    if let Some(file) = &req.file {
        validate_file_name(file)?;
        let data = tokio::fs::read(dir.join(file))
            .await
            .map_err(|_| HttpError::NotFound(format!("file not found: {}", file)))?;
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(file)),
        );
        return Ok((response_headers, data).into_response());
    }

    if is_complete(&dir) {
        tracing::debug!("Serving cached HLS output {}", token);
    } else {
        let (conf, segments) = lookup(&state, &req).await?;
        let spec = HlsJobSpec {
            dir: dir.clone(),
            segments,
            record_format: conf.record_format,
            start: req.start,
            duration: req.duration,
            segment_secs: state.config.hls.segment_secs,
            tolerance: state.config.concat_tolerance(),
            deadline: state.config.hls.job_timeout(),
        };
        let encoder = state.encoder.clone();
        let job = state
            .coordinator
            .submit(&client_key, &token, move |job| generate(spec, encoder, job));
        // Dropping this future detaches from the job without cancelling it.
        job.wait().await?;
    }

    transcode::touch(&dir).await;
    let manifest = tokio::fs::read_to_string(dir.join(PLAYLIST_NAME))
        .await
        .map_err(|_| HttpError::NotFound("playlist not found".into()))?;
    let body = rewrite_manifest(&manifest, &base_url(uri.path(), uri.query()))?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok((response_headers, body).into_response())
}

/// Delete a generated HLS package
/// DELETE /hls?path=&start=&duration=
pub async fn delete_hls(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Result<StatusCode, HttpError> {
    let req = PlaybackRequest::from_query(&query)?;
    authorize(&state, client, &headers, &uri, &req.path).await?;

    let client_key = client.0.to_string();
    let token = compute_token(&client_key, &req.path, &req.start, req.duration);
    let dir = state.hls_dir(&token);

    let removed = {
        let (client_key, token) = (client_key.clone(), token.clone());
        tokio::task::spawn_blocking(move || {
            state
                .coordinator
                .with_idle(&client_key, &token, || std::fs::remove_dir_all(&dir))
        })
        .await
        .map_err(|e| HttpError::InternalError(format!("delete task failed: {}", e)))?
    };

    match removed.ok_or_else(|| HttpError::Conflict("job in progress".into()))? {
        Ok(()) => {
            tracing::info!("Deleted HLS output {} for {}", token, client_key);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HttpError::NotFound("no HLS output for this request".into()))
        }
        Err(e) => Err(PlaybackError::from(e).into()),
    }
}
