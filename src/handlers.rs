/// Axum handlers: the request router and the control endpoints
use crate::AppState;
use crate::client::HttpClient;
use crate::contract::PluginRequest;
use crate::errors::StagingError;
use crate::supervisor::SupervisorState;
use crate::worker::{LoadedEntry, RouteTarget};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

const UNAVAILABLE_BODY: &str = "no worker available\n";

/// Sends every non-control request to whatever the supervisor last published.
///
/// The target is read once per request, so a request that started on one
/// generation finishes there even if a swap happens meanwhile.
#[instrument(skip(state, req), fields(method = %req.method(), uri = %req.uri()))]
pub async fn route_request<T: HttpClient>(
    State(state): State<AppState<T>>,
    req: axum::extract::Request,
) -> Result<Response, StatusCode> {
    let guard = state.supervisor.in_flight.acquire();

    match state.supervisor.target.current() {
        RouteTarget::Process {
            base, generation, ..
        } => {
            debug!(generation, "Forwarding to worker process");
            let response = forward(&state.http_client, &base, req).await?;
            // Keep the request counted until the body has been streamed out.
            let (parts, body) = response.into_parts();
            let body = body.into_data_stream().map(move |chunk| {
                let _held = &guard;
                chunk
            });
            Ok(Response::from_parts(parts, Body::from_stream(body)))
        }
        RouteTarget::Library { entry, generation } => {
            debug!(generation, "Calling library entry point");
            call_library(entry, req).await
        }
        RouteTarget::Unavailable => {
            debug!("No live worker");
            Ok((StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY).into_response())
        }
    }
}

async fn forward<T: HttpClient>(
    client: &T,
    base: &Url,
    mut req: axum::extract::Request,
) -> Result<Response, StatusCode> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|v| v.as_str())
        .unwrap_or(req.uri().path());
    let upstream_uri = base
        .join(path_and_query.strip_prefix('/').unwrap_or(path_and_query))
        .map_err(|_| StatusCode::BAD_REQUEST)?
        .to_string();
    let upstream_uri_parsed = match Uri::try_from(&upstream_uri) {
        Ok(uri) => uri,
        Err(_) => {
            error!("Invalid URI: {}", upstream_uri);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if let Some(host) = upstream_uri_parsed.host() {
        let host_value = match upstream_uri_parsed.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_value = HeaderValue::from_str(&host_value).map_err(|_| StatusCode::BAD_REQUEST)?;
        req.headers_mut().insert("host", host_value);
    }
    *req.uri_mut() = upstream_uri_parsed;

    match client.request(req).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(
                "Error forwarding request to worker url {}: {}",
                upstream_uri, e
            );
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn call_library(
    entry: Arc<LoadedEntry>,
    req: axum::extract::Request,
) -> Result<Response, StatusCode> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let method = parts.method.to_string();
    let uri = parts
        .uri
        .path_and_query()
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    // The handler is foreign code of unknown duration; keep it off the async workers.
    let response = tokio::task::spawn_blocking(move || {
        entry.call(&PluginRequest {
            method: &method,
            uri: &uri,
            body: &body,
        })
    })
    .await
    .map_err(|e| {
        error!("Library handler task failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!(status = response.status, "Library handler returned an invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    Ok((status, response.body).into_response())
}

/// `GET|POST <reload-path>`: adopt the staged artifact.
#[instrument(skip(state))]
pub async fn reload<T: HttpClient>(State(state): State<AppState<T>>) -> Response {
    match state.supervisor.control.reload().await {
        Ok(()) => {
            info!("Reload succeeded");
            (StatusCode::OK, "ok").into_response()
        }
        Err(e) => {
            warn!(error = %e, "Reload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("reload failed: {e}\n")).into_response()
        }
    }
}

/// `POST <upload-path>`: stage the request body, then reload.
#[instrument(skip(state, body))]
pub async fn upload<T: HttpClient>(State(state): State<AppState<T>>, body: Body) -> Response {
    let staged = state.staging.stage(body.into_data_stream()).await;
    stage_then_reload(&state, staged).await
}

/// `POST <fetch-path>/{name}`: stage `name` from the artifact source, then reload.
#[instrument(skip(state))]
pub async fn fetch<T: HttpClient>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
) -> Response {
    let Some(source) = state.source.as_deref() else {
        return (StatusCode::NOT_FOUND, "no artifact source configured\n").into_response();
    };
    let staged = state.staging.stage_from(source, &name).await;
    stage_then_reload(&state, staged).await
}

async fn stage_then_reload<T: HttpClient>(
    state: &AppState<T>,
    staged: Result<u64, StagingError>,
) -> Response {
    let written = match staged {
        Ok(written) => written,
        Err(e) => {
            error!(error = %e, "Failed to stage artifact");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("staging failed: {e}\n"))
                .into_response();
        }
    };
    let received = format!("{written} bytes received.\n");

    match state.supervisor.control.reload().await {
        Ok(()) => (StatusCode::OK, received).into_response(),
        Err(e) => {
            warn!(error = %e, "Reload after staging failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{received}reload failed: {e}\n"),
            )
                .into_response()
        }
    }
}

/// `GET|POST <shutdown-path>`: start draining.
#[instrument(skip(state))]
pub async fn shutdown<T: HttpClient>(State(state): State<AppState<T>>) -> Response {
    match state.supervisor.control.shutdown().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => debug!(error = %e, "Shutdown requested while already stopping"),
    }
    (StatusCode::OK, "shutting down\n").into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: SupervisorState,
    pub generation: Option<u64>,
    pub target: &'static str,
    pub in_flight: usize,
    pub pending_artifact: bool,
}

/// `GET <status-path>`
#[instrument(skip(state))]
pub async fn status<T: HttpClient>(State(state): State<AppState<T>>) -> Json<StatusResponse> {
    let target = state.supervisor.target.current();
    Json(StatusResponse {
        state: state.supervisor.state(),
        generation: target.generation(),
        target: target.kind(),
        in_flight: state.supervisor.in_flight.count(),
        pending_artifact: state.staging.has_pending().await,
    })
}
