//! HTTP side of the relay: `GET`/`HEAD /{session}/{path}` and the status page.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fibridge_proto::ResponseStatus;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::link::ResponseHead;
use crate::range::{content_range, unsatisfied_range, RangeRequest};
use crate::state::RelayState;
use crate::stats::TransferStats;

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/:session/*path", get(hosted_file_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Relay status: attached sessions, their paths, transfer totals.
async fn status_handler(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "fibridge-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.summaries(),
        "stats": state.stats.snapshot(),
    }))
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    (
        status,
        [(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"))],
        message,
    )
        .into_response()
}

fn error_response(err: &RelayError) -> Response {
    (err.status_code(), err.to_string()).into_response()
}

/// Serve a hosted file by forwarding the request to its host.
async fn hosted_file_handler(
    State(state): State<Arc<RelayState>>,
    Path((session_id, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(link) = state.sessions.get(&session_id) else {
        return plain(StatusCode::NOT_FOUND, "unknown session");
    };
    let virtual_path = format!("/{}", path.trim_start_matches('/'));

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let Some(range) = RangeRequest::parse(range_header).byte_range() else {
        return plain(StatusCode::NOT_IMPLEMENTED, "multiple ranges are not supported");
    };

    state.stats.request_started();

    let mut request = match link.open_request(&virtual_path, range).await {
        Ok(request) => request,
        Err(e) => {
            state.stats.request_failed(TransferStats::default());
            return error_response(&e);
        }
    };

    let head = match tokio::time::timeout(state.config.response_timeout, request.header()).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            warn!("{} {}: {}", session_id, virtual_path, e);
            state.stats.request_failed(TransferStats::default());
            return error_response(&e);
        }
        Err(_) => {
            warn!(
                "{} {}: no header within {:?}",
                session_id, virtual_path, state.config.response_timeout
            );
            state.stats.request_failed(TransferStats::default());
            return error_response(&RelayError::UpstreamTimeout);
        }
    };
    debug!(
        "{} {}: host answered {:?}",
        session_id, virtual_path, head.status
    );

    match head.status {
        ResponseStatus::NotFound => {
            state.stats.request_completed(TransferStats::default());
            plain(StatusCode::NOT_FOUND, "not found")
        }
        ResponseStatus::RangeNotSatisfiable => {
            state.stats.request_completed(TransferStats::default());
            let mut headers = HeaderMap::new();
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            if let Ok(value) = HeaderValue::from_str(&unsatisfied_range(head.total_size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
        }
        ResponseStatus::Error => {
            state.stats.request_failed(TransferStats::default());
            plain(StatusCode::BAD_GATEWAY, "host could not read the file")
        }
        ResponseStatus::Ok | ResponseStatus::PartialContent => {
            let media_type = link.media_type(&virtual_path);
            let headers = body_headers(&head, media_type.as_deref());
            let status = if head.status == ResponseStatus::PartialContent {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };

            if method == Method::HEAD || head.content_length == 0 {
                // Dropping the request cancels whatever the host still sends.
                drop(request);
                state.stats.request_completed(TransferStats::default());
                return (status, headers, Body::empty()).into_response();
            }

            let body = request.into_body(head.content_length, state.stats.clone());
            (status, headers, Body::from_stream(body)).into_response()
        }
    }
}

fn body_headers(head: &ResponseHead, media_type: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(head.content_length));

    let content_type = media_type
        .and_then(|m| HeaderValue::from_str(m).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_MEDIA_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);

    if head.status == ResponseStatus::PartialContent {
        let value = content_range(head.range_start, head.content_length, head.total_size);
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_headers() {
        let head = ResponseHead {
            status: ResponseStatus::PartialContent,
            content_length: 1000,
            range_start: 0,
            total_size: 10_000_000,
        };
        let headers = body_headers(&head, Some("application/x-bam"));
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-999/10000000");
        assert_eq!(headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(headers[header::CONTENT_TYPE], "application/x-bam");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    }

    #[test]
    fn test_full_headers_fall_back_to_octet_stream() {
        let head = ResponseHead {
            status: ResponseStatus::Ok,
            content_length: 5,
            range_start: 0,
            total_size: 5,
        };
        let headers = body_headers(&head, Some("bad\nvalue"));
        assert!(headers.get(header::CONTENT_RANGE).is_none());
        assert_eq!(headers[header::CONTENT_TYPE], DEFAULT_MEDIA_TYPE);
    }
}
