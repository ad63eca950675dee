use crate::config::SharedConfig;
use crate::store::{CapturedHttpRequest, DynStore, Scheme};
use crate::test_id::{self, TestId};
use crate::web::server::ConnMeta;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub store: DynStore,
    /// The operator-facing router served for the root domain.
    pub dashboard: Router,
}

pub fn router(state: AppState) -> Router {
    let timeout = state.config.http_timeout;
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

/// Route by Host header: the root domain goes to the dashboard, decodable
/// test hostnames go to capture, everything else is 404.
async fn dispatch(
    State(state): State<AppState>,
    Extension(meta): Extension<ConnMeta>,
    req: Request<Body>,
) -> Response {
    let Some(raw_host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let host = strip_port(&raw_host).to_ascii_lowercase();

    if state.config.is_root_domain(&host) {
        return match state.dashboard.clone().oneshot(req).await {
            Ok(response) => response,
            Err(err) => match err {},
        };
    }

    // `_`-prefixed names exist for DNS validation only; they never serve
    // HTTP content.
    if !host.starts_with('_') {
        if let Some((id, subdomain)) = test_id::parse_hostname(&host, &state.config.domain) {
            return capture(&state, meta, id, &subdomain, &host, req).await;
        }
    }

    (
        StatusCode::NOT_FOUND,
        format!("unrecognized host name {host:?}"),
    )
        .into_response()
}

async fn capture(
    state: &AppState,
    meta: ConnMeta,
    id: TestId,
    subdomain: &str,
    host: &str,
    req: Request<Body>,
) -> Response {
    let scheme = if meta.https {
        Scheme::Https
    } else {
        Scheme::Http
    };

    let running = match state.store.read().await.is_running_test(id).await {
        Ok(running) => running,
        Err(err) => {
            // Answer as if the test were unknown; a probe is never shown an
            // internal failure.
            error!("error checking if {id} is a running test: {err}");
            false
        }
    };
    if !running {
        return (StatusCode::NOT_FOUND, format!("{id} is not a running test")).into_response();
    }

    let content = match state
        .store
        .read()
        .await
        .http_file_content(id, scheme, subdomain, req.uri().path())
        .await
    {
        Ok(content) => content.unwrap_or_default(),
        Err(err) => {
            error!("error looking up HTTP file for {id}: {err}");
            String::new()
        }
    };

    let captured = CapturedHttpRequest {
        test_id: id,
        received_at: OffsetDateTime::now_utc(),
        remote_addr: meta.remote_addr,
        host: host.to_string(),
        method: req.method().to_string(),
        url: req.uri().to_string(),
        version: format!("{:?}", req.version()),
        headers: header_map(req.headers()),
        https: meta.https,
    };
    if let Err(err) = state.store.write().await.record_http_request(captured).await {
        // The 200 promised to the probe still goes out.
        error!("error recording HTTP request for {id}: {err}");
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        content,
    )
        .into_response()
}

fn request_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req.headers().get(header::HOST) {
        return host.to_str().ok().map(str::to_string);
    }
    // HTTP/2 requests carry the authority in the URI instead.
    req.uri()
        .authority()
        .map(|authority| authority.host().to_string())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}
