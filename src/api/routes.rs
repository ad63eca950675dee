use crate::api::api_error::APIError;
use crate::api::model::{
    AddDnsRecordRequest, AddHttpFileRequest, AnnotatedDnsRequest, AnnotatedHttpRequest,
    AnnotatedSmtpRequest, TestReport, TestStarted,
};
use crate::attribution::Attribution;
use crate::config::SharedConfig;
use crate::error::Error;
use crate::store::{DynStore, TestSession};
use crate::test_id::{self, TestId};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::WithRejection;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub store: DynStore,
    pub attribution: Arc<Attribution>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/test", post(start_test))
        .route("/test/:test_id", get(show_test))
        .route("/test/:test_id/stop", post(stop_test))
        .route("/test/:test_id/dns_record", post(add_dns_record))
        .route("/test/:test_id/http_file", post(add_http_file))
        .with_state(state)
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

async fn start_test(State(state): State<AppState>) -> Result<Json<TestStarted>, APIError> {
    let test_id = TestId::generate()?;
    state.store.write().await.start_test(test_id).await?;
    tracing::info!("started test {test_id}");
    Ok(Json(TestStarted {
        test_id,
        test_domain: test_id::test_hostname(test_id, "", &state.config.domain),
    }))
}

async fn stop_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<StatusCode, APIError> {
    let id: TestId = test_id.parse()?;
    state.store.write().await.stop_test(id).await?;
    tracing::info!("stopped test {id}");
    Ok(StatusCode::NO_CONTENT)
}

async fn show_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestReport>, APIError> {
    let id: TestId = test_id.parse()?;
    let (session, dns_records, http_files, dns_requests, http_requests, smtp_requests) = {
        let store = state.store.read().await;
        let Some(session) = store.test_session(id).await? else {
            return Err(Error::TestNotFound(id).into());
        };
        (
            session,
            store.all_dns_records(id).await?,
            store.http_files(id).await?,
            store.dns_requests(id).await?,
            store.http_requests(id).await?,
            store.smtp_requests(id).await?,
        )
    };

    let mut report = TestReport {
        test_id: id,
        test_domain: test_id::test_hostname(id, "", &state.config.domain),
        started_at: session.started_at,
        stopped_at: session.stopped_at,
        running: session.is_running(),
        dns_records,
        http_files,
        dns_requests: Vec::new(),
        http_requests: Vec::new(),
        smtp_requests: Vec::new(),
    };
    for request in dns_requests {
        let ip = request.remote_addr.ip();
        report.dns_requests.push(AnnotatedDnsRequest {
            autonomous_systems: state.attribution.autonomous_systems(ip).await,
            delegated_third_party: state.attribution.delegated_third_party(ip).await,
            request,
        });
    }
    for request in http_requests {
        let ip = request.remote_addr.ip();
        report.http_requests.push(AnnotatedHttpRequest {
            autonomous_systems: state.attribution.autonomous_systems(ip).await,
            request,
        });
    }
    for request in smtp_requests {
        let ip = request.remote_addr.ip();
        report.smtp_requests.push(AnnotatedSmtpRequest {
            autonomous_systems: state.attribution.autonomous_systems(ip).await,
            request,
        });
    }
    Ok(Json(report))
}

async fn add_dns_record(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    WithRejection(Json(payload), _): WithRejection<Json<AddDnsRecordRequest>, APIError>,
) -> Result<StatusCode, APIError> {
    let id = running_test(&state, &test_id).await?;
    let record = payload.into_record()?;
    state.store.write().await.add_dns_record(id, record).await?;
    tracing::info!("provisioned DNS record for test {id}");
    Ok(StatusCode::CREATED)
}

async fn add_http_file(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    WithRejection(Json(payload), _): WithRejection<Json<AddHttpFileRequest>, APIError>,
) -> Result<StatusCode, APIError> {
    let id = running_test(&state, &test_id).await?;
    let file = payload.into_file()?;
    state.store.write().await.add_http_file(id, file).await?;
    tracing::info!("provisioned HTTP file for test {id}");
    Ok(StatusCode::CREATED)
}

/// Provisioning is only allowed while a test is running.
async fn running_test(state: &AppState, test_id: &str) -> Result<TestId, Error> {
    let id: TestId = test_id.parse()?;
    let session: Option<TestSession> = state.store.read().await.test_session(id).await?;
    match session {
        None => Err(Error::TestNotFound(id)),
        Some(session) if !session.is_running() => Err(Error::TestNotRunning(id)),
        Some(_) => Ok(id),
    }
}
