use std::sync::Arc;

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    clients::health::HealthChecker,
    error::{DispatchError, ErrorCategory, ErrorCode},
    models::{
        attempt::DeliveryAttempt,
        health::HealthStatus,
        notification::{SendRequest, SendResponse, StatusReport},
        response::ApiResponse,
    },
    services::orchestrator::NotificationService,
};

pub struct AppState {
    pub service: Arc<NotificationService>,
    pub health_checker: HealthChecker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/notifications", post(send_notification))
        .route("/api/v1/notifications/{id}", get(get_status))
        .route("/api/v1/notifications/{id}/attempts", get(get_attempts))
        .route("/api/v1/notifications/{id}/retry", post(retry_notification))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    state: Arc<AppState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

/// Domain error rendered as an `ApiResponse` with a matching status code.
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidArgument | ErrorCode::MaxRetriesExceeded => StatusCode::CONFLICT,
        ErrorCode::TemplateNotFound | ErrorCode::TemplateInvalid => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::CircuitOpen | ErrorCode::FailoverExhausted => StatusCode::SERVICE_UNAVAILABLE,
        code => match code.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Vendor | ErrorCategory::Lifecycle => StatusCode::BAD_GATEWAY,
            ErrorCategory::Queue => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = status_for(code);

        if status.is_server_error() {
            error!(code = %code, error = %self.0, "Request failed");
        }

        // Delivery failures carry the per-vendor trail.
        let data = match &self.0 {
            DispatchError::FailoverExhausted { .. } | DispatchError::DeliveryFailed { .. } => {
                Some(self.0.diagnostic())
            }
            _ => None,
        };

        let body = ApiResponse::failure(code, self.0.to_string(), data);

        (status, Json(body)).into_response()
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SendResponse>>), ApiError> {
    let response = state.service.send(request).await?;

    let status_code = if response.status == "sent" {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let message = format!("Notification {}", response.status);

    Ok((status_code, Json(ApiResponse::success(response, message))))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StatusReport>>, ApiError> {
    let report = state.service.get_status(&id).await?;
    Ok(Json(ApiResponse::success(
        report,
        "Notification status retrieved".to_string(),
    )))
}

async fn get_attempts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<DeliveryAttempt>>>, ApiError> {
    let attempts = state.service.get_attempts(&id).await?;
    let message = format!("{} delivery attempts", attempts.len());
    Ok(Json(ApiResponse::success(attempts, message)))
}

async fn retry_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ApiResponse<StatusReport>>), ApiError> {
    let report = state.service.retry(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(
            report,
            "Notification re-queued".to_string(),
        )),
    ))
}
