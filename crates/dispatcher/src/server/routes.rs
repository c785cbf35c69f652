use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    dispatcher::{AlertDispatcher, AlertEvent, DispatchResponse, UNKNOWN_INSTANCE},
    metrics::gather_metrics,
};

/// Alertmanager webhook body. Only `alerts` is read, and each entry is
/// decoded on its own.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub alerts: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertResponse {
    pub alert: Option<String>,
    pub instance: String,
    pub code: u16,
    pub response: DispatchResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub responses: Vec<AlertResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub configured_alerts: Vec<String>,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub tracked_keys: usize,
}

fn invalid_alert_data() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": "Invalid alert data" })),
    )
        .into_response()
}

pub async fn webhook(
    State(dispatcher): State<Arc<AlertDispatcher>>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            warn!("Rejecting webhook body: {}", rejection.body_text());
            return invalid_alert_data();
        }
    };

    if payload.alerts.is_empty() {
        return invalid_alert_data();
    }

    info!("Received webhook with {} alert(s)", payload.alerts.len());

    let responses = payload
        .alerts
        .into_iter()
        .map(|raw| dispatch_one(&dispatcher, raw))
        .collect();

    (
        StatusCode::OK,
        Json(WebhookResponse {
            status: "success".to_string(),
            responses,
        }),
    )
        .into_response()
}

fn dispatch_one(dispatcher: &AlertDispatcher, raw: Value) -> AlertResponse {
    let label = |name: &str| {
        raw.get("labels")
            .and_then(|labels| labels.get(name))
            .and_then(Value::as_str)
            .map(String::from)
    };
    let alert = label("alertname");
    let instance = label("instance").unwrap_or_else(|| UNKNOWN_INSTANCE.to_string());

    // The execution handle is dropped; outcomes are logged by the executor.
    let dispatch = match AlertEvent::try_from(raw) {
        Ok(event) => dispatcher.handle(&event),
        Err(e) => dispatcher.reject_malformed(&e),
    };
    AlertResponse {
        alert,
        instance,
        code: dispatch.status_code(),
        response: dispatch.response,
    }
}

pub async fn health(State(dispatcher): State<Arc<AlertDispatcher>>) -> Json<HealthResponse> {
    let stats = dispatcher.executor_stats();
    Json(HealthResponse {
        status: "healthy".to_string(),
        configured_alerts: dispatcher
            .configured_alerts()
            .into_iter()
            .map(String::from)
            .collect(),
        active_workers: stats.workers,
        busy_workers: stats.busy,
        queued: stats.queued,
        tracked_keys: dispatcher.rate_limiter().tracked(),
    })
}

pub async fn metrics() -> Response {
    match gather_metrics() {
        Ok(text) => text.into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
