use crate::error::{internal_error, PipelineError};
use crate::ingest::{
    ClearOutcome, HealthSnapshot, HistorySample, IngestOutcome, NotificationKey, SiteCounter,
    SitePipeline, Subscription,
};
use crate::mqtt::{TransportMonitor, TransportSnapshot};
use crate::telemetry::{Decoder, TelemetryRecord};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: SitePipeline,
    pub decoder: Arc<Decoder>,
    pub transport: Option<Arc<TransportMonitor>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    pipeline: HealthSnapshot,
    transport: Option<TransportSnapshot>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    site: Option<String>,
}

#[derive(Debug, Serialize)]
struct GateResponse {
    emit: bool,
}

fn no_data_yet() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "no data yet" }))).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        pipeline: state.pipeline.health().await,
        transport: state.transport.as_ref().map(|monitor| monitor.snapshot()),
    })
}

async fn list_sites(State(state): State<HttpState>) -> Json<Vec<String>> {
    Json(state.pipeline.site_ids())
}

async fn get_latest(
    State(state): State<HttpState>,
    Path(site_id): Path<String>,
) -> Result<Json<TelemetryRecord>, Response> {
    state
        .pipeline
        .get_latest(&site_id)
        .await
        .map(Json)
        .ok_or_else(no_data_yet)
}

async fn get_history(
    State(state): State<HttpState>,
    Path(site_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistorySample>>, Response> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    state
        .pipeline
        .get_history(&site_id, limit)
        .await
        .map(Json)
        .ok_or_else(no_data_yet)
}

async fn force_snapshot(
    State(state): State<HttpState>,
    Path(site_id): Path<String>,
) -> Result<Json<HistorySample>, Response> {
    state
        .pipeline
        .force_snapshot(&site_id)
        .await
        .map(Json)
        .ok_or_else(no_data_yet)
}

async fn reset_counter(
    State(state): State<HttpState>,
    Path(site_id): Path<String>,
) -> Result<Json<SiteCounter>, Response> {
    state
        .pipeline
        .reset_counter(&site_id)
        .await
        .map(Json)
        .ok_or_else(no_data_yet)
}

async fn clear_all(
    State(state): State<HttpState>,
) -> Result<Json<ClearOutcome>, (StatusCode, String)> {
    let outcome = state.pipeline.clear_all().await.map_err(internal_error)?;
    Ok(Json(outcome))
}

/// Runs a JSON body through the same decode + ingest path as a broker message.
async fn post_telemetry(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, (StatusCode, String)> {
    let topic = format!("{}/sensor", state.decoder.topic_prefix());
    let mut payload = body.to_vec();
    match state
        .pipeline
        .ingest_payload(&state.decoder, &topic, &mut payload, Utc::now())
        .await
    {
        Ok(Some(outcome)) => Ok(Json(outcome)),
        Ok(None) => Err((StatusCode::BAD_REQUEST, "topic not accepted".to_string())),
        Err(err) => {
            let message = err.to_string();
            state.pipeline.stats().record_failure(&PipelineError::Decode(err));
            Err((StatusCode::BAD_REQUEST, message))
        }
    }
}

async fn notification_gate(
    State(state): State<HttpState>,
    Json(key): Json<NotificationKey>,
) -> Json<GateResponse> {
    Json(GateResponse {
        emit: state.pipeline.should_emit(&key),
    })
}

async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let site = params
        .site
        .map(|site| site.trim().to_string())
        .filter(|site| !site.is_empty());
    ws.on_upgrade(move |socket| stream_socket(socket, state.pipeline, site))
}

async fn stream_socket(socket: WebSocket, pipeline: SitePipeline, site: Option<String>) {
    let Subscription { id, mut rx } = pipeline.subscribe(site).await;
    let (mut sink, mut incoming) = socket.split();
    tracing::debug!(subscriber = %id, "live stream opened");

    loop {
        tokio::select! {
            update = rx.recv() => {
                // `None` once the broadcaster dropped this subscriber.
                let Some(record) = update else { break };
                let text = match serde_json::to_string(record.as_ref()) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode live update");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    pipeline.unsubscribe(&id);
    let _ = sink.close().await;
    tracing::debug!(subscriber = %id, "live stream closed");
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/sites", get(list_sites))
        .route("/v1/sites/{site_id}/latest", get(get_latest))
        .route("/v1/sites/{site_id}/history", get(get_history))
        .route("/v1/sites/{site_id}/snapshot", post(force_snapshot))
        .route("/v1/sites/{site_id}/reset-counter", post(reset_counter))
        .route("/v1/data", delete(clear_all))
        .route("/v1/telemetry", post(post_telemetry))
        .route("/v1/notifications/gate", post(notification_gate))
        .route("/v1/stream", get(stream))
        .with_state(state)
}
