//! # Call API Handlers
//!
//! The packet submission endpoint and the read-only call queries.
//! Submission validates the payload, hands it to the ingestion coordinator
//! and answers 202 as soon as the packet is durable; transcription work
//! never runs on this path.

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::models::{AiStatus, CallState};
use crate::store::CallStore;

/// Body of `POST /v1/call/stream/{call_id}`.
#[derive(Debug, Deserialize)]
pub struct PacketPayload {
    /// 0-based packet sequence number chosen by the submitter.
    pub sequence: i64,
    /// Opaque audio metadata content.
    pub data: String,
    /// Capture time as Unix seconds.
    pub timestamp: f64,
}

impl PacketPayload {
    fn validate(&self) -> Result<(), AppError> {
        if self.sequence < 0 {
            return Err(AppError::ValidationError(
                "sequence must be non-negative".to_string(),
            ));
        }
        if self.data.is_empty() {
            return Err(AppError::ValidationError(
                "data must not be empty".to_string(),
            ));
        }
        if !(self.timestamp > 0.0) {
            return Err(AppError::ValidationError(
                "timestamp must be a positive Unix timestamp".to_string(),
            ));
        }
        Ok(())
    }
}

/// 202 body for an accepted packet.
#[derive(Debug, Serialize)]
pub struct PacketResponse {
    pub status: &'static str,
    pub call_id: String,
    pub sequence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `GET /v1/call/{call_id}/status`.
#[derive(Debug, Serialize)]
pub struct CallStatusResponse {
    pub call_id: String,
    pub state: CallState,
    pub last_sequence: i64,
    pub packet_count: i64,
    pub has_ai_result: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Body of `GET /v1/call/{call_id}/result`.
#[derive(Debug, Serialize)]
pub struct AiResultResponse {
    pub call_id: String,
    pub transcript: Option<String>,
    pub sentiment: Option<String>,
    pub status: AiStatus,
    pub retry_count: i64,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

/// `POST /v1/call/stream/{call_id}`: durably accept one packet.
pub async fn ingest_packet(
    path: web::Path<String>,
    payload: web::Json<PacketPayload>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let payload = payload.into_inner();
    payload.validate()?;

    let ack = state
        .coordinator
        .ingest(&call_id, payload.sequence, &payload.data, payload.timestamp)
        .await
        .map_err(|err| {
            error!(call_id = %call_id, error = %err, "packet ingestion failed");
            AppError::Ingestion("failed to ingest packet".to_string())
        })?;

    let message = ack.message();
    Ok(HttpResponse::Accepted().json(PacketResponse {
        status: "accepted",
        call_id: ack.call_id,
        sequence: ack.sequence,
        message,
    }))
}

/// `GET /v1/call/{call_id}/status`: current call aggregate.
pub async fn call_status(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let snapshot = state
        .store
        .get_call_snapshot(&call_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("call '{}' not found", call_id)))?;

    Ok(HttpResponse::Ok().json(CallStatusResponse {
        call_id: snapshot.call.call_id,
        state: snapshot.call.state,
        last_sequence: snapshot.call.last_sequence,
        packet_count: snapshot.packet_count,
        has_ai_result: snapshot.ai_result.is_some(),
        created_at: snapshot.call.created_at.to_rfc3339(),
        updated_at: snapshot.call.updated_at.to_rfc3339(),
    }))
}

/// `GET /v1/call/{call_id}/result`: the AI result detail, once one exists.
pub async fn call_result(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let snapshot = state
        .store
        .get_call_snapshot(&call_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("call '{}' not found", call_id)))?;

    let ai = snapshot
        .ai_result
        .ok_or_else(|| AppError::NotFound(format!("call '{}' has no AI result yet", call_id)))?;

    Ok(HttpResponse::Ok().json(AiResultResponse {
        call_id: ai.call_id,
        transcript: ai.transcript,
        sentiment: ai.sentiment,
        status: ai.status,
        retry_count: ai.retry_count,
        completed_at: ai.completed_at.map(|t| t.to_rfc3339()),
        error_message: ai.error_message,
    }))
}
