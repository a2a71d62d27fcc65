//! Configuration endpoints. The running configuration is readable (with
//! the database URL withheld) and the processing knobs can be adjusted at
//! runtime; a changed `ai_failure_rate` only takes effect for a
//! transcription client built after restart.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /v1/config`: the running configuration, redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "database": {
                "max_connections": config.database.max_connections
            },
            "logging": {
                "level": config.logging.level
            },
            "processing": {
                "max_ai_retries": config.processing.max_ai_retries,
                "ai_failure_rate": config.processing.ai_failure_rate
            }
        }
    })))
}

/// `PUT /v1/config`: partial update of the processing knobs.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "processing": {
            "max_ai_retries": current_config.processing.max_ai_retries,
            "ai_failure_rate": current_config.processing.ai_failure_rate
        }
    })))
}
