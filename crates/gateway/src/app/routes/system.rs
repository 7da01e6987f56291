use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::{Value, json};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn webhook_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
