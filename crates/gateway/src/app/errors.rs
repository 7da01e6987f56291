use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::InboundError;

/// Map an inbound failure to a response.
///
/// Only an invalid signature or a failed handshake is reported to the provider;
/// anything else is acknowledged so the provider does not redeliver.
pub fn inbound_error_to_response(err: InboundError) -> axum::response::Response {
    match err {
        InboundError::InvalidSignature => json_error(StatusCode::BAD_REQUEST, "invalid_signature", "invalid signature"),
        InboundError::VerificationFailed => {
            json_error(StatusCode::BAD_REQUEST, "verification_failed", "verification failed")
        }
        other => {
            tracing::error!(error = %other, "failed to accept webhook");
            (StatusCode::OK, axum::Json(json!({ "success": false }))).into_response()
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
