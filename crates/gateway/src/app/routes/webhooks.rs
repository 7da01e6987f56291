//! Provider webhook endpoints.
//!
//! The tenant may be named by path (`/webhooks/meta/:tenant_id`) or by the
//! `tenant_id` query parameter; otherwise it is resolved per change from the
//! phone number id.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use courier_core::TenantId;

use crate::app::{errors, routes::system, services::GatewayServices};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Option<String>,
}

pub fn router() -> Router {
    Router::new()
        .route("/meta", get(verify).post(receive))
        .route("/meta/:tenant_id", post(receive_for_tenant))
        .route("/health", get(system::webhook_health))
}

fn parse_tenant(raw: Option<&str>) -> Result<Option<TenantId>, axum::response::Response> {
    match raw {
        None => Ok(None),
        Some(raw) => raw.parse::<TenantId>().map(Some).map_err(|_| {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_tenant_id", "tenant_id must be a uuid")
        }),
    }
}

pub async fn verify(
    Extension(services): Extension<Arc<GatewayServices>>,
    Query(query): Query<VerifyQuery>,
) -> axum::response::Response {
    let tenant = match parse_tenant(query.tenant_id.as_deref()) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match services
        .inbound
        .verify(
            tenant,
            query.mode.as_deref(),
            query.verify_token.as_deref(),
            query.challenge.as_deref(),
        )
        .await
    {
        Ok(challenge) => {
            tracing::info!(tenant_id = ?tenant, "webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        Err(err) => errors::inbound_error_to_response(err),
    }
}

pub async fn receive(
    Extension(services): Extension<Arc<GatewayServices>>,
    Query(query): Query<TenantQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    match parse_tenant(query.tenant_id.as_deref()) {
        Ok(tenant) => accept(&services, tenant, &headers, &body).await,
        Err(response) => response,
    }
}

pub async fn receive_for_tenant(
    Extension(services): Extension<Arc<GatewayServices>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    match parse_tenant(Some(&tenant_id)) {
        Ok(tenant) => accept(&services, tenant, &headers, &body).await,
        Err(response) => response,
    }
}

async fn accept(
    services: &GatewayServices,
    tenant: Option<TenantId>,
    headers: &HeaderMap,
    body: &[u8],
) -> axum::response::Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match services.inbound.accept(body, signature, tenant).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "enqueued": report.enqueued,
                "duplicates": report.duplicates,
                "skipped": report.skipped,
            })),
        )
            .into_response(),
        Err(err) => errors::inbound_error_to_response(err),
    }
}
