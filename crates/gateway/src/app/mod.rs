//! Axum router and service wiring.
//!
//! - `services.rs`: what the handlers share (the inbound gateway)
//! - `routes/`: one file per endpoint family
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::GatewayServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<GatewayServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", routes::webhooks::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
