//! HTTP edge of the pipeline: inbound provider webhooks and health.

pub mod app;
