//! `courier-infra`
//!
//! Everything with I/O: the job broker and worker pools, persistence adapters,
//! the messaging provider client, the pipeline workers, inbound webhook
//! acceptance and process configuration.

pub mod config;
pub mod inbound;
pub mod jobs;
pub mod pipeline;
pub mod provider;
pub mod store;
pub mod workers;

pub use config::CourierConfig;
pub use inbound::{InboundError, InboundGateway, InboundSecrets};
pub use pipeline::{Collaborators, Pipeline, PipelineError, PipelineHandle};
pub use store::Stores;
