//! HTTP service in front of `tagsweep-core`.
//!
//! Exposes `POST /cache/purge-tags`, wires the configured cache backends into
//! an [`InvalidationScheduler`](tagsweep_core::InvalidationScheduler), and
//! optionally fans purges out to peer instances over Redis Pub/Sub.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, ServerBuilder, TagsweepServer, build_app};
