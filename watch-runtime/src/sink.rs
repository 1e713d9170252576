//! The delivery sink contract (produced/consumed boundary).
//!
//! Sink transport and rendering (terminal renderer, JSON writer, webhook)
//! are out of scope for this crate. This module only defines the
//! `(event) -> result` contract the delivery pipeline's terminal stage
//! drives; concrete sinks live in the `watch-cli` binary crate.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::DeliveryEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink call timed out")]
    Timeout,
    #[error("sink error: {0}")]
    Other(String),
}

/// The contract every delivery sink implements. Sinks are stateless across
/// calls, same as [`crate::collector::Collector`].
#[async_trait]
pub trait Sink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &DeliveryEvent) -> Result<(), SinkError>;
}
