//! Shared types for the webhook ingestion and orchestration core: the
//! event record, its lifecycle status, the idempotency-key shape, and the
//! transient/permanent error taxonomy every component downstream of
//! ingress classifies its failures into.

pub mod error;
pub mod event;
pub mod source;

pub use error::{Outcome, PipelineError};
pub use event::{Event, EventStatus};
pub use source::{IdKey, Source};
