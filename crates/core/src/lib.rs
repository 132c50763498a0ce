//! `renderq-core`: shared building blocks for the render queue.
//!
//! This crate contains **pure** primitives (identifiers, priority classes, domain
//! errors). No IO, no async, no infrastructure concerns.

pub mod error;
pub mod id;
pub mod priority;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, JobId, WebhookId};
pub use priority::Priority;
