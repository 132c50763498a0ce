//! HTTP API for the render job queue: configuration, handlers, and routing.

pub mod app;
pub mod config;
pub mod handlers;
