//! Ingest gate.
//!
//! Accepts single and batch send requests over HTTP, validates them, and
//! persists notifications together with their outbox rows in one store
//! transaction. Acceptance is synchronous; everything downstream is
//! asynchronous with terminal status reported via webhook.

pub mod api;
pub mod auth;
pub mod error;
pub mod indexes;
pub mod service;
pub mod validation;

pub use api::{router, AppState};
pub use auth::ApiKeyAuth;
pub use error::IngestError;
pub use service::IngestService;
