//! DUA ledger HTTP API service.
//!
//! This crate provides the HTTP API for the credit ledger and the
//! generation job orchestrator:
//!
//! - Balances, mirror balances and transaction history
//! - Job submission with up-front credit reservation
//! - Server-side job tracking (polling and provider callbacks)
//! - Idempotent settlement and the reconciliation sweep
//! - Invite code redemption and admin tooling
//!
//! # Authentication
//!
//! 1. **Service API keys** - for the UI backend calling the internal API
//! 2. **JWT tokens** - for end-user `/v1/me` routes
//! 3. **Admin API keys** - for privileged endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for the router

pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod providers;
pub mod routes;
pub mod state;

pub use config::{ServiceConfig, TrackingConfig};
pub use error::ApiError;
pub use jobs::{JobError, JobSubmitter, JobTracker, SettlementHandler, SettlementOutcome};
pub use providers::{ProviderAdapter, ProviderError, ProviderRegistry, RunwayAdapter, SunoAdapter};
pub use routes::create_router;
pub use state::AppState;
