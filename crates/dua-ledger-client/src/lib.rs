//! DUA Ledger Client SDK.
//!
//! This crate provides a client library for the UI backend to talk to the
//! ledger service's internal API.
//!
//! # Example
//!
//! ```no_run
//! use dua_ledger_client::{LedgerClient, SubmitJobRequest};
//!
//! # async fn example() -> Result<(), dua_ledger_client::ClientError> {
//! let client = LedgerClient::new(
//!     "http://dua-ledger.internal:8080",
//!     "your-service-api-key",
//! )?;
//!
//! let job = client
//!     .submit_job(SubmitJobRequest {
//!         user_id: "5f0c3a52-8d0e-4e43-9d0e-1b4b1c7f6a10".to_string(),
//!         service_type: "music_generate_v5".to_string(),
//!         params: serde_json::json!({ "prompt": "lofi beats" }),
//!     })
//!     .await?;
//!
//! println!("Job {} reserved {} units", job.job_id, job.cost_reserved);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, LedgerClient};
pub use error::ClientError;
pub use types::*;
