//! Core types and utilities for the DUA credit ledger.
//!
//! This crate provides the foundational types shared by the store, the HTTP
//! service and the client SDK:
//!
//! - **Identifiers**: `UserId`, `TransactionId`, `JobId`, `ProviderJobId`
//! - **Balances**: `UserBalance`, `MirrorBalance`
//! - **Ledger**: `Transaction`, `TransactionKind`
//! - **Jobs**: `GenerationJob`, `JobState`, `Observation`, `Transition`
//! - **Pricing**: `PricingCatalog`, `ServiceSpec`, `OperationPrice`, `ProviderKind`
//! - **Invites**: `InviteCode`
//!
//! # Units
//!
//! Balances are counted in whole spendable units ("créditos") stored as `i64`.
//! A music generation costs 6 units, a five second Gen-4 video 20 units.
//! Balances are never negative.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod error;
pub mod ids;
pub mod invite;
pub mod job;
pub mod pricing;
pub mod transaction;

pub use balance::{MirrorBalance, UserBalance, DEFAULT_INVITE_WELCOME_UNITS};
pub use error::{LedgerError, Result};
pub use ids::{IdError, JobId, ProviderJobId, TransactionId, UserId};
pub use invite::{InviteCode, MIN_INVITE_CODE_LEN};
pub use job::{GenerationJob, JobState, Observation, Transition};
pub use pricing::{
    OperationCategory, OperationPrice, PricingCatalog, ProviderKind, ServiceSpec, ServiceType,
};
pub use transaction::{Transaction, TransactionKind};
