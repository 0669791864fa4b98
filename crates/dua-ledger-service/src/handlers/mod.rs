//! HTTP request handlers.

pub mod accounts;
pub mod admin;
pub mod balance;
pub mod callbacks;
pub mod credits;
pub mod health;
pub mod invites;
pub mod jobs;
