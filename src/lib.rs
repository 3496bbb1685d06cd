//! Turnstile - per-identity admission control
//!
//! This crate decides, for every request, whether a caller identity may
//! proceed. Each identity gets a minute quota and a day quota; callers that
//! keep exceeding them are blocked for a while. All state lives behind the
//! [`store::AdmissionStore`] contract, so the guard itself can be shared
//! freely between concurrent callers.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
