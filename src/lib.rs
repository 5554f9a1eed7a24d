//! ERP admin API client
//!
//! Session-aware request pipeline for the ERP backend: bearer credentials,
//! single-flight session renewal, bounded retries, timeouts, cancellation,
//! and expiry notifications.

pub mod api;
pub mod auth;
pub mod config;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
