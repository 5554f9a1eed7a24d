//! HTTP access layer for the ERP API

pub mod client;
pub mod error;
pub mod request;

pub use client::ApiClient;
pub use error::{ApiError, ErrorKind, NetworkFailure};
pub use request::{Payload, QueryParams, RequestBody, RequestOptions, RetryPolicy};
