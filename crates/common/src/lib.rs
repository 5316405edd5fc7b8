//! Shared utilities for the autocert workspace.
//!
//! - [`retry`] - bounded exponential backoff used by every network and
//!   storage retry path
//! - [`observability`] - tracing subscriber installation for binaries

pub mod observability;
pub mod retry;

pub use observability::LogFormat;
pub use retry::RetryPolicy;
