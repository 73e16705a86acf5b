//! Resource control service abstraction.
//!
//! This module provides a `ResourceControl` trait for the snapshot and
//! cluster operations a restore needs, plus an HTTP gateway implementation.

mod http;
mod types;

pub use http::{HttpControlPlane, IDEMPOTENCY_HEADER};
pub use types::*;
