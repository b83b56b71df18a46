//! Compute API surface
//!
//! The provider talks to the remote compute service through the `ComputeApi`
//! trait. Transport concerns (auth, retries at the HTTP layer, endpoints)
//! belong to the trait implementation; everything in this crate works against
//! the typed requests and responses in `types`.

pub mod client;
pub mod operation;
pub mod types;

pub use client::{ApiError, ApiResult, ComputeApi};
pub use operation::wait_for_operation;
