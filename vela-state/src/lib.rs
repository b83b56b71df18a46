//! Vela State Management
//!
//! This crate provides state management for the Vela infrastructure tool.
//! It supports storing infrastructure state in pluggable backends (currently
//! a local file) with locking support for safe concurrent access.
//!
//! # Overview
//!
//! The state management system consists of:
//!
//! - **StateFile**: The main state structure containing all managed resources
//! - **StateBackend**: A trait for state storage backends (local, GCS, etc.)
//! - **LockInfo**: Information about state locks for concurrent access control
//! - **upgrade_resource_states**: Replays provider schema migrations over
//!   resources recorded by older releases
//!
//! # Example
//!
//! ```ignore
//! use vela_state::{create_backend, BackendConfig};
//!
//! let config = BackendConfig {
//!     backend_type: "local".to_string(),
//!     attributes: [
//!         ("path".to_string(), Value::String("infra/prod/vela.state.json".to_string())),
//!     ].into_iter().collect(),
//! };
//!
//! let backend = create_backend(&config).await?;
//!
//! // Acquire lock before modifying state
//! let lock = backend.acquire_lock("apply").await?;
//!
//! // Read current state
//! let mut state = backend.read_state().await?.unwrap_or_default();
//!
//! // Bring old resource states up to the provider's current layout
//! vela_state::upgrade_resource_states(&mut state, &provider).await?;
//!
//! // ... modify resources ...
//!
//! // Write updated state
//! backend.write_state(&state).await?;
//!
//! // Release lock
//! backend.release_lock(&lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod migrate;
pub mod state;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::create_backend;
pub use lock::LockInfo;
pub use migrate::upgrade_resource_states;
pub use state::{ResourceState, StateFile};
