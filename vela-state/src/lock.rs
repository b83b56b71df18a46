//! Lock information for state backend locking

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lock timeout in seconds (15 minutes)
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

/// Information about a state lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_timeout(operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    /// Create a new lock with a custom timeout
    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let now = Utc::now();
        let who = get_lock_owner();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who,
            created: now,
            expires: now + Duration::seconds(timeout_secs),
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
