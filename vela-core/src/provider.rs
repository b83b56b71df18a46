//! Provider - Trait abstracting resource operations
//!
//! A Provider defines operations for a specific infrastructure (GCE, etc.).
//! It is responsible for translating declared resources into actual API calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::resource::{Resource, ResourceId, State};
use crate::schema::ResourceSchema;

/// Error type for Provider operations
///
/// Variants classify failures so callers can react without parsing messages:
/// retry on `Conflict`, replace on `NotFound`, surface `RequiresStop` to the
/// user as an actionable config change.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid value for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("conflict while updating {what}: {message}")]
    Conflict { what: String, message: String },

    #[error(
        "changing {fields} on a running instance requires stopping it; set allow_stopping_for_update = true to acknowledge"
    )]
    RequiresStop { fields: String },

    #[error("migration error: {0}")]
    Migration(String),

    #[error("error during {operation}: {message}")]
    RemoteCallFailed { operation: String, message: String },
}

impl ProviderError {
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn requires_stop(fields: impl Into<String>) -> Self {
        Self::RequiresStop {
            fields: fields.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration(message.into())
    }

    pub fn remote(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::RemoteCallFailed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether a retry of the same call may succeed (stale-fingerprint class)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Definition of resource types that a Provider can handle
pub trait ResourceType: Send + Sync {
    /// Resource type name (e.g., "gce_instance")
    fn name(&self) -> &'static str;

    /// Attribute schema for this resource type
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new(self.name())
    }

    /// Version of the state layout this resource type currently writes
    ///
    /// States recorded under an older version are passed through
    /// `Provider::migrate_resource_state` before use.
    fn schema_version(&self) -> u64 {
        0
    }
}

/// Main Provider trait
///
/// Each infrastructure provider implements this trait.
/// All operations are async and involve side effects.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "gce")
    fn name(&self) -> &'static str;

    /// List of resource types this Provider can handle
    fn resource_types(&self) -> Vec<Box<dyn ResourceType>>;

    /// Get the current state of a resource
    ///
    /// If identifier is provided, use it to read the resource directly.
    /// Otherwise, fall back to name-based lookup.
    /// `prior` carries the last recorded state so the result can keep
    /// write-only values (e.g. raw encryption keys) the API never echoes.
    /// Returns `State::not_found()` if the resource does not exist.
    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Create a resource
    ///
    /// Returns State with identifier set to the remote ID
    /// (e.g., "projects/p/zones/z/instances/name")
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>>;

    /// Update a resource
    ///
    /// The identifier is the remote ID recorded at create time
    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Delete a resource
    ///
    /// The identifier is the remote ID recorded at create time
    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>>;

    /// Upgrade a recorded state from an older schema version
    ///
    /// `name` is the resource's recorded name, available to migrations that
    /// must consult the live resource. Takes the flat attribute map as
    /// persisted and returns the upgraded map together with the version it
    /// now conforms to. The default passes the state through untouched for
    /// providers without migrations.
    fn migrate_resource_state(
        &self,
        resource_type: &str,
        name: &str,
        schema_version: u64,
        attributes: BTreeMap<String, String>,
    ) -> BoxFuture<'_, ProviderResult<(u64, BTreeMap<String, String>)>> {
        let _ = (resource_type, name);
        Box::pin(async move { Ok((schema_version, attributes)) })
    }
}

/// Provider implementation for Box<dyn Provider>
/// This enables dynamic dispatch for Providers
impl Provider for Box<dyn Provider> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        (**self).resource_types()
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).read(id, identifier, prior)
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).create(resource)
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        (**self).update(id, identifier, from, to)
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).delete(id, identifier)
    }

    fn migrate_resource_state(
        &self,
        resource_type: &str,
        name: &str,
        schema_version: u64,
        attributes: BTreeMap<String, String>,
    ) -> BoxFuture<'_, ProviderResult<(u64, BTreeMap<String, String>)>> {
        (**self).migrate_resource_state(resource_type, name, schema_version, attributes)
    }
}
