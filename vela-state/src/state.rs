//! State file structures for persisting infrastructure state

use serde::{Deserialize, Serialize};

use vela_core::flatmap::FlatMap;

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Vela that last modified this state
    pub vela_version: String,
    /// All managed resources and their current state
    pub resources: Vec<ResourceState>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            vela_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Create a new state file with a specific lineage (for initialization)
    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            vela_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Increment serial and update vela version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.vela_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Find a resource mutably by type and name
    pub fn find_resource_mut(
        &mut self,
        resource_type: &str,
        name: &str,
    ) -> Option<&mut ResourceState> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Add or update a resource in the state
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        if let Some(existing) = self.find_resource_mut(&resource.resource_type, &resource.name) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// Remove a resource from the state
    pub fn remove_resource(&mut self, resource_type: &str, name: &str) -> Option<ResourceState> {
        if let Some(pos) = self
            .resources
            .iter()
            .position(|r| r.resource_type == resource_type && r.name == name)
        {
            Some(self.resources.remove(pos))
        } else {
            None
        }
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single managed resource
///
/// Attributes are stored in the flat string encoding (`disk.0.size` etc.) so
/// states written by any past release can be read and then upgraded through
/// the provider's migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type (e.g., "gce_instance", "gce_disk")
    pub resource_type: String,
    /// Resource name (from the `name` attribute in configuration)
    pub name: String,
    /// Provider name (e.g., "gce")
    pub provider: String,
    /// Version of the resource type's state layout these attributes follow
    #[serde(default)]
    pub schema_version: u64,
    /// All attributes of the resource, flat-encoded
    pub attributes: FlatMap,
    /// Whether this resource is protected from deletion
    #[serde(default)]
    pub protected: bool,
}

impl ResourceState {
    /// Create a new resource state
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            schema_version: 0,
            attributes: FlatMap::new(),
            protected: false,
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Record which state layout version the attributes follow
    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    /// Mark this resource as protected
    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_file_new() {
        let state = StateFile::new();
        assert_eq!(state.version, StateFile::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_state_file_increment_serial() {
        let mut state = StateFile::new();
        assert_eq!(state.serial, 0);
        state.increment_serial();
        assert_eq!(state.serial, 1);
        state.increment_serial();
        assert_eq!(state.serial, 2);
    }

    #[test]
    fn test_state_file_upsert_resource() {
        let mut state = StateFile::new();

        let resource1 =
            ResourceState::new("gce_disk", "data", "gce").with_attribute("zone", "us-central1-a");

        state.upsert_resource(resource1);
        assert_eq!(state.resources.len(), 1);

        // Update the same resource
        let resource2 =
            ResourceState::new("gce_disk", "data", "gce").with_attribute("zone", "us-east1-b");

        state.upsert_resource(resource2);
        assert_eq!(state.resources.len(), 1);
        assert_eq!(
            state.resources[0].attributes.get("zone").map(String::as_str),
            Some("us-east1-b")
        );
    }

    #[test]
    fn test_state_file_remove_resource() {
        let mut state = StateFile::new();

        let resource = ResourceState::new("gce_disk", "data", "gce");
        state.upsert_resource(resource);
        assert_eq!(state.resources.len(), 1);

        let removed = state.remove_resource("gce_disk", "data");
        assert!(removed.is_some());
        assert_eq!(state.resources.len(), 0);

        // Removing non-existent resource returns None
        let removed = state.remove_resource("gce_disk", "other");
        assert!(removed.is_none());
    }

    #[test]
    fn test_resource_state_protected() {
        let resource = ResourceState::new("gce_disk", "state-disk", "gce").with_protected(true);
        assert!(resource.protected);
    }

    #[test]
    fn test_schema_version_defaults_to_zero() {
        // States written before schema_version existed must deserialize as v0
        let json = r#"{
            "resource_type": "gce_instance",
            "name": "vm-1",
            "provider": "gce",
            "attributes": {"metadata.#": "1", "metadata.0.foo": "bar"}
        }"#;
        let resource: ResourceState = serde_json::from_str(json).unwrap();
        assert_eq!(resource.schema_version, 0);
        assert!(!resource.protected);
    }

    #[test]
    fn test_state_file_serialization() {
        let mut state = StateFile::new();
        let resource = ResourceState::new("gce_instance", "vm-1", "gce")
            .with_attribute("zone", "us-central1-a")
            .with_attribute("machine_type", "e2-medium")
            .with_schema_version(6);

        state.upsert_resource(resource);

        let json = serde_json::to_string_pretty(&state).unwrap();
        let deserialized: StateFile = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.version, state.version);
        assert_eq!(deserialized.serial, state.serial);
        assert_eq!(deserialized.lineage, state.lineage);
        assert_eq!(deserialized.resources.len(), 1);
        assert_eq!(deserialized.resources[0].schema_version, 6);
    }
}
