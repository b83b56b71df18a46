//! GCE Provider
//!
//! Google Compute Engine implementation of the Provider trait. Declared
//! resource attributes expand into Compute Engine API requests and API
//! responses flatten back into recorded state; mutations run as operations
//! the provider polls to completion before reading the result back.

pub mod api;
pub mod schemas;

mod codec;
mod config;
mod disk;
mod disks;
mod image;
mod instance;
mod instance_update;
mod migrate;
mod project_metadata;
mod router_peer;
mod template;
mod util;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::Arc;

use vela_core::differ::ChangeSet;
use vela_core::lock::KeyedLocks;
use vela_core::provider::{
    BoxFuture, Provider, ProviderError, ProviderResult, ResourceType,
};
use vela_core::resource::{Resource, ResourceId, State};
use vela_core::schema::ResourceSchema;

use crate::api::ComputeApi;

/// Compute Engine instance resource type
pub struct GceInstanceType;

impl ResourceType for GceInstanceType {
    fn name(&self) -> &'static str {
        "gce_instance"
    }

    fn schema(&self) -> ResourceSchema {
        schemas::instance_schema()
    }

    fn schema_version(&self) -> u64 {
        migrate::INSTANCE_SCHEMA_VERSION
    }
}

/// Instance template resource type
pub struct GceInstanceTemplateType;

impl ResourceType for GceInstanceTemplateType {
    fn name(&self) -> &'static str {
        "gce_instance_template"
    }

    fn schema(&self) -> ResourceSchema {
        schemas::template_schema()
    }
}

/// Persistent disk resource type
pub struct GceDiskType;

impl ResourceType for GceDiskType {
    fn name(&self) -> &'static str {
        "gce_disk"
    }

    fn schema(&self) -> ResourceSchema {
        schemas::disk_schema()
    }
}

/// Project-wide common instance metadata resource type
pub struct GceProjectMetadataType;

impl ResourceType for GceProjectMetadataType {
    fn name(&self) -> &'static str {
        "gce_project_metadata"
    }

    fn schema(&self) -> ResourceSchema {
        schemas::project_metadata_schema()
    }
}

/// Cloud Router BGP peer resource type
pub struct GceRouterPeerType;

impl ResourceType for GceRouterPeerType {
    fn name(&self) -> &'static str {
        "gce_router_peer"
    }

    fn schema(&self) -> ResourceSchema {
        schemas::router_peer_schema()
    }
}

/// Provider for Google Compute Engine
///
/// Holds the API client together with the default project, region and zone
/// that resources inherit when their configuration leaves them unset. Router
/// mutations additionally serialize through `locks`, keyed per router,
/// because BGP peers share their router's document.
pub struct GceProvider {
    api: Arc<dyn ComputeApi>,
    project: String,
    region: String,
    zone: String,
    locks: KeyedLocks,
}

impl GceProvider {
    pub fn new(
        api: Arc<dyn ComputeApi>,
        project: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            api,
            project: project.into(),
            region: region.into(),
            zone: zone.into(),
            locks: KeyedLocks::new(),
        }
    }
}

impl Provider for GceProvider {
    fn name(&self) -> &'static str {
        "gce"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        vec![
            Box::new(GceInstanceType),
            Box::new(GceInstanceTemplateType),
            Box::new(GceDiskType),
            Box::new(GceProjectMetadataType),
            Box::new(GceRouterPeerType),
        ]
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(str::to_string);
        let prior = prior.cloned();
        Box::pin(async move {
            let identifier = identifier.as_deref();
            let prior = prior.as_ref();
            match id.resource_type.as_str() {
                "gce_instance" => self.read_instance(&id, identifier, prior).await,
                "gce_instance_template" => self.read_template(&id, identifier, prior).await,
                "gce_disk" => self.read_disk(&id, identifier, prior).await,
                "gce_project_metadata" => {
                    self.read_project_metadata(&id, identifier, prior).await
                }
                "gce_router_peer" => self.read_router_peer(&id, identifier, prior).await,
                other => Err(unknown_resource_type(other)),
            }
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            match resource.id.resource_type.as_str() {
                "gce_instance" => {
                    validate_config(&schemas::instance_schema(), &resource)?;
                    self.create_instance(&resource).await
                }
                "gce_instance_template" => {
                    validate_config(&schemas::template_schema(), &resource)?;
                    self.create_template(&resource).await
                }
                "gce_disk" => {
                    validate_config(&schemas::disk_schema(), &resource)?;
                    self.create_disk(&resource).await
                }
                "gce_project_metadata" => {
                    validate_config(&schemas::project_metadata_schema(), &resource)?;
                    self.create_project_metadata(&resource).await
                }
                "gce_router_peer" => {
                    validate_config(&schemas::router_peer_schema(), &resource)?;
                    self.create_router_peer(&resource).await
                }
                other => Err(unknown_resource_type(other)),
            }
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move {
            match id.resource_type.as_str() {
                "gce_instance" => self.update_instance(&id, &identifier, &from, &to).await,
                "gce_instance_template" => self.update_template(&from, &to),
                "gce_disk" => self.update_disk(&id, &identifier, &from, &to).await,
                "gce_project_metadata" => {
                    self.update_project_metadata(&id, &identifier, &from, &to).await
                }
                "gce_router_peer" => {
                    // The peer's identity fields are textually stable in
                    // state, so the schema flags carry the whole check
                    let changes = ChangeSet::between(&from.attributes, &to.attributes)
                        .with_schema_force_new(&schemas::router_peer_schema());
                    if changes.requires_replacement() {
                        let fields: Vec<&str> = changes.force_new_attributes().collect();
                        return Err(ProviderError::invalid_input(
                            fields.join(", "),
                            "cannot change in place; the router peer must be replaced",
                        ));
                    }
                    self.update_router_peer(&id, &identifier, &to).await
                }
                other => Err(unknown_resource_type(other)),
            }
        })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            match id.resource_type.as_str() {
                "gce_instance" => self.delete_instance(&id, &identifier).await,
                "gce_instance_template" => self.delete_template(&id, &identifier).await,
                "gce_disk" => self.delete_disk(&id, &identifier).await,
                "gce_project_metadata" => self.delete_project_metadata(&identifier).await,
                "gce_router_peer" => self.delete_router_peer(&id, &identifier).await,
                other => Err(unknown_resource_type(other)),
            }
        })
    }

    fn migrate_resource_state(
        &self,
        resource_type: &str,
        name: &str,
        schema_version: u64,
        attributes: BTreeMap<String, String>,
    ) -> BoxFuture<'_, ProviderResult<(u64, BTreeMap<String, String>)>> {
        let resource_type = resource_type.to_string();
        let name = name.to_string();
        Box::pin(async move {
            match resource_type.as_str() {
                "gce_instance" => {
                    migrate::migrate_instance_state(
                        self.api.as_ref(),
                        &self.project,
                        &self.zone,
                        &name,
                        schema_version,
                        attributes,
                    )
                    .await
                }
                _ => Ok((schema_version, attributes)),
            }
        })
    }
}

fn unknown_resource_type(resource_type: &str) -> ProviderError {
    ProviderError::invalid_input(
        "resource_type",
        format!("unknown resource type {}", resource_type),
    )
}

/// Typed validation at the configuration boundary; shapes the schema cannot
/// express are enforced by the per-resource config parsers.
fn validate_config(schema: &ResourceSchema, resource: &Resource) -> ProviderResult<()> {
    schema.validate(&resource.attributes).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ProviderError::invalid_input(schema.resource_type.clone(), messages.join("; "))
    })
}

#[cfg(test)]
mod tests {
    use vela_core::resource::Value;

    use super::*;
    use crate::testing::{FakeCompute, provider_with};

    #[test]
    fn resource_types_cover_the_gce_surface() {
        let (_, provider) = provider_with(FakeCompute::new());
        let names: Vec<&str> = provider
            .resource_types()
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "gce_instance",
                "gce_instance_template",
                "gce_disk",
                "gce_project_metadata",
                "gce_router_peer",
            ],
        );
    }

    #[test]
    fn only_instances_carry_a_schema_version() {
        assert_eq!(
            GceInstanceType.schema_version(),
            migrate::INSTANCE_SCHEMA_VERSION
        );
        assert_eq!(GceDiskType.schema_version(), 0);
        assert_eq!(GceRouterPeerType.schema_version(), 0);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_resource_types() {
        let (_, provider) = provider_with(FakeCompute::new());
        let id = ResourceId::new("gce_firewall", "allow-ssh");

        let err = provider.read(&id, None, None).await.unwrap_err();

        assert!(matches!(err, ProviderError::InvalidInput { .. }));
        assert!(err.to_string().contains("gce_firewall"));
    }

    #[tokio::test]
    async fn create_validates_before_touching_the_api() {
        let (api, provider) = provider_with(FakeCompute::new());
        let resource = Resource::new("gce_disk", "data-1")
            .with_attribute("name", "data-1")
            .with_attribute("size", "one hundred");

        let err = provider.create(&resource).await.unwrap_err();

        match err {
            ProviderError::InvalidInput { field, message } => {
                assert_eq!(field, "gce_disk");
                assert!(message.contains("Expected integer"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn disk_lifecycle_through_the_trait() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let resource = Resource::new("gce_disk", "data-1")
            .with_attribute("name", "data-1")
            .with_attribute("size", 100)
            .with_attribute("type", "pd-ssd")
            .with_attribute("image", "debian-11");

        let created = provider.create(&resource).await.unwrap();
        assert!(created.exists);
        let identifier = created.identifier.clone().unwrap();
        assert_eq!(identifier, "projects/proj/zones/us-central1-a/disks/data-1");

        let read = provider
            .read(&resource.id, Some(&identifier), Some(&created))
            .await
            .unwrap();
        assert_eq!(read.attributes.get("size"), Some(&Value::from(100)));

        provider.delete(&resource.id, &identifier).await.unwrap();
        let gone = provider
            .read(&resource.id, Some(&identifier), None)
            .await
            .unwrap();
        assert!(!gone.exists);
    }

    #[tokio::test]
    async fn router_peer_identity_changes_are_rejected_at_dispatch() {
        let (api, provider) = provider_with(FakeCompute::new());
        let id = ResourceId::new("gce_router_peer", "peer-1");
        let from = State::existing(
            id.clone(),
            [
                ("name".to_string(), Value::from("peer-1")),
                ("router".to_string(), Value::from("rtr-1")),
                ("region".to_string(), Value::from("us-central1")),
                ("interface".to_string(), Value::from("if-1")),
                ("peer_asn".to_string(), Value::from(64512)),
            ]
            .into_iter()
            .collect(),
        );
        let to = Resource::new("gce_router_peer", "peer-1")
            .with_attribute("name", "peer-1")
            .with_attribute("router", "rtr-1")
            .with_attribute("interface", "if-2")
            .with_attribute("peer_asn", 64512);

        let err = provider
            .update(
                &id,
                "projects/proj/regions/us-central1/routers/rtr-1/peers/peer-1",
                &from,
                &to,
            )
            .await
            .unwrap_err();

        match err {
            ProviderError::InvalidInput { field, message } => {
                assert_eq!(field, "interface");
                assert!(message.contains("replaced"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn migration_dispatch_passes_other_types_through() {
        let (_, provider) = provider_with(FakeCompute::new());
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), "peer-1".to_string());

        let (version, migrated) = provider
            .migrate_resource_state("gce_router_peer", "peer-1", 0, attributes.clone())
            .await
            .unwrap();

        assert_eq!(version, 0);
        assert_eq!(migrated, attributes);
    }

    #[tokio::test]
    async fn current_instance_states_migrate_untouched() {
        let (_, provider) = provider_with(FakeCompute::new());
        let mut attributes = BTreeMap::new();
        attributes.insert("zone".to_string(), "us-central1-a".to_string());

        let (version, migrated) = provider
            .migrate_resource_state(
                "gce_instance",
                "vm-1",
                migrate::INSTANCE_SCHEMA_VERSION,
                attributes.clone(),
            )
            .await
            .unwrap();

        assert_eq!(version, migrate::INSTANCE_SCHEMA_VERSION);
        assert_eq!(migrated, attributes);
    }
}
