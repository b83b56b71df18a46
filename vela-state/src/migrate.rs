//! Replaying provider schema migrations over recorded state
//!
//! Resource attributes are persisted together with the schema version they
//! were written under. Before a state file is used, every resource recorded
//! under an older version is handed to its provider, which returns the
//! upgraded attributes and the version they now conform to.

use std::collections::HashMap;

use vela_core::provider::{Provider, ProviderError, ProviderResult};

use crate::state::StateFile;

/// Upgrade every resource of `provider` recorded under an old schema version
///
/// Returns the number of resources that were rewritten. Resources belonging
/// to other providers, or to resource types this provider no longer exposes,
/// are left untouched.
pub async fn upgrade_resource_states<P: Provider>(
    state: &mut StateFile,
    provider: &P,
) -> ProviderResult<usize> {
    let current_versions: HashMap<String, u64> = provider
        .resource_types()
        .into_iter()
        .map(|t| (t.name().to_string(), t.schema_version()))
        .collect();

    let mut upgraded = 0;

    for resource in &mut state.resources {
        if resource.provider != provider.name() {
            continue;
        }
        let Some(&target) = current_versions.get(&resource.resource_type) else {
            continue;
        };
        if resource.schema_version >= target {
            continue;
        }

        let (version, attributes) = provider
            .migrate_resource_state(
                &resource.resource_type,
                &resource.name,
                resource.schema_version,
                resource.attributes.clone(),
            )
            .await?;

        if version < target {
            return Err(ProviderError::migration(format!(
                "{} {} was only upgraded to version {} (current is {})",
                resource.resource_type, resource.name, version, target
            )));
        }

        resource.attributes = attributes;
        resource.schema_version = version;
        upgraded += 1;
    }

    Ok(upgraded)
}
