//! gce_project_metadata create, read, update and delete
//!
//! The resource owns the project's entire common instance metadata map:
//! every write replaces the full set of keys, and delete clears it. Writes
//! go through the fingerprint read-modify-write loop because other actors
//! mutate the same map.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use vela_core::differ::ChangeSet;
use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::operation::wait_for_operation;
use crate::codec;
use crate::config::ProjectMetadataConfig;
use crate::instance_update::CONFLICT_RETRIES;
use crate::schemas;

const METADATA_TIMEOUT: Duration = Duration::from_secs(4 * 60);

pub(crate) fn project_metadata_identifier(project: &str) -> String {
    format!("projects/{}", project)
}

pub(crate) fn parse_project_metadata_identifier(identifier: &str) -> ProviderResult<String> {
    let parts: Vec<&str> = identifier.split('/').collect();
    match parts.as_slice() {
        ["projects", project] if !project.is_empty() => Ok(project.to_string()),
        _ => Err(ProviderError::invalid_input(
            "identifier",
            format!("expected projects/{{project}}, got {:?}", identifier),
        )),
    }
}

impl GceProvider {
    pub(crate) async fn create_project_metadata(
        &self,
        resource: &Resource,
    ) -> ProviderResult<State> {
        let config = ProjectMetadataConfig::from_resource(resource)?;
        let project = config.project.clone().unwrap_or_else(|| self.project.clone());

        self.set_project_metadata(&project, &config.metadata).await?;
        self.project_metadata_state(resource.id.clone(), &project).await
    }

    pub(crate) async fn read_project_metadata(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> ProviderResult<State> {
        let project = match identifier {
            Some(identifier) => parse_project_metadata_identifier(identifier)?,
            None => prior
                .and_then(|state| state.get_str("project"))
                .unwrap_or(&self.project)
                .to_string(),
        };
        self.project_metadata_state(id.clone(), &project).await
    }

    pub(crate) async fn update_project_metadata(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let project = parse_project_metadata_identifier(identifier)?;
        let config = ProjectMetadataConfig::from_resource(to)?;

        let changes = ChangeSet::between(&from.attributes, &to.attributes)
            .with_schema_force_new(&schemas::project_metadata_schema());
        if changes.requires_replacement() {
            let fields: Vec<&str> = changes.force_new_attributes().collect();
            return Err(ProviderError::invalid_input(
                fields.join(", "),
                "cannot change in place; the project metadata must be replaced",
            ));
        }

        self.set_project_metadata(&project, &config.metadata).await?;
        self.project_metadata_state(id.clone(), &project).await
    }

    pub(crate) async fn delete_project_metadata(&self, identifier: &str) -> ProviderResult<()> {
        let project = parse_project_metadata_identifier(identifier)?;
        log::debug!("clearing project metadata for {}", project);
        self.set_project_metadata(&project, &BTreeMap::new()).await
    }

    /// Fingerprint read-modify-write over the project's common metadata. The
    /// fingerprint is fetched fresh each attempt; simultaneous writers roll
    /// it out from under us.
    async fn set_project_metadata(
        &self,
        project: &str,
        items: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let mut attempts = 0;
        loop {
            let current = match self.api.get_project(project).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => {
                    return Err(ProviderError::not_found(format!("project {}", project)));
                }
                Err(e) => return Err(ProviderError::remote("reading project", e)),
            };
            let fingerprint = current
                .common_instance_metadata
                .as_ref()
                .and_then(|m| m.fingerprint.clone());
            let metadata = codec::expand_metadata(items, None, fingerprint);

            match self.api.set_common_instance_metadata(project, &metadata).await {
                Ok(op) => {
                    wait_for_operation(
                        self.api.as_ref(),
                        project,
                        op,
                        "Setting Project Metadata",
                        METADATA_TIMEOUT,
                    )
                    .await?;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    attempts += 1;
                    if attempts > CONFLICT_RETRIES {
                        return Err(ProviderError::conflict("project metadata", e.to_string()));
                    }
                    log::debug!("metadata fingerprint for {} went stale, retrying", project);
                }
                Err(e) => return Err(ProviderError::remote("Setting Project Metadata", e)),
            }
        }
    }

    async fn project_metadata_state(
        &self,
        id: ResourceId,
        project: &str,
    ) -> ProviderResult<State> {
        let live = match self.api.get_project(project).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => return Ok(State::not_found(id)),
            Err(e) => return Err(ProviderError::remote("reading project", e)),
        };

        let (metadata, _) = codec::flatten_metadata(live.common_instance_metadata.as_ref(), false);
        let mut attrs: HashMap<String, Value> = HashMap::new();
        attrs.insert("project".to_string(), Value::from(project));
        attrs.insert(
            "metadata".to_string(),
            Value::Map(
                metadata
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        );

        Ok(State::existing(id, attrs).with_identifier(project_metadata_identifier(project)))
    }
}
