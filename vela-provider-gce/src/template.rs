//! gce_instance_template create, read and delete
//!
//! Templates have no update endpoint: every field is fixed once the template
//! exists, so changes always replace it. Read realigns the returned disk
//! list with the configured order (see `disks::reorder_disks`) so a
//! service-side reordering does not surface as a diff.

use std::collections::HashMap;
use std::time::Duration;

use vela_core::differ::ChangeSet;
use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::operation::wait_for_operation;
use crate::api::types::{AcceleratorConfig, InstanceProperties, InstanceTemplate};
use crate::codec;
use crate::config::TemplateConfig;
use crate::disks;
use crate::image;
use crate::util::name_from_self_link;

pub(crate) const TEMPLATE_TIMEOUT: Duration = Duration::from_secs(4 * 60);

pub(crate) fn template_identifier(project: &str, name: &str) -> String {
    format!("projects/{}/global/instanceTemplates/{}", project, name)
}

pub(crate) fn parse_template_identifier(identifier: &str) -> ProviderResult<(String, String)> {
    let parts: Vec<&str> = identifier.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "global", "instanceTemplates", name]
            if !project.is_empty() && !name.is_empty() =>
        {
            Ok((project.to_string(), name.to_string()))
        }
        _ => Err(ProviderError::invalid_input(
            "identifier",
            format!(
                "expected projects/{{project}}/global/instanceTemplates/{{name}}, got {:?}",
                identifier
            ),
        )),
    }
}

impl GceProvider {
    pub(crate) async fn create_template(&self, resource: &Resource) -> ProviderResult<State> {
        let config = TemplateConfig::from_resource(resource)?;

        let template = self.expand_template(&config).await?;
        log::debug!("creating instance template {}", config.name);
        let op = self
            .api
            .insert_instance_template(&self.project, &template)
            .await
            .map_err(|e| ProviderError::remote("Creating Instance Template", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &self.project,
            op,
            "Creating Instance Template",
            TEMPLATE_TIMEOUT,
        )
        .await?;

        self.template_state(
            resource.id.clone(),
            &self.project,
            &config.name,
            Some(&resource.attributes),
        )
        .await
    }

    pub(crate) async fn read_template(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> ProviderResult<State> {
        let (project, name) = match identifier {
            Some(identifier) => parse_template_identifier(identifier)?,
            None => (self.project.clone(), id.name.clone()),
        };
        self.template_state(
            id.clone(),
            &project,
            &name,
            prior.map(|state| &state.attributes),
        )
        .await
    }

    /// There is no in-place path for a template; report every changed
    /// attribute as requiring replacement
    pub(crate) fn update_template(&self, from: &State, to: &Resource) -> ProviderResult<State> {
        let changes = ChangeSet::between(&from.attributes, &to.attributes);
        let fields: Vec<&str> = changes.changed().collect();
        Err(ProviderError::invalid_input(
            fields.join(", "),
            "cannot change in place; the template must be replaced",
        ))
    }

    pub(crate) async fn delete_template(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        let (project, name) = parse_template_identifier(identifier)?;

        let op = match self.api.delete_instance_template(&project, &name).await {
            Ok(op) => op,
            Err(e) if e.is_not_found() => {
                log::debug!("instance template {} already gone", id.name);
                return Ok(());
            }
            Err(e) => return Err(ProviderError::remote("Deleting Instance Template", e)),
        };
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Deleting Instance Template",
            TEMPLATE_TIMEOUT,
        )
        .await
    }

    /// Build the full insert request from the typed configuration
    ///
    /// Each disk image reference is resolved up front and stored in its
    /// relative `projects/...` form; the service would accept shorthand, but
    /// the canonical form keeps reads diff-stable.
    async fn expand_template(&self, config: &TemplateConfig) -> ProviderResult<InstanceTemplate> {
        let mut template_disks = Vec::with_capacity(config.disks.len());
        for disk in &config.disks {
            let resolved = match disk.source_image.as_deref() {
                Some(name) => {
                    let canonical =
                        image::resolve_image(self.api.as_ref(), &self.project, name).await?;
                    Some(image::resolve_image_ref_to_relative_uri(
                        &self.project,
                        &canonical,
                    )?)
                }
                None => None,
            };
            template_disks.push(codec::expand_template_disk(disk, resolved));
        }

        Ok(InstanceTemplate {
            name: config.name.clone(),
            description: config.description.clone(),
            self_link: None,
            properties: InstanceProperties {
                description: config.instance_description.clone(),
                // Templates are zone-agnostic, so the machine type stays a
                // bare name instead of a zonal path
                machine_type: Some(config.machine_type.clone()),
                min_cpu_platform: config.min_cpu_platform.clone(),
                can_ip_forward: config.can_ip_forward,
                disks: template_disks,
                metadata: Some(codec::expand_metadata(
                    &config.metadata,
                    config.metadata_startup_script.as_deref(),
                    None,
                )),
                network_interfaces: codec::expand_network_interfaces(
                    &config.network_interfaces,
                    &self.project,
                    &self.region,
                ),
                scheduling: Some(codec::expand_scheduling(config.scheduling.as_ref())),
                service_accounts: codec::expand_service_accounts(config.service_account.as_ref()),
                tags: Some(codec::expand_tags(&config.tags, None)),
                labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
                guest_accelerators: config
                    .guest_accelerators
                    .iter()
                    .filter(|accelerator| accelerator.count != 0)
                    .map(|accelerator| AcceleratorConfig {
                        accelerator_count: accelerator.count,
                        accelerator_type: accelerator.accelerator_type.clone(),
                    })
                    .collect(),
                shielded_instance_config: codec::expand_shielded_config(
                    config.shielded_instance_config.as_ref(),
                ),
            },
        })
    }

    /// Fetch the live template and flatten its properties to configuration
    /// shape, realigning the disk list against the prior configured order
    pub(crate) async fn template_state(
        &self,
        id: ResourceId,
        project: &str,
        name: &str,
        prior: Option<&HashMap<String, Value>>,
    ) -> ProviderResult<State> {
        let template = match self.api.get_instance_template(project, name).await {
            Ok(template) => template,
            Err(e) if e.is_not_found() => return Ok(State::not_found(id)),
            Err(e) => return Err(ProviderError::remote("reading instance template", e)),
        };

        // A prior that fails to parse only costs the disk realignment
        let prior_config = prior.and_then(|attrs| TemplateConfig::from_attributes(attrs).ok());
        let properties = template.properties;

        let mut attrs: HashMap<String, Value> = HashMap::new();
        attrs.insert("name".to_string(), Value::from(template.name.as_str()));
        put_str(&mut attrs, "description", template.description.as_deref());
        put_str(
            &mut attrs,
            "instance_description",
            properties.description.as_deref(),
        );
        if let Some(machine_type) = &properties.machine_type {
            attrs.insert(
                "machine_type".to_string(),
                Value::from(name_from_self_link(machine_type)),
            );
        }
        put_str(
            &mut attrs,
            "min_cpu_platform",
            properties.min_cpu_platform.as_deref(),
        );
        attrs.insert(
            "can_ip_forward".to_string(),
            Value::from(properties.can_ip_forward),
        );

        let script_declared = prior
            .and_then(|attrs| attrs.get("metadata_startup_script"))
            .and_then(Value::as_str)
            .is_some_and(|script| !script.is_empty());
        let (metadata, startup_script) =
            codec::flatten_metadata(properties.metadata.as_ref(), script_declared);
        if !metadata.is_empty() {
            attrs.insert(
                "metadata".to_string(),
                Value::Map(
                    metadata
                        .into_iter()
                        .map(|(k, v)| (k, Value::from(v)))
                        .collect(),
                ),
            );
        }
        if let Some(script) = startup_script {
            attrs.insert("metadata_startup_script".to_string(), Value::from(script));
        }

        let tags = codec::flatten_tags(properties.tags.as_ref());
        if !tags.is_empty() {
            attrs.insert(
                "tags".to_string(),
                Value::List(tags.into_iter().map(Value::from).collect()),
            );
        }
        if let Some(labels) = &properties.labels
            && !labels.is_empty()
        {
            attrs.insert(
                "labels".to_string(),
                Value::Map(
                    labels
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            );
        }

        let template_disks = match prior_config.as_ref() {
            Some(config) => disks::reorder_disks(&config.disks, properties.disks),
            None => properties.disks,
        };
        if !template_disks.is_empty() {
            attrs.insert(
                "disk".to_string(),
                codec::flatten_template_disks(&template_disks),
            );
        }

        if !properties.network_interfaces.is_empty() {
            attrs.insert(
                "network_interface".to_string(),
                codec::flatten_network_interfaces(&properties.network_interfaces),
            );
        }
        attrs.insert(
            "scheduling".to_string(),
            codec::flatten_scheduling(properties.scheduling.as_ref()),
        );
        if !properties.service_accounts.is_empty() {
            attrs.insert(
                "service_account".to_string(),
                codec::flatten_service_accounts(&properties.service_accounts),
            );
        }
        if !properties.guest_accelerators.is_empty() {
            attrs.insert(
                "guest_accelerator".to_string(),
                codec::flatten_guest_accelerators(&properties.guest_accelerators),
            );
        }
        if properties.shielded_instance_config.is_some() {
            attrs.insert(
                "shielded_instance_config".to_string(),
                codec::flatten_shielded_config(properties.shielded_instance_config.as_ref()),
            );
        }

        let identifier = template_identifier(project, &template.name);
        Ok(State::existing(id, attrs).with_identifier(identifier))
    }
}

fn put_str(attrs: &mut HashMap<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::from(value));
    }
}
