//! gce_instance create, read and delete
//!
//! Create expands the typed configuration into one insert request; read
//! fetches the live instance and flattens it back into configuration shape,
//! substituting write-only values from the prior state. In-place update is
//! orchestrated separately in `instance_update`.

use std::collections::HashMap;
use std::time::Duration;

use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::operation::wait_for_operation;
use crate::api::types::{DisplayDevice, Instance};
use crate::codec;
use crate::config::InstanceConfig;
use crate::image;
use crate::util::{machine_type_path, name_from_self_link, zone_to_region};

pub(crate) const INSTANCE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

pub(crate) fn instance_identifier(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{}/zones/{}/instances/{}", project, zone, name)
}

pub(crate) fn parse_instance_identifier(
    identifier: &str,
) -> ProviderResult<(String, String, String)> {
    let parts: Vec<&str> = identifier.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "zones", zone, "instances", name]
            if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
        {
            Ok((project.to_string(), zone.to_string(), name.to_string()))
        }
        _ => Err(ProviderError::invalid_input(
            "identifier",
            format!(
                "expected projects/{{project}}/zones/{{zone}}/instances/{{name}}, got {:?}",
                identifier
            ),
        )),
    }
}

impl GceProvider {
    pub(crate) async fn create_instance(&self, resource: &Resource) -> ProviderResult<State> {
        let config = InstanceConfig::from_resource(resource)?;
        if config.desired_status.as_deref() == Some("TERMINATED") {
            return Err(ProviderError::invalid_input(
                "desired_status",
                "only RUNNING is accepted when creating an instance",
            ));
        }

        let zone = config.zone.clone().unwrap_or_else(|| self.zone.clone());
        self.api
            .get_zone(&self.project, &zone)
            .await
            .map_err(|e| ProviderError::remote(format!("loading zone {:?}", zone), e))?;

        let instance = self.expand_instance(&config, &zone).await?;
        log::debug!("creating instance {} in {}", config.name, zone);
        let op = self
            .api
            .insert_instance(&self.project, &zone, &instance)
            .await
            .map_err(|e| ProviderError::remote("Creating Instance", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &self.project,
            op,
            "Creating Instance",
            INSTANCE_TIMEOUT,
        )
        .await?;

        self.instance_state(
            resource.id.clone(),
            &self.project,
            &zone,
            &config.name,
            Some(&resource.attributes),
        )
        .await
    }

    pub(crate) async fn read_instance(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> ProviderResult<State> {
        let (project, zone, name) = match identifier {
            Some(identifier) => parse_instance_identifier(identifier)?,
            None => {
                let zone = prior
                    .and_then(|state| state.get_str("zone"))
                    .unwrap_or(&self.zone)
                    .to_string();
                (self.project.clone(), zone, id.name.clone())
            }
        };
        self.instance_state(
            id.clone(),
            &project,
            &zone,
            &name,
            prior.map(|state| &state.attributes),
        )
        .await
    }

    pub(crate) async fn delete_instance(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        let (project, zone, name) = parse_instance_identifier(identifier)?;

        let instance = match self.api.get_instance(&project, &zone, &name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                log::debug!("instance {} already gone", id.name);
                return Ok(());
            }
            Err(e) => return Err(ProviderError::remote("reading instance", e)),
        };
        if instance.deletion_protection {
            return Err(ProviderError::invalid_input(
                "deletion_protection",
                format!(
                    "instance {} has deletion protection enabled; disable it and apply before deleting",
                    name
                ),
            ));
        }

        let op = self
            .api
            .delete_instance(&project, &zone, &name)
            .await
            .map_err(|e| ProviderError::remote("Deleting Instance", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Deleting Instance",
            INSTANCE_TIMEOUT,
        )
        .await
    }

    /// Build the full insert request from the typed configuration
    async fn expand_instance(
        &self,
        config: &InstanceConfig,
        zone: &str,
    ) -> ProviderResult<Instance> {
        let region = zone_to_region(zone)?;

        let boot_image = match config
            .boot_disk
            .initialize_params
            .as_ref()
            .and_then(|params| params.image.as_deref())
        {
            Some(name) => Some(image::resolve_image(self.api.as_ref(), &self.project, name).await?),
            None => None,
        };

        let mut disks = vec![codec::expand_boot_disk(
            &config.boot_disk,
            &self.project,
            zone,
            boot_image,
        )];
        disks.extend(codec::expand_scratch_disks(&config.scratch_disks, zone));
        disks.extend(
            config
                .attached_disks
                .iter()
                .map(|disk| codec::expand_attached_disk(disk, &self.project, zone)),
        );

        Ok(Instance {
            name: config.name.clone(),
            description: config.description.clone(),
            hostname: config.hostname.clone(),
            machine_type: Some(machine_type_path(zone, &config.machine_type)),
            min_cpu_platform: config.min_cpu_platform.clone(),
            can_ip_forward: config.can_ip_forward,
            deletion_protection: config.deletion_protection,
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            metadata: Some(codec::expand_metadata(
                &config.metadata,
                config.metadata_startup_script.as_deref(),
                None,
            )),
            tags: Some(codec::expand_tags(&config.tags, None)),
            disks,
            network_interfaces: codec::expand_network_interfaces(
                &config.network_interfaces,
                &self.project,
                &region,
            ),
            scheduling: Some(codec::expand_scheduling(config.scheduling.as_ref())),
            service_accounts: codec::expand_service_accounts(config.service_account.as_ref()),
            guest_accelerators: codec::expand_guest_accelerators(&config.guest_accelerators, zone),
            shielded_instance_config: codec::expand_shielded_config(
                config.shielded_instance_config.as_ref(),
            ),
            display_device: Some(DisplayDevice {
                enable_display: config.enable_display,
            }),
            reservation_affinity: codec::expand_reservation_affinity(
                config.reservation_affinity.as_ref(),
            ),
            advanced_machine_features: codec::expand_advanced_machine_features(
                config.advanced_machine_features.as_ref(),
            ),
            resource_policies: config.resource_policies.clone(),
            ..Instance::default()
        })
    }

    /// Fetch the live instance and flatten it to configuration shape.
    ///
    /// `prior` supplies values the service never returns (raw disk keys,
    /// whether the startup script was declared in its dedicated field) and
    /// configuration-only fields carried through reads untouched.
    pub(crate) async fn instance_state(
        &self,
        id: ResourceId,
        project: &str,
        zone: &str,
        name: &str,
        prior: Option<&HashMap<String, Value>>,
    ) -> ProviderResult<State> {
        let instance = match self.api.get_instance(project, zone, name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(State::not_found(id)),
            Err(e) => return Err(ProviderError::remote("reading instance", e)),
        };

        // A prior that fails to parse only costs write-only fields
        let prior_config = prior.and_then(|attrs| InstanceConfig::from_attributes(attrs).ok());

        let mut attrs: HashMap<String, Value> = HashMap::new();
        attrs.insert("name".to_string(), Value::from(instance.name.as_str()));
        attrs.insert(
            "zone".to_string(),
            Value::from(
                instance
                    .zone
                    .as_deref()
                    .map(name_from_self_link)
                    .unwrap_or(zone),
            ),
        );
        if let Some(machine_type) = &instance.machine_type {
            attrs.insert(
                "machine_type".to_string(),
                Value::from(name_from_self_link(machine_type)),
            );
        }
        put_str(&mut attrs, "description", instance.description.as_deref());
        put_str(&mut attrs, "hostname", instance.hostname.as_deref());
        put_str(
            &mut attrs,
            "min_cpu_platform",
            instance.min_cpu_platform.as_deref(),
        );
        put_str(&mut attrs, "cpu_platform", instance.cpu_platform.as_deref());
        attrs.insert(
            "can_ip_forward".to_string(),
            Value::from(instance.can_ip_forward),
        );
        attrs.insert(
            "deletion_protection".to_string(),
            Value::from(instance.deletion_protection),
        );
        put_str(&mut attrs, "instance_id", instance.id.as_deref());
        attrs.insert(
            "current_status".to_string(),
            Value::from(instance.status.as_str()),
        );
        if let Some(display) = &instance.display_device {
            attrs.insert(
                "enable_display".to_string(),
                Value::from(display.enable_display),
            );
        }
        if let Some(prior) = prior {
            for key in ["desired_status", "allow_stopping_for_update"] {
                if let Some(value) = prior.get(key) {
                    attrs.insert(key.to_string(), value.clone());
                }
            }
        }

        let script_declared = prior
            .and_then(|attrs| attrs.get("metadata_startup_script"))
            .and_then(Value::as_str)
            .is_some_and(|script| !script.is_empty());
        let (metadata, startup_script) =
            codec::flatten_metadata(instance.metadata.as_ref(), script_declared);
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

        let tags = codec::flatten_tags(instance.tags.as_ref());
        if !tags.is_empty() {
            attrs.insert(
                "tags".to_string(),
                Value::List(tags.into_iter().map(Value::from).collect()),
            );
        }
        if let Some(labels) = &instance.labels
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
        if !instance.resource_policies.is_empty() {
            attrs.insert(
                "resource_policies".to_string(),
                Value::List(
                    instance
                        .resource_policies
                        .iter()
                        .map(|policy| Value::from(policy.as_str()))
                        .collect(),
                ),
            );
        }

        let mut boot = None;
        let mut scratch = Vec::new();
        let mut attached = Vec::new();
        for disk in &instance.disks {
            if disk.boot {
                boot = Some(disk);
            } else if disk.type_.as_deref() == Some("SCRATCH") {
                scratch.push(disk.clone());
            } else {
                attached.push(disk.clone());
            }
        }
        if let Some(boot) = boot {
            let full = match boot.source.as_deref() {
                Some(source) => {
                    match self
                        .api
                        .get_disk(project, zone, name_from_self_link(source))
                        .await
                    {
                        Ok(disk) => Some(disk),
                        Err(e) => {
                            log::warn!("cannot retrieve boot disk details: {}", e);
                            None
                        }
                    }
                }
                None => None,
            };
            attrs.insert(
                "boot_disk".to_string(),
                codec::flatten_boot_disk(
                    boot,
                    full.as_ref(),
                    prior_config.as_ref().map(|config| &config.boot_disk),
                ),
            );
        }
        if !scratch.is_empty() {
            attrs.insert(
                "scratch_disk".to_string(),
                codec::flatten_scratch_disks(&scratch),
            );
        }
        if !attached.is_empty() {
            let prior_attached = prior_config
                .as_ref()
                .map(|config| config.attached_disks.as_slice())
                .unwrap_or_default();
            attrs.insert(
                "attached_disk".to_string(),
                codec::flatten_attached_disks(&attached, prior_attached),
            );
        }

        if !instance.network_interfaces.is_empty() {
            attrs.insert(
                "network_interface".to_string(),
                codec::flatten_network_interfaces(&instance.network_interfaces),
            );
        }
        attrs.insert(
            "scheduling".to_string(),
            codec::flatten_scheduling(instance.scheduling.as_ref()),
        );
        if !instance.service_accounts.is_empty() {
            attrs.insert(
                "service_account".to_string(),
                codec::flatten_service_accounts(&instance.service_accounts),
            );
        }
        if !instance.guest_accelerators.is_empty() {
            attrs.insert(
                "guest_accelerator".to_string(),
                codec::flatten_guest_accelerators(&instance.guest_accelerators),
            );
        }
        if instance.shielded_instance_config.is_some() {
            attrs.insert(
                "shielded_instance_config".to_string(),
                codec::flatten_shielded_config(instance.shielded_instance_config.as_ref()),
            );
        }
        if instance.reservation_affinity.is_some() {
            attrs.insert(
                "reservation_affinity".to_string(),
                codec::flatten_reservation_affinity(instance.reservation_affinity.as_ref()),
            );
        }
        if instance.advanced_machine_features.is_some() {
            attrs.insert(
                "advanced_machine_features".to_string(),
                codec::flatten_advanced_machine_features(
                    instance.advanced_machine_features.as_ref(),
                ),
            );
        }

        let identifier = instance_identifier(project, zone, &instance.name);
        Ok(State::existing(id, attrs).with_identifier(identifier))
    }
}

fn put_str(attrs: &mut HashMap<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::from(value));
    }
}
