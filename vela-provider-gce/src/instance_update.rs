//! gce_instance in-place update
//!
//! Orders the mutations an instance diff calls for: fingerprint-guarded
//! writes first, then everything a running instance accepts, and finally the
//! stop/mutate/restart window for fields the service only changes while the
//! instance is stopped. Any failure aborts the sequence where it stands;
//! already-applied changes are not rolled back.

use std::collections::{HashMap, HashSet};

use vela_core::differ::ChangeSet;
use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::client::ApiResult;
use crate::api::operation::wait_for_operation;
use crate::api::types::{
    AccessConfig, CustomerEncryptionKeyProtectedDisk, DisplayDevice, Instance, NetworkInterface,
    Operation,
};
use crate::codec;
use crate::config::{AccessConfigConfig, InstanceConfig, NetworkInterfaceConfig};
use crate::disks;
use crate::instance::{INSTANCE_TIMEOUT, parse_instance_identifier};
use crate::util::{disk_path, machine_type_path, network_path, relative_path, subnetwork_path};

/// Attempts at a fingerprint-guarded write before the conflict surfaces
pub(crate) const CONFLICT_RETRIES: usize = 3;

/// An interface move held back until the instance is stopped. The patch
/// fingerprint is filled in at execution time because stopping the instance
/// invalidates whatever fingerprint was current when the move was queued.
struct QueuedInterfaceUpdate {
    index: usize,
    interface_name: String,
    patch: NetworkInterface,
    /// Replacement access configs, present only when the configuration
    /// changed them
    access_configs: Option<Vec<AccessConfig>>,
}

impl GceProvider {
    pub(crate) async fn update_instance(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let (project, zone, name) = parse_instance_identifier(identifier)?;
        let desired = InstanceConfig::from_resource(to)?;
        let prior = InstanceConfig::from_attributes(&from.attributes)?;
        let region = crate::util::zone_to_region(&zone)?;

        let mut changes = ChangeSet::between(&from.attributes, &to.attributes);
        for field in ["name", "zone", "hostname"] {
            if changes.has_change(field) {
                changes.mark_force_new(field);
            }
        }
        mark_interface_replacements(
            &mut changes,
            &project,
            &region,
            &prior.network_interfaces,
            &desired.network_interfaces,
        );
        if changes.requires_replacement() {
            let fields: Vec<&str> = changes.force_new_attributes().collect();
            return Err(ProviderError::invalid_input(
                fields.join(", "),
                "cannot change in place; the instance must be replaced",
            ));
        }

        // Change detection over the typed configurations. Reference fields
        // compare in canonical form; an optional field left unset in the
        // desired configuration inherits the prior value.
        let metadata_changed = prior.metadata != desired.metadata
            || prior.metadata_startup_script != desired.metadata_startup_script;
        let tags_changed = prior.tags != desired.tags;
        let labels_changed = prior.labels != desired.labels;
        let policies_changed = canonical_policies(&prior.resource_policies)
            != canonical_policies(&desired.resource_policies);
        let scheduling_changed =
            codec::scheduling_changed(prior.scheduling.as_ref(), desired.scheduling.as_ref());
        let reboot_scheduling = codec::scheduling_requires_reboot(
            prior.scheduling.as_ref(),
            desired.scheduling.as_ref(),
        );
        let machine_type_changed = machine_type_path(&zone, &prior.machine_type)
            != machine_type_path(&zone, &desired.machine_type);
        let min_cpu_changed = !codec::min_cpu_platform_equal(
            prior.min_cpu_platform.as_deref().unwrap_or_default(),
            desired.min_cpu_platform.as_deref().unwrap_or_default(),
        );
        let (scopes_changed, email_changed) = service_account_changes(&prior, &desired);
        let display_changed = prior.enable_display != desired.enable_display;
        let shielded_changed = desired.shielded_instance_config.is_some()
            && prior.shielded_instance_config != desired.shielded_instance_config;
        let amf_changed = desired.advanced_machine_features.is_some()
            && prior.advanced_machine_features != desired.advanced_machine_features;
        let can_ip_forward_changed = prior.can_ip_forward != desired.can_ip_forward;
        let deletion_protection_changed =
            prior.deletion_protection != desired.deletion_protection;
        let status_changed =
            changed_opt(prior.desired_status.as_ref(), desired.desired_status.as_ref());
        let attached_disks_changed = prior.attached_disks != desired.attached_disks;

        let mut live = self.refetch_instance(&project, &zone, &name).await?;
        log::debug!("updating instance {} in {}", name, zone);

        if metadata_changed {
            let mut attempts = 0;
            loop {
                // Fetch the fingerprint fresh each attempt; simultaneous
                // writers roll it out from under us
                let current = self.refetch_instance(&project, &zone, &name).await?;
                let fingerprint = current.metadata.as_ref().and_then(|m| m.fingerprint.clone());
                let metadata = codec::expand_metadata(
                    &desired.metadata,
                    desired.metadata_startup_script.as_deref(),
                    fingerprint,
                );
                match self.api.set_metadata(&project, &zone, &name, &metadata).await {
                    Ok(op) => {
                        wait_for_operation(
                            self.api.as_ref(),
                            &project,
                            op,
                            "updating metadata",
                            INSTANCE_TIMEOUT,
                        )
                        .await?;
                        break;
                    }
                    Err(e) if e.is_conflict() => {
                        attempts += 1;
                        if attempts > CONFLICT_RETRIES {
                            return Err(ProviderError::conflict(
                                "instance metadata",
                                e.to_string(),
                            ));
                        }
                        log::debug!("metadata fingerprint for {} went stale, retrying", name);
                    }
                    Err(e) => return Err(ProviderError::remote("updating metadata", e)),
                }
            }
        }

        if tags_changed {
            let fingerprint = live.tags.as_ref().and_then(|t| t.fingerprint.clone());
            let tags = codec::expand_tags(&desired.tags, fingerprint);
            self.perform(
                &project,
                "updating tags",
                self.api.set_tags(&project, &zone, &name, &tags).await,
            )
            .await?;
        }

        if labels_changed {
            let fingerprint = live.label_fingerprint.clone().unwrap_or_default();
            self.perform(
                &project,
                "updating labels",
                self.api
                    .set_labels(&project, &zone, &name, &desired.labels, &fingerprint)
                    .await,
            )
            .await?;
        }

        if policies_changed {
            // The endpoint takes explicit lists, so clear whatever is live
            // before attaching the desired set
            if !live.resource_policies.is_empty() {
                let current = live.resource_policies.clone();
                self.perform(
                    &project,
                    "removing resource policies",
                    self.api
                        .remove_resource_policies(&project, &zone, &name, &current)
                        .await,
                )
                .await?;
            }
            if !desired.resource_policies.is_empty() {
                self.perform(
                    &project,
                    "adding resource policies",
                    self.api
                        .add_resource_policies(&project, &zone, &name, &desired.resource_policies)
                        .await,
                )
                .await?;
            }
        }

        if scheduling_changed && !reboot_scheduling {
            let merged =
                codec::merge_scheduling(prior.scheduling.as_ref(), desired.scheduling.as_ref());
            let scheduling = codec::expand_scheduling(Some(&merged));
            self.perform(
                &project,
                "updating scheduling",
                self.api.set_scheduling(&project, &zone, &name, &scheduling).await,
            )
            .await?;
        }

        let mut queued_interface_updates: Vec<QueuedInterfaceUpdate> = Vec::new();
        let interfaces_changed = prior.network_interfaces.len()
            != desired.network_interfaces.len()
            || prior
                .network_interfaces
                .iter()
                .zip(&desired.network_interfaces)
                .any(|(old, new)| {
                    interface_moved(&project, &region, old, new)
                        || changed_opt(old.network_ip.as_ref(), new.network_ip.as_ref())
                        || access_configs_changed(&old.access_configs, &new.access_configs)
                        || old.alias_ip_ranges != new.alias_ip_ranges
                });
        if interfaces_changed {
            let expanded =
                codec::expand_network_interfaces(&desired.network_interfaces, &project, &region);
            if expanded.len() != live.network_interfaces.len()
                || prior.network_interfaces.len() != live.network_interfaces.len()
            {
                return Err(ProviderError::invalid_input(
                    "network_interface",
                    format!(
                        "instance has {} network interfaces but the configuration declares {}; \
                         adding or removing interfaces requires replacing the instance",
                        live.network_interfaces.len(),
                        expanded.len()
                    ),
                ));
            }
            let recorded_names = recorded_interface_names(&from.attributes);

            for index in 0..expanded.len() {
                let old = &prior.network_interfaces[index];
                let new = &desired.network_interfaces[index];
                let mut live_nic = interface_at(&live, index)?;

                let nic_name = match recorded_names.get(index).and_then(|n| n.as_deref()) {
                    Some(recorded) => {
                        if live_nic.name.as_deref() != Some(recorded) {
                            return Err(ProviderError::invalid_input(
                                "network_interface",
                                format!(
                                    "interface {} is named {:?} on the instance, expected {}",
                                    index, live_nic.name, recorded
                                ),
                            ));
                        }
                        recorded.to_string()
                    }
                    None => live_nic.name.clone().ok_or_else(|| {
                        ProviderError::invalid_input(
                            "network_interface",
                            format!("interface {} carries no name on the instance", index),
                        )
                    })?,
                };

                let moved = interface_moved(&project, &region, old, new);
                let access_changed =
                    access_configs_changed(&old.access_configs, &new.access_configs);
                let alias_changed = old.alias_ip_ranges != new.alias_ip_ranges;
                let mut desired_nic = expanded[index].clone();

                // A configuration that names only the subnetwork leaves the
                // owning network implied; resolve it so the move names both
                if subnetwork_changed(&project, &region, old, new)
                    && !network_changed(&project, old, new)
                {
                    let link = desired_nic.subnetwork.clone().unwrap_or_default();
                    let (owner, sub_region, sub_name) =
                        subnetwork_components(&link).ok_or_else(|| {
                            ProviderError::invalid_input(
                                "network_interface",
                                format!("cannot parse subnetwork reference {:?}", link),
                            )
                        })?;
                    let subnet = self
                        .api
                        .get_subnetwork(&owner, &sub_region, &sub_name)
                        .await
                        .map_err(|e| ProviderError::remote("reading subnetwork", e))?;
                    desired_nic.network = subnet.network.clone();
                }

                if access_changed && !moved {
                    // The service allows one access config per interface, so
                    // replacement means delete everything live, then add
                    for access in &live_nic.access_configs {
                        let Some(access_name) = access.name.as_deref() else {
                            continue;
                        };
                        self.perform(
                            &project,
                            "deleting access config",
                            self.api
                                .delete_access_config(
                                    &project, &zone, &name, &nic_name, access_name,
                                )
                                .await,
                        )
                        .await?;
                    }
                    for access in &desired_nic.access_configs {
                        self.perform(
                            &project,
                            "adding access config",
                            self.api
                                .add_access_config(&project, &zone, &name, &nic_name, access)
                                .await,
                        )
                        .await?;
                    }
                    live = self.refetch_instance(&project, &zone, &name).await?;
                    live_nic = interface_at(&live, index)?;
                }

                if alias_changed && !moved {
                    // Ranges cannot be edited in place: clear the live set
                    // with a fingerprinted empty patch, then apply the new one
                    if !live_nic.alias_ip_ranges.is_empty() {
                        let reset = NetworkInterface {
                            fingerprint: live_nic.fingerprint.clone(),
                            ..NetworkInterface::default()
                        };
                        self.perform(
                            &project,
                            "clearing alias IP ranges",
                            self.api
                                .update_network_interface(
                                    &project, &zone, &name, &nic_name, &reset,
                                )
                                .await,
                        )
                        .await?;
                        live = self.refetch_instance(&project, &zone, &name).await?;
                        live_nic = interface_at(&live, index)?;
                    }
                    let patch = NetworkInterface {
                        alias_ip_ranges: desired_nic.alias_ip_ranges.clone(),
                        fingerprint: live_nic.fingerprint.clone(),
                        ..NetworkInterface::default()
                    };
                    self.perform(
                        &project,
                        "updating alias IP ranges",
                        self.api
                            .update_network_interface(&project, &zone, &name, &nic_name, &patch)
                            .await,
                    )
                    .await?;
                }

                if moved {
                    let mut patch = NetworkInterface {
                        network: desired_nic.network.clone(),
                        subnetwork: desired_nic.subnetwork.clone(),
                        alias_ip_ranges: desired_nic.alias_ip_ranges.clone(),
                        ..NetworkInterface::default()
                    };
                    // The address is patched only on explicit change; a
                    // carried-over address may not fit the new subnetwork
                    if changed_opt(old.network_ip.as_ref(), new.network_ip.as_ref()) {
                        patch.network_ip = desired_nic.network_ip.clone();
                    }
                    queued_interface_updates.push(QueuedInterfaceUpdate {
                        index,
                        interface_name: nic_name,
                        patch,
                        access_configs: access_changed
                            .then(|| desired_nic.access_configs.clone()),
                    });
                }
            }
        }

        if attached_disks_changed {
            let currently_attached: HashSet<String> = live
                .disks
                .iter()
                .filter(|disk| !disk.boot && disk.type_.as_deref() != Some("SCRATCH"))
                .filter_map(|disk| disk.device_name.clone())
                .collect();
            let prior_disks: Vec<_> = prior
                .attached_disks
                .iter()
                .map(|disk| codec::expand_attached_disk(disk, &project, &zone))
                .collect();
            let desired_disks: Vec<_> = desired
                .attached_disks
                .iter()
                .map(|disk| codec::expand_attached_disk(disk, &project, &zone))
                .collect();
            let diff = disks::diff_attached_disks(&prior_disks, &desired_disks, &currently_attached)?;
            for device_name in &diff.detach_device_names {
                self.perform(
                    &project,
                    "detaching disk",
                    self.api.detach_disk(&project, &zone, &name, device_name).await,
                )
                .await?;
            }
            for disk in &diff.attach {
                self.perform(
                    &project,
                    "attaching disk",
                    self.api.attach_disk(&project, &zone, &name, disk).await,
                )
                .await?;
            }
        }

        if deletion_protection_changed {
            self.perform(
                &project,
                "updating deletion protection",
                self.api
                    .set_deletion_protection(&project, &zone, &name, desired.deletion_protection)
                    .await,
            )
            .await?;
        }

        if can_ip_forward_changed {
            // No dedicated setter; round-trip the whole resource
            let mut attempts = 0;
            loop {
                let mut current = self.refetch_instance(&project, &zone, &name).await?;
                current.can_ip_forward = desired.can_ip_forward;
                match self.api.update_instance(&project, &zone, &name, &current).await {
                    Ok(op) => {
                        wait_for_operation(
                            self.api.as_ref(),
                            &project,
                            op,
                            "updating can_ip_forward",
                            INSTANCE_TIMEOUT,
                        )
                        .await?;
                        break;
                    }
                    Err(e) if e.is_conflict() => {
                        attempts += 1;
                        if attempts > CONFLICT_RETRIES {
                            return Err(ProviderError::conflict("instance", e.to_string()));
                        }
                    }
                    Err(e) => return Err(ProviderError::remote("updating can_ip_forward", e)),
                }
            }
        }

        let mut stop_fields: Vec<&str> = Vec::new();
        if scopes_changed || email_changed {
            stop_fields.push("service_account");
        }
        if machine_type_changed {
            stop_fields.push("machine_type");
        }
        if min_cpu_changed {
            stop_fields.push("min_cpu_platform");
        }
        if display_changed {
            stop_fields.push("enable_display");
        }
        if shielded_changed {
            stop_fields.push("shielded_instance_config");
        }
        if !queued_interface_updates.is_empty() {
            stop_fields.push("network_interface");
        }
        if reboot_scheduling {
            stop_fields.push("scheduling.node_affinities");
        }
        if amf_changed {
            stop_fields.push("advanced_machine_features");
        }

        if status_changed
            && stop_fields.is_empty()
            && let Some(status) = desired.desired_status.as_deref()
        {
            let op = match status {
                "RUNNING" => {
                    self.start_instance_operation(&project, &zone, &name, &desired, &prior)
                        .await?
                }
                _ => self
                    .api
                    .stop_instance(&project, &zone, &name)
                    .await
                    .map_err(|e| ProviderError::remote("stopping instance", e))?,
            };
            wait_for_operation(
                self.api.as_ref(),
                &project,
                op,
                "updating instance status",
                INSTANCE_TIMEOUT,
            )
            .await?;
        }

        if !stop_fields.is_empty() {
            let status_before = live.status.clone();
            let desired_status = desired.desired_status.as_deref().unwrap_or_default();

            if status_before == "RUNNING"
                && desired_status != "TERMINATED"
                && !desired.allow_stopping_for_update
            {
                return Err(ProviderError::requires_stop(stop_fields.join(", ")));
            }

            if status_before != "TERMINATED" {
                self.perform(
                    &project,
                    "stopping instance",
                    self.api.stop_instance(&project, &zone, &name).await,
                )
                .await?;
            }

            if min_cpu_changed {
                // An empty platform resets the field
                let platform = desired.min_cpu_platform.clone().unwrap_or_default();
                self.perform(
                    &project,
                    "updating minimum CPU platform",
                    self.api
                        .set_min_cpu_platform(&project, &zone, &name, &platform)
                        .await,
                )
                .await?;
            }

            if machine_type_changed {
                let machine_type = machine_type_path(&zone, &desired.machine_type);
                self.perform(
                    &project,
                    "updating machine type",
                    self.api
                        .set_machine_type(&project, &zone, &name, &machine_type)
                        .await,
                )
                .await?;
            }

            if scopes_changed || email_changed {
                let (email, scopes) = match &desired.service_account {
                    Some(account) => (
                        account
                            .email
                            .clone()
                            .or_else(|| {
                                prior.service_account.as_ref().and_then(|a| a.email.clone())
                            })
                            .unwrap_or_default(),
                        account
                            .scopes
                            .iter()
                            .map(|scope| codec::canonicalize_scope(scope))
                            .collect(),
                    ),
                    // A removed block clears the account
                    None => (String::new(), Vec::new()),
                };
                self.perform(
                    &project,
                    "updating service account",
                    self.api
                        .set_service_account(&project, &zone, &name, &email, &scopes)
                        .await,
                )
                .await?;
            }

            if display_changed {
                let device = DisplayDevice {
                    enable_display: desired.enable_display,
                };
                self.perform(
                    &project,
                    "updating display device",
                    self.api.update_display_device(&project, &zone, &name, &device).await,
                )
                .await?;
            }

            if shielded_changed
                && let Some(config) =
                    codec::expand_shielded_config(desired.shielded_instance_config.as_ref())
            {
                self.perform(
                    &project,
                    "updating shielded instance config",
                    self.api
                        .set_shielded_instance_config(&project, &zone, &name, &config)
                        .await,
                )
                .await?;
            }

            if reboot_scheduling {
                let merged =
                    codec::merge_scheduling(prior.scheduling.as_ref(), desired.scheduling.as_ref());
                let scheduling = codec::expand_scheduling(Some(&merged));
                self.perform(
                    &project,
                    "updating scheduling",
                    self.api.set_scheduling(&project, &zone, &name, &scheduling).await,
                )
                .await?;
            }

            if amf_changed {
                let mut attempts = 0;
                loop {
                    let mut current = self.refetch_instance(&project, &zone, &name).await?;
                    current.advanced_machine_features = codec::expand_advanced_machine_features(
                        desired.advanced_machine_features.as_ref(),
                    );
                    match self.api.update_instance(&project, &zone, &name, &current).await {
                        Ok(op) => {
                            wait_for_operation(
                                self.api.as_ref(),
                                &project,
                                op,
                                "updating advanced machine features",
                                INSTANCE_TIMEOUT,
                            )
                            .await?;
                            break;
                        }
                        Err(e) if e.is_conflict() => {
                            attempts += 1;
                            if attempts > CONFLICT_RETRIES {
                                return Err(ProviderError::conflict("instance", e.to_string()));
                            }
                        }
                        Err(e) => {
                            return Err(ProviderError::remote(
                                "updating advanced machine features",
                                e,
                            ));
                        }
                    }
                }
            }

            if !queued_interface_updates.is_empty() {
                // Stopping the instance rolled the interface fingerprints
                let current = self.refetch_instance(&project, &zone, &name).await?;
                for update in &queued_interface_updates {
                    self.apply_queued_interface_update(&project, &zone, &name, &current, update)
                        .await?;
                }
            }

            if (status_before == "RUNNING" && desired_status != "TERMINATED")
                || (status_before == "TERMINATED" && desired_status == "RUNNING")
            {
                let op = self
                    .start_instance_operation(&project, &zone, &name, &desired, &prior)
                    .await?;
                wait_for_operation(
                    self.api.as_ref(),
                    &project,
                    op,
                    "starting instance",
                    INSTANCE_TIMEOUT,
                )
                .await?;
            }
        }

        self.instance_state(id.clone(), &project, &zone, &name, Some(&to.attributes))
            .await
    }

    /// Issue one mutating call and wait out the operation it returns
    async fn perform(
        &self,
        project: &str,
        what: &str,
        call: ApiResult<Operation>,
    ) -> ProviderResult<()> {
        let op = call.map_err(|e| ProviderError::remote(what, e))?;
        wait_for_operation(self.api.as_ref(), project, op, what, INSTANCE_TIMEOUT).await
    }

    async fn refetch_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ProviderResult<Instance> {
        match self.api.get_instance(project, zone, name).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => {
                Err(ProviderError::not_found(format!("instance {}", name)))
            }
            Err(e) => Err(ProviderError::remote("reading instance", e)),
        }
    }

    async fn apply_queued_interface_update(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        live: &Instance,
        update: &QueuedInterfaceUpdate,
    ) -> ProviderResult<()> {
        let live_nic = interface_at(live, update.index)?;
        if update.access_configs.is_some() {
            for access in &live_nic.access_configs {
                let Some(access_name) = access.name.as_deref() else {
                    continue;
                };
                self.perform(
                    project,
                    "deleting access config",
                    self.api
                        .delete_access_config(
                            project,
                            zone,
                            name,
                            &update.interface_name,
                            access_name,
                        )
                        .await,
                )
                .await?;
            }
        }
        let mut patch = update.patch.clone();
        patch.fingerprint = live_nic.fingerprint.clone();
        self.perform(
            project,
            "updating network interface",
            self.api
                .update_network_interface(project, zone, name, &update.interface_name, &patch)
                .await,
        )
        .await?;
        if let Some(access_configs) = &update.access_configs {
            for access in access_configs {
                self.perform(
                    project,
                    "adding access config",
                    self.api
                        .add_access_config(project, zone, name, &update.interface_name, access)
                        .await,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Build the start call, attaching customer keys when any configured
    /// disk carries one
    async fn start_instance_operation(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        desired: &InstanceConfig,
        prior: &InstanceConfig,
    ) -> ProviderResult<Operation> {
        let mut boot = codec::expand_boot_disk(&desired.boot_disk, project, zone, None);
        if boot.source.is_none() {
            // The created disk's path only ever lives in the prior state
            boot.source = prior
                .boot_disk
                .source
                .as_ref()
                .map(|source| disk_path(project, zone, source));
        }
        let mut all_disks = vec![boot];
        all_disks.extend(
            desired
                .attached_disks
                .iter()
                .map(|disk| codec::expand_attached_disk(disk, project, zone)),
        );
        let protected: Vec<CustomerEncryptionKeyProtectedDisk> = all_disks
            .iter()
            .filter(|disk| disk.disk_encryption_key.is_some())
            .map(|disk| CustomerEncryptionKeyProtectedDisk {
                disk_encryption_key: disk.disk_encryption_key.clone(),
                source: disk.source.clone(),
            })
            .collect();
        let call = if protected.is_empty() {
            self.api.start_instance(project, zone, name).await
        } else {
            self.api
                .start_instance_with_encryption_keys(project, zone, name, &protected)
                .await
        };
        call.map_err(|e| ProviderError::remote("starting instance", e))
    }
}

/// Flag address changes that cannot be applied in place. An address can only
/// move together with its interface; changing it while the interface stays on
/// the same network and subnetwork requires a new instance.
pub(crate) fn mark_interface_replacements(
    changes: &mut ChangeSet,
    project: &str,
    region: &str,
    prior: &[NetworkInterfaceConfig],
    desired: &[NetworkInterfaceConfig],
) {
    for (index, (old, new)) in prior.iter().zip(desired).enumerate() {
        if !changed_opt(old.network_ip.as_ref(), new.network_ip.as_ref()) {
            continue;
        }
        if !interface_moved(project, region, old, new) {
            changes.mark_force_new(format!("network_interface.{}.network_ip", index));
        }
    }
}

/// Optional fields inherit the prior value when the desired configuration
/// leaves them unset, so absence never reads as a change.
fn changed_opt<T: PartialEq>(old: Option<&T>, new: Option<&T>) -> bool {
    match new {
        None => false,
        Some(value) => old != Some(value),
    }
}

fn network_changed(project: &str, old: &NetworkInterfaceConfig, new: &NetworkInterfaceConfig) -> bool {
    match new.network.as_deref() {
        None => false,
        Some(value) => {
            old.network.as_deref().map(|o| network_path(project, o))
                != Some(network_path(project, value))
        }
    }
}

fn subnetwork_changed(
    project: &str,
    region: &str,
    old: &NetworkInterfaceConfig,
    new: &NetworkInterfaceConfig,
) -> bool {
    let canon = |nic: &NetworkInterfaceConfig, value: &str| {
        let owner = nic.subnetwork_project.as_deref().unwrap_or(project);
        subnetwork_path(owner, region, value)
    };
    match new.subnetwork.as_deref() {
        None => false,
        Some(value) => {
            old.subnetwork.as_deref().map(|o| canon(old, o)) != Some(canon(new, value))
        }
    }
}

fn interface_moved(
    project: &str,
    region: &str,
    old: &NetworkInterfaceConfig,
    new: &NetworkInterfaceConfig,
) -> bool {
    network_changed(project, old, new)
        || subnetwork_changed(project, region, old, new)
        || changed_opt(old.subnetwork_project.as_ref(), new.subnetwork_project.as_ref())
}

fn access_configs_changed(old: &[AccessConfigConfig], new: &[AccessConfigConfig]) -> bool {
    old.len() != new.len()
        || old.iter().zip(new).any(|(o, n)| {
            changed_opt(o.nat_ip.as_ref(), n.nat_ip.as_ref())
                || changed_opt(o.network_tier.as_ref(), n.network_tier.as_ref())
                || changed_opt(
                    o.public_ptr_domain_name.as_ref(),
                    n.public_ptr_domain_name.as_ref(),
                )
        })
}

/// Scope changes compare as canonicalized sets; adding or dropping the block
/// counts as a scope change
fn service_account_changes(prior: &InstanceConfig, desired: &InstanceConfig) -> (bool, bool) {
    let scopes = match (&prior.service_account, &desired.service_account) {
        (None, None) => false,
        (Some(old), Some(new)) => !codec::scopes_equal(&old.scopes, &new.scopes),
        _ => true,
    };
    let email = match (&prior.service_account, &desired.service_account) {
        (Some(old), Some(new)) => changed_opt(old.email.as_ref(), new.email.as_ref()),
        _ => false,
    };
    (scopes, email)
}

fn canonical_policies(policies: &[String]) -> Vec<String> {
    policies.iter().map(|policy| relative_path(policy)).collect()
}

/// Interface names recorded at the last read, used to catch out-of-band
/// renumbering before patching by position
fn recorded_interface_names(attrs: &HashMap<String, Value>) -> Vec<Option<String>> {
    attrs
        .get("network_interface")
        .and_then(Value::as_list)
        .map(|interfaces| {
            interfaces
                .iter()
                .map(|block| {
                    block
                        .as_map()
                        .and_then(|map| map.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn interface_at(instance: &Instance, index: usize) -> ProviderResult<NetworkInterface> {
    instance.network_interfaces.get(index).cloned().ok_or_else(|| {
        ProviderError::invalid_input(
            "network_interface",
            format!("interface {} is missing from the instance", index),
        )
    })
}

fn subnetwork_components(link: &str) -> Option<(String, String, String)> {
    let relative = relative_path(link);
    let parts: Vec<&str> = relative.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "regions", region, "subnetworks", name] => Some((
            project.to_string(),
            region.to_string(),
            name.to_string(),
        )),
        _ => None,
    }
}
