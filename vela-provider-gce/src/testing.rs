//! In-memory fake of the compute service
//!
//! Backs every `ComputeApi` call with a `Mutex`-guarded map of resources and
//! records each call in an ordered log so tests can assert on request
//! sequencing. Mutating calls return operations that are already DONE, and
//! operation polls complete on the first refresh, so waits finish without
//! real delays. `fail_next` queues an error for a method's next invocation
//! (the call is still logged), which is how conflict-retry paths are tested.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::api::client::{ApiError, ApiResult, ComputeApi};
use crate::api::types::{
    AccessConfig, AttachedDisk, CustomerEncryptionKeyProtectedDisk, Disk, DisplayDevice, Image,
    Instance, InstanceTemplate, Metadata, NetworkInterface, Operation, Project, Router,
    RouterPatch, Scheduling, ServiceAccount, ShieldedInstanceConfig, Subnetwork, Tags, Zone,
};

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    fail: HashMap<String, VecDeque<ApiError>>,
    instances: HashMap<String, Instance>,
    disks: HashMap<String, Disk>,
    images: HashMap<String, Image>,
    families: HashMap<String, Image>,
    templates: HashMap<String, InstanceTemplate>,
    routers: HashMap<String, Router>,
    projects: HashMap<String, Project>,
    subnetworks: HashMap<String, Subnetwork>,
    missing_zones: Vec<String>,
    stalled_ops: Vec<String>,
    counter: u64,
}

impl FakeState {
    fn next_op(&mut self) -> Operation {
        self.counter += 1;
        Operation {
            name: format!("op-{}", self.counter),
            status: "DONE".to_string(),
            ..Default::default()
        }
    }

    fn poll_result(&self, name: &str) -> Operation {
        let status = if self.stalled_ops.iter().any(|n| n == name) {
            "RUNNING"
        } else {
            "DONE"
        };
        Operation {
            name: name.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn next_fingerprint(&mut self) -> String {
        self.counter += 1;
        format!("fp-{}", self.counter)
    }
}

pub(crate) struct FakeCompute {
    state: Mutex<FakeState>,
}

/// A provider over the given fake, with the project/region/zone every test
/// in this crate assumes: proj, us-central1, us-central1-a
pub(crate) fn provider_with(api: FakeCompute) -> (std::sync::Arc<FakeCompute>, crate::GceProvider) {
    let api = std::sync::Arc::new(api);
    let provider = crate::GceProvider::new(api.clone(), "proj", "us-central1", "us-central1-a");
    (api, provider)
}

fn instance_key(project: &str, zone: &str, name: &str) -> String {
    format!("{}/{}/{}", project, zone, name)
}

impl FakeCompute {
    pub fn new() -> Self {
        FakeCompute {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Log the call and pop any queued failure for its method
    fn begin(&self, call: String) -> ApiResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        let method = call.split(' ').next().unwrap_or_default().to_string();
        state.calls.push(call);
        if let Some(queue) = state.fail.get_mut(&method)
            && let Some(err) = queue.pop_front()
        {
            return Err(err);
        }
        Ok(state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn fail_next(&self, method: &str, err: ApiError) {
        self.state
            .lock()
            .unwrap()
            .fail
            .entry(method.to_string())
            .or_default()
            .push_back(err);
    }

    /// Keep the named operation RUNNING on every poll
    pub fn stall_operation(&self, name: &str) {
        self.state.lock().unwrap().stalled_ops.push(name.to_string());
    }

    pub fn put_instance(&self, project: &str, zone: &str, instance: Instance) {
        let mut state = self.state.lock().unwrap();
        let key = instance_key(project, zone, &instance.name);
        state.instances.insert(key, instance);
    }

    pub fn instance(&self, project: &str, zone: &str, name: &str) -> Option<Instance> {
        let state = self.state.lock().unwrap();
        state.instances.get(&instance_key(project, zone, name)).cloned()
    }

    pub fn put_disk(&self, project: &str, zone: &str, disk: Disk) {
        let mut state = self.state.lock().unwrap();
        let key = instance_key(project, zone, &disk.name);
        state.disks.insert(key, disk);
    }

    pub fn disk(&self, project: &str, zone: &str, name: &str) -> Option<Disk> {
        let state = self.state.lock().unwrap();
        state.disks.get(&instance_key(project, zone, name)).cloned()
    }

    pub fn add_image(&self, project: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let image = Image {
            name: name.to_string(),
            self_link: Some(format!(
                "https://www.googleapis.com/compute/v1/projects/{}/global/images/{}",
                project, name
            )),
            ..Default::default()
        };
        state.images.insert(format!("{}/{}", project, name), image);
    }

    pub fn add_family(&self, project: &str, family: &str, image_name: &str) {
        let mut state = self.state.lock().unwrap();
        let image = Image {
            name: image_name.to_string(),
            family: Some(family.to_string()),
            self_link: Some(format!(
                "https://www.googleapis.com/compute/v1/projects/{}/global/images/{}",
                project, image_name
            )),
            ..Default::default()
        };
        state.families.insert(format!("{}/{}", project, family), image);
    }

    pub fn put_template(&self, project: &str, template: InstanceTemplate) {
        let mut state = self.state.lock().unwrap();
        let key = format!("{}/{}", project, template.name);
        state.templates.insert(key, template);
    }

    pub fn template(&self, project: &str, name: &str) -> Option<InstanceTemplate> {
        let state = self.state.lock().unwrap();
        state.templates.get(&format!("{}/{}", project, name)).cloned()
    }

    pub fn put_router(&self, project: &str, region: &str, router: Router) {
        let mut state = self.state.lock().unwrap();
        let key = format!("{}/{}/{}", project, region, router.name);
        state.routers.insert(key, router);
    }

    pub fn router(&self, project: &str, region: &str, name: &str) -> Option<Router> {
        let state = self.state.lock().unwrap();
        state
            .routers
            .get(&format!("{}/{}/{}", project, region, name))
            .cloned()
    }

    pub fn put_project(&self, project: Project) {
        let mut state = self.state.lock().unwrap();
        state.projects.insert(project.name.clone(), project);
    }

    pub fn project(&self, name: &str) -> Option<Project> {
        self.state.lock().unwrap().projects.get(name).cloned()
    }

    pub fn put_subnetwork(&self, project: &str, region: &str, subnetwork: Subnetwork) {
        let mut state = self.state.lock().unwrap();
        let key = format!("{}/{}/{}", project, region, subnetwork.name);
        state.subnetworks.insert(key, subnetwork);
    }

    pub fn remove_zone(&self, project: &str, zone: &str) {
        let mut state = self.state.lock().unwrap();
        state.missing_zones.push(format!("{}/{}", project, zone));
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Instance> {
        let state = self.begin(format!("get_instance {} {} {}", project, zone, name))?;
        state
            .instances
            .get(&instance_key(project, zone, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("instance {}", name)))
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> ApiResult<Operation> {
        let mut state =
            self.begin(format!("insert_instance {} {} {}", project, zone, instance.name))?;
        let mut stored = instance.clone();
        if stored.status.is_empty() {
            stored.status = "RUNNING".to_string();
        }
        stored.id.get_or_insert_with(|| {
            format!("90{}", state.counter)
        });
        stored.self_link.get_or_insert_with(|| {
            format!(
                "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instances/{}",
                project, zone, instance.name
            )
        });
        stored.label_fingerprint.get_or_insert_with(|| "fp-0".to_string());
        if let Some(metadata) = &mut stored.metadata {
            metadata.fingerprint.get_or_insert_with(|| "fp-0".to_string());
        }
        if let Some(tags) = &mut stored.tags {
            tags.fingerprint.get_or_insert_with(|| "fp-0".to_string());
        }
        for (i, interface) in stored.network_interfaces.iter_mut().enumerate() {
            interface.name.get_or_insert_with(|| format!("nic{}", i));
            interface.fingerprint.get_or_insert_with(|| "fp-0".to_string());
            for access in &mut interface.access_configs {
                access.name.get_or_insert_with(|| "external-nat".to_string());
            }
        }
        for (i, disk) in stored.disks.iter_mut().enumerate() {
            disk.device_name
                .get_or_insert_with(|| format!("persistent-disk-{}", i));
        }
        state
            .instances
            .insert(instance_key(project, zone, &instance.name), stored);
        Ok(state.next_op())
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation> {
        let mut state = self.begin(format!("delete_instance {} {} {}", project, zone, name))?;
        if state.instances.remove(&instance_key(project, zone, name)).is_none() {
            return Err(ApiError::NotFound(format!("instance {}", name)));
        }
        Ok(state.next_op())
    }

    async fn start_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation> {
        let mut state = self.begin(format!("start_instance {} {} {}", project, zone, name))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.status = "RUNNING".to_string(),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn start_instance_with_encryption_keys(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        _disks: &[CustomerEncryptionKeyProtectedDisk],
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "start_instance_with_encryption_keys {} {} {}",
            project, zone, name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.status = "RUNNING".to_string(),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation> {
        let mut state = self.begin(format!("stop_instance {} {} {}", project, zone, name))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.status = "TERMINATED".to_string(),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn update_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        instance: &Instance,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("update_instance {} {} {}", project, zone, name))?;
        let key = instance_key(project, zone, name);
        let prior = state
            .instances
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("instance {}", name)))?;
        let mut updated = instance.clone();
        if updated.status.is_empty() {
            updated.status = prior.status;
        }
        if updated.self_link.is_none() {
            updated.self_link = prior.self_link;
        }
        if updated.id.is_none() {
            updated.id = prior.id;
        }
        state.instances.insert(key, updated);
        Ok(state.next_op())
    }

    async fn set_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_metadata {} {} {}", project, zone, name))?;
        let fingerprint = state.next_fingerprint();
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance.metadata = Some(Metadata {
                    fingerprint: Some(fingerprint),
                    items: metadata.items.clone(),
                });
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_tags(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        tags: &Tags,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_tags {} {} {}", project, zone, name))?;
        let fingerprint = state.next_fingerprint();
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance.tags = Some(Tags {
                    fingerprint: Some(fingerprint),
                    items: tags.items.clone(),
                });
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        _label_fingerprint: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_labels {} {} {}", project, zone, name))?;
        let fingerprint = state.next_fingerprint();
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance.labels = Some(labels.clone());
                instance.label_fingerprint = Some(fingerprint);
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_machine_type(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        machine_type: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "set_machine_type {} {} {} {}",
            project, zone, name, machine_type
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.machine_type = Some(machine_type.to_string()),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_min_cpu_platform(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        min_cpu_platform: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "set_min_cpu_platform {} {} {} {}",
            project, zone, name, min_cpu_platform
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance.min_cpu_platform = if min_cpu_platform.is_empty() {
                    None
                } else {
                    Some(min_cpu_platform.to_string())
                };
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_scheduling(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        scheduling: &Scheduling,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_scheduling {} {} {}", project, zone, name))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.scheduling = Some(scheduling.clone()),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_service_account(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        email: &str,
        scopes: &[String],
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "set_service_account {} {} {} {}",
            project, zone, name, email
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                if email.is_empty() && scopes.is_empty() {
                    instance.service_accounts = Vec::new();
                } else {
                    instance.service_accounts = vec![ServiceAccount {
                        email: email.to_string(),
                        scopes: scopes.to_vec(),
                    }];
                }
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_shielded_instance_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        config: &ShieldedInstanceConfig,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "set_shielded_instance_config {} {} {}",
            project, zone, name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.shielded_instance_config = Some(config.clone()),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn update_display_device(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        device: &DisplayDevice,
    ) -> ApiResult<Operation> {
        let mut state =
            self.begin(format!("update_display_device {} {} {}", project, zone, name))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.display_device = Some(device.clone()),
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_deletion_protection(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        enabled: bool,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "set_deletion_protection {} {} {} {}",
            project, zone, name, enabled
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => instance.deletion_protection = enabled,
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn update_network_interface(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        interface: &NetworkInterface,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "update_network_interface {} {} {} {}",
            project, zone, name, interface_name
        ))?;
        let fingerprint = state.next_fingerprint();
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                let slot = instance
                    .network_interfaces
                    .iter_mut()
                    .find(|i| i.name.as_deref() == Some(interface_name))
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("network interface {}", interface_name))
                    })?;
                // Patch semantics: unset reference fields keep their current
                // value, alias ranges replace wholesale (an empty list clears)
                if interface.network.is_some() {
                    slot.network = interface.network.clone();
                }
                if interface.subnetwork.is_some() {
                    slot.subnetwork = interface.subnetwork.clone();
                }
                if interface.network_ip.is_some() {
                    slot.network_ip = interface.network_ip.clone();
                }
                if !interface.access_configs.is_empty() {
                    slot.access_configs = interface.access_configs.clone();
                }
                slot.alias_ip_ranges = interface.alias_ip_ranges.clone();
                slot.fingerprint = Some(fingerprint);
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn add_access_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        config: &AccessConfig,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "add_access_config {} {} {} {}",
            project, zone, name, interface_name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                let slot = instance
                    .network_interfaces
                    .iter_mut()
                    .find(|i| i.name.as_deref() == Some(interface_name))
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("network interface {}", interface_name))
                    })?;
                let mut config = config.clone();
                config.name.get_or_insert_with(|| "external-nat".to_string());
                slot.access_configs.push(config);
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn delete_access_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        access_config_name: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "delete_access_config {} {} {} {} {}",
            project, zone, name, interface_name, access_config_name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                let slot = instance
                    .network_interfaces
                    .iter_mut()
                    .find(|i| i.name.as_deref() == Some(interface_name))
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("network interface {}", interface_name))
                    })?;
                slot.access_configs
                    .retain(|c| c.name.as_deref() != Some(access_config_name));
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn attach_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        disk: &AttachedDisk,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "attach_disk {} {} {} {}",
            project,
            zone,
            name,
            disk.source.as_deref().unwrap_or_default()
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                let mut disk = disk.clone();
                let index = instance.disks.len();
                disk.device_name
                    .get_or_insert_with(|| format!("persistent-disk-{}", index));
                instance.disks.push(disk);
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn detach_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        device_name: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "detach_disk {} {} {} {}",
            project, zone, name, device_name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance
                    .disks
                    .retain(|d| d.device_name.as_deref() != Some(device_name));
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn add_resource_policies(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        resource_policies: &[String],
    ) -> ApiResult<Operation> {
        let mut state =
            self.begin(format!("add_resource_policies {} {} {}", project, zone, name))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance
                    .resource_policies
                    .extend(resource_policies.iter().cloned());
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn remove_resource_policies(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        resource_policies: &[String],
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "remove_resource_policies {} {} {}",
            project, zone, name
        ))?;
        match state.instances.get_mut(&instance_key(project, zone, name)) {
            Some(instance) => {
                instance
                    .resource_policies
                    .retain(|p| !resource_policies.contains(p));
            }
            None => return Err(ApiError::NotFound(format!("instance {}", name))),
        }
        Ok(state.next_op())
    }

    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> ApiResult<Disk> {
        let state = self.begin(format!("get_disk {} {} {}", project, zone, name))?;
        state
            .disks
            .get(&instance_key(project, zone, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("disk {}", name)))
    }

    async fn list_disks(&self, project: &str, zone: &str) -> ApiResult<Vec<Disk>> {
        let state = self.begin(format!("list_disks {} {}", project, zone))?;
        let prefix = format!("{}/{}/", project, zone);
        let mut disks: Vec<Disk> = state
            .disks
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, disk)| disk.clone())
            .collect();
        disks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(disks)
    }

    async fn insert_disk(&self, project: &str, zone: &str, disk: &Disk) -> ApiResult<Operation> {
        let mut state = self.begin(format!("insert_disk {} {} {}", project, zone, disk.name))?;
        let mut stored = disk.clone();
        stored.status.get_or_insert_with(|| "READY".to_string());
        stored.self_link.get_or_insert_with(|| {
            format!(
                "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/disks/{}",
                project, zone, disk.name
            )
        });
        stored.label_fingerprint.get_or_insert_with(|| "fp-0".to_string());
        // The service never echoes a raw key back, only its digest
        if let Some(key) = &mut stored.disk_encryption_key
            && let Some(raw) = key.raw_key.take()
        {
            key.sha256 = crate::util::hash256(&raw).ok();
        }
        state.disks.insert(instance_key(project, zone, &disk.name), stored);
        Ok(state.next_op())
    }

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation> {
        let mut state = self.begin(format!("delete_disk {} {} {}", project, zone, name))?;
        if state.disks.remove(&instance_key(project, zone, name)).is_none() {
            return Err(ApiError::NotFound(format!("disk {}", name)));
        }
        Ok(state.next_op())
    }

    async fn resize_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        size_gb: i64,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "resize_disk {} {} {} {}",
            project, zone, name, size_gb
        ))?;
        match state.disks.get_mut(&instance_key(project, zone, name)) {
            Some(disk) => disk.size_gb = Some(size_gb),
            None => return Err(ApiError::NotFound(format!("disk {}", name))),
        }
        Ok(state.next_op())
    }

    async fn set_disk_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        _label_fingerprint: &str,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_disk_labels {} {} {}", project, zone, name))?;
        let fingerprint = state.next_fingerprint();
        match state.disks.get_mut(&instance_key(project, zone, name)) {
            Some(disk) => {
                disk.labels = Some(labels.clone());
                disk.label_fingerprint = Some(fingerprint);
            }
            None => return Err(ApiError::NotFound(format!("disk {}", name))),
        }
        Ok(state.next_op())
    }

    async fn get_image(&self, project: &str, name: &str) -> ApiResult<Image> {
        let state = self.begin(format!("get_image {} {}", project, name))?;
        state
            .images
            .get(&format!("{}/{}", project, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("image {}", name)))
    }

    async fn get_image_from_family(&self, project: &str, family: &str) -> ApiResult<Image> {
        let state = self.begin(format!("get_image_from_family {} {}", project, family))?;
        state
            .families
            .get(&format!("{}/{}", project, family))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("image family {}", family)))
    }

    async fn get_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> ApiResult<InstanceTemplate> {
        let state = self.begin(format!("get_instance_template {} {}", project, name))?;
        state
            .templates
            .get(&format!("{}/{}", project, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("instance template {}", name)))
    }

    async fn insert_instance_template(
        &self,
        project: &str,
        template: &InstanceTemplate,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!(
            "insert_instance_template {} {}",
            project, template.name
        ))?;
        let mut stored = template.clone();
        stored.self_link.get_or_insert_with(|| {
            format!(
                "https://www.googleapis.com/compute/v1/projects/{}/global/instanceTemplates/{}",
                project, template.name
            )
        });
        state
            .templates
            .insert(format!("{}/{}", project, template.name), stored);
        Ok(state.next_op())
    }

    async fn delete_instance_template(&self, project: &str, name: &str) -> ApiResult<Operation> {
        let mut state = self.begin(format!("delete_instance_template {} {}", project, name))?;
        if state.templates.remove(&format!("{}/{}", project, name)).is_none() {
            return Err(ApiError::NotFound(format!("instance template {}", name)));
        }
        Ok(state.next_op())
    }

    async fn get_router(&self, project: &str, region: &str, name: &str) -> ApiResult<Router> {
        let state = self.begin(format!("get_router {} {} {}", project, region, name))?;
        state
            .routers
            .get(&format!("{}/{}/{}", project, region, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("router {}", name)))
    }

    async fn patch_router(
        &self,
        project: &str,
        region: &str,
        name: &str,
        patch: &RouterPatch,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("patch_router {} {} {}", project, region, name))?;
        match state.routers.get_mut(&format!("{}/{}/{}", project, region, name)) {
            Some(router) => {
                if let Some(peers) = &patch.bgp_peers {
                    router.bgp_peers = peers.clone();
                }
                if let Some(keys) = &patch.md5_authentication_keys {
                    router.md5_authentication_keys = keys.clone();
                }
            }
            None => return Err(ApiError::NotFound(format!("router {}", name))),
        }
        Ok(state.next_op())
    }

    async fn get_project(&self, project: &str) -> ApiResult<Project> {
        let state = self.begin(format!("get_project {}", project))?;
        state
            .projects
            .get(project)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("project {}", project)))
    }

    async fn set_common_instance_metadata(
        &self,
        project: &str,
        metadata: &Metadata,
    ) -> ApiResult<Operation> {
        let mut state = self.begin(format!("set_common_instance_metadata {}", project))?;
        let fingerprint = state.next_fingerprint();
        let entry = state
            .projects
            .entry(project.to_string())
            .or_insert_with(|| Project {
                name: project.to_string(),
                ..Default::default()
            });
        entry.common_instance_metadata = Some(Metadata {
            fingerprint: Some(fingerprint),
            items: metadata.items.clone(),
        });
        Ok(state.next_op())
    }

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ApiResult<Subnetwork> {
        let state = self.begin(format!("get_subnetwork {} {} {}", project, region, name))?;
        state
            .subnetworks
            .get(&format!("{}/{}/{}", project, region, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("subnetwork {}", name)))
    }

    async fn get_zone(&self, project: &str, zone: &str) -> ApiResult<Zone> {
        let state = self.begin(format!("get_zone {} {}", project, zone))?;
        if state.missing_zones.contains(&format!("{}/{}", project, zone)) {
            return Err(ApiError::NotFound(format!("zone {}", zone)));
        }
        Ok(Zone {
            name: zone.to_string(),
            status: Some("UP".to_string()),
        })
    }

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ApiResult<Operation> {
        let state = self.begin(format!("get_zone_operation {} {} {}", project, zone, name))?;
        Ok(state.poll_result(name))
    }

    async fn get_region_operation(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ApiResult<Operation> {
        let state = self.begin(format!("get_region_operation {} {} {}", project, region, name))?;
        Ok(state.poll_result(name))
    }

    async fn get_global_operation(&self, project: &str, name: &str) -> ApiResult<Operation> {
        let state = self.begin(format!("get_global_operation {} {}", project, name))?;
        Ok(state.poll_result(name))
    }
}
