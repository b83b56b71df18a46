//! gce_disk create, read, update and delete
//!
//! Size can grow in place and labels can be rewritten; every other field is
//! fixed once the disk exists. Delete walks the disk's user instances and
//! detaches the disk from each before removing it.

use std::collections::HashMap;
use std::time::Duration;

use vela_core::differ::ChangeSet;
use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::operation::wait_for_operation;
use crate::api::types::{CustomerEncryptionKey, Disk};
use crate::config::DiskConfig;
use crate::image;
use crate::util::{disk_type_path, name_from_self_link, relative_path, snapshot_path};

const DISK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Fields with no update endpoint
const FIXED_FIELDS: [&str; 6] = [
    "name",
    "zone",
    "type",
    "disk_encryption_key_raw",
    "description",
    "provisioned_iops",
];

pub(crate) fn disk_identifier(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{}/zones/{}/disks/{}", project, zone, name)
}

pub(crate) fn parse_disk_identifier(identifier: &str) -> ProviderResult<(String, String, String)> {
    let parts: Vec<&str> = identifier.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "zones", zone, "disks", name]
            if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
        {
            Ok((project.to_string(), zone.to_string(), name.to_string()))
        }
        _ => Err(ProviderError::invalid_input(
            "identifier",
            format!(
                "expected projects/{{project}}/zones/{{zone}}/disks/{{name}}, got {:?}",
                identifier
            ),
        )),
    }
}

/// Instance self link held in a disk's `users` list
fn parse_disk_user(link: &str) -> ProviderResult<(String, String, String)> {
    let relative = relative_path(link);
    let parts: Vec<&str> = relative.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "zones", zone, "instances", name]
            if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
        {
            Ok((project.to_string(), zone.to_string(), name.to_string()))
        }
        _ => Err(ProviderError::remote(
            "detaching disk",
            format!("unrecognized disk user {:?}", link),
        )),
    }
}

impl GceProvider {
    pub(crate) async fn create_disk(&self, resource: &Resource) -> ProviderResult<State> {
        let config = DiskConfig::from_resource(resource)?;

        let zone = config.zone.clone().unwrap_or_else(|| self.zone.clone());
        self.api
            .get_zone(&self.project, &zone)
            .await
            .map_err(|e| ProviderError::remote(format!("loading zone {:?}", zone), e))?;

        let disk = self.expand_disk(&config, &zone).await?;
        log::debug!("creating disk {} in {}", config.name, zone);
        let op = self
            .api
            .insert_disk(&self.project, &zone, &disk)
            .await
            .map_err(|e| ProviderError::remote("Creating Disk", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &self.project,
            op,
            "Creating Disk",
            DISK_TIMEOUT,
        )
        .await?;

        self.disk_state(
            resource.id.clone(),
            &self.project,
            &zone,
            &config.name,
            Some(&resource.attributes),
        )
        .await
    }

    pub(crate) async fn read_disk(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> ProviderResult<State> {
        let (project, zone, name) = match identifier {
            Some(identifier) => parse_disk_identifier(identifier)?,
            None => {
                let zone = prior
                    .and_then(|state| state.get_str("zone"))
                    .unwrap_or(&self.zone)
                    .to_string();
                (self.project.clone(), zone, id.name.clone())
            }
        };
        self.disk_state(
            id.clone(),
            &project,
            &zone,
            &name,
            prior.map(|state| &state.attributes),
        )
        .await
    }

    pub(crate) async fn update_disk(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let (project, zone, name) = parse_disk_identifier(identifier)?;
        let prior = DiskConfig::from_attributes(&from.attributes)?;
        let desired = DiskConfig::from_attributes(&to.attributes)?;

        let mut changes = ChangeSet::between(&from.attributes, &to.attributes);
        for field in FIXED_FIELDS {
            if changes.has_change(field) {
                changes.mark_force_new(field);
            }
        }
        // The state holds the canonical image path while configs may use any
        // accepted spelling, so a textual mismatch is not necessarily a change.
        if changes.has_change("image") {
            let suppressed = matches!(
                (from.get_str("image"), desired.image.as_deref()),
                (Some(live), Some(configured)) if image::image_references_equal(live, configured)
            );
            if !suppressed {
                changes.mark_force_new("image");
            }
        }
        if changes.has_change("snapshot") {
            let suppressed = matches!(
                (from.get_str("snapshot"), desired.snapshot.as_deref()),
                (Some(live), Some(configured))
                    if name_from_self_link(live) == name_from_self_link(configured)
            );
            if !suppressed {
                changes.mark_force_new("snapshot");
            }
        }
        if let (Some(old), Some(new)) = (prior.size, desired.size)
            && new < old
        {
            changes.mark_force_new("size");
        }
        if changes.requires_replacement() {
            let fields: Vec<&str> = changes.force_new_attributes().collect();
            return Err(ProviderError::invalid_input(
                fields.join(", "),
                "cannot change in place; the disk must be replaced",
            ));
        }

        if changes.has_change("size")
            && let Some(size) = desired.size
        {
            let op = self
                .api
                .resize_disk(&project, &zone, &name, size)
                .await
                .map_err(|e| ProviderError::remote("Resizing Disk", e))?;
            wait_for_operation(
                self.api.as_ref(),
                &project,
                op,
                "Resizing Disk",
                DISK_TIMEOUT,
            )
            .await?;
        }

        if changes.has_change("labels") {
            let live = match self.api.get_disk(&project, &zone, &name).await {
                Ok(disk) => disk,
                Err(e) if e.is_not_found() => {
                    return Err(ProviderError::not_found(format!("disk {}", name)));
                }
                Err(e) => return Err(ProviderError::remote("reading disk", e)),
            };
            let fingerprint = live.label_fingerprint.unwrap_or_default();
            let op = match self
                .api
                .set_disk_labels(&project, &zone, &name, &desired.labels, &fingerprint)
                .await
            {
                Ok(op) => op,
                Err(e) if e.is_conflict() => {
                    return Err(ProviderError::conflict("disk labels", e.to_string()));
                }
                Err(e) => return Err(ProviderError::remote("Setting Disk Labels", e)),
            };
            wait_for_operation(
                self.api.as_ref(),
                &project,
                op,
                "Setting Disk Labels",
                DISK_TIMEOUT,
            )
            .await?;
        }

        self.disk_state(id.clone(), &project, &zone, &name, Some(&to.attributes))
            .await
    }

    pub(crate) async fn delete_disk(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        let (project, zone, name) = parse_disk_identifier(identifier)?;

        let disk = match self.api.get_disk(&project, &zone, &name).await {
            Ok(disk) => disk,
            Err(e) if e.is_not_found() => {
                log::debug!("disk {} already gone", id.name);
                return Ok(());
            }
            Err(e) => return Err(ProviderError::remote("reading disk", e)),
        };

        self.detach_from_users(&disk).await?;

        let op = self
            .api
            .delete_disk(&project, &zone, &name)
            .await
            .map_err(|e| ProviderError::remote("Deleting Disk", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Deleting Disk",
            DISK_TIMEOUT,
        )
        .await
    }

    /// Remove the disk's attachment from every instance still using it.
    ///
    /// A user instance that disappeared since the disk was fetched is
    /// skipped; the delete that follows is what actually cares.
    async fn detach_from_users(&self, disk: &Disk) -> ProviderResult<()> {
        if disk.users.is_empty() {
            return Ok(());
        }
        let self_link = disk
            .self_link
            .as_deref()
            .map(relative_path)
            .unwrap_or_default();

        for user in &disk.users {
            let (project, zone, instance_name) = parse_disk_user(user)?;
            let instance = match self.api.get_instance(&project, &zone, &instance_name).await {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => {
                    log::warn!("instance {} not found, skipping detach", instance_name);
                    continue;
                }
                Err(e) => return Err(ProviderError::remote("reading instance", e)),
            };
            for attached in &instance.disks {
                let source = attached
                    .source
                    .as_deref()
                    .map(relative_path)
                    .unwrap_or_default();
                if source != self_link {
                    continue;
                }
                let Some(device_name) = attached.device_name.as_deref() else {
                    continue;
                };
                let op = self
                    .api
                    .detach_disk(&project, &zone, &instance_name, device_name)
                    .await
                    .map_err(|e| ProviderError::remote("detaching disk", e))?;
                wait_for_operation(
                    self.api.as_ref(),
                    &project,
                    op,
                    &format!("detaching disk from {}", instance_name),
                    DISK_TIMEOUT,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Build the insert request from the typed configuration
    async fn expand_disk(&self, config: &DiskConfig, zone: &str) -> ProviderResult<Disk> {
        let source_image = match config.image.as_deref() {
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

        Ok(Disk {
            name: config.name.clone(),
            description: config.description.clone(),
            size_gb: config.size,
            type_: Some(disk_type_path(zone, &config.disk_type)),
            source_image,
            source_snapshot: config
                .snapshot
                .as_deref()
                .map(|snapshot| snapshot_path(&self.project, snapshot)),
            disk_encryption_key: config.disk_encryption_key_raw.as_ref().map(|raw| {
                CustomerEncryptionKey {
                    raw_key: Some(raw.clone()),
                    kms_key_self_link: None,
                    sha256: None,
                }
            }),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            provisioned_iops: config.provisioned_iops,
            ..Disk::default()
        })
    }

    /// Fetch the live disk and flatten it to configuration shape.
    ///
    /// `prior` only supplies the raw encryption key, which the service never
    /// returns.
    pub(crate) async fn disk_state(
        &self,
        id: ResourceId,
        project: &str,
        zone: &str,
        name: &str,
        prior: Option<&HashMap<String, Value>>,
    ) -> ProviderResult<State> {
        let disk = match self.api.get_disk(project, zone, name).await {
            Ok(disk) => disk,
            Err(e) if e.is_not_found() => return Ok(State::not_found(id)),
            Err(e) => return Err(ProviderError::remote("reading disk", e)),
        };

        let mut attrs: HashMap<String, Value> = HashMap::new();
        attrs.insert("name".to_string(), Value::from(disk.name.as_str()));
        attrs.insert(
            "zone".to_string(),
            Value::from(disk.zone.as_deref().map(name_from_self_link).unwrap_or(zone)),
        );
        put_str(&mut attrs, "description", disk.description.as_deref());
        if let Some(size) = disk.size_gb {
            attrs.insert("size".to_string(), Value::from(size));
        }
        put_str(
            &mut attrs,
            "type",
            disk.type_.as_deref().map(name_from_self_link),
        );
        if let Some(image) = disk.source_image.as_deref() {
            attrs.insert("image".to_string(), Value::from(relative_path(image)));
        }
        if let Some(snapshot) = disk.source_snapshot.as_deref() {
            attrs.insert("snapshot".to_string(), Value::from(relative_path(snapshot)));
        }
        if let Some(labels) = &disk.labels
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
        if !disk.users.is_empty() {
            attrs.insert(
                "users".to_string(),
                Value::List(
                    disk.users
                        .iter()
                        .map(|user| Value::from(user.as_str()))
                        .collect(),
                ),
            );
        }
        if let Some(key) = &disk.disk_encryption_key {
            put_str(&mut attrs, "disk_encryption_key_sha256", key.sha256.as_deref());
        }
        if let Some(raw) = prior
            .and_then(|attrs| attrs.get("disk_encryption_key_raw"))
            .and_then(Value::as_str)
        {
            attrs.insert("disk_encryption_key_raw".to_string(), Value::from(raw));
        }
        if let Some(iops) = disk.provisioned_iops {
            attrs.insert("provisioned_iops".to_string(), Value::from(iops));
        }

        let identifier = disk_identifier(project, zone, &disk.name);
        Ok(State::existing(id, attrs).with_identifier(identifier))
    }
}

fn put_str(attrs: &mut HashMap<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::ApiError;
    use crate::api::types::{AttachedDisk, Instance};
    use crate::testing::{FakeCompute, provider_with};

    // 32 zero bytes, base64-encoded
    const RAW_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    const RAW_KEY_SHA256: &str = "Zmh6rfhivXdsj8GLjp+OIAiXFIVu4jOzkCpZHQ1fKSU=";

    fn disk_resource() -> Resource {
        let mut labels = HashMap::new();
        labels.insert("env".to_string(), Value::from("dev"));

        Resource::new("gce_disk", "data-1")
            .with_attribute("name", "data-1")
            .with_attribute("size", 100)
            .with_attribute("type", "pd-ssd")
            .with_attribute("image", "debian-11")
            .with_attribute("labels", Value::Map(labels))
    }

    async fn create(provider: &GceProvider, resource: &Resource) -> State {
        provider.create_disk(resource).await.unwrap()
    }

    #[tokio::test]
    async fn create_expands_inserts_and_reads_back() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let resource = disk_resource().with_attribute("disk_encryption_key_raw", RAW_KEY);

        let state = create(&provider, &resource).await;

        assert!(state.exists);
        assert_eq!(
            state.identifier.as_deref(),
            Some("projects/proj/zones/us-central1-a/disks/data-1")
        );
        assert_eq!(state.attributes.get("size"), Some(&Value::from(100)));
        assert_eq!(state.get_str("type"), Some("pd-ssd"));
        assert_eq!(
            state.get_str("image"),
            Some("projects/proj/global/images/debian-11")
        );
        // The raw key is carried from configuration, its digest from the API
        assert_eq!(state.get_str("disk_encryption_key_raw"), Some(RAW_KEY));
        assert_eq!(
            state.get_str("disk_encryption_key_sha256"),
            Some(RAW_KEY_SHA256)
        );

        let stored = api.disk("proj", "us-central1-a", "data-1").unwrap();
        assert_eq!(
            stored.type_.as_deref(),
            Some("zones/us-central1-a/diskTypes/pd-ssd")
        );
        assert!(stored.disk_encryption_key.as_ref().unwrap().raw_key.is_none());

        assert_eq!(api.calls()[0], "get_zone proj us-central1-a");
    }

    #[tokio::test]
    async fn create_from_snapshot_skips_image_resolution() {
        let (api, provider) = provider_with(FakeCompute::new());
        let resource = Resource::new("gce_disk", "restore-1")
            .with_attribute("name", "restore-1")
            .with_attribute("snapshot", "snap-1");

        create(&provider, &resource).await;

        let stored = api.disk("proj", "us-central1-a", "restore-1").unwrap();
        assert_eq!(
            stored.source_snapshot.as_deref(),
            Some("projects/proj/global/snapshots/snap-1")
        );
        assert!(!api.calls().iter().any(|c| c.starts_with("get_image")));
    }

    #[tokio::test]
    async fn update_grows_size_then_rewrites_labels() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let state = create(&provider, &disk_resource()).await;
        api.clear_calls();

        let mut labels = HashMap::new();
        labels.insert("env".to_string(), Value::from("prod"));
        let to = disk_resource()
            .with_attribute("size", 200)
            .with_attribute("labels", Value::Map(labels));

        let id = ResourceId::new("gce_disk", "data-1");
        let updated = provider
            .update_disk(&id, state.identifier.as_deref().unwrap(), &state, &to)
            .await
            .unwrap();

        assert_eq!(updated.attributes.get("size"), Some(&Value::from(200)));

        let calls = api.calls();
        let resize = calls
            .iter()
            .position(|c| c == "resize_disk proj us-central1-a data-1 200")
            .unwrap();
        let labels = calls
            .iter()
            .position(|c| c.starts_with("set_disk_labels"))
            .unwrap();
        assert!(resize < labels);
    }

    #[tokio::test]
    async fn update_rejects_a_shrink_before_any_call() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let state = create(&provider, &disk_resource().with_attribute("size", 200)).await;
        api.clear_calls();

        let to = disk_resource().with_attribute("size", 100);
        let id = ResourceId::new("gce_disk", "data-1");
        let err = provider
            .update_disk(&id, state.identifier.as_deref().unwrap(), &state, &to)
            .await
            .unwrap_err();

        match err {
            ProviderError::InvalidInput { field, message } => {
                assert_eq!(field, "size");
                assert!(message.contains("replaced"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn update_rejects_a_type_change() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let state = create(&provider, &disk_resource()).await;
        api.clear_calls();

        let to = disk_resource().with_attribute("type", "pd-standard");
        let id = ResourceId::new("gce_disk", "data-1");
        let err = provider
            .update_disk(&id, state.identifier.as_deref().unwrap(), &state, &to)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::InvalidInput { ref field, .. } if field == "type"));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn stale_label_fingerprint_surfaces_as_a_conflict() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.add_image("proj", "debian-11");
        let state = create(&provider, &disk_resource()).await;
        api.fail_next(
            "set_disk_labels",
            ApiError::Conflict("label fingerprint mismatch".to_string()),
        );

        let mut labels = HashMap::new();
        labels.insert("env".to_string(), Value::from("prod"));
        let to = disk_resource().with_attribute("labels", Value::Map(labels));

        let id = ResourceId::new("gce_disk", "data-1");
        let err = provider
            .update_disk(&id, state.identifier.as_deref().unwrap(), &state, &to)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn delete_detaches_the_disk_from_its_users_first() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.put_disk(
            "proj",
            "us-central1-a",
            Disk {
                name: "data-1".to_string(),
                self_link: Some(
                    "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/disks/data-1"
                        .to_string(),
                ),
                users: vec![
                    "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/instances/vm-1"
                        .to_string(),
                ],
                ..Disk::default()
            },
        );
        api.put_instance(
            "proj",
            "us-central1-a",
            Instance {
                name: "vm-1".to_string(),
                disks: vec![AttachedDisk {
                    source: Some(
                        "projects/proj/zones/us-central1-a/disks/data-1".to_string(),
                    ),
                    device_name: Some("persistent-disk-1".to_string()),
                    ..AttachedDisk::default()
                }],
                ..Instance::default()
            },
        );

        let id = ResourceId::new("gce_disk", "data-1");
        provider
            .delete_disk(&id, "projects/proj/zones/us-central1-a/disks/data-1")
            .await
            .unwrap();

        let calls = api.calls();
        let detach = calls
            .iter()
            .position(|c| c == "detach_disk proj us-central1-a vm-1 persistent-disk-1")
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| c == "delete_disk proj us-central1-a data-1")
            .unwrap();
        assert!(detach < delete);
        assert!(api.disk("proj", "us-central1-a", "data-1").is_none());
    }

    #[tokio::test]
    async fn delete_skips_user_instances_that_no_longer_exist() {
        let (api, provider) = provider_with(FakeCompute::new());
        api.put_disk(
            "proj",
            "us-central1-a",
            Disk {
                name: "data-1".to_string(),
                users: vec![
                    "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/instances/ghost"
                        .to_string(),
                ],
                ..Disk::default()
            },
        );

        let id = ResourceId::new("gce_disk", "data-1");
        provider
            .delete_disk(&id, "projects/proj/zones/us-central1-a/disks/data-1")
            .await
            .unwrap();

        let calls = api.calls();
        assert!(!calls.iter().any(|c| c.starts_with("detach_disk")));
        assert!(calls.iter().any(|c| c.starts_with("delete_disk")));
    }

    #[tokio::test]
    async fn delete_of_missing_disk_succeeds() {
        let (_api, provider) = provider_with(FakeCompute::new());
        let id = ResourceId::new("gce_disk", "gone");

        provider
            .delete_disk(&id, "projects/proj/zones/us-central1-a/disks/gone")
            .await
            .unwrap();
    }

    #[test]
    fn identifier_shape_is_enforced() {
        assert!(parse_disk_identifier("projects/p/zones/z/disks/d").is_ok());
        assert!(parse_disk_identifier("projects/p/disks/d").is_err());
        assert!(parse_disk_user(
            "https://www.googleapis.com/compute/v1/projects/p/zones/z/instances/i"
        )
        .is_ok());
        assert!(parse_disk_user("p/zones/z/instances/i").is_err());
    }
}
