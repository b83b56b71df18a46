//! Recorded-state upgrades for the instance resource
//!
//! Instance attributes persisted by older releases pass through a chain of
//! per-version steps until they reach the current layout. Most steps are
//! pure rewrites of the flat attribute map; the v3 step must consult the
//! live instance, because the old single `disk` list did not record which
//! entry was which and only the service still knows.

use std::collections::HashMap;

use vela_core::flatmap::FlatMap;
use vela_core::provider::{ProviderError, ProviderResult};

use crate::api::client::ComputeApi;
use crate::api::types::{AttachedDisk, Disk};
use crate::codec::canonicalize_scope;
use crate::image::resolve_image;
use crate::util::{hash256, name_from_self_link, relative_path};

/// Version of the instance state layout the provider currently writes
pub const INSTANCE_SCHEMA_VERSION: u64 = 6;

/// Upgrade recorded instance attributes from `version` to the current layout
///
/// `name` is the recorded instance name; `default_project` and
/// `default_zone` fill in when the attributes predate those keys.
pub async fn migrate_instance_state(
    api: &dyn ComputeApi,
    default_project: &str,
    default_zone: &str,
    name: &str,
    version: u64,
    attributes: FlatMap,
) -> ProviderResult<(u64, FlatMap)> {
    if name.is_empty() {
        log::debug!("empty instance state; nothing to migrate");
        return Ok((INSTANCE_SCHEMA_VERSION, attributes));
    }

    let mut attributes = attributes;
    let mut version = version;
    while version < INSTANCE_SCHEMA_VERSION {
        log::info!(
            "instance {} state at v{}; migrating to v{}",
            name,
            version,
            version + 1
        );
        attributes = match version {
            0 => metadata_list_to_map(attributes)?,
            1 => scope_list_to_set(attributes)?,
            2 => add_create_timeout(attributes),
            3 => {
                split_disk_blocks(api, default_project, default_zone, name, attributes).await?
            }
            4 => {
                resplit_leftover_disks(api, default_project, default_zone, name, attributes)
                    .await?
            }
            5 => collapse_empty_initialize_params(attributes),
            _ => {
                return Err(ProviderError::migration(format!(
                    "unexpected schema version: {}",
                    version
                )));
            }
        };
        version += 1;
    }

    if version > INSTANCE_SCHEMA_VERSION {
        return Err(ProviderError::migration(format!(
            "unexpected schema version: {}",
            version
        )));
    }
    Ok((version, attributes))
}

fn attr<'a>(attributes: &'a FlatMap, key: &str) -> &'a str {
    attributes.get(key).map(String::as_str).unwrap_or("")
}

/// v0 -> v1: metadata moved from a list of maps (`metadata.N.key`) to a
/// single map (`metadata.key`)
fn metadata_list_to_map(mut attributes: FlatMap) -> ProviderResult<FlatMap> {
    attributes.remove("metadata.#");

    let old_keys: Vec<String> = attributes
        .keys()
        .filter(|k| k.starts_with("metadata."))
        .cloned()
        .collect();

    let mut renamed: Vec<(String, String)> = Vec::new();
    for key in old_keys {
        let new_key = {
            let mut parts = key.splitn(3, '.');
            let _prefix = parts.next();
            match (parts.next(), parts.next()) {
                (Some(index), Some(tail)) if index.parse::<u64>().is_ok() => {
                    format!("metadata.{}", tail)
                }
                _ => {
                    return Err(ProviderError::migration(format!(
                        "found metadata key in unexpected format: {}",
                        key
                    )));
                }
            }
        };
        if let Some(value) = attributes.remove(&key) {
            renamed.push((new_key, value));
        }
    }
    for (key, value) in renamed {
        attributes.insert(key, value);
    }
    Ok(attributes)
}

/// v1 -> v2: service-account scopes moved from a list (`scopes.N`) to a set
/// keyed by the CRC-32 of the canonical scope URL (`scopes.<checksum>`);
/// values keep the spelling the user wrote
fn scope_list_to_set(mut attributes: FlatMap) -> ProviderResult<FlatMap> {
    let scope_keys: Vec<String> = attributes
        .keys()
        .filter(|k| {
            k.starts_with("service_account.")
                && k.as_str() != "service_account.#"
                && !k.ends_with(".scopes.#")
                && !k.ends_with(".email")
        })
        .cloned()
        .collect();

    let mut rekeyed: Vec<(String, String)> = Vec::new();
    for key in scope_keys {
        let account = {
            let parts: Vec<&str> = key.split('.').collect();
            if parts.len() != 4 || parts[1].parse::<u64>().is_err() {
                return Err(ProviderError::migration(format!(
                    "found scope key in unexpected format: {}",
                    key
                )));
            }
            parts[1].to_string()
        };
        if let Some(value) = attributes.remove(&key) {
            let checksum = crc32_ieee(canonicalize_scope(&value).as_bytes());
            rekeyed.push((
                format!("service_account.{}.scopes.{}", account, checksum),
                value,
            ));
        }
    }
    for (key, value) in rekeyed {
        attributes.insert(key, value);
    }
    Ok(attributes)
}

/// v2 -> v3: a create timeout became configurable, defaulted to 4 minutes
fn add_create_timeout(mut attributes: FlatMap) -> FlatMap {
    attributes.insert("create_timeout".to_string(), "4".to_string());
    attributes
}

/// v3 -> v4: the single `disk` list split into `boot_disk`, `scratch_disk`
/// and `attached_disk` blocks
///
/// The old list did not record which entry corresponded to which attachment,
/// so each non-boot, non-scratch entry is located on the live instance by
/// its most identifying recorded field.
async fn split_disk_blocks(
    api: &dyn ComputeApi,
    default_project: &str,
    default_zone: &str,
    name: &str,
    mut attributes: FlatMap,
) -> ProviderResult<FlatMap> {
    let project = recorded_or_default(&attributes, "project", default_project)?;
    let zone = recorded_or_default(&attributes, "zone", default_zone)?;

    let instance = api
        .get_instance(&project, &zone, name)
        .await
        .map_err(|e| ProviderError::migration(format!("error reading instance: {}", e)))?;
    let inventory = api
        .list_disks(&project, &zone)
        .await
        .map_err(|e| ProviderError::migration(format!("error reading disks: {}", e)))?;
    let all_disks: HashMap<String, Disk> = inventory
        .into_iter()
        .map(|disk| (disk.name.clone(), disk))
        .collect();

    let has_boot_disk = attr(&attributes, "boot_disk.#") == "1";
    let mut scratch_disks = parse_count(&attributes, "scratch_disk.#")?;
    let mut attached_disks = parse_count(&attributes, "attached_disk.#")?;
    let disks = parse_count(&attributes, "disk.#")?;

    // The image matcher consumes its match so several identically-imaged
    // disks each claim a different attachment
    let mut candidates = instance.disks.clone();

    for i in 0..disks {
        if !has_boot_disk && i == 0 {
            attributes.insert("boot_disk.#".to_string(), "1".to_string());

            // the service never allows a scratch disk as the boot disk
            if attr(&attributes, "disk.0.scratch") == "true" {
                return Err(ProviderError::migration("found scratch disk at index 0"));
            }

            if let Some(boot) = instance.disks.iter().find(|d| d.boot) {
                attributes.insert(
                    "boot_disk.0.source".to_string(),
                    name_from_self_link(boot.source.as_deref().unwrap_or_default()).to_string(),
                );
                attributes.insert(
                    "boot_disk.0.device_name".to_string(),
                    boot.device_name.clone().unwrap_or_default(),
                );
            }
            for field in ["auto_delete", "disk_encryption_key_raw", "disk_encryption_key_sha256"]
            {
                let value = attr(&attributes, &format!("disk.0.{}", field)).to_string();
                attributes.insert(format!("boot_disk.0.{}", field), value);
            }

            let size = attr(&attributes, "disk.0.size").to_string();
            if !size.is_empty() && size != "0" {
                attributes
                    .insert("boot_disk.0.initialize_params.#".to_string(), "1".to_string());
                attributes.insert("boot_disk.0.initialize_params.0.size".to_string(), size);
            }
            let disk_type = attr(&attributes, "disk.0.type").to_string();
            if !disk_type.is_empty() {
                attributes
                    .insert("boot_disk.0.initialize_params.#".to_string(), "1".to_string());
                attributes
                    .insert("boot_disk.0.initialize_params.0.type".to_string(), disk_type);
            }
            let image = attr(&attributes, "disk.0.image").to_string();
            if !image.is_empty() {
                attributes
                    .insert("boot_disk.0.initialize_params.#".to_string(), "1".to_string());
                attributes.insert("boot_disk.0.initialize_params.0.image".to_string(), image);
            }
        } else if attr(&attributes, &format!("disk.{}.scratch", i)) == "true" {
            // the service never allows a scratch disk to outlive its instance
            if attr(&attributes, &format!("disk.{}.auto_delete", i)) != "true" {
                return Err(ProviderError::migration(
                    "attempted to migrate scratch disk where auto_delete is not true",
                ));
            }
            attributes.insert(
                format!("scratch_disk.{}.interface", scratch_disks),
                "SCSI".to_string(),
            );
            scratch_disks += 1;
        } else {
            let disk =
                locate_attached_disk(api, &project, &mut candidates, &all_disks, &attributes, i)
                    .await?;
            attributes.insert(
                format!("attached_disk.{}.source", attached_disks),
                disk.source.clone().unwrap_or_default(),
            );
            attributes.insert(
                format!("attached_disk.{}.device_name", attached_disks),
                disk.device_name.clone().unwrap_or_default(),
            );
            for field in ["disk_encryption_key_raw", "disk_encryption_key_sha256"] {
                let value = attr(&attributes, &format!("disk.{}.{}", i, field)).to_string();
                attributes.insert(format!("attached_disk.{}.{}", attached_disks, field), value);
            }
            attached_disks += 1;
        }
    }

    let old_keys: Vec<String> = attributes
        .keys()
        .filter(|k| k.starts_with("disk."))
        .cloned()
        .collect();
    for key in old_keys {
        attributes.remove(&key);
    }
    if scratch_disks > 0 {
        attributes.insert("scratch_disk.#".to_string(), scratch_disks.to_string());
    }
    if attached_disks > 0 {
        attributes.insert("attached_disk.#".to_string(), attached_disks.to_string());
    }

    Ok(attributes)
}

/// v4 -> v5: rerun the disk split for states that still carry a `disk` list
/// (the v3 step once skipped instances in rare shapes)
async fn resplit_leftover_disks(
    api: &dyn ComputeApi,
    default_project: &str,
    default_zone: &str,
    name: &str,
    attributes: FlatMap,
) -> ProviderResult<FlatMap> {
    if attr(&attributes, "disk.#").is_empty() {
        return Ok(attributes);
    }
    split_disk_blocks(api, default_project, default_zone, name, attributes).await
}

/// v5 -> v6: a boot-disk initialize-params block recording no size, type or
/// image carries no information; drop it
fn collapse_empty_initialize_params(mut attributes: FlatMap) -> FlatMap {
    if attr(&attributes, "boot_disk.0.initialize_params.#") != "1" {
        return attributes;
    }
    let collapse = {
        let size = attr(&attributes, "boot_disk.0.initialize_params.0.size");
        let disk_type = attr(&attributes, "boot_disk.0.initialize_params.0.type");
        let image = attr(&attributes, "boot_disk.0.initialize_params.0.image");
        (size.is_empty() || size == "0") && disk_type.is_empty() && image.is_empty()
    };
    if collapse {
        attributes.insert(
            "boot_disk.0.initialize_params.#".to_string(),
            "0".to_string(),
        );
        attributes.remove("boot_disk.0.initialize_params.0.size");
        attributes.remove("boot_disk.0.initialize_params.0.type");
        attributes.remove("boot_disk.0.initialize_params.0.image");
    }
    attributes
}

fn recorded_or_default(
    attributes: &FlatMap,
    key: &str,
    default: &str,
) -> ProviderResult<String> {
    match attributes.get(key) {
        Some(value) => Ok(value.clone()),
        None if !default.is_empty() => Ok(default.to_string()),
        None => Err(ProviderError::migration(format!(
            "could not determine '{}'",
            key
        ))),
    }
}

fn parse_count(attributes: &FlatMap, key: &str) -> ProviderResult<usize> {
    let value = attr(attributes, key);
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|e| {
        ProviderError::migration(format!("found {} value in unexpected format: {}", key, e))
    })
}

/// Pair an old `disk.N` entry with its live attachment, trying the recorded
/// fields from most to least identifying
async fn locate_attached_disk(
    api: &dyn ComputeApi,
    project: &str,
    candidates: &mut Vec<AttachedDisk>,
    all_disks: &HashMap<String, Disk>,
    attributes: &FlatMap,
    i: usize,
) -> ProviderResult<AttachedDisk> {
    let source = attr(attributes, &format!("disk.{}.disk", i));
    if !source.is_empty() {
        return by_source(candidates, source);
    }

    let device_name = attr(attributes, &format!("disk.{}.device_name", i));
    if !device_name.is_empty() {
        return by_device_name(candidates, device_name);
    }

    let raw_key = attr(attributes, &format!("disk.{}.disk_encryption_key_raw", i));
    if !raw_key.is_empty() {
        return by_encryption_key(candidates, raw_key);
    }

    let auto_delete = attr(attributes, &format!("disk.{}.auto_delete", i))
        .parse::<bool>()
        .map_err(|_| {
            ProviderError::migration(format!("error parsing auto_delete attribute of disk {}", i))
        })?;
    let image = attr(attributes, &format!("disk.{}.image", i)).to_string();
    by_auto_delete_and_image(api, project, candidates, all_disks, auto_delete, &image).await
}

fn is_attachment(disk: &AttachedDisk) -> bool {
    !disk.boot && disk.type_.as_deref() != Some("SCRATCH")
}

fn by_source(candidates: &[AttachedDisk], source: &str) -> ProviderResult<AttachedDisk> {
    // the old field held a bare disk name in the instance's own zone, so a
    // suffix match on the self link is unambiguous
    let suffix = format!("/{}", source);
    candidates
        .iter()
        .filter(|d| is_attachment(d))
        .find(|d| d.source.as_deref().is_some_and(|s| s.ends_with(&suffix)))
        .cloned()
        .ok_or_else(|| {
            ProviderError::migration(format!(
                "could not find attached disk with source {:?}",
                source
            ))
        })
}

fn by_device_name(candidates: &[AttachedDisk], device_name: &str) -> ProviderResult<AttachedDisk> {
    candidates
        .iter()
        .filter(|d| is_attachment(d))
        .find(|d| d.device_name.as_deref() == Some(device_name))
        .cloned()
        .ok_or_else(|| {
            ProviderError::migration(format!(
                "could not find attached disk with deviceName {:?}",
                device_name
            ))
        })
}

fn by_encryption_key(candidates: &[AttachedDisk], raw_key: &str) -> ProviderResult<AttachedDisk> {
    let sha = hash256(raw_key).map_err(|e| ProviderError::migration(e.to_string()))?;
    candidates
        .iter()
        .filter(|d| is_attachment(d))
        .find(|d| {
            d.disk_encryption_key
                .as_ref()
                .and_then(|k| k.sha256.as_deref())
                == Some(sha.as_str())
        })
        .cloned()
        .ok_or_else(|| {
            ProviderError::migration(format!(
                "could not find attached disk with encryption hash {:?}",
                sha
            ))
        })
}

async fn by_auto_delete_and_image(
    api: &dyn ComputeApi,
    project: &str,
    candidates: &mut Vec<AttachedDisk>,
    all_disks: &HashMap<String, Disk>,
    auto_delete: bool,
    image: &str,
) -> ProviderResult<AttachedDisk> {
    let resolved = resolve_image(api, project, image)
        .await
        .map_err(|e| ProviderError::migration(e.to_string()))?;
    let mut canonical = resolved
        .split("/projects/")
        .last()
        .unwrap_or(resolved.as_str())
        .to_string();

    if let Some(index) = find_by_image(candidates, all_disks, auto_delete, |source_image| {
        source_image == canonical
    }) {
        return Ok(candidates.remove(index));
    }

    // The disk may have been created from an image family; family members
    // are named after the family, so fall back to a prefix probe.
    canonical = canonical.replace("/family/", "/");
    let family_marker = format!("/{}-", canonical);
    if let Some(index) = find_by_image(candidates, all_disks, auto_delete, |source_image| {
        source_image.contains(&family_marker)
    }) {
        return Ok(candidates.remove(index));
    }

    Err(ProviderError::migration(format!(
        "could not find attached disk with image {:?}",
        image
    )))
}

fn find_by_image(
    candidates: &[AttachedDisk],
    all_disks: &HashMap<String, Disk>,
    auto_delete: bool,
    matches: impl Fn(&str) -> bool,
) -> Option<usize> {
    for (index, disk) in candidates.iter().enumerate() {
        if !is_attachment(disk) || disk.auto_delete != auto_delete {
            continue;
        }
        let Some(full) = disk
            .source
            .as_deref()
            .map(name_from_self_link)
            .and_then(|name| all_disks.get(name))
        else {
            continue;
        };
        let source_image = relative_path(full.source_image.as_deref().unwrap_or_default());
        if matches(&source_image) {
            return Some(index);
        }
    }
    None
}

/// Bit-serial IEEE CRC-32; scope-set keys recorded under schema v2 are keyed
/// by this checksum of the canonical scope URL
fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
