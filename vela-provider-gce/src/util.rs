//! Shared helpers for resource paths and self links
//!
//! The service accepts several spellings for most reference fields (bare
//! name, relative path, full URL). These helpers normalize between them
//! without issuing any API calls.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use vela_core::provider::{ProviderError, ProviderResult};

/// Last path segment of a self link ("…/instances/vm-1" -> "vm-1")
pub fn name_from_self_link(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

/// Relative form of a full URL, starting at "projects/"
///
/// Already-relative values are returned unchanged.
pub fn relative_path(url: &str) -> String {
    match url.find("projects/") {
        Some(idx) => url[idx..].to_string(),
        None => url.to_string(),
    }
}

/// Region containing a zone ("us-central1-a" -> "us-central1")
pub fn zone_to_region(zone: &str) -> ProviderResult<String> {
    let zone = name_from_self_link(zone);
    match zone.rsplit_once('-') {
        Some((region, _)) if !region.is_empty() => Ok(region.to_string()),
        _ => Err(ProviderError::invalid_input(
            "zone",
            format!("'{}' is not a valid zone name", zone),
        )),
    }
}

/// Canonical network reference: bare names become a global relative path
pub fn network_path(project: &str, network: &str) -> String {
    if network.contains('/') {
        relative_path(network)
    } else {
        format!("projects/{}/global/networks/{}", project, network)
    }
}

/// Canonical subnetwork reference: bare names become a regional relative path
pub fn subnetwork_path(project: &str, region: &str, subnetwork: &str) -> String {
    if subnetwork.contains('/') {
        relative_path(subnetwork)
    } else {
        format!(
            "projects/{}/regions/{}/subnetworks/{}",
            project, region, subnetwork
        )
    }
}

/// Project owning a subnetwork reference, when the reference spells it out
pub fn project_from_subnetwork_link(link: &str) -> Option<&str> {
    let rest = link.split("projects/").nth(1)?;
    let project = rest.split('/').next()?;
    if project.is_empty() { None } else { Some(project) }
}

/// Canonical snapshot reference: bare names become a global relative path
pub fn snapshot_path(project: &str, snapshot: &str) -> String {
    if snapshot.contains('/') {
        relative_path(snapshot)
    } else {
        format!("projects/{}/global/snapshots/{}", project, snapshot)
    }
}

/// Canonical machine type reference within a zone
pub fn machine_type_path(zone: &str, machine_type: &str) -> String {
    if machine_type.contains('/') {
        relative_path(machine_type)
    } else {
        format!("zones/{}/machineTypes/{}", zone, machine_type)
    }
}

/// Canonical disk type reference within a zone
pub fn disk_type_path(zone: &str, disk_type: &str) -> String {
    if disk_type.contains('/') {
        relative_path(disk_type)
    } else {
        format!("zones/{}/diskTypes/{}", zone, disk_type)
    }
}

/// Canonical disk reference within a zone
pub fn disk_path(project: &str, zone: &str, disk: &str) -> String {
    if disk.contains('/') {
        relative_path(disk)
    } else {
        format!("projects/{}/zones/{}/disks/{}", project, zone, disk)
    }
}

/// Canonical accelerator type reference within a zone
pub fn accelerator_type_path(zone: &str, accelerator_type: &str) -> String {
    if accelerator_type.contains('/') {
        relative_path(accelerator_type)
    } else {
        format!("zones/{}/acceleratorTypes/{}", zone, accelerator_type)
    }
}

/// Digest of a base64 raw key in the form the service reports: the SHA-256
/// of the decoded key bytes, base64-encoded again
pub fn hash256(base64_key: &str) -> ProviderResult<String> {
    let decoded = BASE64.decode(base64_key).map_err(|e| {
        ProviderError::invalid_input(
            "disk_encryption_key_raw",
            format!("not valid base64: {}", e),
        )
    })?;
    let digest = Sha256::digest(&decoded);
    Ok(BASE64.encode(digest))
}
