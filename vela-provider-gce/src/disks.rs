//! Disk list reconciliation
//!
//! The service returns a template's disks in arbitrary order, so reads walk
//! the response and realign it with the configured order before flattening.
//! Matching goes from the most identifying field to the least: a wrong-order
//! pass over loosely-identified disks can pair entries incorrectly (two disks
//! differing only in device name, say), so each strategy is tried across the
//! whole response before the next one would even be needed per entry.
//!
//! The second half is the attached-disk set diff used by instance update:
//! any field change on an attached disk is a detach of the old descriptor
//! plus an attach of the new one, never an in-place mutation.

use std::collections::{HashMap, HashSet, VecDeque};

use vela_core::provider::{ProviderError, ProviderResult};

use crate::api::types::AttachedDisk;
use crate::config::TemplateDiskConfig;
use crate::util::{name_from_self_link, relative_path};

/// How a response disk was paired with a configured entry, most to least
/// identifying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// The boot disk always sits at configured index 0
    Boot,
    /// Device names are unique across an instance
    DeviceName,
    /// Scratch disks are interchangeable within an interface, so they claim
    /// configured scratch slots of the same interface in order
    ScratchInterface,
    /// Attached disks carry their source path
    Source,
    /// Disks created through initialize params carry the generated name
    DiskName,
    /// Last resort: exact equality of the remaining describable fields
    Characteristics,
}

/// The comparison tuple for the characteristics fallback; numeric fields
/// compare as strings so absent and zero stay distinct
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiskCharacteristics {
    mode: String,
    disk_type: String,
    disk_size_gb: String,
    auto_delete: bool,
    source_image: String,
    provisioned_iops: String,
}

impl DiskCharacteristics {
    fn of_config(disk: &TemplateDiskConfig) -> DiskCharacteristics {
        DiskCharacteristics {
            mode: if disk.mode.is_empty() {
                "READ_WRITE".to_string()
            } else {
                disk.mode.clone()
            },
            disk_type: disk.disk_type.clone().unwrap_or_default(),
            disk_size_gb: disk.disk_size_gb.map(|n| n.to_string()).unwrap_or_default(),
            auto_delete: disk.auto_delete,
            source_image: disk
                .source_image
                .as_deref()
                .map(relative_path)
                .unwrap_or_default(),
            provisioned_iops: disk
                .provisioned_iops
                .map(|n| n.to_string())
                .unwrap_or_default(),
        }
    }

    fn of_api(disk: &AttachedDisk) -> DiskCharacteristics {
        let params = disk.initialize_params.as_ref();
        DiskCharacteristics {
            mode: match disk.mode.as_deref() {
                None | Some("") => "READ_WRITE".to_string(),
                Some(mode) => mode.to_string(),
            },
            disk_type: params
                .and_then(|p| p.disk_type.as_deref())
                .map(|t| name_from_self_link(t).to_string())
                .unwrap_or_default(),
            disk_size_gb: params
                .and_then(|p| p.disk_size_gb)
                .map(|n| n.to_string())
                .unwrap_or_default(),
            auto_delete: disk.auto_delete,
            source_image: params
                .and_then(|p| p.source_image.as_deref())
                .map(relative_path)
                .unwrap_or_default(),
            provisioned_iops: params
                .and_then(|p| p.provisioned_iops)
                .map(|n| n.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Indexes into the configured list, keyed by each strategy's identifying
/// field; claims consume entries so a configured slot is filled once
struct MatchState {
    by_device_name: HashMap<String, usize>,
    scratch_by_interface: HashMap<String, VecDeque<usize>>,
    by_source: HashMap<String, usize>,
    by_disk_name: HashMap<String, usize>,
    by_characteristics: Vec<usize>,
}

impl MatchState {
    fn index(config: &[TemplateDiskConfig]) -> MatchState {
        let mut state = MatchState {
            by_device_name: HashMap::new(),
            scratch_by_interface: HashMap::new(),
            by_source: HashMap::new(),
            by_disk_name: HashMap::new(),
            by_characteristics: Vec::new(),
        };
        for (i, disk) in config.iter().enumerate() {
            if i == 0 {
                // boot slot, claimed by the Boot strategy
                continue;
            }
            if let Some(device_name) = nonempty(disk.device_name.as_deref()) {
                state.by_device_name.insert(device_name.to_string(), i);
            } else if disk.disk_kind == "SCRATCH" {
                let interface = disk.interface.clone().unwrap_or_else(|| "SCSI".to_string());
                state.scratch_by_interface.entry(interface).or_default().push_back(i);
            } else if let Some(source) = nonempty(disk.source.as_deref()) {
                state.by_source.insert(relative_path(source), i);
            } else if let Some(disk_name) = nonempty(disk.disk_name.as_deref()) {
                state.by_disk_name.insert(disk_name.to_string(), i);
            } else {
                state.by_characteristics.push(i);
            }
        }
        state
    }

    fn claim(
        &mut self,
        disk: &AttachedDisk,
        config: &[TemplateDiskConfig],
    ) -> Option<(MatchStrategy, usize)> {
        if disk.boot {
            return Some((MatchStrategy::Boot, 0));
        }
        if let Some(device_name) = nonempty(disk.device_name.as_deref())
            && let Some(&i) = self.by_device_name.get(device_name)
        {
            return Some((MatchStrategy::DeviceName, i));
        }
        if disk.type_.as_deref() == Some("SCRATCH") {
            // scratch disks never fall through to the looser strategies
            let interface = disk.interface.clone().unwrap_or_else(|| "SCSI".to_string());
            return self
                .scratch_by_interface
                .get_mut(&interface)
                .and_then(|queue| queue.pop_front())
                .map(|i| (MatchStrategy::ScratchInterface, i));
        }
        if let Some(source) = nonempty(disk.source.as_deref())
            && let Some(&i) = self.by_source.get(&relative_path(source))
        {
            return Some((MatchStrategy::Source, i));
        }
        if let Some(disk_name) = disk
            .initialize_params
            .as_ref()
            .and_then(|p| nonempty(p.disk_name.as_deref()))
            && let Some(&i) = self.by_disk_name.get(disk_name)
        {
            return Some((MatchStrategy::DiskName, i));
        }
        let wanted = DiskCharacteristics::of_api(disk);
        let position = self
            .by_characteristics
            .iter()
            .position(|&i| DiskCharacteristics::of_config(&config[i]) == wanted)?;
        let i = self.by_characteristics.remove(position);
        Some((MatchStrategy::Characteristics, i))
    }
}

fn nonempty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Reorder the response disks to line up with the configured list
///
/// Entries that cannot be paired are appended at the end in response order.
/// When the two lists differ in length there will be a diff regardless, so
/// the response order is returned verbatim.
pub fn reorder_disks(config: &[TemplateDiskConfig], api: Vec<AttachedDisk>) -> Vec<AttachedDisk> {
    if api.len() != config.len() {
        return api;
    }

    let mut state = MatchState::index(config);
    let mut slots: Vec<Option<AttachedDisk>> = vec![None; config.len()];
    let mut unmatched = Vec::new();

    for disk in api {
        match state.claim(&disk, config) {
            Some((strategy, i)) => {
                log::debug!(
                    "disk {:?} matched configured index {} via {:?}",
                    disk.device_name.as_deref().unwrap_or_default(),
                    i,
                    strategy
                );
                slots[i] = Some(disk);
            }
            None => unmatched.push(disk),
        }
    }

    slots.into_iter().flatten().chain(unmatched).collect()
}

// ===== Attached-disk set diff =====

/// Work orders produced by diffing the attached-disk lists; detaches are
/// applied before attaches
#[derive(Debug, Default, PartialEq)]
pub struct DiskDiff {
    pub detach_device_names: Vec<String>,
    pub attach: Vec<AttachedDisk>,
}

impl DiskDiff {
    pub fn is_empty(&self) -> bool {
        self.detach_device_names.is_empty() && self.attach.is_empty()
    }
}

/// Canonical digest of an expanded disk descriptor; equal digests mean the
/// attachment needs no change
fn disk_digest(disk: &AttachedDisk) -> ProviderResult<String> {
    serde_json::to_string(disk).map_err(|e| {
        ProviderError::invalid_input(
            "attached_disk",
            format!("could not encode disk for comparison: {}", e),
        )
    })
}

/// Diff two expanded attached-disk lists into detach and attach work
///
/// `currently_attached` holds the device names live on the instance right
/// now; a prior entry whose device is already gone is neither detached nor
/// allowed to suppress a re-attach.
pub fn diff_attached_disks(
    prior: &[AttachedDisk],
    desired: &[AttachedDisk],
    currently_attached: &HashSet<String>,
) -> ProviderResult<DiskDiff> {
    let mut prior_digests: HashMap<String, String> = HashMap::new();
    let mut prior_order: Vec<String> = Vec::new();
    for disk in prior {
        let Some(device_name) = disk.device_name.as_deref() else {
            continue;
        };
        if !currently_attached.contains(device_name) {
            continue;
        }
        let digest = disk_digest(disk)?;
        if !prior_digests.contains_key(&digest) {
            prior_order.push(digest.clone());
        }
        prior_digests.insert(digest, device_name.to_string());
    }

    let mut desired_digests: HashSet<String> = HashSet::new();
    let mut diff = DiskDiff::default();
    for disk in desired {
        let digest = disk_digest(disk)?;
        if !prior_digests.contains_key(&digest) {
            diff.attach.push(disk.clone());
        }
        desired_digests.insert(digest);
    }

    for digest in &prior_order {
        if !desired_digests.contains(digest)
            && let Some(device_name) = prior_digests.get(digest)
        {
            diff.detach_device_names.push(device_name.clone());
        }
    }

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::AttachedDiskInitializeParams;

    fn boot_disk() -> AttachedDisk {
        AttachedDisk {
            boot: true,
            auto_delete: true,
            source: Some("projects/p/zones/z/disks/boot".to_string()),
            ..Default::default()
        }
    }

    fn config_disk() -> TemplateDiskConfig {
        TemplateDiskConfig {
            auto_delete: true,
            boot: false,
            device_name: None,
            disk_name: None,
            disk_size_gb: None,
            disk_type: None,
            interface: None,
            mode: "READ_WRITE".to_string(),
            source: None,
            source_image: None,
            disk_kind: "PERSISTENT".to_string(),
            labels: Default::default(),
            provisioned_iops: None,
        }
    }

    fn scratch_config(interface: &str) -> TemplateDiskConfig {
        TemplateDiskConfig {
            disk_kind: "SCRATCH".to_string(),
            interface: Some(interface.to_string()),
            ..config_disk()
        }
    }

    fn scratch_api(interface: &str) -> AttachedDisk {
        AttachedDisk {
            auto_delete: true,
            type_: Some("SCRATCH".to_string()),
            interface: Some(interface.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn shuffled_response_realigns_to_configured_order() {
        let config = vec![
            TemplateDiskConfig {
                boot: true,
                ..config_disk()
            },
            TemplateDiskConfig {
                device_name: Some("data".to_string()),
                ..config_disk()
            },
            scratch_config("NVME"),
            TemplateDiskConfig {
                source: Some("projects/p/zones/z/disks/shared".to_string()),
                ..config_disk()
            },
            TemplateDiskConfig {
                disk_name: Some("made-for-me".to_string()),
                ..config_disk()
            },
            TemplateDiskConfig {
                disk_size_gb: Some(50),
                ..config_disk()
            },
        ];

        let by_device = AttachedDisk {
            auto_delete: true,
            device_name: Some("data".to_string()),
            ..Default::default()
        };
        let by_source = AttachedDisk {
            auto_delete: true,
            source: Some(
                "https://www.googleapis.com/compute/v1/projects/p/zones/z/disks/shared"
                    .to_string(),
            ),
            ..Default::default()
        };
        let by_disk_name = AttachedDisk {
            auto_delete: true,
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_name: Some("made-for-me".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let by_characteristics = AttachedDisk {
            auto_delete: true,
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_size_gb: Some(50),
                ..Default::default()
            }),
            ..Default::default()
        };

        let api = vec![
            by_characteristics.clone(),
            by_disk_name.clone(),
            scratch_api("NVME"),
            by_source.clone(),
            boot_disk(),
            by_device.clone(),
        ];

        let result = reorder_disks(&config, api);
        assert_eq!(result.len(), 6);
        assert!(result[0].boot);
        assert_eq!(result[1], by_device);
        assert_eq!(result[2], scratch_api("NVME"));
        assert_eq!(result[3], by_source);
        assert_eq!(result[4], by_disk_name);
        assert_eq!(result[5], by_characteristics);
    }

    #[test]
    fn device_name_outranks_characteristics() {
        // Two configured disks identical except one declares a device name.
        // The response entry carrying that device name must land on the
        // declaring slot even though it also matches the other disk's shape.
        let config = vec![
            TemplateDiskConfig {
                boot: true,
                ..config_disk()
            },
            TemplateDiskConfig {
                auto_delete: false,
                disk_size_gb: Some(10),
                ..config_disk()
            },
            TemplateDiskConfig {
                auto_delete: false,
                disk_size_gb: Some(10),
                device_name: Some("disk-2".to_string()),
                ..config_disk()
            },
        ];

        let named = AttachedDisk {
            auto_delete: false,
            device_name: Some("disk-2".to_string()),
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_size_gb: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };
        let anonymous = AttachedDisk {
            auto_delete: false,
            device_name: Some("disk-1".to_string()),
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_size_gb: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = reorder_disks(&config, vec![named.clone(), anonymous.clone(), boot_disk()]);
        assert!(result[0].boot);
        assert_eq!(result[1], anonymous);
        assert_eq!(result[2], named);
    }

    #[test]
    fn scratch_disks_claim_slots_by_interface() {
        let config = vec![
            TemplateDiskConfig {
                boot: true,
                ..config_disk()
            },
            scratch_config("SCSI"),
            scratch_config("NVME"),
        ];
        let result = reorder_disks(
            &config,
            vec![scratch_api("NVME"), boot_disk(), scratch_api("SCSI")],
        );
        assert!(result[0].boot);
        assert_eq!(result[1].interface.as_deref(), Some("SCSI"));
        assert_eq!(result[2].interface.as_deref(), Some("NVME"));
    }

    #[test]
    fn length_mismatch_returns_response_order_verbatim() {
        let config = vec![TemplateDiskConfig {
            boot: true,
            ..config_disk()
        }];
        let api = vec![scratch_api("SCSI"), boot_disk()];
        let result = reorder_disks(&config, api.clone());
        assert_eq!(result, api);
    }

    #[test]
    fn unpairable_entries_append_after_matched_ones() {
        let config = vec![
            TemplateDiskConfig {
                boot: true,
                ..config_disk()
            },
            TemplateDiskConfig {
                device_name: Some("known".to_string()),
                ..config_disk()
            },
        ];
        let stranger = AttachedDisk {
            auto_delete: false,
            device_name: Some("stranger".to_string()),
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_size_gb: Some(999),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = reorder_disks(&config, vec![stranger.clone(), boot_disk()]);
        assert_eq!(result.len(), 2);
        assert!(result[0].boot);
        assert_eq!(result[1], stranger);
    }

    fn attached(device_name: &str, source: &str) -> AttachedDisk {
        AttachedDisk {
            device_name: Some(device_name.to_string()),
            source: Some(source.to_string()),
            mode: Some("READ_WRITE".to_string()),
            type_: Some("PERSISTENT".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn field_change_becomes_detach_and_attach() {
        let a = attached("da", "projects/p/zones/z/disks/a");
        let b = attached("db", "projects/p/zones/z/disks/b");
        let mut b_readonly = b.clone();
        b_readonly.mode = Some("READ_ONLY".to_string());
        let c = attached("dc", "projects/p/zones/z/disks/c");

        let live: HashSet<String> = ["da".to_string(), "db".to_string()].into();
        let diff = diff_attached_disks(
            &[a.clone(), b.clone()],
            &[b_readonly.clone(), c.clone()],
            &live,
        )
        .unwrap();

        assert_eq!(diff.detach_device_names, vec!["da", "db"]);
        assert_eq!(diff.attach, vec![b_readonly, c]);
    }

    #[test]
    fn unchanged_disk_is_untouched() {
        let a = attached("da", "projects/p/zones/z/disks/a");
        let live: HashSet<String> = ["da".to_string()].into();
        let diff = diff_attached_disks(&[a.clone()], &[a.clone()], &live).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn already_detached_disk_is_reattached_not_detached() {
        // Another actor detached the disk between plan and apply: the prior
        // entry no longer counts as attached, so the desired entry goes back
        // on and nothing is detached.
        let a = attached("da", "projects/p/zones/z/disks/a");
        let diff = diff_attached_disks(&[a.clone()], &[a.clone()], &HashSet::new()).unwrap();
        assert!(diff.detach_device_names.is_empty());
        assert_eq!(diff.attach, vec![a]);
    }
}
