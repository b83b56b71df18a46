//! Per-field conversions between typed configuration and API objects
//!
//! Expand builds request fragments from the typed configuration; flatten
//! rebuilds the configuration representation from API responses. Flatten
//! output feeds the same parser the desired configuration goes through, so
//! the two directions stay inverse for every field the service echoes back.
//! Fields the service never returns (raw encryption keys) are substituted
//! from the prior configuration during flatten.
//!
//! Everything here is pure; callers resolve images and fetch disks first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv6Addr;

use vela_core::resource::Value;

use crate::api::types::{
    AcceleratorConfig, AccessConfig, AdvancedMachineFeatures, AliasIpRange, AttachedDisk,
    AttachedDiskInitializeParams, CustomerEncryptionKey, Disk, Duration, Metadata, MetadataItem,
    NetworkInterface, ReservationAffinity, Scheduling, SchedulingNodeAffinity, ServiceAccount,
    ShieldedInstanceConfig, Tags,
};
use crate::config::{
    AccessConfigConfig, AdvancedMachineFeaturesConfig, AliasIpRangeConfig, AttachedDiskConfig,
    BootDiskConfig, GuestAcceleratorConfig, Ipv6AccessConfigConfig, NetworkInterfaceConfig,
    ReservationAffinityConfig, SchedulingConfig, ScratchDiskConfig, ServiceAccountConfig,
    ShieldedConfig, TemplateDiskConfig,
};
use crate::util::{
    accelerator_type_path, disk_path, disk_type_path, name_from_self_link, network_path,
    project_from_subnetwork_link, relative_path, subnetwork_path,
};

// ===== Metadata and tags =====

/// Items are emitted in key order so request bodies compare deterministically
pub fn expand_metadata(
    metadata: &BTreeMap<String, String>,
    startup_script: Option<&str>,
    fingerprint: Option<String>,
) -> Metadata {
    let mut merged = metadata.clone();
    if let Some(script) = startup_script {
        merged.insert("startup-script".to_string(), script.to_string());
    }
    Metadata {
        fingerprint,
        items: merged
            .into_iter()
            .map(|(key, value)| MetadataItem {
                key,
                value: Some(value),
            })
            .collect(),
    }
}

/// Splits the startup script back out when the configuration declared it in
/// the dedicated field rather than as a plain metadata entry
pub fn flatten_metadata(
    metadata: Option<&Metadata>,
    script_in_dedicated_field: bool,
) -> (BTreeMap<String, String>, Option<String>) {
    let mut out = BTreeMap::new();
    let mut script = None;
    if let Some(metadata) = metadata {
        for item in &metadata.items {
            let value = item.value.clone().unwrap_or_default();
            if item.key == "startup-script" && script_in_dedicated_field {
                script = Some(value);
            } else {
                out.insert(item.key.clone(), value);
            }
        }
    }
    (out, script)
}

pub fn expand_tags(tags: &[String], fingerprint: Option<String>) -> Tags {
    Tags {
        fingerprint,
        items: tags.to_vec(),
    }
}

pub fn flatten_tags(tags: Option<&Tags>) -> Vec<String> {
    tags.map(|t| t.items.clone()).unwrap_or_default()
}

// ===== Scheduling =====

/// An absent block still produces a request object; the service default for
/// automatic restart is explicit so later diffs are stable
pub fn expand_scheduling(config: Option<&SchedulingConfig>) -> Scheduling {
    let Some(config) = config else {
        return Scheduling {
            automatic_restart: Some(true),
            ..Scheduling::default()
        };
    };
    Scheduling {
        automatic_restart: Some(config.automatic_restart),
        preemptible: config.preemptible,
        on_host_maintenance: config.on_host_maintenance.clone(),
        node_affinities: config
            .node_affinities
            .iter()
            .map(|affinity| SchedulingNodeAffinity {
                key: affinity.key.clone(),
                operator: affinity.operator.clone(),
                values: affinity.values.clone(),
            })
            .collect(),
        min_node_cpus: config.min_node_cpus,
        provisioning_model: config.provisioning_model.clone(),
        instance_termination_action: config.instance_termination_action.clone(),
        local_ssd_recovery_timeout: config.local_ssd_recovery_timeout.as_ref().map(|timeout| {
            Duration {
                seconds: Some(timeout.seconds),
                nanos: (timeout.nanos != 0).then_some(timeout.nanos),
            }
        }),
    }
}

pub fn flatten_scheduling(scheduling: Option<&Scheduling>) -> Value {
    let mut map = HashMap::new();
    let automatic_restart = scheduling
        .and_then(|s| s.automatic_restart)
        .unwrap_or(true);
    map.insert("automatic_restart".to_string(), Value::from(automatic_restart));
    map.insert(
        "preemptible".to_string(),
        Value::from(scheduling.map(|s| s.preemptible).unwrap_or(false)),
    );
    if let Some(scheduling) = scheduling {
        put(&mut map, "on_host_maintenance", scheduling.on_host_maintenance.as_deref());
        if !scheduling.node_affinities.is_empty() {
            map.insert(
                "node_affinities".to_string(),
                Value::blocks(
                    scheduling
                        .node_affinities
                        .iter()
                        .map(|affinity| {
                            let mut entry = HashMap::new();
                            entry.insert("key".to_string(), Value::from(affinity.key.as_str()));
                            entry.insert(
                                "operator".to_string(),
                                Value::from(affinity.operator.as_str()),
                            );
                            entry.insert(
                                "values".to_string(),
                                Value::List(
                                    affinity.values.iter().map(|v| Value::from(v.as_str())).collect(),
                                ),
                            );
                            entry
                        })
                        .collect(),
                ),
            );
        }
        put(&mut map, "min_node_cpus", scheduling.min_node_cpus);
        put(&mut map, "provisioning_model", scheduling.provisioning_model.as_deref());
        put(
            &mut map,
            "instance_termination_action",
            scheduling.instance_termination_action.as_deref(),
        );
        if let Some(timeout) = &scheduling.local_ssd_recovery_timeout {
            let mut entry = HashMap::new();
            entry.insert(
                "seconds".to_string(),
                Value::from(timeout.seconds.unwrap_or(0)),
            );
            if let Some(nanos) = timeout.nanos {
                entry.insert("nanos".to_string(), Value::from(nanos));
            }
            map.insert(
                "local_ssd_recovery_timeout".to_string(),
                Value::blocks(vec![entry]),
            );
        }
    }
    Value::blocks(vec![map])
}

/// Desired blocks inherit unset optional fields from the prior block, so an
/// omitted field never reads as a change back to the default
pub fn merge_scheduling(
    old: Option<&SchedulingConfig>,
    new: Option<&SchedulingConfig>,
) -> SchedulingConfig {
    let old = normalized_scheduling(old);
    let mut merged = normalized_scheduling(new);
    if merged.on_host_maintenance.is_none() {
        merged.on_host_maintenance = old.on_host_maintenance.clone();
    }
    if merged.provisioning_model.is_none() {
        merged.provisioning_model = old.provisioning_model.clone();
    }
    if merged.instance_termination_action.is_none() {
        merged.instance_termination_action = old.instance_termination_action.clone();
    }
    if merged.min_node_cpus.is_none() {
        merged.min_node_cpus = old.min_node_cpus;
    }
    merged
}

pub fn normalized_scheduling(config: Option<&SchedulingConfig>) -> SchedulingConfig {
    config.cloned().unwrap_or(SchedulingConfig {
        automatic_restart: true,
        preemptible: false,
        on_host_maintenance: None,
        node_affinities: Vec::new(),
        min_node_cpus: None,
        provisioning_model: None,
        instance_termination_action: None,
        local_ssd_recovery_timeout: None,
    })
}

pub fn scheduling_changed(old: Option<&SchedulingConfig>, new: Option<&SchedulingConfig>) -> bool {
    normalized_scheduling(old) != merge_scheduling(old, new)
}

/// Node affinity changes cannot be applied to a running instance; everything
/// else in the scheduling block can
pub fn scheduling_requires_reboot(
    old: Option<&SchedulingConfig>,
    new: Option<&SchedulingConfig>,
) -> bool {
    normalized_scheduling(old).node_affinities != normalized_scheduling(new).node_affinities
}

// ===== Service accounts =====

const SCOPE_ALIASES: &[(&str, &str)] = &[
    ("bigquery", "https://www.googleapis.com/auth/bigquery"),
    ("cloud-platform", "https://www.googleapis.com/auth/cloud-platform"),
    ("cloud-source-repos", "https://www.googleapis.com/auth/source.full_control"),
    ("cloud-source-repos-ro", "https://www.googleapis.com/auth/source.read_only"),
    ("compute-ro", "https://www.googleapis.com/auth/compute.readonly"),
    ("compute-rw", "https://www.googleapis.com/auth/compute"),
    ("datastore", "https://www.googleapis.com/auth/datastore"),
    ("logging-write", "https://www.googleapis.com/auth/logging.write"),
    ("monitoring", "https://www.googleapis.com/auth/monitoring"),
    ("monitoring-read", "https://www.googleapis.com/auth/monitoring.read"),
    ("monitoring-write", "https://www.googleapis.com/auth/monitoring.write"),
    ("pubsub", "https://www.googleapis.com/auth/pubsub"),
    ("service-control", "https://www.googleapis.com/auth/servicecontrol"),
    ("service-management", "https://www.googleapis.com/auth/service.management.readonly"),
    ("sql", "https://www.googleapis.com/auth/sqlservice"),
    ("sql-admin", "https://www.googleapis.com/auth/sqlservice.admin"),
    ("storage-full", "https://www.googleapis.com/auth/devstorage.full_control"),
    ("storage-ro", "https://www.googleapis.com/auth/devstorage.read_only"),
    ("storage-rw", "https://www.googleapis.com/auth/devstorage.read_write"),
    ("taskqueue", "https://www.googleapis.com/auth/taskqueue"),
    ("trace", "https://www.googleapis.com/auth/trace.append"),
    ("useraccounts-ro", "https://www.googleapis.com/auth/cloud.useraccounts.readonly"),
    ("useraccounts-rw", "https://www.googleapis.com/auth/cloud.useraccounts"),
    ("userinfo-email", "https://www.googleapis.com/auth/userinfo.email"),
];

/// Short scope aliases accepted in configuration expand to the full auth URL
pub fn canonicalize_scope(scope: &str) -> String {
    for (alias, url) in SCOPE_ALIASES {
        if *alias == scope {
            return (*url).to_string();
        }
    }
    scope.to_string()
}

pub fn expand_service_accounts(config: Option<&ServiceAccountConfig>) -> Vec<ServiceAccount> {
    let Some(config) = config else {
        return Vec::new();
    };
    let email = match config.email.as_deref() {
        Some(email) if !email.is_empty() => email.to_string(),
        _ => "default".to_string(),
    };
    vec![ServiceAccount {
        email,
        scopes: config.scopes.iter().map(|s| canonicalize_scope(s)).collect(),
    }]
}

pub fn flatten_service_accounts(accounts: &[ServiceAccount]) -> Value {
    Value::blocks(
        accounts
            .iter()
            .map(|account| {
                let mut map = HashMap::new();
                map.insert("email".to_string(), Value::from(account.email.as_str()));
                map.insert(
                    "scopes".to_string(),
                    Value::List(account.scopes.iter().map(|s| Value::from(s.as_str())).collect()),
                );
                map
            })
            .collect(),
    )
}

pub fn scopes_equal(a: &[String], b: &[String]) -> bool {
    let canon = |scopes: &[String]| {
        scopes
            .iter()
            .map(|s| canonicalize_scope(s))
            .collect::<HashSet<_>>()
    };
    canon(a) == canon(b)
}

/// An absent block and a block carrying no email and no scopes describe the
/// same remote state
pub fn service_accounts_equal(
    a: Option<&ServiceAccountConfig>,
    b: Option<&ServiceAccountConfig>,
) -> bool {
    let is_empty = |sa: Option<&ServiceAccountConfig>| match sa {
        None => true,
        Some(sa) => sa.scopes.is_empty() && sa.email.as_deref().unwrap_or("").is_empty(),
    };
    if is_empty(a) && is_empty(b) {
        return true;
    }
    match (a, b) {
        (Some(x), Some(y)) => {
            let email = |sa: &ServiceAccountConfig| match sa.email.as_deref() {
                Some(e) if !e.is_empty() => e.to_string(),
                _ => "default".to_string(),
            };
            email(x) == email(y) && scopes_equal(&x.scopes, &y.scopes)
        }
        _ => false,
    }
}

// ===== Network interfaces =====

pub fn expand_network_interfaces(
    configs: &[NetworkInterfaceConfig],
    project: &str,
    region: &str,
) -> Vec<NetworkInterface> {
    configs
        .iter()
        .map(|config| {
            let subnet_project = config.subnetwork_project.as_deref().unwrap_or(project);
            NetworkInterface {
                network: config.network.as_ref().map(|n| network_path(project, n)),
                subnetwork: config
                    .subnetwork
                    .as_ref()
                    .map(|s| subnetwork_path(subnet_project, region, s)),
                network_ip: config.network_ip.clone(),
                stack_type: config.stack_type.clone(),
                nic_type: config.nic_type.clone(),
                queue_count: config.queue_count,
                access_configs: expand_access_configs(&config.access_configs),
                ipv6_access_configs: expand_ipv6_access_configs(&config.ipv6_access_configs),
                alias_ip_ranges: expand_alias_ip_ranges(&config.alias_ip_ranges),
                ..NetworkInterface::default()
            }
        })
        .collect()
}

pub fn expand_access_configs(configs: &[AccessConfigConfig]) -> Vec<AccessConfig> {
    configs
        .iter()
        .map(|config| AccessConfig {
            type_: Some("ONE_TO_ONE_NAT".to_string()),
            nat_ip: config.nat_ip.clone(),
            network_tier: config.network_tier.clone(),
            public_ptr_domain_name: config.public_ptr_domain_name.clone(),
            ..AccessConfig::default()
        })
        .collect()
}

pub fn expand_ipv6_access_configs(configs: &[Ipv6AccessConfigConfig]) -> Vec<AccessConfig> {
    configs
        .iter()
        .map(|config| AccessConfig {
            type_: Some("DIRECT_IPV6".to_string()),
            network_tier: config.network_tier.clone(),
            public_ptr_domain_name: config.public_ptr_domain_name.clone(),
            ..AccessConfig::default()
        })
        .collect()
}

pub fn expand_alias_ip_ranges(configs: &[AliasIpRangeConfig]) -> Vec<AliasIpRange> {
    configs
        .iter()
        .map(|config| AliasIpRange {
            ip_cidr_range: Some(config.ip_cidr_range.clone()),
            subnetwork_range_name: config.subnetwork_range_name.clone(),
        })
        .collect()
}

pub fn flatten_network_interfaces(interfaces: &[NetworkInterface]) -> Value {
    Value::blocks(
        interfaces
            .iter()
            .map(|interface| {
                let mut map = HashMap::new();
                put(&mut map, "name", interface.name.as_deref());
                put(
                    &mut map,
                    "network",
                    interface.network.as_deref().map(relative_path),
                );
                put(
                    &mut map,
                    "subnetwork",
                    interface.subnetwork.as_deref().map(relative_path),
                );
                put(
                    &mut map,
                    "subnetwork_project",
                    interface
                        .subnetwork
                        .as_deref()
                        .and_then(project_from_subnetwork_link),
                );
                put(&mut map, "network_ip", interface.network_ip.as_deref());
                put(&mut map, "stack_type", interface.stack_type.as_deref());
                put(&mut map, "nic_type", interface.nic_type.as_deref());
                put(&mut map, "queue_count", interface.queue_count);
                put(&mut map, "ipv6_address", interface.ipv6_address.as_deref());
                if !interface.access_configs.is_empty() {
                    map.insert(
                        "access_config".to_string(),
                        flatten_access_configs(&interface.access_configs),
                    );
                }
                if !interface.ipv6_access_configs.is_empty() {
                    map.insert(
                        "ipv6_access_config".to_string(),
                        flatten_ipv6_access_configs(&interface.ipv6_access_configs),
                    );
                }
                if !interface.alias_ip_ranges.is_empty() {
                    map.insert(
                        "alias_ip_range".to_string(),
                        flatten_alias_ip_ranges(&interface.alias_ip_ranges),
                    );
                }
                map
            })
            .collect(),
    )
}

pub fn flatten_access_configs(configs: &[AccessConfig]) -> Value {
    Value::blocks(
        configs
            .iter()
            .map(|config| {
                let mut map = HashMap::new();
                put(&mut map, "nat_ip", config.nat_ip.as_deref());
                put(&mut map, "network_tier", config.network_tier.as_deref());
                put(
                    &mut map,
                    "public_ptr_domain_name",
                    config.public_ptr_domain_name.as_deref(),
                );
                map
            })
            .collect(),
    )
}

/// The external prefix length flattens as a string, matching how the legacy
/// state stored it
pub fn flatten_ipv6_access_configs(configs: &[AccessConfig]) -> Value {
    Value::blocks(
        configs
            .iter()
            .map(|config| {
                let mut map = HashMap::new();
                put(&mut map, "name", config.name.as_deref());
                put(&mut map, "network_tier", config.network_tier.as_deref());
                put(
                    &mut map,
                    "public_ptr_domain_name",
                    config.public_ptr_domain_name.as_deref(),
                );
                put(&mut map, "external_ipv6", config.external_ipv6.as_deref());
                put(
                    &mut map,
                    "external_ipv6_prefix_length",
                    config
                        .external_ipv6_prefix_length
                        .map(|length| length.to_string()),
                );
                map
            })
            .collect(),
    )
}

pub fn flatten_alias_ip_ranges(ranges: &[AliasIpRange]) -> Value {
    Value::blocks(
        ranges
            .iter()
            .map(|range| {
                let mut map = HashMap::new();
                put(&mut map, "ip_cidr_range", range.ip_cidr_range.as_deref());
                put(
                    &mut map,
                    "subnetwork_range_name",
                    range.subnetwork_range_name.as_deref(),
                );
                map
            })
            .collect(),
    )
}

/// Textual IPv6 variants of one address compare equal; unparsable values
/// fall back to string comparison
pub fn ipv6_equal(a: &str, b: &str) -> bool {
    match (a.parse::<Ipv6Addr>(), b.parse::<Ipv6Addr>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

// ===== Accelerators, shielded config, reservations, machine features =====

/// Entries with a zero count are dropped; they describe "no accelerator"
pub fn expand_guest_accelerators(
    configs: &[GuestAcceleratorConfig],
    zone: &str,
) -> Vec<AcceleratorConfig> {
    configs
        .iter()
        .filter(|config| config.count != 0)
        .map(|config| AcceleratorConfig {
            accelerator_count: config.count,
            accelerator_type: accelerator_type_path(zone, &config.accelerator_type),
        })
        .collect()
}

pub fn flatten_guest_accelerators(accelerators: &[AcceleratorConfig]) -> Value {
    Value::blocks(
        accelerators
            .iter()
            .map(|accelerator| {
                let mut map = HashMap::new();
                map.insert(
                    "type".to_string(),
                    Value::from(accelerator.accelerator_type.as_str()),
                );
                map.insert("count".to_string(), Value::from(accelerator.accelerator_count));
                map
            })
            .collect(),
    )
}

pub fn guest_accelerators_equal(a: &[GuestAcceleratorConfig], b: &[GuestAcceleratorConfig]) -> bool {
    let norm = |configs: &[GuestAcceleratorConfig]| {
        configs
            .iter()
            .filter(|config| config.count != 0)
            .cloned()
            .collect::<Vec<_>>()
    };
    norm(a) == norm(b)
}

/// An unset platform and the literal "Automatic" describe the same request
pub fn min_cpu_platform_equal(a: &str, b: &str) -> bool {
    fn norm(s: &str) -> &str {
        if s.eq_ignore_ascii_case("automatic") {
            ""
        } else {
            s
        }
    }
    norm(a) == norm(b)
}

pub fn expand_shielded_config(config: Option<&ShieldedConfig>) -> Option<ShieldedInstanceConfig> {
    config.map(|config| ShieldedInstanceConfig {
        enable_secure_boot: config.enable_secure_boot,
        enable_vtpm: config.enable_vtpm,
        enable_integrity_monitoring: config.enable_integrity_monitoring,
    })
}

pub fn flatten_shielded_config(config: Option<&ShieldedInstanceConfig>) -> Value {
    let Some(config) = config else {
        return Value::blocks(Vec::new());
    };
    let mut map = HashMap::new();
    map.insert(
        "enable_secure_boot".to_string(),
        Value::from(config.enable_secure_boot),
    );
    map.insert("enable_vtpm".to_string(), Value::from(config.enable_vtpm));
    map.insert(
        "enable_integrity_monitoring".to_string(),
        Value::from(config.enable_integrity_monitoring),
    );
    Value::blocks(vec![map])
}

pub fn expand_reservation_affinity(
    config: Option<&ReservationAffinityConfig>,
) -> Option<ReservationAffinity> {
    config.map(|config| ReservationAffinity {
        consume_reservation_type: Some(config.affinity_type.clone()),
        key: config
            .specific_reservation
            .as_ref()
            .map(|specific| specific.key.clone()),
        values: config
            .specific_reservation
            .as_ref()
            .map(|specific| specific.values.clone())
            .unwrap_or_default(),
    })
}

pub fn flatten_reservation_affinity(affinity: Option<&ReservationAffinity>) -> Value {
    let Some(affinity) = affinity else {
        return Value::blocks(Vec::new());
    };
    let mut map = HashMap::new();
    put(&mut map, "type", affinity.consume_reservation_type.as_deref());
    if let Some(key) = &affinity.key {
        let mut specific = HashMap::new();
        specific.insert("key".to_string(), Value::from(key.as_str()));
        specific.insert(
            "values".to_string(),
            Value::List(affinity.values.iter().map(|v| Value::from(v.as_str())).collect()),
        );
        map.insert(
            "specific_reservation".to_string(),
            Value::blocks(vec![specific]),
        );
    }
    Value::blocks(vec![map])
}

pub fn expand_advanced_machine_features(
    config: Option<&AdvancedMachineFeaturesConfig>,
) -> Option<AdvancedMachineFeatures> {
    config.map(|config| AdvancedMachineFeatures {
        enable_nested_virtualization: Some(config.enable_nested_virtualization),
        threads_per_core: config.threads_per_core,
        visible_core_count: config.visible_core_count,
    })
}

pub fn flatten_advanced_machine_features(features: Option<&AdvancedMachineFeatures>) -> Value {
    let Some(features) = features else {
        return Value::blocks(Vec::new());
    };
    let mut map = HashMap::new();
    map.insert(
        "enable_nested_virtualization".to_string(),
        Value::from(features.enable_nested_virtualization.unwrap_or(false)),
    );
    put(&mut map, "threads_per_core", features.threads_per_core);
    put(&mut map, "visible_core_count", features.visible_core_count);
    Value::blocks(vec![map])
}

// ===== Disks =====

fn encryption_key(raw: Option<&str>, kms: Option<&str>) -> Option<CustomerEncryptionKey> {
    if raw.is_none() && kms.is_none() {
        return None;
    }
    Some(CustomerEncryptionKey {
        raw_key: raw.map(str::to_string),
        kms_key_self_link: kms.map(str::to_string),
        sha256: None,
    })
}

pub fn expand_boot_disk(
    config: &BootDiskConfig,
    project: &str,
    zone: &str,
    resolved_image: Option<String>,
) -> AttachedDisk {
    AttachedDisk {
        auto_delete: config.auto_delete,
        boot: true,
        device_name: config.device_name.clone(),
        disk_encryption_key: encryption_key(
            config.disk_encryption_key_raw.as_deref(),
            config.kms_key_self_link.as_deref(),
        ),
        initialize_params: config.initialize_params.as_ref().map(|params| {
            AttachedDiskInitializeParams {
                disk_size_gb: params.size,
                disk_type: params.disk_type.as_ref().map(|t| disk_type_path(zone, t)),
                source_image: resolved_image,
                labels: (!params.labels.is_empty()).then(|| params.labels.clone()),
                provisioned_iops: params.provisioned_iops,
                ..AttachedDiskInitializeParams::default()
            }
        }),
        mode: Some("READ_WRITE".to_string()),
        source: config.source.as_ref().map(|s| disk_path(project, zone, s)),
        ..AttachedDisk::default()
    }
}

/// The boot disk's size, type, and image live on the disk resource, not the
/// attachment, so flatten takes the fetched disk alongside it. When the disk
/// could not be fetched, the prior initialize_params are carried forward
/// unchanged rather than dropped.
pub fn flatten_boot_disk(
    attached: &AttachedDisk,
    full: Option<&Disk>,
    prior: Option<&BootDiskConfig>,
) -> Value {
    let mut map = HashMap::new();
    map.insert("auto_delete".to_string(), Value::from(attached.auto_delete));
    put(&mut map, "device_name", attached.device_name.as_deref());
    put(&mut map, "source", attached.source.as_deref().map(relative_path));
    if let Some(key) = &attached.disk_encryption_key {
        put(&mut map, "disk_encryption_key_sha256", key.sha256.as_deref());
        put(&mut map, "kms_key_self_link", key.kms_key_self_link.as_deref());
    }
    if let Some(raw) = prior.and_then(|p| p.disk_encryption_key_raw.as_deref()) {
        map.insert("disk_encryption_key_raw".to_string(), Value::from(raw));
    }
    if let Some(disk) = full {
        let mut params = HashMap::new();
        put(&mut params, "size", disk.size_gb);
        put(
            &mut params,
            "type",
            disk.type_.as_deref().map(name_from_self_link),
        );
        put(
            &mut params,
            "image",
            disk.source_image.as_deref().map(relative_path),
        );
        if let Some(labels) = &disk.labels
            && !labels.is_empty()
        {
            params.insert(
                "labels".to_string(),
                Value::Map(
                    labels
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            );
        }
        put(&mut params, "provisioned_iops", disk.provisioned_iops);
        map.insert("initialize_params".to_string(), Value::blocks(vec![params]));
    } else if let Some(config) = prior.and_then(|p| p.initialize_params.as_ref()) {
        let mut params = HashMap::new();
        put(&mut params, "size", config.size);
        put(&mut params, "type", config.disk_type.as_deref());
        put(&mut params, "image", config.image.as_deref());
        if !config.labels.is_empty() {
            params.insert(
                "labels".to_string(),
                Value::Map(
                    config
                        .labels
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            );
        }
        put(&mut params, "provisioned_iops", config.provisioned_iops);
        map.insert("initialize_params".to_string(), Value::blocks(vec![params]));
    }
    Value::blocks(vec![map])
}

pub fn expand_scratch_disks(configs: &[ScratchDiskConfig], zone: &str) -> Vec<AttachedDisk> {
    configs
        .iter()
        .map(|config| AttachedDisk {
            auto_delete: true,
            boot: false,
            interface: Some(config.interface.clone()),
            type_: Some("SCRATCH".to_string()),
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_type: Some(disk_type_path(zone, "local-ssd")),
                disk_size_gb: Some(config.size),
                ..AttachedDiskInitializeParams::default()
            }),
            ..AttachedDisk::default()
        })
        .collect()
}

pub fn flatten_scratch_disks(disks: &[AttachedDisk]) -> Value {
    Value::blocks(
        disks
            .iter()
            .map(|disk| {
                let mut map = HashMap::new();
                map.insert(
                    "interface".to_string(),
                    Value::from(disk.interface.as_deref().unwrap_or("SCSI")),
                );
                map.insert(
                    "size".to_string(),
                    Value::from(
                        disk.initialize_params
                            .as_ref()
                            .and_then(|params| params.disk_size_gb)
                            .unwrap_or(375),
                    ),
                );
                map
            })
            .collect(),
    )
}

pub fn expand_attached_disk(config: &AttachedDiskConfig, project: &str, zone: &str) -> AttachedDisk {
    AttachedDisk {
        boot: false,
        auto_delete: false,
        device_name: config.device_name.clone(),
        disk_encryption_key: encryption_key(
            config.disk_encryption_key_raw.as_deref(),
            config.kms_key_self_link.as_deref(),
        ),
        mode: Some(config.mode.clone()),
        source: Some(disk_path(project, zone, &config.source)),
        type_: Some("PERSISTENT".to_string()),
        ..AttachedDisk::default()
    }
}

/// Raw keys never come back from the service; each flattened entry recovers
/// its key from the prior entry naming the same disk
pub fn flatten_attached_disks(disks: &[AttachedDisk], prior: &[AttachedDiskConfig]) -> Value {
    let mut prior_keys: Vec<(&str, &str)> = prior
        .iter()
        .filter_map(|config| {
            config
                .disk_encryption_key_raw
                .as_deref()
                .map(|raw| (name_from_self_link(&config.source), raw))
        })
        .collect();
    Value::blocks(
        disks
            .iter()
            .map(|disk| {
                let mut map = HashMap::new();
                put(&mut map, "source", disk.source.as_deref().map(relative_path));
                put(&mut map, "device_name", disk.device_name.as_deref());
                map.insert(
                    "mode".to_string(),
                    Value::from(disk.mode.as_deref().unwrap_or("READ_WRITE")),
                );
                if let Some(key) = &disk.disk_encryption_key {
                    put(&mut map, "disk_encryption_key_sha256", key.sha256.as_deref());
                    put(&mut map, "kms_key_self_link", key.kms_key_self_link.as_deref());
                }
                if let Some(source) = disk.source.as_deref() {
                    let disk_name = name_from_self_link(source);
                    if let Some(pos) = prior_keys.iter().position(|(name, _)| *name == disk_name) {
                        let (_, raw) = prior_keys.remove(pos);
                        map.insert("disk_encryption_key_raw".to_string(), Value::from(raw));
                    }
                }
                map
            })
            .collect(),
    )
}

pub fn expand_template_disk(
    config: &TemplateDiskConfig,
    resolved_image: Option<String>,
) -> AttachedDisk {
    AttachedDisk {
        auto_delete: config.auto_delete,
        boot: config.boot,
        device_name: config.device_name.clone(),
        interface: config.interface.clone(),
        mode: Some(config.mode.clone()),
        source: config.source.clone(),
        type_: Some(config.disk_kind.clone()),
        initialize_params: config.source.is_none().then(|| AttachedDiskInitializeParams {
            disk_name: config.disk_name.clone(),
            disk_size_gb: config.disk_size_gb,
            disk_type: config.disk_type.clone(),
            source_image: resolved_image,
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            provisioned_iops: config.provisioned_iops,
        }),
        ..AttachedDisk::default()
    }
}

pub fn flatten_template_disks(disks: &[AttachedDisk]) -> Value {
    Value::blocks(
        disks
            .iter()
            .map(|disk| {
                let mut map = HashMap::new();
                map.insert("auto_delete".to_string(), Value::from(disk.auto_delete));
                map.insert("boot".to_string(), Value::from(disk.boot));
                put(&mut map, "device_name", disk.device_name.as_deref());
                put(&mut map, "interface", disk.interface.as_deref());
                map.insert(
                    "mode".to_string(),
                    Value::from(disk.mode.as_deref().unwrap_or("READ_WRITE")),
                );
                put(&mut map, "source", disk.source.as_deref());
                map.insert(
                    "type".to_string(),
                    Value::from(disk.type_.as_deref().unwrap_or("PERSISTENT")),
                );
                if let Some(params) = &disk.initialize_params {
                    put(&mut map, "disk_name", params.disk_name.as_deref());
                    put(&mut map, "disk_size_gb", params.disk_size_gb);
                    put(&mut map, "disk_type", params.disk_type.as_deref());
                    put(
                        &mut map,
                        "source_image",
                        params.source_image.as_deref().map(relative_path),
                    );
                    if let Some(labels) = &params.labels
                        && !labels.is_empty()
                    {
                        map.insert(
                            "labels".to_string(),
                            Value::Map(
                                labels
                                    .iter()
                                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                                    .collect(),
                            ),
                        );
                    }
                    put(&mut map, "provisioned_iops", params.provisioned_iops);
                }
                map
            })
            .collect(),
    )
}

fn put<V: Into<Value>>(map: &mut HashMap<String, Value>, key: &str, value: Option<V>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value.into());
    }
}
