//! Wire types for the compute API
//!
//! Field names follow the service's JSON representation (camelCase, with the
//! handful of legacy spellings like `networkIP` kept verbatim). Numeric
//! fields the service transmits as decimal strings use the `int64_string`
//! codec.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// (De)serialize an optional i64 the service represents as a decimal string
pub mod int64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<i64>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => ser.serialize_str(&n.to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
        match Option::<NumOrString>::deserialize(de)? {
            None => Ok(None),
            Some(NumOrString::Num(n)) => Ok(Some(n)),
            Some(NumOrString::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

// =========================================================================
// Operations
// =========================================================================

/// Async operation handle returned by every mutating call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Operation {
    pub name: String,
    /// "PENDING", "RUNNING" or "DONE"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_link: Option<String>,
    /// Self link of the zone for zonal operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Self link of the region for regional operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationError {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

// =========================================================================
// Instances
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cpu_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Server-assigned numeric id, transmitted as a decimal string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// "PROVISIONING", "RUNNING", "TERMINATED", ...
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    pub can_ip_forward: bool,
    pub deletion_protection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<AttachedDisk>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Scheduling>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guest_accelerators: Vec<AcceleratorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shielded_instance_config: Option<ShieldedInstanceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_device: Option<DisplayDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_affinity: Option<ReservationAffinity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced_machine_features: Option<AdvancedMachineFeatures>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_policies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataItem {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tags {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDisk {
    pub auto_delete: bool,
    pub boot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_encryption_key: Option<CustomerEncryptionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<AttachedDiskInitializeParams>,
    /// "SCSI" or "NVME"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// "READ_WRITE" or "READ_ONLY"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// "PERSISTENT" or "SCRATCH"
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDiskInitializeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_name: Option<String>,
    #[serde(with = "int64_string", skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(with = "int64_string", skip_serializing_if = "Option::is_none")]
    pub provisioned_iops: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerEncryptionKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_key: Option<String>,
    /// Self link of a managed key, called kmsKeyName on the wire
    #[serde(rename = "kmsKeyName", skip_serializing_if = "Option::is_none")]
    pub kms_key_self_link: Option<String>,
    /// SHA-256 of the key, only ever populated by the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Pairing of a disk source and its key, used when starting an instance
/// whose disks are customer-encrypted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerEncryptionKeyProtectedDisk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_encryption_key: Option<CustomerEncryptionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    #[serde(rename = "networkIP", skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    /// "IPV4_ONLY" or "IPV4_IPV6"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_type: Option<String>,
    /// "GVNIC" or "VIRTIO_NET"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_count: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipv6_access_configs: Vec<AccessConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alias_ip_ranges: Vec<AliasIpRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ipv6_prefix_length: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessConfig {
    /// "ONE_TO_ONE_NAT" for IPv4, "DIRECT_IPV6" for IPv6
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "natIP", skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ptr_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ipv6_prefix_length: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AliasIpRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_cidr_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork_range_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scheduling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_restart: Option<bool>,
    pub preemptible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_host_maintenance: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_affinities: Vec<SchedulingNodeAffinity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_node_cpus: Option<i64>,
    /// "STANDARD" or "SPOT"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_termination_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ssd_recovery_timeout: Option<Duration>,
}

/// Span of time with nanosecond resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Duration {
    #[serde(with = "int64_string", skip_serializing_if = "Option::is_none")]
    pub seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nanos: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingNodeAffinity {
    pub key: String,
    /// "IN" or "NOT_IN"
    pub operator: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccount {
    pub email: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcceleratorConfig {
    pub accelerator_count: i64,
    pub accelerator_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShieldedInstanceConfig {
    pub enable_secure_boot: bool,
    pub enable_vtpm: bool,
    pub enable_integrity_monitoring: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisplayDevice {
    pub enable_display: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReservationAffinity {
    /// "ANY_RESERVATION", "NO_RESERVATION" or "SPECIFIC_RESERVATION"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consume_reservation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedMachineFeatures {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_nested_virtualization: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads_per_core: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible_core_count: Option<i64>,
}

// =========================================================================
// Disks
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Disk {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(with = "int64_string", skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_encryption_key: Option<CustomerEncryptionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_fingerprint: Option<String>,
    /// Self links of instances this disk is attached to
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(with = "int64_string", skip_serializing_if = "Option::is_none")]
    pub provisioned_iops: Option<i64>,
}

// =========================================================================
// Images
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

// =========================================================================
// Instance templates
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceTemplate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    pub properties: InstanceProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cpu_platform: Option<String>,
    pub can_ip_forward: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<AttachedDisk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Scheduling>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guest_accelerators: Vec<AcceleratorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shielded_instance_config: Option<ShieldedInstanceConfig>,
}

// =========================================================================
// Routers
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Router {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bgp_peers: Vec<RouterBgpPeer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub md5_authentication_keys: Vec<RouterMd5AuthenticationKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterBgpPeer {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_asn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_route_priority: Option<i64>,
    /// "DEFAULT" or "CUSTOM"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_mode: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advertised_groups: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advertised_ip_ranges: Vec<RouterAdvertisedIpRange>,
    /// "TRUE" or "FALSE"; the service treats absent as enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_authentication_key_name: Option<String>,
    /// "MANAGED_BY_USER" or "MANAGED_BY_ATTACHMENT", set by the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterAdvertisedIpRange {
    pub range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterMd5AuthenticationKey {
    pub name: String,
    /// Write-only; the service never returns it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Partial router update; absent fields are left untouched by the service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bgp_peers: Option<Vec<RouterBgpPeer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_authentication_keys: Option<Vec<RouterMd5AuthenticationKey>>,
}

// =========================================================================
// Projects, subnetworks, zones
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_instance_metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subnetwork {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Zone {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_size_round_trips_through_string_encoding() {
        let json = r#"{"name": "data", "sizeGb": "100"}"#;
        let disk: Disk = serde_json::from_str(json).unwrap();
        assert_eq!(disk.size_gb, Some(100));

        let encoded = serde_json::to_string(&disk).unwrap();
        assert!(encoded.contains("\"sizeGb\":\"100\""));
    }

    #[test]
    fn disk_size_accepts_plain_numbers() {
        let json = r#"{"name": "data", "sizeGb": 42}"#;
        let disk: Disk = serde_json::from_str(json).unwrap();
        assert_eq!(disk.size_gb, Some(42));
    }

    #[test]
    fn network_ip_uses_legacy_spelling() {
        let nic = NetworkInterface {
            network_ip: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&nic).unwrap();
        assert!(encoded.contains("\"networkIP\""));

        let ac = AccessConfig {
            nat_ip: Some("203.0.113.5".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&ac).unwrap();
        assert!(encoded.contains("\"natIP\""));
    }

    #[test]
    fn attached_disk_type_uses_reserved_word() {
        let disk = AttachedDisk {
            type_: Some("SCRATCH".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&disk).unwrap();
        assert!(encoded.contains("\"type\":\"SCRATCH\""));
    }

    #[test]
    fn router_patch_distinguishes_absent_from_empty() {
        let untouched = RouterPatch::default();
        assert_eq!(serde_json::to_string(&untouched).unwrap(), "{}");

        let cleared = RouterPatch {
            bgp_peers: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&cleared).unwrap(),
            "{\"bgpPeers\":[]}"
        );
    }

    #[test]
    fn operation_done_check() {
        let mut op = Operation {
            name: "op-1".to_string(),
            status: "RUNNING".to_string(),
            ..Default::default()
        };
        assert!(!op.is_done());
        op.status = "DONE".to_string();
        assert!(op.is_done());
    }
}
