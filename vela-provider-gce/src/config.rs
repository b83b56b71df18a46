//! Typed configuration extraction
//!
//! Resource attributes arrive as a loose `Value` tree. Each resource kind is
//! parsed here, once per operation, into a typed config struct; structural
//! problems (wrong types, missing required fields, mutually exclusive fields
//! both set) are rejected at this boundary so the codec and orchestrator can
//! assume a well-formed tree.

use std::collections::{BTreeMap, HashMap};

use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, Value};

// ===== Block access =====

/// A view over one attribute map, tracking its dotted path for error messages
pub(crate) struct Block<'a> {
    path: String,
    fields: &'a HashMap<String, Value>,
}

impl<'a> Block<'a> {
    pub fn root(fields: &'a HashMap<String, Value>) -> Self {
        Block {
            path: String::new(),
            fields,
        }
    }

    pub fn at(path: impl Into<String>, fields: &'a HashMap<String, Value>) -> Self {
        Block {
            path: path.into(),
            fields,
        }
    }

    fn field(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn type_error(&self, key: &str, expected: &str) -> ProviderError {
        ProviderError::invalid_input(self.field(key), format!("expected {}", expected))
    }

    pub fn get_str(&self, key: &str) -> ProviderResult<Option<&'a str>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "a string")),
        }
    }

    pub fn get_string(&self, key: &str) -> ProviderResult<Option<String>> {
        Ok(self.get_str(key)?.map(str::to_string))
    }

    /// Non-empty string or an error naming the field
    pub fn require_str(&self, key: &str) -> ProviderResult<String> {
        match self.get_str(key)? {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(ProviderError::invalid_input(
                self.field(key),
                "required but not set",
            )),
        }
    }

    pub fn get_i64(&self, key: &str) -> ProviderResult<Option<i64>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_int()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "an integer")),
        }
    }

    pub fn require_i64(&self, key: &str) -> ProviderResult<i64> {
        self.get_i64(key)?.ok_or_else(|| {
            ProviderError::invalid_input(self.field(key), "required but not set")
        })
    }

    pub fn get_bool(&self, key: &str) -> ProviderResult<Option<bool>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "a boolean")),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> ProviderResult<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    pub fn string_list(&self, key: &str) -> ProviderResult<Vec<String>> {
        match self.fields.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.type_error(key, "a list of strings"))
                })
                .collect(),
            Some(_) => Err(self.type_error(key, "a list of strings")),
        }
    }

    pub fn string_map(&self, key: &str) -> ProviderResult<BTreeMap<String, String>> {
        match self.fields.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Map(entries)) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    let v = v
                        .as_str()
                        .ok_or_else(|| self.type_error(key, "a map of strings"))?;
                    out.insert(k.clone(), v.to_string());
                }
                Ok(out)
            }
            Some(_) => Err(self.type_error(key, "a map of strings")),
        }
    }

    /// A repeated block: a list whose items are attribute maps
    pub fn blocks(&self, key: &str) -> ProviderResult<Vec<Block<'a>>> {
        match self.fields.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let fields = item
                        .as_map()
                        .ok_or_else(|| self.type_error(key, "a list of blocks"))?;
                    out.push(Block {
                        path: format!("{}.{}", self.field(key), i),
                        fields,
                    });
                }
                Ok(out)
            }
            Some(_) => Err(self.type_error(key, "a list of blocks")),
        }
    }

    /// A block that may appear at most once
    pub fn single_block(&self, key: &str) -> ProviderResult<Option<Block<'a>>> {
        let mut blocks = self.blocks(key)?;
        if blocks.len() > 1 {
            return Err(ProviderError::invalid_input(
                self.field(key),
                "at most one block may be given",
            ));
        }
        Ok(blocks.pop())
    }

    pub fn require_single_block(&self, key: &str) -> ProviderResult<Block<'a>> {
        self.single_block(key)?.ok_or_else(|| {
            ProviderError::invalid_input(self.field(key), "required but not set")
        })
    }
}

// ===== Instance =====

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub zone: Option<String>,
    pub machine_type: String,
    pub description: Option<String>,
    pub hostname: Option<String>,
    pub min_cpu_platform: Option<String>,
    pub can_ip_forward: bool,
    pub deletion_protection: bool,
    pub allow_stopping_for_update: bool,
    pub desired_status: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub metadata_startup_script: Option<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub resource_policies: Vec<String>,
    pub boot_disk: BootDiskConfig,
    pub scratch_disks: Vec<ScratchDiskConfig>,
    pub attached_disks: Vec<AttachedDiskConfig>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub scheduling: Option<SchedulingConfig>,
    pub service_account: Option<ServiceAccountConfig>,
    pub guest_accelerators: Vec<GuestAcceleratorConfig>,
    pub shielded_instance_config: Option<ShieldedConfig>,
    pub enable_display: bool,
    pub reservation_affinity: Option<ReservationAffinityConfig>,
    pub advanced_machine_features: Option<AdvancedMachineFeaturesConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootDiskConfig {
    pub auto_delete: bool,
    pub device_name: Option<String>,
    pub disk_encryption_key_raw: Option<String>,
    pub kms_key_self_link: Option<String>,
    pub source: Option<String>,
    pub initialize_params: Option<InitializeParamsConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeParamsConfig {
    pub size: Option<i64>,
    pub disk_type: Option<String>,
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub provisioned_iops: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScratchDiskConfig {
    pub interface: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachedDiskConfig {
    pub source: String,
    pub device_name: Option<String>,
    pub mode: String,
    pub disk_encryption_key_raw: Option<String>,
    pub kms_key_self_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInterfaceConfig {
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub subnetwork_project: Option<String>,
    pub network_ip: Option<String>,
    pub stack_type: Option<String>,
    pub nic_type: Option<String>,
    pub queue_count: Option<i64>,
    pub access_configs: Vec<AccessConfigConfig>,
    pub ipv6_access_configs: Vec<Ipv6AccessConfigConfig>,
    pub alias_ip_ranges: Vec<AliasIpRangeConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessConfigConfig {
    pub nat_ip: Option<String>,
    pub network_tier: Option<String>,
    pub public_ptr_domain_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ipv6AccessConfigConfig {
    pub network_tier: Option<String>,
    pub public_ptr_domain_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasIpRangeConfig {
    pub ip_cidr_range: String,
    pub subnetwork_range_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConfig {
    pub automatic_restart: bool,
    pub preemptible: bool,
    pub on_host_maintenance: Option<String>,
    pub node_affinities: Vec<NodeAffinityConfig>,
    pub min_node_cpus: Option<i64>,
    pub provisioning_model: Option<String>,
    pub instance_termination_action: Option<String>,
    pub local_ssd_recovery_timeout: Option<DurationConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurationConfig {
    pub seconds: i64,
    pub nanos: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeAffinityConfig {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAccountConfig {
    pub email: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuestAcceleratorConfig {
    pub accelerator_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShieldedConfig {
    pub enable_secure_boot: bool,
    pub enable_vtpm: bool,
    pub enable_integrity_monitoring: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationAffinityConfig {
    pub affinity_type: String,
    pub specific_reservation: Option<SpecificReservationConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecificReservationConfig {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvancedMachineFeaturesConfig {
    pub enable_nested_virtualization: bool,
    pub threads_per_core: Option<i64>,
    pub visible_core_count: Option<i64>,
}

impl InstanceConfig {
    pub fn from_resource(resource: &Resource) -> ProviderResult<InstanceConfig> {
        Self::from_attributes(&resource.attributes)
    }

    /// Attribute maps come from either a desired resource or a prior state
    pub fn from_attributes(attributes: &HashMap<String, Value>) -> ProviderResult<InstanceConfig> {
        let block = Block::root(attributes);

        let metadata = block.string_map("metadata")?;
        let metadata_startup_script = block.get_string("metadata_startup_script")?;
        if metadata_startup_script.is_some() && metadata.contains_key("startup-script") {
            return Err(ProviderError::invalid_input(
                "metadata.startup-script",
                "conflicts with metadata_startup_script; declare the script in one place",
            ));
        }

        let desired_status = block.get_string("desired_status")?;
        if let Some(status) = &desired_status
            && status != "RUNNING"
            && status != "TERMINATED"
        {
            return Err(ProviderError::invalid_input(
                "desired_status",
                format!("must be RUNNING or TERMINATED, got {}", status),
            ));
        }

        let network_interfaces = block
            .blocks("network_interface")?
            .iter()
            .map(parse_network_interface)
            .collect::<ProviderResult<Vec<_>>>()?;
        if network_interfaces.is_empty() {
            return Err(ProviderError::invalid_input(
                "network_interface",
                "at least one interface is required",
            ));
        }

        Ok(InstanceConfig {
            name: block.require_str("name")?,
            zone: block.get_string("zone")?,
            machine_type: block.require_str("machine_type")?,
            description: block.get_string("description")?,
            hostname: block.get_string("hostname")?,
            min_cpu_platform: block.get_string("min_cpu_platform")?,
            can_ip_forward: block.bool_or("can_ip_forward", false)?,
            deletion_protection: block.bool_or("deletion_protection", false)?,
            allow_stopping_for_update: block.bool_or("allow_stopping_for_update", false)?,
            desired_status,
            metadata,
            metadata_startup_script,
            tags: block.string_list("tags")?,
            labels: block.string_map("labels")?,
            resource_policies: block.string_list("resource_policies")?,
            boot_disk: parse_boot_disk(&block.require_single_block("boot_disk")?)?,
            scratch_disks: block
                .blocks("scratch_disk")?
                .iter()
                .map(parse_scratch_disk)
                .collect::<ProviderResult<Vec<_>>>()?,
            attached_disks: block
                .blocks("attached_disk")?
                .iter()
                .map(parse_attached_disk)
                .collect::<ProviderResult<Vec<_>>>()?,
            network_interfaces,
            scheduling: block
                .single_block("scheduling")?
                .as_ref()
                .map(parse_scheduling)
                .transpose()?,
            service_account: block
                .single_block("service_account")?
                .as_ref()
                .map(parse_service_account)
                .transpose()?,
            guest_accelerators: block
                .blocks("guest_accelerator")?
                .iter()
                .map(parse_guest_accelerator)
                .collect::<ProviderResult<Vec<_>>>()?,
            shielded_instance_config: block
                .single_block("shielded_instance_config")?
                .as_ref()
                .map(parse_shielded)
                .transpose()?,
            enable_display: block.bool_or("enable_display", false)?,
            reservation_affinity: block
                .single_block("reservation_affinity")?
                .as_ref()
                .map(parse_reservation_affinity)
                .transpose()?,
            advanced_machine_features: block
                .single_block("advanced_machine_features")?
                .as_ref()
                .map(parse_advanced_machine_features)
                .transpose()?,
        })
    }
}

fn parse_boot_disk(block: &Block<'_>) -> ProviderResult<BootDiskConfig> {
    let source = block.get_string("source")?;
    let initialize_params = block
        .single_block("initialize_params")?
        .as_ref()
        .map(parse_initialize_params)
        .transpose()?;
    if source.is_some() && initialize_params.is_some() {
        return Err(ProviderError::invalid_input(
            block.field("source"),
            "conflicts with initialize_params; an existing disk cannot also be created",
        ));
    }
    let raw = block.get_string("disk_encryption_key_raw")?;
    let kms = block.get_string("kms_key_self_link")?;
    if raw.is_some() && kms.is_some() {
        return Err(ProviderError::invalid_input(
            block.field("disk_encryption_key_raw"),
            "conflicts with kms_key_self_link; use one key source",
        ));
    }
    Ok(BootDiskConfig {
        auto_delete: block.bool_or("auto_delete", true)?,
        device_name: block.get_string("device_name")?,
        disk_encryption_key_raw: raw,
        kms_key_self_link: kms,
        source,
        initialize_params,
    })
}

fn parse_initialize_params(block: &Block<'_>) -> ProviderResult<InitializeParamsConfig> {
    Ok(InitializeParamsConfig {
        size: block.get_i64("size")?,
        disk_type: block.get_string("type")?,
        image: block.get_string("image")?,
        labels: block.string_map("labels")?,
        provisioned_iops: block.get_i64("provisioned_iops")?,
    })
}

fn parse_scratch_disk(block: &Block<'_>) -> ProviderResult<ScratchDiskConfig> {
    let interface = block
        .get_string("interface")?
        .unwrap_or_else(|| "SCSI".to_string());
    if interface != "SCSI" && interface != "NVME" {
        return Err(ProviderError::invalid_input(
            block.field("interface"),
            format!("must be SCSI or NVME, got {}", interface),
        ));
    }
    let size = block.get_i64("size")?.unwrap_or(375);
    if size != 375 && size != 3000 {
        return Err(ProviderError::invalid_input(
            block.field("size"),
            format!("local ssd size must be 375 or 3000 GB, got {}", size),
        ));
    }
    Ok(ScratchDiskConfig { interface, size })
}

fn parse_attached_disk(block: &Block<'_>) -> ProviderResult<AttachedDiskConfig> {
    let raw = block.get_string("disk_encryption_key_raw")?;
    let kms = block.get_string("kms_key_self_link")?;
    if raw.is_some() && kms.is_some() {
        return Err(ProviderError::invalid_input(
            block.field("disk_encryption_key_raw"),
            "conflicts with kms_key_self_link; use one key source",
        ));
    }
    Ok(AttachedDiskConfig {
        source: block.require_str("source")?,
        device_name: block.get_string("device_name")?,
        mode: block
            .get_string("mode")?
            .unwrap_or_else(|| "READ_WRITE".to_string()),
        disk_encryption_key_raw: raw,
        kms_key_self_link: kms,
    })
}

pub(crate) fn parse_network_interface(
    block: &Block<'_>,
) -> ProviderResult<NetworkInterfaceConfig> {
    let network = block.get_string("network")?;
    let subnetwork = block.get_string("subnetwork")?;
    if network.is_none() && subnetwork.is_none() {
        return Err(ProviderError::invalid_input(
            block.field("network"),
            "either network or subnetwork must be set",
        ));
    }
    Ok(NetworkInterfaceConfig {
        network,
        subnetwork,
        subnetwork_project: block.get_string("subnetwork_project")?,
        network_ip: block.get_string("network_ip")?,
        stack_type: block.get_string("stack_type")?,
        nic_type: block.get_string("nic_type")?,
        queue_count: block.get_i64("queue_count")?,
        access_configs: block
            .blocks("access_config")?
            .iter()
            .map(parse_access_config)
            .collect::<ProviderResult<Vec<_>>>()?,
        ipv6_access_configs: block
            .blocks("ipv6_access_config")?
            .iter()
            .map(parse_ipv6_access_config)
            .collect::<ProviderResult<Vec<_>>>()?,
        alias_ip_ranges: block
            .blocks("alias_ip_range")?
            .iter()
            .map(parse_alias_ip_range)
            .collect::<ProviderResult<Vec<_>>>()?,
    })
}

fn parse_access_config(block: &Block<'_>) -> ProviderResult<AccessConfigConfig> {
    Ok(AccessConfigConfig {
        nat_ip: block.get_string("nat_ip")?,
        network_tier: block.get_string("network_tier")?,
        public_ptr_domain_name: block.get_string("public_ptr_domain_name")?,
    })
}

fn parse_ipv6_access_config(block: &Block<'_>) -> ProviderResult<Ipv6AccessConfigConfig> {
    Ok(Ipv6AccessConfigConfig {
        network_tier: block.get_string("network_tier")?,
        public_ptr_domain_name: block.get_string("public_ptr_domain_name")?,
    })
}

fn parse_alias_ip_range(block: &Block<'_>) -> ProviderResult<AliasIpRangeConfig> {
    Ok(AliasIpRangeConfig {
        ip_cidr_range: block.require_str("ip_cidr_range")?,
        subnetwork_range_name: block.get_string("subnetwork_range_name")?,
    })
}

pub(crate) fn parse_scheduling(block: &Block<'_>) -> ProviderResult<SchedulingConfig> {
    Ok(SchedulingConfig {
        automatic_restart: block.bool_or("automatic_restart", true)?,
        preemptible: block.bool_or("preemptible", false)?,
        on_host_maintenance: block.get_string("on_host_maintenance")?,
        node_affinities: block
            .blocks("node_affinities")?
            .iter()
            .map(parse_node_affinity)
            .collect::<ProviderResult<Vec<_>>>()?,
        min_node_cpus: block.get_i64("min_node_cpus")?,
        provisioning_model: block.get_string("provisioning_model")?,
        instance_termination_action: block.get_string("instance_termination_action")?,
        local_ssd_recovery_timeout: block
            .single_block("local_ssd_recovery_timeout")?
            .as_ref()
            .map(|b| {
                Ok::<_, ProviderError>(DurationConfig {
                    seconds: b.require_i64("seconds")?,
                    nanos: b.get_i64("nanos")?.unwrap_or(0),
                })
            })
            .transpose()?,
    })
}

fn parse_node_affinity(block: &Block<'_>) -> ProviderResult<NodeAffinityConfig> {
    let operator = block.require_str("operator")?;
    if operator != "IN" && operator != "NOT_IN" {
        return Err(ProviderError::invalid_input(
            block.field("operator"),
            format!("must be IN or NOT_IN, got {}", operator),
        ));
    }
    Ok(NodeAffinityConfig {
        key: block.require_str("key")?,
        operator,
        values: block.string_list("values")?,
    })
}

pub(crate) fn parse_service_account(block: &Block<'_>) -> ProviderResult<ServiceAccountConfig> {
    Ok(ServiceAccountConfig {
        email: block.get_string("email")?,
        scopes: block.string_list("scopes")?,
    })
}

fn parse_guest_accelerator(block: &Block<'_>) -> ProviderResult<GuestAcceleratorConfig> {
    Ok(GuestAcceleratorConfig {
        accelerator_type: block.require_str("type")?,
        count: block.require_i64("count")?,
    })
}

fn parse_shielded(block: &Block<'_>) -> ProviderResult<ShieldedConfig> {
    Ok(ShieldedConfig {
        enable_secure_boot: block.bool_or("enable_secure_boot", false)?,
        enable_vtpm: block.bool_or("enable_vtpm", true)?,
        enable_integrity_monitoring: block.bool_or("enable_integrity_monitoring", true)?,
    })
}

fn parse_reservation_affinity(block: &Block<'_>) -> ProviderResult<ReservationAffinityConfig> {
    let affinity_type = block.require_str("type")?;
    let specific = block
        .single_block("specific_reservation")?
        .as_ref()
        .map(|b| {
            Ok::<_, ProviderError>(SpecificReservationConfig {
                key: b.require_str("key")?,
                values: b.string_list("values")?,
            })
        })
        .transpose()?;
    if affinity_type == "SPECIFIC_RESERVATION" && specific.is_none() {
        return Err(ProviderError::invalid_input(
            block.field("specific_reservation"),
            "required when type is SPECIFIC_RESERVATION",
        ));
    }
    if affinity_type != "SPECIFIC_RESERVATION" && specific.is_some() {
        return Err(ProviderError::invalid_input(
            block.field("specific_reservation"),
            format!("cannot be set when type is {}", affinity_type),
        ));
    }
    Ok(ReservationAffinityConfig {
        affinity_type,
        specific_reservation: specific,
    })
}

fn parse_advanced_machine_features(
    block: &Block<'_>,
) -> ProviderResult<AdvancedMachineFeaturesConfig> {
    Ok(AdvancedMachineFeaturesConfig {
        enable_nested_virtualization: block.bool_or("enable_nested_virtualization", false)?,
        threads_per_core: block.get_i64("threads_per_core")?,
        visible_core_count: block.get_i64("visible_core_count")?,
    })
}

// ===== Instance template =====

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateConfig {
    pub name: String,
    pub description: Option<String>,
    pub instance_description: Option<String>,
    pub machine_type: String,
    pub min_cpu_platform: Option<String>,
    pub can_ip_forward: bool,
    pub metadata: BTreeMap<String, String>,
    pub metadata_startup_script: Option<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub disks: Vec<TemplateDiskConfig>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub scheduling: Option<SchedulingConfig>,
    pub service_account: Option<ServiceAccountConfig>,
    pub guest_accelerators: Vec<GuestAcceleratorConfig>,
    pub shielded_instance_config: Option<ShieldedConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDiskConfig {
    pub auto_delete: bool,
    pub boot: bool,
    pub device_name: Option<String>,
    pub disk_name: Option<String>,
    pub disk_size_gb: Option<i64>,
    pub disk_type: Option<String>,
    pub interface: Option<String>,
    pub mode: String,
    pub source: Option<String>,
    pub source_image: Option<String>,
    pub disk_kind: String,
    pub labels: BTreeMap<String, String>,
    pub provisioned_iops: Option<i64>,
}

impl TemplateConfig {
    pub fn from_resource(resource: &Resource) -> ProviderResult<TemplateConfig> {
        Self::from_attributes(&resource.attributes)
    }

    pub fn from_attributes(attributes: &HashMap<String, Value>) -> ProviderResult<TemplateConfig> {
        let block = Block::root(attributes);

        let metadata = block.string_map("metadata")?;
        let metadata_startup_script = block.get_string("metadata_startup_script")?;
        if metadata_startup_script.is_some() && metadata.contains_key("startup-script") {
            return Err(ProviderError::invalid_input(
                "metadata.startup-script",
                "conflicts with metadata_startup_script; declare the script in one place",
            ));
        }

        let disks = block
            .blocks("disk")?
            .iter()
            .map(parse_template_disk)
            .collect::<ProviderResult<Vec<_>>>()?;
        if disks.is_empty() {
            return Err(ProviderError::invalid_input(
                "disk",
                "at least one disk is required",
            ));
        }

        let network_interfaces = block
            .blocks("network_interface")?
            .iter()
            .map(parse_network_interface)
            .collect::<ProviderResult<Vec<_>>>()?;
        if network_interfaces.is_empty() {
            return Err(ProviderError::invalid_input(
                "network_interface",
                "at least one interface is required",
            ));
        }

        Ok(TemplateConfig {
            name: block.require_str("name")?,
            description: block.get_string("description")?,
            instance_description: block.get_string("instance_description")?,
            machine_type: block.require_str("machine_type")?,
            min_cpu_platform: block.get_string("min_cpu_platform")?,
            can_ip_forward: block.bool_or("can_ip_forward", false)?,
            metadata,
            metadata_startup_script,
            tags: block.string_list("tags")?,
            labels: block.string_map("labels")?,
            disks,
            network_interfaces,
            scheduling: block
                .single_block("scheduling")?
                .as_ref()
                .map(parse_scheduling)
                .transpose()?,
            service_account: block
                .single_block("service_account")?
                .as_ref()
                .map(parse_service_account)
                .transpose()?,
            guest_accelerators: block
                .blocks("guest_accelerator")?
                .iter()
                .map(parse_guest_accelerator)
                .collect::<ProviderResult<Vec<_>>>()?,
            shielded_instance_config: block
                .single_block("shielded_instance_config")?
                .as_ref()
                .map(parse_shielded)
                .transpose()?,
        })
    }
}

fn parse_template_disk(block: &Block<'_>) -> ProviderResult<TemplateDiskConfig> {
    let disk_kind = block
        .get_string("type")?
        .unwrap_or_else(|| "PERSISTENT".to_string());
    if disk_kind != "PERSISTENT" && disk_kind != "SCRATCH" {
        return Err(ProviderError::invalid_input(
            block.field("type"),
            format!("must be PERSISTENT or SCRATCH, got {}", disk_kind),
        ));
    }
    let boot = block.bool_or("boot", false)?;
    let auto_delete = block.bool_or("auto_delete", true)?;
    let disk_type = block.get_string("disk_type")?;
    if disk_kind == "SCRATCH" {
        if boot {
            return Err(ProviderError::invalid_input(
                block.field("type"),
                "a boot disk cannot be a scratch disk",
            ));
        }
        if !auto_delete {
            return Err(ProviderError::invalid_input(
                block.field("auto_delete"),
                "scratch disks must have auto_delete enabled",
            ));
        }
        if let Some(dt) = &disk_type
            && dt != "local-ssd"
        {
            return Err(ProviderError::invalid_input(
                block.field("disk_type"),
                format!("scratch disks must use local-ssd, got {}", dt),
            ));
        }
    }
    Ok(TemplateDiskConfig {
        auto_delete,
        boot,
        device_name: block.get_string("device_name")?,
        disk_name: block.get_string("disk_name")?,
        disk_size_gb: block.get_i64("disk_size_gb")?,
        disk_type,
        interface: block.get_string("interface")?,
        mode: block
            .get_string("mode")?
            .unwrap_or_else(|| "READ_WRITE".to_string()),
        source: block.get_string("source")?,
        source_image: block.get_string("source_image")?,
        disk_kind,
        labels: block.string_map("labels")?,
        provisioned_iops: block.get_i64("provisioned_iops")?,
    })
}

// ===== Disk =====

#[derive(Debug, Clone, PartialEq)]
pub struct DiskConfig {
    pub name: String,
    pub description: Option<String>,
    pub zone: Option<String>,
    pub size: Option<i64>,
    pub disk_type: String,
    pub image: Option<String>,
    pub snapshot: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub disk_encryption_key_raw: Option<String>,
    pub provisioned_iops: Option<i64>,
}

impl DiskConfig {
    pub fn from_resource(resource: &Resource) -> ProviderResult<DiskConfig> {
        Self::from_attributes(&resource.attributes)
    }

    pub fn from_attributes(attributes: &HashMap<String, Value>) -> ProviderResult<DiskConfig> {
        let block = Block::root(attributes);
        let image = block.get_string("image")?;
        let snapshot = block.get_string("snapshot")?;
        if image.is_some() && snapshot.is_some() {
            return Err(ProviderError::invalid_input(
                "image",
                "conflicts with snapshot; a disk has one content source",
            ));
        }
        Ok(DiskConfig {
            name: block.require_str("name")?,
            description: block.get_string("description")?,
            zone: block.get_string("zone")?,
            size: block.get_i64("size")?,
            disk_type: block
                .get_string("type")?
                .unwrap_or_else(|| "pd-standard".to_string()),
            image,
            snapshot,
            labels: block.string_map("labels")?,
            disk_encryption_key_raw: block.get_string("disk_encryption_key_raw")?,
            provisioned_iops: block.get_i64("provisioned_iops")?,
        })
    }
}

// ===== Project metadata =====

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectMetadataConfig {
    pub project: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ProjectMetadataConfig {
    pub fn from_resource(resource: &Resource) -> ProviderResult<ProjectMetadataConfig> {
        let block = Block::root(&resource.attributes);
        Ok(ProjectMetadataConfig {
            project: block.get_string("project")?,
            metadata: block.string_map("metadata")?,
        })
    }
}

// ===== Router BGP peer =====

#[derive(Debug, Clone, PartialEq)]
pub struct RouterPeerConfig {
    pub name: String,
    pub router: String,
    pub region: Option<String>,
    pub interface_name: String,
    pub peer_ip_address: Option<String>,
    pub peer_asn: i64,
    pub advertised_route_priority: Option<i64>,
    pub advertise_mode: String,
    pub advertised_groups: Vec<String>,
    pub advertised_ip_ranges: Vec<AdvertisedIpRangeConfig>,
    pub enable: bool,
    pub md5_authentication_key: Option<Md5KeyConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisedIpRangeConfig {
    pub range: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Md5KeyConfig {
    pub name: String,
    pub key: String,
}

impl RouterPeerConfig {
    pub fn from_resource(resource: &Resource) -> ProviderResult<RouterPeerConfig> {
        Self::from_attributes(&resource.attributes)
    }

    pub fn from_attributes(attributes: &HashMap<String, Value>) -> ProviderResult<RouterPeerConfig> {
        let block = Block::root(attributes);
        let advertise_mode = block
            .get_string("advertise_mode")?
            .unwrap_or_else(|| "DEFAULT".to_string());
        if advertise_mode != "DEFAULT" && advertise_mode != "CUSTOM" {
            return Err(ProviderError::invalid_input(
                "advertise_mode",
                format!("must be DEFAULT or CUSTOM, got {}", advertise_mode),
            ));
        }
        let advertised_groups = block.string_list("advertised_groups")?;
        let advertised_ip_ranges = block
            .blocks("advertised_ip_ranges")?
            .iter()
            .map(|b| {
                Ok::<_, ProviderError>(AdvertisedIpRangeConfig {
                    range: b.require_str("range")?,
                    description: b.get_string("description")?,
                })
            })
            .collect::<ProviderResult<Vec<_>>>()?;
        if advertise_mode == "DEFAULT"
            && (!advertised_groups.is_empty() || !advertised_ip_ranges.is_empty())
        {
            return Err(ProviderError::invalid_input(
                "advertise_mode",
                "custom advertisements require advertise_mode = CUSTOM",
            ));
        }
        Ok(RouterPeerConfig {
            name: block.require_str("name")?,
            router: block.require_str("router")?,
            region: block.get_string("region")?,
            interface_name: block.require_str("interface")?,
            peer_ip_address: block.get_string("peer_ip_address")?,
            peer_asn: block.require_i64("peer_asn")?,
            advertised_route_priority: block.get_i64("advertised_route_priority")?,
            advertise_mode,
            advertised_groups,
            advertised_ip_ranges,
            enable: block.bool_or("enable", true)?,
            md5_authentication_key: block
                .single_block("md5_authentication_key")?
                .as_ref()
                .map(|b| {
                    Ok::<_, ProviderError>(Md5KeyConfig {
                        name: b.require_str("name")?,
                        key: b.require_str("key")?,
                    })
                })
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> HashMap<String, Value> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn base_instance() -> Resource {
        Resource::new("gce_instance", "vm-1")
            .with_attribute("name", "vm-1")
            .with_attribute("machine_type", "e2-medium")
            .with_attribute(
                "boot_disk",
                Value::blocks(vec![map(vec![(
                    "initialize_params",
                    Value::blocks(vec![map(vec![("image", Value::from("debian-11"))])]),
                )])]),
            )
            .with_attribute(
                "network_interface",
                Value::blocks(vec![map(vec![("network", Value::from("default"))])]),
            )
    }

    #[test]
    fn parses_full_instance() {
        let resource = base_instance()
            .with_attribute("can_ip_forward", true)
            .with_attribute(
                "metadata",
                Value::Map(map(vec![("role", Value::from("web"))])),
            )
            .with_attribute("tags", Value::List(vec![Value::from("web"), Value::from("db")]))
            .with_attribute(
                "scheduling",
                Value::blocks(vec![map(vec![
                    ("preemptible", Value::from(true)),
                    ("automatic_restart", Value::from(false)),
                ])]),
            )
            .with_attribute(
                "service_account",
                Value::blocks(vec![map(vec![(
                    "scopes",
                    Value::List(vec![Value::from("cloud-platform")]),
                )])]),
            );

        let config = InstanceConfig::from_resource(&resource).unwrap();
        assert_eq!(config.name, "vm-1");
        assert_eq!(config.machine_type, "e2-medium");
        assert!(config.can_ip_forward);
        assert_eq!(config.metadata.get("role").map(String::as_str), Some("web"));
        assert_eq!(config.tags, vec!["web", "db"]);
        assert_eq!(
            config.boot_disk.initialize_params.as_ref().unwrap().image,
            Some("debian-11".to_string())
        );
        assert!(config.boot_disk.auto_delete);
        let scheduling = config.scheduling.unwrap();
        assert!(scheduling.preemptible);
        assert!(!scheduling.automatic_restart);
        let sa = config.service_account.unwrap();
        assert_eq!(sa.email, None);
        assert_eq!(sa.scopes, vec!["cloud-platform"]);
    }

    #[test]
    fn startup_script_declared_twice_is_rejected() {
        let resource = base_instance()
            .with_attribute("metadata_startup_script", "echo hi")
            .with_attribute(
                "metadata",
                Value::Map(map(vec![("startup-script", Value::from("echo other"))])),
            );
        let err = InstanceConfig::from_resource(&resource).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidInput { .. }));
    }

    #[test]
    fn interface_needs_network_or_subnetwork() {
        let resource = base_instance()
            .with_attribute("network_interface", Value::blocks(vec![map(vec![])]));
        let err = InstanceConfig::from_resource(&resource).unwrap_err();
        assert!(err.to_string().contains("network"));
    }

    #[test]
    fn boot_disk_source_conflicts_with_initialize_params() {
        let resource = base_instance().with_attribute(
            "boot_disk",
            Value::blocks(vec![map(vec![
                ("source", Value::from("projects/p/zones/z/disks/d")),
                (
                    "initialize_params",
                    Value::blocks(vec![map(vec![("image", Value::from("debian-11"))])]),
                ),
            ])]),
        );
        assert!(InstanceConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn encryption_key_sources_are_exclusive() {
        let resource = base_instance().with_attribute(
            "boot_disk",
            Value::blocks(vec![map(vec![
                ("disk_encryption_key_raw", Value::from("AAAA")),
                ("kms_key_self_link", Value::from("projects/p/keys/k")),
            ])]),
        );
        assert!(InstanceConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn two_scheduling_blocks_are_rejected() {
        let resource = base_instance().with_attribute(
            "scheduling",
            Value::blocks(vec![map(vec![]), map(vec![])]),
        );
        let err = InstanceConfig::from_resource(&resource).unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn desired_status_must_be_known() {
        let resource = base_instance().with_attribute("desired_status", "PAUSED");
        assert!(InstanceConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn scratch_disk_size_is_fixed() {
        let resource = base_instance().with_attribute(
            "scratch_disk",
            Value::blocks(vec![map(vec![("size", Value::from(500))])]),
        );
        assert!(InstanceConfig::from_resource(&resource).is_err());

        let resource = base_instance()
            .with_attribute("scratch_disk", Value::blocks(vec![map(vec![])]));
        let config = InstanceConfig::from_resource(&resource).unwrap();
        assert_eq!(config.scratch_disks[0].interface, "SCSI");
        assert_eq!(config.scratch_disks[0].size, 375);
    }

    #[test]
    fn specific_reservation_block_matches_type() {
        let resource = base_instance().with_attribute(
            "reservation_affinity",
            Value::blocks(vec![map(vec![(
                "type",
                Value::from("SPECIFIC_RESERVATION"),
            )])]),
        );
        assert!(InstanceConfig::from_resource(&resource).is_err());

        let resource = base_instance().with_attribute(
            "reservation_affinity",
            Value::blocks(vec![map(vec![
                ("type", Value::from("ANY_RESERVATION")),
                (
                    "specific_reservation",
                    Value::blocks(vec![map(vec![
                        ("key", Value::from("compute.googleapis.com/reservation-name")),
                        ("values", Value::List(vec![Value::from("my-reservation")])),
                    ])]),
                ),
            ])]),
        );
        assert!(InstanceConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn template_scratch_disk_rules() {
        let base = Resource::new("gce_instance_template", "tpl-1")
            .with_attribute("name", "tpl-1")
            .with_attribute("machine_type", "e2-medium")
            .with_attribute(
                "network_interface",
                Value::blocks(vec![map(vec![("network", Value::from("default"))])]),
            );

        let boot_scratch = base.clone().with_attribute(
            "disk",
            Value::blocks(vec![map(vec![
                ("type", Value::from("SCRATCH")),
                ("boot", Value::from(true)),
            ])]),
        );
        assert!(TemplateConfig::from_resource(&boot_scratch).is_err());

        let keep_scratch = base.clone().with_attribute(
            "disk",
            Value::blocks(vec![map(vec![
                ("type", Value::from("SCRATCH")),
                ("auto_delete", Value::from(false)),
            ])]),
        );
        assert!(TemplateConfig::from_resource(&keep_scratch).is_err());

        let ok = base.with_attribute(
            "disk",
            Value::blocks(vec![
                map(vec![
                    ("boot", Value::from(true)),
                    ("source_image", Value::from("debian-11")),
                ]),
                map(vec![
                    ("type", Value::from("SCRATCH")),
                    ("disk_type", Value::from("local-ssd")),
                ]),
            ]),
        );
        let config = TemplateConfig::from_resource(&ok).unwrap();
        assert_eq!(config.disks.len(), 2);
        assert!(config.disks[0].boot);
        assert_eq!(config.disks[1].disk_kind, "SCRATCH");
        assert_eq!(config.disks[1].mode, "READ_WRITE");
    }

    #[test]
    fn disk_image_conflicts_with_snapshot() {
        let resource = Resource::new("gce_disk", "data-1")
            .with_attribute("name", "data-1")
            .with_attribute("image", "debian-11")
            .with_attribute("snapshot", "snap-1");
        assert!(DiskConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn disk_type_defaults() {
        let resource = Resource::new("gce_disk", "data-1")
            .with_attribute("name", "data-1");
        let config = DiskConfig::from_resource(&resource).unwrap();
        assert_eq!(config.disk_type, "pd-standard");
    }

    #[test]
    fn router_peer_requires_custom_mode_for_advertisements() {
        let resource = Resource::new("gce_router_peer", "peer-1")
            .with_attribute("name", "peer-1")
            .with_attribute("router", "router-1")
            .with_attribute("interface", "if-1")
            .with_attribute("peer_asn", 65001)
            .with_attribute(
                "advertised_groups",
                Value::List(vec![Value::from("ALL_SUBNETS")]),
            );
        assert!(RouterPeerConfig::from_resource(&resource).is_err());
    }

    #[test]
    fn router_peer_parses_md5_key() {
        let resource = Resource::new("gce_router_peer", "peer-1")
            .with_attribute("name", "peer-1")
            .with_attribute("router", "router-1")
            .with_attribute("interface", "if-1")
            .with_attribute("peer_asn", 65001)
            .with_attribute("peer_ip_address", "169.254.0.2")
            .with_attribute(
                "md5_authentication_key",
                Value::blocks(vec![map(vec![
                    ("name", Value::from("peer-1-key")),
                    ("key", Value::from("secret")),
                ])]),
            );
        let config = RouterPeerConfig::from_resource(&resource).unwrap();
        assert_eq!(config.peer_asn, 65001);
        assert!(config.enable);
        assert_eq!(config.advertise_mode, "DEFAULT");
        let md5 = config.md5_authentication_key.unwrap();
        assert_eq!(md5.name, "peer-1-key");
        assert_eq!(md5.key, "secret");
    }
}
