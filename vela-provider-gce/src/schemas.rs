//! GCE resource schema definitions
//!
//! `force_new` marks the attributes the Compute Engine API cannot change on
//! a live resource; the planner consults these flags to choose between an
//! in-place update and a replacement before calling the provider.

use vela_core::resource::Value;
use vela_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};

/// BGP autonomous system number
pub fn bgp_asn() -> AttributeType {
    AttributeType::Custom {
        name: "BgpAsn".to_string(),
        base: Box::new(AttributeType::Int),
        validate: |value| {
            if let Value::Int(n) = value {
                if *n > 0 && *n <= 4_294_967_295 {
                    Ok(())
                } else {
                    Err("ASN must be between 1 and 4294967295".to_string())
                }
            } else {
                Err("Expected integer".to_string())
            }
        },
    }
}

/// Returns the schema for `gce_instance`
pub fn instance_schema() -> ResourceSchema {
    ResourceSchema::new("gce_instance")
        .with_description("A Compute Engine virtual machine instance")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Instance name, unique within the zone"),
        )
        .attribute(
            AttributeSchema::new("zone", AttributeType::String)
                .force_new()
                .with_description("Zone the instance lives in; defaults to the provider zone"),
        )
        .attribute(
            AttributeSchema::new("machine_type", AttributeType::String)
                .required()
                .with_description(
                    "Machine type name or full path; changing it stops and restarts the instance",
                ),
        )
        .attribute(AttributeSchema::new("description", AttributeType::String).force_new())
        .attribute(
            AttributeSchema::new("hostname", AttributeType::String)
                .force_new()
                .with_description("Custom hostname in FQDN form, e.g. host.example.com"),
        )
        .attribute(
            AttributeSchema::new("min_cpu_platform", AttributeType::String)
                .with_description("Minimum CPU platform, e.g. Intel Skylake"),
        )
        .attribute(AttributeSchema::new("can_ip_forward", AttributeType::Bool))
        .attribute(
            AttributeSchema::new("deletion_protection", AttributeType::Bool)
                .with_description("While set, delete calls are rejected by the API"),
        )
        .attribute(
            AttributeSchema::new("allow_stopping_for_update", AttributeType::Bool)
                .with_description(
                    "Acknowledge that some updates stop and restart the instance",
                ),
        )
        .attribute(
            AttributeSchema::new(
                "desired_status",
                AttributeType::Enum(vec!["RUNNING".to_string(), "TERMINATED".to_string()]),
            )
            .with_description("Power state to converge on"),
        )
        .attribute(AttributeSchema::new("metadata", types::string_map()))
        .attribute(
            AttributeSchema::new("metadata_startup_script", AttributeType::String)
                .with_description(
                    "Startup script, stored under the metadata startup-script key; \
                     conflicts with declaring that key in metadata",
                ),
        )
        .attribute(
            AttributeSchema::new("tags", AttributeType::List(Box::new(AttributeType::String)))
                .with_description("Network tags"),
        )
        .attribute(AttributeSchema::new("labels", types::string_map()))
        .attribute(AttributeSchema::new(
            "resource_policies",
            AttributeType::List(Box::new(AttributeType::String)),
        ))
        .attribute(
            AttributeSchema::new("boot_disk", types::block())
                .required()
                .force_new()
                .with_description("The boot disk; exactly one block"),
        )
        .attribute(AttributeSchema::new("scratch_disk", types::block()).force_new())
        .attribute(
            AttributeSchema::new("attached_disk", types::block())
                .with_description("Persistent disks attached after boot; attach and detach in place"),
        )
        .attribute(
            AttributeSchema::new("network_interface", types::block())
                .required()
                .with_description(
                    "Network interfaces; access configs and alias ranges update in place, \
                     moving an interface to another network replaces the instance",
                ),
        )
        .attribute(AttributeSchema::new("scheduling", types::block()))
        .attribute(
            AttributeSchema::new("service_account", types::block())
                .with_description("Service account and scopes; changes stop and restart the instance"),
        )
        .attribute(AttributeSchema::new("guest_accelerator", types::block()).force_new())
        .attribute(AttributeSchema::new("shielded_instance_config", types::block()))
        .attribute(AttributeSchema::new("enable_display", AttributeType::Bool))
        .attribute(AttributeSchema::new("reservation_affinity", types::block()).force_new())
        .attribute(AttributeSchema::new("advanced_machine_features", types::block()))
        .attribute(AttributeSchema::new("instance_id", AttributeType::String).computed())
        .attribute(AttributeSchema::new("cpu_platform", AttributeType::String).computed())
        .attribute(AttributeSchema::new("current_status", AttributeType::String).computed())
}

/// Returns the schema for `gce_instance_template`
///
/// Templates are immutable; every configurable attribute forces replacement.
pub fn template_schema() -> ResourceSchema {
    ResourceSchema::new("gce_instance_template")
        .with_description("An immutable template describing instances to create")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Template name, unique within the project"),
        )
        .attribute(
            AttributeSchema::new("description", AttributeType::String)
                .force_new()
                .with_description("Description of the template itself"),
        )
        .attribute(
            AttributeSchema::new("instance_description", AttributeType::String)
                .force_new()
                .with_description("Description stamped onto instances created from the template"),
        )
        .attribute(
            AttributeSchema::new("machine_type", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("min_cpu_platform", AttributeType::String).force_new())
        .attribute(AttributeSchema::new("can_ip_forward", AttributeType::Bool).force_new())
        .attribute(AttributeSchema::new("metadata", types::string_map()).force_new())
        .attribute(
            AttributeSchema::new("metadata_startup_script", AttributeType::String).force_new(),
        )
        .attribute(
            AttributeSchema::new("tags", AttributeType::List(Box::new(AttributeType::String)))
                .force_new(),
        )
        .attribute(AttributeSchema::new("labels", types::string_map()).force_new())
        .attribute(
            AttributeSchema::new("disk", types::block())
                .required()
                .force_new()
                .with_description("Disks for created instances; the first boot block boots"),
        )
        .attribute(
            AttributeSchema::new("network_interface", types::block())
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("scheduling", types::block()).force_new())
        .attribute(AttributeSchema::new("service_account", types::block()).force_new())
        .attribute(AttributeSchema::new("guest_accelerator", types::block()).force_new())
        .attribute(AttributeSchema::new("shielded_instance_config", types::block()).force_new())
}

/// Returns the schema for `gce_disk`
pub fn disk_schema() -> ResourceSchema {
    ResourceSchema::new("gce_disk")
        .with_description("A persistent disk")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Disk name, unique within the zone"),
        )
        .attribute(AttributeSchema::new("description", AttributeType::String).force_new())
        .attribute(
            AttributeSchema::new("zone", AttributeType::String)
                .force_new()
                .with_description("Zone the disk lives in; defaults to the provider zone"),
        )
        .attribute(
            AttributeSchema::new("size", types::positive_int()).with_description(
                "Size in GB; a disk grows in place, shrinking replaces it",
            ),
        )
        .attribute(
            AttributeSchema::new("type", AttributeType::String)
                .force_new()
                .with_description("Disk type, e.g. pd-standard or pd-ssd"),
        )
        .attribute(
            AttributeSchema::new("image", AttributeType::String).with_description(
                "Source image; any accepted spelling of the recorded image compares equal, \
                 naming a different image replaces the disk",
            ),
        )
        .attribute(
            AttributeSchema::new("snapshot", AttributeType::String)
                .with_description("Source snapshot; conflicts with image"),
        )
        .attribute(AttributeSchema::new("labels", types::string_map()))
        .attribute(
            AttributeSchema::new("disk_encryption_key_raw", AttributeType::String)
                .force_new()
                .with_description("Customer-supplied encryption key; never echoed by the API"),
        )
        .attribute(AttributeSchema::new("provisioned_iops", AttributeType::Int).force_new())
        .attribute(
            AttributeSchema::new("users", AttributeType::List(Box::new(AttributeType::String)))
                .computed()
                .with_description("Instances the disk is attached to"),
        )
        .attribute(
            AttributeSchema::new("disk_encryption_key_sha256", AttributeType::String).computed(),
        )
}

/// Returns the schema for `gce_project_metadata`
pub fn project_metadata_schema() -> ResourceSchema {
    ResourceSchema::new("gce_project_metadata")
        .with_description(
            "Project-wide common instance metadata; the resource owns the entire map",
        )
        .attribute(
            AttributeSchema::new("project", AttributeType::String)
                .force_new()
                .with_description("Project to manage; defaults to the provider project"),
        )
        .attribute(AttributeSchema::new("metadata", types::string_map()))
}

/// Returns the schema for `gce_router_peer`
pub fn router_peer_schema() -> ResourceSchema {
    ResourceSchema::new("gce_router_peer")
        .with_description("A BGP peering session on a Cloud Router")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Peer name, unique on the router"),
        )
        .attribute(
            AttributeSchema::new("router", AttributeType::String)
                .required()
                .force_new()
                .with_description("Cloud Router the peer belongs to"),
        )
        .attribute(
            AttributeSchema::new("region", AttributeType::String)
                .force_new()
                .with_description("Region of the router; defaults to the provider region"),
        )
        .attribute(
            AttributeSchema::new("interface", AttributeType::String)
                .required()
                .force_new()
                .with_description("Router interface the session runs over"),
        )
        .attribute(AttributeSchema::new("peer_ip_address", AttributeType::String))
        .attribute(AttributeSchema::new("peer_asn", bgp_asn()).required())
        .attribute(AttributeSchema::new(
            "advertised_route_priority",
            AttributeType::Int,
        ))
        .attribute(
            AttributeSchema::new(
                "advertise_mode",
                AttributeType::Enum(vec!["DEFAULT".to_string(), "CUSTOM".to_string()]),
            )
            .with_description("Custom advertisements require CUSTOM mode"),
        )
        .attribute(AttributeSchema::new(
            "advertised_groups",
            AttributeType::List(Box::new(AttributeType::String)),
        ))
        .attribute(AttributeSchema::new("advertised_ip_ranges", types::block()))
        .attribute(
            AttributeSchema::new("enable", AttributeType::Bool).with_description(
                "A disabled peer keeps its configuration but stops announcing routes",
            ),
        )
        .attribute(AttributeSchema::new("md5_authentication_key", types::block()))
        .attribute(AttributeSchema::new("ip_address", AttributeType::String).computed())
        .attribute(AttributeSchema::new("management_type", AttributeType::String).computed())
}
