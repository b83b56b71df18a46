//! Client trait for the compute service
//!
//! `ComputeApi` is the seam between resource logic and transport. Production
//! wires in an HTTP client; tests substitute an in-memory fake. Every call
//! maps one-to-one onto a service endpoint, so resource code controls exactly
//! which requests are issued and in what order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    AccessConfig, AttachedDisk, CustomerEncryptionKeyProtectedDisk, Disk, DisplayDevice, Image,
    Instance, InstanceTemplate, Metadata, NetworkInterface, Operation, Project, Router,
    RouterPatch, Scheduling, ShieldedInstanceConfig, Subnetwork, Tags, Zone,
};

/// Error from a single API call
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// HTTP 404, with a description of what was missing
    #[error("{0} not found")]
    NotFound(String),

    /// HTTP 412, returned when a fingerprint went stale mid-flight
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other HTTP error status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never reached the service
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Typed surface of the compute service
///
/// Mutating calls return an `Operation` that the caller is expected to wait
/// on (see `wait_for_operation`); reads return the resource directly.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    // ===== Instances =====

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Instance>;

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> ApiResult<Operation>;

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation>;

    async fn start_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation>;

    async fn start_instance_with_encryption_keys(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        disks: &[CustomerEncryptionKeyProtectedDisk],
    ) -> ApiResult<Operation>;

    async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation>;

    /// Full update of the stopped instance resource (the fallback endpoint
    /// for fields without a dedicated setter)
    async fn update_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        instance: &Instance,
    ) -> ApiResult<Operation>;

    async fn set_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> ApiResult<Operation>;

    async fn set_tags(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        tags: &Tags,
    ) -> ApiResult<Operation>;

    async fn set_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        label_fingerprint: &str,
    ) -> ApiResult<Operation>;

    async fn set_machine_type(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        machine_type: &str,
    ) -> ApiResult<Operation>;

    async fn set_min_cpu_platform(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        min_cpu_platform: &str,
    ) -> ApiResult<Operation>;

    async fn set_scheduling(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        scheduling: &Scheduling,
    ) -> ApiResult<Operation>;

    async fn set_service_account(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        email: &str,
        scopes: &[String],
    ) -> ApiResult<Operation>;

    async fn set_shielded_instance_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        config: &ShieldedInstanceConfig,
    ) -> ApiResult<Operation>;

    async fn update_display_device(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        device: &DisplayDevice,
    ) -> ApiResult<Operation>;

    async fn set_deletion_protection(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        enabled: bool,
    ) -> ApiResult<Operation>;

    async fn update_network_interface(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        interface: &NetworkInterface,
    ) -> ApiResult<Operation>;

    async fn add_access_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        config: &AccessConfig,
    ) -> ApiResult<Operation>;

    async fn delete_access_config(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        interface_name: &str,
        access_config_name: &str,
    ) -> ApiResult<Operation>;

    async fn attach_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        disk: &AttachedDisk,
    ) -> ApiResult<Operation>;

    async fn detach_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        device_name: &str,
    ) -> ApiResult<Operation>;

    async fn add_resource_policies(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        resource_policies: &[String],
    ) -> ApiResult<Operation>;

    async fn remove_resource_policies(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        resource_policies: &[String],
    ) -> ApiResult<Operation>;

    // ===== Disks =====

    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> ApiResult<Disk>;

    /// Full inventory of the zone, pagination handled by the implementation
    async fn list_disks(&self, project: &str, zone: &str) -> ApiResult<Vec<Disk>>;

    async fn insert_disk(&self, project: &str, zone: &str, disk: &Disk) -> ApiResult<Operation>;

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> ApiResult<Operation>;

    async fn resize_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        size_gb: i64,
    ) -> ApiResult<Operation>;

    async fn set_disk_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        label_fingerprint: &str,
    ) -> ApiResult<Operation>;

    // ===== Images =====

    async fn get_image(&self, project: &str, name: &str) -> ApiResult<Image>;

    /// Latest non-deprecated image of the family
    async fn get_image_from_family(&self, project: &str, family: &str) -> ApiResult<Image>;

    // ===== Instance templates =====

    async fn get_instance_template(&self, project: &str, name: &str) -> ApiResult<InstanceTemplate>;

    async fn insert_instance_template(
        &self,
        project: &str,
        template: &InstanceTemplate,
    ) -> ApiResult<Operation>;

    async fn delete_instance_template(&self, project: &str, name: &str) -> ApiResult<Operation>;

    // ===== Routers =====

    async fn get_router(&self, project: &str, region: &str, name: &str) -> ApiResult<Router>;

    async fn patch_router(
        &self,
        project: &str,
        region: &str,
        name: &str,
        patch: &RouterPatch,
    ) -> ApiResult<Operation>;

    // ===== Projects =====

    async fn get_project(&self, project: &str) -> ApiResult<Project>;

    async fn set_common_instance_metadata(
        &self,
        project: &str,
        metadata: &Metadata,
    ) -> ApiResult<Operation>;

    // ===== Subnetworks and zones =====

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ApiResult<Subnetwork>;

    async fn get_zone(&self, project: &str, zone: &str) -> ApiResult<Zone>;

    // ===== Operations =====

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ApiResult<Operation>;

    async fn get_region_operation(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ApiResult<Operation>;

    async fn get_global_operation(&self, project: &str, name: &str) -> ApiResult<Operation>;
}
