//! Core networking records and the collaborator interfaces svcvm consumes.
//!
//! The surrounding networking plugin, the identity service and the VM
//! manager are external systems. They are reached only through the narrow
//! traits below; their errors travel as `anyhow::Error`, with [`NotFound`]
//! marking a missing upstream object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

/// A port owned by the core networking plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub tenant_id: String,
    pub name: String,
    pub device_id: String,
    pub device_owner: String,
    pub mac_address: String,
    pub admin_state_up: bool,
    pub fixed_ips: Vec<FixedIp>,
}

impl Port {
    pub fn first_ip(&self) -> Option<&str> {
        self.fixed_ips.first().map(|ip| ip.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: String,
    pub gateway_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
}

/// Attributes of a port to be created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortRequest {
    pub tenant_id: String,
    pub network_id: String,
    pub name: String,
    pub device_id: String,
    pub device_owner: String,
    pub security_groups: Vec<String>,
}

/// Partial port update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortUpdate {
    pub device_id: Option<String>,
    pub device_owner: Option<String>,
}

/// Marker error for an upstream object that does not exist.
#[derive(Debug, Error)]
#[error("{kind} {id} not found")]
pub struct NotFound {
    pub kind: &'static str,
    pub id: String,
}

impl NotFound {
    pub fn new(kind: &'static str, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// The core networking plugin.
#[async_trait]
pub trait CorePlugin: Send + Sync {
    async fn get_port(&self, port_id: &str) -> anyhow::Result<Port>;
    async fn get_subnet(&self, subnet_id: &str) -> anyhow::Result<Subnet>;
    async fn get_network(&self, network_id: &str) -> anyhow::Result<Network>;
    /// Networks with the given name owned by `tenant_id`.
    async fn list_networks(&self, name: &str, tenant_id: &str) -> anyhow::Result<Vec<Network>>;
    /// Ports whose `device_id` is `device_id`.
    async fn list_ports(&self, device_id: &str) -> anyhow::Result<Vec<Port>>;
    async fn create_port(&self, request: &PortRequest) -> anyhow::Result<Port>;
    async fn update_port(&self, port_id: &str, update: &PortUpdate) -> anyhow::Result<Port>;
    async fn delete_port(&self, port_id: &str) -> anyhow::Result<()>;
    async fn list_security_groups(&self, name: &str, tenant_id: &str)
    -> anyhow::Result<Vec<SecurityGroup>>;
}

/// Tenant lookup in the identity service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn find_tenant_id(&self, name: &str) -> anyhow::Result<Option<String>>;
}

/// What the VM manager needs to boot a hosting device.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSpec {
    pub name: String,
    pub template_id: Option<String>,
    /// Ports attached at boot; the management port comes first.
    pub port_ids: Vec<String>,
    /// Files injected into the image, keyed by path.
    pub config_files: BTreeMap<String, String>,
}

/// The compute service that runs hosting-device VMs.
#[async_trait]
pub trait VmManager: Send + Sync {
    /// Boot a VM and return its id. Boot completion is not awaited.
    async fn create_vm(&self, spec: &VmSpec) -> anyhow::Result<String>;
    async fn delete_vm(&self, vm_id: &str) -> anyhow::Result<()>;
    async fn attach_interface(&self, vm_id: &str, port_id: &str) -> anyhow::Result<()>;
    async fn detach_interface(&self, vm_id: &str, port_id: &str) -> anyhow::Result<()>;
}
