//! Domain types for the svcvm binding store.
//!
//! These types represent the persisted bindings between logical resources,
//! hosting devices, and config agents, plus the base L3 records they
//! describe. All types are serializable to/from JSON for storage in redb.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a logical resource (router, firewall, ...).
pub type ResourceId = String;

/// Identifier of a hosting device (service VM or appliance).
pub type HostingDeviceId = String;

/// Identifier of a config agent.
pub type AgentId = String;

/// Identifier of a port owned by the core networking plugin.
pub type PortId = String;

// ── Logical resource binding ──────────────────────────────────────

/// Kind of logical resource realized on a hosting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Router,
    Firewall,
    Loadbalancer,
    Vpn,
}

impl ResourceType {
    /// Key under which resources of this type are listed in a
    /// hosting-device inventory sent to config agents.
    pub fn inventory_key(self) -> &'static str {
        match self {
            ResourceType::Router => "routers",
            ResourceType::Firewall => "firewalls",
            ResourceType::Loadbalancer => "loadbalancers",
            ResourceType::Vpn => "vpns",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Router => "ROUTER",
            ResourceType::Firewall => "FIREWALL",
            ResourceType::Loadbalancer => "LOADBALANCER",
            ResourceType::Vpn => "VPN",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a logical-resource binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingStatus {
    PendingCreate,
    Active,
    PendingUpdate,
    PendingDelete,
}

impl BindingStatus {
    /// Whether a compare-and-set may move a binding from `self` to `next`.
    ///
    /// Moving back to `PendingCreate` is not a CAS transition; it happens
    /// only by unscheduling.
    pub fn can_transition_to(self, next: BindingStatus) -> bool {
        use BindingStatus::*;
        matches!(
            (self, next),
            (PendingCreate, Active)
                | (PendingCreate, PendingDelete)
                | (Active, PendingUpdate)
                | (PendingUpdate, Active)
                | (Active, PendingDelete)
        )
    }
}

impl fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingStatus::PendingCreate => "PENDING_CREATE",
            BindingStatus::Active => "ACTIVE",
            BindingStatus::PendingUpdate => "PENDING_UPDATE",
            BindingStatus::PendingDelete => "PENDING_DELETE",
        };
        f.write_str(s)
    }
}

/// Binding of one logical resource to the hosting device serving it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalResourceBinding {
    pub resource_type: ResourceType,
    pub resource_id: ResourceId,
    /// `None` until the resource is scheduled onto a device.
    pub hosting_device_id: Option<HostingDeviceId>,
    /// Eligible for automatic (re)scheduling.
    pub auto_schedule: bool,
    pub status: BindingStatus,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

impl LogicalResourceBinding {
    pub fn new(resource_type: ResourceType, resource_id: &str, now: u64) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.to_string(),
            hosting_device_id: None,
            auto_schedule: true,
            status: BindingStatus::PendingCreate,
            updated_at: now,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.hosting_device_id.is_some()
    }
}

// ── Hosting device binding ────────────────────────────────────────

/// Binding between a hosting device and the config agent managing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostingDeviceAgentBinding {
    pub hosting_device_id: HostingDeviceId,
    /// Correlation id generated before the device existed; resources
    /// allocated for the device are owned by this id.
    pub complementary_id: String,
    /// Control-plane port of the device; unique across the fleet.
    pub management_port_id: PortId,
    /// `None` while no config agent is assigned.
    pub agent_id: Option<AgentId>,
    pub auto_schedule: bool,
    /// Unix timestamp when the device was created.
    pub created_at: u64,
}

// ── Hosted port binding ───────────────────────────────────────────

/// Segmentation scheme of a hosting-side port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Flat,
    Vlan,
    Local,
}

/// Mapping of a logical port onto a hosting-device attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostedPortBinding {
    pub logical_resource_id: ResourceId,
    pub logical_port_id: PortId,
    pub hosting_port_id: PortId,
    pub network_type: NetworkType,
    pub segmentation_id: Option<u32>,
}

impl HostedPortBinding {
    /// Build the composite key for the hosted ports table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.logical_resource_id, self.logical_port_id)
    }
}

// ── Config agent ──────────────────────────────────────────────────

/// A configuration agent as tracked by the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigAgent {
    pub id: AgentId,
    pub agent_type: String,
    pub host: String,
    pub admin_state_up: bool,
    /// Unix timestamp of the last heartbeat.
    pub heartbeat_timestamp: u64,
    /// Unix timestamp of first registration.
    pub started_at: u64,
}

impl ConfigAgent {
    /// True if the agent heartbeated within `down_time_secs` of `now`.
    pub fn is_heartbeat_fresh(&self, now: u64, down_time_secs: u64) -> bool {
        now.saturating_sub(self.heartbeat_timestamp) < down_time_secs
    }

    /// Admin-up and heartbeat fresh.
    pub fn is_alive(&self, now: u64, down_time_secs: u64) -> bool {
        self.admin_state_up && self.is_heartbeat_fresh(now, down_time_secs)
    }
}

// ── Base L3 records ───────────────────────────────────────────────

/// External gateway of a router: the network and the router's port on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalGateway {
    pub network_id: String,
    pub port_id: PortId,
}

/// A router port on an internal subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterInterface {
    pub port_id: PortId,
    pub subnet_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Router {
    pub id: ResourceId,
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
    pub gateway: Option<ExternalGateway>,
    pub interfaces: Vec<RouterInterface>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Router {
    pub fn gateway_network_id(&self) -> Option<&str> {
        self.gateway.as_ref().map(|gw| gw.network_id.as_str())
    }

    /// Every port the router needs plugged into its hosting device.
    pub fn port_ids(&self) -> Vec<PortId> {
        self.gateway
            .iter()
            .map(|gw| gw.port_id.clone())
            .chain(self.interfaces.iter().map(|i| i.port_id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FloatingIp {
    pub id: String,
    pub tenant_id: String,
    pub floating_network_id: String,
    pub floating_ip_address: String,
    /// Internal port the address is associated with.
    pub port_id: Option<PortId>,
    pub fixed_ip_address: Option<String>,
    /// Router performing the NAT; set while associated.
    pub router_id: Option<ResourceId>,
}

/// Router ids referenced by `fips`, first occurrence order, without duplicates.
pub fn floatingips_to_router_ids<'a>(fips: impl IntoIterator<Item = &'a FloatingIp>) -> Vec<ResourceId> {
    let mut seen = Vec::new();
    for fip in fips {
        if let Some(router_id) = &fip.router_id {
            if !seen.contains(router_id) {
                seen.push(router_id.clone());
            }
        }
    }
    seen
}
