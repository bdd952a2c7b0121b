//! Capability traits implemented by device and plugging drivers.
//!
//! A device driver knows how to boot and describe one kind of hosting
//! device. A plugging driver owns the network resources a device needs
//! and maps logical ports onto device attachments. Concrete drivers are
//! chosen by name from configuration, see [`crate::registry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use svcvm_state::{HostedPortBinding, HostingDeviceAgentBinding, NetworkType, Router, StoreTxn};

use crate::error::DeviceResult;
use crate::network::Port;

/// Network resources allocated for one hosting device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostingDeviceResources {
    pub mgmt_port: Option<Port>,
    /// Data-plane ports created together with the device (trunks).
    pub ports: Vec<Port>,
}

/// Driver-specific data the plugging driver needs when allocating
/// resources for a new device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluggingData {
    pub gateway_network_id: Option<String>,
}

/// Everything the plugging driver needs to allocate device resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub complementary_id: String,
    pub tenant_id: String,
    pub mgmt_network_id: String,
    pub mgmt_security_group_id: Option<String>,
    pub plugging_data: PluggingData,
}

/// Everything a device driver needs to boot a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub name: String,
    pub complementary_id: String,
    pub mgmt_port: Port,
    pub ports: Vec<Port>,
}

/// Hosting-side details of a plugged logical port, as sent to agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostingPortInfo {
    pub hosting_port_id: String,
    pub hosting_mac: String,
    pub hosting_port_name: String,
    pub network_type: NetworkType,
    pub segmentation_id: Option<u32>,
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Boot a hosting device and return its id. Boot completion is not awaited.
    async fn create_device(&self, request: &DeviceRequest) -> DeviceResult<String>;

    async fn delete_device(&self, hosting_device_id: &str) -> DeviceResult<()>;

    /// Data the plugging driver needs for a device that will host `router`.
    fn get_plugging_data(&self, router: Option<&Router>) -> PluggingData;

    /// Device description handed to the config agent managing it.
    fn get_device_info_for_agent(
        &self,
        binding: &HostingDeviceAgentBinding,
        mgmt_port: Option<&Port>,
    ) -> serde_json::Value;
}

#[async_trait]
pub trait PluggingDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_hosting_device_resources(
        &self,
        request: &ResourceRequest,
    ) -> DeviceResult<HostingDeviceResources>;

    /// Report the resources previously allocated for a device.
    async fn get_hosting_device_resources(
        &self,
        binding: &HostingDeviceAgentBinding,
    ) -> DeviceResult<HostingDeviceResources>;

    /// Release device resources. Already-deleted resources count as released.
    async fn delete_hosting_device_resources(
        &self,
        resources: &HostingDeviceResources,
    ) -> DeviceResult<()>;

    async fn setup_logical_port_connectivity(
        &self,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<()>;

    async fn teardown_logical_port_connectivity(
        &self,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<()>;

    /// Map a logical port onto the device. Runs inside the caller's
    /// transaction so allocation sees the device's current mappings.
    fn allocate_hosting_port(
        &self,
        txn: &StoreTxn,
        resource_id: &str,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<HostedPortBinding>;

    /// Hosting details of a mapped port; `hosting_port` is the port
    /// named by `binding.hosting_port_id`.
    fn extend_hosting_port_info(
        &self,
        binding: &HostedPortBinding,
        hosting_port: &Port,
    ) -> HostingPortInfo {
        HostingPortInfo {
            hosting_port_id: binding.hosting_port_id.clone(),
            hosting_mac: hosting_port.mac_address.clone(),
            hosting_port_name: hosting_port.name.clone(),
            network_type: binding.network_type,
            segmentation_id: binding.segmentation_id,
        }
    }
}
