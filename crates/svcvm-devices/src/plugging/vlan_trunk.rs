//! Plugging driver for devices reached over a VLAN trunk.
//!
//! Each device gets a trunk port next to its management port. Logical
//! ports are not attached to the VM; their traffic arrives tagged on the
//! trunk, using the lowest VLAN in `[vlan_trunk]` that is still free on
//! that device.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use svcvm_core::config::VlanTrunkConfig;
use svcvm_state::{HostedPortBinding, HostingDeviceAgentBinding, NetworkType, StoreRead, StoreTxn};

use super::{TRUNK_PORT_OWNER, create_mgmt_port, delete_owned_ports, owned_resources};
use crate::driver::{HostingDeviceResources, PluggingDriver, ResourceRequest};
use crate::error::{DeviceError, DeviceResult};
use crate::network::{CorePlugin, Port, PortRequest};

pub struct VlanTrunkPluggingDriver {
    config: VlanTrunkConfig,
    core: Arc<dyn CorePlugin>,
}

impl VlanTrunkPluggingDriver {
    pub fn new(config: VlanTrunkConfig, core: Arc<dyn CorePlugin>) -> Self {
        Self { config, core }
    }
}

#[async_trait]
impl PluggingDriver for VlanTrunkPluggingDriver {
    fn name(&self) -> &'static str {
        "vlan_trunk"
    }

    async fn create_hosting_device_resources(
        &self,
        request: &ResourceRequest,
    ) -> DeviceResult<HostingDeviceResources> {
        let mgmt_port = create_mgmt_port(self.core.as_ref(), request).await?;
        let mut resources = HostingDeviceResources {
            mgmt_port: Some(mgmt_port),
            ports: Vec::new(),
        };

        if let Some(network_id) = &request.plugging_data.gateway_network_id {
            let trunk = self
                .core
                .create_port(&PortRequest {
                    tenant_id: request.tenant_id.clone(),
                    network_id: network_id.clone(),
                    name: "trunk".to_string(),
                    device_id: request.complementary_id.clone(),
                    device_owner: TRUNK_PORT_OWNER.to_string(),
                    security_groups: Vec::new(),
                })
                .await;
            match trunk {
                Ok(port) => resources.ports.push(port),
                Err(e) => {
                    // Release what was already allocated.
                    delete_owned_ports(self.core.as_ref(), &resources).await?;
                    return Err(DeviceError::Plugging(format!("trunk port: {e}")));
                }
            }
        }
        Ok(resources)
    }

    async fn get_hosting_device_resources(
        &self,
        binding: &HostingDeviceAgentBinding,
    ) -> DeviceResult<HostingDeviceResources> {
        owned_resources(self.core.as_ref(), binding).await
    }

    async fn delete_hosting_device_resources(
        &self,
        resources: &HostingDeviceResources,
    ) -> DeviceResult<()> {
        delete_owned_ports(self.core.as_ref(), resources).await
    }

    async fn setup_logical_port_connectivity(
        &self,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<()> {
        debug!(port_id = %port.id, %hosting_device_id, "port reachable over trunk");
        Ok(())
    }

    async fn teardown_logical_port_connectivity(
        &self,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<()> {
        debug!(port_id = %port.id, %hosting_device_id, "port released from trunk");
        Ok(())
    }

    fn allocate_hosting_port(
        &self,
        txn: &StoreTxn,
        resource_id: &str,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<HostedPortBinding> {
        if let Some(existing) = txn.get_hosted_port(resource_id, &port.id)? {
            return Ok(existing);
        }
        let used: BTreeSet<u32> = txn
            .list_hosted_ports_on_device(hosting_device_id)?
            .into_iter()
            .filter_map(|p| p.segmentation_id)
            .collect();
        let vlan = (u32::from(self.config.min_vlan)..=u32::from(self.config.max_vlan))
            .find(|v| !used.contains(v))
            .ok_or_else(|| DeviceError::VlanExhausted(hosting_device_id.to_string()))?;

        Ok(HostedPortBinding {
            logical_resource_id: resource_id.to_string(),
            logical_port_id: port.id.clone(),
            hosting_port_id: port.id.clone(),
            network_type: NetworkType::Vlan,
            segmentation_id: Some(vlan),
        })
    }
}
