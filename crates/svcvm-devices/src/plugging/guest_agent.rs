//! Plugging driver for guest-agent service VMs.
//!
//! Logical ports are attached directly to the VM as extra interfaces, so
//! the hosting port is the logical port itself on a flat segment.

use std::sync::Arc;

use async_trait::async_trait;

use svcvm_state::{HostedPortBinding, HostingDeviceAgentBinding, NetworkType, StoreTxn};

use super::{create_mgmt_port, delete_owned_ports, owned_resources};
use crate::driver::{HostingDeviceResources, PluggingDriver, ResourceRequest};
use crate::error::DeviceResult;
use crate::network::{CorePlugin, Port, VmManager};

pub struct GuestAgentPluggingDriver {
    core: Arc<dyn CorePlugin>,
    vm: Arc<dyn VmManager>,
}

impl GuestAgentPluggingDriver {
    pub fn new(core: Arc<dyn CorePlugin>, vm: Arc<dyn VmManager>) -> Self {
        Self { core, vm }
    }
}

#[async_trait]
impl PluggingDriver for GuestAgentPluggingDriver {
    fn name(&self) -> &'static str {
        "guest_agent"
    }

    async fn create_hosting_device_resources(
        &self,
        request: &ResourceRequest,
    ) -> DeviceResult<HostingDeviceResources> {
        let mgmt_port = create_mgmt_port(self.core.as_ref(), request).await?;
        Ok(HostingDeviceResources {
            mgmt_port: Some(mgmt_port),
            ports: Vec::new(),
        })
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
        self.vm.attach_interface(hosting_device_id, &port.id).await?;
        Ok(())
    }

    async fn teardown_logical_port_connectivity(
        &self,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<()> {
        self.vm.detach_interface(hosting_device_id, &port.id).await?;
        Ok(())
    }

    fn allocate_hosting_port(
        &self,
        _txn: &StoreTxn,
        resource_id: &str,
        port: &Port,
        _hosting_device_id: &str,
    ) -> DeviceResult<HostedPortBinding> {
        Ok(HostedPortBinding {
            logical_resource_id: resource_id.to_string(),
            logical_port_id: port.id.clone(),
            hosting_port_id: port.id.clone(),
            network_type: NetworkType::Flat,
            segmentation_id: None,
        })
    }
}
