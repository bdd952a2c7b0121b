//! Device driver for service VMs running the generic guest agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use svcvm_core::config::GuestAgentConfig;
use svcvm_state::{HostingDeviceAgentBinding, Router};

use crate::driver::{DeviceDriver, DeviceRequest, PluggingData};
use crate::error::{DeviceError, DeviceResult};
use crate::network::{Port, VmManager, VmSpec};

/// Port the guest agent listens on for configuration requests.
const AGENT_PORT: u16 = 5000;

pub struct GuestAgentDriver {
    config: GuestAgentConfig,
    vm: Arc<dyn VmManager>,
}

impl GuestAgentDriver {
    pub fn new(config: GuestAgentConfig, vm: Arc<dyn VmManager>) -> Self {
        Self { config, vm }
    }

    fn agent_config(&self, request: &DeviceRequest) -> BTreeMap<String, String> {
        let mgmt_ip = request.mgmt_port.first_ip().unwrap_or_default();
        let body = format!(
            "[agent]\nlisten_address = \"{mgmt_ip}\"\nlisten_port = {AGENT_PORT}\nmgmt_mac = \"{}\"\n",
            request.mgmt_port.mac_address
        );
        BTreeMap::from([(format!("{}/agent.toml", self.config.config_dir), body)])
    }
}

#[async_trait]
impl DeviceDriver for GuestAgentDriver {
    fn name(&self) -> &'static str {
        "guest_agent"
    }

    async fn create_device(&self, request: &DeviceRequest) -> DeviceResult<String> {
        let spec = VmSpec {
            name: request.name.clone(),
            template_id: self.config.template_id.clone(),
            port_ids: std::iter::once(request.mgmt_port.id.clone())
                .chain(request.ports.iter().map(|p| p.id.clone()))
                .collect(),
            config_files: self.agent_config(request),
        };
        let vm_id = self
            .vm
            .create_vm(&spec)
            .await
            .map_err(|e| DeviceError::ProvisioningFailure(format!("{}: {e}", request.name)))?;
        debug!(hosting_device_id = %vm_id, name = %request.name, "guest agent VM created");
        Ok(vm_id)
    }

    async fn delete_device(&self, hosting_device_id: &str) -> DeviceResult<()> {
        self.vm.delete_vm(hosting_device_id).await?;
        Ok(())
    }

    fn get_plugging_data(&self, router: Option<&Router>) -> PluggingData {
        PluggingData {
            gateway_network_id: router.and_then(|r| r.gateway_network_id()).map(str::to_string),
        }
    }

    fn get_device_info_for_agent(
        &self,
        binding: &HostingDeviceAgentBinding,
        mgmt_port: Option<&Port>,
    ) -> serde_json::Value {
        json!({
            "id": binding.hosting_device_id,
            "device_driver": self.name(),
            "management_ip_address": mgmt_port.and_then(|p| p.first_ip()),
            "protocol_port": AGENT_PORT,
            "created_at": binding.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FixedIp;
    use crate::sim::SimulatedCloud;

    fn mgmt_port() -> Port {
        Port {
            id: "mgmt-1".to_string(),
            network_id: "net-mgmt".to_string(),
            tenant_id: "tenant-l3-admin".to_string(),
            name: "mgmt".to_string(),
            device_id: "cid-1".to_string(),
            device_owner: "network:management".to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            admin_state_up: true,
            fixed_ips: vec![FixedIp {
                subnet_id: "subnet-mgmt".to_string(),
                ip_address: "192.168.0.5".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn boots_vm_with_agent_config() {
        let cloud = Arc::new(SimulatedCloud::new());
        let driver = GuestAgentDriver::new(GuestAgentConfig::default(), cloud.clone());

        let vm_id = driver
            .create_device(&DeviceRequest {
                name: "router-vm".to_string(),
                complementary_id: "cid-1".to_string(),
                mgmt_port: mgmt_port(),
                ports: vec![],
            })
            .await
            .unwrap();

        assert_eq!(cloud.vm_ids(), vec![vm_id.clone()]);
        assert_eq!(cloud.attached_ports(&vm_id), vec!["mgmt-1"]);
    }

    #[tokio::test]
    async fn vm_failure_is_a_provisioning_failure() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.fail_vm_creation(true);
        let driver = GuestAgentDriver::new(GuestAgentConfig::default(), cloud);

        let result = driver
            .create_device(&DeviceRequest {
                name: "router-vm".to_string(),
                complementary_id: "cid-1".to_string(),
                mgmt_port: mgmt_port(),
                ports: vec![],
            })
            .await;
        assert!(matches!(result, Err(DeviceError::ProvisioningFailure(_))));
    }

    #[test]
    fn agent_info_carries_management_address() {
        let driver = GuestAgentDriver::new(GuestAgentConfig::default(), Arc::new(SimulatedCloud::new()));
        let binding = HostingDeviceAgentBinding {
            hosting_device_id: "vm-1".to_string(),
            complementary_id: "cid-1".to_string(),
            management_port_id: "mgmt-1".to_string(),
            agent_id: None,
            auto_schedule: true,
            created_at: 42,
        };
        let info = driver.get_device_info_for_agent(&binding, Some(&mgmt_port()));
        assert_eq!(info["management_ip_address"], "192.168.0.5");
        assert_eq!(info["protocol_port"], 5000);
    }
}
