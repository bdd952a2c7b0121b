//! Device driver for CSR1kv virtual router appliances.
//!
//! The appliance is configured over SSH using the credentials from
//! `[csr1kv]`, and needs `booting_time_secs` before it accepts
//! configuration. Both are passed on to the config agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use svcvm_core::config::Csr1kvConfig;
use svcvm_state::{HostingDeviceAgentBinding, Router};

use crate::driver::{DeviceDriver, DeviceRequest, PluggingData};
use crate::error::{DeviceError, DeviceResult};
use crate::network::{Port, VmManager, VmSpec};

const SSH_PORT: u16 = 22;

pub struct Csr1kvDriver {
    config: Csr1kvConfig,
    vm: Arc<dyn VmManager>,
}

impl Csr1kvDriver {
    pub fn new(config: Csr1kvConfig, vm: Arc<dyn VmManager>) -> Self {
        Self { config, vm }
    }

    fn bootstrap_config(&self, request: &DeviceRequest) -> BTreeMap<String, String> {
        let mgmt_ip = request.mgmt_port.first_ip().unwrap_or_default();
        let body = format!(
            "hostname {name}\n\
             username {user} privilege 15 password {password}\n\
             interface GigabitEthernet1\n ip address {mgmt_ip} 255.255.255.0\n no shutdown\n\
             ip ssh version 2\n\
             line vty 0 4\n login local\n transport input ssh\n",
            name = request.name,
            user = self.config.username,
            password = self.config.password,
        );
        BTreeMap::from([("iosxe_config.txt".to_string(), body)])
    }
}

#[async_trait]
impl DeviceDriver for Csr1kvDriver {
    fn name(&self) -> &'static str {
        "csr1kv"
    }

    async fn create_device(&self, request: &DeviceRequest) -> DeviceResult<String> {
        let spec = VmSpec {
            name: request.name.clone(),
            template_id: self.config.template_id.clone(),
            port_ids: std::iter::once(request.mgmt_port.id.clone())
                .chain(request.ports.iter().map(|p| p.id.clone()))
                .collect(),
            config_files: self.bootstrap_config(request),
        };
        let vm_id = self
            .vm
            .create_vm(&spec)
            .await
            .map_err(|e| DeviceError::ProvisioningFailure(format!("{}: {e}", request.name)))?;
        debug!(hosting_device_id = %vm_id, name = %request.name, "CSR1kv appliance created");
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
            "protocol_port": SSH_PORT,
            "booting_time": self.config.booting_time_secs,
            "created_at": binding.created_at,
            "credentials": {
                "username": self.config.username,
                "password": self.config.password,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCloud;

    #[test]
    fn agent_info_includes_credentials_and_boot_time() {
        let driver = Csr1kvDriver::new(Csr1kvConfig::default(), Arc::new(SimulatedCloud::new()));
        let binding = HostingDeviceAgentBinding {
            hosting_device_id: "vm-7".to_string(),
            complementary_id: "cid-7".to_string(),
            management_port_id: "mgmt-7".to_string(),
            agent_id: Some("agent-1".to_string()),
            auto_schedule: true,
            created_at: 100,
        };
        let info = driver.get_device_info_for_agent(&binding, None);
        assert_eq!(info["booting_time"], 420);
        assert_eq!(info["credentials"]["username"], "stack");
        assert_eq!(info["protocol_port"], 22);
        assert!(info["management_ip_address"].is_null());
    }
}
