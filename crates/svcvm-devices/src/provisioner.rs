//! Device provisioner: creates and destroys hosting devices.
//!
//! Creation allocates plugging resources first, then asks the device
//! driver for the device. A device-driver failure releases the plugging
//! resources before the error propagates, so a failed creation leaves
//! nothing behind. Deletion runs in the opposite order.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use svcvm_core::epoch_secs;
use svcvm_state::*;

use crate::driver::*;
use crate::error::{DeviceError, DeviceResult};
use crate::mgmt_network::ManagementNetwork;
use crate::network::{CorePlugin, Port};

pub struct DeviceProvisioner {
    store: StateStore,
    core: Arc<dyn CorePlugin>,
    mgmt: Arc<ManagementNetwork>,
    device_driver: Arc<dyn DeviceDriver>,
    plugging_driver: Arc<dyn PluggingDriver>,
}

impl DeviceProvisioner {
    pub fn new(
        store: StateStore,
        core: Arc<dyn CorePlugin>,
        mgmt: Arc<ManagementNetwork>,
        device_driver: Arc<dyn DeviceDriver>,
        plugging_driver: Arc<dyn PluggingDriver>,
    ) -> Self {
        Self {
            store,
            core,
            mgmt,
            device_driver,
            plugging_driver,
        }
    }

    pub fn management_network(&self) -> &Arc<ManagementNetwork> {
        &self.mgmt
    }

    /// Create a hosting device named `name`, optionally tailored to the
    /// router it will host, and record its binding.
    pub async fn create_hosting_device(
        &self,
        name: &str,
        router: Option<&Router>,
    ) -> DeviceResult<HostingDeviceAgentBinding> {
        let tenant_id = self.mgmt.l3_tenant_id().await.ok_or_else(|| {
            DeviceError::ManagementNetworkUnavailable("L3 admin tenant not resolved".to_string())
        })?;
        let mgmt_network_id = self.mgmt.mgmt_nw_id().await.ok_or_else(|| {
            DeviceError::ManagementNetworkUnavailable("management network not resolved".to_string())
        })?;

        let complementary_id = Uuid::new_v4().to_string();
        let request = ResourceRequest {
            complementary_id: complementary_id.clone(),
            tenant_id,
            mgmt_network_id,
            mgmt_security_group_id: self.mgmt.mgmt_sec_grp_id().await,
            plugging_data: self.device_driver.get_plugging_data(router),
        };
        let resources = self
            .plugging_driver
            .create_hosting_device_resources(&request)
            .await?;

        let Some(mgmt_port) = resources.mgmt_port.clone() else {
            self.release_resources(&resources).await;
            return Err(DeviceError::ProvisioningFailure(format!(
                "{name}: plugging driver allocated no management port"
            )));
        };
        let device_request = DeviceRequest {
            name: name.to_string(),
            complementary_id: complementary_id.clone(),
            mgmt_port,
            ports: resources.ports.clone(),
        };

        let hosting_device_id = match self.device_driver.create_device(&device_request).await {
            Ok(id) => id,
            Err(e) => {
                error!(%name, %complementary_id, error = %e, "hosting device creation failed, releasing its resources");
                self.release_resources(&resources).await;
                return Err(match e {
                    DeviceError::ProvisioningFailure(_) => e,
                    other => DeviceError::ProvisioningFailure(other.to_string()),
                });
            }
        };

        let binding = HostingDeviceAgentBinding {
            hosting_device_id: hosting_device_id.clone(),
            complementary_id,
            management_port_id: device_request.mgmt_port.id.clone(),
            agent_id: None,
            auto_schedule: true,
            created_at: epoch_secs(),
        };
        if let Err(e) = self.store.write(|txn| txn.insert_device_binding(&binding)) {
            error!(%hosting_device_id, error = %e, "failed to record hosting device, destroying it");
            if let Err(del) = self.device_driver.delete_device(&hosting_device_id).await {
                warn!(%hosting_device_id, error = %del, "failed to destroy unrecorded hosting device");
            }
            self.release_resources(&resources).await;
            return Err(e.into());
        }

        info!(%hosting_device_id, driver = self.device_driver.name(), "hosting device created");
        Ok(binding)
    }

    /// Destroy a hosting device and release its resources.
    ///
    /// A device the driver no longer knows counts as destroyed. The
    /// binding is removed last, which unschedules the resources it hosted.
    pub async fn delete_hosting_device(&self, hosting_device_id: &str) -> DeviceResult<()> {
        let binding = self
            .store
            .get_device_binding(hosting_device_id)?
            .ok_or_else(|| DeviceError::NoSuchHostingDevice(hosting_device_id.to_string()))?;
        let resources = self
            .plugging_driver
            .get_hosting_device_resources(&binding)
            .await?;

        match self.device_driver.delete_device(hosting_device_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(%hosting_device_id, "hosting device already gone");
            }
            Err(e) => return Err(e),
        }
        self.release_resources(&resources).await;

        self.store.write(|txn| txn.remove_device_binding(hosting_device_id, epoch_secs()))?;
        info!(%hosting_device_id, "hosting device deleted");
        Ok(())
    }

    async fn release_resources(&self, resources: &HostingDeviceResources) {
        if let Err(e) = self
            .plugging_driver
            .delete_hosting_device_resources(resources)
            .await
        {
            warn!(error = %e, "failed to release hosting device resources");
        }
    }

    pub async fn setup_port_connectivity(&self, port: &Port, hosting_device_id: &str) -> DeviceResult<()> {
        self.plugging_driver
            .setup_logical_port_connectivity(port, hosting_device_id)
            .await
    }

    pub async fn teardown_port_connectivity(&self, port: &Port, hosting_device_id: &str) -> DeviceResult<()> {
        self.plugging_driver
            .teardown_logical_port_connectivity(port, hosting_device_id)
            .await
    }

    /// Map `port` onto the device and persist the mapping in `txn`.
    pub fn allocate_hosting_port_in(
        &self,
        txn: &StoreTxn,
        resource_id: &str,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<HostedPortBinding> {
        let binding = self
            .plugging_driver
            .allocate_hosting_port(txn, resource_id, port, hosting_device_id)?;
        txn.put_hosted_port(&binding)?;
        debug!(%resource_id, port_id = %port.id, %hosting_device_id, vlan = ?binding.segmentation_id, "hosting port allocated");
        Ok(binding)
    }

    /// Map `port` onto the device in a transaction of its own.
    pub fn allocate_hosting_port(
        &self,
        resource_id: &str,
        port: &Port,
        hosting_device_id: &str,
    ) -> DeviceResult<HostedPortBinding> {
        self.store
            .write(|txn| self.allocate_hosting_port_in(txn, resource_id, port, hosting_device_id))
    }

    /// Hosting-side details of a mapped port.
    pub async fn extend_hosting_port_info(&self, binding: &HostedPortBinding) -> DeviceResult<HostingPortInfo> {
        let hosting_port = self.core.get_port(&binding.hosting_port_id).await?;
        Ok(self
            .plugging_driver
            .extend_hosting_port_info(binding, &hosting_port))
    }

    /// Device description for the config agent, including its management address.
    pub async fn get_device_info_for_agent(&self, binding: &HostingDeviceAgentBinding) -> serde_json::Value {
        let mgmt_port = match self.core.get_port(&binding.management_port_id).await {
            Ok(port) => Some(port),
            Err(e) => {
                warn!(hosting_device_id = %binding.hosting_device_id, error = %e, "management port lookup failed");
                None
            }
        };
        self.device_driver
            .get_device_info_for_agent(binding, mgmt_port.as_ref())
    }
}
