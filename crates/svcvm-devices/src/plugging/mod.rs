//! Plugging drivers and the port bookkeeping they share.

mod guest_agent;
mod vlan_trunk;

pub use guest_agent::GuestAgentPluggingDriver;
pub use vlan_trunk::VlanTrunkPluggingDriver;

use tracing::{debug, warn};

use svcvm_state::HostingDeviceAgentBinding;

use crate::driver::{HostingDeviceResources, ResourceRequest};
use crate::error::{DeviceError, DeviceResult};
use crate::network::{CorePlugin, Port, PortRequest};

pub const MGMT_PORT_OWNER: &str = "network:management";
pub const TRUNK_PORT_OWNER: &str = "network:hosting_device_trunk";

/// Create the management port of a new device, owned by its complementary id.
async fn create_mgmt_port(core: &dyn CorePlugin, request: &ResourceRequest) -> DeviceResult<Port> {
    let port = core
        .create_port(&PortRequest {
            tenant_id: request.tenant_id.clone(),
            network_id: request.mgmt_network_id.clone(),
            name: "mgmt".to_string(),
            device_id: request.complementary_id.clone(),
            device_owner: MGMT_PORT_OWNER.to_string(),
            security_groups: request.mgmt_security_group_id.iter().cloned().collect(),
        })
        .await
        .map_err(|e| DeviceError::Plugging(format!("management port: {e}")))?;
    debug!(port_id = %port.id, complementary_id = %request.complementary_id, "management port created");
    Ok(port)
}

/// Look up the ports owned by a device's complementary id.
async fn owned_resources(
    core: &dyn CorePlugin,
    binding: &HostingDeviceAgentBinding,
) -> DeviceResult<HostingDeviceResources> {
    let owned = core.list_ports(&binding.complementary_id).await?;
    let (mgmt, ports): (Vec<Port>, Vec<Port>) = owned
        .into_iter()
        .partition(|p| p.id == binding.management_port_id);
    Ok(HostingDeviceResources {
        mgmt_port: mgmt.into_iter().next(),
        ports,
    })
}

/// Delete every port in `resources`, continuing past failures.
async fn delete_owned_ports(core: &dyn CorePlugin, resources: &HostingDeviceResources) -> DeviceResult<()> {
    let mut failed = Vec::new();
    for port in resources.mgmt_port.iter().chain(resources.ports.iter()) {
        match core.delete_port(&port.id).await.map_err(DeviceError::from) {
            Ok(()) => debug!(port_id = %port.id, "hosting device port deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(port_id = %port.id, error = %e, "failed to delete hosting device port");
                failed.push(port.id.clone());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::Plugging(format!("ports not deleted: {}", failed.join(", "))))
    }
}
