//! Driver selection by configured name.

use std::sync::Arc;

use svcvm_core::ServiceVmConfig;
use svcvm_core::config::{DeviceDriverKind, PluggingDriverKind};

use crate::device::{Csr1kvDriver, GuestAgentDriver};
use crate::driver::{DeviceDriver, PluggingDriver};
use crate::network::{CorePlugin, VmManager};
use crate::plugging::{GuestAgentPluggingDriver, VlanTrunkPluggingDriver};

pub fn build_device_driver(config: &ServiceVmConfig, vm: Arc<dyn VmManager>) -> Arc<dyn DeviceDriver> {
    match config.device_handling.device_driver {
        DeviceDriverKind::GuestAgent => Arc::new(GuestAgentDriver::new(config.guest_agent.clone(), vm)),
        DeviceDriverKind::Csr1kv => Arc::new(Csr1kvDriver::new(config.csr1kv.clone(), vm)),
    }
}

pub fn build_plugging_driver(
    config: &ServiceVmConfig,
    core: Arc<dyn CorePlugin>,
    vm: Arc<dyn VmManager>,
) -> Arc<dyn PluggingDriver> {
    match config.device_handling.plugging_driver {
        PluggingDriverKind::GuestAgent => Arc::new(GuestAgentPluggingDriver::new(core, vm)),
        PluggingDriverKind::VlanTrunk => {
            Arc::new(VlanTrunkPluggingDriver::new(config.vlan_trunk.clone(), core))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCloud;

    #[test]
    fn drivers_follow_configuration() {
        let cloud = Arc::new(SimulatedCloud::new());
        let mut config = ServiceVmConfig::default();
        assert_eq!(build_device_driver(&config, cloud.clone()).name(), "guest_agent");
        assert_eq!(
            build_plugging_driver(&config, cloud.clone(), cloud.clone()).name(),
            "guest_agent"
        );

        config.device_handling.device_driver = DeviceDriverKind::Csr1kv;
        config.device_handling.plugging_driver = PluggingDriverKind::VlanTrunk;
        assert_eq!(build_device_driver(&config, cloud.clone()).name(), "csr1kv");
        assert_eq!(
            build_plugging_driver(&config, cloud.clone(), cloud).name(),
            "vlan_trunk"
        );
    }
}
