//! svcvm-devices: hosting-device provisioning.
//!
//! Hosting devices are service VMs or appliances that realize logical
//! resources. This crate talks to the external cloud services through the
//! traits in [`network`], resolves the management network, and drives the
//! configured [`DeviceDriver`] and [`PluggingDriver`] through the
//! [`DeviceProvisioner`].

pub mod device;
pub mod driver;
pub mod error;
pub mod mgmt_network;
pub mod network;
pub mod plugging;
pub mod provisioner;
pub mod registry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use driver::{DeviceDriver, HostingDeviceResources, HostingPortInfo, PluggingDriver};
pub use error::{DeviceError, DeviceResult};
pub use mgmt_network::ManagementNetwork;
pub use network::{CorePlugin, IdentityService, NotFound, Port, PortUpdate, VmManager};
pub use provisioner::DeviceProvisioner;
#[cfg(any(test, feature = "sim"))]
pub use sim::SimulatedCloud;
