//! svcvm-notify: notifications to config agents.
//!
//! Notifications go over a [`MessageBus`], either cast to the host of the
//! agent managing a device or broadcast on a topic. Delivery is best
//! effort and never blocks a binding transition.

pub mod bus;
pub mod error;
pub mod hosting_device;
pub mod l3;

pub use bus::{ChannelBus, Delivery, Message, MessageBus, Target};
pub use error::{NotifyError, NotifyResult};
pub use hosting_device::{HostingDeviceNotifier, HostingInfo};
pub use l3::{HostResolver, L3ConfigAgentNotifier};
