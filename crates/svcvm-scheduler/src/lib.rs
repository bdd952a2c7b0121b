//! svcvm-scheduler: places logical resources on hosting devices.
//!
//! - [`BindingStore`] keeps the resource → device → agent mapping.
//! - [`AgentRegistry`] and [`AgentSelector`] track config agents and
//!   assign them to devices.
//! - [`ResourceScheduler`] runs router and floating-IP operations through
//!   a [`RouterDriver`] hook set; [`GuestAgentRouterDriver`] hosts each
//!   router on a dedicated device.
//! - [`ServicePlugin`] is how the failure handler reaches services.

pub mod bindings;
pub mod driver;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod router_driver;
pub mod scheduler;
pub mod selector;
pub mod stack;

pub use bindings::BindingStore;
pub use driver::RouterDriver;
pub use error::{SchedulerError, SchedulerResult};
pub use plugin::ServicePlugin;
pub use registry::{AgentRegistry, AgentView};
pub use router_driver::GuestAgentRouterDriver;
pub use scheduler::{InterfaceRequest, ResourceScheduler, RouterUpdate};
pub use selector::AgentSelector;
pub use stack::{Collaborators, SchedulingStack};
