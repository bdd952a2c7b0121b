//! Wiring of the scheduling components from configuration.

use std::sync::Arc;

use svcvm_core::{NamedLocks, ServiceVmConfig};
use svcvm_devices::registry::{build_device_driver, build_plugging_driver};
use svcvm_devices::{CorePlugin, DeviceProvisioner, IdentityService, ManagementNetwork, VmManager};
use svcvm_notify::{HostResolver, L3ConfigAgentNotifier, MessageBus};
use svcvm_state::StateStore;

use crate::bindings::BindingStore;
use crate::registry::AgentRegistry;
use crate::router_driver::GuestAgentRouterDriver;
use crate::scheduler::ResourceScheduler;
use crate::selector::AgentSelector;

/// External services the scheduling stack talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub core: Arc<dyn CorePlugin>,
    pub identity: Arc<dyn IdentityService>,
    pub vm: Arc<dyn VmManager>,
    pub bus: Arc<dyn MessageBus>,
}

/// Every scheduling component, built once and shared.
pub struct SchedulingStack {
    pub store: StateStore,
    pub locks: NamedLocks,
    pub registry: AgentRegistry,
    pub selector: Arc<AgentSelector>,
    pub provisioner: Arc<DeviceProvisioner>,
    pub bindings: Arc<BindingStore>,
    pub router_driver: Arc<GuestAgentRouterDriver>,
    pub scheduler: ResourceScheduler,
}

impl SchedulingStack {
    pub fn build(config: &ServiceVmConfig, store: StateStore, collaborators: Collaborators) -> Self {
        let Collaborators { core, identity, vm, bus } = collaborators;
        let locks = NamedLocks::new();

        let registry = AgentRegistry::new(store.clone(), &config.agents);
        let selector = Arc::new(AgentSelector::new(store.clone(), registry.clone(), locks.clone()));

        let mgmt = Arc::new(ManagementNetwork::new(
            config.management_network.clone(),
            core.clone(),
            identity,
            locks.clone(),
        ));
        let provisioner = Arc::new(DeviceProvisioner::new(
            store.clone(),
            core.clone(),
            mgmt,
            build_device_driver(config, vm.clone()),
            build_plugging_driver(config, core.clone(), vm),
        ));

        let bindings = Arc::new(BindingStore::new(store.clone(), selector.clone(), provisioner.clone()));
        let resolver: Arc<dyn HostResolver> = bindings.clone();
        let notifier = L3ConfigAgentNotifier::new(bus, resolver);

        let router_driver = Arc::new(GuestAgentRouterDriver::new(
            store.clone(),
            core.clone(),
            provisioner.clone(),
            bindings.clone(),
            selector.clone(),
            notifier,
            locks.clone(),
        ));
        let scheduler = ResourceScheduler::new(store.clone(), core, router_driver.clone());

        Self {
            store,
            locks,
            registry,
            selector,
            provisioner,
            bindings,
            router_driver,
            scheduler,
        }
    }
}
