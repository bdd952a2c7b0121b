//! Router driver for routers hosted on dedicated guest-agent devices.
//!
//! Each router gets a hosting device of its own. The router's ports are
//! mapped onto the device when it is scheduled, and re-plugged as its
//! gateway and interfaces change. Every change moves the binding
//! `ACTIVE → PENDING_UPDATE` in the db phase and back in the post phase,
//! so concurrent changes of one router conflict instead of interleaving.
//! Deletion runs under the lock scope `router-delete:<router>` so the
//! backlog's retry and a live delete never remove the same device twice.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use svcvm_core::{NamedLocks, epoch_secs};
use svcvm_devices::{CorePlugin, DeviceError, DeviceProvisioner, Port, PortUpdate};
use svcvm_notify::{HostingInfo, L3ConfigAgentNotifier};
use svcvm_state::*;

use crate::bindings::BindingStore;
use crate::driver::RouterDriver;
use crate::error::{SchedulerError, SchedulerResult};
use crate::plugin::ServicePlugin;
use crate::selector::AgentSelector;

pub struct GuestAgentRouterDriver {
    store: StateStore,
    core: Arc<dyn CorePlugin>,
    provisioner: Arc<DeviceProvisioner>,
    bindings: Arc<BindingStore>,
    selector: Arc<AgentSelector>,
    notifier: L3ConfigAgentNotifier,
    locks: NamedLocks,
}

impl GuestAgentRouterDriver {
    pub fn new(
        store: StateStore,
        core: Arc<dyn CorePlugin>,
        provisioner: Arc<DeviceProvisioner>,
        bindings: Arc<BindingStore>,
        selector: Arc<AgentSelector>,
        notifier: L3ConfigAgentNotifier,
        locks: NamedLocks,
    ) -> Self {
        Self {
            store,
            core,
            provisioner,
            bindings,
            selector,
            notifier,
            locks,
        }
    }

    /// Move a hosted router to `PENDING_UPDATE` and return its device.
    /// Unscheduled routers have nothing to reconfigure and are left alone.
    fn begin_update(&self, txn: &StoreTxn, router_id: &str) -> SchedulerResult<Option<HostingDeviceId>> {
        match txn.get_resource_binding(router_id)? {
            None => Ok(None),
            Some(b) if b.status == BindingStatus::PendingCreate => Ok(None),
            Some(_) => {
                let claimed = self.bindings.update_binding_in(
                    txn,
                    router_id,
                    BindingStatus::Active,
                    BindingStatus::PendingUpdate,
                    None,
                )?;
                Ok(claimed.hosting_device_id)
            }
        }
    }

    fn finish_update(&self, router_id: &str) -> SchedulerResult<()> {
        self.bindings.update_binding(
            router_id,
            BindingStatus::PendingUpdate,
            BindingStatus::Active,
            None,
        )?;
        Ok(())
    }

    async fn plug_port(&self, router_id: &str, port_id: &str, hosting_device_id: &str) -> SchedulerResult<()> {
        let port = self.core.get_port(port_id).await.map_err(DeviceError::from)?;
        self.provisioner
            .allocate_hosting_port(router_id, &port, hosting_device_id)?;
        self.provisioner
            .setup_port_connectivity(&port, hosting_device_id)
            .await?;
        Ok(())
    }

    async fn unplug_port(&self, router_id: &str, port_id: &str, hosting_device_id: &str) -> SchedulerResult<()> {
        match self.core.get_port(port_id).await.map_err(DeviceError::from) {
            Ok(port) => {
                self.provisioner
                    .teardown_port_connectivity(&port, hosting_device_id)
                    .await?
            }
            Err(e) if e.is_not_found() => debug!(%port_id, "port already gone"),
            Err(e) => return Err(e.into()),
        }
        self.store
            .write(|txn| txn.remove_hosted_port(router_id, port_id))?;
        Ok(())
    }

    /// Mark a removed router port for deletion by the compute side.
    async fn disown_port(&self, port_id: &str) -> SchedulerResult<()> {
        let port = match self.core.get_port(port_id).await.map_err(DeviceError::from) {
            Ok(port) => port,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if port.device_owner.ends_with(":deleting") {
            return Ok(());
        }
        let update = PortUpdate {
            device_owner: Some(format!("{}:deleting", port.device_owner)),
            ..Default::default()
        };
        self.core
            .update_port(port_id, &update)
            .await
            .map_err(DeviceError::from)?;
        debug!(%port_id, "router port disowned");
        Ok(())
    }

    async fn rewire_gateway(&self, old: &Router, new: &Router, hosting_device_id: &str) -> SchedulerResult<()> {
        if let Some(gw) = &old.gateway {
            self.unplug_port(&old.id, &gw.port_id, hosting_device_id).await?;
        }
        if let Some(gw) = &new.gateway {
            self.plug_port(&new.id, &gw.port_id, hosting_device_id).await?;
        }
        Ok(())
    }

    async fn notify_updated(&self, router_ids: &[ResourceId], operation: &str) {
        if let Err(e) = self.notifier.routers_updated(router_ids, operation).await {
            warn!(%operation, error = %e, "router update notification failed");
        }
    }

    async fn fetch_ports(&self, port_ids: &[PortId]) -> SchedulerResult<Vec<Port>> {
        let mut ports = Vec::with_capacity(port_ids.len());
        for port_id in port_ids {
            ports.push(self.core.get_port(port_id).await.map_err(DeviceError::from)?);
        }
        Ok(ports)
    }

    /// Routers on devices managed by the hosting-device agents of `host`.
    fn routers_on_host(&self, host: &str) -> StateResult<Vec<ResourceId>> {
        let mut ids = Vec::new();
        for agent in self.store.find_agents(self.selector.registry().agent_type(), Some(host))? {
            for device in self.store.list_devices_for_agent(&agent.id)? {
                ids.extend(
                    self.store
                        .list_bindings_on_device(&device.hosting_device_id)?
                        .into_iter()
                        .filter(|b| b.resource_type == ResourceType::Router)
                        .map(|b| b.resource_id),
                );
            }
        }
        Ok(ids)
    }

    async fn discard_device(&self, hosting_device_id: &str) {
        if let Err(e) = self.provisioner.delete_hosting_device(hosting_device_id).await {
            error!(%hosting_device_id, error = %e, "failed to delete unused hosting device");
        }
    }

    /// Delete the hosting device of a `PENDING_DELETE` router, then its
    /// binding. If the device cannot be deleted the binding keeps pointing
    /// at it and the error is returned.
    async fn finish_delete(&self, router_id: &str) -> SchedulerResult<bool> {
        let _scope = self.locks.lock(&format!("router-delete:{router_id}")).await;
        let binding = match self.store.get_resource_binding(router_id)? {
            Some(b) if b.status == BindingStatus::PendingDelete => b,
            _ => return Ok(false),
        };
        if let Err(e) = self.notifier.router_deleted(router_id).await {
            warn!(%router_id, error = %e, "router deletion notification failed");
        }
        if let Some(device_id) = &binding.hosting_device_id {
            match self.provisioner.delete_hosting_device(device_id).await {
                Ok(()) | Err(DeviceError::NoSuchHostingDevice(_)) => {}
                Err(e) => {
                    error!(%router_id, hosting_device_id = %device_id, error = %e, "failed to delete router's hosting device, deletion stays pending");
                    return Err(e.into());
                }
            }
        }
        self.bindings.delete_binding(router_id)?;
        info!(%router_id, "router unscheduled and binding removed");
        Ok(true)
    }
}

#[async_trait]
impl RouterDriver for GuestAgentRouterDriver {
    async fn create_router_pre(&self, router: &Router) -> SchedulerResult<()> {
        if self
            .provisioner
            .management_network()
            .mgmt_nw_id()
            .await
            .is_none()
        {
            return Err(SchedulerError::ManagementNetworkUnavailable(format!(
                "cannot host router {}",
                router.id
            )));
        }
        Ok(())
    }

    fn create_router_db(&self, txn: &StoreTxn, router: &Router) -> SchedulerResult<()> {
        self.bindings
            .create_binding_in(txn, ResourceType::Router, &router.id)?;
        Ok(())
    }

    async fn create_router_post(&self, router: &Router) -> SchedulerResult<()> {
        self.schedule_router(&router.id).await?;
        Ok(())
    }

    fn update_router_db(
        &self,
        txn: &StoreTxn,
        _old: &Router,
        new: &Router,
    ) -> SchedulerResult<Option<HostingDeviceId>> {
        self.begin_update(txn, &new.id)
    }

    async fn update_router_post(&self, old: &Router, new: &Router, claimed: Option<&str>) -> SchedulerResult<()> {
        let Some(device_id) = claimed else {
            return Ok(());
        };
        let rewired = if old.gateway != new.gateway {
            self.rewire_gateway(old, new, device_id).await
        } else {
            Ok(())
        };
        if let Err(e) = &rewired {
            error!(router_id = %new.id, error = %e, "gateway reconfiguration failed");
        }
        self.finish_update(&new.id)?;
        self.notify_updated(&[new.id.clone()], "update").await;
        rewired
    }

    fn delete_router_db(&self, txn: &StoreTxn, router: &Router) -> SchedulerResult<()> {
        let Some(binding) = txn.get_resource_binding(&router.id)? else {
            return Ok(());
        };
        // Unscheduled routers go straight to deletion; hosted ones must be idle.
        let expected = match binding.status {
            BindingStatus::PendingCreate => BindingStatus::PendingCreate,
            _ => BindingStatus::Active,
        };
        self.bindings
            .update_binding_in(txn, &router.id, expected, BindingStatus::PendingDelete, None)?;
        Ok(())
    }

    async fn delete_router_post(&self, router: &Router) -> SchedulerResult<()> {
        self.finish_delete(&router.id).await?;
        Ok(())
    }

    fn add_router_interface_db(&self, txn: &StoreTxn, router_id: &str) -> SchedulerResult<Option<HostingDeviceId>> {
        self.begin_update(txn, router_id)
    }

    async fn add_router_interface_post(
        &self,
        router_id: &str,
        port_id: &str,
        claimed: Option<&str>,
    ) -> SchedulerResult<()> {
        let Some(device_id) = claimed else {
            return Ok(());
        };
        let plugged = self.plug_port(router_id, port_id, device_id).await;
        if let Err(e) = &plugged {
            error!(%router_id, %port_id, error = %e, "failed to plug router interface");
        }
        self.finish_update(router_id)?;
        self.notify_updated(&[router_id.to_string()], "add_interface").await;
        plugged
    }

    fn remove_router_interface_db(&self, txn: &StoreTxn, router_id: &str) -> SchedulerResult<Option<HostingDeviceId>> {
        self.begin_update(txn, router_id)
    }

    async fn remove_router_interface_post(
        &self,
        router_id: &str,
        port_id: &str,
        claimed: Option<&str>,
    ) -> SchedulerResult<()> {
        let unplugged = match claimed {
            Some(device_id) => {
                let unplugged = self.unplug_port(router_id, port_id, device_id).await;
                self.finish_update(router_id)?;
                self.notify_updated(&[router_id.to_string()], "remove_interface")
                    .await;
                unplugged
            }
            None => Ok(()),
        };
        self.disown_port(port_id).await?;
        unplugged
    }

    fn floatingips_db(&self, txn: &StoreTxn, router_ids: &[ResourceId]) -> SchedulerResult<Vec<ResourceId>> {
        let mut claimed = Vec::new();
        for router_id in router_ids {
            if self.begin_update(txn, router_id)?.is_some() {
                claimed.push(router_id.clone());
            }
        }
        Ok(claimed)
    }

    async fn floatingips_post(&self, claimed: &[ResourceId], operation: &str) -> SchedulerResult<()> {
        for router_id in claimed {
            self.finish_update(router_id)?;
        }
        if !claimed.is_empty() {
            self.notify_updated(claimed, operation).await;
        }
        Ok(())
    }

    async fn schedule_router(&self, router_id: &str) -> SchedulerResult<bool> {
        let router = self
            .store
            .get_router(router_id)?
            .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))?;
        match self.store.get_resource_binding(router_id)? {
            Some(b) if b.status == BindingStatus::PendingCreate && !b.is_scheduled() => {}
            _ => return Ok(false),
        }

        let device = self
            .provisioner
            .create_hosting_device(&format!("router-{router_id}"), Some(&router))
            .await?;
        let device_id = device.hosting_device_id.clone();

        let ports = match self.fetch_ports(&router.port_ids()).await {
            Ok(ports) => ports,
            Err(e) => {
                self.discard_device(&device_id).await;
                return Err(e);
            }
        };
        let activated = self.store.write(|txn| -> SchedulerResult<()> {
            self.bindings.update_binding_in(
                txn,
                router_id,
                BindingStatus::PendingCreate,
                BindingStatus::Active,
                Some(device_id.as_str()),
            )?;
            for port in &ports {
                self.provisioner
                    .allocate_hosting_port_in(txn, router_id, port, &device_id)?;
            }
            Ok(())
        });
        if let Err(e) = activated {
            // Lost the race to another scheduler, or the router went away.
            warn!(%router_id, hosting_device_id = %device_id, error = %e, "router not activated, discarding its device");
            self.discard_device(&device_id).await;
            return Err(e);
        }

        for port in &ports {
            if let Err(e) = self.provisioner.setup_port_connectivity(port, &device_id).await {
                error!(%router_id, port_id = %port.id, error = %e, "failed to connect router port");
            }
        }
        if self.selector.select_agent(&device_id).await?.is_none() {
            warn!(%router_id, hosting_device_id = %device_id, "router scheduled without a config agent");
        }
        info!(%router_id, hosting_device_id = %device_id, "router scheduled");
        self.notify_updated(&[router_id.to_string()], "create").await;
        Ok(true)
    }

    async fn retry_delete(&self, router_id: &str) -> SchedulerResult<bool> {
        self.finish_delete(router_id).await
    }
}

#[async_trait]
impl ServicePlugin for GuestAgentRouterDriver {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Router
    }

    fn handle_non_responding_hosting_devices_db(
        &self,
        txn: &StoreTxn,
        hosting_device_ids: &[HostingDeviceId],
        hosting_info: &mut HostingInfo,
    ) -> StateResult<()> {
        let now = epoch_secs();
        for device_id in hosting_device_ids {
            for binding in txn.list_bindings_on_device(device_id)? {
                if binding.resource_type != ResourceType::Router {
                    continue;
                }
                hosting_info
                    .entry(device_id.clone())
                    .or_default()
                    .entry(ResourceType::Router.inventory_key().to_string())
                    .or_default()
                    .push(binding.resource_id.clone());
                txn.unschedule_resource(&binding.resource_id, now)?;
            }
        }
        Ok(())
    }

    async fn handle_non_responding_hosting_devices_post(&self, hosting_info: &HostingInfo) {
        for router_id in hosting_info
            .values()
            .filter_map(|by_type| by_type.get(ResourceType::Router.inventory_key()))
            .flatten()
        {
            match self
                .store
                .write(|txn| txn.remove_hosted_ports_for_resource(router_id))
            {
                Ok(removed) => debug!(%router_id, removed, "hosted ports of unscheduled router removed"),
                Err(e) => warn!(%router_id, error = %e, "failed to remove hosted ports"),
            }
        }
    }

    async fn auto_schedule_hosting_devices(&self, host: &str) -> bool {
        match self.selector.auto_schedule_hosting_devices(host) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(%host, error = %e, "auto-scheduling hosting devices failed");
                return false;
            }
        }

        // Bring the agent up to date with the routers it now manages.
        match self.routers_on_host(host) {
            Ok(ids) if !ids.is_empty() => self.notify_updated(&ids, "sync").await,
            Ok(_) => {}
            Err(e) => warn!(%host, error = %e, "failed to list routers for agent"),
        }
        true
    }
}
