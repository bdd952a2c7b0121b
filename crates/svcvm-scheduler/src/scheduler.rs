//! Resource scheduler: runs router and floating-IP operations through the
//! router driver's hook set.
//!
//! For every operation the base record mutation and the driver's db hook
//! commit in one transaction; the post hook runs after commit. External
//! calls to the core plugin happen before or after that transaction,
//! never inside it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use svcvm_core::epoch_secs;
use svcvm_devices::network::PortRequest;
use svcvm_devices::{CorePlugin, DeviceError, PortUpdate};
use svcvm_state::*;

use crate::driver::RouterDriver;
use crate::error::{SchedulerError, SchedulerResult};

pub const ROUTER_INTERFACE_OWNER: &str = "network:router_interface";

/// Changes to a router; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RouterUpdate {
    pub name: Option<String>,
    pub admin_state_up: Option<bool>,
    /// `Some(None)` clears the gateway.
    pub gateway: Option<Option<ExternalGateway>>,
}

/// Identifies a router interface by its port or by its subnet.
#[derive(Debug, Clone, Default)]
pub struct InterfaceRequest {
    pub port_id: Option<String>,
    pub subnet_id: Option<String>,
}

pub struct ResourceScheduler {
    store: StateStore,
    core: Arc<dyn CorePlugin>,
    driver: Arc<dyn RouterDriver>,
}

impl ResourceScheduler {
    pub fn new(store: StateStore, core: Arc<dyn CorePlugin>, driver: Arc<dyn RouterDriver>) -> Self {
        Self { store, core, driver }
    }

    // ── Routers ────────────────────────────────────────────────────

    /// Create a router and schedule it onto a new hosting device.
    ///
    /// If provisioning fails the router and its `PENDING_CREATE` binding
    /// remain, and the backlog retries scheduling later.
    pub async fn create_router(&self, mut router: Router) -> SchedulerResult<Router> {
        self.driver.create_router_pre(&router).await?;

        let now = epoch_secs();
        router.created_at = now;
        router.updated_at = now;
        self.store.write(|txn| -> SchedulerResult<()> {
            if txn.get_router(&router.id)?.is_some() {
                return Err(SchedulerError::BadRequest(format!("router {} exists", router.id)));
            }
            txn.put_router(&router)?;
            self.driver.create_router_db(txn, &router)
        })?;
        info!(router_id = %router.id, "router created");

        self.driver.create_router_post(&router).await?;
        Ok(router)
    }

    pub async fn update_router(&self, router_id: &str, update: RouterUpdate) -> SchedulerResult<Router> {
        let (old, new, claimed) = self.store.write(|txn| -> SchedulerResult<(Router, Router, Option<HostingDeviceId>)> {
            let old = txn
                .get_router(router_id)?
                .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))?;
            let mut new = old.clone();
            if let Some(name) = &update.name {
                new.name = name.clone();
            }
            if let Some(up) = update.admin_state_up {
                new.admin_state_up = up;
            }
            if let Some(gateway) = &update.gateway {
                new.gateway = gateway.clone();
            }
            new.updated_at = epoch_secs();
            txn.put_router(&new)?;
            let claimed = self.driver.update_router_db(txn, &old, &new)?;
            Ok((old, new, claimed))
        })?;

        self.driver
            .update_router_post(&old, &new, claimed.as_deref())
            .await?;
        Ok(new)
    }

    pub async fn delete_router(&self, router_id: &str) -> SchedulerResult<()> {
        let router = self.store.write(|txn| -> SchedulerResult<Router> {
            let router = txn
                .get_router(router_id)?
                .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))?;
            if !router.interfaces.is_empty() {
                return Err(SchedulerError::BadRequest(format!(
                    "router {router_id} still has {} interface(s)",
                    router.interfaces.len()
                )));
            }
            txn.remove_router(router_id)?;
            self.driver.delete_router_db(txn, &router)?;
            Ok(router)
        })?;
        info!(%router_id, "router deleted");

        self.driver.delete_router_post(&router).await
    }

    // ── Router interfaces ──────────────────────────────────────────

    /// Attach an internal subnet to a router, through an existing port or
    /// a new port on the subnet.
    pub async fn add_router_interface(
        &self,
        router_id: &str,
        request: InterfaceRequest,
    ) -> SchedulerResult<RouterInterface> {
        if self.store.get_router(router_id)?.is_none() {
            return Err(SchedulerError::RouterNotFound(router_id.to_string()));
        }
        let port = match (&request.port_id, &request.subnet_id) {
            (Some(port_id), None) => {
                let port = self.core.get_port(port_id).await.map_err(DeviceError::from)?;
                if !port.device_id.is_empty() {
                    return Err(SchedulerError::BadRequest(format!("port {port_id} is in use")));
                }
                let update = PortUpdate {
                    device_id: Some(router_id.to_string()),
                    device_owner: Some(ROUTER_INTERFACE_OWNER.to_string()),
                };
                self.core
                    .update_port(port_id, &update)
                    .await
                    .map_err(DeviceError::from)?
            }
            (None, Some(subnet_id)) => {
                let subnet = self.core.get_subnet(subnet_id).await.map_err(DeviceError::from)?;
                let tenant_id = self
                    .store
                    .get_router(router_id)?
                    .map(|r| r.tenant_id)
                    .unwrap_or_default();
                self.core
                    .create_port(&PortRequest {
                        tenant_id,
                        network_id: subnet.network_id,
                        name: String::new(),
                        device_id: router_id.to_string(),
                        device_owner: ROUTER_INTERFACE_OWNER.to_string(),
                        security_groups: Vec::new(),
                    })
                    .await
                    .map_err(DeviceError::from)?
            }
            _ => {
                return Err(SchedulerError::BadRequest(
                    "either a port or a subnet must be given, not both".to_string(),
                ));
            }
        };
        let subnet_id = port
            .fixed_ips
            .first()
            .map(|ip| ip.subnet_id.clone())
            .ok_or_else(|| SchedulerError::BadRequest(format!("port {} has no fixed IP", port.id)))?;
        let interface = RouterInterface {
            port_id: port.id.clone(),
            subnet_id,
        };

        let claimed = self.store.write(|txn| -> SchedulerResult<Option<HostingDeviceId>> {
            let mut router = txn
                .get_router(router_id)?
                .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))?;
            if router.interfaces.iter().any(|i| i.subnet_id == interface.subnet_id) {
                return Err(SchedulerError::BadRequest(format!(
                    "router {router_id} already has an interface on subnet {}",
                    interface.subnet_id
                )));
            }
            router.interfaces.push(interface.clone());
            router.updated_at = epoch_secs();
            txn.put_router(&router)?;
            self.driver.add_router_interface_db(txn, router_id)
        })?;
        info!(%router_id, port_id = %interface.port_id, "router interface added");

        self.driver
            .add_router_interface_post(router_id, &interface.port_id, claimed.as_deref())
            .await?;
        Ok(interface)
    }

    /// Detach an interface, found by port or by subnet, and delete its port.
    pub async fn remove_router_interface(
        &self,
        router_id: &str,
        request: InterfaceRequest,
    ) -> SchedulerResult<RouterInterface> {
        if request.port_id.is_none() && request.subnet_id.is_none() {
            return Err(SchedulerError::BadRequest(
                "either a port or a subnet must be given".to_string(),
            ));
        }
        let (interface, claimed) = self.store.write(|txn| -> SchedulerResult<(RouterInterface, Option<HostingDeviceId>)> {
            let mut router = txn
                .get_router(router_id)?
                .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))?;
            let position = router
                .interfaces
                .iter()
                .position(|i| match (&request.port_id, &request.subnet_id) {
                    (Some(port_id), _) => &i.port_id == port_id,
                    (None, Some(subnet_id)) => &i.subnet_id == subnet_id,
                    (None, None) => false,
                })
                .ok_or_else(|| {
                    SchedulerError::BadRequest(format!("router {router_id} has no such interface"))
                })?;
            let interface = router.interfaces.remove(position);
            router.updated_at = epoch_secs();
            txn.put_router(&router)?;
            let claimed = self.driver.remove_router_interface_db(txn, router_id)?;
            Ok((interface, claimed))
        })?;
        info!(%router_id, port_id = %interface.port_id, "router interface removed");

        self.driver
            .remove_router_interface_post(router_id, &interface.port_id, claimed.as_deref())
            .await?;
        self.delete_port(&interface.port_id).await?;
        Ok(interface)
    }

    // ── Floating IPs ───────────────────────────────────────────────

    pub async fn create_floatingip(&self, fip: FloatingIp) -> SchedulerResult<FloatingIp> {
        if fip.port_id.is_some() != fip.router_id.is_some() {
            return Err(SchedulerError::BadRequest(
                "an associated floating IP needs both a port and a router".to_string(),
            ));
        }
        let routers = floatingips_to_router_ids([&fip]);
        let claimed = self.store.write(|txn| -> SchedulerResult<Vec<ResourceId>> {
            if txn.get_floating_ip(&fip.id)?.is_some() {
                return Err(SchedulerError::BadRequest(format!("floating IP {} exists", fip.id)));
            }
            txn.put_floating_ip(&fip)?;
            self.driver.floatingips_db(txn, &routers)
        })?;
        self.driver.floatingips_post(&claimed, "create_floatingip").await?;
        Ok(fip)
    }

    /// Re-associate a floating IP. `None` port disassociates it.
    pub async fn update_floatingip(
        &self,
        floatingip_id: &str,
        port_id: Option<String>,
        fixed_ip_address: Option<String>,
        router_id: Option<String>,
    ) -> SchedulerResult<FloatingIp> {
        if port_id.is_some() != router_id.is_some() {
            return Err(SchedulerError::BadRequest(
                "an associated floating IP needs both a port and a router".to_string(),
            ));
        }
        let (claimed, new) = self.store.write(|txn| -> SchedulerResult<(Vec<ResourceId>, FloatingIp)> {
            let old = txn
                .get_floating_ip(floatingip_id)?
                .ok_or_else(|| SchedulerError::FloatingIpNotFound(floatingip_id.to_string()))?;
            let mut new = old.clone();
            new.port_id = port_id.clone();
            new.fixed_ip_address = fixed_ip_address.clone();
            new.router_id = router_id.clone();
            txn.put_floating_ip(&new)?;
            let routers = floatingips_to_router_ids([&old, &new]);
            let claimed = self.driver.floatingips_db(txn, &routers)?;
            Ok((claimed, new))
        })?;
        self.driver.floatingips_post(&claimed, "update_floatingip").await?;
        Ok(new)
    }

    pub async fn delete_floatingip(&self, floatingip_id: &str) -> SchedulerResult<()> {
        let claimed = self.store.write(|txn| -> SchedulerResult<Vec<ResourceId>> {
            let fip = txn
                .get_floating_ip(floatingip_id)?
                .ok_or_else(|| SchedulerError::FloatingIpNotFound(floatingip_id.to_string()))?;
            txn.remove_floating_ip(floatingip_id)?;
            let routers = floatingips_to_router_ids([&fip]);
            self.driver.floatingips_db(txn, &routers)
        })?;
        self.driver.floatingips_post(&claimed, "delete_floatingip").await
    }

    /// Disassociate every floating IP bound to `port_id`.
    pub async fn disassociate_floatingips(&self, port_id: &str) -> SchedulerResult<Vec<ResourceId>> {
        let (routers, claimed) = self.store.write(|txn| -> SchedulerResult<(Vec<ResourceId>, Vec<ResourceId>)> {
            let fips: Vec<FloatingIp> = txn
                .list_floating_ips()?
                .into_iter()
                .filter(|f| f.port_id.as_deref() == Some(port_id))
                .collect();
            let routers = floatingips_to_router_ids(&fips);
            for mut fip in fips {
                fip.port_id = None;
                fip.fixed_ip_address = None;
                fip.router_id = None;
                txn.put_floating_ip(&fip)?;
            }
            let claimed = self.driver.floatingips_db(txn, &routers)?;
            Ok((routers, claimed))
        })?;
        if !claimed.is_empty() {
            self.driver
                .floatingips_post(&claimed, "disassociate_floatingips")
                .await?;
        }
        Ok(routers)
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Delete a logical port with its floating-IP associations and
    /// hosted-port mappings.
    pub async fn delete_port(&self, port_id: &str) -> SchedulerResult<()> {
        self.disassociate_floatingips(port_id).await?;
        let removed = self
            .store
            .write(|txn| txn.remove_hosted_ports_for_port(port_id))?;
        debug!(%port_id, removed, "hosted port mappings removed");

        match self.core.delete_port(port_id).await.map_err(DeviceError::from) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Backlog ────────────────────────────────────────────────────

    /// Try to schedule every unscheduled, auto-schedulable router, and
    /// finish router deletions whose hosting device is still around.
    ///
    /// Returns how many routers were scheduled.
    pub async fn process_backlog(&self) -> SchedulerResult<usize> {
        self.retry_pending_deletes().await?;

        let backlog: Vec<ResourceId> = self
            .store
            .list_schedulable_bindings()?
            .into_iter()
            .filter(|b| b.resource_type == ResourceType::Router)
            .map(|b| b.resource_id)
            .collect();
        if backlog.is_empty() {
            return Ok(0);
        }

        let mut scheduled = 0;
        for router_id in &backlog {
            match self.driver.schedule_router(router_id).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => warn!(%router_id, error = %e, "backlogged router not scheduled"),
            }
        }
        info!(pending = backlog.len(), scheduled, "router backlog processed");
        Ok(scheduled)
    }

    async fn retry_pending_deletes(&self) -> SchedulerResult<usize> {
        let pending: Vec<ResourceId> = self
            .store
            .list_resource_bindings()?
            .into_iter()
            .filter(|b| b.resource_type == ResourceType::Router && b.status == BindingStatus::PendingDelete)
            .map(|b| b.resource_id)
            .collect();

        let mut finished = 0;
        for router_id in &pending {
            match self.driver.retry_delete(router_id).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(e) => warn!(%router_id, error = %e, "router deletion still pending"),
            }
        }
        if finished > 0 {
            info!(finished, "pending router deletions finished");
        }
        Ok(finished)
    }
}
