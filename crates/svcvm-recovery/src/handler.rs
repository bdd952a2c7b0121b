//! Failure recovery for hosting devices.
//!
//! When a config agent reports devices as dead, or its own heartbeat goes
//! stale, every service plugin unschedules the resources those devices
//! hosted in one transaction. The devices are then deleted one by one and
//! the agent host gets a single `hosting_devices_removed` notification
//! listing everything that was on them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use svcvm_core::epoch_secs;
use svcvm_devices::{DeviceError, DeviceProvisioner};
use svcvm_notify::{HostingDeviceNotifier, HostingInfo, MessageBus};
use svcvm_scheduler::{AgentRegistry, ServicePlugin};
use svcvm_state::{HostingDeviceId, StateResult, StateStore, StoreRead};

use crate::error::RecoveryResult;

/// Outcome of one recovery run for a host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub host: String,
    /// Devices that are gone, including ones that had already vanished.
    pub deleted: Vec<HostingDeviceId>,
    /// Devices whose deletion failed, with the reason. Their bindings stay
    /// and the next sweep retries them.
    pub failed: BTreeMap<HostingDeviceId, String>,
    /// Resources that were unscheduled, per device and resource type.
    pub hosting_info: HostingInfo,
    pub notified: bool,
}

pub struct RecoveryHandler {
    store: StateStore,
    registry: AgentRegistry,
    provisioner: Arc<DeviceProvisioner>,
    notifier: HostingDeviceNotifier,
    services: RwLock<Vec<Arc<dyn ServicePlugin>>>,
}

impl RecoveryHandler {
    pub fn new(
        store: StateStore,
        registry: AgentRegistry,
        provisioner: Arc<DeviceProvisioner>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            store,
            registry,
            provisioner,
            notifier: HostingDeviceNotifier::new(bus),
            services: RwLock::new(Vec::new()),
        }
    }

    /// Add a service whose resources are affected by device failures.
    pub fn register_service(&self, service: Arc<dyn ServicePlugin>) {
        let resource_type = service.resource_type();
        self.services
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(service);
        info!(%resource_type, "service registered for device handling");
    }

    fn services(&self) -> Vec<Arc<dyn ServicePlugin>> {
        self.services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Handle devices reported as not responding by the agent on `host`.
    ///
    /// A failed device deletion is logged and reported; the remaining
    /// devices are still processed.
    pub async fn handle_non_responding_devices(
        &self,
        host: &str,
        hosting_device_ids: &[HostingDeviceId],
    ) -> RecoveryResult<SweepReport> {
        let services = self.services();

        let (known, hosting_info) = self.store.write(|txn| -> StateResult<_> {
            let mut hosting_info: HostingInfo = hosting_device_ids
                .iter()
                .map(|id| (id.clone(), BTreeMap::new()))
                .collect();
            let mut known = Vec::new();
            for id in hosting_device_ids {
                match txn.get_device_binding(id)? {
                    Some(_) => known.push(id.clone()),
                    None => debug!(hosting_device_id = %id, "reported device has no binding"),
                }
            }
            for service in &services {
                service.handle_non_responding_hosting_devices_db(txn, &known, &mut hosting_info)?;
            }
            Ok((known, hosting_info))
        })?;

        for service in &services {
            service
                .handle_non_responding_hosting_devices_post(&hosting_info)
                .await;
        }

        let mut report = SweepReport {
            host: host.to_string(),
            ..Default::default()
        };
        for id in known {
            match self.provisioner.delete_hosting_device(&id).await {
                Ok(()) | Err(DeviceError::NoSuchHostingDevice(_)) => report.deleted.push(id),
                Err(e) => {
                    warn!(%host, hosting_device_id = %id, error = %e, "failed to delete non-responding hosting device");
                    report.failed.insert(id, e.to_string());
                }
            }
        }

        report.notified = match self
            .notifier
            .hosting_devices_removed(&hosting_info, false, host)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                warn!(%host, error = %e, "failed to notify agent of removed hosting devices");
                false
            }
        };
        report.hosting_info = hosting_info;

        info!(
            %host,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "non-responding hosting devices handled"
        );
        Ok(report)
    }

    /// A config agent on `host` came up: let every service hand it the
    /// hosting devices that have no agent. Returns `true` if any did.
    pub async fn register_for_duty(&self, host: &str) -> bool {
        let mut assigned = false;
        for service in self.services() {
            assigned |= service.auto_schedule_hosting_devices(host).await;
        }
        debug!(%host, assigned, "config agent registered for duty");
        assigned
    }

    /// Treat every device of a dead agent as non-responding, one recovery
    /// run per agent host.
    pub async fn scan_dead_agents(&self) -> RecoveryResult<Vec<SweepReport>> {
        let mut by_host: BTreeMap<String, Vec<HostingDeviceId>> = BTreeMap::new();
        for agent in self.registry.dead_agents(epoch_secs())? {
            let devices = self.store.list_devices_for_agent(&agent.id)?;
            if devices.is_empty() {
                continue;
            }
            warn!(agent_id = %agent.id, host = %agent.host, devices = devices.len(), "config agent is dead, recovering its hosting devices");
            by_host
                .entry(agent.host)
                .or_default()
                .extend(devices.into_iter().map(|d| d.hosting_device_id));
        }

        let mut reports = Vec::with_capacity(by_host.len());
        for (host, ids) in by_host {
            reports.push(self.handle_non_responding_devices(&host, &ids).await?);
        }
        Ok(reports)
    }
}
