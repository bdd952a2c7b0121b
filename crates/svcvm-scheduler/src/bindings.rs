//! Binding store: the resource → hosting device → agent mapping as seen
//! by service plugins.
//!
//! Every call runs in one transaction. The `*_in` variants take the
//! caller's transaction so a plugin's db hook commits together with its
//! own base-resource mutation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use svcvm_core::epoch_secs;
use svcvm_devices::DeviceProvisioner;
use svcvm_notify::HostResolver;
use svcvm_state::*;

use crate::error::SchedulerResult;
use crate::selector::AgentSelector;

pub struct BindingStore {
    store: StateStore,
    selector: Arc<AgentSelector>,
    provisioner: Arc<DeviceProvisioner>,
}

impl BindingStore {
    pub fn new(store: StateStore, selector: Arc<AgentSelector>, provisioner: Arc<DeviceProvisioner>) -> Self {
        Self {
            store,
            selector,
            provisioner,
        }
    }

    pub fn create_binding_in(
        &self,
        txn: &StoreTxn,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> StateResult<LogicalResourceBinding> {
        let binding = LogicalResourceBinding::new(resource_type, resource_id, epoch_secs());
        txn.insert_resource_binding(&binding)?;
        Ok(binding)
    }

    /// Create an unscheduled `PENDING_CREATE` binding.
    pub fn create_binding(&self, resource_type: ResourceType, resource_id: &str) -> SchedulerResult<LogicalResourceBinding> {
        Ok(self
            .store
            .write(|txn| self.create_binding_in(txn, resource_type, resource_id))?)
    }

    pub fn update_binding_in(
        &self,
        txn: &StoreTxn,
        resource_id: &str,
        expected: BindingStatus,
        new: BindingStatus,
        hosting_device_id: Option<&str>,
    ) -> StateResult<LogicalResourceBinding> {
        txn.compare_and_set_status(resource_id, expected, new, hosting_device_id, epoch_secs())
    }

    /// Compare-and-set the binding status. A concurrent winner turns into
    /// [`SchedulerError::Conflict`](crate::SchedulerError::Conflict).
    pub fn update_binding(
        &self,
        resource_id: &str,
        expected: BindingStatus,
        new: BindingStatus,
        hosting_device_id: Option<&str>,
    ) -> SchedulerResult<LogicalResourceBinding> {
        Ok(self.store.write(|txn| {
            self.update_binding_in(txn, resource_id, expected, new, hosting_device_id)
        })?)
    }

    /// Remove a `PENDING_DELETE` binding.
    pub fn delete_binding(&self, resource_id: &str) -> SchedulerResult<LogicalResourceBinding> {
        Ok(self.store.write(|txn| txn.remove_resource_binding(resource_id))?)
    }

    /// Host of the live agent serving a resource.
    ///
    /// `None` when the resource is unbound or unscheduled, or when its
    /// device has no live, admin-up agent. A device without an agent gets
    /// one selected on the way.
    pub async fn get_agent_host(&self, resource_type: ResourceType, resource_id: &str) -> SchedulerResult<Option<String>> {
        let Some(binding) = self.store.get_resource_binding(resource_id)? else {
            debug!(%resource_id, "no binding for resource");
            return Ok(None);
        };
        if binding.resource_type != resource_type {
            return Ok(None);
        }
        let Some(device_id) = binding.hosting_device_id else {
            debug!(%resource_id, "resource not scheduled on a hosting device");
            return Ok(None);
        };
        let Some(device) = self.store.get_device_binding(&device_id)? else {
            return Ok(None);
        };

        let agent = match device.agent_id {
            Some(agent_id) => self.store.get_agent(&agent_id)?,
            None => self.selector.select_agent(&device_id).await?,
        };
        let Some(agent) = agent else {
            return Ok(None);
        };
        if !self.selector.registry().is_alive(&agent, epoch_secs()) {
            debug!(%resource_id, agent_id = %agent.id, "agent of resource is down or disabled");
            return Ok(None);
        }
        Ok(Some(agent.host))
    }
}

#[async_trait]
impl HostResolver for BindingStore {
    async fn get_agent_host(&self, resource_type: ResourceType, resource_id: &str) -> Option<String> {
        match BindingStore::get_agent_host(self, resource_type, resource_id).await {
            Ok(host) => host,
            Err(e) => {
                warn!(%resource_id, error = %e, "agent host lookup failed");
                None
            }
        }
    }

    async fn hosting_device_info(&self, _resource_type: ResourceType, resource_id: &str) -> Option<serde_json::Value> {
        let device_id = self.store.get_resource_binding(resource_id).ok()??.hosting_device_id?;
        let device = self.store.get_device_binding(&device_id).ok()??;
        Some(self.provisioner.get_device_info_for_agent(&device).await)
    }
}
