//! Agent selector: assigns config agents to hosting devices.
//!
//! A device gets a uniformly random live agent of the hosting-device
//! type. Selection for one device runs inside the named scope
//! `agent-selection:<device>` and commits in a single transaction, so two
//! callers never assign different agents to the same device.

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use svcvm_core::{NamedLocks, epoch_secs};
use svcvm_state::*;

use crate::error::SchedulerResult;
use crate::registry::AgentRegistry;

pub struct AgentSelector {
    store: StateStore,
    registry: AgentRegistry,
    locks: NamedLocks,
}

impl AgentSelector {
    pub fn new(store: StateStore, registry: AgentRegistry, locks: NamedLocks) -> Self {
        Self {
            store,
            registry,
            locks,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Pick a live agent for `device` and record it in `txn`.
    ///
    /// Returns `None`, leaving the device agent-less, when no agent is
    /// eligible. No notification is sent.
    pub fn select_agent_in(
        &self,
        txn: &StoreTxn,
        device: &HostingDeviceAgentBinding,
        now: u64,
    ) -> StateResult<Option<ConfigAgent>> {
        let candidates = self.registry.live_agents(txn, None, now)?;
        let Some(agent) = candidates.choose(&mut rand::thread_rng()).cloned() else {
            warn!(hosting_device_id = %device.hosting_device_id, "no live config agents to manage hosting device");
            return Ok(None);
        };
        txn.set_device_agent(&device.hosting_device_id, Some(agent.id.as_str()))?;
        info!(hosting_device_id = %device.hosting_device_id, agent_id = %agent.id, host = %agent.host, "config agent assigned to hosting device");
        Ok(Some(agent))
    }

    /// Ensure `hosting_device_id` has a live agent, selecting one if the
    /// device has none.
    ///
    /// An already assigned agent is kept even when it is down; replacing
    /// dead agents is the recovery handler's job. An assigned agent that
    /// no longer exists counts as no agent.
    pub async fn select_agent(&self, hosting_device_id: &str) -> SchedulerResult<Option<ConfigAgent>> {
        let _scope = self
            .locks
            .lock(&format!("agent-selection:{hosting_device_id}"))
            .await;
        let now = epoch_secs();
        let selected = self.store.write(|txn| -> StateResult<Option<ConfigAgent>> {
            let Some(device) = txn.get_device_binding(hosting_device_id)? else {
                debug!(%hosting_device_id, "hosting device vanished before agent selection");
                return Ok(None);
            };
            if let Some(agent_id) = &device.agent_id {
                if let Some(agent) = txn.get_agent(agent_id)? {
                    return Ok(Some(agent));
                }
                warn!(%hosting_device_id, %agent_id, "assigned config agent no longer exists");
            }
            self.select_agent_in(txn, &device, now)
        })?;
        Ok(selected)
    }

    /// Assign every agent-less, auto-schedulable device to the agent that
    /// just registered on `host`.
    ///
    /// Returns `false` without assigning anything unless exactly one live
    /// agent of the hosting-device type runs on `host`.
    pub fn auto_schedule_hosting_devices(&self, host: &str) -> SchedulerResult<bool> {
        let now = epoch_secs();
        let assigned = self.store.write(|txn| -> StateResult<Option<Vec<HostingDeviceId>>> {
            let agents = self.registry.live_agents(txn, Some(host), now)?;
            let agent = match agents.as_slice() {
                [agent] => agent,
                [] => {
                    debug!(%host, "no live config agent on host");
                    return Ok(None);
                }
                _ => {
                    warn!(%host, count = agents.len(), "several config agents on host, not auto-scheduling");
                    return Ok(None);
                }
            };

            let mut assigned = Vec::new();
            for device in txn.list_device_bindings()? {
                if device.agent_id.is_none() && device.auto_schedule {
                    txn.set_device_agent(&device.hosting_device_id, Some(agent.id.as_str()))?;
                    assigned.push(device.hosting_device_id);
                }
            }
            Ok(Some(assigned))
        })?;

        match assigned {
            Some(devices) => {
                if !devices.is_empty() {
                    info!(%host, count = devices.len(), "hosting devices auto-scheduled to agent");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Offer every agent-less, auto-schedulable device to `select_agent`.
    ///
    /// Returns how many devices got an agent.
    pub async fn rescan_unassigned(&self) -> SchedulerResult<usize> {
        let pending: Vec<HostingDeviceAgentBinding> = self
            .store
            .list_device_bindings()?
            .into_iter()
            .filter(|d| d.agent_id.is_none() && d.auto_schedule)
            .collect();

        let mut assigned = 0;
        for device in pending {
            if self.select_agent(&device.hosting_device_id).await?.is_some() {
                assigned += 1;
            }
        }
        if assigned > 0 {
            info!(assigned, "agent-less hosting devices assigned");
        }
        Ok(assigned)
    }
}
