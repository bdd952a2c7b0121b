//! Agent registry: tracks config agents and their liveness.
//!
//! Agents report state periodically; the first report registers them.
//! An agent is alive while it is admin-up and its last heartbeat is
//! younger than the configured down time.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use svcvm_core::config::AgentsConfig;
use svcvm_core::epoch_secs;
use svcvm_state::*;

/// An agent together with its liveness at the time of listing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: ConfigAgent,
    pub alive: bool,
}

#[derive(Clone)]
pub struct AgentRegistry {
    store: StateStore,
    agent_type: String,
    down_time: Duration,
}

impl AgentRegistry {
    pub fn new(store: StateStore, config: &AgentsConfig) -> Self {
        Self {
            store,
            agent_type: config.agent_type.clone(),
            down_time: config.agent_down_time(),
        }
    }

    /// Set the heartbeat age after which an agent counts as down.
    pub fn with_down_time(mut self, down_time: Duration) -> Self {
        self.down_time = down_time;
        self
    }

    /// Agent type that manages hosting devices.
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn down_time_secs(&self) -> u64 {
        self.down_time.as_secs()
    }

    /// Record a state report from an agent.
    ///
    /// Returns `true` when this report registered a new agent.
    pub fn report_state(&self, agent_id: &str, host: &str) -> StateResult<bool> {
        let now = epoch_secs();
        let agent_type = self.agent_type.clone();
        self.store.write(|txn| match txn.get_agent(agent_id)? {
            Some(mut agent) => {
                if agent.host != host {
                    warn!(%agent_id, old_host = %agent.host, new_host = %host, "agent moved hosts");
                    agent.host = host.to_string();
                }
                agent.heartbeat_timestamp = now;
                txn.put_agent(&agent)?;
                debug!(%agent_id, "heartbeat received");
                Ok(false)
            }
            None => {
                txn.put_agent(&ConfigAgent {
                    id: agent_id.to_string(),
                    agent_type,
                    host: host.to_string(),
                    admin_state_up: true,
                    heartbeat_timestamp: now,
                    started_at: now,
                })?;
                info!(%agent_id, %host, "config agent registered");
                Ok(true)
            }
        })
    }

    pub fn set_admin_state_up(&self, agent_id: &str, admin_state_up: bool) -> StateResult<ConfigAgent> {
        self.store.write(|txn| {
            let mut agent = txn
                .get_agent(agent_id)?
                .ok_or_else(|| StateError::NotFound(format!("agent {agent_id}")))?;
            agent.admin_state_up = admin_state_up;
            txn.put_agent(&agent)?;
            info!(%agent_id, admin_state_up, "agent admin state changed");
            Ok(agent)
        })
    }

    /// Remove an agent. Its hosting devices become agent-less in the same
    /// transaction, so agent selection picks them up again.
    pub fn remove_agent(&self, agent_id: &str) -> StateResult<bool> {
        let (existed, released) = self.store.write(|txn| -> StateResult<(bool, usize)> {
            let devices = txn.list_devices_for_agent(agent_id)?;
            for device in &devices {
                txn.set_device_agent(&device.hosting_device_id, None)?;
            }
            Ok((txn.remove_agent(agent_id)?, devices.len()))
        })?;
        if existed {
            info!(%agent_id, released, "config agent removed");
        }
        Ok(existed)
    }

    pub fn is_alive(&self, agent: &ConfigAgent, now: u64) -> bool {
        agent.is_alive(now, self.down_time.as_secs())
    }

    pub fn list_agents(&self) -> StateResult<Vec<AgentView>> {
        let now = epoch_secs();
        Ok(self
            .store
            .list_agents()?
            .into_iter()
            .map(|agent| AgentView {
                alive: self.is_alive(&agent, now),
                agent,
            })
            .collect())
    }

    /// Live agents of the hosting-device type, optionally on one host.
    pub fn live_agents<R: StoreRead>(&self, view: &R, host: Option<&str>, now: u64) -> StateResult<Vec<ConfigAgent>> {
        Ok(view
            .find_agents(&self.agent_type, host)?
            .into_iter()
            .filter(|a| self.is_alive(a, now))
            .collect())
    }

    /// Agents of the hosting-device type whose heartbeat went stale.
    ///
    /// Admin-disabled agents are not dead; their devices stay put.
    pub fn dead_agents(&self, now: u64) -> StateResult<Vec<ConfigAgent>> {
        let dead: Vec<ConfigAgent> = self
            .store
            .find_agents(&self.agent_type, None)?
            .into_iter()
            .filter(|a| a.admin_state_up && !a.is_heartbeat_fresh(now, self.down_time.as_secs()))
            .collect();
        if !dead.is_empty() {
            warn!(count = dead.len(), "dead config agents detected");
        }
        Ok(dead)
    }
}
