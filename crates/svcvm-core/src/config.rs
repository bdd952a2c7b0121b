//! svcvm.toml configuration parser.
//!
//! Every section and field has a default so a partial (or empty) file is
//! valid. The parsed [`ServiceVmConfig`] is handed to component
//! constructors; nothing reads configuration from global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceVmConfig {
    pub device_handling: DeviceHandlingConfig,
    pub management_network: ManagementNetworkConfig,
    pub agents: AgentsConfig,
    pub scheduler: SchedulerConfig,
    pub guest_agent: GuestAgentConfig,
    pub csr1kv: Csr1kvConfig,
    pub vlan_trunk: VlanTrunkConfig,
}

/// Which device and plugging drivers to instantiate at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceHandlingConfig {
    pub device_driver: DeviceDriverKind,
    pub plugging_driver: PluggingDriverKind,
}

impl Default for DeviceHandlingConfig {
    fn default() -> Self {
        Self {
            device_driver: DeviceDriverKind::GuestAgent,
            plugging_driver: PluggingDriverKind::GuestAgent,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceDriverKind {
    GuestAgent,
    Csr1kv,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PluggingDriverKind {
    GuestAgent,
    VlanTrunk,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagementNetworkConfig {
    /// Name of the tenant owning all hosting-device resources.
    pub l3_admin_tenant: String,
    /// Name of the management network used for device configuration.
    pub management_network: String,
    /// Security group applied to management ports.
    pub management_security_group: String,
}

impl Default for ManagementNetworkConfig {
    fn default() -> Self {
        Self {
            l3_admin_tenant: "l3_admin".to_string(),
            management_network: "mgmt_network".to_string(),
            management_security_group: "mgmt_sec_grp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Agent type string config agents register with.
    pub agent_type: String,
    /// Seconds without a heartbeat before an agent counts as down.
    pub agent_down_time_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            agent_type: "Cfg agent".to_string(),
            agent_down_time_secs: 75,
        }
    }
}

impl AgentsConfig {
    pub fn agent_down_time(&self) -> Duration {
        Duration::from_secs(self.agent_down_time_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling attempts of unscheduled resources.
    pub backlog_processing_interval_secs: u64,
    /// Seconds between agent re-selection passes over agent-less devices.
    pub agent_rescan_interval_secs: u64,
    /// Seconds between scans for devices whose agent stopped heartbeating.
    pub dead_agent_scan_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backlog_processing_interval_secs: 10,
            agent_rescan_interval_secs: 30,
            dead_agent_scan_interval_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn backlog_processing_interval(&self) -> Duration {
        Duration::from_secs(self.backlog_processing_interval_secs)
    }

    pub fn agent_rescan_interval(&self) -> Duration {
        Duration::from_secs(self.agent_rescan_interval_secs)
    }

    pub fn dead_agent_scan_interval(&self) -> Duration {
        Duration::from_secs(self.dead_agent_scan_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuestAgentConfig {
    /// VM-manager template used for guest-agent router instances.
    pub template_id: Option<String>,
    /// Directory on the device where the agent config file is written.
    pub config_dir: String,
}

impl Default for GuestAgentConfig {
    fn default() -> Self {
        Self {
            template_id: None,
            config_dir: "/etc/guest_agent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Csr1kvConfig {
    pub template_id: Option<String>,
    /// Seconds before a freshly booted appliance becomes operational.
    pub booting_time_secs: u64,
    pub username: String,
    pub password: String,
}

impl Default for Csr1kvConfig {
    fn default() -> Self {
        Self {
            template_id: None,
            booting_time_secs: 420,
            username: "stack".to_string(),
            password: "cisco".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VlanTrunkConfig {
    pub min_vlan: u16,
    pub max_vlan: u16,
}

impl Default for VlanTrunkConfig {
    fn default() -> Self {
        Self {
            min_vlan: 100,
            max_vlan: 4094,
        }
    }
}

impl ServiceVmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ServiceVmConfig = toml::from_str(content)?;
        if config.vlan_trunk.min_vlan > config.vlan_trunk.max_vlan {
            anyhow::bail!(
                "vlan_trunk.min_vlan ({}) exceeds max_vlan ({})",
                config.vlan_trunk.min_vlan,
                config.vlan_trunk.max_vlan
            );
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServiceVmConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceVmConfig::default());
        assert_eq!(config.agents.agent_down_time(), Duration::from_secs(75));
        assert_eq!(
            config.scheduler.backlog_processing_interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn parse_driver_selection() {
        let toml_str = r#"
[device_handling]
device_driver = "csr1kv"
plugging_driver = "vlan_trunk"

[vlan_trunk]
min_vlan = 200
max_vlan = 210
"#;
        let config = ServiceVmConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.device_handling.device_driver, DeviceDriverKind::Csr1kv);
        assert_eq!(
            config.device_handling.plugging_driver,
            PluggingDriverKind::VlanTrunk
        );
        assert_eq!(config.vlan_trunk.min_vlan, 200);
        // Untouched sections keep their defaults.
        assert_eq!(config.management_network.management_network, "mgmt_network");
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let toml_str = r#"
[device_handling]
device_driver = "nonexistent"
"#;
        assert!(ServiceVmConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn inverted_vlan_range_is_rejected() {
        let toml_str = r#"
[vlan_trunk]
min_vlan = 300
max_vlan = 200
"#;
        assert!(ServiceVmConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn roundtrip_through_toml() {
        let mut config = ServiceVmConfig::default();
        config.scheduler.agent_rescan_interval_secs = 5;
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("agent_rescan_interval_secs = 5"));
        assert_eq!(ServiceVmConfig::from_toml_str(&toml_str).unwrap(), config);
    }
}
