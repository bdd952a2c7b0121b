//! Subcommand implementations.
//!
//! The daemon has no cloud backends yet: core networking, identity and the
//! VM manager are a fresh [`SimulatedCloud`] on every start, while the
//! binding store persists in the data directory. Devices recorded by an
//! earlier run are unknown to the simulator, so recovering them counts as
//! already deleted.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use svcvm_core::ServiceVmConfig;
use svcvm_devices::SimulatedCloud;
use svcvm_notify::ChannelBus;
use svcvm_recovery::{BackgroundLoops, LoopIntervals, RecoveryHandler};
use svcvm_scheduler::{AgentRegistry, Collaborators, SchedulingStack};
use svcvm_state::{StateResult, StateStore, StoreRead};

const STORE_FILE: &str = "svcvm.redb";

pub fn load_config(path: Option<&Path>) -> anyhow::Result<ServiceVmConfig> {
    match path {
        Some(path) => {
            let config = ServiceVmConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(ServiceVmConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(STORE_FILE);
    let store = StateStore::open(&path)?;
    info!(path = ?path, "binding store opened");
    Ok(store)
}

/// The scheduling stack and recovery handler over `store`.
///
/// External services are simulated in-process; the message bus delivers
/// to in-process subscribers only.
fn assemble(config: &ServiceVmConfig, store: StateStore) -> (Arc<SchedulingStack>, Arc<RecoveryHandler>) {
    warn!("cloud services are simulated in-process, hosting devices are not real");
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    let bus = Arc::new(ChannelBus::default());
    let stack = Arc::new(SchedulingStack::build(
        config,
        store.clone(),
        Collaborators {
            core: cloud.clone(),
            identity: cloud.clone(),
            vm: cloud,
            bus: bus.clone(),
        },
    ));
    let handler = Arc::new(RecoveryHandler::new(
        store,
        stack.registry.clone(),
        stack.provisioner.clone(),
        bus,
    ));
    handler.register_service(stack.router_driver.clone());
    (stack, handler)
}

pub async fn run(config: ServiceVmConfig, data_dir: &Path) -> anyhow::Result<()> {
    info!("svcvm daemon starting");
    let store = open_store(data_dir)?;
    let (stack, handler) = assemble(&config, store);
    info!(
        device_driver = ?config.device_handling.device_driver,
        plugging_driver = ?config.device_handling.plugging_driver,
        "scheduling stack assembled"
    );

    let loops = BackgroundLoops::start(LoopIntervals::from_config(&config.scheduler), stack, handler);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    loops.shutdown().await;

    info!("svcvm daemon stopped");
    Ok(())
}

pub fn agents_report(data_dir: &Path) -> anyhow::Result<Value> {
    let store = open_store(data_dir)?;
    let registry = AgentRegistry::new(store, &ServiceVmConfig::default().agents);
    Ok(serde_json::to_value(registry.list_agents()?)?)
}

pub fn bindings_report(data_dir: &Path) -> anyhow::Result<Value> {
    let store = open_store(data_dir)?;
    let report = store.read(|view| -> StateResult<Value> {
        let mut resources = Vec::new();
        for binding in view.list_resource_bindings()? {
            let hosted_ports = view.list_hosted_ports_for_resource(&binding.resource_id)?;
            resources.push(json!({
                "binding": binding,
                "hosted_ports": hosted_ports,
            }));
        }
        Ok(json!({
            "resources": resources,
            "hosting_devices": view.list_device_bindings()?,
        }))
    })?;
    Ok(report)
}

pub async fn register_agent(
    config: ServiceVmConfig,
    data_dir: &Path,
    agent_id: &str,
    host: &str,
) -> anyhow::Result<Value> {
    let store = open_store(data_dir)?;
    let (stack, handler) = assemble(&config, store);

    let registered = stack.registry.report_state(agent_id, host)?;
    let assigned = handler.register_for_duty(host).await;
    info!(%agent_id, %host, registered, assigned, "config agent reported");

    Ok(json!({
        "agent_id": agent_id,
        "host": host,
        "newly_registered": registered,
        "devices_assigned": assigned,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcvm_state::HostingDeviceAgentBinding;

    #[tokio::test]
    async fn registered_agent_is_listed_alive() {
        let dir = tempfile::tempdir().unwrap();

        let first = register_agent(ServiceVmConfig::default(), dir.path(), "cfg-1", "host-1")
            .await
            .unwrap();
        assert_eq!(first["newly_registered"], true);
        let again = register_agent(ServiceVmConfig::default(), dir.path(), "cfg-1", "host-1")
            .await
            .unwrap();
        assert_eq!(again["newly_registered"], false);

        let agents = agents_report(dir.path()).unwrap();
        assert_eq!(agents.as_array().unwrap().len(), 1);
        assert_eq!(agents[0]["id"], "cfg-1");
        assert_eq!(agents[0]["host"], "host-1");
        assert_eq!(agents[0]["alive"], true);
    }

    #[tokio::test]
    async fn devices_from_an_earlier_run_are_recovered_as_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        store
            .write(|txn| {
                txn.insert_device_binding(&HostingDeviceAgentBinding {
                    hosting_device_id: "vm-old".to_string(),
                    complementary_id: "cid-old".to_string(),
                    management_port_id: "mgmt-old".to_string(),
                    agent_id: None,
                    auto_schedule: true,
                    created_at: 1,
                })
            })
            .unwrap();
        let (_stack, handler) = assemble(&ServiceVmConfig::default(), store.clone());

        let report = handler
            .handle_non_responding_devices("host-1", &["vm-old".to_string()])
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["vm-old".to_string()]);
        assert!(report.failed.is_empty());
        assert!(store.get_device_binding("vm-old").unwrap().is_none());
    }

    #[test]
    fn fresh_store_has_no_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let report = bindings_report(dir.path()).unwrap();
        assert_eq!(report["resources"], json!([]));
        assert_eq!(report["hosting_devices"], json!([]));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
