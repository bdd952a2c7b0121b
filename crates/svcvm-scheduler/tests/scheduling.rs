//! End-to-end scheduling tests against the simulated cloud and an
//! in-process message bus.

use std::sync::Arc;

use tokio::sync::broadcast;

use svcvm_core::{ServiceVmConfig, epoch_secs};
use svcvm_devices::{DeviceError, SimulatedCloud};
use svcvm_notify::bus::drain;
use svcvm_notify::{ChannelBus, Delivery, Target};
use svcvm_scheduler::*;
use svcvm_state::*;

struct Harness {
    cloud: Arc<SimulatedCloud>,
    rx: broadcast::Receiver<Delivery>,
    stack: SchedulingStack,
}

impl Harness {
    fn new() -> Self {
        let cloud = Arc::new(SimulatedCloud::with_management_network());
        Self::with_cloud(cloud)
    }

    fn with_cloud(cloud: Arc<SimulatedCloud>) -> Self {
        cloud.add_network("net-1", "private", "tenant-1", &["subnet-1"]);
        cloud.add_network("net-ext", "public", "tenant-admin", &["subnet-ext"]);
        cloud.add_port("gw-1", "net-ext", "subnet-ext", "172.24.4.2");
        cloud.add_port("gw-2", "net-ext", "subnet-ext", "172.24.4.3");
        cloud.add_port("if-1", "net-1", "subnet-1", "10.0.0.1");

        let bus = ChannelBus::default();
        let rx = bus.subscribe();
        let store = StateStore::open_in_memory().unwrap();
        let stack = SchedulingStack::build(
            &ServiceVmConfig::default(),
            store,
            Collaborators {
                core: cloud.clone(),
                identity: cloud.clone(),
                vm: cloud.clone(),
                bus: Arc::new(bus),
            },
        );
        Self { cloud, rx, stack }
    }

    fn binding(&self, id: &str) -> Option<LogicalResourceBinding> {
        self.stack.store.get_resource_binding(id).unwrap()
    }

    fn deliveries(&mut self) -> Vec<Delivery> {
        drain(&mut self.rx)
    }

    fn alter_agent(&self, agent_id: &str, f: impl FnOnce(&mut ConfigAgent)) {
        self.stack
            .store
            .write(|txn| {
                let mut agent = txn.get_agent(agent_id)?.unwrap();
                f(&mut agent);
                txn.put_agent(&agent)
            })
            .unwrap();
    }
}

fn router(id: &str, gateway_port: Option<&str>) -> Router {
    Router {
        id: id.to_string(),
        tenant_id: "tenant-1".to_string(),
        name: format!("{id}-name"),
        admin_state_up: true,
        gateway: gateway_port.map(|port_id| ExternalGateway {
            network_id: "net-ext".to_string(),
            port_id: port_id.to_string(),
        }),
        interfaces: vec![],
        created_at: 0,
        updated_at: 0,
    }
}

// ── Router lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn create_then_delete_router() {
    let mut h = Harness::new();
    h.stack.registry.report_state("agent-1", "host-1").unwrap();

    h.stack.scheduler.create_router(router("r1", Some("gw-1"))).await.unwrap();

    let binding = h.binding("r1").unwrap();
    assert_eq!(binding.status, BindingStatus::Active);
    let device_id = binding.hosting_device_id.clone().unwrap();
    assert_eq!(h.cloud.count_calls("create_vm"), 1);
    assert!(h.cloud.attached_ports(&device_id).contains(&"gw-1".to_string()));
    assert!(h.stack.store.get_hosted_port("r1", "gw-1").unwrap().is_some());
    let device = h.stack.store.get_device_binding(&device_id).unwrap().unwrap();
    assert_eq!(device.agent_id.as_deref(), Some("agent-1"));

    let created = h.deliveries();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].message.method, "routers_updated");
    assert_eq!(created[0].target, Target::Host("host-1".to_string()));
    assert_eq!(created[0].message.payload["operation"], "create");
    assert_eq!(
        created[0].message.payload["hosting_devices"]["r1"]["id"],
        device_id.as_str()
    );

    h.stack.scheduler.delete_router("r1").await.unwrap();

    assert!(h.binding("r1").is_none());
    assert!(h.stack.store.get_router("r1").unwrap().is_none());
    assert!(h.stack.store.get_device_binding(&device_id).unwrap().is_none());
    assert_eq!(h.cloud.count_calls("delete_vm"), 1);
    assert!(h.stack.store.list_hosted_ports_for_resource("r1").unwrap().is_empty());

    let deleted = h.deliveries();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].message.method, "router_deleted");
    assert_eq!(deleted[0].target, Target::Host("host-1".to_string()));
}

#[tokio::test]
async fn create_is_vetoed_without_management_network() {
    let cloud = Arc::new(SimulatedCloud::new());
    cloud.add_tenant("l3_admin", "tenant-l3-admin");
    let h = Harness::with_cloud(cloud);

    let result = h.stack.scheduler.create_router(router("r1", None)).await;

    assert!(matches!(result, Err(SchedulerError::ManagementNetworkUnavailable(_))));
    assert!(h.stack.store.get_router("r1").unwrap().is_none());
    assert!(h.binding("r1").is_none());
}

#[tokio::test]
async fn provisioning_failure_leaves_router_schedulable() {
    let h = Harness::new();
    h.cloud.fail_vm_creation(true);

    let result = h.stack.scheduler.create_router(router("r1", None)).await;

    assert!(matches!(
        result,
        Err(SchedulerError::Device(DeviceError::ProvisioningFailure(_)))
    ));
    let binding = h.binding("r1").unwrap();
    assert_eq!(binding.status, BindingStatus::PendingCreate);
    assert!(binding.hosting_device_id.is_none());
    assert!(h.stack.store.list_device_bindings().unwrap().is_empty());

    h.cloud.fail_vm_creation(false);
    assert_eq!(h.stack.scheduler.process_backlog().await.unwrap(), 1);
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::Active);
    assert_eq!(h.stack.scheduler.process_backlog().await.unwrap(), 0);
}

#[tokio::test]
async fn deleting_unscheduled_router_removes_binding() {
    let h = Harness::new();
    h.cloud.fail_vm_creation(true);
    let _ = h.stack.scheduler.create_router(router("r1", None)).await;

    h.stack.scheduler.delete_router("r1").await.unwrap();

    assert!(h.binding("r1").is_none());
    assert_eq!(h.cloud.count_calls("delete_vm"), 0);
}

#[tokio::test]
async fn failed_device_deletion_keeps_router_deletion_pending() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();
    h.cloud.fail_vm_deletion(&device_id);

    let result = h.stack.scheduler.delete_router("r1").await;

    assert!(matches!(result, Err(SchedulerError::Device(_))));
    let binding = h.binding("r1").unwrap();
    assert_eq!(binding.status, BindingStatus::PendingDelete);
    assert_eq!(binding.hosting_device_id.as_deref(), Some(device_id.as_str()));
    assert!(h.stack.store.get_device_binding(&device_id).unwrap().is_some());
    assert_eq!(h.cloud.vm_ids(), vec![device_id.clone()]);

    // The next backlog pass finishes the deletion.
    h.cloud.allow_vm_deletion(&device_id);
    assert_eq!(h.stack.scheduler.process_backlog().await.unwrap(), 0);

    assert!(h.binding("r1").is_none());
    assert!(h.stack.store.get_device_binding(&device_id).unwrap().is_none());
    assert!(h.cloud.vm_ids().is_empty());
    assert_eq!(h.cloud.count_calls("delete_vm"), 2);
}

// ── Updates ────────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_change_replugs_ports() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", Some("gw-1"))).await.unwrap();
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();

    let update = RouterUpdate {
        gateway: Some(Some(ExternalGateway {
            network_id: "net-ext".to_string(),
            port_id: "gw-2".to_string(),
        })),
        ..Default::default()
    };
    let updated = h.stack.scheduler.update_router("r1", update).await.unwrap();

    assert_eq!(updated.gateway.unwrap().port_id, "gw-2");
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::Active);
    let hosted: Vec<String> = h
        .stack
        .store
        .list_hosted_ports_for_resource("r1")
        .unwrap()
        .into_iter()
        .map(|p| p.logical_port_id)
        .collect();
    assert_eq!(hosted, vec!["gw-2"]);
    assert_eq!(h.cloud.attached_ports(&device_id).len(), 2);
    assert!(h.cloud.calls().contains(&format!("detach_interface:{device_id}:gw-1")));
}

#[tokio::test]
async fn update_during_pending_update_conflicts_and_rolls_back() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    h.stack
        .bindings
        .update_binding("r1", BindingStatus::Active, BindingStatus::PendingUpdate, None)
        .unwrap();

    let update = RouterUpdate {
        name: Some("renamed".to_string()),
        ..Default::default()
    };
    let result = h.stack.scheduler.update_router("r1", update).await;

    assert!(matches!(result, Err(ref e) if e.is_conflict()));
    assert_eq!(h.stack.store.get_router("r1").unwrap().unwrap().name, "r1-name");
}

#[tokio::test]
async fn post_hook_completes_only_the_update_it_claimed() {
    let h = Harness::new();
    h.cloud.fail_vm_creation(true);
    let _ = h.stack.scheduler.create_router(router("r1", Some("gw-1"))).await;
    h.cloud.fail_vm_creation(false);
    let driver = h.stack.router_driver.clone();
    let original = h.stack.store.get_router("r1").unwrap().unwrap();

    // A rename starts while r1 is unscheduled and claims nothing.
    let mut renamed = original.clone();
    renamed.name = "renamed".to_string();
    let rename_claim = h
        .stack
        .store
        .write(|txn| driver.update_router_db(txn, &original, &renamed))
        .unwrap();
    assert!(rename_claim.is_none());

    // r1 gets scheduled, then a gateway change claims it.
    assert_eq!(h.stack.scheduler.process_backlog().await.unwrap(), 1);
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();
    let mut moved = renamed.clone();
    moved.gateway = Some(ExternalGateway {
        network_id: "net-ext".to_string(),
        port_id: "gw-2".to_string(),
    });
    let gateway_claim = h
        .stack
        .store
        .write(|txn| driver.update_router_db(txn, &renamed, &moved))
        .unwrap();
    assert_eq!(gateway_claim.as_deref(), Some(device_id.as_str()));

    // The rename finishing first leaves the gateway change in flight.
    driver
        .update_router_post(&original, &renamed, rename_claim.as_deref())
        .await
        .unwrap();
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::PendingUpdate);

    driver
        .update_router_post(&renamed, &moved, gateway_claim.as_deref())
        .await
        .unwrap();
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::Active);
    let hosted: Vec<String> = h
        .stack
        .store
        .list_hosted_ports_for_resource("r1")
        .unwrap()
        .into_iter()
        .map(|p| p.logical_port_id)
        .collect();
    assert_eq!(hosted, vec!["gw-2"]);
}

#[tokio::test]
async fn concurrent_binding_updates_have_one_winner() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let bindings = h.stack.bindings.clone();
            std::thread::spawn(move || {
                bindings.update_binding("r1", BindingStatus::Active, BindingStatus::PendingUpdate, None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(SchedulerError::Conflict { .. })))
            .count(),
        1
    );
}

// ── Interfaces ─────────────────────────────────────────────────────

#[tokio::test]
async fn add_and_remove_interface() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();

    let interface = h
        .stack
        .scheduler
        .add_router_interface(
            "r1",
            InterfaceRequest {
                port_id: Some("if-1".to_string()),
                subnet_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(interface.subnet_id, "subnet-1");
    assert_eq!(h.cloud.port("if-1").unwrap().device_id, "r1");
    assert!(h.stack.store.get_hosted_port("r1", "if-1").unwrap().is_some());
    assert!(h.cloud.attached_ports(&device_id).contains(&"if-1".to_string()));
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::Active);

    h.stack
        .scheduler
        .remove_router_interface(
            "r1",
            InterfaceRequest {
                port_id: None,
                subnet_id: Some("subnet-1".to_string()),
            },
        )
        .await
        .unwrap();

    let calls = h.cloud.calls();
    let disown = calls.iter().rposition(|c| c == "update_port:if-1").unwrap();
    let delete = calls.iter().position(|c| c == "delete_port:if-1").unwrap();
    assert!(disown < delete);
    assert!(h.cloud.port("if-1").is_none());
    assert!(h.stack.store.get_hosted_port("r1", "if-1").unwrap().is_none());
    assert!(h.stack.store.get_router("r1").unwrap().unwrap().interfaces.is_empty());
}

#[tokio::test]
async fn interface_needs_port_or_subnet() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();

    let neither = h
        .stack
        .scheduler
        .add_router_interface("r1", InterfaceRequest::default())
        .await;
    assert!(matches!(neither, Err(SchedulerError::BadRequest(_))));

    let removal = h
        .stack
        .scheduler
        .remove_router_interface("r1", InterfaceRequest::default())
        .await;
    assert!(matches!(removal, Err(SchedulerError::BadRequest(_))));
}

// ── Floating IPs ───────────────────────────────────────────────────

#[tokio::test]
async fn floating_ip_changes_notify_router_agent() {
    let mut h = Harness::new();
    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    h.stack.scheduler.create_router(router("r1", Some("gw-1"))).await.unwrap();
    h.deliveries();

    let fip = FloatingIp {
        id: "f1".to_string(),
        tenant_id: "tenant-1".to_string(),
        floating_network_id: "net-ext".to_string(),
        floating_ip_address: "172.24.4.50".to_string(),
        port_id: Some("if-1".to_string()),
        fixed_ip_address: Some("10.0.0.1".to_string()),
        router_id: Some("r1".to_string()),
    };
    h.stack.scheduler.create_floatingip(fip).await.unwrap();

    let got = h.deliveries();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].message.payload["operation"], "create_floatingip");
    assert_eq!(got[0].message.payload["routers"], serde_json::json!(["r1"]));
    assert_eq!(h.binding("r1").unwrap().status, BindingStatus::Active);

    let routers = h.stack.scheduler.disassociate_floatingips("if-1").await.unwrap();
    assert_eq!(routers, vec!["r1"]);
    let fip = h.stack.store.get_floating_ip("f1").unwrap().unwrap();
    assert!(fip.port_id.is_none() && fip.router_id.is_none());

    h.stack.scheduler.delete_floatingip("f1").await.unwrap();
    assert!(h.stack.store.get_floating_ip("f1").unwrap().is_none());
}

#[tokio::test]
async fn half_associated_floating_ip_is_rejected() {
    let h = Harness::new();
    let fip = FloatingIp {
        id: "f1".to_string(),
        tenant_id: "tenant-1".to_string(),
        floating_network_id: "net-ext".to_string(),
        floating_ip_address: "172.24.4.50".to_string(),
        port_id: Some("if-1".to_string()),
        fixed_ip_address: None,
        router_id: None,
    };
    let result = h.stack.scheduler.create_floatingip(fip).await;
    assert!(matches!(result, Err(SchedulerError::BadRequest(_))));
}

// ── Agent host resolution ──────────────────────────────────────────

#[tokio::test]
async fn agent_host_is_none_without_binding_or_device() {
    let h = Harness::new();
    assert!(h
        .stack
        .bindings
        .get_agent_host(ResourceType::Router, "nope")
        .await
        .unwrap()
        .is_none());

    h.cloud.fail_vm_creation(true);
    let _ = h.stack.scheduler.create_router(router("r1", None)).await;
    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    assert!(h
        .stack
        .bindings
        .get_agent_host(ResourceType::Router, "r1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn agent_host_is_none_for_stale_or_disabled_agent() {
    let h = Harness::new();
    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    let host = h.stack.bindings.get_agent_host(ResourceType::Router, "r1").await.unwrap();
    assert_eq!(host.as_deref(), Some("host-1"));

    h.alter_agent("agent-1", |a| a.heartbeat_timestamp = epoch_secs() - 1000);
    assert!(h
        .stack
        .bindings
        .get_agent_host(ResourceType::Router, "r1")
        .await
        .unwrap()
        .is_none());

    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    h.stack.registry.set_admin_state_up("agent-1", false).unwrap();
    assert!(h
        .stack
        .bindings
        .get_agent_host(ResourceType::Router, "r1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn agent_host_lookup_selects_missing_agent() {
    let h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();
    assert!(h
        .stack
        .store
        .get_device_binding(&device_id)
        .unwrap()
        .unwrap()
        .agent_id
        .is_none());

    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    let host = h.stack.bindings.get_agent_host(ResourceType::Router, "r1").await.unwrap();

    assert_eq!(host.as_deref(), Some("host-1"));
    assert_eq!(
        h.stack.store.get_device_binding(&device_id).unwrap().unwrap().agent_id.as_deref(),
        Some("agent-1")
    );
}

#[tokio::test]
async fn removed_agent_leaves_devices_to_the_next_agent() {
    let h = Harness::new();
    h.stack.registry.report_state("agent-1", "host-1").unwrap();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    let device_id = h.binding("r1").unwrap().hosting_device_id.unwrap();

    assert!(h.stack.registry.remove_agent("agent-1").unwrap());
    assert!(h
        .stack
        .store
        .get_device_binding(&device_id)
        .unwrap()
        .unwrap()
        .agent_id
        .is_none());

    h.stack.registry.report_state("agent-2", "host-2").unwrap();
    assert_eq!(h.stack.selector.rescan_unassigned().await.unwrap(), 1);
    let host = h.stack.bindings.get_agent_host(ResourceType::Router, "r1").await.unwrap();
    assert_eq!(host.as_deref(), Some("host-2"));
}

#[tokio::test]
async fn registering_agent_takes_over_devices_and_syncs_routers() {
    let mut h = Harness::new();
    h.stack.scheduler.create_router(router("r1", None)).await.unwrap();
    h.deliveries();
    h.stack.registry.report_state("agent-1", "host-1").unwrap();

    assert!(h.stack.router_driver.auto_schedule_hosting_devices("host-1").await);

    let got = h.deliveries();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].target, Target::Host("host-1".to_string()));
    assert_eq!(got[0].message.payload["operation"], "sync");
    assert_eq!(got[0].message.payload["routers"], serde_json::json!(["r1"]));
}
