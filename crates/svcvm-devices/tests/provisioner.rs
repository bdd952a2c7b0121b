//! Device provisioner integration tests against the simulated cloud.

use std::sync::Arc;

use svcvm_core::{NamedLocks, ServiceVmConfig};
use svcvm_core::config::PluggingDriverKind;
use svcvm_devices::registry::{build_device_driver, build_plugging_driver};
use svcvm_devices::*;
use svcvm_state::*;

fn provisioner(cloud: &Arc<SimulatedCloud>, config: &ServiceVmConfig, store: &StateStore) -> DeviceProvisioner {
    let mgmt = Arc::new(ManagementNetwork::new(
        config.management_network.clone(),
        cloud.clone(),
        cloud.clone(),
        NamedLocks::new(),
    ));
    DeviceProvisioner::new(
        store.clone(),
        cloud.clone(),
        mgmt,
        build_device_driver(config, cloud.clone()),
        build_plugging_driver(config, cloud.clone(), cloud.clone()),
    )
}

/// Calls that create or destroy infrastructure, in order.
fn lifecycle_calls(cloud: &SimulatedCloud) -> Vec<String> {
    cloud
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("list_networks:"))
        .collect()
}

#[tokio::test]
async fn create_records_device_binding() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);

    let binding = prov.create_hosting_device("r1-vm", None).await.unwrap();

    assert_eq!(lifecycle_calls(&cloud), vec!["create_port:mgmt", "create_vm:r1-vm"]);
    let stored = store.get_device_binding(&binding.hosting_device_id).unwrap().unwrap();
    assert_eq!(stored, binding);
    assert!(stored.agent_id.is_none());
    assert_eq!(
        store
            .find_device_by_management_port(&binding.management_port_id)
            .unwrap()
            .as_deref(),
        Some(binding.hosting_device_id.as_str())
    );
    // The management port is owned by the complementary id.
    let mgmt_port = cloud.port(&binding.management_port_id).unwrap();
    assert_eq!(mgmt_port.device_id, binding.complementary_id);
}

#[tokio::test]
async fn device_driver_failure_releases_plugging_resources() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    cloud.fail_vm_creation(true);
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);

    let result = prov.create_hosting_device("r1-vm", None).await;

    assert!(matches!(result, Err(DeviceError::ProvisioningFailure(_))));
    assert_eq!(
        lifecycle_calls(&cloud),
        vec!["create_port:mgmt", "create_vm:r1-vm", "delete_port:port-1"]
    );
    assert!(cloud.port("port-1").is_none());
    assert!(store.list_device_bindings().unwrap().is_empty());
}

#[tokio::test]
async fn unresolved_management_network_creates_nothing() {
    let cloud = Arc::new(SimulatedCloud::new());
    cloud.add_tenant("l3_admin", "tenant-l3-admin");
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);

    let result = prov.create_hosting_device("r1-vm", None).await;

    assert!(matches!(result, Err(DeviceError::ManagementNetworkUnavailable(_))));
    assert!(lifecycle_calls(&cloud).is_empty());
}

#[tokio::test]
async fn delete_destroys_device_then_releases_ports() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);
    let binding = prov.create_hosting_device("r1-vm", None).await.unwrap();
    let device_id = binding.hosting_device_id.clone();

    store
        .write(|txn| {
            txn.insert_resource_binding(&LogicalResourceBinding::new(ResourceType::Router, "r1", 1))?;
            txn.compare_and_set_status(
                "r1",
                BindingStatus::PendingCreate,
                BindingStatus::Active,
                Some(device_id.as_str()),
                2,
            )
        })
        .unwrap();

    prov.delete_hosting_device(&device_id).await.unwrap();

    let calls = lifecycle_calls(&cloud);
    assert_eq!(
        &calls[2..],
        &[format!("delete_vm:{device_id}"), format!("delete_port:{}", binding.management_port_id)]
    );
    assert!(store.get_device_binding(&device_id).unwrap().is_none());
    let r1 = store.get_resource_binding("r1").unwrap().unwrap();
    assert_eq!(r1.status, BindingStatus::PendingCreate);
    assert!(r1.hosting_device_id.is_none());
}

#[tokio::test]
async fn deleting_a_vanished_device_succeeds() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);
    let binding = prov.create_hosting_device("r1-vm", None).await.unwrap();

    cloud.delete_vm(&binding.hosting_device_id).await.unwrap();
    prov.delete_hosting_device(&binding.hosting_device_id).await.unwrap();
    assert!(store.list_device_bindings().unwrap().is_empty());

    let again = prov.delete_hosting_device(&binding.hosting_device_id).await;
    assert!(matches!(again, Err(DeviceError::NoSuchHostingDevice(_))));
}

#[tokio::test]
async fn failed_vm_deletion_keeps_binding() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);
    let binding = prov.create_hosting_device("r1-vm", None).await.unwrap();
    cloud.fail_vm_deletion(&binding.hosting_device_id);

    assert!(prov.delete_hosting_device(&binding.hosting_device_id).await.is_err());
    assert!(store.get_device_binding(&binding.hosting_device_id).unwrap().is_some());
}

#[tokio::test]
async fn guest_agent_plugging_attaches_ports_flat() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    cloud.add_network("net-1", "private", "tenant-1", &["subnet-1"]);
    cloud.add_port("if-1", "net-1", "subnet-1", "10.0.0.1");
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &ServiceVmConfig::default(), &store);
    let binding = prov.create_hosting_device("r1-vm", None).await.unwrap();
    let port = cloud.port("if-1").unwrap();

    let hosted = prov
        .allocate_hosting_port("r1", &port, &binding.hosting_device_id)
        .unwrap();
    prov.setup_port_connectivity(&port, &binding.hosting_device_id)
        .await
        .unwrap();

    assert_eq!(hosted.hosting_port_id, "if-1");
    assert_eq!(hosted.network_type, NetworkType::Flat);
    assert!(store.get_hosted_port("r1", "if-1").unwrap().is_some());
    assert!(cloud
        .attached_ports(&binding.hosting_device_id)
        .contains(&"if-1".to_string()));

    let info = prov.extend_hosting_port_info(&hosted).await.unwrap();
    assert_eq!(info.hosting_mac, port.mac_address);
}

#[tokio::test]
async fn vlan_trunk_assigns_lowest_free_vlan_per_device() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    cloud.add_network("net-1", "private", "tenant-1", &["subnet-1"]);
    for (i, id) in ["if-1", "if-2", "if-3"].iter().enumerate() {
        cloud.add_port(id, "net-1", "subnet-1", &format!("10.0.0.{}", i + 1));
    }
    let mut config = ServiceVmConfig::default();
    config.device_handling.plugging_driver = PluggingDriverKind::VlanTrunk;
    config.vlan_trunk.min_vlan = 100;
    config.vlan_trunk.max_vlan = 101;
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &config, &store);
    let device = prov.create_hosting_device("r1-vm", None).await.unwrap();
    let device_id = device.hosting_device_id.clone();

    let p1 = cloud.port("if-1").unwrap();
    let p2 = cloud.port("if-2").unwrap();
    let p3 = cloud.port("if-3").unwrap();
    let vlans = store
        .write(|txn| -> DeviceResult<Vec<Option<u32>>> {
            txn.insert_resource_binding(&LogicalResourceBinding::new(ResourceType::Router, "r1", 1))?;
            txn.compare_and_set_status(
                "r1",
                BindingStatus::PendingCreate,
                BindingStatus::Active,
                Some(device_id.as_str()),
                2,
            )?;
            let a = prov.allocate_hosting_port_in(txn, "r1", &p1, &device_id)?;
            let b = prov.allocate_hosting_port_in(txn, "r1", &p2, &device_id)?;
            // Re-allocating an already mapped port keeps its VLAN.
            let a_again = prov.allocate_hosting_port_in(txn, "r1", &p1, &device_id)?;
            Ok(vec![a.segmentation_id, b.segmentation_id, a_again.segmentation_id])
        })
        .unwrap();
    assert_eq!(vlans, vec![Some(100), Some(101), Some(100)]);

    let exhausted = prov.allocate_hosting_port("r1", &p3, &device_id);
    assert!(matches!(exhausted, Err(DeviceError::VlanExhausted(_))));

    // Freeing a mapping makes its VLAN available again.
    store.write(|txn| txn.remove_hosted_port("r1", "if-1")).unwrap();
    let reused = prov.allocate_hosting_port("r1", &p3, &device_id).unwrap();
    assert_eq!(reused.segmentation_id, Some(100));
}

#[tokio::test]
async fn vlan_trunk_creates_trunk_on_gateway_network() {
    let cloud = Arc::new(SimulatedCloud::with_management_network());
    cloud.add_network("net-ext", "public", "tenant-admin", &["subnet-ext"]);
    let mut config = ServiceVmConfig::default();
    config.device_handling.plugging_driver = PluggingDriverKind::VlanTrunk;
    let store = StateStore::open_in_memory().unwrap();
    let prov = provisioner(&cloud, &config, &store);

    let router = Router {
        id: "r1".to_string(),
        tenant_id: "tenant-1".to_string(),
        name: "edge".to_string(),
        admin_state_up: true,
        gateway: Some(ExternalGateway {
            network_id: "net-ext".to_string(),
            port_id: "gw-1".to_string(),
        }),
        interfaces: vec![],
        created_at: 1,
        updated_at: 1,
    };
    let device = prov.create_hosting_device("r1-vm", Some(&router)).await.unwrap();

    assert_eq!(
        lifecycle_calls(&cloud),
        vec!["create_port:mgmt", "create_port:trunk", "create_vm:r1-vm"]
    );
    assert_eq!(cloud.attached_ports(&device.hosting_device_id).len(), 2);
}
