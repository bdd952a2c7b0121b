//! In-process simulation of the external cloud services.
//!
//! `SimulatedCloud` implements the core plugin, identity service and VM
//! manager interfaces over in-memory maps. It records every mutating call
//! in order and can be told to fail VM creation or deletion, which makes
//! it the backend for integration tests and for running the daemon
//! without a real cloud. State lives only as long as the process.
//!
//! Only built with the `sim` feature.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::network::*;

#[derive(Default)]
struct SimState {
    tenants: BTreeMap<String, String>,
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    ports: BTreeMap<String, Port>,
    security_groups: Vec<SecurityGroup>,
    vms: BTreeMap<String, VmSpec>,
    attached: BTreeMap<String, Vec<String>>,
    calls: Vec<String>,
    next_id: u64,
    fail_vm_creation: bool,
    fail_vm_deletion: HashSet<String>,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cloud with the default L3 admin tenant, management network and
    /// management security group already in place.
    pub fn with_management_network() -> Self {
        let cloud = Self::new();
        cloud.add_tenant("l3_admin", "tenant-l3-admin");
        cloud.add_management_network();
        cloud
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_tenant(&self, name: &str, id: &str) {
        self.state().tenants.insert(name.to_string(), id.to_string());
    }

    pub fn add_network(&self, id: &str, name: &str, tenant_id: &str, subnet_ids: &[&str]) {
        let mut state = self.state();
        for (i, subnet_id) in subnet_ids.iter().enumerate() {
            state.subnets.insert(
                subnet_id.to_string(),
                Subnet {
                    id: subnet_id.to_string(),
                    network_id: id.to_string(),
                    cidr: format!("10.{i}.0.0/24"),
                    gateway_ip: Some(format!("10.{i}.0.1")),
                },
            );
        }
        state.networks.insert(
            id.to_string(),
            Network {
                id: id.to_string(),
                name: name.to_string(),
                tenant_id: tenant_id.to_string(),
                subnets: subnet_ids.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn add_management_network(&self) {
        self.add_network("net-mgmt", "mgmt_network", "tenant-l3-admin", &["subnet-mgmt"]);
        self.state().security_groups.push(SecurityGroup {
            id: "sg-mgmt".to_string(),
            name: "mgmt_sec_grp".to_string(),
            tenant_id: "tenant-l3-admin".to_string(),
        });
    }

    /// Insert a tenant port, e.g. a router interface or gateway port.
    pub fn add_port(&self, id: &str, network_id: &str, subnet_id: &str, ip: &str) {
        let mut state = self.state();
        let n = state.next();
        state.ports.insert(
            id.to_string(),
            Port {
                id: id.to_string(),
                network_id: network_id.to_string(),
                tenant_id: "tenant-1".to_string(),
                name: String::new(),
                device_id: String::new(),
                device_owner: String::new(),
                mac_address: format!("fa:16:3e:00:00:{n:02x}"),
                admin_state_up: true,
                fixed_ips: vec![FixedIp {
                    subnet_id: subnet_id.to_string(),
                    ip_address: ip.to_string(),
                }],
            },
        );
    }

    pub fn fail_vm_creation(&self, fail: bool) {
        self.state().fail_vm_creation = fail;
    }

    pub fn fail_vm_deletion(&self, vm_id: &str) {
        self.state().fail_vm_deletion.insert(vm_id.to_string());
    }

    pub fn allow_vm_deletion(&self, vm_id: &str) {
        self.state().fail_vm_deletion.remove(vm_id);
    }

    /// Every mutating call so far, as `"<operation>:<subject>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn port(&self, port_id: &str) -> Option<Port> {
        self.state().ports.get(port_id).cloned()
    }

    pub fn vm_ids(&self) -> Vec<String> {
        self.state().vms.keys().cloned().collect()
    }

    pub fn attached_ports(&self, vm_id: &str) -> Vec<String> {
        self.state().attached.get(vm_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CorePlugin for SimulatedCloud {
    async fn get_port(&self, port_id: &str) -> anyhow::Result<Port> {
        self.port(port_id)
            .ok_or_else(|| NotFound::new("port", port_id).into())
    }

    async fn get_subnet(&self, subnet_id: &str) -> anyhow::Result<Subnet> {
        self.state()
            .subnets
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| NotFound::new("subnet", subnet_id).into())
    }

    async fn get_network(&self, network_id: &str) -> anyhow::Result<Network> {
        self.state()
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| NotFound::new("network", network_id).into())
    }

    async fn list_networks(&self, name: &str, tenant_id: &str) -> anyhow::Result<Vec<Network>> {
        let mut state = self.state();
        state.calls.push(format!("list_networks:{name}"));
        Ok(state
            .networks
            .values()
            .filter(|n| n.name == name && n.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_ports(&self, device_id: &str) -> anyhow::Result<Vec<Port>> {
        Ok(self
            .state()
            .ports
            .values()
            .filter(|p| p.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn create_port(&self, request: &PortRequest) -> anyhow::Result<Port> {
        let mut state = self.state();
        let Some(network) = state.networks.get(&request.network_id).cloned() else {
            return Err(NotFound::new("network", &request.network_id).into());
        };
        let n = state.next();
        let fixed_ips = network
            .subnets
            .first()
            .map(|subnet_id| FixedIp {
                subnet_id: subnet_id.clone(),
                ip_address: format!("192.168.0.{}", n % 250 + 2),
            })
            .into_iter()
            .collect();
        let port = Port {
            id: format!("port-{n}"),
            network_id: request.network_id.clone(),
            tenant_id: request.tenant_id.clone(),
            name: request.name.clone(),
            device_id: request.device_id.clone(),
            device_owner: request.device_owner.clone(),
            mac_address: format!("fa:16:3e:00:00:{n:02x}"),
            admin_state_up: true,
            fixed_ips,
        };
        state.calls.push(format!("create_port:{}", request.name));
        state.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    async fn update_port(&self, port_id: &str, update: &PortUpdate) -> anyhow::Result<Port> {
        let mut state = self.state();
        state.calls.push(format!("update_port:{port_id}"));
        let port = state
            .ports
            .get_mut(port_id)
            .ok_or_else(|| NotFound::new("port", port_id))?;
        if let Some(device_id) = &update.device_id {
            port.device_id = device_id.clone();
        }
        if let Some(owner) = &update.device_owner {
            port.device_owner = owner.clone();
        }
        Ok(port.clone())
    }

    async fn delete_port(&self, port_id: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.calls.push(format!("delete_port:{port_id}"));
        match state.ports.remove(port_id) {
            Some(_) => Ok(()),
            None => Err(NotFound::new("port", port_id).into()),
        }
    }

    async fn list_security_groups(
        &self,
        name: &str,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<SecurityGroup>> {
        Ok(self
            .state()
            .security_groups
            .iter()
            .filter(|g| g.name == name && g.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentityService for SimulatedCloud {
    async fn find_tenant_id(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.state().tenants.get(name).cloned())
    }
}

#[async_trait]
impl VmManager for SimulatedCloud {
    async fn create_vm(&self, spec: &VmSpec) -> anyhow::Result<String> {
        let mut state = self.state();
        state.calls.push(format!("create_vm:{}", spec.name));
        if state.fail_vm_creation {
            anyhow::bail!("no valid host found for {}", spec.name);
        }
        let vm_id = format!("vm-{}", state.next());
        state.vms.insert(vm_id.clone(), spec.clone());
        state.attached.insert(vm_id.clone(), spec.port_ids.clone());
        Ok(vm_id)
    }

    async fn delete_vm(&self, vm_id: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.calls.push(format!("delete_vm:{vm_id}"));
        if state.fail_vm_deletion.contains(vm_id) {
            anyhow::bail!("compute service refused to delete {vm_id}");
        }
        state.attached.remove(vm_id);
        match state.vms.remove(vm_id) {
            Some(_) => Ok(()),
            None => Err(NotFound::new("vm", vm_id).into()),
        }
    }

    async fn attach_interface(&self, vm_id: &str, port_id: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.calls.push(format!("attach_interface:{vm_id}:{port_id}"));
        if !state.vms.contains_key(vm_id) {
            return Err(NotFound::new("vm", vm_id).into());
        }
        state
            .attached
            .entry(vm_id.to_string())
            .or_default()
            .push(port_id.to_string());
        Ok(())
    }

    async fn detach_interface(&self, vm_id: &str, port_id: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.calls.push(format!("detach_interface:{vm_id}:{port_id}"));
        if let Some(ports) = state.attached.get_mut(vm_id) {
            ports.retain(|p| p != port_id);
        }
        Ok(())
    }
}
