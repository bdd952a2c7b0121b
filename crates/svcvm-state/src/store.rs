//! StateStore: redb-backed binding persistence for svcvm.
//!
//! Provides typed reads through [`StoreRead`] (implemented by the store
//! itself, by read views, and by write transactions) and typed mutations
//! through [`StoreTxn`]. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside a single write transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and is aborted
    /// otherwise, so no partial state of a failed operation is ever
    /// observable.
    pub fn write<T, E>(&self, f: impl FnOnce(&StoreTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = StoreTxn {
            txn: self
                .db
                .begin_write()
                .map_err(|e| StateError::Transaction(e.to_string()))?,
        };
        match f(&txn) {
            Ok(value) => {
                txn.txn
                    .commit()
                    .map_err(|e| StateError::Transaction(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    /// Run `f` against one consistent read snapshot.
    pub fn read<T, E>(&self, f: impl FnOnce(&ReadView) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let view = ReadView {
            txn: self
                .db
                .begin_read()
                .map_err(|e| StateError::Transaction(e.to_string()))?,
        };
        f(&view)
    }
}

// ── Reads ──────────────────────────────────────────────────────────

fn get_from<T, Tbl>(table: &Tbl, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_from<T, Tbl>(table: &Tbl, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
    }
    Ok(results)
}

/// Typed read access shared by the store, read views, and write transactions.
pub trait StoreRead {
    /// Fetch and decode a single value.
    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>>;

    /// Decode every value whose key starts with `prefix`.
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>>;

    fn get_resource_binding(&self, resource_id: &str) -> StateResult<Option<LogicalResourceBinding>> {
        self.get_json(RESOURCE_BINDINGS, resource_id)
    }

    fn list_resource_bindings(&self) -> StateResult<Vec<LogicalResourceBinding>> {
        self.scan_json(RESOURCE_BINDINGS, "")
    }

    /// Resource bindings currently scheduled onto `hosting_device_id`.
    fn list_bindings_on_device(&self, hosting_device_id: &str) -> StateResult<Vec<LogicalResourceBinding>> {
        Ok(self
            .list_resource_bindings()?
            .into_iter()
            .filter(|b| b.hosting_device_id.as_deref() == Some(hosting_device_id))
            .collect())
    }

    /// Unscheduled, auto-schedulable bindings awaiting a hosting device.
    fn list_schedulable_bindings(&self) -> StateResult<Vec<LogicalResourceBinding>> {
        Ok(self
            .list_resource_bindings()?
            .into_iter()
            .filter(|b| b.auto_schedule && b.status == BindingStatus::PendingCreate && !b.is_scheduled())
            .collect())
    }

    fn get_device_binding(&self, hosting_device_id: &str) -> StateResult<Option<HostingDeviceAgentBinding>> {
        self.get_json(DEVICE_BINDINGS, hosting_device_id)
    }

    fn list_device_bindings(&self) -> StateResult<Vec<HostingDeviceAgentBinding>> {
        self.scan_json(DEVICE_BINDINGS, "")
    }

    fn list_devices_for_agent(&self, agent_id: &str) -> StateResult<Vec<HostingDeviceAgentBinding>> {
        Ok(self
            .list_device_bindings()?
            .into_iter()
            .filter(|d| d.agent_id.as_deref() == Some(agent_id))
            .collect())
    }

    /// Hosting device owning a management port, if any.
    fn find_device_by_management_port(&self, port_id: &str) -> StateResult<Option<HostingDeviceId>> {
        self.get_json(MGMT_PORT_INDEX, port_id)
    }

    fn list_hosted_ports_for_resource(&self, resource_id: &str) -> StateResult<Vec<HostedPortBinding>> {
        self.scan_json(HOSTED_PORTS, &format!("{resource_id}:"))
    }

    fn get_hosted_port(&self, resource_id: &str, port_id: &str) -> StateResult<Option<HostedPortBinding>> {
        self.get_json(HOSTED_PORTS, &format!("{resource_id}:{port_id}"))
    }

    /// Hosted ports of every resource scheduled onto `hosting_device_id`.
    fn list_hosted_ports_on_device(&self, hosting_device_id: &str) -> StateResult<Vec<HostedPortBinding>> {
        let mut ports = Vec::new();
        for binding in self.list_bindings_on_device(hosting_device_id)? {
            ports.extend(self.list_hosted_ports_for_resource(&binding.resource_id)?);
        }
        Ok(ports)
    }

    fn get_agent(&self, agent_id: &str) -> StateResult<Option<ConfigAgent>> {
        self.get_json(AGENTS, agent_id)
    }

    fn list_agents(&self) -> StateResult<Vec<ConfigAgent>> {
        self.scan_json(AGENTS, "")
    }

    fn find_agents(&self, agent_type: &str, host: Option<&str>) -> StateResult<Vec<ConfigAgent>> {
        Ok(self
            .list_agents()?
            .into_iter()
            .filter(|a| a.agent_type == agent_type && host.is_none_or(|h| a.host == h))
            .collect())
    }

    fn get_router(&self, router_id: &str) -> StateResult<Option<Router>> {
        self.get_json(ROUTERS, router_id)
    }

    fn list_routers(&self) -> StateResult<Vec<Router>> {
        self.scan_json(ROUTERS, "")
    }

    fn get_floating_ip(&self, floatingip_id: &str) -> StateResult<Option<FloatingIp>> {
        self.get_json(FLOATING_IPS, floatingip_id)
    }

    fn list_floating_ips(&self) -> StateResult<Vec<FloatingIp>> {
        self.scan_json(FLOATING_IPS, "")
    }
}

impl StoreRead for StateStore {
    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        self.read(|view| view.get_json(table, key))
    }

    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        self.read(|view| view.scan_json(table, prefix))
    }
}

/// A read-only snapshot of the store.
pub struct ReadView {
    txn: ReadTransaction,
}

impl StoreRead for ReadView {
    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        get_from(&table, key)
    }

    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        scan_from(&table, prefix)
    }
}

// ── Writes ─────────────────────────────────────────────────────────

/// Handle to the single write transaction of one logical operation.
///
/// Helpers that take part in an operation receive `&StoreTxn`; none of
/// them opens a transaction of its own.
pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreRead for StoreTxn {
    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        get_from(&table, key)
    }

    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        scan_from(&table, prefix)
    }
}

impl StoreTxn {
    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    // ── Resource bindings ──────────────────────────────────────────

    /// Insert a new binding. Fails with `AlreadyBound` if one exists.
    pub fn insert_resource_binding(&self, binding: &LogicalResourceBinding) -> StateResult<()> {
        if self.get_resource_binding(&binding.resource_id)?.is_some() {
            return Err(StateError::AlreadyBound(binding.resource_id.clone()));
        }
        self.put_json(RESOURCE_BINDINGS, &binding.resource_id, binding)?;
        debug!(resource_id = %binding.resource_id, resource_type = %binding.resource_type, "resource binding created");
        Ok(())
    }

    /// Move a binding from `expected` to `new`, optionally recording the
    /// hosting device it now lives on.
    ///
    /// Fails with `StaleBindingState` when the stored status is not
    /// `expected`, and with `InvalidTransition` when the state machine
    /// does not allow the move.
    pub fn compare_and_set_status(
        &self,
        resource_id: &str,
        expected: BindingStatus,
        new: BindingStatus,
        hosting_device_id: Option<&str>,
        now: u64,
    ) -> StateResult<LogicalResourceBinding> {
        let mut binding = self
            .get_resource_binding(resource_id)?
            .ok_or_else(|| StateError::NoSuchBinding(resource_id.to_string()))?;

        if binding.status != expected {
            return Err(StateError::StaleBindingState {
                resource_id: resource_id.to_string(),
                expected,
                actual: binding.status,
            });
        }
        if !expected.can_transition_to(new) {
            return Err(StateError::InvalidTransition {
                resource_id: resource_id.to_string(),
                from: expected,
                to: new,
            });
        }
        if let Some(device_id) = hosting_device_id {
            binding.hosting_device_id = Some(device_id.to_string());
        }
        // An active binding always names its hosting device.
        if new == BindingStatus::Active && binding.hosting_device_id.is_none() {
            return Err(StateError::InvalidTransition {
                resource_id: resource_id.to_string(),
                from: expected,
                to: new,
            });
        }

        binding.status = new;
        binding.updated_at = now;
        self.put_json(RESOURCE_BINDINGS, resource_id, &binding)?;
        debug!(%resource_id, from = %expected, to = %new, "resource binding transitioned");
        Ok(binding)
    }

    /// Detach a resource from its hosting device, making it schedulable again.
    ///
    /// Returns `None` if the binding no longer exists or is being deleted.
    pub fn unschedule_resource(&self, resource_id: &str, now: u64) -> StateResult<Option<LogicalResourceBinding>> {
        let Some(mut binding) = self.get_resource_binding(resource_id)? else {
            return Ok(None);
        };
        if binding.status == BindingStatus::PendingDelete {
            return Ok(None);
        }
        binding.hosting_device_id = None;
        binding.status = BindingStatus::PendingCreate;
        binding.updated_at = now;
        self.put_json(RESOURCE_BINDINGS, resource_id, &binding)?;
        debug!(%resource_id, "resource unscheduled");
        Ok(Some(binding))
    }

    /// Remove a binding that is in `PendingDelete`, along with its hosted ports.
    pub fn remove_resource_binding(&self, resource_id: &str) -> StateResult<LogicalResourceBinding> {
        let binding = self
            .get_resource_binding(resource_id)?
            .ok_or_else(|| StateError::NoSuchBinding(resource_id.to_string()))?;
        if binding.status != BindingStatus::PendingDelete {
            return Err(StateError::BindingInUse {
                resource_id: resource_id.to_string(),
                status: binding.status,
            });
        }
        self.remove_key(RESOURCE_BINDINGS, resource_id)?;
        let ports = self.remove_hosted_ports_for_resource(resource_id)?;
        debug!(%resource_id, hosted_ports_removed = ports, "resource binding deleted");
        Ok(binding)
    }

    // ── Hosting device bindings ────────────────────────────────────

    /// Insert a new device binding, enforcing management-port uniqueness.
    pub fn insert_device_binding(&self, binding: &HostingDeviceAgentBinding) -> StateResult<()> {
        if self.get_device_binding(&binding.hosting_device_id)?.is_some() {
            return Err(StateError::DeviceBindingExists(binding.hosting_device_id.clone()));
        }
        if let Some(owner) = self.find_device_by_management_port(&binding.management_port_id)? {
            return Err(StateError::DuplicateManagementPort {
                port_id: binding.management_port_id.clone(),
                hosting_device_id: owner,
            });
        }
        self.put_json(DEVICE_BINDINGS, &binding.hosting_device_id, binding)?;
        self.put_json(
            MGMT_PORT_INDEX,
            &binding.management_port_id,
            &binding.hosting_device_id,
        )?;
        debug!(hosting_device_id = %binding.hosting_device_id, "hosting device binding created");
        Ok(())
    }

    /// Assign (or clear) the config agent of a hosting device.
    pub fn set_device_agent(
        &self,
        hosting_device_id: &str,
        agent_id: Option<&str>,
    ) -> StateResult<HostingDeviceAgentBinding> {
        let mut binding = self
            .get_device_binding(hosting_device_id)?
            .ok_or_else(|| StateError::NotFound(format!("hosting device {hosting_device_id}")))?;
        binding.agent_id = agent_id.map(str::to_string);
        self.put_json(DEVICE_BINDINGS, hosting_device_id, &binding)?;
        Ok(binding)
    }

    /// Remove a device binding and unschedule every resource it hosted.
    ///
    /// Resources already in `PendingDelete` are left for their own delete
    /// flow to remove.
    pub fn remove_device_binding(
        &self,
        hosting_device_id: &str,
        now: u64,
    ) -> StateResult<Option<HostingDeviceAgentBinding>> {
        let Some(binding) = self.get_device_binding(hosting_device_id)? else {
            return Ok(None);
        };
        for resource in self.list_bindings_on_device(hosting_device_id)? {
            self.unschedule_resource(&resource.resource_id, now)?;
        }
        self.remove_key(DEVICE_BINDINGS, hosting_device_id)?;
        self.remove_key(MGMT_PORT_INDEX, &binding.management_port_id)?;
        debug!(%hosting_device_id, "hosting device binding deleted");
        Ok(Some(binding))
    }

    // ── Hosted ports ───────────────────────────────────────────────

    pub fn put_hosted_port(&self, binding: &HostedPortBinding) -> StateResult<()> {
        self.put_json(HOSTED_PORTS, &binding.table_key(), binding)
    }

    pub fn remove_hosted_port(&self, resource_id: &str, port_id: &str) -> StateResult<bool> {
        self.remove_key(HOSTED_PORTS, &format!("{resource_id}:{port_id}"))
    }

    pub fn remove_hosted_ports_for_resource(&self, resource_id: &str) -> StateResult<u32> {
        let ports = self.list_hosted_ports_for_resource(resource_id)?;
        for port in &ports {
            self.remove_key(HOSTED_PORTS, &port.table_key())?;
        }
        Ok(ports.len() as u32)
    }

    /// Cascade for a deleted logical port: drop every mapping that uses it.
    pub fn remove_hosted_ports_for_port(&self, port_id: &str) -> StateResult<u32> {
        let ports: Vec<HostedPortBinding> = self
            .scan_json::<HostedPortBinding>(HOSTED_PORTS, "")?
            .into_iter()
            .filter(|p| p.logical_port_id == port_id)
            .collect();
        for port in &ports {
            self.remove_key(HOSTED_PORTS, &port.table_key())?;
        }
        Ok(ports.len() as u32)
    }

    // ── Agents ─────────────────────────────────────────────────────

    pub fn put_agent(&self, agent: &ConfigAgent) -> StateResult<()> {
        self.put_json(AGENTS, &agent.id, agent)
    }

    pub fn remove_agent(&self, agent_id: &str) -> StateResult<bool> {
        self.remove_key(AGENTS, agent_id)
    }

    // ── Routers and floating IPs ───────────────────────────────────

    pub fn put_router(&self, router: &Router) -> StateResult<()> {
        self.put_json(ROUTERS, &router.id, router)
    }

    pub fn remove_router(&self, router_id: &str) -> StateResult<bool> {
        self.remove_key(ROUTERS, router_id)
    }

    pub fn put_floating_ip(&self, fip: &FloatingIp) -> StateResult<()> {
        self.put_json(FLOATING_IPS, &fip.id, fip)
    }

    pub fn remove_floating_ip(&self, floatingip_id: &str) -> StateResult<bool> {
        self.remove_key(FLOATING_IPS, floatingip_id)
    }
}
