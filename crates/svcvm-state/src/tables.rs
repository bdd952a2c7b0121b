//! redb table definitions for the svcvm binding store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Logical-resource bindings keyed by `{resource_id}`.
pub const RESOURCE_BINDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("resource_bindings");

/// Hosting-device agent bindings keyed by `{hosting_device_id}`.
pub const DEVICE_BINDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("device_bindings");

/// Unique index: `{management_port_id}` → JSON string of the hosting device id.
pub const MGMT_PORT_INDEX: TableDefinition<&str, &[u8]> =
    TableDefinition::new("mgmt_port_index");

/// Hosted port bindings keyed by `{logical_resource_id}:{logical_port_id}`.
pub const HOSTED_PORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosted_ports");

/// Config agents keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Routers keyed by `{router_id}`.
pub const ROUTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("routers");

/// Floating IPs keyed by `{floatingip_id}`.
pub const FLOATING_IPS: TableDefinition<&str, &[u8]> = TableDefinition::new("floating_ips");

pub(crate) const ALL: [TableDefinition<&str, &[u8]>; 7] = [
    RESOURCE_BINDINGS,
    DEVICE_BINDINGS,
    MGMT_PORT_INDEX,
    HOSTED_PORTS,
    AGENTS,
    ROUTERS,
    FLOATING_IPS,
];
