//! Management network resolution.
//!
//! Hosting devices are configured over a dedicated management network
//! owned by the L3 admin tenant. The tenant id, network id, subnet id and
//! security group id are looked up by name once and memoized; each lookup
//! runs inside its own named lock scope so concurrent first callers do a
//! single round trip.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use svcvm_core::NamedLocks;
use svcvm_core::config::ManagementNetworkConfig;

use crate::network::{CorePlugin, IdentityService};

#[derive(Debug, Clone, Default)]
struct Resolved {
    tenant_id: Option<String>,
    network_id: Option<String>,
    subnet_id: Option<String>,
    security_group_id: Option<String>,
}

pub struct ManagementNetwork {
    config: ManagementNetworkConfig,
    core: Arc<dyn CorePlugin>,
    identity: Arc<dyn IdentityService>,
    locks: NamedLocks,
    resolved: RwLock<Resolved>,
}

impl ManagementNetwork {
    pub fn new(
        config: ManagementNetworkConfig,
        core: Arc<dyn CorePlugin>,
        identity: Arc<dyn IdentityService>,
        locks: NamedLocks,
    ) -> Self {
        Self {
            config,
            core,
            identity,
            locks,
            resolved: RwLock::new(Resolved::default()),
        }
    }

    /// Id of the tenant owning all hosting-device resources.
    pub async fn l3_tenant_id(&self) -> Option<String> {
        if let Some(id) = self.resolved.read().await.tenant_id.clone() {
            return Some(id);
        }
        let _scope = self.locks.lock("l3-tenant-id").await;
        if let Some(id) = self.resolved.read().await.tenant_id.clone() {
            return Some(id);
        }

        let name = &self.config.l3_admin_tenant;
        match self.identity.find_tenant_id(name).await {
            Ok(Some(id)) => {
                self.resolved.write().await.tenant_id = Some(id.clone());
                Some(id)
            }
            Ok(None) => {
                error!(tenant = %name, "no tenant with the configured L3 admin name");
                None
            }
            Err(e) => {
                error!(tenant = %name, error = %e, "tenant lookup failed");
                None
            }
        }
    }

    /// Id of the management network. The network must be unique by name
    /// within the admin tenant and carry at least one subnet.
    pub async fn mgmt_nw_id(&self) -> Option<String> {
        if let Some(id) = self.resolved.read().await.network_id.clone() {
            return Some(id);
        }
        let tenant_id = self.l3_tenant_id().await?;
        let _scope = self.locks.lock("mgmt-nw-id").await;
        if let Some(id) = self.resolved.read().await.network_id.clone() {
            return Some(id);
        }

        let name = &self.config.management_network;
        let networks = match self.core.list_networks(name, &tenant_id).await {
            Ok(networks) => networks,
            Err(e) => {
                error!(network = %name, error = %e, "management network lookup failed");
                return None;
            }
        };
        let [network] = networks.as_slice() else {
            error!(network = %name, found = networks.len(), "management network must exist exactly once");
            return None;
        };
        let Some(subnet_id) = network.subnets.first() else {
            error!(network = %name, "management network has no subnet");
            return None;
        };
        if network.subnets.len() > 1 {
            info!(network = %name, %subnet_id, "management network has several subnets, using the first");
        }

        let mut resolved = self.resolved.write().await;
        resolved.network_id = Some(network.id.clone());
        resolved.subnet_id = Some(subnet_id.clone());
        Some(network.id.clone())
    }

    /// Subnet used for management addresses; resolved with the network.
    pub async fn mgmt_subnet_id(&self) -> Option<String> {
        self.mgmt_nw_id().await?;
        self.resolved.read().await.subnet_id.clone()
    }

    /// Id of the security group applied to management ports, if one
    /// exists exactly once.
    pub async fn mgmt_sec_grp_id(&self) -> Option<String> {
        if let Some(id) = self.resolved.read().await.security_group_id.clone() {
            return Some(id);
        }
        let tenant_id = self.l3_tenant_id().await?;
        let _scope = self.locks.lock("mgmt-sec-grp-id").await;
        if let Some(id) = self.resolved.read().await.security_group_id.clone() {
            return Some(id);
        }

        let name = &self.config.management_security_group;
        match self.core.list_security_groups(name, &tenant_id).await {
            Ok(groups) if groups.len() == 1 => {
                let id = groups[0].id.clone();
                self.resolved.write().await.security_group_id = Some(id.clone());
                Some(id)
            }
            Ok(groups) => {
                warn!(group = %name, found = groups.len(), "management security group must exist exactly once");
                None
            }
            Err(e) => {
                error!(group = %name, error = %e, "security group lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCloud;

    fn resolver(cloud: &Arc<SimulatedCloud>) -> ManagementNetwork {
        ManagementNetwork::new(
            ManagementNetworkConfig::default(),
            cloud.clone(),
            cloud.clone(),
            NamedLocks::new(),
        )
    }

    #[tokio::test]
    async fn resolves_and_memoizes_ids() {
        let cloud = Arc::new(SimulatedCloud::with_management_network());
        let mgmt = resolver(&cloud);

        assert_eq!(mgmt.l3_tenant_id().await.as_deref(), Some("tenant-l3-admin"));
        assert_eq!(mgmt.mgmt_nw_id().await.as_deref(), Some("net-mgmt"));
        assert_eq!(mgmt.mgmt_subnet_id().await.as_deref(), Some("subnet-mgmt"));
        assert_eq!(mgmt.mgmt_sec_grp_id().await.as_deref(), Some("sg-mgmt"));

        let lookups = cloud.count_calls("list_networks");
        mgmt.mgmt_nw_id().await;
        assert_eq!(cloud.count_calls("list_networks"), lookups);
    }

    #[tokio::test]
    async fn concurrent_first_resolution_does_one_lookup() {
        let cloud = Arc::new(SimulatedCloud::with_management_network());
        let mgmt = Arc::new(resolver(&cloud));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgmt = mgmt.clone();
                tokio::spawn(async move { mgmt.mgmt_nw_id().await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().as_deref(), Some("net-mgmt"));
        }
        assert_eq!(cloud.count_calls("list_networks"), 1);
    }

    #[tokio::test]
    async fn missing_network_is_not_cached() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_tenant("l3_admin", "tenant-l3-admin");
        let mgmt = resolver(&cloud);

        assert!(mgmt.mgmt_nw_id().await.is_none());
        assert!(mgmt.mgmt_sec_grp_id().await.is_none());

        cloud.add_management_network();
        assert_eq!(mgmt.mgmt_nw_id().await.as_deref(), Some("net-mgmt"));
    }

    #[tokio::test]
    async fn network_without_subnet_is_unusable() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_tenant("l3_admin", "tenant-l3-admin");
        cloud.add_network("net-x", "mgmt_network", "tenant-l3-admin", &[]);
        let mgmt = resolver(&cloud);

        assert!(mgmt.mgmt_nw_id().await.is_none());
    }
}
