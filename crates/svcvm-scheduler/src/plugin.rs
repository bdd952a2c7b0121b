//! Interface between service plugins and device failure handling.

use async_trait::async_trait;

use svcvm_notify::HostingInfo;
use svcvm_state::{HostingDeviceId, ResourceType, StateResult, StoreTxn};

/// A service whose resources live on hosting devices.
#[async_trait]
pub trait ServicePlugin: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// Inside the recovery transaction: record this service's resources
    /// on the failed devices in `hosting_info` and mark them unscheduled.
    fn handle_non_responding_hosting_devices_db(
        &self,
        txn: &StoreTxn,
        hosting_device_ids: &[HostingDeviceId],
        hosting_info: &mut HostingInfo,
    ) -> StateResult<()>;

    /// After the recovery transaction committed.
    async fn handle_non_responding_hosting_devices_post(&self, hosting_info: &HostingInfo);

    /// A config agent came up on `host`. Returns `true` if it now manages
    /// hosting devices for this service.
    async fn auto_schedule_hosting_devices(&self, host: &str) -> bool;
}
