//! Hook set a router service driver implements around router CRUD.
//!
//! Each operation has up to three phases:
//! - **pre** validates and may veto before anything is written;
//! - **db** runs inside the transaction of the base mutation;
//! - **post** runs after commit and performs all external I/O.
//!
//! A db hook that moves a router to `PENDING_UPDATE` returns what it
//! claimed. The scheduler hands that claim to the matching post hook,
//! which only completes updates its own db phase started.

use async_trait::async_trait;

use svcvm_state::{HostingDeviceId, ResourceId, Router, StoreTxn};

use crate::error::SchedulerResult;

#[async_trait]
pub trait RouterDriver: Send + Sync {
    async fn create_router_pre(&self, _router: &Router) -> SchedulerResult<()> {
        Ok(())
    }
    fn create_router_db(&self, txn: &StoreTxn, router: &Router) -> SchedulerResult<()>;
    async fn create_router_post(&self, router: &Router) -> SchedulerResult<()>;

    /// Returns the hosting device of the router if this update claimed it.
    fn update_router_db(
        &self,
        txn: &StoreTxn,
        old: &Router,
        new: &Router,
    ) -> SchedulerResult<Option<HostingDeviceId>>;
    async fn update_router_post(&self, old: &Router, new: &Router, claimed: Option<&str>) -> SchedulerResult<()>;

    fn delete_router_db(&self, txn: &StoreTxn, router: &Router) -> SchedulerResult<()>;
    async fn delete_router_post(&self, router: &Router) -> SchedulerResult<()>;

    fn add_router_interface_db(&self, txn: &StoreTxn, router_id: &str) -> SchedulerResult<Option<HostingDeviceId>>;
    async fn add_router_interface_post(
        &self,
        router_id: &str,
        port_id: &str,
        claimed: Option<&str>,
    ) -> SchedulerResult<()>;

    fn remove_router_interface_db(&self, txn: &StoreTxn, router_id: &str) -> SchedulerResult<Option<HostingDeviceId>>;
    async fn remove_router_interface_post(
        &self,
        router_id: &str,
        port_id: &str,
        claimed: Option<&str>,
    ) -> SchedulerResult<()>;

    /// Floating IPs changed on the given routers. Returns the routers
    /// this change claimed.
    fn floatingips_db(&self, txn: &StoreTxn, router_ids: &[ResourceId]) -> SchedulerResult<Vec<ResourceId>>;
    async fn floatingips_post(&self, claimed: &[ResourceId], operation: &str) -> SchedulerResult<()>;

    /// Put an unscheduled router on a hosting device. Returns `false`
    /// when the router needed no scheduling.
    async fn schedule_router(&self, router_id: &str) -> SchedulerResult<bool>;

    /// Finish the deletion of a router left in `PENDING_DELETE`, e.g.
    /// after its hosting device could not be deleted. Returns `false`
    /// when no deletion was pending.
    async fn retry_delete(&self, router_id: &str) -> SchedulerResult<bool>;
}
