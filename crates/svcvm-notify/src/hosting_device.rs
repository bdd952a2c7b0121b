//! Notifications about hosting devices, sent to the config agent topic.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use svcvm_state::{HostingDeviceId, ResourceId};

use crate::bus::{Message, MessageBus};
use crate::error::NotifyResult;

pub const CFG_AGENT_TOPIC: &str = "cfg_agent";

/// Per-device inventory: hosting device id → resource-type key → resource ids.
pub type HostingInfo = BTreeMap<HostingDeviceId, BTreeMap<String, Vec<ResourceId>>>;

pub struct HostingDeviceNotifier {
    bus: Arc<dyn MessageBus>,
}

impl HostingDeviceNotifier {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Tell the agent on `host` that the listed devices, and everything
    /// they hosted, are gone. Nothing is sent for an empty inventory.
    pub async fn hosting_devices_removed(
        &self,
        hosting_data: &HostingInfo,
        deconfigure: bool,
        host: &str,
    ) -> NotifyResult<bool> {
        if hosting_data.is_empty() {
            debug!(%host, "no hosting devices removed, nothing to notify");
            return Ok(false);
        }
        let message = Message::new(
            "hosting_devices_removed",
            json!({
                "hosting_data": hosting_data,
                "deconfigure": deconfigure,
            }),
        );
        self.bus.send_to_host(CFG_AGENT_TOPIC, host, message).await?;
        info!(%host, devices = hosting_data.len(), "notified agent of removed hosting devices");
        Ok(true)
    }
}
