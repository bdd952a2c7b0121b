//! Router notifications for config agents.
//!
//! Each router is delivered to the host of the agent managing its hosting
//! device. Routers without a live agent are skipped; the agent picks them
//! up on its next full sync.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use svcvm_state::{ResourceId, ResourceType};

use crate::bus::{Message, MessageBus};
use crate::error::NotifyResult;

pub const L3_AGENT_TOPIC: &str = "l3_agent";

/// Resolves which host serves a logical resource.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn get_agent_host(&self, resource_type: ResourceType, resource_id: &str) -> Option<String>;

    /// Description of the device hosting the resource, if one is known.
    async fn hosting_device_info(
        &self,
        _resource_type: ResourceType,
        _resource_id: &str,
    ) -> Option<serde_json::Value> {
        None
    }
}

pub struct L3ConfigAgentNotifier {
    bus: Arc<dyn MessageBus>,
    resolver: Arc<dyn HostResolver>,
}

impl L3ConfigAgentNotifier {
    pub fn new(bus: Arc<dyn MessageBus>, resolver: Arc<dyn HostResolver>) -> Self {
        Self { bus, resolver }
    }

    pub async fn router_updated(&self, router_id: &str, operation: &str) -> NotifyResult<()> {
        self.routers_updated(&[router_id.to_string()], operation).await
    }

    /// One cast per host, listing that host's routers in the given order.
    pub async fn routers_updated(&self, router_ids: &[ResourceId], operation: &str) -> NotifyResult<()> {
        let mut by_host: BTreeMap<String, Vec<&ResourceId>> = BTreeMap::new();
        let mut devices = serde_json::Map::new();
        for router_id in router_ids {
            match self.resolver.get_agent_host(ResourceType::Router, router_id).await {
                Some(host) => {
                    by_host.entry(host).or_default().push(router_id);
                    if let Some(info) = self
                        .resolver
                        .hosting_device_info(ResourceType::Router, router_id)
                        .await
                    {
                        devices.insert(router_id.clone(), info);
                    }
                }
                None => debug!(%router_id, %operation, "no live agent for router, skipping notification"),
            }
        }

        for (host, routers) in by_host {
            let hosting_devices: serde_json::Map<_, _> = devices
                .iter()
                .filter(|(id, _)| routers.contains(id))
                .map(|(id, info)| (id.clone(), info.clone()))
                .collect();
            let message = Message::new(
                "routers_updated",
                json!({
                    "routers": routers,
                    "operation": operation,
                    "hosting_devices": hosting_devices,
                }),
            );
            self.bus.send_to_host(L3_AGENT_TOPIC, &host, message).await?;
        }
        Ok(())
    }

    /// Tell the router's agent it is gone. Without a resolvable host the
    /// notification is broadcast so whichever agent still holds it cleans up.
    pub async fn router_deleted(&self, router_id: &str) -> NotifyResult<()> {
        let message = Message::new("router_deleted", json!({ "router_id": router_id }));
        match self.resolver.get_agent_host(ResourceType::Router, router_id).await {
            Some(host) => self.bus.send_to_host(L3_AGENT_TOPIC, &host, message).await,
            None => {
                debug!(%router_id, "no agent host for deleted router, broadcasting");
                self.bus.broadcast(L3_AGENT_TOPIC, message).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelBus, Target, drain};

    struct StaticHosts(BTreeMap<String, String>);

    #[async_trait]
    impl HostResolver for StaticHosts {
        async fn get_agent_host(&self, _t: ResourceType, resource_id: &str) -> Option<String> {
            self.0.get(resource_id).cloned()
        }
    }

    fn notifier(bus: &ChannelBus) -> L3ConfigAgentNotifier {
        let hosts = StaticHosts(BTreeMap::from([
            ("r1".to_string(), "host-a".to_string()),
            ("r2".to_string(), "host-b".to_string()),
            ("r3".to_string(), "host-a".to_string()),
        ]));
        L3ConfigAgentNotifier::new(Arc::new(bus.clone()), Arc::new(hosts))
    }

    #[tokio::test]
    async fn routers_are_grouped_per_host_and_unhosted_skipped() {
        let bus = ChannelBus::default();
        let mut rx = bus.subscribe();
        let ids: Vec<String> = ["r3", "r2", "r9", "r1"].iter().map(|s| s.to_string()).collect();

        notifier(&bus).routers_updated(&ids, "update").await.unwrap();

        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].target, Target::Host("host-a".to_string()));
        assert_eq!(got[0].message.payload["routers"], json!(["r3", "r1"]));
        assert_eq!(got[1].target, Target::Host("host-b".to_string()));
        assert_eq!(got[1].message.payload["operation"], "update");
    }

    #[tokio::test]
    async fn router_deleted_falls_back_to_fanout() {
        let bus = ChannelBus::default();
        let mut rx = bus.subscribe();
        let n = notifier(&bus);

        n.router_deleted("r1").await.unwrap();
        n.router_deleted("r9").await.unwrap();

        let got = drain(&mut rx);
        assert_eq!(got[0].target, Target::Host("host-a".to_string()));
        assert_eq!(got[1].target, Target::Fanout);
        assert_eq!(got[1].message.payload["router_id"], "r9");
    }
}
