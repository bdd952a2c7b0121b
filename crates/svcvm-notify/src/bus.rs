//! Message bus used to reach config agents.
//!
//! Agents listen on a topic. A message is either cast to the agent on one
//! host or broadcast to every agent on the topic. Delivery is best effort:
//! a message nobody listens to is dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::NotifyResult;

/// A notification: a method name and its JSON arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub method: String,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(method: &str, payload: serde_json::Value) -> Self {
        Self {
            method: method.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Host(String),
    Fanout,
}

/// A message as delivered on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub target: Target,
    pub message: Message,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Point-to-point cast to `topic.host`.
    async fn send_to_host(&self, topic: &str, host: &str, message: Message) -> NotifyResult<()>;

    /// Fanout to every listener on `topic`.
    async fn broadcast(&self, topic: &str, message: Message) -> NotifyResult<()>;
}

/// In-process bus on a tokio broadcast channel.
///
/// Every subscriber sees every delivery and filters by topic and target.
#[derive(Clone)]
pub struct ChannelBus {
    tx: broadcast::Sender<Delivery>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }

    fn publish(&self, delivery: Delivery) {
        let method = delivery.message.method.clone();
        if self.tx.send(delivery).is_err() {
            debug!(%method, "no listeners, notification dropped");
        }
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn send_to_host(&self, topic: &str, host: &str, message: Message) -> NotifyResult<()> {
        debug!(%topic, %host, method = %message.method, "cast");
        self.publish(Delivery {
            topic: topic.to_string(),
            target: Target::Host(host.to_string()),
            message,
        });
        Ok(())
    }

    async fn broadcast(&self, topic: &str, message: Message) -> NotifyResult<()> {
        debug!(%topic, method = %message.method, "fanout");
        self.publish(Delivery {
            topic: topic.to_string(),
            target: Target::Fanout,
            message,
        });
        Ok(())
    }
}

/// Drain every delivery currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        out.push(delivery);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_casts_and_fanouts() {
        let bus = ChannelBus::default();
        let mut rx = bus.subscribe();

        bus.send_to_host("cfg_agent", "host-1", Message::new("ping", json!({})))
            .await
            .unwrap();
        bus.broadcast("l3_agent", Message::new("router_deleted", json!({"router_id": "r1"})))
            .await
            .unwrap();

        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].target, Target::Host("host-1".to_string()));
        assert_eq!(got[1].target, Target::Fanout);
        assert_eq!(got[1].message.payload["router_id"], "r1");
    }

    #[tokio::test]
    async fn sending_without_listeners_is_not_an_error() {
        let bus = ChannelBus::default();
        assert!(bus.broadcast("cfg_agent", Message::new("x", json!(null))).await.is_ok());
    }
}
