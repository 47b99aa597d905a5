//! Bus client
//!
//! Thin wrapper over the MQTT transport: connect once, publish, subscribe
//! with per-filter handlers. The broker event loop runs on its own task and
//! re-issues subscriptions after every reconnect, so handlers keep firing
//! across broker restarts. Handlers may run concurrently with everything
//! else; subscribers must tolerate concurrent entry.

use crate::error::{Error, Result};
use crate::state::AppConfig;
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Message handler invoked for every publish matching the filter
pub type MessageHandler =
    Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bus contract consumed by the supervisor (thread-safe; handlers may be
/// invoked concurrently from the transport task)
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, qos: u8, retained: bool, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, filter: &str, qos: u8, handler: MessageHandler) -> Result<()>;
}

#[async_trait::async_trait]
impl EventBus for BusClient {
    async fn publish(&self, topic: &str, qos: u8, retained: bool, payload: &[u8]) -> Result<()> {
        BusClient::publish(self, topic, qos, retained, payload).await
    }

    async fn subscribe(&self, filter: &str, qos: u8, handler: MessageHandler) -> Result<()> {
        BusClient::subscribe(self, filter, qos, handler).await
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Shared MQTT client
pub struct BusClient {
    client: AsyncClient,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl BusClient {
    /// Connect and start the event-loop task. Fails (fatal) when no CONNACK
    /// arrives within 10 seconds.
    pub async fn connect(cfg: &AppConfig) -> Result<Arc<Self>> {
        let mut options = MqttOptions::new(
            cfg.mqtt_client_id.clone(),
            cfg.mqtt_host.clone(),
            cfg.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if !cfg.mqtt_username.is_empty() {
            options.set_credentials(cfg.mqtt_username.clone(), cfg.mqtt_password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let event = tokio::time::timeout_at(deadline, eventloop.poll())
                .await
                .map_err(|_| Error::Bus("mqtt connect timeout".to_string()))?
                .map_err(|e| Error::Bus(format!("mqtt connect error: {}", e)))?;
            if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                break;
            }
        }
        tracing::info!(host = %cfg.mqtt_host, port = cfg.mqtt_port, "mqtt connected");

        let bus = Arc::new(Self {
            client,
            subscriptions: Mutex::new(Vec::new()),
        });
        let loop_bus = bus.clone();
        tokio::spawn(async move {
            loop_bus.run_event_loop(&mut eventloop).await;
        });
        Ok(bus)
    }

    /// Publish a payload. QoS 0/1/2; anything else maps to 1.
    pub async fn publish(&self, topic: &str, qos: u8, retained: bool, payload: &[u8]) -> Result<()> {
        self.client
            .publish(topic, map_qos(qos), retained, payload.to_vec())
            .await
            .map_err(|e| Error::Bus(format!("publish {}: {}", topic, e)))
    }

    /// Register a handler and subscribe. The handler fires for every publish
    /// whose topic matches `filter` (`+`/`#` wildcards supported).
    pub async fn subscribe(&self, filter: &str, qos: u8, handler: MessageHandler) -> Result<()> {
        {
            let mut subs = self.subscriptions.lock().await;
            subs.push(Subscription {
                filter: filter.to_string(),
                qos: map_qos(qos),
                handler,
            });
        }
        self.client
            .subscribe(filter, map_qos(qos))
            .await
            .map_err(|e| Error::Bus(format!("subscribe {}: {}", filter, e)))
    }

    async fn run_event_loop(self: &Arc<Self>, eventloop: &mut EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(publish.topic.clone(), publish.payload.to_vec())
                        .await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("mqtt reconnected, restoring subscriptions");
                    self.resubscribe().await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "mqtt event loop error, retrying in 1s");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn dispatch(&self, topic: String, payload: Vec<u8>) {
        let subs = self.subscriptions.lock().await;
        for sub in subs.iter() {
            if topic_matches(&sub.filter, &topic) {
                let handler = sub.handler.clone();
                let topic = topic.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    handler(topic, payload).await;
                });
            }
        }
    }

    async fn resubscribe(&self) {
        let filters: Vec<(String, QoS)> = {
            let subs = self.subscriptions.lock().await;
            subs.iter().map(|s| (s.filter.clone(), s.qos)).collect()
        };
        for (filter, qos) in filters {
            if let Err(e) = self.client.subscribe(&filter, qos).await {
                tracing::warn!(filter = %filter, error = %e, "resubscribe failed");
            }
        }
    }
}

fn map_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// MQTT topic-filter matching with `+` and trailing `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_plus() {
        assert!(topic_matches(
            "base/cams/+/+/+/+/+/info",
            "base/cams/acme/hq/1/ipcam/cam-001/info"
        ));
        assert!(!topic_matches(
            "base/cams/+/+/+/+/+/info",
            "base/cams/acme/hq/1/ipcam/cam-001/status"
        ));
    }

    #[test]
    fn test_topic_matches_hash() {
        assert!(topic_matches("base/#", "base/a/b/c"));
        assert!(topic_matches("base/#", "base"));
        assert!(!topic_matches("base/#", "other/a"));
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_uplink_action_filter() {
        assert!(topic_matches(
            "sv/cameras/+/+/+/+/+/uplink/+",
            "sv/cameras/acme/hq/1/ipcam/cam-001/uplink/start"
        ));
        assert!(topic_matches(
            "sv/cameras/+/+/+/+/+/uplink/+",
            "sv/cameras/acme/hq/1/ipcam/cam-001/uplink/stop"
        ));
    }
}
