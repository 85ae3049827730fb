use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use paho_mqtt as mqtt;
use parking_lot::{Mutex, RwLock};

use crate::error::EncodeError;
use crate::metrics::Metrics;
use crate::version;

/// Grace period granted to broker clients when disconnecting.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Handler invoked for every message of a subscribed device. Receives the
/// device token extracted from the topic and the raw payload. Heavy work must
/// be delegated off the broker-client thread.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback a connection invokes for every incoming message, with the raw
/// topic and payload.
pub type OnMessage = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// MqttClient is the surface the control service and supervisor depend on.
pub trait MqttClient: Send + Sync {
    /// Ensure a client is connected to `broker` and a subscription exists for
    /// the device's readings topic. Idempotent: a second call for the same
    /// `(broker, device_token)` is a no-op.
    fn subscribe(
        &self,
        broker: &str,
        device_token: &str,
        handler: MessageHandler,
    ) -> Result<(), EncodeError>;

    /// Remove the subscription for `(broker, device_token)`. The broker
    /// connection is retained for later subscriptions.
    fn unsubscribe(&self, broker: &str, device_token: &str) -> Result<(), EncodeError>;

    /// Disconnect all clients with a bounded grace period and clear state.
    fn stop(&self);
}

/// A live connection to a single broker.
pub trait Connection: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), EncodeError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), EncodeError>;
    fn disconnect(&self, grace: Duration);
}

/// Connector creates broker connections. Pulled out into a trait so tests can
/// substitute an in-memory fake for the real paho client.
pub trait Connector: Send + Sync {
    fn connect(&self, broker: &str, on_message: OnMessage) -> Result<Box<dyn Connection>, EncodeError>;
}

/// Topic a device publishes its readings on.
pub fn readings_topic(device_token: &str) -> String {
    format!("device/sck/{}/readings", device_token)
}

/// Extract the device token from a readings topic, or `None` if the topic
/// does not match the fixed pattern.
pub fn device_token_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("device"), Some("sck"), Some(token), Some("readings"), None) if !token.is_empty() => {
            Some(token)
        }
        _ => None,
    }
}

struct State {
    clients: HashMap<String, Arc<dyn Connection>>,
    handlers: HashMap<(String, String), MessageHandler>,
}

/// SubscriptionManager pools broker connections and maintains exactly one
/// subscription per `(broker, device_token)` no matter how many streams
/// reference the device. Internal state is guarded by a read-write lock;
/// message dispatch only takes the read side.
pub struct SubscriptionManager {
    connector: Box<dyn Connector>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
}

impl SubscriptionManager {
    pub fn new(connector: Box<dyn Connector>, metrics: Arc<Metrics>) -> SubscriptionManager {
        SubscriptionManager {
            connector,
            metrics,
            state: Arc::new(RwLock::new(State {
                clients: HashMap::new(),
                handlers: HashMap::new(),
            })),
        }
    }

    /// Number of active subscriptions across all brokers.
    pub fn subscription_count(&self) -> usize {
        self.state.read().handlers.len()
    }

    fn get_client(&self, broker: &str) -> Result<Arc<dyn Connection>, EncodeError> {
        if let Some(client) = self.state.read().clients.get(broker) {
            return Ok(client.clone());
        }

        debug!("connecting to broker {}", broker);
        let connection = self
            .connector
            .connect(broker, self.dispatcher(broker))?;

        let mut state = self.state.write();
        let client = state
            .clients
            .entry(broker.to_string())
            .or_insert_with(|| Arc::from(connection));
        Ok(client.clone())
    }

    /// The per-broker message callback: extracts the device token from the
    /// topic and hands the payload to the handler registered for it. Runs on
    /// the broker-client thread, so registered handlers must return quickly.
    fn dispatcher(&self, broker: &str) -> OnMessage {
        let state = Arc::downgrade(&self.state);
        let metrics = self.metrics.clone();
        let broker = broker.to_string();

        Box::new(move |topic: &str, payload: &[u8]| {
            metrics.messages_received.inc();

            let token = match device_token_from_topic(topic) {
                Some(token) => token.to_string(),
                None => {
                    error!("unable to extract device token from topic {}", topic);
                    return;
                }
            };

            let handler = match state.upgrade() {
                Some(state) => {
                    let state = state.read();
                    state.handlers.get(&(broker.clone(), token.clone())).cloned()
                }
                None => return,
            };

            match handler {
                Some(handler) => handler(&token, payload),
                None => warn!("no handler registered for topic {}", topic),
            }
        })
    }
}

impl MqttClient for SubscriptionManager {
    fn subscribe(
        &self,
        broker: &str,
        device_token: &str,
        handler: MessageHandler,
    ) -> Result<(), EncodeError> {
        let key = (broker.to_string(), device_token.to_string());

        if self.state.read().handlers.contains_key(&key) {
            debug!("already subscribed for device {} on {}", device_token, broker);
            return Ok(());
        }

        info!("subscribing for device {} on {}", device_token, broker);

        let client = self.get_client(broker)?;
        client.subscribe(&readings_topic(device_token))?;

        self.state.write().handlers.insert(key, handler);
        Ok(())
    }

    fn unsubscribe(&self, broker: &str, device_token: &str) -> Result<(), EncodeError> {
        let key = (broker.to_string(), device_token.to_string());

        let removed = self.state.write().handlers.remove(&key).is_some();
        if !removed {
            return Ok(());
        }

        info!("unsubscribing for device {} on {}", device_token, broker);

        let client = self.state.read().clients.get(broker).cloned();
        if let Some(client) = client {
            client.unsubscribe(&readings_topic(device_token))?;
        }

        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.write();

        for (broker, client) in state.clients.drain() {
            info!("disconnecting from broker {}", broker);
            client.disconnect(DISCONNECT_GRACE);
        }

        state.handlers.clear();
    }
}

/// Connector backed by the paho MQTT client. One async client per broker,
/// automatic reconnect enabled; on reconnect the client re-subscribes every
/// topic it held before the connection dropped.
pub struct PahoConnector {
    username: String,
}

impl PahoConnector {
    pub fn new(username: &str) -> PahoConnector {
        PahoConnector {
            username: username.to_string(),
        }
    }
}

impl Connector for PahoConnector {
    fn connect(&self, broker: &str, on_message: OnMessage) -> Result<Box<dyn Connection>, EncodeError> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(broker)
            .client_id(format!("{}_sub", version::BINARY_NAME))
            .finalize();

        let client = mqtt::AsyncClient::new(create_opts)
            .map_err(|e| EncodeError::Unavailable(format!("failed to create mqtt client: {}", e)))?;

        client.set_message_callback(move |_client, message| {
            if let Some(message) = message {
                on_message(message.topic(), message.payload());
            }
        });

        let topics: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        {
            let topics = topics.clone();
            let broker = broker.to_string();
            client.set_connected_callback(move |client| {
                info!("connected to broker {}", broker);
                for topic in topics.lock().iter() {
                    client.subscribe(topic, mqtt::QOS_0);
                }
            });
        }

        let mut builder = mqtt::ConnectOptionsBuilder::new();
        builder
            .clean_session(true)
            .connect_timeout(Duration::from_secs(5))
            .automatic_reconnect(Duration::from_secs(1), Duration::from_secs(30));
        if !self.username.is_empty() {
            builder.user_name(self.username.clone());
        }

        client
            .connect(builder.finalize())
            .wait()
            .map_err(|e| EncodeError::Unavailable(format!("failed to connect to broker: {}", e)))?;

        info!("mqtt connected to {}", broker);

        Ok(Box::new(PahoConnection { client, topics }))
    }
}

struct PahoConnection {
    client: mqtt::AsyncClient,
    topics: Arc<Mutex<HashSet<String>>>,
}

impl Connection for PahoConnection {
    fn subscribe(&self, topic: &str) -> Result<(), EncodeError> {
        self.client
            .subscribe(topic, mqtt::QOS_0)
            .wait()
            .map_err(|e| EncodeError::Unavailable(format!("failed to subscribe: {}", e)))?;
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), EncodeError> {
        self.client
            .unsubscribe(topic)
            .wait()
            .map_err(|e| EncodeError::Unavailable(format!("failed to unsubscribe: {}", e)))?;
        self.topics.lock().remove(topic);
        Ok(())
    }

    fn disconnect(&self, grace: Duration) {
        let opts = mqtt::DisconnectOptionsBuilder::new().timeout(grace).finalize();
        if let Err(e) = self.client.disconnect(opts).wait() {
            warn!("failed to disconnect cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockConnector;
    use parking_lot::Mutex as PlMutex;

    fn manager() -> (Arc<MockConnector>, SubscriptionManager) {
        let connector = Arc::new(MockConnector::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = SubscriptionManager::new(Box::new(connector.clone()), metrics);
        (connector, manager)
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_token, _payload| {})
    }

    #[test]
    fn topic_round_trip() {
        assert_eq!(readings_topic("abc123"), "device/sck/abc123/readings");
        assert_eq!(
            device_token_from_topic("device/sck/abc123/readings"),
            Some("abc123")
        );
    }

    #[test]
    fn unmatched_topics_are_rejected() {
        assert_eq!(device_token_from_topic("device/sck//readings"), None);
        assert_eq!(device_token_from_topic("device/sck/abc123"), None);
        assert_eq!(
            device_token_from_topic("device/sck/abc123/readings/extra"),
            None
        );
        assert_eq!(device_token_from_topic("something/else"), None);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let (connector, manager) = manager();

        manager
            .subscribe("tcp://broker:1883", "abc123", noop_handler())
            .unwrap();
        manager
            .subscribe("tcp://broker:1883", "abc123", noop_handler())
            .unwrap();

        assert_eq!(manager.subscription_count(), 1);
        let connections = connector.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].subscribe_calls(), 1);
        assert_eq!(
            connector.subscribed_topics(),
            HashSet::from(["device/sck/abc123/readings".to_string()])
        );
    }

    #[test]
    fn devices_share_one_broker_connection() {
        let (connector, manager) = manager();

        manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap();
        manager
            .subscribe("tcp://broker:1883", "bar", noop_handler())
            .unwrap();

        assert_eq!(connector.connections().len(), 1);
        assert_eq!(manager.subscription_count(), 2);
    }

    #[test]
    fn subscription_exists_iff_device_is_referenced() {
        let (connector, manager) = manager();
        let broker = "tcp://broker:1883";

        // interleaved subscribe/unsubscribe schedules always leave exactly
        // one subscription while the device is referenced, none otherwise
        manager.subscribe(broker, "foo", noop_handler()).unwrap();
        manager.subscribe(broker, "foo", noop_handler()).unwrap();
        assert_eq!(manager.subscription_count(), 1);

        manager.unsubscribe(broker, "foo").unwrap();
        assert_eq!(manager.subscription_count(), 0);
        assert!(connector.subscribed_topics().is_empty());

        manager.unsubscribe(broker, "foo").unwrap();
        assert_eq!(manager.subscription_count(), 0);

        manager.subscribe(broker, "foo", noop_handler()).unwrap();
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(
            connector.subscribed_topics(),
            HashSet::from(["device/sck/foo/readings".to_string()])
        );
    }

    #[test]
    fn unsubscribe_retains_the_connection() {
        let (connector, manager) = manager();

        manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap();
        manager.unsubscribe("tcp://broker:1883", "foo").unwrap();

        let connections = connector.connections();
        assert_eq!(connections.len(), 1);
        assert!(!connections[0].is_disconnected());

        // resubscribing reuses it
        manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap();
        assert_eq!(connector.connections().len(), 1);
    }

    #[test]
    fn stop_disconnects_and_clears() {
        let (connector, manager) = manager();

        manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap();
        manager.stop();

        assert_eq!(manager.subscription_count(), 0);
        assert!(connector.connections()[0].is_disconnected());

        // a later subscribe opens a fresh connection
        manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap();
        assert_eq!(connector.connections().len(), 2);
    }

    #[test]
    fn failed_subscribe_leaves_no_registration() {
        let (connector, manager) = manager();

        manager
            .subscribe("tcp://broker:1883", "other", noop_handler())
            .unwrap();
        connector.connections()[0].set_fail_subscribe(true);

        let err = manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap_err();
        assert!(matches!(err, EncodeError::Unavailable(_)));
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn messages_are_dispatched_to_the_registered_handler() {
        let (connector, manager) = manager();

        let seen: Arc<PlMutex<Vec<(String, Vec<u8>)>>> = Arc::new(PlMutex::new(Vec::new()));
        let handler: MessageHandler = {
            let seen = seen.clone();
            Arc::new(move |token: &str, payload: &[u8]| {
                seen.lock().push((token.to_string(), payload.to_vec()));
            })
        };

        manager
            .subscribe("tcp://broker:1883", "abc123", handler)
            .unwrap();

        let connection = &connector.connections()[0];
        connection.push_message("device/sck/abc123/readings", b"{\"data\":[]}");
        connection.push_message("garbage/topic", b"ignored");
        connection.push_message("device/sck/unknown/readings", b"no handler");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "abc123");
        assert_eq!(seen[0].1, b"{\"data\":[]}");
    }

    #[test]
    fn connect_failure_surfaces_as_unavailable() {
        let (connector, manager) = manager();
        connector.set_fail_connect(true);

        let err = manager
            .subscribe("tcp://broker:1883", "foo", noop_handler())
            .unwrap_err();
        assert!(matches!(err, EncodeError::Unavailable(_)));
        assert_eq!(manager.subscription_count(), 0);
    }
}
