//! Hand-written mock collaborators used by the test suites. Public so the
//! integration tests can wire a full service without a broker, a datastore or
//! a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::datastore::Datastore;
use crate::error::EncodeError;
use crate::models::Device;
use crate::moving_average::MovingAverager;
use crate::mqtt_module::{Connection, Connector, OnMessage};
use crate::pipeline::Processor;

/// A fake broker connection. Records subscribed topics and keeps hold of the
/// manager's message callback so tests can push incoming messages through it.
#[derive(Default)]
pub struct MockConnection {
    pub broker: String,
    topics: Mutex<HashSet<String>>,
    subscribe_calls: AtomicUsize,
    disconnected: AtomicBool,
    fail_subscribe: AtomicBool,
    on_message: Mutex<Option<OnMessage>>,
}

impl MockConnection {
    /// Topics currently subscribed on this connection.
    pub fn topics(&self) -> HashSet<String> {
        self.topics.lock().clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Deliver a message as the broker would.
    pub fn push_message(&self, topic: &str, payload: &[u8]) {
        if let Some(on_message) = &*self.on_message.lock() {
            on_message(topic, payload);
        }
    }
}

impl Connection for Arc<MockConnection> {
    fn subscribe(&self, topic: &str) -> Result<(), EncodeError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(EncodeError::Unavailable("subscribe refused".to_string()));
        }
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), EncodeError> {
        self.topics.lock().remove(topic);
        Ok(())
    }

    fn disconnect(&self, _grace: Duration) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.topics.lock().clear();
    }
}

/// A fake connector handing out `MockConnection`s instead of real broker
/// clients.
#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    fail_connect: AtomicBool,
}

impl MockConnector {
    pub fn new() -> MockConnector {
        MockConnector::default()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    /// All topics subscribed across every connection, for asserting the
    /// one-subscription-per-device invariant.
    pub fn subscribed_topics(&self) -> HashSet<String> {
        let mut all = HashSet::new();
        for conn in self.connections.lock().iter() {
            all.extend(conn.topics());
        }
        all
    }
}

impl Connector for Arc<MockConnector> {
    fn connect(&self, broker: &str, on_message: OnMessage) -> Result<Box<dyn Connection>, EncodeError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EncodeError::Unavailable(
                "broker connection refused".to_string(),
            ));
        }

        let connection = Arc::new(MockConnection {
            broker: broker.to_string(),
            ..MockConnection::default()
        });
        *connection.on_message.lock() = Some(on_message);

        self.connections.lock().push(connection.clone());
        Ok(Box::new(connection))
    }
}

/// A recorded datastore write.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub community_id: String,
    pub device_token: String,
    pub data: Vec<u8>,
}

/// A fake datastore recording writes; individual communities can be scripted
/// to fail.
#[derive(Default)]
pub struct MockDatastore {
    writes: Mutex<Vec<RecordedWrite>>,
    failing: Mutex<HashSet<String>>,
}

impl MockDatastore {
    pub fn new() -> MockDatastore {
        MockDatastore::default()
    }

    /// Make writes for the given community fail from now on.
    pub fn fail_for(&self, community_id: &str) {
        self.failing.lock().insert(community_id.to_string());
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl Datastore for MockDatastore {
    async fn write_data(
        &self,
        community_id: &str,
        device_token: &str,
        data: &[u8],
    ) -> Result<(), EncodeError> {
        if self.failing.lock().contains(community_id) {
            return Err(EncodeError::DatastoreFailed(
                "scripted datastore failure".to_string(),
            ));
        }

        self.writes.lock().push(RecordedWrite {
            community_id: community_id.to_string(),
            device_token: device_token.to_string(),
            data: data.to_vec(),
        });

        Ok(())
    }
}

/// A fake moving averager. By default it echoes the value it was given;
/// exact-argument expectations can be registered for canned means.
#[derive(Default)]
pub struct MockAverager {
    canned: Mutex<HashMap<String, f64>>,
    calls: AtomicUsize,
}

impl MockAverager {
    pub fn new() -> MockAverager {
        MockAverager::default()
    }

    /// Register a canned mean for an exact argument combination.
    pub fn expect(&self, value: f64, device_token: &str, sensor_id: u32, interval: u32, mean: f64) {
        self.canned
            .lock()
            .insert(call_key(value, device_token, sensor_id, interval), mean);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MovingAverager for MockAverager {
    fn moving_average(
        &self,
        value: f64,
        device_token: &str,
        sensor_id: u32,
        interval: u32,
    ) -> Result<f64, EncodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let canned = self.canned.lock();
        Ok(*canned
            .get(&call_key(value, device_token, sensor_id, interval))
            .unwrap_or(&value))
    }

    fn ping(&self) -> Result<(), EncodeError> {
        Ok(())
    }

    fn stop(&self) {}
}

fn call_key(value: f64, device_token: &str, sensor_id: u32, interval: u32) -> String {
    format!("{}:{}:{}:{}", value, device_token, sensor_id, interval)
}

/// A fake processor recording the payloads it was handed.
#[derive(Default)]
pub struct MockProcessor {
    processed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockProcessor {
    pub fn new() -> MockProcessor {
        MockProcessor::default()
    }

    pub fn processed(&self) -> Vec<(String, Vec<u8>)> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn process(&self, device: &Device, payload: &[u8]) -> Result<(), EncodeError> {
        self.processed
            .lock()
            .push((device.device_token.clone(), payload.to_vec()));
        Ok(())
    }
}
