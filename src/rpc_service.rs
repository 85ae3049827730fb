use std::sync::Arc;

use tokio::runtime::Handle;

use crate::db_module::Registry;
use crate::error::EncodeError;
use crate::models::{self, NewDevice, NewStream};
use crate::mqtt_module::{MessageHandler, MqttClient};
use crate::pipeline::Processor;
use crate::rpc_messages::{
    Action, CreateStreamRequest, CreateStreamResponse, DeleteStreamRequest, DeleteStreamResponse,
    Exposure, Location, Operation,
};

/// EncoderService implements the two control RPCs. It validates requests,
/// mutates the registry and reconciles the subscription manager, and owns the
/// message handler gluing MQTT deliveries to the ingestion pipeline.
pub struct EncoderService {
    registry: Arc<Registry>,
    mqtt: Arc<dyn MqttClient>,
    processor: Arc<dyn Processor>,
    broker_addr: String,
    verbose: bool,
    runtime: Handle,
}

impl EncoderService {
    /// Must be called from within a tokio runtime; incoming MQTT messages are
    /// dispatched onto it.
    pub fn new(
        registry: Arc<Registry>,
        mqtt: Arc<dyn MqttClient>,
        processor: Arc<dyn Processor>,
        broker_addr: &str,
        verbose: bool,
    ) -> EncoderService {
        info!("creating encoder service");

        EncoderService {
            registry,
            mqtt,
            processor,
            broker_addr: broker_addr.to_string(),
            verbose,
            runtime: Handle::current(),
        }
    }

    /// Rebuild MQTT subscriptions for every device in the registry. Called at
    /// startup; individual subscription failures are logged but do not abort.
    pub fn start(&self) -> Result<(), EncodeError> {
        info!("creating existing subscriptions");

        let devices = self.registry.get_devices()?;
        for device in devices {
            debug!(
                "creating subscription for device {} on {}",
                device.device_token, self.broker_addr
            );

            if let Err(e) = self.mqtt.subscribe(
                &self.broker_addr,
                &device.device_token,
                self.message_handler(),
            ) {
                error!(
                    "failed to subscribe for device {}: {}",
                    device.device_token, e
                );
            }
        }

        Ok(())
    }

    /// Validate the request, write the stream to the registry and subscribe
    /// to the device topic. If the subscription fails after the registry
    /// commit the write is kept (the startup resubscribe pass heals it) and
    /// the call fails with `Internal`.
    pub fn create_stream(
        &self,
        req: &CreateStreamRequest,
    ) -> Result<CreateStreamResponse, EncodeError> {
        validate_create_request(req)?;

        let new_stream = new_stream_from_request(req)?;
        let created = self.registry.create_stream(&new_stream)?;

        self.mqtt
            .subscribe(
                &self.broker_addr,
                &req.device_token,
                self.message_handler(),
            )
            .map_err(|e| EncodeError::Internal(format!("failed to subscribe: {}", e)))?;

        Ok(CreateStreamResponse {
            stream_uid: created.stream_id,
            token: created.token,
        })
    }

    /// Validate the request and delete the stream. When the registry reports
    /// the device itself was removed, the device topic is unsubscribed.
    pub fn delete_stream(
        &self,
        req: &DeleteStreamRequest,
    ) -> Result<DeleteStreamResponse, EncodeError> {
        validate_delete_request(req)?;

        let deleted_device = self.registry.delete_stream(&req.stream_uid, &req.token)?;

        if let Some(device_token) = deleted_device {
            self.mqtt
                .unsubscribe(&self.broker_addr, &device_token)
                .map_err(|e| EncodeError::Internal(format!("failed to unsubscribe: {}", e)))?;
        }

        Ok(DeleteStreamResponse {})
    }

    /// Handler invoked by the subscription manager for every delivered
    /// message. Runs on the broker-client thread, so it only spawns a task
    /// onto the runtime: the task loads the device with its streams and hands
    /// both to the pipeline.
    pub fn message_handler(&self) -> MessageHandler {
        let registry = self.registry.clone();
        let processor = self.processor.clone();
        let runtime = self.runtime.clone();
        let verbose = self.verbose;

        Arc::new(move |device_token: &str, payload: &[u8]| {
            if verbose {
                debug!(
                    "received data for device {}: {}",
                    device_token,
                    String::from_utf8_lossy(payload)
                );
            }

            let registry = registry.clone();
            let processor = processor.clone();
            let device_token = device_token.to_string();
            let payload = payload.to_vec();

            runtime.spawn(async move {
                let device = match registry.get_device_by_token(&device_token) {
                    Ok(device) => device,
                    Err(e) => {
                        error!("failed to get device {}: {}", device_token, e);
                        return;
                    }
                };

                if let Err(e) = processor.process(&device, &payload).await {
                    error!("failed to process payload for {}: {}", device_token, e);
                }
            });
        })
    }
}

/// Check the create request for missing or out-of-range fields. The order is
/// stable; the first failure wins.
fn validate_create_request(req: &CreateStreamRequest) -> Result<(), EncodeError> {
    if req.device_token.is_empty() {
        return Err(EncodeError::required_argument("device_token"));
    }

    if req.community_id.is_empty() {
        return Err(EncodeError::required_argument("community_id"));
    }

    if req.recipient_public_key.is_empty() {
        return Err(EncodeError::required_argument("recipient_public_key"));
    }

    let location = match &req.location {
        Some(location) => location,
        None => return Err(EncodeError::required_argument("location")),
    };

    if location.longitude == 0.0 {
        return Err(EncodeError::required_argument("longitude"));
    }

    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(EncodeError::invalid_argument(
            "longitude",
            "must be between -180 and 180",
        ));
    }

    if location.latitude == 0.0 {
        return Err(EncodeError::required_argument("latitude"));
    }

    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(EncodeError::invalid_argument(
            "latitude",
            "must be between -90 and 90",
        ));
    }

    Ok(())
}

fn validate_delete_request(req: &DeleteStreamRequest) -> Result<(), EncodeError> {
    if req.stream_uid.is_empty() {
        return Err(EncodeError::required_argument("stream_uid"));
    }

    if req.token.is_empty() {
        return Err(EncodeError::required_argument("token"));
    }

    Ok(())
}

/// Convert the validated request into the registry's input type.
fn new_stream_from_request(req: &CreateStreamRequest) -> Result<NewStream, EncodeError> {
    let mut operations = Vec::with_capacity(req.operations.len());
    for operation in &req.operations {
        operations.push(operation_from_request(operation)?);
    }

    let location = req.location.unwrap_or(Location {
        longitude: 0.0,
        latitude: 0.0,
    });

    let exposure = match Exposure::try_from(req.exposure) {
        Ok(Exposure::Indoor) => models::Exposure::Indoor,
        Ok(Exposure::Outdoor) => models::Exposure::Outdoor,
        _ => models::Exposure::Unknown,
    };

    Ok(NewStream {
        device: NewDevice {
            device_token: req.device_token.clone(),
            label: if req.device_label.is_empty() {
                None
            } else {
                Some(req.device_label.clone())
            },
            longitude: location.longitude,
            latitude: location.latitude,
            exposure,
        },
        community_id: req.community_id.clone(),
        public_key: req.recipient_public_key.clone(),
        operations,
    })
}

fn operation_from_request(op: &Operation) -> Result<models::Operation, EncodeError> {
    if op.sensor_id == 0 {
        return Err(EncodeError::invalid_argument(
            "operations",
            "require a non-zero sensor id",
        ));
    }

    match Action::try_from(op.action) {
        Ok(Action::Share) => Ok(models::Operation::Share {
            sensor_id: op.sensor_id,
        }),
        Ok(Action::Bin) => {
            if op.bins.is_empty() {
                return Err(EncodeError::invalid_argument(
                    "operations",
                    "binning requires a non-empty list of bins",
                ));
            }
            Ok(models::Operation::Bin {
                sensor_id: op.sensor_id,
                bins: op.bins.clone(),
            })
        }
        Ok(Action::MovingAvg) => {
            if op.interval == 0 {
                return Err(EncodeError::invalid_argument(
                    "operations",
                    "moving average requires a non-zero interval",
                ));
            }
            Ok(models::Operation::MovingAvg {
                sensor_id: op.sensor_id,
                interval: op.interval,
            })
        }
        Err(_) => Err(EncodeError::invalid_argument(
            "operations",
            "unknown action",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::mocks::{MockConnector, MockProcessor};
    use crate::mqtt_module::SubscriptionManager;
    use std::collections::HashSet;
    use std::time::Duration;

    const BROKER: &str = "tcp://broker:1883";

    struct Fixture {
        connector: Arc<MockConnector>,
        registry: Arc<Registry>,
        processor: Arc<MockProcessor>,
        service: EncoderService,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::open(":memory:", "secret password").unwrap());
        registry.migrate_up().unwrap();

        let connector = Arc::new(MockConnector::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let mqtt = Arc::new(SubscriptionManager::new(
            Box::new(connector.clone()),
            metrics,
        ));
        let processor = Arc::new(MockProcessor::new());

        let service = EncoderService::new(
            registry.clone(),
            mqtt,
            processor.clone(),
            BROKER,
            false,
        );

        Fixture {
            connector,
            registry,
            processor,
            service,
        }
    }

    fn create_request(device_token: &str, community_id: &str) -> CreateStreamRequest {
        CreateStreamRequest {
            device_token: device_token.to_string(),
            community_id: community_id.to_string(),
            recipient_public_key: "PK1".to_string(),
            location: Some(Location {
                longitude: -0.024,
                latitude: 54.24,
            }),
            exposure: Exposure::Indoor as i32,
            device_label: String::new(),
            operations: vec![],
        }
    }

    fn assert_invalid_field(err: EncodeError, expected: &str) {
        match err {
            EncodeError::InvalidArgument { field, .. } => assert_eq!(field, expected),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn validation_order_is_stable() {
        let fixture = fixture();

        let mut req = CreateStreamRequest::default();
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "device_token");

        req.device_token = "abc123".to_string();
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "community_id");

        req.community_id = "c1".to_string();
        assert_invalid_field(
            fixture.service.create_stream(&req).unwrap_err(),
            "recipient_public_key",
        );

        req.recipient_public_key = "PK1".to_string();
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "location");

        req.location = Some(Location {
            longitude: 0.0,
            latitude: 54.24,
        });
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "longitude");

        req.location = Some(Location {
            longitude: 181.0,
            latitude: 54.24,
        });
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "longitude");

        req.location = Some(Location {
            longitude: -0.024,
            latitude: 0.0,
        });
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "latitude");

        req.location = Some(Location {
            longitude: -0.024,
            latitude: -91.0,
        });
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "latitude");
    }

    #[tokio::test]
    async fn operations_are_validated() {
        let fixture = fixture();

        let mut req = create_request("abc123", "c1");
        req.operations = vec![Operation {
            sensor_id: 0,
            action: Action::Share as i32,
            bins: vec![],
            interval: 0,
        }];
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "operations");

        req.operations = vec![Operation {
            sensor_id: 29,
            action: Action::Bin as i32,
            bins: vec![],
            interval: 0,
        }];
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "operations");

        req.operations = vec![Operation {
            sensor_id: 12,
            action: Action::MovingAvg as i32,
            bins: vec![],
            interval: 0,
        }];
        assert_invalid_field(fixture.service.create_stream(&req).unwrap_err(), "operations");
    }

    #[tokio::test]
    async fn create_registers_and_subscribes() {
        let fixture = fixture();

        let resp = fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap();
        assert!(!resp.stream_uid.is_empty());
        assert!(!resp.token.is_empty());

        assert_eq!(
            fixture.connector.subscribed_topics(),
            HashSet::from(["device/sck/abc123/readings".to_string()])
        );

        let device = fixture.registry.get_device_by_token("abc123").unwrap();
        assert_eq!(device.streams.len(), 1);
        assert_eq!(device.streams[0].community_id, "c1");
    }

    #[tokio::test]
    async fn duplicate_create_is_already_registered() {
        let fixture = fixture();

        fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap();
        let err = fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap_err();
        assert!(matches!(err, EncodeError::AlreadyRegistered));

        assert_eq!(fixture.registry.count_streams().unwrap(), 1);
    }

    #[tokio::test]
    async fn subscription_failure_keeps_the_registry_write() {
        let fixture = fixture();
        fixture.connector.set_fail_connect(true);

        let err = fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap_err();
        assert!(matches!(err, EncodeError::Internal(_)));

        // the stream is persisted; the startup resubscribe pass heals it
        let device = fixture.registry.get_device_by_token("abc123").unwrap();
        assert_eq!(device.streams.len(), 1);

        fixture.connector.set_fail_connect(false);
        fixture.service.start().unwrap();
        assert_eq!(
            fixture.connector.subscribed_topics(),
            HashSet::from(["device/sck/abc123/readings".to_string()])
        );
    }

    #[tokio::test]
    async fn delete_of_last_stream_unsubscribes() {
        let fixture = fixture();

        let resp = fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap();

        fixture
            .service
            .delete_stream(&DeleteStreamRequest {
                stream_uid: resp.stream_uid,
                token: resp.token,
            })
            .unwrap();

        assert!(fixture.connector.subscribed_topics().is_empty());
        assert!(matches!(
            fixture.registry.get_device_by_token("abc123").unwrap_err(),
            EncodeError::NotFound
        ));
    }

    #[tokio::test]
    async fn delete_keeps_subscription_while_streams_remain() {
        let fixture = fixture();

        let first = fixture
            .service
            .create_stream(&create_request("foo", "c1"))
            .unwrap();
        fixture
            .service
            .create_stream(&create_request("foo", "c2"))
            .unwrap();

        fixture
            .service
            .delete_stream(&DeleteStreamRequest {
                stream_uid: first.stream_uid,
                token: first.token,
            })
            .unwrap();

        assert_eq!(
            fixture.connector.subscribed_topics(),
            HashSet::from(["device/sck/foo/readings".to_string()])
        );
    }

    #[tokio::test]
    async fn delete_validates_and_authenticates() {
        let fixture = fixture();

        let err = fixture
            .service
            .delete_stream(&DeleteStreamRequest::default())
            .unwrap_err();
        assert_invalid_field(err, "stream_uid");

        let resp = fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap();

        let err = fixture
            .service
            .delete_stream(&DeleteStreamRequest {
                stream_uid: resp.stream_uid,
                token: "wrong".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, EncodeError::NotFound));

        // the stream is still there
        assert_eq!(fixture.registry.count_streams().unwrap(), 1);
    }

    #[tokio::test]
    async fn restart_creates_one_subscription_per_device() {
        let fixture = fixture();

        // two streams for the same device, different communities
        fixture
            .service
            .create_stream(&create_request("foo", "c1"))
            .unwrap();
        fixture
            .service
            .create_stream(&create_request("foo", "c2"))
            .unwrap();

        // simulate a restart with a fresh manager over the same registry
        let connector = Arc::new(MockConnector::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let mqtt = Arc::new(SubscriptionManager::new(
            Box::new(connector.clone()),
            metrics,
        ));
        let service = EncoderService::new(
            fixture.registry.clone(),
            mqtt.clone(),
            Arc::new(MockProcessor::new()),
            BROKER,
            false,
        );

        service.start().unwrap();

        assert_eq!(mqtt.subscription_count(), 1);
        assert_eq!(
            connector.subscribed_topics(),
            HashSet::from(["device/sck/foo/readings".to_string()])
        );
    }

    #[tokio::test]
    async fn delivered_messages_reach_the_processor() {
        let fixture = fixture();

        fixture
            .service
            .create_stream(&create_request("abc123", "c1"))
            .unwrap();

        let payload = br#"{"data":[{"recorded_at":"2018-12-11T14:46:44Z","sensors":[]}]}"#;
        fixture.connector.connections()[0].push_message("device/sck/abc123/readings", payload);

        // processing happens on a spawned task
        for _ in 0..100 {
            if !fixture.processor.processed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let processed = fixture.processor.processed();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].0, "abc123");
        assert_eq!(processed[0].1, payload.to_vec());
    }
}
