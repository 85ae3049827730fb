use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::datastore::Datastore;
use crate::encrypt::{Encryptor, KeyMaterial};
use crate::error::EncodeError;
use crate::metrics::Metrics;
use crate::models::{Device, Stream};
use crate::transform::{self, RawReading, Transformer};

/// Processor handles all the streams of a device for one received payload:
/// applying each stream's operations, encrypting the result and writing the
/// ciphertext to the datastore.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, device: &Device, payload: &[u8]) -> Result<(), EncodeError>;
}

/// The ingestion pipeline. Per-stream failures are isolated: logged, counted
/// and skipped, so one stream cannot suppress delivery to another stream of
/// the same device.
pub struct Pipeline {
    transformer: Transformer,
    encryptor: Arc<dyn Encryptor>,
    datastore: Arc<dyn Datastore>,
    metrics: Arc<Metrics>,
    verbose: bool,
}

impl Pipeline {
    pub fn new(
        transformer: Transformer,
        encryptor: Arc<dyn Encryptor>,
        datastore: Arc<dyn Datastore>,
        metrics: Arc<Metrics>,
        verbose: bool,
    ) -> Pipeline {
        Pipeline {
            transformer,
            encryptor,
            datastore,
            metrics,
            verbose,
        }
    }

    async fn process_stream(
        &self,
        device: &Device,
        stream: &Stream,
        reading: &RawReading,
    ) -> Result<(), EncodeError> {
        let document = self.transformer.transform(device, stream, reading)?;
        let plaintext = serde_json::to_vec(&document)
            .map_err(|e| EncodeError::Internal(format!("failed to encode document: {}", e)))?;

        let key_material = KeyMaterial {
            device_token: device.device_token.clone(),
            community_id: stream.community_id.clone(),
            community_public_key: stream.public_key.clone(),
        };

        let start = Instant::now();
        let ciphertext = self.encryptor.encrypt(&plaintext, &key_material)?;
        self.metrics
            .encryption_time
            .observe(start.elapsed().as_secs_f64());

        if self.verbose {
            debug!(
                "writing data for community {}: {}",
                stream.community_id,
                String::from_utf8_lossy(&plaintext)
            );
        }

        let start = Instant::now();
        self.datastore
            .write_data(&stream.community_id, &device.device_token, &ciphertext)
            .await?;
        self.metrics
            .datastore_writes
            .observe(start.elapsed().as_secs_f64());

        Ok(())
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, device: &Device, payload: &[u8]) -> Result<(), EncodeError> {
        if payload.is_empty() {
            self.metrics.pipeline_error("emptyBody");
            return Err(EncodeError::MalformedPayload(
                "empty payload received".to_string(),
            ));
        }

        let reading = transform::parse_payload(payload).map_err(|e| {
            self.metrics.pipeline_error("unmarshalPayload");
            e
        })?;

        for stream in &device.streams {
            if let Err(e) = self.process_stream(device, stream, &reading).await {
                let cause = match &e {
                    EncodeError::EncryptionFailed(_) => "encryption",
                    EncodeError::DatastoreFailed(_) => "datastore",
                    _ => "processing",
                };
                self.metrics.pipeline_error(cause);
                error!(
                    "failed to process stream for community {}: {}",
                    stream.community_id, e
                );
            }
        }

        Ok(())
    }
}
