use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::error::EncodeError;

/// Request timeout for datastore writes.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Datastore is the downstream encrypted-event sink. The encoder treats it as
/// an opaque write-only collaborator; failures are counted by the pipeline
/// and the event is dropped.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn write_data(
        &self,
        community_id: &str,
        device_token: &str,
        data: &[u8],
    ) -> Result<(), EncodeError>;
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    community_id: &'a str,
    device_token: &'a str,
    data: String,
}

/// HTTP client for the datastore's WriteData RPC.
pub struct HttpDatastore {
    client: reqwest::Client,
    write_url: String,
}

impl HttpDatastore {
    pub fn new(addr: &str) -> Result<HttpDatastore, EncodeError> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(|e| EncodeError::Internal(format!("failed to build http client: {}", e)))?;

        Ok(HttpDatastore {
            client,
            write_url: format!(
                "{}/twirp/datastore.Datastore/WriteData",
                addr.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl Datastore for HttpDatastore {
    async fn write_data(
        &self,
        community_id: &str,
        device_token: &str,
        data: &[u8],
    ) -> Result<(), EncodeError> {
        let request = WriteRequest {
            community_id,
            device_token,
            data: STANDARD.encode(data),
        };

        let response = self
            .client
            .post(&self.write_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EncodeError::DatastoreFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EncodeError::DatastoreFailed(format!(
                "datastore returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}
