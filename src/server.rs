use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::datastore::HttpDatastore;
use crate::db_module::Registry;
use crate::encrypt::EnvelopeEncryptor;
use crate::error::EncodeError;
use crate::metrics::Metrics;
use crate::moving_average::{InMemoryAverager, MovingAverager};
use crate::mqtt_module::{MqttClient, PahoConnector, SubscriptionManager};
use crate::pipeline::Pipeline;
use crate::rpc_messages::{CreateStreamRequest, DeleteStreamRequest};
use crate::rpc_service::EncoderService;
use crate::sensors::SensorCatalog;
use crate::transform::Transformer;
use crate::version;

/// Total time spent retrying the initial registry connection before the
/// process gives up and exits non-zero.
const REGISTRY_CONNECT_TOTAL: Duration = Duration::from_secs(120);

/// Longest single delay between registry connection attempts.
const REGISTRY_CONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Interval of the stream gauge refresh.
const STREAM_GAUGE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EncoderService>,
    pub registry: Arc<Registry>,
    pub averager: Arc<dyn MovingAverager>,
    pub metrics: Arc<Metrics>,
}

/// Build the HTTP surface: the two twirp methods, the pulse endpoint for
/// load balancers, and the metrics endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/twirp/encoder.Encoder/CreateStream",
            post(create_stream_handler),
        )
        .route(
            "/twirp/encoder.Encoder/DeleteStream",
            post(delete_stream_handler),
        )
        .route("/pulse", get(pulse_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Server is our top level type; it contains all other components and is
/// responsible for starting and stopping them in the correct order.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server { config }
    }

    /// Start every component in order, serve until a shutdown signal arrives
    /// and then stop the components in reverse.
    pub async fn run(self) -> Result<(), EncodeError> {
        let config = self.config;

        let metrics = Arc::new(Metrics::new()?);

        let registry = Arc::new(
            open_registry_with_backoff(&config.database_url, &config.encryption_password).await?,
        );
        registry.migrate_up()?;

        let averager: Arc<dyn MovingAverager> =
            Arc::new(InMemoryAverager::new(Arc::new(SystemClock), config.verbose));
        averager.ping()?;

        let catalog = SensorCatalog::load()?;
        info!("loaded {} sensor definitions", catalog.len());

        let transformer = Transformer::new(catalog, averager.clone());
        let datastore = Arc::new(HttpDatastore::new(&config.datastore_addr)?);
        let pipeline = Arc::new(Pipeline::new(
            transformer,
            Arc::new(EnvelopeEncryptor::new()),
            datastore,
            metrics.clone(),
            config.verbose,
        ));

        let connector = Box::new(PahoConnector::new(&config.broker_username));
        let mqtt = Arc::new(SubscriptionManager::new(connector, metrics.clone()));

        let service = Arc::new(EncoderService::new(
            registry.clone(),
            mqtt.clone(),
            pipeline,
            &config.broker_addr,
            config.verbose,
        ));

        // recreate subscriptions for everything already registered
        service.start()?;

        let gauge_task = tokio::spawn(record_stream_gauge(registry.clone(), metrics.clone()));

        if !config.domains.is_empty() {
            warn!(
                "TLS requested for {:?}; certificate provisioning is delegated to the fronting issuer backed by the certificate cache",
                config.domains
            );
        }

        info!(
            "starting server, version: {}, listenAddr: {}, datastore: {}, mqttBroker: {}",
            version::VERSION,
            config.listen_addr,
            config.datastore_addr,
            config.broker_addr
        );

        let state = AppState {
            service,
            registry,
            averager: averager.clone(),
            metrics,
        };

        let listener = tokio::net::TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| {
                EncodeError::Internal(format!("failed to bind {}: {}", config.listen_addr, e))
            })?;

        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| EncodeError::Internal(format!("server error: {}", e)))?;

        info!("stopping");
        gauge_task.abort();
        mqtt.stop();
        averager.stop();

        Ok(())
    }
}

/// Connect to the registry database, retrying with exponential backoff for a
/// bounded total duration.
async fn open_registry_with_backoff(
    database_url: &str,
    encryption_password: &str,
) -> Result<Registry, EncodeError> {
    let started = Instant::now();
    let mut delay = Duration::from_secs(1);

    loop {
        let result = Registry::open(database_url, encryption_password).and_then(|registry| {
            registry.ping()?;
            Ok(registry)
        });

        match result {
            Ok(registry) => {
                info!("connected to database");
                return Ok(registry);
            }
            Err(e) => {
                if started.elapsed() + delay > REGISTRY_CONNECT_TOTAL {
                    return Err(EncodeError::Unavailable(format!(
                        "giving up connecting to database: {}",
                        e
                    )));
                }
                warn!("failed to connect to database: {}, retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(REGISTRY_CONNECT_MAX_DELAY);
            }
        }
    }
}

async fn record_stream_gauge(registry: Arc<Registry>, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(STREAM_GAUGE_INTERVAL);

    loop {
        ticker.tick().await;
        match registry.count_streams() {
            Ok(count) => metrics.streams.set(count),
            Err(e) => warn!("error counting streams: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install interrupt handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install terminate handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal");
}

// Twirp framing: requests and responses are JSON or protobuf depending on
// content type, errors are always JSON `{code, msg}`.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Encoding {
    Json,
    Protobuf,
}

impl Encoding {
    fn content_type(&self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Protobuf => "application/protobuf",
        }
    }
}

fn request_encoding(headers: &HeaderMap) -> Result<Encoding, EncodeError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_else(|| "application/json".to_string());

    match content_type.as_str() {
        "application/json" | "" => Ok(Encoding::Json),
        "application/protobuf" => Ok(Encoding::Protobuf),
        other => Err(EncodeError::invalid_argument(
            "content-type",
            &format!("unsupported content type: {}", other),
        )),
    }
}

fn decode_request<T>(encoding: Encoding, body: &Bytes) -> Result<T, EncodeError>
where
    T: prost::Message + Default + DeserializeOwned,
{
    match encoding {
        Encoding::Json => serde_json::from_slice(body).map_err(|e| {
            EncodeError::invalid_argument("body", &format!("failed to decode request: {}", e))
        }),
        Encoding::Protobuf => T::decode(body.as_ref()).map_err(|e| {
            EncodeError::invalid_argument("body", &format!("failed to decode request: {}", e))
        }),
    }
}

fn encode_response<T>(encoding: Encoding, message: &T) -> Response
where
    T: prost::Message + Serialize,
{
    let body = match encoding {
        Encoding::Json => match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(e) => {
                return error_response(&EncodeError::Internal(format!(
                    "failed to encode response: {}",
                    e
                )))
            }
        },
        Encoding::Protobuf => message.encode_to_vec(),
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoding.content_type())],
        body,
    )
        .into_response()
}

fn error_status(err: &EncodeError) -> StatusCode {
    match err.twirp_code() {
        "invalid_argument" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "already_exists" => StatusCode::CONFLICT,
        "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &EncodeError) -> Response {
    let body = serde_json::json!({
        "code": err.twirp_code(),
        "msg": err.to_string(),
    });

    (
        error_status(err),
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn create_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let encoding = match request_encoding(&headers) {
        Ok(encoding) => encoding,
        Err(e) => return error_response(&e),
    };

    let request: CreateStreamRequest = match decode_request(encoding, &body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    match state.service.create_stream(&request) {
        Ok(response) => encode_response(encoding, &response),
        Err(e) => error_response(&e),
    }
}

async fn delete_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let encoding = match request_encoding(&headers) {
        Ok(encoding) => encoding,
        Err(e) => return error_response(&e),
    };

    let request: DeleteStreamRequest = match decode_request(encoding, &body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    match state.service.delete_stream(&request) {
        Ok(response) => encode_response(encoding, &response),
        Err(e) => error_response(&e),
    }
}

/// Returns 200 iff both the registry and the moving average store respond to
/// a ping, so a load balancer can verify the node end to end.
async fn pulse_handler(State(state): State<AppState>) -> Response {
    if state.registry.ping().is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to connect to database",
        )
            .into_response();
    }

    if state.averager.ping().is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to connect to moving average store",
        )
            .into_response();
    }

    (StatusCode::OK, "ok").into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_negotiation() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_encoding(&headers).unwrap(), Encoding::Json);

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(request_encoding(&headers).unwrap(), Encoding::Json);

        headers.insert(
            header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert_eq!(request_encoding(&headers).unwrap(), Encoding::Json);

        headers.insert(
            header::CONTENT_TYPE,
            "application/protobuf".parse().unwrap(),
        );
        assert_eq!(request_encoding(&headers).unwrap(), Encoding::Protobuf);

        headers.insert(header::CONTENT_TYPE, "text/html".parse().unwrap());
        assert!(request_encoding(&headers).is_err());
    }

    #[test]
    fn error_statuses_follow_twirp_mapping() {
        assert_eq!(
            error_status(&EncodeError::required_argument("device_token")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&EncodeError::NotFound),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&EncodeError::AlreadyRegistered),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&EncodeError::Unavailable("db".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&EncodeError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
