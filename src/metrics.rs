use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::error::EncodeError;
use crate::version;

/// All collectors the service records into, registered against a registry
/// owned by this struct. Components receive an `Arc<Metrics>` at construction
/// instead of reaching into a process-global registry.
pub struct Metrics {
    registry: Registry,

    /// Count of MQTT messages received.
    pub messages_received: IntCounter,

    /// Count of errors while processing the pipeline, labelled by cause.
    pub pipeline_errors: IntCounterVec,

    /// Duration distribution of successful datastore writes.
    pub datastore_writes: Histogram,

    /// Duration distribution of envelope encryption.
    pub encryption_time: Histogram,

    /// Count of current streams in the database.
    pub streams: IntGauge,

    /// Information about the current build of the service.
    pub build_info: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Metrics, EncodeError> {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "encoder_messages_received",
            "Count of MQTT messages received",
        ))?;

        let pipeline_errors = IntCounterVec::new(
            Opts::new(
                "encoder_pipeline_errors",
                "Count of errors while processing the pipeline",
            ),
            &["cause"],
        )?;

        let datastore_writes = Histogram::with_opts(HistogramOpts::new(
            "encoder_datastore_write_seconds",
            "Datastore write duration distribution",
        ))?;

        let encryption_time = Histogram::with_opts(HistogramOpts::new(
            "encoder_encryption_seconds",
            "Envelope encryption duration distribution",
        ))?;

        let streams = IntGauge::with_opts(Opts::new(
            "encoder_stream_gauge",
            "Count of current streams in the database",
        ))?;

        let build_info = IntGaugeVec::new(
            Opts::new(
                "encoder_build_info",
                "Information about the current build of the service",
            ),
            &["name", "version"],
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(pipeline_errors.clone()))?;
        registry.register(Box::new(datastore_writes.clone()))?;
        registry.register(Box::new(encryption_time.clone()))?;
        registry.register(Box::new(streams.clone()))?;
        registry.register(Box::new(build_info.clone()))?;

        build_info
            .with_label_values(&[version::BINARY_NAME, version::VERSION])
            .set(1);

        Ok(Metrics {
            registry,
            messages_received,
            pipeline_errors,
            datastore_writes,
            encryption_time,
            streams,
            build_info,
        })
    }

    /// Record a pipeline failure under the given cause label.
    pub fn pipeline_error(&self, cause: &str) {
        self.pipeline_errors.with_label_values(&[cause]).inc();
    }

    /// Render every registered collector in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, EncodeError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EncodeError::Internal(e.to_string()))
    }
}
