use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// ENV for the RPC listener bind address
pub const ENV_LISTEN_ADDR: &str = "ENCODER_LISTEN_ADDR";
/// ENV for the registry connection string
pub const ENV_DATABASE_URL: &str = "ENCODER_DATABASE_URL";
/// ENV for the symmetric key protecting delete tokens at rest
pub const ENV_ENCRYPTION_PASSWORD: &str = "ENCODER_ENCRYPTION_PASSWORD";
/// ENV for the downstream datastore URL
pub const ENV_DATASTORE_ADDR: &str = "ENCODER_DATASTORE_ADDR";
/// ENV for the MQTT broker endpoint
pub const ENV_BROKER_ADDR: &str = "ENCODER_BROKER_ADDR";
/// ENV for the MQTT broker credential
pub const ENV_BROKER_USERNAME: &str = "ENCODER_BROKER_USERNAME";
/// ENV for the comma separated TLS hostnames
pub const ENV_DOMAINS: &str = "ENCODER_DOMAINS";
/// ENV for verbose logging
pub const ENV_VERBOSE: &str = "ENCODER_VERBOSE";

/// Default RPC listener bind address
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8081";
/// Default registry database path
const DEFAULT_DATABASE_URL: &str = "encoder.db";
/// Default datastore address
const DEFAULT_DATASTORE_ADDR: &str = "http://localhost:8080";
/// Default MQTT broker address
const DEFAULT_BROKER_ADDR: &str = "tcp://mqtt.smartcitizen.me:1883";

/// Structure used to parse the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for the RPC listener.
    pub listen_addr: String,
    /// Registry connection string.
    pub database_url: String,
    /// Symmetric key for at-rest token encryption.
    pub encryption_password: String,
    /// Downstream datastore URL.
    pub datastore_addr: String,
    /// MQTT broker endpoint.
    pub broker_addr: String,
    /// MQTT broker credential.
    pub broker_username: String,
    /// If non-empty, hostnames for which certificates are provisioned via
    /// the certificate cache.
    pub domains: Vec<String>,
    /// Increases log verbosity.
    pub verbose: bool,
}

/// Default implementation reads overrides from the environment, so a config
/// file is optional in containerized deployments.
impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: env::var(ENV_LISTEN_ADDR)
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            database_url: env::var(ENV_DATABASE_URL)
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            encryption_password: env::var(ENV_ENCRYPTION_PASSWORD).unwrap_or_default(),
            datastore_addr: env::var(ENV_DATASTORE_ADDR)
                .unwrap_or_else(|_| DEFAULT_DATASTORE_ADDR.to_string()),
            broker_addr: env::var(ENV_BROKER_ADDR)
                .unwrap_or_else(|_| DEFAULT_BROKER_ADDR.to_string()),
            broker_username: env::var(ENV_BROKER_USERNAME).unwrap_or_default(),
            domains: env::var(ENV_DOMAINS)
                .map(|v| {
                    v.split(',')
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            verbose: env::var(ENV_VERBOSE)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Configuration file "encoder.toml" is located at ./config/.
/// Tries to load the configuration file, falling back to defaults (and with
/// them, the environment overrides).
pub fn load_config_file() -> Config {
    let config_path = config_file_path();
    match confy::load_path(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                "unable to load config file {}: {}, using defaults",
                config_path.display(),
                e
            );
            Config::default()
        }
    }
}

fn config_file_path() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config")
        .join("encoder.toml")
}
