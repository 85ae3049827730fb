/// Name of the binary, used for the MQTT client id and the build info metric.
pub const BINARY_NAME: &str = "stream-encoder";

/// Crate version baked in at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Formatted version string suitable for displaying to the user.
pub fn version_string() -> String {
    format!("{} {}", BINARY_NAME, VERSION)
}
