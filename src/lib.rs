//! Stream encoder service.
//!
//! Sits between a fleet of sensor devices publishing readings over MQTT and a
//! downstream encrypted datastore. For every registered stream the service
//! subscribes to the device topic, enriches incoming payloads with sensor
//! metadata, applies the per-sensor operations the stream declares, encrypts
//! the result toward the recipient community's public key and writes the
//! ciphertext to the datastore.

#[macro_use]
extern crate log;

pub mod clock;
pub mod config;
pub mod datastore;
pub mod db_module;
pub mod encrypt;
pub mod error;
pub mod metrics;
pub mod mocks;
pub mod models;
pub mod moving_average;
pub mod mqtt_module;
pub mod pipeline;
pub mod rpc_messages;
pub mod rpc_service;
pub mod schema;
pub mod sensors;
pub mod server;
pub mod token;
pub mod transform;
pub mod version;
