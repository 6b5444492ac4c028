//! Sinks for Geiger counter readings.
//!
//! Every sink implements [`Publisher`]. The poller calls them one after the
//! other with the same [`Reading`]; a failing sink never blocks the others.

pub mod gmcmap;
pub mod influxdb;
pub mod mqtt;

use crate::reading::Reading;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error type for a single publish attempt.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Transport failure talking to an HTTP endpoint
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non-2xx status
    #[error("{sink} responded with status {status}")]
    Status {
        sink: &'static str,
        status: reqwest::StatusCode,
    },
    /// The MQTT client rejected the message
    #[error("MQTT publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Future returned by [`Publisher::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

/// A destination for readings.
pub trait Publisher: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Send one reading.
    ///
    /// Implementations decide what an offline reading means for them: sinks
    /// that record history skip it, status sinks report it.
    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a>;

    /// Release connections on shutdown.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}
