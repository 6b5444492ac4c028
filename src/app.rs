//! Core application runner for `gmc-logger`.
//!
//! Kept apart from logging setup and process exit codes so the wiring can be
//! tested with a fake device and without a broker.

use crate::device::{Connector, DeviceError, GmcDriver};
use crate::output::gmcmap::{GmcMapOptions, GmcMapPublisher};
use crate::output::influxdb::{InfluxDbPublisher, InfluxOptions};
use crate::output::mqtt::{MqttOptions, MqttPublisher, MqttSetupError};
use crate::output::{PublishError, Publisher};
use crate::poller::{PollError, Poller};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Serial port settings.
#[derive(Args, Debug, Clone)]
pub struct DeviceOptions {
    /// Serial device the Geiger counter is attached to
    #[arg(long, env = "SERIAL_PORT", default_value = "/dev/ttyUSB_RAD")]
    pub serial_port: String,

    /// Baud rate (8N1 is always used)
    #[arg(long, env = "SERIAL_BAUD", default_value_t = 115_200)]
    pub serial_baud: u32,

    /// Read timeout for a single response
    #[arg(long, env = "SERIAL_TIMEOUT", default_value = "1s", value_parser = crate::duration::parse_positive_duration)]
    pub serial_timeout: Duration,
}

/// Configuration for the logger.
///
/// Every option can be given as a flag or through its environment variable.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    #[command(flatten)]
    pub device: DeviceOptions,

    /// Interval between polls.
    /// Accepts duration with suffix: 30s, 1m, 500ms. Without suffix, seconds.
    #[arg(long, env = "POLLING_RATE", default_value = "60", value_parser = crate::duration::parse_positive_duration)]
    pub polling_rate: Duration,

    /// Report CPM to GMCmap
    #[arg(long, env = "ENABLE_GMC_MAP", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub enable_gmc_map: bool,

    /// Publish to MQTT with Home Assistant discovery
    #[arg(long, env = "ENABLE_MQTT", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub enable_mqtt: bool,

    /// Write readings to InfluxDB
    #[arg(long, env = "ENABLE_INFLUX", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub enable_influx: bool,

    #[command(flatten)]
    pub gmc_map: GmcMapOptions,

    #[command(flatten)]
    pub mqtt: MqttOptions,

    #[command(flatten)]
    pub influx: InfluxOptions,

    /// Verbose output, log every fetched value
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors that stop the logger.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Mqtt(#[from] MqttSetupError),
    #[error("unable to set up publisher: {0}")]
    Publisher(#[from] PublishError),
    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Open the device once. Failing here is fatal; later failures are
/// recovered by the poller.
pub fn open_device<C: Connector>(connector: C) -> Result<Arc<GmcDriver<C>>, RunError> {
    let driver = GmcDriver::new(connector);
    driver.open()?;
    info!(port = driver.connector().endpoint(), "device connected");
    Ok(Arc::new(driver))
}

/// Build the enabled publishers in reporting order: GMCmap, MQTT, InfluxDB.
pub async fn build_publishers(options: &Options) -> Result<Vec<Box<dyn Publisher>>, RunError> {
    let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();

    if options.enable_gmc_map {
        publishers.push(Box::new(GmcMapPublisher::new(options.gmc_map.clone())?));
    }
    if options.enable_mqtt {
        publishers.push(Box::new(MqttPublisher::connect(&options.mqtt).await?));
    }
    if options.enable_influx {
        publishers.push(Box::new(InfluxDbPublisher::new(options.influx.clone())?));
    }

    let names: Vec<_> = publishers.iter().map(|p| p.name()).collect();
    info!(?names, "publishers enabled");
    Ok(publishers)
}

/// Poll until `shutdown` resolves, then release publishers and the device.
pub async fn poll<C, F>(
    driver: Arc<GmcDriver<C>>,
    publishers: Vec<Box<dyn Publisher>>,
    interval: Duration,
    shutdown: F,
) -> Result<(), RunError>
where
    C: Connector + 'static,
    F: Future<Output = ()>,
{
    let poller = Poller::new(driver, publishers, interval);
    let result = poller.run_until(shutdown).await;

    poller.close().await;
    poller.driver().close();
    info!("device closed");

    result.map_err(RunError::from)
}

/// Run the logger against the configured serial port.
///
/// # Errors
/// Returns `RunError` if the device cannot be opened or a publisher cannot
/// be set up.
#[cfg(feature = "serial")]
pub async fn run<F>(options: Options, shutdown: F) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    use crate::device::serial::SerialConnector;

    let connector = SerialConnector::new(
        options.device.serial_port.clone(),
        options.device.serial_baud,
        options.device.serial_timeout,
    );
    let driver = open_device(connector)?;
    let publishers = build_publishers(&options).await?;

    poll(driver, publishers, options.polling_rate, shutdown).await
}
