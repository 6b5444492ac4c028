//! Fixed-interval poll loop.
//!
//! One tick flushes the bus, fetches version, CPM and temperature, then hands
//! the resulting [`Reading`] to every publisher in order. Ticks never overlap:
//! the next one is not scheduled before the previous tick's last publisher
//! returns, which keeps at most one exchange in flight on the device.

use crate::device::{Connector, DeviceError, GmcDriver};
use crate::output::Publisher;
use crate::reading::{Reading, trim_version};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{self, JoinError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Errors that end the poll loop.
#[derive(Error, Debug)]
pub enum PollError {
    /// The blocking device task panicked or was cancelled
    #[error("device task failed: {0}")]
    Join(#[from] JoinError),
}

/// Fetch one metric. On failure, mark the reading offline and reconnect once.
fn fetch_or_reconnect<C: Connector, T>(
    driver: &GmcDriver<C>,
    metric: &'static str,
    is_online: &mut bool,
    fetch: impl FnOnce(&GmcDriver<C>) -> Result<T, DeviceError>,
) -> Option<T> {
    match fetch(driver) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(metric, error = %err, "lost connection to device");
            *is_online = false;
            if let Err(err) = driver.reconnect() {
                error!(error = %err, "device reconnect failed");
            }
            None
        }
    }
}

/// Read all metrics from the device. Blocks on serial I/O.
///
/// Never fails: a fetch error leaves its value at the default, marks the
/// reading offline and triggers a reconnect, so later fetches in the same
/// cycle get a fresh link.
pub fn sample<C: Connector>(driver: &GmcDriver<C>) -> Reading {
    if let Err(err) = driver.flush_bus() {
        error!(error = %err, "failed to flush device bus");
    }

    let mut is_online = true;

    let version = fetch_or_reconnect(driver, "version", &mut is_online, GmcDriver::fetch_version)
        .map(|raw| trim_version(&raw).to_string())
        .unwrap_or_default();
    debug!(%version, "fetched version");

    let cpm = fetch_or_reconnect(driver, "cpm", &mut is_online, GmcDriver::fetch_cpm)
        .unwrap_or_default();
    debug!(cpm, "fetched cpm");

    let temperature = fetch_or_reconnect(
        driver,
        "temperature",
        &mut is_online,
        GmcDriver::fetch_temperature,
    )
    .unwrap_or_default();
    debug!(temperature, "fetched temperature");

    Reading {
        temperature,
        cpm,
        version,
        is_online,
    }
}

/// Drives the device and the publishers on a fixed interval.
pub struct Poller<C: Connector + 'static> {
    driver: Arc<GmcDriver<C>>,
    publishers: Vec<Box<dyn Publisher>>,
    interval: Duration,
}

impl<C: Connector + 'static> Poller<C> {
    /// # Panics
    /// `run_until` panics if `interval` is zero.
    pub fn new(
        driver: Arc<GmcDriver<C>>,
        publishers: Vec<Box<dyn Publisher>>,
        interval: Duration,
    ) -> Self {
        Self {
            driver,
            publishers,
            interval,
        }
    }

    pub fn driver(&self) -> &Arc<GmcDriver<C>> {
        &self.driver
    }

    /// Run a single poll cycle and return what was published.
    pub async fn tick(&self) -> Result<Reading, PollError> {
        info!("tick started");

        let driver = Arc::clone(&self.driver);
        let reading = task::spawn_blocking(move || sample(&driver)).await?;
        info!(%reading, "fetched reading");

        self.publish(&reading).await;

        info!("tick completed");
        Ok(reading)
    }

    async fn publish(&self, reading: &Reading) {
        for publisher in &self.publishers {
            match publisher.publish(reading).await {
                Ok(()) => debug!(publisher = publisher.name(), "published"),
                Err(err) => warn!(publisher = publisher.name(), error = %err, "failed to publish"),
            }
        }
    }

    /// Tick every interval until `shutdown` resolves.
    ///
    /// The first tick fires one interval after the call. Shutdown is only
    /// observed between ticks; a running tick always completes.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), PollError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            interval = ?self.interval,
            publishers = self.publishers.len(),
            "polling started"
        );

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick().await?;
                }
            }
        }

        info!("polling stopped");
        Ok(())
    }

    /// Close every publisher.
    pub async fn close(&self) {
        for publisher in &self.publishers {
            publisher.close().await;
        }
    }
}
