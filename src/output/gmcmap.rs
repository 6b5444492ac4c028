//! GMCmap.com reporter.
//!
//! GMCmap takes one HTTP GET per reading with the account id, the Geiger
//! counter id and the CPM value as query parameters.

use crate::output::{PublishError, PublishFuture, Publisher};
use crate::reading::Reading;
use clap::Args;
use reqwest::{Client, Request};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GMCmap account settings.
#[derive(Args, Debug, Clone)]
pub struct GmcMapOptions {
    /// GMCmap logging endpoint
    #[arg(long, env = "GMC_MAP_URL", default_value = "http://www.GMCmap.com/log2.asp")]
    pub gmc_map_url: String,

    /// GMCmap account id (AID)
    #[arg(long, env = "GMC_MAP_USER", default_value = "123456")]
    pub gmc_map_user: String,

    /// GMCmap Geiger counter id (GID)
    #[arg(long, env = "GMC_MAP_GEIGER_COUNTER", default_value = "789456123")]
    pub gmc_map_geiger_counter: String,
}

/// Publishes CPM values to GMCmap. Offline readings are not reported.
#[derive(Debug)]
pub struct GmcMapPublisher {
    client: Client,
    options: GmcMapOptions,
}

impl GmcMapPublisher {
    pub fn new(options: GmcMapOptions) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, options })
    }

    fn request(&self, cpm: u16) -> Result<Request, reqwest::Error> {
        self.client
            .get(&self.options.gmc_map_url)
            .query(&[
                ("AID", self.options.gmc_map_user.as_str()),
                ("GID", self.options.gmc_map_geiger_counter.as_str()),
                ("CPM", cpm.to_string().as_str()),
            ])
            .build()
    }
}

impl Publisher for GmcMapPublisher {
    fn name(&self) -> &'static str {
        "gmcmap"
    }

    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a> {
        Box::pin(async move {
            if !reading.is_online {
                debug!("device offline, nothing to report to GMCmap");
                return Ok(());
            }

            let request = self.request(reading.cpm)?;
            let response = self.client.execute(request).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PublishError::Status {
                    sink: self.name(),
                    status,
                });
            }
            Ok(())
        })
    }
}
