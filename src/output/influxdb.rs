//! InfluxDB writer.
//!
//! Readings become two points, `temperature` and `cpm`, serialized in line
//! protocol and POSTed to the v2 write endpoint. InfluxDB 1.8+ accepts the
//! same endpoint with a `user:password` token.

use crate::output::{PublishError, PublishFuture, Publisher};
use crate::reading::Reading;
use clap::Args;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Request};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// InfluxDB connection settings.
#[derive(Args, Debug, Clone)]
pub struct InfluxOptions {
    /// InfluxDB base URL
    #[arg(long, env = "INFLUX_URL", default_value = "http://localhost:8086")]
    pub influx_url: String,

    /// InfluxDB user name
    #[arg(long, env = "INFLUX_USER", default_value = "influxuser")]
    pub influx_user: String,

    /// InfluxDB password
    #[arg(long, env = "INFLUX_PASS", default_value = "influxpass", hide_env_values = true)]
    pub influx_pass: String,

    /// Bucket (or `database/retention-policy` on 1.x)
    #[arg(long, env = "INFLUX_BUCKET", default_value = "gmclogg")]
    pub influx_bucket: String,

    /// Value of the `location` tag
    #[arg(long, env = "INFLUX_LOCATION", default_value = "Vill")]
    pub influx_location: String,
}

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

fn escape(src: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(src.len());
    for c in src.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape commas, equals signs and spaces in tag keys, tag values and field keys.
fn escape_tag(src: &str) -> String {
    escape(src, &[',', '=', ' '])
}

fn escape_measurement(src: &str) -> String {
    escape(src, &[',', ' '])
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_tag(key), escape_tag(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", escape_tag(key), value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Clocks before 1970 are not representable in line protocol; omit the
    // timestamp and let the server assign one.
    if let Some(nanos) = data_point
        .timestamp
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|since_epoch| since_epoch.as_nanos())
    {
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape_measurement(&self.measurement))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

fn point(
    measurement: &str,
    unit: &str,
    location: &str,
    value: FieldValue,
    timestamp: SystemTime,
) -> DataPoint {
    let mut tags = BTreeMap::new();
    tags.insert("unit".to_string(), unit.to_string());
    tags.insert("location".to_string(), location.to_string());

    let mut fields = BTreeMap::new();
    fields.insert("value".to_string(), value);

    DataPoint {
        measurement: measurement.to_string(),
        tag_set: tags,
        field_set: fields,
        timestamp: Some(timestamp),
    }
}

/// The temperature and cpm points for a reading.
pub fn data_points(reading: &Reading, location: &str, timestamp: SystemTime) -> [DataPoint; 2] {
    [
        point(
            "temperature",
            "°C",
            location,
            FieldValue::Float(reading.temperature),
            timestamp,
        ),
        point(
            "cpm",
            "CPM",
            location,
            FieldValue::Integer(i64::from(reading.cpm)),
            timestamp,
        ),
    ]
}

/// Writes online readings to InfluxDB. Offline readings are skipped.
#[derive(Debug)]
pub struct InfluxDbPublisher {
    client: Client,
    options: InfluxOptions,
}

impl InfluxDbPublisher {
    pub fn new(options: InfluxOptions) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, options })
    }

    fn request(&self, body: String) -> Result<Request, reqwest::Error> {
        let url = format!("{}/api/v2/write", self.options.influx_url.trim_end_matches('/'));
        self.client
            .post(url)
            .query(&[
                ("bucket", self.options.influx_bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(
                AUTHORIZATION,
                format!(
                    "Token {}:{}",
                    self.options.influx_user, self.options.influx_pass
                ),
            )
            .body(body)
            .build()
    }
}

impl Publisher for InfluxDbPublisher {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a> {
        Box::pin(async move {
            if !reading.is_online {
                debug!("device offline, skipping InfluxDB write");
                return Ok(());
            }

            let body = data_points(reading, &self.options.influx_location, SystemTime::now())
                .iter()
                .map(DataPoint::to_string)
                .collect::<Vec<_>>()
                .join("\n");

            let request = self.request(body)?;
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
