//! MQTT publisher with Home Assistant discovery.
//!
//! Every publish first (re)announces three entities under the
//! `homeassistant/` discovery prefix, waits for Home Assistant to pick them
//! up, then sends the state topics:
//!
//! | Entity      | Discovery topic                                   | State topic               |
//! |-------------|---------------------------------------------------|---------------------------|
//! | status      | `homeassistant/binary_sensor/<topic>/status/config` | `gmc/<topic>/status`      |
//! | temperature | `homeassistant/sensor/<topic>/temperature/config`   | `gmc/<topic>/temperature` |
//! | cpm         | `homeassistant/sensor/<topic>/cpm/config`           | `gmc/<topic>/cpm`         |

use crate::output::{PublishError, PublishFuture, Publisher};
use crate::reading::Reading;
use clap::Args;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions as ClientOptions, Outgoing, Packet,
    QoS,
};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CHANNEL_CAPACITY: usize = 10;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

const MANUFACTURER: &str = "GMC";
const MODEL: &str = "GMC-320 Plus";
/// Seconds without a status update before Home Assistant marks it unavailable.
const STATUS_EXPIRE_AFTER: &str = "240";

/// Broker connection and topic settings.
#[derive(Args, Debug, Clone)]
pub struct MqttOptions {
    /// MQTT broker host name
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT user name, empty to connect anonymously
    #[arg(long, env = "MQTT_USER", default_value = "mqttUser")]
    pub mqtt_user: String,

    /// MQTT password
    #[arg(long, env = "MQTT_PASS", default_value = "mqttPassword", hide_env_values = true)]
    pub mqtt_pass: String,

    /// Device name used in topics and Home Assistant ids
    #[arg(long, env = "MQTT_TOPIC", default_value = "gmclogg")]
    pub mqtt_topic: String,

    /// Pause between discovery and state messages.
    /// Accepts duration with suffix: 2s, 500ms. Without suffix, seconds.
    #[arg(long, env = "MQTT_DISCOVERY_DELAY", default_value = "2s", value_parser = crate::duration::parse_duration)]
    pub mqtt_discovery_delay: Duration,
}

/// Error raised while connecting to the broker at startup.
#[derive(Error, Debug)]
pub enum MqttSetupError {
    #[error("unable to connect to MQTT broker {broker}: {source}")]
    Connect {
        broker: String,
        #[source]
        source: ConnectionError,
    },
}

/// A message ready to be handed to the MQTT client.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct Device<'a> {
    identifiers: &'a str,
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
    sw_version: &'a str,
}

#[derive(Serialize)]
struct DiscoveryConfig<'a> {
    name: &'a str,
    state_topic: String,
    availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_template: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire_after: Option<&'a str>,
    unique_id: String,
    device: Device<'a>,
}

#[derive(Serialize)]
struct StateValue<T> {
    value: T,
    unit: &'static str,
}

fn state_topic(topic: &str, entity: &str) -> String {
    format!("gmc/{topic}/{entity}")
}

fn json_message<T: Serialize>(topic: String, body: &T) -> Result<Message, serde_json::Error> {
    Ok(Message {
        topic,
        payload: serde_json::to_vec(body)?,
    })
}

/// Discovery messages for the status, temperature and cpm entities.
pub fn discovery_messages(topic: &str, version: &str) -> Result<Vec<Message>, serde_json::Error> {
    let device = || Device {
        identifiers: topic,
        name: topic,
        manufacturer: MANUFACTURER,
        model: MODEL,
        sw_version: version,
    };
    let status_topic = state_topic(topic, "status");

    let status = DiscoveryConfig {
        name: "Status",
        state_topic: status_topic.clone(),
        availability_topic: status_topic.clone(),
        device_class: Some("connectivity"),
        state_class: None,
        unit_of_measurement: None,
        value_template: None,
        payload_on: Some("online"),
        payload_off: Some("offline"),
        expire_after: Some(STATUS_EXPIRE_AFTER),
        unique_id: format!("gmc_{topic}_status"),
        device: device(),
    };
    let temperature = DiscoveryConfig {
        name: "Temperature",
        state_topic: state_topic(topic, "temperature"),
        availability_topic: status_topic.clone(),
        device_class: Some("temperature"),
        state_class: Some("measurement"),
        unit_of_measurement: Some("°C"),
        value_template: Some("{{ value_json.value | float }}"),
        payload_on: None,
        payload_off: None,
        expire_after: None,
        unique_id: format!("gmc_{topic}_temp"),
        device: device(),
    };
    let cpm = DiscoveryConfig {
        name: "CPM",
        state_topic: state_topic(topic, "cpm"),
        availability_topic: status_topic,
        device_class: None,
        state_class: Some("measurement"),
        unit_of_measurement: Some("CPM"),
        value_template: Some("{{ value_json.value | int }}"),
        payload_on: None,
        payload_off: None,
        expire_after: None,
        unique_id: format!("gmc_{topic}_cpm"),
        device: device(),
    };

    Ok(vec![
        json_message(format!("homeassistant/binary_sensor/{topic}/status/config"), &status)?,
        json_message(format!("homeassistant/sensor/{topic}/temperature/config"), &temperature)?,
        json_message(format!("homeassistant/sensor/{topic}/cpm/config"), &cpm)?,
    ])
}

/// State messages: plain `online`/`offline` status, JSON for the values.
pub fn state_messages(topic: &str, reading: &Reading) -> Result<Vec<Message>, serde_json::Error> {
    let status = if reading.is_online { "online" } else { "offline" };

    Ok(vec![
        Message {
            topic: state_topic(topic, "status"),
            payload: status.as_bytes().to_vec(),
        },
        json_message(
            state_topic(topic, "temperature"),
            &StateValue {
                value: reading.temperature,
                unit: "°C",
            },
        )?,
        json_message(
            state_topic(topic, "cpm"),
            &StateValue {
                value: reading.cpm,
                unit: "CPM",
            },
        )?,
    ])
}

/// Publishes readings and discovery configs to an MQTT broker.
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    discovery_delay: Duration,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Connect to the broker and keep the connection alive in a background task.
    ///
    /// Waits for the broker's CONNACK, so an unreachable broker or rejected
    /// credentials fail here instead of on the first publish.
    ///
    /// # Errors
    /// Returns `MqttSetupError` if the first connection attempt fails.
    pub async fn connect(options: &MqttOptions) -> Result<Self, MqttSetupError> {
        let mut client_options = ClientOptions::new(
            format!("gmc_mqtt_{}", options.mqtt_topic),
            &options.mqtt_broker,
            options.mqtt_port,
        );
        client_options.set_keep_alive(KEEP_ALIVE);
        if !options.mqtt_user.is_empty() {
            client_options.set_credentials(&options.mqtt_user, &options.mqtt_pass);
        }

        let (client, mut event_loop) = AsyncClient::new(client_options, REQUEST_CHANNEL_CAPACITY);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(source) => {
                    return Err(MqttSetupError::Connect {
                        broker: format!("{}:{}", options.mqtt_broker, options.mqtt_port),
                        source,
                    });
                }
            }
        }
        info!(
            broker = %options.mqtt_broker,
            port = options.mqtt_port,
            "connected to MQTT broker"
        );

        let handle = tokio::spawn(drive_event_loop(event_loop));

        Ok(Self::with_client(
            client,
            options.mqtt_topic.clone(),
            options.mqtt_discovery_delay,
            Some(handle),
        ))
    }

    fn with_client(
        client: AsyncClient,
        topic: String,
        discovery_delay: Duration,
        event_loop: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            client,
            topic,
            discovery_delay,
            event_loop: Mutex::new(event_loop),
        }
    }

    /// Queue a message without waiting. While the broker is unreachable the
    /// request channel fills up and further messages fail instead of blocking
    /// the tick.
    fn send(&self, message: Message) -> Result<(), PublishError> {
        self.client
            .try_publish(message.topic, QoS::AtMostOnce, false, message.payload)?;
        Ok(())
    }
}

/// Poll the event loop until the client disconnects. rumqttc reconnects on
/// the next poll after an error.
async fn drive_event_loop(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("reconnected to MQTT broker"),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "connection to MQTT broker lost");
                time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

impl Publisher for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a> {
        Box::pin(async move {
            for message in discovery_messages(&self.topic, &reading.version)? {
                self.send(message)?;
            }

            // Give Home Assistant time to register new entities
            time::sleep(self.discovery_delay).await;

            for message in state_messages(&self.topic, reading)? {
                self.send(message)?;
            }
            Ok(())
        })
    }

    /// Queue a DISCONNECT and give the event loop a moment to flush it.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(error) = self.client.try_disconnect() {
                warn!(%error, "failed to disconnect from MQTT broker");
            }

            let handle = self
                .event_loop
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut handle) = handle
                && time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err()
            {
                warn!("MQTT event loop did not stop in time");
                handle.abort();
            }
        })
    }
}
