//! Message bus used by the frame router.
//!
//! Frames go out wrapped in a JSON [`Envelope`]; the MQTT implementation is
//! [`MqttBus`], tests use [`MemoryBus`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rumqttc::{Client, ClientError, Connection, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::config::MqttConfig;
use crate::supervisor::Shutdown;

pub const API_VERSION: &str = "v3";
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Can't encode envelope: {}", source))]
    Encode { source: serde_json::Error },
    #[snafu(display("Publish to {} failed: {}", topic, source))]
    Publish { topic: String, source: ClientError },
    #[snafu(display("Subscribe to {} failed: {}", topic, source))]
    Subscribe { topic: String, source: ClientError },
}

pub trait Bus: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;
}

impl<B: Bus + ?Sized> Bus for Arc<B> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        (**self).publish(topic, payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPayload {
    pub port: String,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    /// Frame bytes, hex encoded.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(
        rename = "receivedTopic",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub received_topic: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "errorCode", default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SerialPayload>,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

impl Envelope {
    /// Wrap a frame read from `port`.
    pub fn frame(port: &str, data: &[u8]) -> Self {
        Self {
            api_version: API_VERSION.to_owned(),
            received_topic: String::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            error_code: 0,
            payload: Some(SerialPayload {
                port: port.to_owned(),
                timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                data: hex::encode(data),
            }),
            content_type: CONTENT_TYPE.to_owned(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).context(EncodeSnafu)
    }

    /// The frame carried by the envelope, if there is a well formed one.
    pub fn data(&self) -> Option<Vec<u8>> {
        let payload = self.payload.as_ref()?;
        hex::decode(&payload.data).ok()
    }
}

/// Bytes to write to a port for an inbound bus message.
///
/// An envelope with hex frame data is unwrapped, anything else is passed on
/// as is.
pub fn decode_inbound(message: &[u8]) -> Vec<u8> {
    serde_json::from_slice::<Envelope>(message)
        .ok()
        .and_then(|envelope| envelope.data())
        .unwrap_or_else(|| message.to_vec())
}

/// The MQTT broker connection.
#[derive(Clone)]
pub struct MqttBus {
    client: Client,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus").finish_non_exhaustive()
    }
}

impl MqttBus {
    /// Create the client. Nothing is sent until the returned connection is
    /// polled, see [`pump`].
    pub fn new(config: &MqttConfig) -> (Self, Connection) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        let (client, connection) = Client::new(options, 64);
        (Self { client }, connection)
    }

    /// Queue a subscription. Never blocks, so it is safe to call from the
    /// thread polling the connection.
    pub fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .context(SubscribeSnafu { topic })?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Err(err) = self.client.disconnect() {
            debug!("MQTT disconnect: {}", err);
        }
    }
}

impl Bus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .context(PublishSnafu { topic })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Action<'a> {
    Subscribe,
    Deliver { topic: &'a str, payload: &'a [u8] },
    Nothing,
}

fn action(event: &Event) -> Action<'_> {
    match event {
        Event::Incoming(Packet::Publish(publish)) => Action::Deliver {
            topic: &publish.topic,
            payload: &publish.payload,
        },
        // a clean session forgets subscriptions on every reconnect
        Event::Incoming(Packet::ConnAck(ack)) if !ack.session_present => Action::Subscribe,
        _ => Action::Nothing,
    }
}

/// Drive the MQTT connection, handing every inbound publish to `handler`.
///
/// `topics` are subscribed through `bus` each time the broker accepts a
/// connection. Returns when `shutdown` is triggered. Connection errors are
/// logged and retried after `backoff`.
pub fn pump<F>(
    mut connection: Connection,
    bus: &MqttBus,
    topics: &[String],
    shutdown: &Shutdown,
    backoff: Duration,
    mut handler: F,
) where
    F: FnMut(&str, &[u8]),
{
    for event in connection.iter() {
        if shutdown.is_triggered() {
            break;
        }
        match event {
            Ok(event) => match action(&event) {
                Action::Subscribe => {
                    info!("Connected to MQTT broker");
                    for topic in topics {
                        if let Err(err) = bus.subscribe(topic) {
                            warn!("{}", err);
                        }
                    }
                }
                Action::Deliver { topic, payload } => {
                    debug!("MQTT message on {}", topic);
                    handler(topic, payload);
                }
                Action::Nothing => {}
            },
            Err(err) => {
                warn!("MQTT connection error: {}", err);
                if shutdown.wait_timeout(backoff) {
                    break;
                }
            }
        }
    }
    debug!("MQTT pump stopped");
}

/// Collects publishes in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryBus {
    messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_owned(), payload));
        Ok(())
    }
}
