//! YAML configuration of ports, protocols and the bus connection.
//!
//! ```yaml
//! ports:
//!   - name: com1
//!     device: /dev/ttyS1
//!     kind: rs485
//!     baud_rate: 9600
//!     de_pin: 914
//!     role: iec101
//!   - name: com2
//!     device: /dev/ttyUSB0
//!     kind: uart
//!     baud_rate: 115200
//! protocols:
//!   - id: custom23
//!     framing: { type: delimited, head: 170, tail: 85 }
//! bindings:
//!   - port: com2
//!     protocol: custom23
//! default_protocol: custom23
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::agent::AgentConfig;

const REQUEST_TOPIC_PREFIX: &str = "edgex/service/command/request/device_uart";
const DATA_TOPIC_PREFIX: &str = "edgex/service/data/device_uart";

/// Topic carrying commands for ports bound to `protocol`.
pub fn request_topic(protocol: &str) -> String {
    format!("{}/{}", REQUEST_TOPIC_PREFIX, protocol)
}

/// Topic frames of `protocol` are published on.
pub fn data_topic(protocol: &str) -> String {
    format!("{}/{}", DATA_TOPIC_PREFIX, protocol)
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Can't read {}: {}", path.display(), source))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("Invalid configuration: {}", source))]
    Parse { source: serde_yaml::Error },
    #[snafu(display("Port {} is defined twice", name))]
    DuplicatePort { name: String },
    #[snafu(display("Protocol {} is defined twice", id))]
    DuplicateProtocol { id: String },
    #[snafu(display("Port {} is rs485 but has no de_pin", name))]
    MissingDePin { name: String },
    #[snafu(display("Binding refers to unknown port {}", name))]
    UnknownPort { name: String },
    #[snafu(display("Unknown protocol {}", id))]
    UnknownProtocol { id: String },
    #[snafu(display("Bridge port {} has no binding and there is no default protocol", name))]
    NoProtocol { name: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Uart,
    Rs485,
    Rs232,
}

/// What runs on top of the port.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    /// IEC101 outstation.
    Iec101,
    /// Frames of the bound protocols are relayed to the bus.
    #[default]
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub device: String,
    pub kind: PortKind,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// DE/RE GPIO, rs485 only.
    #[serde(default)]
    pub de_pin: Option<u32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub role: PortRole,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    500
}

impl PortConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How a protocol's frames are cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Framing {
    /// `head ... tail`, up to `max_len` bytes including both delimiters.
    Delimited {
        head: u8,
        tail: u8,
        #[serde(default = "default_max_len")]
        max_len: usize,
    },
    /// IEC101 fixed and variable frames.
    Iec101,
    /// Each read is one frame.
    Raw,
}

fn default_max_len() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub id: String,
    pub framing: Framing,
    #[serde(default)]
    pub request_topic: Option<String>,
    #[serde(default)]
    pub data_topic: Option<String>,
}

impl ProtocolConfig {
    pub fn request_topic(&self) -> String {
        self.request_topic
            .clone()
            .unwrap_or_else(|| request_topic(&self.id))
    }

    pub fn data_topic(&self) -> String {
        self.data_topic.clone().unwrap_or_else(|| data_topic(&self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub port: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 1883,
            client_id: "serial-bridge".to_owned(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Iec101Config {
    pub link_address: u16,
    pub common_address: u16,
    pub file_root: PathBuf,
}

impl Default for Iec101Config {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            link_address: agent.link_address,
            common_address: agent.common_address,
            file_root: agent.file_root,
        }
    }
}

impl From<&Iec101Config> for AgentConfig {
    fn from(config: &Iec101Config) -> Self {
        AgentConfig {
            link_address: config.link_address,
            common_address: config.common_address,
            file_root: config.file_root.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub default_protocol: Option<String>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub iec101: Iec101Config,
    #[serde(default = "default_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

fn default_backoff_secs() -> u64 {
    10
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(text).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        for port in &self.ports {
            ensure!(
                names.insert(port.name.as_str()),
                DuplicatePortSnafu { name: &port.name }
            );
            ensure!(
                port.kind != PortKind::Rs485 || port.de_pin.is_some(),
                MissingDePinSnafu { name: &port.name }
            );
        }

        let mut ids = HashSet::new();
        for protocol in &self.protocols {
            ensure!(
                ids.insert(protocol.id.as_str()),
                DuplicateProtocolSnafu { id: &protocol.id }
            );
        }

        for binding in &self.bindings {
            ensure!(
                names.contains(binding.port.as_str()),
                UnknownPortSnafu {
                    name: &binding.port
                }
            );
            ensure!(
                ids.contains(binding.protocol.as_str()),
                UnknownProtocolSnafu {
                    id: &binding.protocol
                }
            );
        }

        if let Some(id) = &self.default_protocol {
            ensure!(ids.contains(id.as_str()), UnknownProtocolSnafu { id });
        }

        for port in self.bridge_ports() {
            let bound = self.bindings.iter().any(|b| b.port == port.name);
            ensure!(
                bound || self.default_protocol.is_some(),
                NoProtocolSnafu { name: &port.name }
            );
        }
        Ok(())
    }

    pub fn port(&self, name: &str) -> Option<&PortConfig> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn protocol(&self, id: &str) -> Option<&ProtocolConfig> {
        self.protocols.iter().find(|p| p.id == id)
    }

    pub fn bridge_ports(&self) -> impl Iterator<Item = &PortConfig> {
        self.ports.iter().filter(|p| p.role == PortRole::Bridge)
    }

    /// Protocols bound to `port`, falling back to the default protocol.
    pub fn protocols_for_port(&self, port: &str) -> Result<Vec<&ProtocolConfig>, Error> {
        let mut ids: Vec<&str> = self
            .bindings
            .iter()
            .filter(|b| b.port == port)
            .map(|b| b.protocol.as_str())
            .collect();
        if ids.is_empty() {
            if let Some(id) = &self.default_protocol {
                ids.push(id);
            }
        }
        ids.into_iter()
            .map(|id| self.protocol(id).context(UnknownProtocolSnafu { id }))
            .collect()
    }

    /// Bridge ports relaying protocol `id`.
    pub fn ports_for_protocol(&self, id: &str) -> Vec<&str> {
        self.bridge_ports()
            .filter(|port| {
                self.protocols_for_port(&port.name)
                    .map(|protocols| protocols.iter().any(|p| p.id == id))
                    .unwrap_or(false)
            })
            .map(|port| port.name.as_str())
            .collect()
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
ports:
  - name: com1
    device: /dev/ttyS1
    kind: rs485
    baud_rate: 9600
    de_pin: 914
    role: iec101
  - name: com2
    device: /dev/ttyUSB0
    kind: uart
    baud_rate: 115200
  - name: com3
    device: /dev/ttyUSB1
    kind: rs232
protocols:
  - id: custom23
    framing: { type: delimited, head: 170, tail: 85 }
  - id: meter
    framing: { type: iec101 }
    data_topic: plant/meter
  - id: raw
    framing: { type: raw }
bindings:
  - port: com2
    protocol: meter
  - port: com2
    protocol: raw
default_protocol: custom23
mqtt:
  host: broker.local
iec101:
  link_address: 3
"#;

    #[test]
    fn test_parse_example() {
        let config = Config::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.ports.len(), 3);
        let com1 = config.port("com1").unwrap();
        assert_eq!(com1.kind, PortKind::Rs485);
        assert_eq!(com1.role, PortRole::Iec101);
        assert_eq!(com1.timeout(), Duration::from_millis(500));
        assert_eq!(config.port("com3").unwrap().baud_rate, 9600);

        assert_eq!(
            config.protocol("custom23").unwrap().framing,
            Framing::Delimited {
                head: 0xaa,
                tail: 0x55,
                max_len: 256
            }
        );
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.iec101.link_address, 3);
        assert_eq!(config.iec101.common_address, 1);
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_bindings_and_default() {
        let config = Config::from_yaml(EXAMPLE).unwrap();
        let ids = |port| -> Vec<String> {
            config
                .protocols_for_port(port)
                .unwrap()
                .iter()
                .map(|p| p.id.clone())
                .collect()
        };
        assert_eq!(ids("com2"), vec!["meter", "raw"]);
        assert_eq!(ids("com3"), vec!["custom23"]);
        assert_eq!(config.ports_for_protocol("custom23"), vec!["com3"]);
        assert_eq!(config.ports_for_protocol("meter"), vec!["com2"]);
        // iec101 ports never relay
        assert!(!config.ports_for_protocol("custom23").contains(&"com1"));
    }

    #[test]
    fn test_topics() {
        let config = Config::from_yaml(EXAMPLE).unwrap();
        let custom = config.protocol("custom23").unwrap();
        assert_eq!(
            custom.request_topic(),
            "edgex/service/command/request/device_uart/custom23"
        );
        assert_eq!(custom.data_topic(), "edgex/service/data/device_uart/custom23");
        assert_eq!(config.protocol("meter").unwrap().data_topic(), "plant/meter");
    }

    #[test]
    fn test_validation_errors() {
        let missing_pin = "ports: [{name: a, device: /dev/x, kind: rs485}]";
        assert!(matches!(
            Config::from_yaml(missing_pin),
            Err(Error::MissingDePin { .. })
        ));

        let duplicate = "ports: [{name: a, device: /dev/x, kind: uart, role: iec101}, \
                         {name: a, device: /dev/y, kind: uart, role: iec101}]";
        assert!(matches!(
            Config::from_yaml(duplicate),
            Err(Error::DuplicatePort { .. })
        ));

        let unbound = "ports: [{name: a, device: /dev/x, kind: uart}]";
        assert!(matches!(
            Config::from_yaml(unbound),
            Err(Error::NoProtocol { .. })
        ));

        let unknown = "ports: [{name: a, device: /dev/x, kind: uart}]\n\
                       bindings: [{port: a, protocol: nope}]";
        assert!(matches!(
            Config::from_yaml(unknown),
            Err(Error::UnknownProtocol { .. })
        ));

        assert!(matches!(
            Config::from_yaml("ports: 3"),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        fs::write(&path, EXAMPLE).unwrap();
        assert!(Config::load(&path).is_ok());
        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(Error::Read { .. })
        ));
    }
}
