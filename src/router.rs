//! Relays frames of configured protocols between serial ports and the bus.
//!
//! Inbound bytes of a port are buffered and cut into frames by the
//! [`FrameExtractor`] of each protocol bound to the port. Every frame is
//! published on the protocol's data topic. In the other direction, messages
//! on a protocol's request topic are written to every port bound to it.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::bus::{self, Bus, Envelope};
use crate::config::{Config, Framing, ProtocolConfig};
use crate::nom_parser::{parse_frame, FrameToken};
use crate::store::ResourceStore;
use crate::supervisor::PortHandler;

/// Buffered bytes kept at most while every extractor waits for more.
pub const MAX_PENDING: usize = 4096;

/// Data type recorded in the resource store for relayed frames.
pub const FRAME_DATA_TYPE: &str = "raw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Not enough data yet, the buffer is kept.
    Incomplete,
    /// A complete frame; `consumed` bytes leave the buffer, including any
    /// garbage skipped in front of the frame.
    Frame { frame: Vec<u8>, consumed: usize },
    /// Nothing in the buffer can become a frame.
    Invalid,
}

pub trait FrameExtractor: Send {
    fn extract(&self, buf: &[u8]) -> Extraction;
}

/// Frames starting with `head` and ending with the first `tail` after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedExtractor {
    pub head: u8,
    pub tail: u8,
    pub max_len: usize,
}

impl FrameExtractor for DelimitedExtractor {
    fn extract(&self, buf: &[u8]) -> Extraction {
        let Some(start) = buf.iter().position(|&b| b == self.head) else {
            return Extraction::Invalid;
        };
        let body = &buf[start..];
        match body.iter().skip(1).position(|&b| b == self.tail) {
            Some(pos) if pos + 2 <= self.max_len => Extraction::Frame {
                frame: body[..pos + 2].to_vec(),
                consumed: start + pos + 2,
            },
            Some(_) => Extraction::Invalid,
            None if body.len() >= self.max_len => Extraction::Invalid,
            None => Extraction::Incomplete,
        }
    }
}

/// IEC101 fixed and variable frames, checksums verified.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iec101Extractor;

impl FrameExtractor for Iec101Extractor {
    fn extract(&self, buf: &[u8]) -> Extraction {
        let mut skipped = 0;
        loop {
            let (consumed, token) = parse_frame(&buf[skipped..]);
            match token {
                FrameToken::Frame(_) => {
                    let end = skipped + consumed;
                    return Extraction::Frame {
                        frame: buf[skipped..end].to_vec(),
                        consumed: end,
                    };
                }
                FrameToken::Discard(_) => skipped += consumed,
                FrameToken::NeedData if skipped == buf.len() => return Extraction::Invalid,
                FrameToken::NeedData => return Extraction::Incomplete,
            }
        }
    }
}

/// Everything buffered is one frame. Since extraction runs after every read,
/// this publishes each read as it came.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawExtractor;

impl FrameExtractor for RawExtractor {
    fn extract(&self, buf: &[u8]) -> Extraction {
        if buf.is_empty() {
            return Extraction::Incomplete;
        }
        Extraction::Frame {
            frame: buf.to_vec(),
            consumed: buf.len(),
        }
    }
}

pub fn extractor_for(framing: &Framing) -> Box<dyn FrameExtractor> {
    match *framing {
        Framing::Delimited {
            head,
            tail,
            max_len,
        } => Box::new(DelimitedExtractor {
            head,
            tail,
            max_len,
        }),
        Framing::Iec101 => Box::new(Iec101Extractor),
        Framing::Raw => Box::new(RawExtractor),
    }
}

/// One protocol bound to a port.
pub struct Route {
    pub protocol: String,
    pub data_topic: String,
    extractor: Box<dyn FrameExtractor>,
}

impl Route {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self::with_extractor(
            &protocol.id,
            protocol.data_topic(),
            extractor_for(&protocol.framing),
        )
    }

    pub fn with_extractor(
        protocol: &str,
        data_topic: String,
        extractor: Box<dyn FrameExtractor>,
    ) -> Self {
        Self {
            protocol: protocol.to_owned(),
            data_topic,
            extractor,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("protocol", &self.protocol)
            .field("data_topic", &self.data_topic)
            .finish()
    }
}

/// Serial → bus half of the router for one port.
///
/// Extractors run in binding order and the first one to return a frame
/// wins. The buffer is kept while any of them is waiting for more data and
/// dropped when all of them find it invalid.
pub struct RouterPort<B> {
    port: String,
    routes: Vec<Route>,
    buffer: Buffer,
    bus: B,
    store: Arc<ResourceStore>,
}

impl<B: Bus> RouterPort<B> {
    pub fn new(port: &str, routes: Vec<Route>, bus: B, store: Arc<ResourceStore>) -> Self {
        Self {
            port: port.to_owned(),
            routes,
            buffer: Buffer::new(),
            bus,
            store,
        }
    }

    /// Build the routes of `port` from the configuration.
    pub fn from_config(
        config: &Config,
        port: &str,
        bus: B,
        store: Arc<ResourceStore>,
    ) -> Result<Self, crate::config::Error> {
        let routes = config
            .protocols_for_port(port)?
            .into_iter()
            .map(Route::new)
            .collect();
        Ok(Self::new(port, routes, bus, store))
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer `bytes` and publish every frame they complete. Returns the
    /// number of frames published.
    pub fn receive(&mut self, bytes: &[u8]) -> usize {
        self.buffer.write(bytes);
        let mut published = 0;
        while !self.buffer.is_empty() {
            let mut waiting = false;
            let mut found = None;
            for (index, route) in self.routes.iter().enumerate() {
                match route.extractor.extract(self.buffer.as_ref()) {
                    Extraction::Frame { frame, consumed } => {
                        found = Some((index, frame, consumed));
                        break;
                    }
                    Extraction::Incomplete => waiting = true,
                    Extraction::Invalid => {}
                }
            }

            match found {
                Some((index, frame, consumed)) => {
                    self.buffer.consume(consumed);
                    self.publish(index, &frame);
                    published += 1;
                }
                None if waiting => {
                    if self.buffer.len() > MAX_PENDING {
                        warn!(
                            "{}: dropping {} bytes without a frame",
                            self.port,
                            self.buffer.len()
                        );
                        self.buffer.clear();
                    }
                    break;
                }
                None => {
                    debug!(
                        "{}: discarding {} unframed bytes",
                        self.port,
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
            }
        }
        published
    }

    fn publish(&self, index: usize, frame: &[u8]) {
        let route = &self.routes[index];
        trace!("{}: {} frame {:02x?}", self.port, route.protocol, frame);
        self.store
            .add_resource(&self.port, &route.protocol, FRAME_DATA_TYPE, frame);
        let message = match Envelope::frame(&self.port, frame).to_json() {
            Ok(message) => message,
            Err(err) => {
                warn!("{}: {}", self.port, err);
                return;
            }
        };
        if let Err(err) = self.bus.publish(&route.data_topic, message) {
            warn!("{}: {}", self.port, err);
        }
    }
}

impl<B: Bus> PortHandler for RouterPort<B> {
    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.receive(bytes);
        Vec::new()
    }
}

/// Bus → serial half of the router: request topics to port channels.
#[derive(Debug, Default)]
pub struct Router {
    routes: BTreeMap<String, Vec<(String, Sender<Vec<u8>>)>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver messages on `topic` to the port behind `outbox`.
    pub fn add_port(&mut self, topic: &str, port: &str, outbox: Sender<Vec<u8>>) {
        self.routes
            .entry(topic.to_owned())
            .or_default()
            .push((port.to_owned(), outbox));
    }

    /// Set up the request topics of every bridge port.
    pub fn from_config<F>(config: &Config, mut outbox: F) -> Self
    where
        F: FnMut(&str) -> Option<Sender<Vec<u8>>>,
    {
        let mut router = Self::new();
        for protocol in &config.protocols {
            let topic = protocol.request_topic();
            for port in config.ports_for_protocol(&protocol.id) {
                if let Some(sender) = outbox(port) {
                    router.add_port(&topic, port, sender);
                }
            }
        }
        router
    }

    /// Topics to subscribe to.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Forward a bus message. Returns the number of ports it was queued for.
    pub fn dispatch(&self, topic: &str, message: &[u8]) -> usize {
        let Some(ports) = self.routes.get(topic) else {
            debug!("No port listens on {}", topic);
            return 0;
        };
        let data = bus::decode_inbound(message);
        let mut queued = 0;
        for (port, outbox) in ports {
            if outbox.send(data.clone()).is_ok() {
                queued += 1;
            } else {
                warn!("{}: port is gone, dropping message from {}", port, topic);
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::sync::mpsc;

    const PROTO23: DelimitedExtractor = DelimitedExtractor {
        head: 0xaa,
        tail: 0x55,
        max_len: 16,
    };

    #[test]
    fn test_delimited_extractor() {
        assert_eq!(PROTO23.extract(b"\x01\x02"), Extraction::Invalid);
        assert_eq!(PROTO23.extract(b"\x01\xaa\x02"), Extraction::Incomplete);
        assert_eq!(
            PROTO23.extract(b"\x01\xaa\x02\x55\xaa"),
            Extraction::Frame {
                frame: vec![0xaa, 0x02, 0x55],
                consumed: 4
            }
        );
        // head and tail are distinct bytes of the frame
        let same = DelimitedExtractor {
            head: 0x7e,
            tail: 0x7e,
            max_len: 16,
        };
        assert_eq!(same.extract(b"\x7e"), Extraction::Incomplete);
        assert_eq!(
            same.extract(b"\x7e\x7e"),
            Extraction::Frame {
                frame: vec![0x7e, 0x7e],
                consumed: 2
            }
        );
    }

    #[test]
    fn test_delimited_max_len() {
        let mut long = vec![0xaa];
        long.extend([0u8; 15]);
        assert_eq!(PROTO23.extract(&long), Extraction::Invalid);
        long.truncate(15);
        assert_eq!(PROTO23.extract(&long), Extraction::Incomplete);
        long.push(0x55);
        assert!(matches!(
            PROTO23.extract(&long),
            Extraction::Frame { consumed: 16, .. }
        ));
    }

    #[test]
    fn test_iec101_extractor() {
        let reset_link = b"\x10\x40\x01\x00\x41\x16";
        assert_eq!(Iec101Extractor.extract(&reset_link[..3]), Extraction::Incomplete);
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(reset_link);
        assert_eq!(
            Iec101Extractor.extract(&buf),
            Extraction::Frame {
                frame: reset_link.to_vec(),
                consumed: 8
            }
        );
        // bad checksum and nothing else to resync on
        assert_eq!(
            Iec101Extractor.extract(b"\x10\x40\x01\x00\x42\x16"),
            Extraction::Invalid
        );
    }

    #[test]
    fn test_raw_extractor() {
        assert_eq!(RawExtractor.extract(b""), Extraction::Incomplete);
        assert_eq!(
            RawExtractor.extract(b"abc"),
            Extraction::Frame {
                frame: b"abc".to_vec(),
                consumed: 3
            }
        );
    }

    fn port(routes: Vec<Route>) -> (RouterPort<MemoryBus>, MemoryBus, Arc<ResourceStore>) {
        let bus = MemoryBus::new();
        let store = Arc::new(ResourceStore::new());
        (
            RouterPort::new("com2", routes, bus.clone(), store.clone()),
            bus,
            store,
        )
    }

    fn frames(bus: &MemoryBus) -> Vec<(String, Vec<u8>)> {
        bus.messages()
            .into_iter()
            .map(|(topic, message)| {
                let envelope: Envelope = serde_json::from_slice(&message).unwrap();
                assert_eq!(envelope.payload.as_ref().unwrap().port, "com2");
                (topic, envelope.data().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_router_port_split_reads() {
        let route = Route::with_extractor("p23", "data/p23".into(), Box::new(PROTO23));
        let (mut port, bus, store) = port(vec![route]);

        assert_eq!(port.receive(b"\xaa\x01"), 0);
        assert_eq!(port.pending(), 2);
        assert_eq!(port.receive(b"\x02\x55\xaa\x03\x55\xaa"), 2);
        assert_eq!(port.pending(), 1);
        assert_eq!(
            frames(&bus),
            vec![
                ("data/p23".to_owned(), vec![0xaa, 0x01, 0x02, 0x55]),
                ("data/p23".to_owned(), vec![0xaa, 0x03, 0x55]),
            ]
        );
        assert_eq!(
            store.get_resource("com2", "p23").unwrap().value,
            vec![0xaa, 0x03, 0x55]
        );
    }

    #[test]
    fn test_router_port_invalid_clears() {
        let route = Route::with_extractor("p23", "data/p23".into(), Box::new(PROTO23));
        let (mut port, bus, _) = port(vec![route]);
        assert_eq!(port.receive(b"\x01\x02\x03"), 0);
        assert_eq!(port.pending(), 0);
        assert!(bus.messages().is_empty());
    }

    #[test]
    fn test_router_port_several_protocols() {
        let routes = vec![
            Route::with_extractor("iec", "data/iec".into(), Box::new(Iec101Extractor)),
            Route::with_extractor("p23", "data/p23".into(), Box::new(PROTO23)),
        ];
        let (mut port, bus, _) = port(routes);
        let mut input = b"\x10\x40\x01\x00\x41\x16".to_vec();
        input.extend_from_slice(b"\xaa\x01\x55");
        assert_eq!(port.receive(&input), 2);
        let topics: Vec<_> = frames(&bus).into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec!["data/iec", "data/p23"]);
        assert_eq!(port.pending(), 0);
    }

    #[test]
    fn test_dispatch() {
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        let mut router = Router::new();
        router.add_port("req/p23", "com2", tx1);
        router.add_port("req/p23", "com3", tx2);
        assert_eq!(router.topics().collect::<Vec<_>>(), vec!["req/p23"]);

        assert_eq!(router.dispatch("req/p23", b"\xaa\x10\x55"), 2);
        assert_eq!(rx1.try_recv().unwrap(), b"\xaa\x10\x55");
        assert_eq!(rx2.try_recv().unwrap(), b"\xaa\x10\x55");

        let envelope = Envelope::frame("com2", &[1, 2]).to_json().unwrap();
        router.dispatch("req/p23", &envelope);
        assert_eq!(rx1.try_recv().unwrap(), vec![1, 2]);

        assert_eq!(router.dispatch("req/other", b"x"), 0);
        drop(rx2);
        assert_eq!(router.dispatch("req/p23", b"x"), 1);
    }
}
