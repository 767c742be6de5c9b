//! Keeps one serial port in service.
//!
//! A [`Supervisor`] owns a [`Transport`] and a [`PortHandler`]. It opens the
//! port, feeds every read to the handler, writes back what the handler
//! answers and what arrives on its outbox, and reopens the port after a
//! backoff when anything goes wrong. It stops once [`Shutdown`] is
//! triggered.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::agent::{Agent, Clock};
use crate::assembler::FrameAssembler;
use crate::transport::{self, Transport};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

const READ_LEN: usize = 256;

/// Cooperative stop signal shared by all port threads.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` or until triggered. Returns `true` if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// What runs on top of a port.
pub trait PortHandler: Send {
    /// The port was (re)opened, forget any partial input.
    fn reset(&mut self);

    /// Handle bytes read from the port, returning the writes to make in
    /// response, in order.
    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>>;
}

impl<H: PortHandler + ?Sized> PortHandler for Box<H> {
    fn reset(&mut self) {
        (**self).reset()
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        (**self).on_bytes(bytes)
    }
}

/// IEC101 outstation on a port.
#[derive(Debug)]
pub struct Iec101Handler<C> {
    assembler: FrameAssembler,
    agent: Agent<C>,
}

impl<C: Clock> Iec101Handler<C> {
    pub fn new(agent: Agent<C>) -> Self {
        Self {
            assembler: FrameAssembler::new(),
            agent,
        }
    }

    pub fn agent(&self) -> &Agent<C> {
        &self.agent
    }
}

impl<C: Clock + Send> PortHandler for Iec101Handler<C> {
    fn reset(&mut self) {
        self.assembler.clear();
        self.agent.reset();
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.assembler.push(bytes);
        let mut out = Vec::new();
        loop {
            match self.assembler.next_frame() {
                Ok(Some(frame)) => {
                    debug!("Received {:02x?}", frame.encode().as_slice());
                    for reply in self.agent.handle_frame(&frame) {
                        out.push(reply.encode().to_vec());
                    }
                }
                Ok(None) => break,
                Err(err) => trace!("{}", err),
            }
        }
        out
    }
}

/// Runs one port until shutdown.
pub struct Supervisor<T, H> {
    transport: T,
    handler: H,
    shutdown: Shutdown,
    backoff: Duration,
    outbox: Option<Receiver<Vec<u8>>>,
}

impl<T: Transport, H: PortHandler> Supervisor<T, H> {
    pub fn new(transport: T, handler: H, shutdown: Shutdown) -> Self {
        Self {
            transport,
            handler,
            shutdown,
            backoff: DEFAULT_BACKOFF,
            outbox: None,
        }
    }

    /// Time to wait before reopening the port.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Writes queued by other threads, sent between reads.
    pub fn with_outbox(mut self, outbox: Receiver<Vec<u8>>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve the port until shutdown, then hand back the transport and
    /// handler.
    pub fn run(mut self) -> (T, H) {
        let name = self.transport.name().to_owned();
        info!("{}: starting", name);
        while !self.shutdown.is_triggered() {
            if let Err(err) = self.transport.open() {
                warn!("{}: {}, retrying in {:?}", name, err, self.backoff);
                if self.shutdown.wait_timeout(self.backoff) {
                    break;
                }
                continue;
            }
            info!("{}: open", name);
            self.handler.reset();

            let served = self.serve();
            if let Err(err) = self.transport.close() {
                warn!("{}: close failed: {}", name, err);
            }
            match served {
                Ok(()) => break,
                Err(err) => warn!("{}: {}, reopening in {:?}", name, err, self.backoff),
            }
            if self.shutdown.wait_timeout(self.backoff) {
                break;
            }
        }
        info!("{}: stopped", name);
        (self.transport, self.handler)
    }

    /// Read and answer until shutdown (`Ok`) or a port error.
    fn serve(&mut self) -> Result<(), transport::Error> {
        let mut buf = [0; READ_LEN];
        while !self.shutdown.is_triggered() {
            self.drain_outbox()?;
            let len = self.transport.read(&mut buf)?;
            if len == 0 {
                continue;
            }
            for reply in self.handler.on_bytes(&buf[..len]) {
                self.transport.write(&reply)?;
            }
        }
        Ok(())
    }

    fn drain_outbox(&mut self) -> Result<(), transport::Error> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };
        loop {
            match outbox.try_recv() {
                Ok(data) => {
                    self.transport.write(&data)?;
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    debug!("{}: outbox closed", self.transport.name());
                    self.outbox = None;
                    return Ok(());
                }
            }
        }
    }
}
