//! Serial ports as byte streams.
//!
//! A [`Transport`] reads with a timeout and reports a timeout as zero bytes.
//! [`Rs485Transport`] wraps another transport and drives the DE/RE line
//! around every write.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use serialport::SerialPort;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::{PortConfig, PortKind};
use crate::gpio::{self, Direction, DirectionControl, SysfsGpio};

/// Time the line driver gets to settle before the first bit.
pub const TX_GUARD: Duration = Duration::from_millis(5);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Can't open {}: {}", device, source))]
    Open {
        device: String,
        source: serialport::Error,
    },
    #[snafu(display("Port {} is not open", name))]
    NotOpen { name: String },
    #[snafu(display("Port {} closed by the remote end", name))]
    Closed { name: String },
    #[snafu(display("I/O error on {}: {}", name, source))]
    Io { name: String, source: io::Error },
    #[snafu(display("Direction control of {} failed: {}", name, source))]
    Gpio { name: String, source: gpio::Error },
    #[snafu(display("Port {} is rs485 but has no DE/RE pin", name))]
    MissingDePin { name: String },
}

/// A byte stream to one serial device.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;

    /// Read what is available. Returns `Ok(0)` when the read timed out.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;

    /// Logical port name, used in logs and bus messages.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), Error> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        (**self).write(buf)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// How long `bytes` take on the wire, assuming 10 bits per byte.
pub fn transmit_duration(bytes: usize, baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(bytes as u64 * 10 * 1_000_000 / u64::from(baud_rate))
}

/// A plain UART / RS-232 port.
pub struct SerialPortTransport {
    name: String,
    device: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortTransport {
    pub fn new(name: &str, device: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            device: device.to_owned(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        let name = &self.name;
        self.port.as_mut().context(NotOpenSnafu { name })
    }
}

impl std::fmt::Debug for SerialPortTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortTransport")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Transport for SerialPortTransport {
    fn open(&mut self) -> Result<(), Error> {
        let port = serialport::new(&self.device, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .context(OpenSnafu {
                device: &self.device,
            })?;
        debug!("Opened {} at {} baud", self.device, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.device);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let name = self.name.clone();
        match self.port()?.read(buf) {
            Ok(0) => ClosedSnafu { name }.fail(),
            Ok(len) => {
                trace!("{}: read {:02x?}", name, &buf[..len]);
                Ok(len)
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(source) => Err(Error::Io { name, source }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let name = self.name.clone();
        let port = self.port()?;
        port.write_all(buf).context(IoSnafu { name: &name })?;
        port.flush().context(IoSnafu { name: &name })?;
        trace!("{}: wrote {:02x?}", name, buf);
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Half duplex RS-485 on top of another transport.
#[derive(Debug)]
pub struct Rs485Transport<T, D> {
    inner: T,
    de: D,
    baud_rate: u32,
    guard: Duration,
}

impl<T: Transport, D: DirectionControl> Rs485Transport<T, D> {
    pub fn new(inner: T, de: D, baud_rate: u32) -> Self {
        Self {
            inner,
            de,
            baud_rate,
            guard: TX_GUARD,
        }
    }

    /// Override the settle time before each write.
    pub fn with_guard(mut self, guard: Duration) -> Self {
        self.guard = guard;
        self
    }

    pub fn direction_control(&self) -> &D {
        &self.de
    }

    fn direction(&mut self, direction: Direction) -> Result<(), Error> {
        let name = self.inner.name().to_owned();
        self.de.set_direction(direction).context(GpioSnafu { name })
    }
}

impl<T: Transport, D: DirectionControl> Transport for Rs485Transport<T, D> {
    fn open(&mut self) -> Result<(), Error> {
        let name = self.inner.name().to_owned();
        self.de.acquire().context(GpioSnafu { name })?;
        if let Err(err) = self.inner.open() {
            let _ = self.de.release();
            return Err(err);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let name = self.inner.name().to_owned();
        let closed = self.inner.close();
        self.de.release().context(GpioSnafu { name })?;
        closed
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.direction(Direction::Transmit)?;
        thread::sleep(self.guard);
        let written = match self.inner.write(buf) {
            Ok(written) => written,
            Err(err) => {
                let _ = self.direction(Direction::Receive);
                return Err(err);
            }
        };
        thread::sleep(transmit_duration(written, self.baud_rate));
        self.direction(Direction::Receive)?;
        Ok(written)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Build the transport described by `config`. The port is not opened.
pub fn build(config: &PortConfig) -> Result<Box<dyn Transport>, Error> {
    let serial = SerialPortTransport::new(
        &config.name,
        &config.device,
        config.baud_rate,
        config.timeout(),
    );
    Ok(match config.kind {
        PortKind::Uart | PortKind::Rs232 => Box::new(serial),
        PortKind::Rs485 => {
            let pin = config
                .de_pin
                .context(MissingDePinSnafu { name: &config.name })?;
            Box::new(Rs485Transport::new(
                serial,
                SysfsGpio::new(pin),
                config.baud_rate,
            ))
        }
    })
}
