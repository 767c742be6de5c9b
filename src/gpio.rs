//! RS-485 driver enable (DE/RE) control.
//!
//! The transceiver is half duplex: the driver must be enabled while we
//! transmit and disabled again before the master answers. The output is
//! driven through [`DirectionControl`], with a sysfs implementation for real
//! hardware and an in-memory one for tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Can't set direction of GPIO {}: {}", pin, source))]
    Configure { pin: u32, source: io::Error },
    #[snafu(display("Can't open value of GPIO {}: {}", pin, source))]
    OpenValue { pin: u32, source: io::Error },
    #[snafu(display("Can't write GPIO {}: {}", pin, source))]
    WriteValue { pin: u32, source: io::Error },
    #[snafu(display("GPIO {} used before it was acquired", pin))]
    NotAcquired { pin: u32 },
}

/// Line direction as seen from this station.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Driver enabled, output high.
    Transmit,
    /// Driver disabled, output low.
    Receive,
}

impl Direction {
    fn value(self) -> &'static [u8] {
        match self {
            Direction::Transmit => b"1",
            Direction::Receive => b"0",
        }
    }
}

pub trait DirectionControl: Send {
    /// Claim the output and leave the line in [`Direction::Receive`].
    fn acquire(&mut self) -> Result<(), Error>;

    /// Switch the line. Setting the current direction again is a no-op.
    fn set_direction(&mut self, direction: Direction) -> Result<(), Error>;

    /// Put the line back in receive and let go of the output.
    fn release(&mut self) -> Result<(), Error>;
}

pub const SYSFS_GPIO: &str = "/sys/class/gpio";

/// A GPIO driven through the legacy sysfs interface.
#[derive(Debug)]
pub struct SysfsGpio {
    pin: u32,
    base: PathBuf,
    settle: Duration,
    value: Option<File>,
    current: Option<Direction>,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self::with_base(pin, SYSFS_GPIO)
    }

    /// Use another sysfs root, mostly for tests.
    pub fn with_base(pin: u32, base: impl AsRef<Path>) -> Self {
        Self {
            pin,
            base: base.as_ref().to_owned(),
            settle: Duration::from_millis(100),
            value: None,
            current: None,
        }
    }

    /// Time to wait for the pin directory to show up after export.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn pin_path(&self, file: &str) -> PathBuf {
        self.base.join(format!("gpio{}", self.pin)).join(file)
    }

    fn write_value(&mut self, direction: Direction) -> Result<(), Error> {
        let pin = self.pin;
        let file = self.value.as_mut().context(NotAcquiredSnafu { pin })?;
        file.write_all(direction.value())
            .context(WriteValueSnafu { pin })?;
        self.current = Some(direction);
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .write_all(contents.as_bytes())
}

impl DirectionControl for SysfsGpio {
    fn acquire(&mut self) -> Result<(), Error> {
        let pin = self.pin;
        // fails with EBUSY when already exported
        if let Err(err) = write_file(&self.base.join("export"), &pin.to_string()) {
            warn!("Export of GPIO {} failed, assuming it is exported: {}", pin, err);
        }
        thread::sleep(self.settle);
        write_file(&self.pin_path("direction"), "out").context(ConfigureSnafu { pin })?;
        let value = OpenOptions::new()
            .write(true)
            .open(self.pin_path("value"))
            .context(OpenValueSnafu { pin })?;
        self.value = Some(value);
        self.current = None;
        self.write_value(Direction::Receive)?;
        debug!("GPIO {} acquired", pin);
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), Error> {
        if self.current == Some(direction) {
            return Ok(());
        }
        self.write_value(direction)
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.value.is_none() {
            return Ok(());
        }
        let result = self.set_direction(Direction::Receive);
        self.value = None;
        self.current = None;
        result
    }
}

/// In-memory direction control. Clones share the recorded history.
#[derive(Debug, Clone, Default)]
pub struct MemoryGpio {
    history: Arc<Mutex<Vec<Direction>>>,
    acquired: bool,
    current: Option<Direction>,
}

impl MemoryGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level actually written, oldest first.
    pub fn history(&self) -> Vec<Direction> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current(&self) -> Option<Direction> {
        self.current
    }

    fn record(&mut self, direction: Direction) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(direction);
        self.current = Some(direction);
    }
}

impl DirectionControl for MemoryGpio {
    fn acquire(&mut self) -> Result<(), Error> {
        self.acquired = true;
        self.current = None;
        self.record(Direction::Receive);
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), Error> {
        if !self.acquired {
            return NotAcquiredSnafu { pin: 0u32 }.fail();
        }
        if self.current != Some(direction) {
            self.record(direction);
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.acquired {
            self.set_direction(Direction::Receive)?;
        }
        self.acquired = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sysfs() -> (tempfile::TempDir, SysfsGpio) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        fs::create_dir(dir.path().join("gpio17")).unwrap();
        fs::write(dir.path().join("gpio17/direction"), "").unwrap();
        fs::write(dir.path().join("gpio17/value"), "").unwrap();
        let gpio = SysfsGpio::with_base(17, dir.path()).with_settle(Duration::ZERO);
        (dir, gpio)
    }

    #[test]
    fn test_sysfs_sequence() {
        let (dir, mut gpio) = sysfs();
        gpio.acquire().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "17");
        assert_eq!(
            fs::read_to_string(dir.path().join("gpio17/direction")).unwrap(),
            "out"
        );

        gpio.set_direction(Direction::Transmit).unwrap();
        gpio.set_direction(Direction::Transmit).unwrap();
        gpio.set_direction(Direction::Receive).unwrap();
        gpio.set_direction(Direction::Receive).unwrap();
        gpio.release().unwrap();
        // value file sees each level change once
        assert_eq!(
            fs::read_to_string(dir.path().join("gpio17/value")).unwrap(),
            "010"
        );
    }

    #[test]
    fn test_sysfs_missing_pin() {
        let dir = tempfile::tempdir().unwrap();
        let mut gpio = SysfsGpio::with_base(3, dir.path()).with_settle(Duration::ZERO);
        assert!(matches!(gpio.acquire(), Err(Error::Configure { pin: 3, .. })));
        assert!(matches!(
            gpio.set_direction(Direction::Transmit),
            Err(Error::NotAcquired { pin: 3 })
        ));
        assert!(gpio.release().is_ok());
    }

    #[test]
    fn test_memory_idempotent() {
        let mut gpio = MemoryGpio::new();
        let observer = gpio.clone();
        assert!(gpio.set_direction(Direction::Transmit).is_err());
        gpio.acquire().unwrap();
        gpio.set_direction(Direction::Receive).unwrap();
        gpio.set_direction(Direction::Transmit).unwrap();
        gpio.set_direction(Direction::Transmit).unwrap();
        gpio.release().unwrap();
        assert_eq!(
            observer.history(),
            vec![Direction::Receive, Direction::Transmit, Direction::Receive]
        );
        assert_eq!(gpio.current(), Some(Direction::Receive));
    }
}
