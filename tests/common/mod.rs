#![allow(dead_code)]

mod sync;

pub use sync::{LineInterface, SerialLine};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iec101_bridge::transport::{Error, Transport};

/// One scripted event on the receive side.
pub enum Rx {
    Data(Vec<u8>),
    /// The far end went away.
    Close,
}

#[derive(Default)]
pub struct PortState {
    rx: VecDeque<Rx>,
    tx: Vec<Vec<u8>>,
    open_failures: usize,
    opens: usize,
    closes: usize,
    is_open: bool,
}

/// In-memory serial port replaying scripted reads and recording writes.
/// Clones share the same state.
#[derive(Clone)]
pub struct ScriptedPort {
    name: String,
    state: Arc<Mutex<PortState>>,
}

impl ScriptedPort {
    pub fn new(name: &str) -> Self {
        ScriptedPort {
            name: name.to_owned(),
            state: Default::default(),
        }
    }

    pub fn push_rx(&self, data: &[u8]) {
        self.state.lock().unwrap().rx.push_back(Rx::Data(data.to_vec()));
    }

    pub fn push_close(&self) {
        self.state.lock().unwrap().rx.push_back(Rx::Close);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().open_failures = count;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().tx.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().is_open
    }

    /// Wait until `count` writes were made, or panic after `timeout`.
    pub fn wait_written(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        wait_for(timeout, || {
            let written = self.written();
            (written.len() >= count).then_some(written)
        })
    }
}

impl Transport for ScriptedPort {
    fn open(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(Error::NotOpen {
                name: self.name.clone(),
            });
        }
        state.opens += 1;
        state.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.is_open = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let next = self.state.lock().unwrap().rx.pop_front();
        match next {
            Some(Rx::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(Rx::Close) => Err(Error::Closed {
                name: self.name.clone(),
            }),
            None => {
                // read timeout
                thread::sleep(Duration::from_millis(1));
                Ok(0)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.state.lock().unwrap().tx.push(buf.to_vec());
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Poll `check` until it returns a value.
pub fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
