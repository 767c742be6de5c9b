use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use iec101_bridge::transport::{Error, Transport};

type RxT = Arc<Mutex<VecDeque<u8>>>;

/// A two-station serial line: what one end writes the other end reads.
#[derive(Default)]
pub struct SerialLine {
    to_master: RxT,
    to_station: RxT,
    master_data_available: Condvar,
    station_data_available: Condvar,
    eof: AtomicBool,
}

impl SerialLine {
    pub fn new() -> Arc<SerialLine> {
        Default::default()
    }

    /// Cut the line; blocked readers wake up and see the port closed.
    pub fn disconnect(&self) {
        self.eof.store(true, SeqCst);
        self.master_data_available.notify_all();
        self.station_data_available.notify_all();
    }

    pub fn master_interface(self: &Arc<Self>) -> LineInterface {
        LineInterface::new(Arc::clone(self), true)
    }

    pub fn station_interface(self: &Arc<Self>) -> LineInterface {
        LineInterface::new(Arc::clone(self), false)
    }
}

pub struct LineInterface {
    line: Arc<SerialLine>,
    is_master: bool,
    name: String,
    pub timeout: Duration,
}

impl LineInterface {
    fn new(line: Arc<SerialLine>, is_master: bool) -> LineInterface {
        LineInterface {
            line,
            is_master,
            name: if is_master { "master" } else { "station" }.to_owned(),
            timeout: Duration::from_millis(50),
        }
    }

    fn queues(&self) -> (&RxT, &Condvar, &RxT, &Condvar) {
        let line = &*self.line;
        if self.is_master {
            (
                &line.to_master,
                &line.master_data_available,
                &line.to_station,
                &line.station_data_available,
            )
        } else {
            (
                &line.to_station,
                &line.station_data_available,
                &line.to_master,
                &line.master_data_available,
            )
        }
    }
}

impl Transport for LineInterface {
    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let (rx, available, _, _) = self.queues();
        let mut rx = rx.lock().expect("Read mutex is poisoned");
        if rx.is_empty() && !self.line.eof.load(SeqCst) {
            rx = available
                .wait_timeout(rx, self.timeout)
                .expect("Mutex lock failed")
                .0;
        }
        if rx.is_empty() {
            return if self.line.eof.load(SeqCst) {
                Err(Error::Closed {
                    name: self.name.clone(),
                })
            } else {
                Ok(0)
            };
        }
        let len = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let (_, _, tx, available) = self.queues();
        tx.lock().unwrap().extend(buf);
        available.notify_all();
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
