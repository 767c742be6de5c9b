//! The IEC101 outstation. See [`Agent`] for more details.

use std::io;
use std::path::PathBuf;
use std::process::Command;

use chrono::{Local, NaiveDateTime};
use log::{debug, info, warn};
use snafu::{ensure, ResultExt, Snafu};

use crate::cp56time;
use crate::file_transfer::{self, DirectoryCursor, DirectoryRequest, FileReadCursor};
use crate::frame::{FixedFrame, Frame, VariableFrame};
use crate::types::{
    Cause, ControlField, FileOperation, FunctionCode, TypeId, QOI_STATION, QRP_GENERAL_RESET,
};

/// Positive acknowledgement, DIR = 1, function 0.
const CTRL_ACK: ControlField = ControlField::up(false, FunctionCode::ResetLink);
/// Reset process announcement, DIR = 1, PRM = 1, function 9.
const CTRL_RESET_PROCESS: ControlField = ControlField::up(true, FunctionCode::RequestLinkState);
const CTRL_LINK_STATUS: ControlField = ControlField::up(false, FunctionCode::LinkStatus);
/// Acknowledgement of a "respond link status" frame.
const CTRL_STATUS_ACK: ControlField = ControlField::up(true, FunctionCode::ResetLink);
/// User data sent on our own initiative.
const CTRL_DATA_PRIMARY: ControlField = ControlField::up(true, FunctionCode::UserData);
/// User data answering a request.
const CTRL_DATA_SECONDARY: ControlField = ControlField::up(false, FunctionCode::UserData);
const CTRL_TERMINATION: ControlField = ControlField::new(true, true, true, true, 0x03);

/// Cause of initialization reported in "init ends": local reset.
const COI_LOCAL_RESET: u8 = 0x02;
const LINK_TEST_PATTERN: [u8; 2] = [0xaa, 0x55];

#[derive(Debug, Snafu)]
pub enum ClockError {
    #[snafu(display("Failed to run date: {}", source))]
    Spawn { source: io::Error },
    #[snafu(display("date exited with status {:?}", code))]
    Status { code: Option<i32> },
}

/// Source and sink of the local wall clock.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
    fn set(&mut self, time: &NaiveDateTime) -> Result<(), ClockError>;
}

/// The system clock, set by running `date -s`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn set(&mut self, time: &NaiveDateTime) -> Result<(), ClockError> {
        let status = Command::new("date")
            .arg("-s")
            .arg(date_argument(time))
            .status()
            .context(SpawnSnafu)?;
        ensure!(status.success(), StatusSnafu { code: status.code() });
        Ok(())
    }
}

/// Argument for `date -s`. BusyBox rejects fractional seconds.
pub fn date_argument(time: &NaiveDateTime) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub link_address: u16,
    pub common_address: u16,
    /// Directory served by the file service.
    pub file_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            link_address: 1,
            common_address: 1,
            file_root: PathBuf::from("/Emd/data/COMTRADE"),
        }
    }
}

/// The request waiting for the master's link layer acknowledgement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EventFlag {
    #[default]
    None,
    /// The link was reset, "init ends" goes out on the next ack.
    LinkResetPending,
    /// "Total call terminate" goes out on the next ack.
    TotalCallPending,
    ClockSyncPending,
    LinkTestPending,
    ResetProcessPending,
    /// A directory page or file chunk goes out on the next ack.
    FileCallPending,
}

impl EventFlag {
    /// Type identifier echoed by the activation confirmation.
    pub fn type_id(self) -> Option<TypeId> {
        match self {
            EventFlag::None => None,
            EventFlag::LinkResetPending => Some(TypeId::InitEnds),
            EventFlag::TotalCallPending => Some(TypeId::TotalCall),
            EventFlag::ClockSyncPending => Some(TypeId::ClockSync),
            EventFlag::LinkTestPending => Some(TypeId::TestCommand),
            EventFlag::ResetProcessPending => Some(TypeId::ResetProcess),
            EventFlag::FileCallPending => Some(TypeId::FileTransfer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentState {
    pub event: EventFlag,
    /// Set once "init ends" has been sent after a link reset.
    pub running: bool,
    pub directory: Option<DirectoryCursor>,
    pub file: Option<FileReadCursor>,
}

/// IEC101 outstation (controlled station) state machine.
///
/// The agent is sans-io: feed it each frame received from the master and
/// transmit the returned frames, in order, before handing it the next one.
///
/// # Example
///
/// ```
/// use iec101_bridge::{Agent, AgentConfig, EventFlag, Frame};
/// use iec101_bridge::agent::LocalClock;
///
/// let mut agent = Agent::new(AgentConfig::default(), LocalClock);
/// let reset_link = Frame::decode(b"\x10\x40\x01\x00\x41\x16").unwrap();
/// let replies = agent.handle_frame(&reset_link);
/// assert_eq!(replies.len(), 2);
/// assert_eq!(replies[0].encode().as_slice(), b"\x10\x80\x01\x00\x81\x16");
/// assert_eq!(agent.state().event, EventFlag::LinkResetPending);
/// ```
#[derive(Debug)]
pub struct Agent<C> {
    config: AgentConfig,
    state: AgentState,
    clock: C,
}

impl<C: Clock> Agent<C> {
    pub fn new(config: AgentConfig, clock: C) -> Self {
        Self {
            config,
            state: AgentState::default(),
            clock,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Forget everything, used when the port is reopened.
    pub fn reset(&mut self) {
        self.state = AgentState::default();
    }

    /// Process one frame from the master and return the replies.
    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<Frame> {
        let mut out = Vec::new();
        match frame {
            Frame::Fixed(fixed) => self.handle_fixed(fixed, &mut out),
            Frame::Variable(variable) => self.handle_variable(variable, &mut out),
        }
        out
    }

    fn handle_fixed(&mut self, frame: &FixedFrame, out: &mut Vec<Frame>) {
        let control = frame.control;
        let function = match control.function_code() {
            Ok(function) => function,
            Err(err) => {
                warn!("Dropping fixed frame: {}", err);
                return;
            }
        };

        match function {
            FunctionCode::ResetLink if !control.direction_up() && control.primary() => {
                info!("Reset link requested");
                self.fixed(out, CTRL_ACK);
                self.fixed(out, CTRL_RESET_PROCESS);
                self.state.running = false;
                self.state.event = EventFlag::LinkResetPending;
            }
            FunctionCode::ResetLink if control.direction_up() && !control.primary() => {
                self.acknowledged(out);
            }
            FunctionCode::TestLink => {
                debug!("Link test, acknowledging");
                self.fixed(out, CTRL_ACK);
            }
            FunctionCode::RequestLinkState => {
                debug!("Link state requested");
                self.fixed(out, CTRL_LINK_STATUS);
            }
            FunctionCode::LinkStatus => {
                debug!("Link status received, acknowledging");
                self.fixed(out, CTRL_STATUS_ACK);
            }
            _ => warn!("Dropping fixed frame with control {:#04x}", *control),
        }
    }

    /// The master acknowledged our last frame, send whatever was waiting for it.
    fn acknowledged(&mut self, out: &mut Vec<Frame>) {
        match self.state.event {
            EventFlag::LinkResetPending => {
                info!("Link established, sending init ends");
                self.variable(
                    out,
                    CTRL_DATA_PRIMARY,
                    TypeId::InitEnds,
                    Cause::INIT_COMPLETE,
                    &[COI_LOCAL_RESET],
                );
                self.state.running = true;
                self.state.event = EventFlag::None;
            }
            EventFlag::TotalCallPending => {
                debug!("Total call finished, sending termination");
                self.total_call_termination(out);
                self.state.event = EventFlag::None;
            }
            EventFlag::FileCallPending => {
                // the next page or chunk waits for the master's next file call
                self.state.event = EventFlag::None;
                self.next_directory_page(out);
                self.next_file_chunk(out);
            }
            event => debug!("Ack received with nothing pending on it ({:?})", event),
        }
    }

    fn handle_variable(&mut self, frame: &VariableFrame, out: &mut Vec<Frame>) {
        let type_id = match frame.type_id() {
            Ok(type_id) => type_id,
            Err(err) => {
                warn!("Dropping variable frame: {}", err);
                return;
            }
        };
        debug!(
            "Received {:?}, cause {}, {} data bytes",
            type_id,
            *frame.cause,
            frame.data.len()
        );

        match type_id {
            TypeId::InitEnds => self.state.event = EventFlag::LinkResetPending,
            TypeId::TotalCall => {
                if frame.qualifier() != Some(QOI_STATION) {
                    warn!("Total call with qualifier {:?} ignored", frame.qualifier());
                    return;
                }
                self.state.event = EventFlag::TotalCallPending;
                self.activation_confirm(out);
                self.total_call_termination(out);
            }
            TypeId::ClockSync => {
                self.state.event = EventFlag::ClockSyncPending;
                self.activation_confirm(out);
                self.clock_sync(frame, out);
            }
            TypeId::TestCommand => {
                self.state.event = EventFlag::LinkTestPending;
                self.activation_confirm(out);
                self.variable(
                    out,
                    CTRL_DATA_SECONDARY,
                    TypeId::TestCommand,
                    Cause::ACTIVATION_CONFIRM,
                    &LINK_TEST_PATTERN,
                );
            }
            TypeId::ResetProcess => {
                if frame.qualifier() != Some(QRP_GENERAL_RESET) {
                    warn!("Reset process with qualifier {:?} ignored", frame.qualifier());
                    return;
                }
                self.state.event = EventFlag::ResetProcessPending;
                self.activation_confirm(out);
            }
            TypeId::FileTransfer => {
                self.state.event = EventFlag::FileCallPending;
                self.activation_confirm(out);
                self.file_call(&frame.data, out);
            }
        }
    }

    fn clock_sync(&mut self, frame: &VariableFrame, out: &mut Vec<Frame>) {
        match frame.cause {
            Cause::REQUEST => {
                let now = cp56time::encode(&self.clock.now());
                self.variable(out, CTRL_DATA_SECONDARY, TypeId::ClockSync, Cause::REQUEST, &now);
            }
            Cause::ACTIVATION => {
                let time = match cp56time::decode(&frame.data) {
                    Ok(time) => time,
                    Err(err) => {
                        warn!("Clock sync: {}", err);
                        return;
                    }
                };
                if let Err(err) = self.clock.set(&time) {
                    warn!("Failed to set the clock to {}: {}", time, err);
                    return;
                }
                info!("Clock set to {}", time);
                self.variable(
                    out,
                    CTRL_DATA_SECONDARY,
                    TypeId::ClockSync,
                    Cause::ACTIVATION_CONFIRM,
                    &cp56time::encode(&time),
                );
            }
            cause => debug!("Clock sync with cause {} only confirmed", *cause),
        }
    }

    fn file_call(&mut self, data: &[u8], out: &mut Vec<Frame>) {
        if data.len() < 2 {
            warn!("File call payload too short ({} bytes)", data.len());
            return;
        }
        let payload = &data[2..];
        match FileOperation::try_from(data[1]) {
            Ok(FileOperation::DirReadActivate) => self.directory_read(payload, out),
            Ok(FileOperation::FileReadActivate) => self.file_read(payload, out),
            Ok(FileOperation::FileReadDataResponse) => debug!("Master confirmed file data"),
            Ok(op) => debug!("Ignoring file operation {:?}", op),
            Err(err) => warn!("{}", err),
        }
    }

    fn directory_read(&mut self, payload: &[u8], out: &mut Vec<Frame>) {
        let request = match DirectoryRequest::parse(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!("Directory read: {}", err);
                return;
            }
        };
        info!(
            "Directory read, call sign {:#04x}, {} to {}",
            request.call_sign, request.start, request.end
        );
        let names = match file_transfer::scan_directory(
            &self.config.file_root,
            &request.start,
            &request.end,
        ) {
            Ok(names) => names,
            Err(err) => {
                warn!("{}", err);
                Vec::new()
            }
        };
        self.state.directory = DirectoryCursor::new(names);
        self.next_directory_page(out);
    }

    fn next_directory_page(&mut self, out: &mut Vec<Frame>) {
        let Some(cursor) = self.state.directory.as_mut() else {
            return;
        };
        if let Some(page) = cursor.next_page(&self.config.file_root) {
            let data = page.encode();
            self.variable(
                out,
                CTRL_DATA_PRIMARY,
                TypeId::FileTransfer,
                Cause::REQUEST,
                &data,
            );
        }
        if self.state.directory.as_ref().map_or(true, DirectoryCursor::is_finished) {
            self.state.directory = None;
        }
    }

    fn file_read(&mut self, payload: &[u8], out: &mut Vec<Frame>) {
        let name = match file_transfer::parse_file_name(payload) {
            Ok(name) => name,
            Err(err) => {
                warn!("File read: {}", err);
                return;
            }
        };
        self.state.file = None;
        let cursor = match FileReadCursor::open(&self.config.file_root, &name) {
            Ok(cursor) if cursor.size() > 0 => Some(cursor),
            Ok(_) => {
                warn!("File {} is empty", name);
                None
            }
            Err(err) => {
                warn!("{}", err);
                None
            }
        };
        let size = cursor
            .as_ref()
            .map(|c| u32::try_from(c.size()).unwrap_or(u32::MAX));
        let data = file_transfer::read_confirm(&name, size);
        let sent = self.variable(
            out,
            CTRL_DATA_PRIMARY,
            TypeId::FileTransfer,
            Cause::ACTIVATION_CONFIRM,
            &data,
        );
        if let (true, Some(cursor)) = (sent, cursor) {
            info!("File read of {}, {} bytes", name, cursor.size());
            self.state.file = Some(cursor);
        }
    }

    fn next_file_chunk(&mut self, out: &mut Vec<Frame>) {
        let Some(cursor) = self.state.file.as_mut() else {
            return;
        };
        match cursor.next_chunk() {
            Ok(chunk) => {
                let data = chunk.encode();
                let finished = !chunk.more;
                self.variable(
                    out,
                    CTRL_DATA_PRIMARY,
                    TypeId::FileTransfer,
                    Cause::REQUEST,
                    &data,
                );
                if finished {
                    info!("File transfer complete");
                    self.state.file = None;
                }
            }
            Err(err) => {
                warn!("File transfer aborted: {}", err);
                self.state.file = None;
            }
        }
    }

    fn activation_confirm(&self, out: &mut Vec<Frame>) {
        let Some(type_id) = self.state.event.type_id() else {
            return;
        };
        self.variable(out, CTRL_DATA_SECONDARY, type_id, Cause::ACTIVATION_CONFIRM, &[]);
    }

    fn total_call_termination(&self, out: &mut Vec<Frame>) {
        self.variable(
            out,
            CTRL_TERMINATION,
            TypeId::TotalCall,
            Cause::ACTIVATION_TERMINATION,
            &[QOI_STATION],
        );
    }

    fn fixed(&self, out: &mut Vec<Frame>, control: ControlField) {
        out.push(FixedFrame::new(control, self.config.link_address).into());
    }

    fn variable(
        &self,
        out: &mut Vec<Frame>,
        control: ControlField,
        type_id: TypeId,
        cause: Cause,
        data: &[u8],
    ) -> bool {
        let frame = VariableFrame::new(
            control,
            self.config.link_address,
            type_id,
            cause,
            self.config.common_address,
        )
        .with_data(data);
        match frame {
            Ok(frame) => {
                out.push(frame.into());
                true
            }
            Err(err) => {
                warn!("Not sending {:?} reply: {}", type_id, err);
                false
            }
        }
    }
}
