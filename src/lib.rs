//! IEC 60870-5-101 outstation and serial frame bridge.
//!
//! The crate is split the same way the data flows:
//!
//! * [`transport`] and [`gpio`] own the physical port, including RS-485
//!   direction control around every transmission.
//! * [`assembler`] turns the raw byte stream into IEC101 [`frame`]s.
//! * [`agent`] is the outstation state machine, answering a legacy master.
//!   It uses [`cp56time`] for time stamps and [`file_transfer`] for the
//!   directory/file services.
//! * [`router`] is the alternate path, cutting the byte stream into frames of
//!   custom protocols and publishing them on a [`bus`].
//! * [`supervisor`] runs one pipeline per port and reconnects on failure.

pub mod agent;
pub mod assembler;
mod buffer;
pub mod bus;
pub mod config;
pub mod cp56time;
pub mod file_transfer;
pub mod frame;
pub mod gpio;
mod nom_parser;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use agent::{Agent, AgentConfig, EventFlag};
pub use assembler::FrameAssembler;
pub use frame::{FixedFrame, Frame, VariableFrame};
pub use supervisor::{Shutdown, Supervisor};
pub use types::{Cause, ControlField, FunctionCode, TypeId};

/// Start byte of a fixed length frame.
pub const FIXED_START: u8 = 0x10;
/// Start byte of a variable length frame, repeated after the length fields.
pub const VARIABLE_START: u8 = 0x68;
/// Last byte of every frame.
pub const FRAME_END: u8 = 0x16;

/// IEC101 frame checksum: the arithmetic sum of `data` modulo 256.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}
