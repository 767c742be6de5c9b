//! This module defines the typed header fields of IEC101 frames: the link
//! control byte, link function codes, type identifiers and causes of
//! transmission.

use core::convert::TryFrom;
use core::ops::Deref;

use snafu::Snafu;

/// Error type for this module
#[derive(Debug, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The control byte carries a function code this outstation doesn't handle.
    #[snafu(display("Unknown link function code {:#04x}", code))]
    UnknownFunction { code: u8 },
    /// The ASDU type identifier isn't one this outstation handles.
    #[snafu(display("Unknown type identifier {:#04x}", ti))]
    UnknownTypeId { ti: u8 },
    /// The file service operate code is unknown.
    #[snafu(display("Unknown file operation {:#04x}", code))]
    UnknownFileOperation { code: u8 },
}

/// The link layer control byte.
///
/// ```text
///  bit  7    6    5    4    3..0
///      DIR  PRM  FCB  FCV  function
/// ```
///
/// ## Example
/// ```
/// use iec101_bridge::ControlField;
/// let ctrl = ControlField::from_byte(0x40);
/// assert!(!ctrl.direction_up());
/// assert!(ctrl.primary());
/// assert_eq!(ctrl.function(), 0);
/// ```
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct ControlField(u8);

impl ControlField {
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Assemble a control byte from its fields. Only the low four bits of
    /// `function` are used.
    pub const fn new(direction_up: bool, primary: bool, fcb: bool, fcv: bool, function: u8) -> Self {
        let mut byte = function & 0x0f;
        if direction_up {
            byte |= 0x80;
        }
        if primary {
            byte |= 0x40;
        }
        if fcb {
            byte |= 0x20;
        }
        if fcv {
            byte |= 0x10;
        }
        Self(byte)
    }

    /// Control byte for a frame sent by this outstation (DIR = 1).
    pub const fn up(primary: bool, function: FunctionCode) -> Self {
        Self::new(true, primary, false, false, function as u8)
    }

    /// DIR bit, set for frames sent towards the master.
    pub const fn direction_up(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// PRM bit, set when the sender is the primary (initiating) station.
    pub const fn primary(self) -> bool {
        self.0 & 0x40 != 0
    }

    pub const fn fcb(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub const fn fcv(self) -> bool {
        self.0 & 0x10 != 0
    }

    pub const fn function(self) -> u8 {
        self.0 & 0x0f
    }

    /// The function code as a typed value.
    /// # Errors
    /// Returns [`Error::UnknownFunction`] for codes the outstation doesn't handle.
    pub fn function_code(self) -> Result<FunctionCode, Error> {
        FunctionCode::try_from(self.function())
    }
}

impl Deref for ControlField {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Link layer function codes used on fixed frames.
///
/// Primary and secondary directions reuse the same numbers, so
/// `ResetLink` is also the positive acknowledgement and `LinkStatus`
/// is the "respond link status" reply.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ResetLink = 0x00,
    TestLink = 0x02,
    UserData = 0x03,
    UserDataNoReply = 0x04,
    RequestLinkState = 0x09,
    LinkStatus = 0x0b,
}

impl TryFrom<u8> for FunctionCode {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use FunctionCode::*;
        Ok(match code {
            0x00 => ResetLink,
            0x02 => TestLink,
            0x03 => UserData,
            0x04 => UserDataNoReply,
            0x09 => RequestLinkState,
            0x0b => LinkStatus,
            code => return UnknownFunctionSnafu { code }.fail(),
        })
    }
}

/// ASDU type identifiers handled by the outstation.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// M_EI_NA_1, end of initialization
    InitEnds = 0x46,
    /// C_IC_NA_1, station interrogation ("total call")
    TotalCall = 0x64,
    /// C_CS_NA_1, clock synchronization
    ClockSync = 0x67,
    /// C_TS_NA_1, test command
    TestCommand = 0x68,
    /// C_RP_NA_1, reset process
    ResetProcess = 0x69,
    /// F_FR_NA_1, file service
    FileTransfer = 0xd2,
}

impl TypeId {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TypeId {
    type Error = Error;

    fn try_from(ti: u8) -> Result<Self, Self::Error> {
        use TypeId::*;
        Ok(match ti {
            0x46 => InitEnds,
            0x64 => TotalCall,
            0x67 => ClockSync,
            0x68 => TestCommand,
            0x69 => ResetProcess,
            0xd2 => FileTransfer,
            ti => return UnknownTypeIdSnafu { ti }.fail(),
        })
    }
}

/// Cause of transmission, sent as a little endian u16.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Cause(u16);

impl Cause {
    pub const INIT_COMPLETE: Cause = Cause(0x04);
    /// Request / requested. Used by the master to read the clock.
    pub const REQUEST: Cause = Cause(0x05);
    /// Activation. Used by the master to write the clock.
    pub const ACTIVATION: Cause = Cause(0x06);
    pub const ACTIVATION_CONFIRM: Cause = Cause(0x07);
    pub const ACTIVATION_TERMINATION: Cause = Cause(0x0a);

    pub const fn new(cause: u16) -> Self {
        Self(cause)
    }

    pub const fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl Deref for Cause {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Qualifier of interrogation for a station wide total call.
pub const QOI_STATION: u8 = 0x14;
/// Qualifier of reset process for a general reset.
pub const QRP_GENERAL_RESET: u8 = 0x01;

/// Operate codes of the file service (second byte of a F_FR_NA_1 payload).
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum FileOperation {
    DirReadActivate = 0x01,
    DirReadConfirm = 0x02,
    FileReadActivate = 0x03,
    FileReadConfirm = 0x04,
    FileReadData = 0x05,
    FileReadDataResponse = 0x06,
}

impl TryFrom<u8> for FileOperation {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use FileOperation::*;
        Ok(match code {
            0x01 => DirReadActivate,
            0x02 => DirReadConfirm,
            0x03 => FileReadActivate,
            0x04 => FileReadConfirm,
            0x05 => FileReadData,
            0x06 => FileReadDataResponse,
            code => return UnknownFileOperationSnafu { code }.fail(),
        })
    }
}

#[cfg(test)]
mod control_tests {
    use super::*;

    #[test]
    fn test_control_bits() {
        let ctrl = ControlField::from_byte(0x80);
        assert!(ctrl.direction_up());
        assert!(!ctrl.primary());
        assert_eq!(ctrl.function_code(), Ok(FunctionCode::ResetLink));

        let ctrl = ControlField::from_byte(0xf3);
        assert!(ctrl.direction_up() && ctrl.primary() && ctrl.fcb() && ctrl.fcv());
        assert_eq!(ctrl.function(), 3);

        assert_eq!(
            ControlField::from_byte(0x4e).function_code(),
            Err(Error::UnknownFunction { code: 0x0e })
        );
    }

    #[test]
    fn test_control_new() {
        assert_eq!(*ControlField::up(false, FunctionCode::ResetLink), 0x80);
        assert_eq!(*ControlField::up(true, FunctionCode::RequestLinkState), 0xc9);
        assert_eq!(*ControlField::up(false, FunctionCode::LinkStatus), 0x8b);
        assert_eq!(*ControlField::new(true, true, true, true, 0x03), 0xf3);
        assert_eq!(*ControlField::new(false, true, false, false, 0xf0), 0x40);
    }
}

#[cfg(test)]
mod type_id_tests {
    use super::*;

    #[test]
    fn test_type_id() {
        for ti in [0x46, 0x64, 0x67, 0x68, 0x69, 0xd2] {
            assert_eq!(TypeId::try_from(ti).map(TypeId::as_byte), Ok(ti));
        }
        assert_eq!(TypeId::try_from(0x01), Err(Error::UnknownTypeId { ti: 0x01 }));
    }

    #[test]
    fn test_cause_bytes() {
        assert_eq!(Cause::ACTIVATION_CONFIRM.to_le_bytes(), [0x07, 0x00]);
        assert_eq!(*Cause::new(0x0106), 0x0106);
    }
}
