//! IEC101 link frames.
//!
//! ```text
//! fixed:    10 | C | A lo | A hi | CS | 16
//! variable: 68 | L | L | 68 | C | A(2) | TI | VSQ | COT(2) | CA(2) | IOA(2) | data.. | CS | 16
//! ```
//!
//! `L` counts the bytes from `C` up to the last data byte, and `CS` is the
//! sum modulo 256 of the same bytes. For fixed frames `CS` covers `C` and the
//! address.

use arrayvec::ArrayVec;
use core::convert::TryFrom;
use snafu::{ensure, Snafu};

use crate::types::{self, Cause, ControlField, TypeId};
use crate::{checksum, FIXED_START, FRAME_END, VARIABLE_START};

/// Length of a fixed frame on the wire.
pub const FIXED_LEN: usize = 6;
/// Bytes from the control byte up to the first data byte of a variable frame.
pub const ASDU_HEADER_LEN: usize = 11;
/// Start, length, length, start.
pub const VARIABLE_HEADER_LEN: usize = 4;
/// Largest number of data bytes a variable frame can carry.
pub const MAX_DATA_LEN: usize = u8::MAX as usize - ASDU_HEADER_LEN;
/// Largest frame on the wire.
pub const MAX_FRAME_LEN: usize = VARIABLE_HEADER_LEN + u8::MAX as usize + 2;
/// Smallest well formed variable frame, one without data.
pub const MIN_VARIABLE_LEN: usize = VARIABLE_HEADER_LEN + ASDU_HEADER_LEN + 2;

/// Encoded frame, ready to be written to the port.
pub type FrameBytes = ArrayVec<u8, MAX_FRAME_LEN>;
/// Application data carried by a variable frame.
pub type AsduData = ArrayVec<u8, MAX_DATA_LEN>;

#[derive(Debug, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid frame length {}", len))]
    BadLength { len: usize },
    #[snafu(display("Invalid start byte {:#04x}", byte))]
    BadStart { byte: u8 },
    #[snafu(display("Length fields disagree: {} != {}", first, second))]
    LengthMismatch { first: u8, second: u8 },
    #[snafu(display("Invalid end byte {:#04x}", byte))]
    BadEnd { byte: u8 },
    #[snafu(display("Checksum mismatch, received {:#04x}, computed {:#04x}", received, computed))]
    BadChecksum { received: u8, computed: u8 },
    #[snafu(display("ASDU data too long, {} bytes", len))]
    DataTooLong { len: usize },
}

/// A six byte control-only frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedFrame {
    pub control: ControlField,
    pub address: u16,
}

impl FixedFrame {
    pub const fn new(control: ControlField, address: u16) -> Self {
        Self { control, address }
    }

    pub fn encode(&self) -> [u8; FIXED_LEN] {
        let [lo, hi] = self.address.to_le_bytes();
        let control = *self.control;
        [
            FIXED_START,
            control,
            lo,
            hi,
            checksum(&[control, lo, hi]),
            FRAME_END,
        ]
    }

    /// Parse and validate a complete fixed frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        ensure!(bytes.len() == FIXED_LEN, BadLengthSnafu { len: bytes.len() });
        ensure!(bytes[0] == FIXED_START, BadStartSnafu { byte: bytes[0] });
        ensure!(bytes[5] == FRAME_END, BadEndSnafu { byte: bytes[5] });
        let computed = checksum(&bytes[1..4]);
        ensure!(
            bytes[4] == computed,
            BadChecksumSnafu {
                received: bytes[4],
                computed
            }
        );
        Ok(Self {
            control: ControlField::from_byte(bytes[1]),
            address: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// A length prefixed frame carrying one ASDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableFrame {
    pub control: ControlField,
    pub address: u16,
    /// Raw type identifier, see [`VariableFrame::type_id()`].
    pub type_id: u8,
    /// Variable structure qualifier.
    pub vsq: u8,
    pub cause: Cause,
    pub common_address: u16,
    /// Information object address.
    pub ioa: u16,
    pub data: AsduData,
}

impl VariableFrame {
    /// A frame with a single information object (VSQ = 1), IOA 0 and no data.
    pub fn new(
        control: ControlField,
        address: u16,
        type_id: TypeId,
        cause: Cause,
        common_address: u16,
    ) -> Self {
        Self {
            control,
            address,
            type_id: type_id.as_byte(),
            vsq: 0x01,
            cause,
            common_address,
            ioa: 0,
            data: AsduData::new(),
        }
    }

    /// Append application data.
    /// # Errors
    /// Returns [`Error::DataTooLong`] if the frame would exceed [`MAX_DATA_LEN`].
    pub fn extend_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len = self.data.len() + bytes.len();
        self.data
            .try_extend_from_slice(bytes)
            .map_err(|_| Error::DataTooLong { len })
    }

    /// Builder form of [`extend_data()`](Self::extend_data()).
    pub fn with_data(mut self, bytes: &[u8]) -> Result<Self, Error> {
        self.extend_data(bytes)?;
        Ok(self)
    }

    /// The type identifier, if it is one the outstation handles.
    pub fn type_id(&self) -> Result<TypeId, types::Error> {
        TypeId::try_from(self.type_id)
    }

    /// The first data byte, which is the qualifier for commands.
    pub fn qualifier(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Value of the length fields.
    pub fn user_data_len(&self) -> u8 {
        // data is capped at MAX_DATA_LEN, so this can't overflow
        (ASDU_HEADER_LEN + self.data.len()) as u8
    }

    pub fn encode(&self) -> FrameBytes {
        let len = self.user_data_len();
        let mut out = FrameBytes::new();
        out.push(VARIABLE_START);
        out.push(len);
        out.push(len);
        out.push(VARIABLE_START);
        out.push(*self.control);
        out.extend(self.address.to_le_bytes());
        out.push(self.type_id);
        out.push(self.vsq);
        out.extend(self.cause.to_le_bytes());
        out.extend(self.common_address.to_le_bytes());
        out.extend(self.ioa.to_le_bytes());
        out.extend(self.data.iter().copied());
        let cs = checksum(&out[VARIABLE_HEADER_LEN..]);
        out.push(cs);
        out.push(FRAME_END);
        out
    }

    /// Parse and validate a complete variable frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let len = bytes.len();
        ensure!(
            (MIN_VARIABLE_LEN..=MAX_FRAME_LEN).contains(&len),
            BadLengthSnafu { len }
        );
        ensure!(bytes[0] == VARIABLE_START, BadStartSnafu { byte: bytes[0] });
        ensure!(bytes[3] == VARIABLE_START, BadStartSnafu { byte: bytes[3] });
        ensure!(
            bytes[1] == bytes[2],
            LengthMismatchSnafu {
                first: bytes[1],
                second: bytes[2]
            }
        );
        ensure!(
            usize::from(bytes[1]) + VARIABLE_HEADER_LEN + 2 == len,
            BadLengthSnafu { len }
        );
        ensure!(bytes[len - 1] == FRAME_END, BadEndSnafu { byte: bytes[len - 1] });
        let computed = checksum(&bytes[VARIABLE_HEADER_LEN..len - 2]);
        ensure!(
            bytes[len - 2] == computed,
            BadChecksumSnafu {
                received: bytes[len - 2],
                computed
            }
        );

        let le = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let mut data = AsduData::new();
        // length was checked against MAX_FRAME_LEN above
        data.extend(bytes[15..len - 2].iter().copied());
        Ok(Self {
            control: ControlField::from_byte(bytes[4]),
            address: le(5),
            type_id: bytes[7],
            vsq: bytes[8],
            cause: Cause::new(le(9)),
            common_address: le(11),
            ioa: le(13),
            data,
        })
    }
}

/// Either frame shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Fixed(FixedFrame),
    Variable(VariableFrame),
}

impl Frame {
    pub fn encode(&self) -> FrameBytes {
        match self {
            Frame::Fixed(frame) => frame.encode().into_iter().collect(),
            Frame::Variable(frame) => frame.encode(),
        }
    }

    /// Parse a complete frame, picking the shape from the start byte.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.first() {
            Some(&FIXED_START) => FixedFrame::decode(bytes).map(Frame::Fixed),
            Some(&VARIABLE_START) => VariableFrame::decode(bytes).map(Frame::Variable),
            Some(&byte) => BadStartSnafu { byte }.fail(),
            None => BadLengthSnafu { len: 0usize }.fail(),
        }
    }
}

impl From<FixedFrame> for Frame {
    fn from(frame: FixedFrame) -> Self {
        Frame::Fixed(frame)
    }
}

impl From<VariableFrame> for Frame {
    fn from(frame: VariableFrame) -> Self {
        Frame::Variable(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionCode;

    #[test]
    fn test_fixed_encode() {
        let ack = FixedFrame::new(ControlField::up(false, FunctionCode::ResetLink), 1);
        assert_eq!(ack.encode(), [0x10, 0x80, 0x01, 0x00, 0x81, 0x16]);
        assert_eq!(FixedFrame::decode(&ack.encode()), Ok(ack));
    }

    #[test]
    fn test_fixed_decode_errors() {
        assert_eq!(
            FixedFrame::decode(&[0x10, 0x40, 0x01, 0x00, 0x42, 0x16]),
            Err(Error::BadChecksum {
                received: 0x42,
                computed: 0x41
            })
        );
        assert_eq!(
            FixedFrame::decode(&[0x10, 0x40, 0x01, 0x00, 0x41, 0x17]),
            Err(Error::BadEnd { byte: 0x17 })
        );
        assert!(FixedFrame::decode(&[0x10, 0x40, 0x01, 0x00, 0x41]).is_err());
    }

    #[test]
    fn test_variable_encode() {
        let frame = VariableFrame::new(
            ControlField::from_byte(0xc3),
            1,
            TypeId::InitEnds,
            Cause::INIT_COMPLETE,
            1,
        )
        .with_data(&[0x02])
        .unwrap();
        let bytes = frame.encode();
        assert_eq!(
            bytes.as_slice(),
            &[
                0x68, 0x0c, 0x0c, 0x68, 0xc3, 0x01, 0x00, 0x46, 0x01, 0x04, 0x00, 0x01, 0x00,
                0x00, 0x00, 0x02, 0x5a, 0x16
            ]
        );
        assert_eq!(VariableFrame::decode(&bytes), Ok(frame));
    }

    #[test]
    fn test_variable_checksum_covers_data() {
        let frame = VariableFrame::new(
            ControlField::from_byte(0x83),
            1,
            TypeId::TestCommand,
            Cause::ACTIVATION_CONFIRM,
            1,
        )
        .with_data(&[0xaa, 0x55])
        .unwrap();
        let bytes = frame.encode();
        let len = bytes.len();
        assert_eq!(bytes[len - 2], checksum(&bytes[4..len - 2]));

        for i in 4..len - 2 {
            let mut mutated = bytes.clone();
            mutated[i] = mutated[i].wrapping_add(1);
            assert!(matches!(
                VariableFrame::decode(&mutated),
                Err(Error::BadChecksum { .. })
            ));
        }
    }

    #[test]
    fn test_variable_decode_errors() {
        let bytes = VariableFrame::new(
            ControlField::from_byte(0x83),
            1,
            TypeId::TotalCall,
            Cause::ACTIVATION_CONFIRM,
            1,
        )
        .encode();
        let mut bad = bytes.clone();
        bad[2] = 0x0c;
        assert_eq!(
            VariableFrame::decode(&bad),
            Err(Error::LengthMismatch {
                first: 0x0b,
                second: 0x0c
            })
        );
        assert!(matches!(
            VariableFrame::decode(&bytes[..bytes.len() - 1]),
            Err(Error::BadLength { .. })
        ));
    }

    #[test]
    fn test_data_too_long() {
        let mut frame = VariableFrame::new(
            ControlField::from_byte(0xc3),
            1,
            TypeId::FileTransfer,
            Cause::REQUEST,
            1,
        );
        assert!(frame.extend_data(&[0; MAX_DATA_LEN]).is_ok());
        assert_eq!(frame.user_data_len(), 0xff);
        assert_eq!(
            frame.extend_data(&[0]),
            Err(Error::DataTooLong {
                len: MAX_DATA_LEN + 1
            })
        );
        assert_eq!(frame.encode().len(), MAX_FRAME_LEN);
    }
}
