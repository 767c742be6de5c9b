use nom::branch::alt;
use nom::bytes::streaming::take;
use nom::combinator::{map_res, peek, verify};
use nom::number::streaming::be_u8;
use nom::sequence::tuple;
use nom::Err::Incomplete;
use nom::IResult;

use crate::frame::{
    FixedFrame, Frame, VariableFrame, ASDU_HEADER_LEN, FIXED_LEN, VARIABLE_HEADER_LEN,
};
use crate::{FIXED_START, VARIABLE_START};

type Buf = [u8];

#[derive(PartialEq, Debug, Clone)]
pub(crate) enum FrameToken {
    Frame(Frame),
    /// The first buffered byte can't start a valid frame.
    Discard(u8),
    NeedData,
}

/// Try to take one frame from the front of `buf`.
///
/// Returns the number of bytes to consume together with the token.
pub(crate) fn parse_frame(buf: &Buf) -> (usize, FrameToken) {
    match alt((fixed_frame, variable_frame))(buf) {
        Ok((remaining, frame)) => (buf.len() - remaining.len(), FrameToken::Frame(frame)),
        Err(Incomplete(_)) => (0, FrameToken::NeedData),
        Err(_) => match buf.first() {
            Some(&byte) => (1, FrameToken::Discard(byte)),
            None => (0, FrameToken::NeedData),
        },
    }
}

fn fixed_frame(buf: &Buf) -> IResult<&Buf, Frame> {
    let (_, _start) = peek(byte(FIXED_START))(buf)?;
    map_res(take(FIXED_LEN), |bytes: &Buf| {
        FixedFrame::decode(bytes).map(Frame::Fixed)
    })(buf)
}

fn variable_frame(buf: &Buf) -> IResult<&Buf, Frame> {
    let (_, (_, len, _, _)) = peek(variable_header)(buf)?;
    let total = VARIABLE_HEADER_LEN + usize::from(len) + 2;
    map_res(take(total), |bytes: &Buf| {
        VariableFrame::decode(bytes).map(Frame::Variable)
    })(buf)
}

/// `68 L L 68` with both length fields equal and large enough for an ASDU header.
fn variable_header(buf: &Buf) -> IResult<&Buf, (u8, u8, u8, u8)> {
    verify(
        tuple((byte(VARIABLE_START), be_u8, be_u8, byte(VARIABLE_START))),
        |(_, first, second, _)| first == second && usize::from(*first) >= ASDU_HEADER_LEN,
    )(buf)
}

fn byte<'a>(expected: u8) -> impl FnMut(&'a Buf) -> IResult<&'a Buf, u8> {
    verify(be_u8, move |b: &u8| *b == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::types::{Cause, ControlField, TypeId};

    const RESET_LINK: &[u8] = b"\x10\x40\x01\x00\x41\x16";

    fn total_call() -> Vec<u8> {
        VariableFrame::new(
            ControlField::from_byte(0x73),
            1,
            TypeId::TotalCall,
            Cause::ACTIVATION,
            1,
        )
        .with_data(&[0x14])
        .unwrap()
        .encode()
        .to_vec()
    }

    #[test]
    fn test_fixed_frame() {
        let (len, token) = parse_frame(RESET_LINK);
        assert_eq!(len, 6);
        assert!(matches!(token, FrameToken::Frame(Frame::Fixed(f)) if *f.control == 0x40));

        let mut buf = Buffer::new();
        buf.write(&RESET_LINK[..5]);
        assert_eq!(parse_frame(buf.as_ref()), (0, FrameToken::NeedData));
        assert_eq!(parse_frame(b""), (0, FrameToken::NeedData));
    }

    #[test]
    fn test_variable_needs_whole_frame() {
        let bytes = total_call();
        let len = usize::from(bytes[1]);
        assert_eq!(bytes.len(), 4 + len + 2);
        for n in 1..bytes.len() {
            assert_eq!(parse_frame(&bytes[..n]), (0, FrameToken::NeedData), "n = {}", n);
        }
        let (consumed, token) = parse_frame(&bytes);
        assert_eq!(consumed, bytes.len());
        assert!(matches!(token, FrameToken::Frame(Frame::Variable(_))));
    }

    #[test]
    fn test_trailing_bytes_are_kept() {
        let mut bytes = RESET_LINK.to_vec();
        bytes.extend_from_slice(&total_call());
        let (consumed, _) = parse_frame(&bytes);
        assert_eq!(consumed, 6);
        let (consumed, token) = parse_frame(&bytes[6..]);
        assert_eq!(consumed, bytes.len() - 6);
        assert!(matches!(token, FrameToken::Frame(Frame::Variable(_))));
    }

    #[test]
    fn test_garbage_is_discarded() {
        assert_eq!(parse_frame(b"\x00\x10"), (1, FrameToken::Discard(0x00)));
        assert_eq!(parse_frame(b"\xff"), (1, FrameToken::Discard(0xff)));
    }

    #[test]
    fn test_invalid_frames_are_discarded() {
        // bad checksum
        assert_eq!(
            parse_frame(b"\x10\x40\x01\x00\x42\x16"),
            (1, FrameToken::Discard(0x10))
        );
        // bad end byte
        assert_eq!(
            parse_frame(b"\x10\x40\x01\x00\x41\x00"),
            (1, FrameToken::Discard(0x10))
        );
        // length fields disagree
        assert_eq!(
            parse_frame(b"\x68\x0b\x0c\x68"),
            (1, FrameToken::Discard(0x68))
        );
        // too short to hold an ASDU header
        assert_eq!(
            parse_frame(b"\x68\x02\x02\x68"),
            (1, FrameToken::Discard(0x68))
        );

        let mut bytes = total_call();
        let cs = bytes.len() - 2;
        bytes[cs] ^= 0xff;
        assert_eq!(parse_frame(&bytes), (1, FrameToken::Discard(0x68)));
    }
}
