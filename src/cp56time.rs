//! CP56Time2a, the 7 byte time stamp used for clock synchronization and file
//! listings.
//!
//! ```text
//! byte 0-1  milliseconds of the minute, little endian
//! byte 2    minute        (6 bits)
//! byte 3    hour          (5 bits)
//! byte 4    day of month  (5 bits) | day of week << 5 (Sunday = 0)
//! byte 5    month         (4 bits)
//! byte 6    year - 2000   (7 bits)
//! ```
//!
//! Times are local wall clock times, so they are handled as
//! [`NaiveDateTime`]. Representable years are 2000 to 2127.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use snafu::{ensure, OptionExt, Snafu};

pub const CP56_LEN: usize = 7;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("CP56Time needs {} bytes, got {}", CP56_LEN, len))]
    TooShort { len: usize },
    #[snafu(display("Invalid date {}-{:02}-{:02}", year, month, day))]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[snafu(display("Invalid time {:02}:{:02}, {} ms", hour, minute, millis))]
    InvalidTime { hour: u32, minute: u32, millis: u32 },
}

/// Encode a local time. Sub-millisecond precision is dropped and years
/// outside 2000..=2127 wrap.
pub fn encode(time: &NaiveDateTime) -> [u8; CP56_LEN] {
    // a leap second shows up as nanosecond >= 1e9
    let millis = (time.second() * 1000 + (time.nanosecond() / 1_000_000).min(999)) as u16;
    let [ms_lo, ms_hi] = millis.to_le_bytes();
    let weekday = time.weekday().num_days_from_sunday() as u8;
    [
        ms_lo,
        ms_hi,
        time.minute() as u8 & 0x3f,
        time.hour() as u8 & 0x1f,
        (time.day() as u8 & 0x1f) | (weekday << 5),
        time.month() as u8 & 0x0f,
        (time.year() - 2000) as u8 & 0x7f,
    ]
}

/// Decode the first 7 bytes of `bytes`. The weekday bits are ignored.
pub fn decode(bytes: &[u8]) -> Result<NaiveDateTime, Error> {
    ensure!(bytes.len() >= CP56_LEN, TooShortSnafu { len: bytes.len() });

    let millis = u32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let minute = u32::from(bytes[2] & 0x3f);
    let hour = u32::from(bytes[3] & 0x1f);
    let day = u32::from(bytes[4] & 0x1f);
    let month = u32::from(bytes[5] & 0x0f);
    let year = 2000 + i32::from(bytes[6] & 0x7f);

    let date = NaiveDate::from_ymd_opt(year, month, day).context(InvalidDateSnafu {
        year,
        month,
        day,
    })?;
    let time = NaiveTime::from_hms_milli_opt(hour, minute, millis / 1000, millis % 1000)
        .context(InvalidTimeSnafu {
            hour,
            minute,
            millis,
        })?;
    Ok(date.and_time(time))
}
