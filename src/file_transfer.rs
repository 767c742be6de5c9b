//! Directory listing and file read services (F_FR_NA_1).
//!
//! The master asks for the recordings in a time window, gets them back four
//! entries per frame, then reads a file in 220 byte chunks. Each page or
//! chunk is sent after the master acknowledges the previous frame, so both
//! services are modelled as cursors the agent advances.
//!
//! Payload layouts, after the packet type and operate code:
//!
//! ```text
//! directory request   name_len | name | call sign | start CP56 | end CP56
//! directory page      result | dir id (u32) | follow | count | entry * count
//! entry (47 bytes)    name_len | name (34, zero padded) | attr | size (u32) | CP56
//! file read request   name_len | name
//! file read confirm   result | name_len | name | size (u32)
//! file chunk          file id (u32) | offset (u32) | follow | data
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use nom::bytes::complete::{take, take_while_m_n};
use nom::combinator::map;
use nom::sequence::{preceded, tuple};
use nom::IResult;
use snafu::{ensure, ResultExt, Snafu};

use crate::cp56time::{self, CP56_LEN};
use crate::frame::MAX_DATA_LEN;
use crate::types::FileOperation;

/// The only directory the master may list.
pub const DIRECTORY_NAME: &str = "COMTRADE";
/// First payload byte of every file service frame.
pub const PACKET_TYPE: u8 = 0x02;
pub const ENTRIES_PER_PAGE: usize = 4;
pub const ENTRY_LEN: usize = 47;
pub const NAME_FIELD_LEN: usize = 34;
/// Upper bound on the number of files in one listing.
pub const MAX_FILES: usize = 2048;
pub const CHUNK_LEN: usize = 220;
/// Longest name whose read confirmation still fits in one frame.
pub const MAX_FILE_NAME_LEN: usize = MAX_DATA_LEN - 8;

const RESULT_OK: u8 = 0x00;
const RESULT_FAILED: u8 = 0x01;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("File service payload too short: {} bytes, need {}", len, need))]
    PayloadTooShort { len: usize, need: usize },
    #[snafu(display("Directory {:?} can't be listed", name))]
    UnknownDirectory { name: String },
    #[snafu(display("Invalid file name {:?}", name))]
    InvalidFileName { name: String },
    #[snafu(display("File name of {} bytes is longer than {}", len, MAX_FILE_NAME_LEN))]
    FileNameTooLong { len: usize },
    #[snafu(display("Invalid time in directory request: {}", source))]
    RequestTime { source: cp56time::Error },
    #[snafu(display("I/O error on {}: {}", path.display(), source))]
    Io { source: io::Error, path: PathBuf },
}

/// A parsed directory read activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
    pub name: String,
    pub call_sign: u8,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DirectoryRequest {
    /// Parse the payload following the packet type and operate code.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let (name, rest) = length_prefixed(payload)?;
        let need = 1 + 2 * CP56_LEN;
        ensure!(
            rest.len() >= need,
            PayloadTooShortSnafu {
                len: payload.len(),
                need: payload.len() - rest.len() + need
            }
        );
        ensure!(name == DIRECTORY_NAME, UnknownDirectorySnafu { name });
        let start = cp56time::decode(&rest[1..]).context(RequestTimeSnafu)?;
        let end = cp56time::decode(&rest[1 + CP56_LEN..]).context(RequestTimeSnafu)?;
        Ok(Self {
            name,
            call_sign: rest[0],
            start,
            end,
        })
    }
}

/// A parsed file read activation. Only bare file names are accepted.
pub fn parse_file_name(payload: &[u8]) -> Result<String, Error> {
    let (name, _) = length_prefixed(payload)?;
    ensure!(
        name.len() <= MAX_FILE_NAME_LEN,
        FileNameTooLongSnafu { len: name.len() }
    );
    ensure!(
        !name.is_empty() && !name.contains(&['/', '\\'][..]) && name != "." && name != "..",
        InvalidFileNameSnafu { name }
    );
    Ok(name)
}

fn length_prefixed(payload: &[u8]) -> Result<(String, &[u8]), Error> {
    let len = usize::from(*payload.first().unwrap_or(&0));
    ensure!(
        !payload.is_empty() && payload.len() > len,
        PayloadTooShortSnafu {
            len: payload.len(),
            need: len + 1
        }
    );
    let name = String::from_utf8_lossy(&payload[1..=len]).into_owned();
    Ok((name, &payload[len + 1..]))
}

/// Recording time embedded in a file name: a 13 character prefix followed by
/// `YYMMDD_HHMMSS`.
pub fn filename_time(name: &str) -> Option<NaiveDateTime> {
    let (_, (year, month, day, _, hour, minute, second)) = filename_stamp(name.as_bytes()).ok()?;
    NaiveDate::from_ymd_opt(2000 + year as i32, month, day)?.and_hms_opt(hour, minute, second)
}

fn filename_stamp(buf: &[u8]) -> IResult<&[u8], (u32, u32, u32, &[u8], u32, u32, u32)> {
    preceded(
        take(13usize),
        tuple((
            two_digits,
            two_digits,
            two_digits,
            take(1usize),
            two_digits,
            two_digits,
            two_digits,
        )),
    )(buf)
}

fn two_digits(buf: &[u8]) -> IResult<&[u8], u32> {
    map(take_while_m_n(2, 2, |c: u8| c.is_ascii_digit()), |d: &[u8]| {
        u32::from(d[0] - b'0') * 10 + u32::from(d[1] - b'0')
    })(buf)
}

fn is_recording(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("dat") | Some("cfg")
    )
}

/// List the recordings in `root` whose embedded time lies within
/// `start..=end`, sorted by name and capped at [`MAX_FILES`].
pub fn scan_directory(
    root: &Path,
    start: &NaiveDateTime,
    end: &NaiveDateTime,
) -> Result<Vec<String>, Error> {
    let dir = fs::read_dir(root).context(IoSnafu { path: root })?;
    let mut names = Vec::new();
    for entry in dir {
        let entry = entry.context(IoSnafu { path: root })?;
        let path = entry.path();
        if !path.is_file() || !is_recording(&path) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        match filename_time(&name) {
            Some(time) if *start <= time && time <= *end => names.push(name),
            Some(_) => {}
            None => debug!("Skipping {}, no time stamp in name", name),
        }
    }
    names.sort();
    names.truncate(MAX_FILES);
    Ok(names)
}

/// One 47 byte directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
    pub time: Option<NaiveDateTime>,
}

impl DirEntry {
    /// Describe `name` in `root`. A file that can't be stat'ed is reported
    /// with size 0.
    pub fn stat(root: &Path, name: &str) -> Self {
        let size = match fs::metadata(root.join(name)) {
            Ok(meta) => u32::try_from(meta.len()).unwrap_or(u32::MAX),
            Err(err) => {
                warn!("Can't stat {}: {}", name, err);
                0
            }
        };
        Self {
            name: name.to_owned(),
            size,
            time: filename_time(name),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut out = [0u8; ENTRY_LEN];
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_FIELD_LEN);
        out[0] = len as u8;
        out[1..=len].copy_from_slice(&name[..len]);
        let off = 1 + NAME_FIELD_LEN;
        out[off] = 0x00; // attribute
        out[off + 1..off + 5].copy_from_slice(&self.size.to_le_bytes());
        if let Some(time) = &self.time {
            out[off + 5..].copy_from_slice(&cp56time::encode(time));
        }
        out
    }
}

/// Pages of a directory listing waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCursor {
    names: Vec<String>,
    page: usize,
    pages: usize,
    last_page_len: usize,
}

impl DirectoryCursor {
    /// `None` when there is nothing to list.
    pub fn new(names: Vec<String>) -> Option<Self> {
        let n = names.len();
        if n == 0 {
            return None;
        }
        let pages = (n + ENTRIES_PER_PAGE - 1) / ENTRIES_PER_PAGE;
        let last_page_len = match n % ENTRIES_PER_PAGE {
            0 => ENTRIES_PER_PAGE,
            rest => rest,
        };
        Some(Self {
            names,
            page: 0,
            pages,
            last_page_len,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Index of the next page to send.
    pub fn page_index(&self) -> usize {
        self.page
    }

    pub fn last_page_len(&self) -> usize {
        self.last_page_len
    }

    pub fn is_finished(&self) -> bool {
        self.page >= self.pages
    }

    /// Build the next page and advance.
    pub fn next_page(&mut self, root: &Path) -> Option<DirectoryPage> {
        if self.is_finished() {
            return None;
        }
        let last = self.page + 1 == self.pages;
        let count = if last {
            self.last_page_len
        } else {
            ENTRIES_PER_PAGE
        };
        let first = self.page * ENTRIES_PER_PAGE;
        let entries = self.names[first..first + count]
            .iter()
            .map(|name| DirEntry::stat(root, name))
            .collect();
        self.page += 1;
        Some(DirectoryPage { last, entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPage {
    pub last: bool,
    pub entries: Vec<DirEntry>,
}

impl DirectoryPage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.entries.len() * ENTRY_LEN);
        out.extend([
            PACKET_TYPE,
            FileOperation::DirReadConfirm as u8,
            RESULT_OK,
        ]);
        out.extend(0u32.to_le_bytes()); // directory id
        out.push(u8::from(!self.last));
        out.push(self.entries.len() as u8);
        for entry in &self.entries {
            out.extend(entry.encode());
        }
        out
    }
}

/// Payload answering a file read activation. `size` is `None` when the file
/// couldn't be opened or is empty.
pub fn read_confirm(name: &str, size: Option<u32>) -> Vec<u8> {
    let name = name.as_bytes();
    let len = name.len().min(usize::from(u8::MAX));
    let mut out = Vec::with_capacity(8 + len);
    out.extend([
        PACKET_TYPE,
        FileOperation::FileReadConfirm as u8,
        if size.is_some() {
            RESULT_OK
        } else {
            RESULT_FAILED
        },
        len as u8,
    ]);
    out.extend_from_slice(&name[..len]);
    out.extend(size.unwrap_or(0).to_le_bytes());
    out
}

/// Progress of a file being read by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadCursor {
    path: PathBuf,
    size: u64,
    offset: u64,
}

impl FileReadCursor {
    pub fn open(root: &Path, name: &str) -> Result<Self, Error> {
        let path = root.join(name);
        let meta = fs::metadata(&path).context(IoSnafu { path: &path })?;
        Ok(Self {
            path,
            size: meta.len(),
            offset: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_finished(&self) -> bool {
        self.offset >= self.size
    }

    /// Read the next chunk of at most [`CHUNK_LEN`] bytes and advance.
    pub fn next_chunk(&mut self) -> Result<FileChunk, Error> {
        let len = (self.size - self.offset.min(self.size)).min(CHUNK_LEN as u64) as usize;
        let mut data = vec![0u8; len];
        let mut file = File::open(&self.path).context(IoSnafu { path: &self.path })?;
        file.seek(SeekFrom::Start(self.offset))
            .context(IoSnafu { path: &self.path })?;
        file.read_exact(&mut data)
            .context(IoSnafu { path: &self.path })?;

        let chunk = FileChunk {
            offset: self.offset as u32,
            more: self.offset + (len as u64) < self.size,
            data,
        };
        self.offset += len as u64;
        Ok(chunk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u32,
    /// More chunks follow this one.
    pub more: bool,
    pub data: Vec<u8>,
}

impl FileChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.data.len());
        out.extend([PACKET_TYPE, FileOperation::FileReadData as u8]);
        out.extend(0u32.to_le_bytes()); // file id
        out.extend(self.offset.to_le_bytes());
        out.push(u8::from(self.more));
        out.extend_from_slice(&self.data);
        out
    }
}
