//! Intel HEX record parsing
//!
//! One record per line: `:` followed by hex digit pairs for the byte count,
//! a 16-bit address, the record type, the data bytes and a checksum byte
//! that makes the sum of all bytes on the line zero (mod 256).

use crate::error::HexError;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

const START_CODE: char = ':';

/// Bytes on a line besides the data: count, address (2), type, checksum
const RECORD_OVERHEAD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordType {
    pub fn code(self) -> u8 {
        match self {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
            RecordType::StartSegmentAddress => 0x03,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::StartLinearAddress => 0x05,
        }
    }

    /// Data length required by non-data records
    fn fixed_len(self) -> Option<usize> {
        match self {
            RecordType::Data => None,
            RecordType::EndOfFile => Some(0),
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => Some(2),
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => Some(4),
        }
    }
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(RecordType::Data),
            0x01 => Ok(RecordType::EndOfFile),
            0x02 => Ok(RecordType::ExtendedSegmentAddress),
            0x03 => Ok(RecordType::StartSegmentAddress),
            0x04 => Ok(RecordType::ExtendedLinearAddress),
            0x05 => Ok(RecordType::StartLinearAddress),
            other => Err(other),
        }
    }
}

/// One parsed line of a hex file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub byte_count: u8,
    pub address: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Build a record with the correct count and checksum.
    ///
    /// `data` must be at most 255 bytes.
    pub fn new(record_type: RecordType, address: u16, data: Vec<u8>) -> Self {
        let byte_count = data.len() as u8;
        let mut record = Self {
            byte_count,
            address,
            record_type,
            data,
            checksum: 0,
        };
        record.checksum = checksum(&record.body_bytes());
        record
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + RECORD_OVERHEAD - 1);
        bytes.push(self.byte_count);
        bytes.extend_from_slice(&self.address.to_be_bytes());
        bytes.push(self.record_type.code());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// The record as a hex file line, without line ending
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(1 + 2 * (self.data.len() + RECORD_OVERHEAD));
        line.push(START_CODE);
        for byte in self.body_bytes().iter().chain(std::iter::once(&self.checksum)) {
            let _ = write!(line, "{:02X}", byte);
        }
        line
    }

    /// The 16-bit big-endian value carried by address records
    pub(crate) fn data_u16(&self) -> Option<u16> {
        match self.data.as_slice() {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// The 32-bit big-endian value carried by start address records
    pub(crate) fn data_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Two's complement of the byte sum
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

/// Parse one line of a hex file.
///
/// `line_number` and `filename` only label errors.
pub fn parse_line(line: &str, line_number: usize, filename: &str) -> Result<HexRecord, HexError> {
    let line = line.trim();
    let malformed = |reason: String| HexError::Malformed {
        filename: filename.to_string(),
        line_number,
        line: line.to_string(),
        reason,
    };

    let body = line
        .strip_prefix(START_CODE)
        .ok_or_else(|| malformed("missing ':' start code".to_string()))?;
    if body.len() < 2 * RECORD_OVERHEAD {
        return Err(malformed("line too short".to_string()));
    }
    if body.len() % 2 != 0 || !body.is_ascii() {
        return Err(malformed("odd number of hex digits".to_string()));
    }

    let bytes = (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| malformed("invalid hex digit".to_string()))?;

    let byte_count = bytes[0];
    let data_len = bytes.len() - RECORD_OVERHEAD;
    if byte_count as usize != data_len {
        return Err(malformed(format!(
            "byte count {} does not match {} data bytes",
            byte_count, data_len
        )));
    }

    let record_type = RecordType::try_from(bytes[3])
        .map_err(|code| malformed(format!("unknown record type {:#04x}", code)))?;
    if let Some(expected_len) = record_type.fixed_len() {
        if data_len != expected_len {
            return Err(malformed(format!(
                "{:?} record must carry {} data bytes",
                record_type, expected_len
            )));
        }
    }

    let (body_bytes, tail) = bytes.split_at(bytes.len() - 1);
    let actual = tail[0];
    let expected = checksum(body_bytes);
    if actual != expected {
        return Err(HexError::Checksum {
            filename: filename.to_string(),
            line_number,
            line: line.to_string(),
            expected,
            actual,
        });
    }

    Ok(HexRecord {
        byte_count,
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type,
        data: bytes[4..4 + data_len].to_vec(),
        checksum: actual,
    })
}

/// Streaming parser over the lines of a hex file.
///
/// Blank lines are skipped. Iteration stops after the first error.
pub struct HexRecordParser<R> {
    lines: Lines<R>,
    filename: String,
    line_number: usize,
    failed: bool,
}

impl HexRecordParser<BufReader<File>> {
    /// Open a hex file for parsing
    pub fn open(path: &Path) -> Result<Self, HexError> {
        let file = File::open(path).map_err(|e| HexError::Io {
            filename: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<'a> HexRecordParser<&'a [u8]> {
    /// Parse hex text held in memory
    pub fn from_text(text: &'a str, filename: impl Into<String>) -> Self {
        Self::new(text.as_bytes(), filename)
    }
}

impl<R: BufRead> HexRecordParser<R> {
    pub fn new(reader: R, filename: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            filename: filename.into(),
            line_number: 0,
            failed: false,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl<R: BufRead> Iterator for HexRecordParser<R> {
    type Item = Result<HexRecord, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(HexError::Io {
                        filename: self.filename.clone(),
                        reason: e.to_string(),
                    }));
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_line(&line, self.line_number, &self.filename);
            self.failed = record.is_err();
            return Some(record);
        }
    }
}
