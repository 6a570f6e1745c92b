//! Assembly of hex records into contiguous firmware chunks

use crate::error::HexError;
use crate::hex::{HexRecord, HexRecordParser, RecordType};
use std::collections::VecDeque;
use std::path::Path;

/// Contiguous bytes starting at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub address: u32,
    pub data: Vec<u8>,
}

pub struct HexRecordProcessor;

impl HexRecordProcessor {
    /// Lazily group the data of `records` into chunks of at most
    /// `chunk_size` bytes.
    ///
    /// A chunk ends when it is full, when the next data byte is not at the
    /// following address, or at end of file. Chunk boundaries therefore
    /// depend on address contiguity only, not on how the data was split
    /// into lines.
    pub fn process<I>(records: I, chunk_size: usize) -> Result<Chunks<I::IntoIter>, HexError>
    where
        I: IntoIterator<Item = Result<HexRecord, HexError>>,
    {
        if chunk_size == 0 {
            return Err(HexError::InvalidChunkSize);
        }
        Ok(Chunks {
            records: records.into_iter(),
            chunk_size,
            offset: 0,
            buffer: Vec::with_capacity(chunk_size),
            buffer_start: 0,
            ready: VecDeque::new(),
            start_address: None,
            finished: false,
        })
    }

    /// Parse and chunk a hex file in one go
    pub fn load(path: &Path, chunk_size: usize) -> Result<Vec<Chunk>, HexError> {
        let parser = HexRecordParser::open(path)?;
        Self::process(parser, chunk_size)?.collect()
    }
}

/// Iterator returned by [`HexRecordProcessor::process`]
pub struct Chunks<I> {
    records: I,
    chunk_size: usize,
    /// Added to the 16-bit address of data records
    offset: u32,
    buffer: Vec<u8>,
    buffer_start: u32,
    ready: VecDeque<Chunk>,
    start_address: Option<u32>,
    finished: bool,
}

impl<I> Chunks<I> {
    /// Entry point from a start address record.
    ///
    /// Only meaningful once the iterator is exhausted.
    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.ready.push_back(Chunk {
            address: self.buffer_start,
            data,
        });
    }

    fn push_data(&mut self, mut address: u32, mut data: &[u8]) {
        let expected = self.buffer_start.wrapping_add(self.buffer.len() as u32);
        if !self.buffer.is_empty() && address != expected {
            self.flush();
        }
        while !data.is_empty() {
            if self.buffer.is_empty() {
                self.buffer_start = address;
            }
            let take = (self.chunk_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            address = address.wrapping_add(take as u32);
            if self.buffer.len() == self.chunk_size {
                self.flush();
            }
        }
    }

    fn apply(&mut self, record: HexRecord) {
        match record.record_type {
            RecordType::Data => {
                let address = self.offset.wrapping_add(u32::from(record.address));
                self.push_data(address, &record.data);
            }
            RecordType::EndOfFile => {
                self.flush();
                self.finished = true;
            }
            RecordType::ExtendedLinearAddress => {
                self.offset = u32::from(record.data_u16().unwrap_or(0)) << 16;
            }
            RecordType::ExtendedSegmentAddress => {
                self.offset = u32::from(record.data_u16().unwrap_or(0)) << 4;
            }
            RecordType::StartLinearAddress => {
                self.start_address = record.data_u32();
            }
            RecordType::StartSegmentAddress => {
                // CS:IP
                self.start_address = record.data_u32().map(|v| ((v >> 16) << 4) + (v & 0xFFFF));
            }
        }
    }
}

impl<I> Iterator for Chunks<I>
where
    I: Iterator<Item = Result<HexRecord, HexError>>,
{
    type Item = Result<Chunk, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(Ok(chunk));
            }
            if self.finished {
                return None;
            }
            match self.records.next() {
                Some(Ok(record)) => self.apply(record),
                Some(Err(e)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
                None => {
                    self.flush();
                    self.finished = true;
                }
            }
        }
    }
}
