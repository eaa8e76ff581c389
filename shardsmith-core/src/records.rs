//! Length-prefixed record files.
//!
//! Each shard file is a sequence of records, every record a 4-byte
//! big-endian payload length followed by the payload. The payload is
//! whatever the [`ExampleCodec`](crate::example::ExampleCodec) produced.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{DatasetError, Result};

const LENGTH_PREFIX: usize = 4;

/// Appends records to a single file.
pub struct RecordWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
}

impl RecordWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            DatasetError::corrupt(&self.path, "record payload exceeds 4 GiB")
        })?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    /// Flush and sync; returns the number of records written.
    pub fn finish(self) -> Result<u64> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| DatasetError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.records)
    }
}

/// Iterates over the records of one file, in write order.
pub struct RecordReader {
    path: PathBuf,
    input: BufReader<File>,
    done: bool,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            input: BufReader::new(file),
            done: false,
        })
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match read_exact_or_eof(&mut self.input, &mut prefix)? {
            0 => return Ok(None),
            n if n < LENGTH_PREFIX => {
                return Err(DatasetError::corrupt(&self.path, "truncated length prefix"));
            }
            _ => {}
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        self.input.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DatasetError::corrupt(&self.path, "truncated record payload")
            } else {
                e.into()
            }
        })?;
        Ok(Some(payload))
    }
}

impl Iterator for RecordReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
