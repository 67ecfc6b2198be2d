use std::io::{ErrorKind, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use capstan_common::{CapstanError, Result};

/// Writes length-delimited records: a little-endian `u32` byte length
/// followed by the bincode payload. Applied symmetrically by
/// [`RecordReader`]; this framing is part of the wire contract.
pub struct RecordWriter<W: Write> {
    inner: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Appends one record and returns the number of bytes written, prefix
    /// included.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<u64> {
        let payload = bincode::serialize(record)
            .map_err(|e| CapstanError::Codec(format!("record encode failed: {e}")))?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            CapstanError::Codec(format!(
                "record of {} bytes exceeds the u32 length prefix",
                payload.len()
            ))
        })?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&payload)?;
        Ok(4 + payload.len() as u64)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reads records written by [`RecordWriter`].
///
/// End-of-stream on a record boundary is the normal terminator and yields
/// `Ok(None)`. End-of-stream inside a length prefix or payload is a
/// truncation and surfaces as [`CapstanError::Codec`].
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut prefix = [0u8; 4];
        match fill(&mut self.inner, &mut prefix)? {
            Filled::Eof => return Ok(None),
            Filled::Partial(n) => {
                return Err(CapstanError::Codec(format!(
                    "stream truncated inside length prefix ({n} of 4 bytes)"
                )));
            }
            Filled::Full => {}
        }
        let len = u32::from_le_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        match fill(&mut self.inner, &mut payload)? {
            Filled::Full => {}
            Filled::Eof | Filled::Partial(_) => {
                return Err(CapstanError::Codec(format!(
                    "stream truncated inside {len}-byte record payload"
                )));
            }
        }
        let record = bincode::deserialize(&payload)
            .map_err(|e| CapstanError::Codec(format!("record decode failed: {e}")))?;
        Ok(Some(record))
    }
}

enum Filled {
    Full,
    Eof,
    Partial(usize),
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Filled> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    Filled::Eof
                } else {
                    Filled::Partial(filled)
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Filled::Full)
}
