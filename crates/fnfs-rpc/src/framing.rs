//! Record marking for stream transports.
//!
//! Each record is a sequence of fragments; a fragment is a 4-byte
//! big-endian marker (high bit = last fragment, low 31 bits = length)
//! followed by that many bytes. A message is the concatenation of the
//! fragments of one record.

use fnfs_error::{NfsError, Result};

pub const RECORD_LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest record accepted from a peer.
pub const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024 + 1024;

const MARKER_LEN: usize = 4;

/// Frame `message` as a single-fragment record.
pub fn encode_record(message: &[u8]) -> Result<Vec<u8>> {
    if message.len() > MAX_RECORD_SIZE {
        return Err(NfsError::Protocol(format!(
            "record of {} bytes exceeds {MAX_RECORD_SIZE}",
            message.len()
        )));
    }
    let len = u32::try_from(message.len())
        .map_err(|_| NfsError::Protocol("record length overflow".to_owned()))?;
    let mut out = Vec::with_capacity(MARKER_LEN + message.len());
    out.extend_from_slice(&(len | RECORD_LAST_FRAGMENT).to_be_bytes());
    out.extend_from_slice(message);
    Ok(out)
}

/// Frame `message` as a record split into fragments of at most
/// `max_fragment` bytes.
#[must_use]
pub fn encode_fragments(message: &[u8], max_fragment: usize) -> Vec<u8> {
    let max_fragment = max_fragment.clamp(1, (RECORD_LAST_FRAGMENT - 1) as usize);
    let mut out = Vec::with_capacity(message.len() + MARKER_LEN * (1 + message.len() / max_fragment));
    let mut chunks = message.chunks(max_fragment).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&RECORD_LAST_FRAGMENT.to_be_bytes());
        return out;
    }
    while let Some(chunk) = chunks.next() {
        let mut marker = u32::try_from(chunk.len()).unwrap_or(RECORD_LAST_FRAGMENT - 1);
        if chunks.peek().is_none() {
            marker |= RECORD_LAST_FRAGMENT;
        }
        out.extend_from_slice(&marker.to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

/// Incremental record parser.
///
/// Holds the state of a partially received record between socket reads, so
/// data can be fed in arbitrary pieces.
#[derive(Debug, Default)]
pub struct RecordReader {
    marker: [u8; MARKER_LEN],
    marker_len: usize,
    /// Bytes still expected in the current fragment.
    remaining: usize,
    in_fragment: bool,
    last: bool,
    message: Vec<u8>,
}

impl RecordReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `input` until a record completes or the input runs
    /// out. Returns the message once its last fragment is fully received;
    /// unconsumed bytes stay in `input`.
    pub fn read_record(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>> {
        loop {
            if !self.in_fragment {
                let take = (MARKER_LEN - self.marker_len).min(input.len());
                self.marker[self.marker_len..self.marker_len + take].copy_from_slice(&input[..take]);
                *input = &input[take..];
                self.marker_len += take;
                if self.marker_len < MARKER_LEN {
                    return Ok(None);
                }
                self.marker_len = 0;
                let marker = u32::from_be_bytes(self.marker);
                self.last = marker & RECORD_LAST_FRAGMENT != 0;
                self.remaining = (marker & !RECORD_LAST_FRAGMENT) as usize;
                if self.message.len() + self.remaining > MAX_RECORD_SIZE {
                    let size = self.message.len() + self.remaining;
                    self.reset();
                    return Err(NfsError::Protocol(format!(
                        "record of at least {size} bytes exceeds {MAX_RECORD_SIZE}"
                    )));
                }
                self.in_fragment = true;
            }

            let take = self.remaining.min(input.len());
            self.message.extend_from_slice(&input[..take]);
            *input = &input[take..];
            self.remaining -= take;
            if self.remaining > 0 {
                return Ok(None);
            }
            self.in_fragment = false;
            if self.last {
                self.last = false;
                return Ok(Some(std::mem::take(&mut self.message)));
            }
        }
    }

    /// Feed a chunk of stream data and collect every record it completes.
    pub fn push(&mut self, mut data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record(&mut data)? {
            records.push(record);
        }
        Ok(records)
    }

    /// No partial record is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.in_fragment && self.marker_len == 0 && self.message.is_empty()
    }

    /// Drop any partial record (after a reconnect).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
