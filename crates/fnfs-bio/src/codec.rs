//! Argument and result bodies of the data procedures.
//!
//! The engine never looks inside an RPC body itself; it goes through an
//! [`NfsCodec`] so the wire representation of file handles and attributes
//! stays with whoever owns them. [`WireCodec`] is a flat big-endian layout
//! that keys files by their numeric id:
//!
//! ```text
//! READ    args:   file u64 | offset u64 | count u32
//!         result: eof u32 | len u32 | data
//! WRITE   args:   file u64 | offset u64 | stable u32 | len u32 | data
//!         result: count u32 | committed u32 | verifier [8]
//! COMMIT  args:   file u64 | offset u64 | count u32
//!         result: verifier [8]
//! ```

use fnfs_error::Result;
use fnfs_types::{
    FileId, ParseError, StableHow, WriteVerifier, ensure_slice, read_be_u32, read_be_u64,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadArgs {
    pub file: FileId,
    pub offset: u64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Vec<u8>,
    /// The read reached the end of the file.
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteArgs<'a> {
    pub file: FileId,
    pub offset: u64,
    pub stable: StableHow,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub count: u32,
    pub committed: StableHow,
    pub verifier: WriteVerifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitArgs {
    pub file: FileId,
    pub offset: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub verifier: WriteVerifier,
}

/// Client side of the READ, WRITE and COMMIT bodies.
pub trait NfsCodec: Send + Sync {
    fn encode_read(&self, args: &ReadArgs) -> Vec<u8>;
    fn decode_read(&self, body: &[u8]) -> Result<ReadResult>;
    fn encode_write(&self, args: &WriteArgs<'_>) -> Vec<u8>;
    fn decode_write(&self, body: &[u8]) -> Result<WriteResult>;
    fn encode_commit(&self, args: &CommitArgs) -> Vec<u8>;
    fn decode_commit(&self, body: &[u8]) -> Result<CommitResult>;
}

/// Reference codec. Also carries the server half of each procedure, used
/// by the loopback server.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

fn put_file_range(out: &mut Vec<u8>, file: FileId, offset: u64) {
    out.extend_from_slice(&file.0.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
}

fn data_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn read_verifier(body: &[u8], offset: usize) -> std::result::Result<WriteVerifier, ParseError> {
    let bytes = ensure_slice(body, offset, 8)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(WriteVerifier(raw))
}

fn read_len(body: &[u8], offset: usize, field: &'static str) -> std::result::Result<usize, ParseError> {
    usize::try_from(read_be_u32(body, offset)?).map_err(|_| ParseError::IntegerConversion { field })
}

impl WireCodec {
    pub fn decode_read_args(&self, body: &[u8]) -> Result<ReadArgs> {
        Ok(ReadArgs {
            file: FileId(read_be_u64(body, 0)?),
            offset: read_be_u64(body, 8)?,
            count: read_be_u32(body, 16)?,
        })
    }

    #[must_use]
    pub fn encode_read_result(&self, result: &ReadResult) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + result.data.len());
        out.extend_from_slice(&u32::from(result.eof).to_be_bytes());
        out.extend_from_slice(&data_len(result.data.len()).to_be_bytes());
        out.extend_from_slice(&result.data);
        out
    }

    /// Server view of a WRITE; the data borrows from `body`.
    pub fn decode_write_args<'a>(&self, body: &'a [u8]) -> Result<WriteArgs<'a>> {
        let stable = StableHow::from_wire(read_be_u32(body, 16)?)?;
        let len = read_len(body, 20, "write length")?;
        Ok(WriteArgs {
            file: FileId(read_be_u64(body, 0)?),
            offset: read_be_u64(body, 8)?,
            stable,
            data: ensure_slice(body, 24, len)?,
        })
    }

    #[must_use]
    pub fn encode_write_result(&self, result: &WriteResult) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&result.count.to_be_bytes());
        out.extend_from_slice(&result.committed.to_wire().to_be_bytes());
        out.extend_from_slice(&result.verifier.0);
        out
    }

    pub fn decode_commit_args(&self, body: &[u8]) -> Result<CommitArgs> {
        Ok(CommitArgs {
            file: FileId(read_be_u64(body, 0)?),
            offset: read_be_u64(body, 8)?,
            count: read_be_u32(body, 16)?,
        })
    }

    #[must_use]
    pub fn encode_commit_result(&self, result: &CommitResult) -> Vec<u8> {
        result.verifier.0.to_vec()
    }
}

impl NfsCodec for WireCodec {
    fn encode_read(&self, args: &ReadArgs) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        put_file_range(&mut out, args.file, args.offset);
        out.extend_from_slice(&args.count.to_be_bytes());
        out
    }

    fn decode_read(&self, body: &[u8]) -> Result<ReadResult> {
        let eof = read_be_u32(body, 0)? != 0;
        let len = read_len(body, 4, "read length")?;
        Ok(ReadResult {
            data: ensure_slice(body, 8, len)?.to_vec(),
            eof,
        })
    }

    fn encode_write(&self, args: &WriteArgs<'_>) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + args.data.len());
        put_file_range(&mut out, args.file, args.offset);
        out.extend_from_slice(&args.stable.to_wire().to_be_bytes());
        out.extend_from_slice(&data_len(args.data.len()).to_be_bytes());
        out.extend_from_slice(args.data);
        out
    }

    fn decode_write(&self, body: &[u8]) -> Result<WriteResult> {
        Ok(WriteResult {
            count: read_be_u32(body, 0)?,
            committed: StableHow::from_wire(read_be_u32(body, 4)?)?,
            verifier: read_verifier(body, 8)?,
        })
    }

    fn encode_commit(&self, args: &CommitArgs) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        put_file_range(&mut out, args.file, args.offset);
        out.extend_from_slice(&args.count.to_be_bytes());
        out
    }

    fn decode_commit(&self, body: &[u8]) -> Result<CommitResult> {
        Ok(CommitResult {
            verifier: read_verifier(body, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnfs_error::NfsError;

    #[test]
    fn write_args_survive_the_server_view() {
        let codec = WireCodec;
        let data = vec![7_u8; 100];
        let args = WriteArgs {
            file: FileId(9),
            offset: 8192,
            stable: StableHow::FileSync,
            data: &data,
        };
        let body = codec.encode_write(&args);
        let seen = codec.decode_write_args(&body).expect("decode");
        assert_eq!(seen, args);
    }

    #[test]
    fn read_result_carries_eof_and_data() {
        let codec = WireCodec;
        let body = codec.encode_read_result(&ReadResult {
            data: b"tail".to_vec(),
            eof: true,
        });
        let result = codec.decode_read(&body).expect("decode");
        assert!(result.eof);
        assert_eq!(result.data, b"tail");
    }

    #[test]
    fn write_result_reports_commit_level_and_verifier() {
        let codec = WireCodec;
        let body = codec.encode_write_result(&WriteResult {
            count: 4096,
            committed: StableHow::Unstable,
            verifier: WriteVerifier::from_u64(0xfeed),
        });
        let result = codec.decode_write(&body).expect("decode");
        assert_eq!(result.committed, StableHow::Unstable);
        assert_eq!(result.verifier.as_u64(), 0xfeed);
        assert_eq!(result.count, 4096);
    }

    #[test]
    fn truncated_bodies_are_protocol_errors() {
        let codec = WireCodec;
        let mut body = codec.encode_read_result(&ReadResult {
            data: vec![1; 64],
            eof: false,
        });
        body.truncate(40);
        assert!(matches!(codec.decode_read(&body), Err(NfsError::Protocol(_))));
        assert!(matches!(codec.decode_commit(&[0; 3]), Err(NfsError::Protocol(_))));
        let mut bad_stable = codec.encode_write_result(&WriteResult {
            count: 1,
            committed: StableHow::DataSync,
            verifier: WriteVerifier::default(),
        });
        bad_stable[7] = 9;
        assert!(matches!(codec.decode_write(&bad_stable), Err(NfsError::Protocol(_))));
    }
}
