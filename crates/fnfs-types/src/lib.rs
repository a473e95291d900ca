#![forbid(unsafe_code)]
//! Shared vocabulary for the FrankenNFS client engine.
//!
//! Identifiers, wire constants, the commit-level and timer-class enums, the
//! credential surface, and the cooperative cancellation context ([`Cx`]).

pub mod cx;
pub mod wait;

pub use cx::{Cx, CxError};
pub use wait::{Attempt, Turn, WaitQueue};

use fnfs_error::NfsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Granularity of validity and dirty tracking inside a buffer.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Largest number of pages a single cache buffer may span.
pub const MAX_BUFFER_PAGES: usize = 128;

/// Largest buffer size in bytes (`MAX_BUFFER_PAGES * PAGE_SIZE`).
pub const MAX_BUFFER_SIZE: usize = MAX_BUFFER_PAGES * PAGE_SIZE;

/// NFS program number and the protocol version spoken by the engine.
pub const NFS_PROGRAM: u32 = 100_003;
pub const NFS_VERSION: u32 = 3;

/// Server status asking the client to retry after a delay (`NFS3ERR_JUKEBOX`).
pub const NFSERR_TRYLATER: u32 = 10_008;

/// NFSv3 procedure numbers used by the engine itself.
pub mod procs {
    use super::ProcNumber;

    pub const NULL: ProcNumber = ProcNumber(0);
    pub const GETATTR: ProcNumber = ProcNumber(1);
    pub const SETATTR: ProcNumber = ProcNumber(2);
    pub const LOOKUP: ProcNumber = ProcNumber(3);
    pub const ACCESS: ProcNumber = ProcNumber(4);
    pub const READ: ProcNumber = ProcNumber(6);
    pub const WRITE: ProcNumber = ProcNumber(7);
    pub const COMMIT: ProcNumber = ProcNumber(21);
}

/// Identifier of a remote file (opaque to the engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

/// Logical block number within a file, in units of the cache buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// RPC transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u32);

/// RPC procedure number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcNumber(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for ProcNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued token identifying a boot epoch.
///
/// Two writes answered with different verifiers straddle a server restart;
/// any data they left uncommitted may have been lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WriteVerifier(pub [u8; 8]);

impl WriteVerifier {
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for WriteVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// Durability level requested for, or granted to, a WRITE.
///
/// Ordered from weakest to strongest, so `min` over a set of chunk replies
/// yields the level the whole range actually reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StableHow {
    Unstable,
    DataSync,
    FileSync,
}

impl StableHow {
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unstable => 0,
            Self::DataSync => 1,
            Self::FileSync => 2,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Unstable),
            1 => Ok(Self::DataSync),
            2 => Ok(Self::FileSync),
            _ => Err(ParseError::InvalidField {
                field: "stable_how",
                reason: "must be 0, 1, or 2",
            }),
        }
    }

    #[must_use]
    pub fn is_stable(self) -> bool {
        !matches!(self, Self::Unstable)
    }
}

/// Transport flavor of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable byte stream with record marking (TCP).
    #[default]
    Tcp,
    /// Unreliable datagrams, paced by the congestion window (UDP).
    Udp,
}

impl TransportKind {
    #[must_use]
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Udp)
    }
}

/// Timer class of an RPC; each class keeps its own round-trip estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcClass {
    Getattr,
    Lookup,
    Read,
    Write,
    Commit,
    /// Procedures without a round-trip estimator; they use the mount timeout.
    Other,
}

impl RpcClass {
    pub const TIMED: [Self; 5] = [
        Self::Getattr,
        Self::Lookup,
        Self::Read,
        Self::Write,
        Self::Commit,
    ];

    #[must_use]
    pub fn for_proc(proc: ProcNumber) -> Self {
        match proc {
            procs::GETATTR | procs::ACCESS => Self::Getattr,
            procs::LOOKUP => Self::Lookup,
            procs::READ => Self::Read,
            procs::WRITE => Self::Write,
            procs::COMMIT => Self::Commit,
            _ => Self::Other,
        }
    }

    /// Index into per-class estimator tables; `None` for untimed procedures.
    #[must_use]
    pub fn timer_index(self) -> Option<usize> {
        match self {
            Self::Getattr => Some(0),
            Self::Lookup => Some(1),
            Self::Read => Some(2),
            Self::Write => Some(3),
            Self::Commit => Some(4),
            Self::Other => None,
        }
    }
}

/// Per-class scaling applied to the round-trip based timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutMultipliers {
    pub getattr: f64,
    pub lookup: f64,
    pub read: f64,
    pub write: f64,
    pub commit: f64,
    pub other: f64,
}

impl Default for TimeoutMultipliers {
    fn default() -> Self {
        // Metadata classes get twice the headroom of bulk transfers.
        Self {
            getattr: 2.0,
            lookup: 2.0,
            read: 1.0,
            write: 1.0,
            commit: 1.0,
            other: 1.0,
        }
    }
}

impl TimeoutMultipliers {
    #[must_use]
    pub fn for_class(&self, class: RpcClass) -> f64 {
        match class {
            RpcClass::Getattr => self.getattr,
            RpcClass::Lookup => self.lookup,
            RpcClass::Read => self.read,
            RpcClass::Write => self.write,
            RpcClass::Commit => self.commit,
            RpcClass::Other => self.other,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        [
            self.getattr,
            self.lookup,
            self.read,
            self.write,
            self.commit,
            self.other,
        ]
        .iter()
        .all(|m| m.is_finite() && *m > 0.0)
    }
}

/// Authentication material attached to each request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Opaque flavor-specific token.
    pub token: Vec<u8>,
}

impl Credential {
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            token: Vec::new(),
        }
    }

    /// Serialize as `uid | gid | token_len | token`, big-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.token.len());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.gid.to_be_bytes());
        let len = u32::try_from(self.token.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.token);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let uid = read_be_u32(bytes, 0)?;
        let gid = read_be_u32(bytes, 4)?;
        let len = usize::try_from(read_be_u32(bytes, 8)?)
            .map_err(|_| ParseError::IntegerConversion { field: "token_len" })?;
        let token = ensure_slice(bytes, 12, len)?.to_vec();
        Ok((Self { uid, gid, token }, 12 + len))
    }
}

/// Source of per-request credentials.
pub trait CredentialProvider: Send + Sync {
    /// Credential to use for an RPC touching `file` (or none for
    /// connection-level calls such as NULL).
    fn credential(&self, file: Option<FileId>) -> Credential;
}

/// Provider that hands out one fixed credential.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Credential);

impl CredentialProvider for StaticCredentials {
    fn credential(&self, _file: Option<FileId>) -> Credential {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed for {field}")]
    IntegerConversion { field: &'static str },
}

impl From<ParseError> for NfsError {
    fn from(err: ParseError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<CxError> for NfsError {
    fn from(err: CxError) -> Self {
        match err {
            CxError::Cancelled => Self::Interrupted,
            CxError::DeadlineExceeded => Self::Timeout(err.to_string()),
        }
    }
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset
        .checked_add(len)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len(),
        })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let hi = read_be_u32(data, offset)?;
    let lo = read_be_u32(data, offset + 4)?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Number of pages needed to cover `bytes`.
#[must_use]
pub fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Round `value` down to a page boundary.
#[must_use]
pub fn page_trunc(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Round `value` up to a page boundary.
#[must_use]
pub fn page_round(value: usize) -> usize {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_how_orders_weakest_first() {
        assert!(StableHow::Unstable < StableHow::DataSync);
        assert!(StableHow::DataSync < StableHow::FileSync);
        assert_eq!(
            [StableHow::FileSync, StableHow::Unstable]
                .into_iter()
                .min(),
            Some(StableHow::Unstable)
        );
        for how in [StableHow::Unstable, StableHow::DataSync, StableHow::FileSync] {
            assert_eq!(StableHow::from_wire(how.to_wire()).expect("wire"), how);
        }
        assert!(StableHow::from_wire(3).is_err());
    }

    #[test]
    fn rpc_class_mapping() {
        assert_eq!(RpcClass::for_proc(procs::READ), RpcClass::Read);
        assert_eq!(RpcClass::for_proc(procs::WRITE), RpcClass::Write);
        assert_eq!(RpcClass::for_proc(procs::COMMIT), RpcClass::Commit);
        assert_eq!(RpcClass::for_proc(procs::NULL), RpcClass::Other);
        assert_eq!(RpcClass::Other.timer_index(), None);
        let indices: Vec<_> = RpcClass::TIMED
            .iter()
            .filter_map(|c| c.timer_index())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn credential_encoding_is_self_describing() {
        let cred = Credential {
            uid: 1000,
            gid: 100,
            token: vec![1, 2, 3],
        };
        let bytes = cred.encode();
        let (decoded, used) = Credential::decode(&bytes).expect("decode");
        assert_eq!(decoded, cred);
        assert_eq!(used, bytes.len());
        assert!(Credential::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(page_trunc(PAGE_SIZE + 7), PAGE_SIZE);
        assert_eq!(page_round(PAGE_SIZE + 7), 2 * PAGE_SIZE);
        assert_eq!(page_round(0), 0);
    }

    #[test]
    fn multipliers_validate_and_serialize() {
        let m = TimeoutMultipliers::default();
        assert!(m.is_valid());
        assert!((m.for_class(RpcClass::Getattr) - 2.0).abs() < f64::EPSILON);
        let json = serde_json::to_string(&m).expect("serialize");
        let back: TimeoutMultipliers = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, m);
        let bad = TimeoutMultipliers { read: 0.0, ..m };
        assert!(!bad.is_valid());
    }

    #[test]
    fn boundary_errors_convert_to_nfs_errors() {
        let parse = NfsError::from(ParseError::InvalidField {
            field: "msg_type",
            reason: "not a reply",
        });
        assert!(matches!(parse, NfsError::Protocol(_)));
        assert!(matches!(NfsError::from(CxError::Cancelled), NfsError::Interrupted));
        assert!(matches!(
            NfsError::from(CxError::DeadlineExceeded),
            NfsError::Timeout(_)
        ));
    }

    #[test]
    fn verifier_u64_round_trip() {
        let v = WriteVerifier::from_u64(0xdead_beef_0000_0001);
        assert_eq!(v.as_u64(), 0xdead_beef_0000_0001);
        assert_eq!(v.to_string(), "deadbeef00000001");
    }
}
