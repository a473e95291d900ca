//! RPC call and reply headers.
//!
//! The engine owns only the envelope; procedure arguments and results are
//! opaque byte strings produced by the argument codec.
//!
//! ```text
//! call:  xid | 0 | prog | vers | proc | cred_len | cred | args
//! reply: xid | 1 | reply_stat | accept_stat | nfs_status | body
//! ```
//!
//! All fields are big-endian `u32`.

use fnfs_error::NfsError;
use fnfs_types::{
    Credential, NFSERR_TRYLATER, ParseError, ProcNumber, Xid, ensure_slice, read_be_u32,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;

const CALL_FIXED_LEN: usize = 24;
const REPLY_FIXED_LEN: usize = 20;

/// Server verdict on an accepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch,
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl AcceptStat {
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ProgUnavail => 1,
            Self::ProgMismatch => 2,
            Self::ProcUnavail => 3,
            Self::GarbageArgs => 4,
            Self::SystemErr => 5,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::Success,
            1 => Self::ProgUnavail,
            2 => Self::ProgMismatch,
            3 => Self::ProcUnavail,
            4 => Self::GarbageArgs,
            5 => Self::SystemErr,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "accept_stat",
                    reason: "unknown value",
                });
            }
        })
    }

    /// The server does not serve this program, version, or procedure.
    #[must_use]
    pub fn is_program_error(self) -> bool {
        matches!(
            self,
            Self::ProgUnavail | Self::ProgMismatch | Self::ProcUnavail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStat {
    Accepted(AcceptStat),
    /// Rejected by the RPC layer; carries the reject status.
    Denied(u32),
}

/// Decoded call envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: Xid,
    pub prog: u32,
    pub vers: u32,
    pub proc: ProcNumber,
    pub cred: Credential,
}

impl CallHeader {
    /// Serialize the header followed by `args`.
    #[must_use]
    pub fn encode(&self, args: &[u8]) -> Vec<u8> {
        let cred = self.cred.encode();
        let mut out = Vec::with_capacity(CALL_FIXED_LEN + cred.len() + args.len());
        for field in [
            self.xid.0,
            MSG_CALL,
            self.prog,
            self.vers,
            self.proc.0,
            u32::try_from(cred.len()).unwrap_or(u32::MAX),
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out.extend_from_slice(&cred);
        out.extend_from_slice(args);
        out
    }

    /// Parse a call; returns the header and the argument bytes.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let xid = Xid(read_be_u32(bytes, 0)?);
        if read_be_u32(bytes, 4)? != MSG_CALL {
            return Err(ParseError::InvalidField {
                field: "msg_type",
                reason: "not a call",
            });
        }
        let prog = read_be_u32(bytes, 8)?;
        let vers = read_be_u32(bytes, 12)?;
        let proc = ProcNumber(read_be_u32(bytes, 16)?);
        let cred_len = usize::try_from(read_be_u32(bytes, 20)?)
            .map_err(|_| ParseError::IntegerConversion { field: "cred_len" })?;
        let cred_bytes = ensure_slice(bytes, CALL_FIXED_LEN, cred_len)?;
        let (cred, used) = Credential::decode(cred_bytes)?;
        if used != cred_len {
            return Err(ParseError::InvalidField {
                field: "cred_len",
                reason: "does not match credential body",
            });
        }
        let args = &bytes[CALL_FIXED_LEN + cred_len..];
        Ok((
            Self {
                xid,
                prog,
                vers,
                proc,
                cred,
            },
            args,
        ))
    }
}

/// A reply as matched against a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub xid: Xid,
    pub stat: ReplyStat,
    pub nfs_status: u32,
    pub body: Vec<u8>,
}

/// What the engine does with a decoded reply.
#[derive(Debug)]
pub enum ReplyOutcome {
    Done(Reply),
    /// The server asked for the call to be retried after a delay.
    TryLater,
    Failed(NfsError),
}

impl Reply {
    #[must_use]
    pub fn success(xid: Xid, body: Vec<u8>) -> Self {
        Self {
            xid,
            stat: ReplyStat::Accepted(AcceptStat::Success),
            nfs_status: 0,
            body,
        }
    }

    #[must_use]
    pub fn with_status(xid: Xid, nfs_status: u32) -> Self {
        Self {
            xid,
            stat: ReplyStat::Accepted(AcceptStat::Success),
            nfs_status,
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (reply_stat, detail) = match self.stat {
            ReplyStat::Accepted(stat) => (REPLY_ACCEPTED, stat.to_wire()),
            ReplyStat::Denied(reject) => (REPLY_DENIED, reject),
        };
        let mut out = Vec::with_capacity(REPLY_FIXED_LEN + self.body.len());
        for field in [self.xid.0, MSG_REPLY, reply_stat, detail, self.nfs_status] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let xid = Xid(read_be_u32(bytes, 0)?);
        if read_be_u32(bytes, 4)? != MSG_REPLY {
            return Err(ParseError::InvalidField {
                field: "msg_type",
                reason: "not a reply",
            });
        }
        let stat = match read_be_u32(bytes, 8)? {
            REPLY_ACCEPTED => ReplyStat::Accepted(AcceptStat::from_wire(read_be_u32(bytes, 12)?)?),
            REPLY_DENIED => ReplyStat::Denied(read_be_u32(bytes, 12)?),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "reply_stat",
                    reason: "unknown value",
                });
            }
        };
        let nfs_status = read_be_u32(bytes, 16)?;
        Ok(Self {
            xid,
            stat,
            nfs_status,
            body: bytes[REPLY_FIXED_LEN..].to_vec(),
        })
    }

    /// Classify the reply for the request state machine.
    #[must_use]
    pub fn into_outcome(self) -> ReplyOutcome {
        match self.stat {
            ReplyStat::Denied(reject) => {
                ReplyOutcome::Failed(NfsError::Protocol(format!("call denied ({reject})")))
            }
            ReplyStat::Accepted(AcceptStat::Success) => match self.nfs_status {
                0 => ReplyOutcome::Done(self),
                NFSERR_TRYLATER => ReplyOutcome::TryLater,
                status => ReplyOutcome::Failed(NfsError::Server { status }),
            },
            ReplyStat::Accepted(stat) => {
                ReplyOutcome::Failed(NfsError::Protocol(format!("call not accepted: {stat:?}")))
            }
        }
    }
}

/// Transaction id of a reply message, without decoding the rest.
#[must_use]
pub fn peek_xid(bytes: &[u8]) -> Option<Xid> {
    let xid = read_be_u32(bytes, 0).ok()?;
    (read_be_u32(bytes, 4).ok()? == MSG_REPLY).then_some(Xid(xid))
}

/// Monotonic transaction id allocator shared by the engine and the
/// connection verifier.
#[derive(Debug)]
pub struct XidSource {
    next: AtomicU32,
}

impl Default for XidSource {
    #[expect(clippy::cast_possible_truncation)]
    fn default() -> Self {
        // Seed from the clock so a remount does not replay old ids.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |d| d.subsec_nanos() ^ (d.as_secs() as u32));
        Self::starting_at(seed)
    }
}

impl XidSource {
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    /// Next id; zero is never handed out.
    pub fn next(&self) -> Xid {
        loop {
            let xid = self.next.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                return Xid(xid);
            }
        }
    }
}
