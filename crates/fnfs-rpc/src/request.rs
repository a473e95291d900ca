//! In-flight request records and their completion targets.

use crate::message::Reply;
use fnfs_error::{NfsError, Result};
use fnfs_types::wait::WAIT_SLICE;
use fnfs_types::{Cx, CxError, ProcNumber, RpcClass, Xid};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Position of a request in its lifecycle.
///
/// `Queued -> Sending -> Sent -> AwaitingReply -> {Completed | MustResend | Errored}`;
/// a `MustResend` request goes back through `Queued` when the resend worker
/// picks it up. `Sent` means the bytes left but the timer has not yet armed
/// a timeout for this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Sending,
    Sent,
    AwaitingReply,
    Completed,
    Errored,
    MustResend,
}

/// Callback run on the completion worker with the outcome of an async call.
pub type Callback = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// Where the outcome of a request goes.
pub enum Completion {
    Sync(Arc<ReplySlot>),
    Async(Callback),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Sync"),
            Self::Async(_) => f.write_str("Async"),
        }
    }
}

/// Rendezvous between the dispatcher and a blocked caller.
#[derive(Debug, Default)]
pub struct ReplySlot {
    result: Mutex<Option<Result<Reply>>>,
    cond: Condvar,
}

impl ReplySlot {
    pub fn fill(&self, result: Result<Reply>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.cond.notify_all();
    }

    /// Take the result if one has been delivered.
    pub fn take(&self) -> Option<Result<Reply>> {
        self.result.lock().take()
    }

    /// Block until filled. The outer error reports cancellation of `cx`,
    /// leaving the slot untouched.
    pub fn wait(&self, cx: &Cx) -> std::result::Result<Result<Reply>, CxError> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return Ok(result);
            }
            cx.checkpoint()?;
            let _ = self.cond.wait_for(&mut slot, cx.bounded_wait(WAIT_SLICE));
        }
    }
}

/// Identifies a request for [`crate::RequestEngine::abandon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub xid: Xid,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub xid: Xid,
    pub proc: ProcNumber,
    pub class: RpcClass,
    pub message: Arc<Vec<u8>>,
    pub state: RequestState,
    /// Timeout-driven retransmissions.
    pub retries: u32,
    /// Try-later resends, budgeted separately from `retries`.
    pub try_later: u32,
    pub attempts: u32,
    /// Round-trip samples are taken only while no retransmission happened.
    pub timed: bool,
    pub last_send: Option<Instant>,
    /// Armed by the timer for the current attempt.
    pub timeout: Option<Duration>,
    /// Link generation of the last send.
    pub generation: u64,
    pub has_credit: bool,
    pub resend_queued: bool,
    pub resend_at: Option<Instant>,
    pub completion: Completion,
}

impl Request {
    pub fn new(xid: Xid, proc: ProcNumber, message: Vec<u8>, completion: Completion) -> Self {
        Self {
            xid,
            proc,
            class: RpcClass::for_proc(proc),
            message: Arc::new(message),
            state: RequestState::Queued,
            retries: 0,
            try_later: 0,
            attempts: 0,
            timed: true,
            last_send: None,
            timeout: None,
            generation: 0,
            has_credit: false,
            resend_queued: false,
            resend_at: None,
            completion,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RequestState::Completed | RequestState::Errored)
    }

    /// Schedule another transmission no earlier than `at`.
    pub fn must_resend(&mut self, at: Instant) {
        self.state = RequestState::MustResend;
        self.timeout = None;
        self.resend_at = Some(at);
    }
}

/// Deliver `result` to `completion`, or hand async callbacks to `defer`.
pub(crate) fn finish(
    completion: Completion,
    result: Result<Reply>,
    defer: impl FnOnce(Callback, Result<Reply>),
) {
    match completion {
        Completion::Sync(slot) => slot.fill(result),
        Completion::Async(callback) => defer(callback, result),
    }
}

/// The outcome recorded for a request that left the pending table.
pub(crate) type Finished = (Completion, Result<Reply>);

pub(crate) fn errored(request: Request, err: NfsError) -> Finished {
    (request.completion, Err(err))
}
