//! In-memory NFS server.
//!
//! Serves NULL, READ, WRITE and COMMIT with the [`WireCodec`] layout and
//! echoes the arguments of every other procedure. File contents are kept
//! twice: `data` is what reads see, `durable` is what survives a
//! [`LoopbackServer::reboot`]. Unstable writes only reach `data` until a
//! COMMIT copies it over.
//!
//! Faults are armed per procedure and consumed one call at a time.

use crate::link::LinkInner;
use fnfs_bio::{CommitResult, ReadResult, WireCodec, WriteResult};
use fnfs_error::{NfsError, Result};
use fnfs_rpc::Reply;
use fnfs_rpc::message::CallHeader;
use fnfs_types::{FileId, NFSERR_TRYLATER, ProcNumber, StableHow, WriteVerifier, Xid, procs};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One call as the server saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub xid: Xid,
    pub proc: ProcNumber,
    /// Connection the call arrived on.
    pub link: u64,
}

/// One WRITE as the server applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub file: FileId,
    pub offset: u64,
    pub len: usize,
    pub stable: StableHow,
}

#[derive(Debug, Default, Clone)]
struct FileData {
    data: Vec<u8>,
    durable: Vec<u8>,
}

fn apply(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    let end = offset + bytes.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(bytes);
}

#[derive(Debug, Default)]
struct Faults {
    /// Calls answered with nothing.
    drop: HashMap<ProcNumber, u32>,
    try_later: HashMap<ProcNumber, u32>,
    /// `(status, remaining)` answered instead of the real result.
    fail: HashMap<ProcNumber, (u32, u32)>,
    /// Reboot right after applying the n-th next WRITE.
    reboot_after_writes: Option<u32>,
    hold: bool,
    refuse: bool,
    /// Answer every WRITE as FILE_SYNC regardless of what was asked.
    sync_writes: bool,
}

struct State {
    files: HashMap<FileId, FileData>,
    verifier: u64,
    faults: Faults,
    calls: Vec<CallRecord>,
    writes: Vec<WriteRecord>,
    held: Vec<(Weak<LinkInner>, Vec<u8>)>,
    links: Vec<Weak<LinkInner>>,
    next_link: u64,
}

pub(crate) struct ServerInner {
    name: String,
    codec: WireCodec,
    state: Mutex<State>,
    arrived: Condvar,
}

/// Handle to a loopback server; clones share it.
#[derive(Clone)]
pub struct LoopbackServer {
    pub(crate) inner: Arc<ServerInner>,
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LoopbackServer")
            .field("name", &self.inner.name)
            .field("files", &state.files.len())
            .field("calls", &state.calls.len())
            .field("verifier", &state.verifier)
            .finish_non_exhaustive()
    }
}

impl LoopbackServer {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.to_owned(),
                codec: WireCodec,
                state: Mutex::new(State {
                    files: HashMap::new(),
                    verifier: 1,
                    faults: Faults::default(),
                    calls: Vec::new(),
                    writes: Vec::new(),
                    held: Vec::new(),
                    links: Vec::new(),
                    next_link: 1,
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create or replace `file` with durable contents.
    pub fn put_file(&self, file: FileId, contents: &[u8]) {
        self.inner.state.lock().files.insert(
            file,
            FileData {
                data: contents.to_vec(),
                durable: contents.to_vec(),
            },
        );
    }

    /// Contents as a READ would see them.
    #[must_use]
    pub fn file(&self, file: FileId) -> Option<Vec<u8>> {
        self.inner.state.lock().files.get(&file).map(|f| f.data.clone())
    }

    /// Contents that would survive a reboot.
    #[must_use]
    pub fn durable(&self, file: FileId) -> Option<Vec<u8>> {
        self.inner.state.lock().files.get(&file).map(|f| f.durable.clone())
    }

    #[must_use]
    pub fn verifier(&self) -> WriteVerifier {
        WriteVerifier::from_u64(self.inner.state.lock().verifier)
    }

    /// Lose every uncommitted write and start answering with a new verifier.
    pub fn reboot(&self) {
        let mut state = self.inner.state.lock();
        reboot_locked(&self.inner.name, &mut state);
    }

    /// Calls received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner.state.lock().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self, proc: ProcNumber) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| c.proc == proc)
            .count()
    }

    /// Calls other than the NULL probes used to verify connections.
    #[must_use]
    pub fn data_calls(&self) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| c.proc != procs::NULL)
            .count()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.state.lock().writes.clone()
    }

    /// Wait until at least `n` calls of `proc` have arrived.
    pub fn wait_for_calls(&self, proc: ProcNumber, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.calls.iter().filter(|c| c.proc == proc).count() >= n {
                return true;
            }
            if self.inner.arrived.wait_until(&mut state, deadline).timed_out() {
                return state.calls.iter().filter(|c| c.proc == proc).count() >= n;
            }
        }
    }

    /// Answer nothing to the next `n` calls of `proc`.
    pub fn drop_replies(&self, proc: ProcNumber, n: u32) {
        self.inner.state.lock().faults.drop.insert(proc, n);
    }

    /// Answer the next `n` calls of `proc` with "try later".
    pub fn try_later(&self, proc: ProcNumber, n: u32) {
        self.inner.state.lock().faults.try_later.insert(proc, n);
    }

    /// Answer the next `n` calls of `proc` with NFS status `status`.
    pub fn fail_with(&self, proc: ProcNumber, status: u32, n: u32) {
        self.inner.state.lock().faults.fail.insert(proc, (status, n));
    }

    /// Reboot right after the `n`-th next WRITE has been applied and
    /// answered.
    pub fn reboot_after_writes(&self, n: u32) {
        self.inner.state.lock().faults.reboot_after_writes = Some(n.max(1));
    }

    /// Answer every WRITE as committed to stable storage.
    pub fn sync_writes(&self, on: bool) {
        self.inner.state.lock().faults.sync_writes = on;
    }

    /// While on, calls other than NULL are recorded but left unanswered.
    pub fn hold(&self, on: bool) {
        self.inner.state.lock().faults.hold = on;
    }

    /// Answer every held call that still has a live connection.
    pub fn release_held(&self) {
        let held = {
            let mut state = self.inner.state.lock();
            state.faults.hold = false;
            std::mem::take(&mut state.held)
        };
        for (link, message) in held {
            if let Some(link) = link.upgrade() {
                if let Some(reply) = self.inner.process(&message, false) {
                    link.deliver(reply);
                }
            }
        }
    }

    /// Refuse new connections.
    pub fn refuse(&self, on: bool) {
        self.inner.state.lock().faults.refuse = on;
    }

    /// Break every open connection; calls held on them are lost.
    pub fn disconnect_all(&self) -> usize {
        let links = {
            let mut state = self.inner.state.lock();
            state.held.clear();
            std::mem::take(&mut state.links)
        };
        let mut broken = 0;
        for link in links.iter().filter_map(Weak::upgrade) {
            link.close();
            broken += 1;
        }
        debug!(server = %self.inner.name, broken, "connections broken");
        broken
    }

    /// Open connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .links
            .iter()
            .filter(|l| l.upgrade().is_some_and(|l| !l.is_closed()))
            .count()
    }
}

fn reboot_locked(name: &str, state: &mut State) {
    state.verifier += 1;
    for file in state.files.values_mut() {
        file.data = file.durable.clone();
    }
    debug!(server = name, verifier = state.verifier, "server rebooted");
}

fn take_one(counts: &mut HashMap<ProcNumber, u32>, proc: ProcNumber) -> bool {
    match counts.get_mut(&proc) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl ServerInner {
    /// Open a new connection; `Err` while refusing.
    pub(crate) fn attach(&self) -> Result<Arc<LinkInner>> {
        let mut state = self.state.lock();
        if state.faults.refuse {
            return Err(NfsError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        let link = Arc::new(LinkInner::new(state.next_link));
        state.next_link += 1;
        state.links.retain(|l| l.strong_count() > 0);
        state.links.push(Arc::downgrade(&link));
        Ok(link)
    }

    /// Take one call from `link` and queue its reply there, unless a fault
    /// swallows it.
    pub(crate) fn receive(&self, link: &Arc<LinkInner>, message: &[u8]) {
        if let Some(reply) = self.process_from(link, message) {
            link.deliver(reply);
        }
    }

    fn process_from(&self, link: &Arc<LinkInner>, message: &[u8]) -> Option<Vec<u8>> {
        let Ok((call, _)) = CallHeader::decode(message) else {
            trace!(server = %self.name, "ignoring undecodable call");
            return None;
        };
        {
            let mut state = self.state.lock();
            state.calls.push(CallRecord {
                xid: call.xid,
                proc: call.proc,
                link: link.id(),
            });
            self.arrived.notify_all();
            if state.faults.hold && call.proc != procs::NULL {
                state.held.push((Arc::downgrade(link), message.to_vec()));
                return None;
            }
        }
        self.process(message, true)
    }

    /// Build the reply to `message`. Faults are consulted when `faults` is
    /// set.
    fn process(&self, message: &[u8], faults: bool) -> Option<Vec<u8>> {
        let (call, args) = CallHeader::decode(message).ok()?;
        let mut state = self.state.lock();
        if faults {
            let f = &mut state.faults;
            if take_one(&mut f.drop, call.proc) {
                trace!(xid = %call.xid, proc = %call.proc, "reply dropped");
                return None;
            }
            if take_one(&mut f.try_later, call.proc) {
                return Some(Reply::with_status(call.xid, NFSERR_TRYLATER).encode());
            }
            if let Some((status, left)) = f.fail.get_mut(&call.proc) {
                if *left > 0 {
                    *left -= 1;
                    let status = *status;
                    return Some(Reply::with_status(call.xid, status).encode());
                }
            }
        }
        let body = match call.proc {
            procs::NULL => Ok(Vec::new()),
            procs::READ => self.read(&state, args),
            procs::WRITE => self.write(&mut state, args),
            procs::COMMIT => self.commit(&mut state, args),
            _ => Ok(args.to_vec()),
        };
        let reply = match body {
            Ok(body) => Reply::success(call.xid, body),
            Err(err) => {
                debug!(xid = %call.xid, proc = %call.proc, error = %err, "bad arguments");
                Reply::with_status(call.xid, libc::EINVAL.unsigned_abs())
            }
        };
        Some(reply.encode())
    }

    fn read(&self, state: &State, args: &[u8]) -> Result<Vec<u8>> {
        let args = self.codec.decode_read_args(args)?;
        let data = state
            .files
            .get(&args.file)
            .map_or(&[][..], |f| f.data.as_slice());
        let start = usize::try_from(args.offset).unwrap_or(usize::MAX).min(data.len());
        let end = start
            .saturating_add(usize::try_from(args.count).unwrap_or(usize::MAX))
            .min(data.len());
        Ok(self.codec.encode_read_result(&ReadResult {
            data: data[start..end].to_vec(),
            eof: end == data.len(),
        }))
    }

    fn write(&self, state: &mut State, args: &[u8]) -> Result<Vec<u8>> {
        let args = self.codec.decode_write_args(args)?;
        let offset = usize::try_from(args.offset)
            .map_err(|_| NfsError::Protocol("write offset out of range".to_owned()))?;
        let committed = if state.faults.sync_writes {
            StableHow::FileSync
        } else {
            args.stable
        };
        let file = state.files.entry(args.file).or_default();
        apply(&mut file.data, offset, args.data);
        if committed.is_stable() {
            apply(&mut file.durable, offset, args.data);
        }
        state.writes.push(WriteRecord {
            file: args.file,
            offset: args.offset,
            len: args.data.len(),
            stable: args.stable,
        });
        let result = WriteResult {
            count: u32::try_from(args.data.len()).unwrap_or(u32::MAX),
            committed,
            verifier: WriteVerifier::from_u64(state.verifier),
        };
        if let Some(n) = state.faults.reboot_after_writes.as_mut() {
            *n -= 1;
            if *n == 0 {
                state.faults.reboot_after_writes = None;
                reboot_locked(&self.name, state);
            }
        }
        Ok(self.codec.encode_write_result(&result))
    }

    fn commit(&self, state: &mut State, args: &[u8]) -> Result<Vec<u8>> {
        let args = self.codec.decode_commit_args(args)?;
        if let Some(file) = state.files.get_mut(&args.file) {
            file.durable = file.data.clone();
        }
        Ok(self.codec.encode_commit_result(&CommitResult {
            verifier: WriteVerifier::from_u64(state.verifier),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_grows_and_overwrites() {
        let mut buf = vec![1, 2, 3];
        apply(&mut buf, 1, &[9, 9, 9, 9]);
        assert_eq!(buf, vec![1, 9, 9, 9, 9]);
        apply(&mut buf, 7, &[5]);
        assert_eq!(buf, vec![1, 9, 9, 9, 9, 0, 0, 5]);
    }

    #[test]
    fn reboot_loses_uncommitted_data() {
        let server = LoopbackServer::new("a");
        server.put_file(FileId(1), b"old!");
        {
            let mut state = server.inner.state.lock();
            let file = state.files.get_mut(&FileId(1)).expect("file");
            apply(&mut file.data, 0, b"new");
        }
        let before = server.verifier();
        server.reboot();
        assert_ne!(server.verifier(), before);
        assert_eq!(server.file(FileId(1)).expect("file"), b"old!");
    }

    #[test]
    fn faults_are_consumed_one_call_at_a_time() {
        let mut counts = HashMap::new();
        counts.insert(procs::READ, 2);
        assert!(take_one(&mut counts, procs::READ));
        assert!(take_one(&mut counts, procs::READ));
        assert!(!take_one(&mut counts, procs::READ));
        assert!(!take_one(&mut counts, procs::WRITE));
    }
}
