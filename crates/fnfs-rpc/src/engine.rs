//! Pending-request table, retransmit timer and reply correlation.
//!
//! Four named threads serve one engine:
//!
//! | Thread | Role |
//! |--------|------|
//! | `fnfs-rpc-timer` | scans the table every `timer_period`; marks timeouts and queues resends |
//! | `fnfs-rpc-dispatch` | drains transport events; matches replies by xid |
//! | `fnfs-rpc-resend` | retransmits queued requests, pacing datagrams by the congestion window |
//! | `fnfs-rpc-complete` | runs async completion callbacks |
//!
//! The table lock is never held across a send or a wait. When both are
//! needed, the table lock is taken before the estimator lock.

use crate::congestion::{CongestionController, WindowState};
use crate::message::{CallHeader, Reply, ReplyOutcome, XidSource, peek_xid};
use crate::request::{
    Callback, Completion, Finished, ReplySlot, Request, RequestHandle, RequestState, errored,
    finish,
};
use crate::rtt::RttEstimator;
use crate::transport::{Connector, SocketTransport, TransportEvent};
use crate::{RpcConfig, TransportConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};
use fnfs_error::{NfsError, Result};
use fnfs_types::{Credential, Cx, NFS_PROGRAM, NFS_VERSION, ProcNumber, RpcClass, Xid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Counters reported by [`RequestEngine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Transmissions, including retransmissions.
    pub sent: u64,
    pub retransmits: u64,
    pub timeouts: u64,
    pub try_later: u64,
    /// Replies correlated with a pending request.
    pub matched: u64,
    /// Replies that were malformed or matched nothing.
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    retransmits: AtomicU64,
    timeouts: AtomicU64,
    try_later: AtomicU64,
    matched: AtomicU64,
    dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn unbump(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

struct Job(Callback, Result<Reply>);

struct EngineInner {
    config: RpcConfig,
    transport: SocketTransport,
    congestion: Option<CongestionController>,
    xids: Arc<XidSource>,
    table: Mutex<HashMap<Xid, Request>>,
    rtt: Mutex<RttEstimator>,
    resend_tx: Sender<Xid>,
    jobs_tx: Sender<Job>,
    counters: Counters,
    not_responding: AtomicBool,
    consecutive_timeouts: AtomicU32,
    stopping: AtomicBool,
    /// Cancelled at shutdown to release workers blocked on the window.
    cx: Cx,
}

/// RPC client engine for one mount.
pub struct RequestEngine {
    inner: Arc<EngineInner>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine")
            .field("transport", &self.inner.transport)
            .field("pending", &self.inner.table.lock().len())
            .finish_non_exhaustive()
    }
}

impl RequestEngine {
    /// Connect to the first responsive server and start the engine.
    pub fn connect(
        cx: &Cx,
        config: RpcConfig,
        transport_config: TransportConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let xids = Arc::new(XidSource::default());
        let (transport, events) =
            SocketTransport::connect(cx, transport_config, connector, Arc::clone(&xids))?;
        Self::start(config, transport, events, xids)
    }

    /// Start the engine over an established transport.
    pub fn start(
        config: RpcConfig,
        transport: SocketTransport,
        events: Receiver<TransportEvent>,
        xids: Arc<XidSource>,
    ) -> Result<Self> {
        config.validate()?;
        let congestion = transport
            .kind()
            .is_datagram()
            .then(|| CongestionController::new(config.max_outstanding));
        let (resend_tx, resend_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let timer_period = config.timer_period;

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                congestion,
                xids,
                table: Mutex::new(HashMap::new()),
                rtt: Mutex::new(RttEstimator::new()),
                resend_tx,
                jobs_tx,
                counters: Counters::default(),
                not_responding: AtomicBool::new(false),
                consecutive_timeouts: AtomicU32::new(0),
                stopping: AtomicBool::new(false),
                cx: Cx::for_request(),
            }),
            stop: Mutex::new(Some(stop_tx)),
            workers: Mutex::new(Vec::with_capacity(4)),
        };

        let stop = stop_rx.clone();
        engine.spawn("fnfs-rpc-timer", move |inner| {
            loop {
                match stop.recv_timeout(timer_period) {
                    Err(RecvTimeoutError::Timeout) => inner.tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        let stop = stop_rx.clone();
        engine.spawn("fnfs-rpc-dispatch", move |inner| {
            loop {
                select! {
                    recv(events) -> event => match event {
                        Ok(TransportEvent::Message(message)) => inner.match_reply(&message),
                        Ok(TransportEvent::Down) => debug!("link down, holding pending requests"),
                        Ok(TransportEvent::Reconnected(generation)) => inner.on_reconnect(generation),
                        Err(_) => break,
                    },
                    recv(stop) -> _ => break,
                }
            }
        })?;
        let stop = stop_rx.clone();
        engine.spawn("fnfs-rpc-resend", move |inner| {
            loop {
                select! {
                    recv(resend_rx) -> xid => match xid {
                        Ok(xid) => inner.resend(xid),
                        Err(_) => break,
                    },
                    recv(stop) -> _ => break,
                }
            }
        })?;
        engine.spawn("fnfs-rpc-complete", move |_| {
            loop {
                select! {
                    recv(jobs_rx) -> job => match job {
                        Ok(Job(callback, result)) => callback(result),
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => {
                        while let Ok(Job(callback, result)) = jobs_rx.try_recv() {
                            callback(result);
                        }
                        break;
                    }
                }
            }
        })?;
        Ok(engine)
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&EngineInner) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                body(&inner);
                trace!(thread = ?std::thread::current().name(), "rpc worker stopped");
            })?;
        self.workers.lock().push(join);
        Ok(())
    }

    /// Issue `proc` and block until its reply, a terminal error, or
    /// cancellation of `cx` (which abandons the request).
    pub fn call(
        &self,
        cx: &Cx,
        proc: ProcNumber,
        cred: &Credential,
        args: &[u8],
    ) -> Result<Reply> {
        let slot = Arc::new(ReplySlot::default());
        let xid = self
            .inner
            .register(proc, cred, args, Completion::Sync(Arc::clone(&slot)))?;
        let handle = RequestHandle { xid };
        let credit = match &self.inner.congestion {
            Some(cc) => {
                if let Err(err) = cc.acquire(cx) {
                    self.abandon(handle);
                    return Err(err);
                }
                true
            }
            None => false,
        };
        self.inner.transmit(xid, credit, true)?;
        match slot.wait(cx) {
            Ok(result) => result,
            Err(cancelled) => {
                if self.abandon(handle) {
                    Err(cancelled.into())
                } else {
                    // Completed while we were giving up.
                    slot.take().unwrap_or_else(|| Err(cancelled.into()))
                }
            }
        }
    }

    /// Issue `proc` without waiting; `callback` runs on the completion
    /// worker exactly once unless the request is abandoned.
    pub fn call_async<F>(
        &self,
        proc: ProcNumber,
        cred: &Credential,
        args: &[u8],
        callback: F,
    ) -> Result<RequestHandle>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let xid = self
            .inner
            .register(proc, cred, args, Completion::Async(Box::new(callback)))?;
        let credit = match &self.inner.congestion {
            None => false,
            Some(cc) if cc.try_acquire() => true,
            Some(_) => {
                // Window full: the resend worker waits for credit instead.
                self.inner.queue_resend(xid);
                return Ok(RequestHandle { xid });
            }
        };
        self.inner.transmit(xid, credit, false)?;
        Ok(RequestHandle { xid })
    }

    /// Drop a pending request. A blocked caller sees `Abandoned`; an async
    /// callback is dropped without running. Returns false if the request
    /// already completed.
    pub fn abandon(&self, handle: RequestHandle) -> bool {
        let Some(request) = self.inner.table.lock().remove(&handle.xid) else {
            return false;
        };
        if request.has_credit {
            self.inner.release_credit();
        }
        debug!(xid = %handle.xid, proc = %request.proc, "request abandoned");
        match request.completion {
            Completion::Sync(slot) => slot.fill(Err(NfsError::Abandoned)),
            Completion::Async(callback) => drop(callback),
        }
        true
    }

    #[must_use]
    pub fn request_state(&self, handle: RequestHandle) -> Option<RequestState> {
        self.inner.table.lock().get(&handle.xid).map(|r| r.state)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.table.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            sent: c.sent.load(Ordering::Relaxed),
            retransmits: c.retransmits.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            try_later: c.try_later.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Congestion window, for datagram transports.
    #[must_use]
    pub fn window(&self) -> Option<WindowState> {
        self.inner.congestion.as_ref().map(CongestionController::state)
    }

    #[must_use]
    pub fn srtt(&self, class: RpcClass) -> Option<Duration> {
        self.inner.rtt.lock().srtt(class)
    }

    /// False while a hard mount has exhausted its retry budget without a
    /// reply.
    #[must_use]
    pub fn is_server_responding(&self) -> bool {
        !self.inner.not_responding.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn transport(&self) -> &SocketTransport {
        &self.inner.transport
    }

    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Stop the workers, fail every pending request with `Shutdown`, and
    /// close the transport.
    pub fn shutdown(&self) {
        let pending: Vec<Request> = {
            let mut table = self.inner.table.lock();
            if self.inner.stopping.swap(true, Ordering::AcqRel) {
                return;
            }
            table.drain().map(|(_, request)| request).collect()
        };
        self.inner.cx.cancel();
        let failed = pending.len();
        for request in pending {
            self.inner.deliver(errored(request, NfsError::Shutdown));
        }
        drop(self.stop.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for join in workers {
            let _ = join.join();
        }
        self.inner.transport.shutdown();
        debug!(failed, "request engine shut down");
    }
}

impl Drop for RequestEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineInner {
    fn register(
        &self,
        proc: ProcNumber,
        cred: &Credential,
        args: &[u8],
        completion: Completion,
    ) -> Result<Xid> {
        let xid = self.xids.next();
        let message = CallHeader {
            xid,
            prog: NFS_PROGRAM,
            vers: NFS_VERSION,
            proc,
            cred: cred.clone(),
        }
        .encode(args);
        let mut table = self.table.lock();
        if self.stopping.load(Ordering::Acquire) {
            return Err(NfsError::Shutdown);
        }
        table.insert(xid, Request::new(xid, proc, message, completion));
        Ok(xid)
    }

    fn release_credit(&self) {
        if let Some(cc) = &self.congestion {
            cc.release();
        }
    }

    fn deliver(&self, (completion, result): Finished) {
        finish(completion, result, |callback, result| {
            if let Err(crossbeam_channel::SendError(Job(callback, result))) =
                self.jobs_tx.send(Job(callback, result))
            {
                callback(result);
            }
        });
    }

    fn queue_resend(&self, xid: Xid) {
        if let Some(request) = self.table.lock().get_mut(&xid) {
            request.resend_queued = true;
        }
        let _ = self.resend_tx.send(xid);
    }

    /// Hand one request to the transport. `credit` says whether the caller
    /// already took a window credit for this attempt.
    fn transmit(&self, xid: Xid, credit: bool, blocking: bool) -> Result<()> {
        let retransmit;
        let message = {
            let mut table = self.table.lock();
            let Some(request) = table.get_mut(&xid) else {
                drop(table);
                if credit {
                    self.release_credit();
                }
                return Ok(());
            };
            if credit {
                if request.has_credit {
                    self.release_credit();
                }
                request.has_credit = true;
            }
            request.state = RequestState::Sending;
            request.resend_queued = false;
            request.last_send = Some(Instant::now());
            request.generation = self.transport.generation();
            // Counted before the bytes leave: the reply can complete the
            // request before this thread looks it up again.
            retransmit = request.attempts > 0;
            request.attempts += 1;
            bump(&self.counters.sent);
            if retransmit {
                bump(&self.counters.retransmits);
            }
            Arc::clone(&request.message)
        };

        let sent = self.transport.send(&message);
        if sent.is_err() {
            unbump(&self.counters.sent);
            if retransmit {
                unbump(&self.counters.retransmits);
            }
        }
        let now = Instant::now();
        let mut table = self.table.lock();
        let Some(request) = table.get_mut(&xid) else {
            // Completed or abandoned while the bytes were in flight.
            return Ok(());
        };
        if sent.is_err() {
            request.attempts -= 1;
        }
        match sent {
            Ok(()) => {
                if request.state == RequestState::Sending {
                    request.state = RequestState::Sent;
                    request.timeout = None;
                }
                trace!(%xid, proc = %request.proc, attempt = request.attempts, "request sent");
                Ok(())
            }
            Err(err) if err.is_connection_level() => {
                if request.state == RequestState::Sending {
                    request.must_resend(now);
                }
                if std::mem::take(&mut request.has_credit) {
                    self.release_credit();
                }
                debug!(%xid, error = %err, "send failed, will resend after reconnect");
                Ok(())
            }
            Err(err) if blocking => {
                let request = table.remove(&xid);
                drop(table);
                if request.is_some_and(|r| r.has_credit) {
                    self.release_credit();
                }
                Err(err)
            }
            Err(err) => {
                request.retries += 1;
                request.timed = false;
                let backoff = self.config.policy.timeout(
                    &self.rtt.lock(),
                    request.class,
                    request.retries,
                    self.transport.kind().is_datagram(),
                    true,
                );
                request.must_resend(now + backoff);
                if std::mem::take(&mut request.has_credit) {
                    self.release_credit();
                }
                warn!(%xid, error = %err, retry_in = ?backoff, "send failed");
                Ok(())
            }
        }
    }

    fn resend(&self, xid: Xid) {
        {
            let mut table = self.table.lock();
            let Some(request) = table.get_mut(&xid) else {
                return;
            };
            if !matches!(
                request.state,
                RequestState::MustResend | RequestState::Queued
            ) {
                request.resend_queued = false;
                return;
            }
            request.state = RequestState::Queued;
        }
        let credit = match &self.congestion {
            Some(cc) => {
                if cc.acquire(&self.cx).is_err() {
                    return;
                }
                true
            }
            None => false,
        };
        if let Err(err) = self.transmit(xid, credit, false) {
            warn!(%xid, error = %err, "resend failed");
        }
    }

    fn tick(&self) {
        let now = Instant::now();
        let connected = self.transport.is_connected();
        let datagram = self.transport.kind().is_datagram();
        let generation = self.transport.generation();
        let degraded =
            self.transport.is_reconnecting() || self.not_responding.load(Ordering::Acquire);
        let mut resend = Vec::new();
        let mut finished = Vec::new();
        let mut gave_up_hard = false;
        {
            let mut table = self.table.lock();
            let rtt = self.rtt.lock();
            let mut expired = Vec::new();
            for request in table.values_mut() {
                let consecutive = self.consecutive_timeouts.load(Ordering::Relaxed);
                match request.state {
                    RequestState::Sent => {
                        request.timeout = Some(self.config.policy.timeout(
                            &rtt,
                            request.class,
                            request.retries.max(consecutive),
                            datagram,
                            degraded,
                        ));
                        request.state = RequestState::AwaitingReply;
                    }
                    RequestState::AwaitingReply => {
                        let (Some(sent), Some(timeout)) = (request.last_send, request.timeout)
                        else {
                            continue;
                        };
                        if now.saturating_duration_since(sent) < timeout {
                            continue;
                        }
                        bump(&self.counters.timeouts);
                        self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
                        if let Some(cc) = &self.congestion {
                            if std::mem::take(&mut request.has_credit) {
                                cc.release();
                            }
                            cc.on_timeout();
                        }
                        request.timed = false;
                        request.retries += 1;
                        debug!(
                            xid = %request.xid,
                            proc = %request.proc,
                            retries = request.retries,
                            ?timeout,
                            "request timed out"
                        );
                        if request.retries > self.config.retrans {
                            if self.config.soft {
                                expired.push(request.xid);
                                continue;
                            }
                            gave_up_hard |= !self.not_responding.swap(true, Ordering::AcqRel);
                        }
                        if datagram || request.generation != generation {
                            request.must_resend(now);
                        } else {
                            // The stream retransmits bytes itself; restart the
                            // window with a longer backoff.
                            request.last_send = Some(now);
                            request.state = RequestState::Sent;
                        }
                    }
                    _ => {}
                }
                if request.state == RequestState::MustResend
                    && connected
                    && !request.resend_queued
                    && request.resend_at.is_none_or(|at| at <= now)
                {
                    request.resend_queued = true;
                    resend.push(request.xid);
                }
            }
            drop(rtt);
            for xid in expired {
                if let Some(mut request) = table.remove(&xid) {
                    request.state = RequestState::Errored;
                    let retries = request.retries;
                    finished.push(errored(
                        request,
                        NfsError::Timeout(format!("no reply after {retries} retransmissions")),
                    ));
                }
            }
        }
        if gave_up_hard {
            warn!(
                peer = ?self.transport.peer(),
                "server not responding, still trying"
            );
        }
        for xid in resend {
            let _ = self.resend_tx.send(xid);
        }
        for outcome in finished {
            self.deliver(outcome);
        }
    }

    fn try_later_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.config
            .try_later_initial
            .saturating_mul(1 << doublings)
            .min(self.config.try_later_max)
    }

    fn match_reply(&self, message: &[u8]) {
        let Some(xid) = peek_xid(message) else {
            bump(&self.counters.dropped);
            warn!(len = message.len(), "dropping malformed reply");
            return;
        };
        let now = Instant::now();
        let mut table = self.table.lock();
        let Some(request) = table.get_mut(&xid) else {
            drop(table);
            bump(&self.counters.dropped);
            trace!(%xid, "reply matches no pending request");
            return;
        };

        let reply = match Reply::decode(message) {
            Ok(reply) => reply,
            Err(err) => {
                let had_credit = request.has_credit;
                let removed = table.remove(&xid);
                drop(table);
                if had_credit {
                    self.release_credit();
                }
                bump(&self.counters.dropped);
                warn!(%xid, error = %err, "malformed reply");
                if let Some(mut request) = removed {
                    request.state = RequestState::Errored;
                    self.deliver(errored(request, err.into()));
                }
                return;
            }
        };

        let outcome = reply.into_outcome();
        if matches!(outcome, ReplyOutcome::TryLater) {
            bump(&self.counters.try_later);
            request.try_later += 1;
            if std::mem::take(&mut request.has_credit) {
                self.release_credit();
            }
            if request.try_later > self.config.try_later_budget {
                let request = table.remove(&xid);
                drop(table);
                warn!(%xid, "server kept asking to try later, giving up");
                if let Some(mut request) = request {
                    request.state = RequestState::Errored;
                    self.deliver(errored(request, NfsError::ServerTryLater));
                }
            } else {
                let delay = self.try_later_delay(request.try_later);
                request.must_resend(now + delay);
                request.resend_queued = false;
                debug!(%xid, attempt = request.try_later, ?delay, "server busy, resending later");
            }
            return;
        }

        let Some(mut request) = table.remove(&xid) else {
            return;
        };
        if request.timed {
            if let Some(sent) = request.last_send {
                self.rtt
                    .lock()
                    .update(request.class, now.saturating_duration_since(sent));
            }
        }
        drop(table);
        if request.has_credit {
            if let Some(cc) = &self.congestion {
                cc.on_reply();
            }
        }
        bump(&self.counters.matched);
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        if self.not_responding.swap(false, Ordering::AcqRel) {
            info!(peer = ?self.transport.peer(), "server responding again");
        }
        let result = match outcome {
            ReplyOutcome::Done(reply) => {
                request.state = RequestState::Completed;
                Ok(reply)
            }
            ReplyOutcome::Failed(err) => {
                request.state = RequestState::Errored;
                Err(err)
            }
            ReplyOutcome::TryLater => Err(NfsError::ServerTryLater),
        };
        trace!(%xid, proc = %request.proc, ok = result.is_ok(), "reply matched");
        self.deliver((request.completion, result));
    }

    /// Every unfinished request goes out once more on the new link.
    fn on_reconnect(&self, generation: u64) {
        if let Some(cc) = &self.congestion {
            cc.reset_outstanding();
        }
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        let now = Instant::now();
        let mut resend = Vec::new();
        {
            let mut table = self.table.lock();
            for request in table.values_mut() {
                request.has_credit = false;
                if request.resend_queued || request.is_terminal() {
                    continue;
                }
                // Already sent, or being sent, on the new link.
                if request.generation == generation
                    && matches!(
                        request.state,
                        RequestState::Sending | RequestState::Sent | RequestState::AwaitingReply
                    )
                {
                    continue;
                }
                request.must_resend(now);
                request.resend_queued = true;
                resend.push(request.xid);
            }
        }
        debug!(generation, requests = resend.len(), "resending pending requests");
        for xid in resend {
            let _ = self.resend_tx.send(xid);
        }
    }
}
