//! Connection lifecycle: candidate search, verification, receive loop and
//! reconnect.
//!
//! A [`SocketTransport`] owns at most one live [`Transport`] at a time.
//! Inbound messages and link changes are published as [`TransportEvent`]s on
//! a channel that the request engine drains. When a send or receive fails,
//! the link is torn down and the maintenance thread searches the candidate
//! list again with a doubling delay until it succeeds or the transport is
//! shut down.

use crate::framing::{RecordReader, encode_record};
use crate::message::{AcceptStat, CallHeader, Reply, ReplyStat, XidSource, peek_xid};
use crate::{TransportConfig, cx_checkpoint};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fnfs_error::{NfsError, Result};
use fnfs_types::wait::WAIT_SLICE;
use fnfs_types::{Credential, Cx, NFS_PROGRAM, NFS_VERSION, TransportKind, procs};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Largest datagram the UDP link will receive.
pub const MAX_DATAGRAM: usize = 65_535;

const READ_CHUNK: usize = 64 * 1024;
const MIN_POLL: Duration = Duration::from_millis(1);

/// One established connection to a server.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Address the link is connected to, for logging.
    fn peer(&self) -> String;

    /// Send one complete RPC message.
    fn send(&self, message: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for one complete message; `Ok(None)` when
    /// nothing arrived in time.
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Close the link. Blocked and later calls fail with a
    /// connection-level error.
    fn shutdown(&self);
}

/// Factory for [`Transport`]s.
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn connect(&self, addr: &str, timeout: Duration) -> Result<Arc<dyn Transport>>;
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| NfsError::InvalidConfig(format!("{addr} did not resolve")))
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

struct TcpReader {
    stream: TcpStream,
    records: RecordReader,
    ready: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

/// Record-marked RPC over a TCP stream.
pub struct TcpTransport {
    peer: String,
    writer: Mutex<TcpStream>,
    reader: Mutex<TcpReader>,
}

impl TcpTransport {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let target = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&target, timeout.max(MIN_POLL))?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, addr.to_owned())
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self {
            peer,
            writer: Mutex::new(stream),
            reader: Mutex::new(TcpReader {
                stream: reader,
                records: RecordReader::new(),
                ready: VecDeque::new(),
                buf: vec![0; READ_CHUNK],
            }),
        })
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        let framed = encode_record(message)?;
        let mut writer = self.writer.lock();
        writer.write_all(&framed)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut guard = self.reader.lock();
        let reader = &mut *guard;
        if let Some(record) = reader.ready.pop_front() {
            return Ok(Some(record));
        }
        reader.stream.set_read_timeout(Some(timeout.max(MIN_POLL)))?;
        match reader.stream.read(&mut reader.buf) {
            Ok(0) => Err(NfsError::ConnectionLost(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(n) => {
                let records = reader.records.push(&reader.buf[..n])?;
                reader.ready.extend(records);
                Ok(reader.ready.pop_front())
            }
            Err(err) if is_poll_timeout(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn shutdown(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

/// RPC over a connected UDP socket, one message per datagram.
pub struct UdpTransport {
    peer: String,
    socket: UdpSocket,
    closed: AtomicBool,
    buf: Mutex<Vec<u8>>,
}

impl UdpTransport {
    pub fn connect(addr: &str) -> Result<Self> {
        let target = resolve(addr)?;
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(target)?;
        Ok(Self {
            peer: addr.to_owned(),
            socket,
            closed: AtomicBool::new(false),
            buf: Mutex::new(vec![0; MAX_DATAGRAM]),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(NfsError::ConnectionLost(format!("{} link closed", self.peer)))
        } else {
            Ok(())
        }
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        self.check_open()?;
        if message.len() > MAX_DATAGRAM {
            return Err(NfsError::Protocol(format!(
                "{} byte message does not fit a datagram",
                message.len()
            )));
        }
        self.socket.send(message)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let mut buf = self.buf.lock();
        self.socket.set_read_timeout(Some(timeout.max(MIN_POLL)))?;
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(err) if is_poll_timeout(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Connector for the built-in socket transports.
#[derive(Debug, Clone, Copy)]
pub struct SocketConnector {
    kind: TransportKind,
}

impl SocketConnector {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }
}

impl Connector for SocketConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self, addr: &str, timeout: Duration) -> Result<Arc<dyn Transport>> {
        Ok(match self.kind {
            TransportKind::Tcp => Arc::new(TcpTransport::connect(addr, timeout)?),
            TransportKind::Udp => Arc::new(UdpTransport::connect(addr)?),
        })
    }
}

/// How informative a failed connection attempt is; the search reports the
/// highest-ranked failure when every candidate fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureRank {
    Timeout = 1,
    Network = 2,
    Program = 3,
    Malformed = 4,
    Other = 5,
}

#[derive(Debug)]
pub struct SearchFailure {
    pub rank: FailureRank,
    pub error: NfsError,
}

impl SearchFailure {
    fn new(rank: FailureRank, error: NfsError) -> Self {
        Self { rank, error }
    }

    #[must_use]
    pub fn classify(error: NfsError) -> Self {
        let rank = match &error {
            NfsError::Timeout(_) => FailureRank::Timeout,
            NfsError::Io(err) if is_poll_timeout(err) => FailureRank::Timeout,
            NfsError::Io(_) | NfsError::ConnectionLost(_) => FailureRank::Network,
            NfsError::Protocol(_) => FailureRank::Malformed,
            _ => FailureRank::Other,
        };
        Self { rank, error }
    }
}

/// Probe `link` with a NULL call and wait for its reply.
pub fn verify(
    link: &dyn Transport,
    xids: &XidSource,
    timeout: Duration,
) -> std::result::Result<(), SearchFailure> {
    let xid = xids.next();
    let call = CallHeader {
        xid,
        prog: NFS_PROGRAM,
        vers: NFS_VERSION,
        proc: procs::NULL,
        cred: Credential::default(),
    }
    .encode(&[]);
    link.send(&call).map_err(SearchFailure::classify)?;
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(SearchFailure::new(
                FailureRank::Timeout,
                NfsError::Timeout(format!("no reply to NULL from {}", link.peer())),
            ));
        }
        let Some(message) = link
            .recv(left.min(WAIT_SLICE))
            .map_err(SearchFailure::classify)?
        else {
            continue;
        };
        if peek_xid(&message) != Some(xid) {
            trace!(peer = %link.peer(), "ignoring unrelated message during verify");
            continue;
        }
        let reply = Reply::decode(&message)
            .map_err(|err| SearchFailure::new(FailureRank::Malformed, err.into()))?;
        return match reply.stat {
            ReplyStat::Accepted(AcceptStat::Success) => Ok(()),
            ReplyStat::Accepted(stat) if stat.is_program_error() => Err(SearchFailure::new(
                FailureRank::Program,
                NfsError::Protocol(format!("{} rejected NULL: {stat:?}", link.peer())),
            )),
            stat => Err(SearchFailure::new(
                FailureRank::Other,
                NfsError::Protocol(format!("{} refused NULL: {stat:?}", link.peer())),
            )),
        };
    }
}

fn try_candidate(
    connector: &dyn Connector,
    addr: &str,
    timeout: Duration,
    xids: &XidSource,
) -> std::result::Result<Arc<dyn Transport>, SearchFailure> {
    let link = connector
        .connect(addr, timeout)
        .map_err(SearchFailure::classify)?;
    if let Err(failure) = verify(link.as_ref(), xids, timeout) {
        link.shutdown();
        return Err(failure);
    }
    Ok(link)
}

/// A verified connection produced by [`search`].
pub struct Established {
    pub link: Arc<dyn Transport>,
    pub addr: String,
}

type Attempted = (String, std::result::Result<Arc<dyn Transport>, SearchFailure>);

/// Try the configured candidates, up to `search_concurrency` at a time, and
/// return the first one that verifies.
pub fn search(
    cx: &Cx,
    config: &TransportConfig,
    connector: &Arc<dyn Connector>,
    xids: &Arc<XidSource>,
) -> Result<Established> {
    if config.servers.is_empty() {
        return Err(NfsError::InvalidConfig("no server addresses".to_owned()));
    }
    let deadline = Instant::now() + config.search_timeout;
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<String>();
    for addr in &config.servers {
        let _ = work_tx.send(addr.clone());
    }
    drop(work_tx);
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<Attempted>();
    let abort = Arc::new(AtomicBool::new(false));

    let workers = config.search_concurrency.clamp(1, config.servers.len());
    for n in 0..workers {
        let work_rx = work_rx.clone();
        let done_tx = done_tx.clone();
        let abort = Arc::clone(&abort);
        let connector = Arc::clone(connector);
        let xids = Arc::clone(xids);
        let timeout = config.connect_timeout;
        std::thread::Builder::new()
            .name(format!("fnfs-connect-{n}"))
            .spawn(move || {
                while !abort.load(Ordering::Acquire) {
                    let Ok(addr) = work_rx.try_recv() else {
                        break;
                    };
                    let result = try_candidate(connector.as_ref(), &addr, timeout, &xids);
                    if let Err(crossbeam_channel::SendError((_, Ok(link)))) =
                        done_tx.send((addr, result))
                    {
                        // The search already finished.
                        link.shutdown();
                    }
                }
            })?;
    }
    drop(done_tx);

    let mut best: Option<SearchFailure> = None;
    let outcome = loop {
        if let Err(err) = cx_checkpoint(cx) {
            break Err(err);
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break Err(best.map_or_else(
                || NfsError::Timeout("server search timed out".to_owned()),
                |b| b.error,
            ));
        }
        match done_rx.recv_timeout(cx.bounded_wait(WAIT_SLICE).min(left)) {
            Ok((addr, Ok(link))) => break Ok(Established { link, addr }),
            Ok((addr, Err(failure))) => {
                debug!(addr, rank = ?failure.rank, error = %failure.error, "candidate failed");
                if best.as_ref().is_none_or(|b| failure.rank > b.rank) {
                    best = Some(failure);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                break Err(best.map_or_else(
                    || NfsError::ConnectionLost("no candidate answered".to_owned()),
                    |b| b.error,
                ));
            }
        }
    };
    abort.store(true, Ordering::Release);
    outcome
}

/// Something the request engine must react to.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound RPC message.
    Message(Vec<u8>),
    /// The link failed; a reconnect is in progress.
    Down,
    /// A new link is up; carries the new generation.
    Reconnected(u64),
}

struct LinkState {
    link: Option<Arc<dyn Transport>>,
    peer: Option<String>,
    generation: u64,
    reconnecting: bool,
    reconnects: u64,
    shutdown: bool,
}

struct TransportInner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    xids: Arc<XidSource>,
    state: Mutex<LinkState>,
    cond: Condvar,
    events: Sender<TransportEvent>,
    /// Cancelled on shutdown to abort an in-progress search.
    cx: Cx,
}

/// Connection owner for one mount.
pub struct SocketTransport {
    inner: Arc<TransportInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SocketTransport")
            .field("kind", &self.inner.connector.kind())
            .field("peer", &state.peer)
            .field("generation", &state.generation)
            .field("reconnecting", &state.reconnecting)
            .finish_non_exhaustive()
    }
}

impl SocketTransport {
    /// Search for a server, then start the receive and maintenance threads.
    pub fn connect(
        cx: &Cx,
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        xids: Arc<XidSource>,
    ) -> Result<(Self, Receiver<TransportEvent>)> {
        config.validate()?;
        let Established { link, addr } = search(cx, &config, &connector, &xids)?;
        info!(server = %addr, kind = ?connector.kind(), "connected");
        let (events, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(TransportInner {
            config,
            connector,
            xids,
            state: Mutex::new(LinkState {
                link: Some(link),
                peer: Some(addr),
                generation: 1,
                reconnecting: false,
                reconnects: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            events,
            cx: Cx::for_request(),
        });

        let transport = Self {
            inner,
            threads: Mutex::new(Vec::with_capacity(2)),
        };
        transport.spawn("fnfs-recv", receive_loop)?;
        transport.spawn("fnfs-reconnect", maintenance_loop)?;
        Ok((transport, rx))
    }

    fn spawn(&self, name: &str, body: fn(&TransportInner)) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(&inner));
        match join {
            Ok(join) => {
                self.threads.lock().push(join);
                Ok(())
            }
            Err(err) => {
                self.shutdown();
                Err(err.into())
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.inner.connector.kind()
    }

    /// Send on the current link. Fails with `ConnectionLost` while
    /// disconnected; a connection-level failure also starts a reconnect.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let (link, generation) = {
            let state = self.inner.state.lock();
            if state.shutdown {
                return Err(NfsError::Shutdown);
            }
            match &state.link {
                Some(link) => (Arc::clone(link), state.generation),
                None => {
                    return Err(NfsError::ConnectionLost("reconnect in progress".to_owned()));
                }
            }
        };
        match link.send(message) {
            Ok(()) => Ok(()),
            Err(err) if err.is_connection_level() || matches!(err, NfsError::Io(_)) => {
                self.inner.mark_down(generation, &err);
                Err(NfsError::ConnectionLost(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Tear down the current link and start reconnecting.
    pub fn reset(&self, reason: &str) {
        let generation = self.inner.state.lock().generation;
        self.inner
            .mark_down(generation, &NfsError::ConnectionLost(reason.to_owned()));
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.state.lock().reconnecting
    }

    /// Increases on every successful (re)connect.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.inner.state.lock().reconnects
    }

    #[must_use]
    pub fn peer(&self) -> Option<String> {
        self.inner.state.lock().peer.clone()
    }

    /// Block until a link is up.
    pub fn wait_connected(&self, cx: &Cx) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            cx_checkpoint(cx)?;
            if state.shutdown {
                return Err(NfsError::Shutdown);
            }
            if state.link.is_some() {
                return Ok(());
            }
            let _ = self
                .inner
                .cond
                .wait_for(&mut state, cx.bounded_wait(WAIT_SLICE));
        }
    }

    /// Close the link and stop the background threads.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.reconnecting = false;
            if let Some(link) = state.link.take() {
                link.shutdown();
            }
        }
        self.inner.cx.cancel();
        self.inner.cond.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for join in threads {
            let _ = join.join();
        }
        debug!("transport shut down");
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TransportInner {
    fn mark_down(&self, generation: u64, cause: &NfsError) {
        let mut state = self.state.lock();
        if state.shutdown || state.generation != generation {
            return;
        }
        let Some(link) = state.link.take() else {
            return;
        };
        link.shutdown();
        state.reconnecting = true;
        warn!(peer = %link.peer(), generation, error = %cause, "connection lost, reconnecting");
        drop(state);
        let _ = self.events.send(TransportEvent::Down);
        self.cond.notify_all();
    }

    /// Sleep for `delay` unless shut down first. Returns false on shutdown.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        while !state.shutdown {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            let _ = self.cond.wait_for(&mut state, left);
        }
        false
    }
}

fn receive_loop(inner: &TransportInner) {
    loop {
        let (link, generation) = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    trace!("receive loop stopped");
                    return;
                }
                if let Some(link) = &state.link {
                    break (Arc::clone(link), state.generation);
                }
                let _ = inner.cond.wait_for(&mut state, WAIT_SLICE);
            }
        };
        match link.recv(WAIT_SLICE) {
            Ok(Some(message)) => {
                if inner.events.send(TransportEvent::Message(message)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => inner.mark_down(generation, &err),
        }
    }
}

fn maintenance_loop(inner: &TransportInner) {
    loop {
        {
            let mut state = inner.state.lock();
            while !state.shutdown && !(state.reconnecting && state.link.is_none()) {
                inner.cond.wait(&mut state);
            }
            if state.shutdown {
                trace!("maintenance loop stopped");
                return;
            }
        }

        let mut delay = inner.config.reconnect_delay;
        loop {
            match search(&inner.cx, &inner.config, &inner.connector, &inner.xids) {
                Ok(Established { link, addr }) => {
                    let mut state = inner.state.lock();
                    if state.shutdown {
                        link.shutdown();
                        return;
                    }
                    state.generation += 1;
                    state.reconnects += 1;
                    state.reconnecting = false;
                    state.link = Some(link);
                    state.peer = Some(addr.clone());
                    let generation = state.generation;
                    drop(state);
                    info!(server = %addr, generation, "reconnected");
                    inner.cond.notify_all();
                    let _ = inner.events.send(TransportEvent::Reconnected(generation));
                    break;
                }
                Err(err) => {
                    warn!(error = %err, retry_in = ?delay, "reconnect failed");
                    if !inner.pause(delay) {
                        return;
                    }
                    delay = delay.saturating_mul(2).min(inner.config.max_reconnect_delay);
                }
            }
        }
    }
}
