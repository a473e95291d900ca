//! In-memory connections to a [`LoopbackServer`].

use crate::server::{LoopbackServer, ServerInner};
use fnfs_error::{NfsError, Result};
use fnfs_rpc::{Connector, Transport};
use fnfs_types::TransportKind;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Queue {
    replies: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Server side of one connection: the replies waiting to be received.
pub(crate) struct LinkInner {
    id: u64,
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl LinkInner {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn deliver(&self, reply: Vec<u8>) {
        let mut queue = self.queue.lock();
        if !queue.closed {
            queue.replies.push_back(reply);
            self.ready.notify_all();
        }
    }

    pub(crate) fn close(&self) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        queue.replies.clear();
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

fn closed() -> NfsError {
    NfsError::ConnectionLost("loopback connection closed".to_owned())
}

/// Client end of a loopback connection. Calls are served synchronously on
/// the sending thread; replies wait in the link until received.
pub struct LoopbackLink {
    kind: TransportKind,
    peer: String,
    server: Arc<ServerInner>,
    inner: Arc<LinkInner>,
}

impl Transport for LoopbackLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        if self.inner.is_closed() {
            return Err(closed());
        }
        self.server.receive(&self.inner, message);
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(reply) = queue.replies.pop_front() {
                return Ok(Some(reply));
            }
            if queue.closed {
                return Err(closed());
            }
            if self.inner.ready.wait_for(&mut queue, timeout).timed_out() {
                return match queue.replies.pop_front() {
                    Some(reply) => Ok(Some(reply)),
                    None if queue.closed => Err(closed()),
                    None => Ok(None),
                };
            }
        }
    }

    fn shutdown(&self) {
        self.inner.close();
    }
}

/// Connector resolving addresses to loopback servers by name.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    kind: TransportKind,
    servers: HashMap<String, LoopbackServer>,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            servers: HashMap::new(),
        }
    }

    /// Make `server` reachable under its name.
    #[must_use]
    pub fn with_server(mut self, server: &LoopbackServer) -> Self {
        self.servers.insert(server.name().to_owned(), server.clone());
        self
    }
}

impl Connector for LoopbackConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self, addr: &str, _timeout: Duration) -> Result<Arc<dyn Transport>> {
        let Some(server) = self.servers.get(addr) else {
            return Err(NfsError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        };
        let inner = server.inner.attach()?;
        Ok(Arc::new(LoopbackLink {
            kind: self.kind,
            peer: addr.to_owned(),
            server: Arc::clone(&server.inner),
            inner,
        }))
    }
}
