#![forbid(unsafe_code)]
//! End-to-end harness for FrankenNFS.
//!
//! [`LoopbackServer`] is an in-memory NFS server with fault injection and
//! [`LoopbackConnector`] plugs it into the request engine in place of
//! sockets. [`Fixture`] mounts a client against one server with timings
//! short enough for tests.

pub mod link;
pub mod server;

pub use link::{LoopbackConnector, LoopbackLink};
pub use server::{CallRecord, LoopbackServer, WriteRecord};

use fnfs_bio::WireCodec;
use fnfs_buf::{AnonymousPages, PageProvider};
use fnfs_core::{MountConfig, NfsClient};
use fnfs_error::Result;
use fnfs_types::{Cx, FileId, StaticCredentials, TransportKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name the fixture's server is reachable under.
pub const SERVER: &str = "loopback";

/// Mount options with test-sized timers. Background flushing is pushed out
/// far enough that only explicit flushes write.
#[must_use]
pub fn test_config(kind: TransportKind) -> MountConfig {
    let mut config = MountConfig::default()
        .with_servers([SERVER])
        .with_transport(kind);
    config.initial_timeout = Duration::from_millis(100);
    config.min_timeout = Duration::from_millis(20);
    config.max_timeout = Duration::from_secs(2);
    config.timer_period = Duration::from_millis(10);
    config.try_later_initial_delay = Duration::from_millis(20);
    config.try_later_max_delay = Duration::from_millis(80);
    config.connect_timeout = Duration::from_secs(1);
    config.search_timeout = Duration::from_secs(2);
    config.reconnect_delay = Duration::from_millis(10);
    config.flush_period = Duration::from_secs(3600);
    config.reclaim_period = Duration::from_secs(3600);
    config
}

/// A client mounted against a fresh loopback server.
pub struct Fixture {
    pub server: LoopbackServer,
    pub pages: Arc<AnonymousPages>,
    pub client: NfsClient,
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("server", &self.server)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Fixture {
    pub fn mount(config: MountConfig) -> Result<Self> {
        Self::mount_on(LoopbackServer::new(SERVER), config)
    }

    /// Mount against `server`, which must be named [`SERVER`] unless
    /// `config.servers` says otherwise.
    pub fn mount_on(server: LoopbackServer, config: MountConfig) -> Result<Self> {
        let connector = LoopbackConnector::new(config.transport).with_server(&server);
        let pages = Arc::new(AnonymousPages::new());
        let client = NfsClient::mount(
            &Cx::for_testing(),
            config,
            Arc::new(connector),
            Arc::clone(&pages) as Arc<dyn PageProvider>,
            Arc::new(WireCodec),
            Arc::new(StaticCredentials::default()),
        )?;
        Ok(Self {
            server,
            pages,
            client,
        })
    }

    /// Put `contents` on the server and tell the client the file's size.
    pub fn seed(&self, file: FileId, contents: &[u8]) {
        self.server.put_file(file, contents);
        self.pages.set_file_size(file, contents.len() as u64);
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
