#![forbid(unsafe_code)]
//! FrankenNFS client: mount configuration and the facade tying the buffer
//! cache, the write-back engine and the request engine together.
//!
//! # Mounting
//!
//! ```ignore
//! let cx = Cx::for_request();
//! let config = MountConfig::load("/etc/fnfs/mount.json")?;
//! let client = NfsClient::mount(
//!     &cx,
//!     config,
//!     Arc::new(SocketConnector::new(TransportKind::Tcp)),
//!     Arc::new(AnonymousPages::new()),
//!     Arc::new(WireCodec),
//!     Arc::new(StaticCredentials::default()),
//! )?;
//! client.write(&cx, FileId(1), 0, b"hello", false)?;
//! client.flush(&cx, FileId(1), FlushMode::Wait)?;
//! client.unmount(&cx)?;
//! ```

pub mod config;

pub use config::{MAX_DATAGRAM_IO, MountConfig};
pub use fnfs_bio::{
    FlushMode, InvalidateMode, NfsCodec, WireCodec, WriteBackEngine, WriteBackStats,
};
pub use fnfs_buf::{
    AnonymousPages, BufFlags, BufferCache, BufferHandle, BufferInfo, CacheStats, GetFlags,
    PageProvider, PageState,
};
pub use fnfs_error::{NfsError, Result};
pub use fnfs_rpc::{
    Connector, EngineStats, Reply, RequestEngine, RequestHandle, SocketConnector,
};
pub use fnfs_types::{
    BlockNumber, Credential, CredentialProvider, Cx, FileId, ProcNumber, StaticCredentials,
    TransportKind, procs,
};

use fnfs_bio::FlusherHandle;
use fnfs_buf::ReclaimerHandle;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// How long dropping a still-mounted client spends writing back dirty data.
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// A mounted NFS client.
pub struct NfsClient {
    config: MountConfig,
    cache: BufferCache,
    rpc: Arc<RequestEngine>,
    io: WriteBackEngine,
    reclaimer: Mutex<Option<ReclaimerHandle>>,
    flusher: Mutex<Option<FlusherHandle>>,
    mounted: AtomicBool,
}

impl std::fmt::Debug for NfsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsClient")
            .field("servers", &self.config.servers)
            .field("transport", &self.config.transport)
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

impl NfsClient {
    /// Validate `config`, connect to the first server that answers, and
    /// start the reclaim and flusher threads.
    pub fn mount(
        cx: &Cx,
        config: MountConfig,
        connector: Arc<dyn Connector>,
        pages: Arc<dyn PageProvider>,
        codec: Arc<dyn NfsCodec>,
        creds: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if connector.kind() != config.transport {
            return Err(NfsError::InvalidConfig(format!(
                "connector speaks {:?} but the mount asks for {:?}",
                connector.kind(),
                config.transport
            )));
        }
        let cache = BufferCache::init(config.cache_config(), pages)?;
        let rpc = Arc::new(RequestEngine::connect(
            cx,
            config.rpc_config(),
            config.transport_config(),
            connector,
        )?);
        let io = WriteBackEngine::new(
            cache.clone(),
            Arc::clone(&rpc),
            codec,
            creds,
            config.writeback_config(),
        )?;
        let reclaimer = cache.start_reclaimer(config.reclaim_period)?;
        let flusher = io.start_flusher()?;
        info!(
            peer = ?rpc.transport().peer(),
            transport = ?config.transport,
            soft = config.soft,
            "mounted"
        );
        Ok(Self {
            config,
            cache,
            rpc,
            io,
            reclaimer: Mutex::new(Some(reclaimer)),
            flusher: Mutex::new(Some(flusher)),
            mounted: AtomicBool::new(true),
        })
    }

    /// Write back every dirty file, then stop all threads and drop the
    /// connection. Returns the first write-back error; teardown happens
    /// regardless. A second call is a no-op.
    pub fn unmount(&self, cx: &Cx) -> Result<()> {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown();
        }
        let mut first_err = None;
        for file in self.cache.files_with_dirty() {
            if let Err(err) = self.io.flush_all(cx, file, FlushMode::Wait) {
                warn!(file = file.0, error = %err, "write-back at unmount failed");
                first_err.get_or_insert(err);
            }
        }
        if let Some(reclaimer) = self.reclaimer.lock().take() {
            reclaimer.shutdown();
        }
        self.rpc.shutdown();
        self.cache.shutdown();
        info!("unmounted");
        first_err.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(NfsError::Shutdown)
        }
    }

    /// Acquire the buffer holding `block` of `file`.
    pub fn get(&self, cx: &Cx, file: FileId, block: BlockNumber, flags: GetFlags) -> Result<BufferHandle> {
        self.ensure_mounted()?;
        self.cache
            .get(cx, file, block, self.cache.buffer_size(), flags)
    }

    pub fn release(&self, handle: BufferHandle, can_reclaim: bool) {
        self.cache.release(handle, can_reclaim);
    }

    /// Record bytes `[off, end)` of `handle` as modified.
    pub fn mark_dirty(&self, cx: &Cx, handle: &mut BufferHandle, off: usize, end: usize) -> Result<()> {
        self.io.mark_dirty(cx, handle, off, end)
    }

    pub fn read(&self, cx: &Cx, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_mounted()?;
        self.io.read(cx, file, offset, len)
    }

    pub fn write(&self, cx: &Cx, file: FileId, offset: u64, data: &[u8], sync: bool) -> Result<usize> {
        self.ensure_mounted()?;
        self.io.write(cx, file, offset, data, sync)
    }

    pub fn flush(&self, cx: &Cx, file: FileId, mode: FlushMode) -> Result<()> {
        self.ensure_mounted()?;
        self.io.flush_all(cx, file, mode)
    }

    pub fn invalidate_all(&self, cx: &Cx, file: FileId, mode: InvalidateMode) -> Result<()> {
        self.ensure_mounted()?;
        self.io.invalidate_all(cx, file, mode)
    }

    /// Synchronous RPC.
    pub fn call(&self, cx: &Cx, proc: ProcNumber, cred: &Credential, args: &[u8]) -> Result<Reply> {
        self.rpc.call(cx, proc, cred, args)
    }

    /// Asynchronous RPC; `callback` runs once with the outcome.
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
        self.rpc.call_async(proc, cred, args, callback)
    }

    /// Drop an outstanding call; false if it already completed.
    pub fn abandon(&self, handle: RequestHandle) -> bool {
        self.rpc.abandon(handle)
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    #[must_use]
    pub fn rpc(&self) -> &Arc<RequestEngine> {
        &self.rpc
    }

    #[must_use]
    pub fn io(&self) -> &WriteBackEngine {
        &self.io
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }
}

impl Drop for NfsClient {
    fn drop(&mut self) {
        if self.is_mounted() {
            if let Err(err) = self.unmount(&Cx::with_timeout(DROP_FLUSH_TIMEOUT)) {
                warn!(error = %err, "unmount on drop lost dirty data");
            }
        }
    }
}
