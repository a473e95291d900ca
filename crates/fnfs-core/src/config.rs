//! Mount configuration.
//!
//! One flat, serde-loadable struct covering every tunable of a mount;
//! [`MountConfig`] projects it onto the per-crate configs. Durations are
//! written in milliseconds.

use fnfs_bio::WriteBackConfig;
use fnfs_buf::CacheConfig;
use fnfs_error::{NfsError, Result};
use fnfs_rpc::{RpcConfig, TimeoutPolicy, TransportConfig};
use fnfs_types::{TimeoutMultipliers, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest READ/WRITE payload that still fits one datagram with headroom
/// for the RPC header.
pub const MAX_DATAGRAM_IO: usize = 32 * 1024;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Everything a mount can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// Candidate server addresses, most preferred first.
    pub servers: Vec<String>,
    pub transport: TransportKind,
    pub read_size: usize,
    pub write_size: usize,
    /// Bytes per cache buffer.
    pub buffer_size: usize,
    /// Blocks prefetched after a read.
    pub readahead: usize,
    pub timeout_class_multipliers: TimeoutMultipliers,
    #[serde(with = "millis")]
    pub initial_timeout: Duration,
    #[serde(with = "millis")]
    pub min_timeout: Duration,
    #[serde(with = "millis")]
    pub max_timeout: Duration,
    /// Retransmissions before a soft mount fails a call.
    pub retrans: u32,
    pub soft: bool,
    pub max_delayed_writes: usize,
    /// Datagram send window cap, at most 32 requests.
    pub max_outstanding_requests: usize,
    #[serde(with = "millis")]
    pub try_later_initial_delay: Duration,
    #[serde(with = "millis")]
    pub try_later_max_delay: Duration,
    pub try_later_budget: u32,
    #[serde(with = "millis")]
    pub timer_period: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub search_timeout: Duration,
    pub search_concurrency: usize,
    /// First reconnect delay; doubles up to `max_timeout`.
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    pub max_buffers: usize,
    pub min_buffers: usize,
    pub max_meta_buffers: usize,
    #[serde(with = "millis")]
    pub lru_stale: Duration,
    #[serde(with = "millis")]
    pub meta_stale: Duration,
    #[serde(with = "millis")]
    pub reclaim_period: Duration,
    #[serde(with = "millis")]
    pub flush_period: Duration,
    pub flush_batch: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        let cache = CacheConfig::default();
        let rpc = RpcConfig::default();
        let transport = TransportConfig::default();
        let io = WriteBackConfig::default();
        Self {
            servers: Vec::new(),
            transport: TransportKind::default(),
            read_size: io.read_size,
            write_size: io.write_size,
            buffer_size: cache.buffer_size,
            readahead: io.readahead,
            timeout_class_multipliers: rpc.policy.multipliers,
            initial_timeout: rpc.policy.initial,
            min_timeout: rpc.policy.min,
            max_timeout: rpc.policy.max,
            retrans: rpc.retrans,
            soft: rpc.soft,
            max_delayed_writes: io.max_delayed_writes,
            max_outstanding_requests: rpc.max_outstanding,
            try_later_initial_delay: rpc.try_later_initial,
            try_later_max_delay: rpc.try_later_max,
            try_later_budget: rpc.try_later_budget,
            timer_period: rpc.timer_period,
            connect_timeout: transport.connect_timeout,
            search_timeout: transport.search_timeout,
            search_concurrency: transport.search_concurrency,
            reconnect_delay: transport.reconnect_delay,
            max_buffers: cache.max_buffers,
            min_buffers: cache.min_buffers,
            max_meta_buffers: cache.max_meta_buffers,
            lru_stale: cache.lru_stale,
            meta_stale: cache.meta_stale,
            reclaim_period: Duration::from_secs(5),
            flush_period: io.flush_period,
            flush_batch: io.flush_batch,
        }
    }
}

impl MountConfig {
    /// Load and validate a JSON configuration file. Missing fields take
    /// their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| NfsError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.cache_config().validate()?;
        self.rpc_config().validate()?;
        self.transport_config().validate()?;
        self.writeback_config().validate(self.buffer_size)?;
        if self.reclaim_period.is_zero() {
            return Err(NfsError::InvalidConfig(
                "reclaim_period must be non-zero".to_owned(),
            ));
        }
        if self.transport.is_datagram() && self.read_size.max(self.write_size) > MAX_DATAGRAM_IO {
            return Err(NfsError::InvalidConfig(format!(
                "read and write sizes over udp are limited to {MAX_DATAGRAM_IO} bytes"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_max_buffers(self.max_buffers)
            .with_min_buffers(self.min_buffers)
            .with_max_meta_buffers(self.max_meta_buffers)
            .with_buffer_size(self.buffer_size)
            .with_staleness(self.lru_stale, self.meta_stale)
    }

    #[must_use]
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig::default()
            .with_policy(TimeoutPolicy {
                initial: self.initial_timeout,
                min: self.min_timeout,
                max: self.max_timeout,
                multipliers: self.timeout_class_multipliers,
            })
            .with_retrans(self.retrans)
            .with_soft(self.soft)
            .with_timer_period(self.timer_period)
            .with_try_later(
                self.try_later_initial_delay,
                self.try_later_max_delay,
                self.try_later_budget,
            )
            .with_max_outstanding(self.max_outstanding_requests)
    }

    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            servers: self.servers.clone(),
            connect_timeout: self.connect_timeout,
            search_timeout: self.search_timeout,
            search_concurrency: self.search_concurrency,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_delay: self.max_timeout.max(self.reconnect_delay),
        }
    }

    #[must_use]
    pub fn writeback_config(&self) -> WriteBackConfig {
        WriteBackConfig::default()
            .with_io_sizes(self.read_size, self.write_size)
            .with_readahead(self.readahead)
            .with_max_delayed_writes(self.max_delayed_writes)
            .with_flusher(self.flush_period, self.flush_batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mount() -> MountConfig {
        MountConfig::default().with_servers(["127.0.0.1:2049"])
    }

    #[test]
    fn defaults_validate_once_a_server_is_given() {
        assert!(MountConfig::default().validate().is_err());
        mount().validate().expect("valid");
    }

    #[test]
    fn projections_carry_the_settings() {
        let mut cfg = mount();
        cfg.soft = true;
        cfg.retrans = 7;
        cfg.max_outstanding_requests = 8;
        cfg.buffer_size = 64 * 1024;
        cfg.max_timeout = Duration::from_secs(20);
        let rpc = cfg.rpc_config();
        assert!(rpc.soft);
        assert_eq!(rpc.retrans, 7);
        assert_eq!(rpc.max_outstanding, 8);
        assert_eq!(rpc.policy.max, Duration::from_secs(20));
        assert_eq!(cfg.cache_config().buffer_size, 64 * 1024);
        assert_eq!(cfg.transport_config().max_reconnect_delay, Duration::from_secs(20));
        assert_eq!(cfg.writeback_config().write_size, cfg.write_size);
    }

    #[test]
    fn udp_limits_io_size() {
        let mut cfg = mount().with_transport(TransportKind::Udp);
        cfg.validate().expect("defaults fit a datagram");
        cfg.buffer_size = 64 * 1024;
        cfg.read_size = 64 * 1024;
        assert!(matches!(cfg.validate(), Err(NfsError::InvalidConfig(_))));
    }

    #[test]
    fn send_window_above_the_ceiling_is_rejected() {
        let mut cfg = mount();
        cfg.max_outstanding_requests = 33;
        assert!(matches!(cfg.validate(), Err(NfsError::InvalidConfig(_))));
        cfg.max_outstanding_requests = 32;
        cfg.validate().expect("ceiling");
    }

    #[test]
    fn io_size_larger_than_buffer_is_rejected() {
        let mut cfg = mount();
        cfg.write_size = cfg.buffer_size * 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_uses_milliseconds_and_defaults() {
        let cfg: MountConfig = serde_json::from_str(
            r#"{"servers": ["10.0.0.1:2049"], "transport": "udp", "initial_timeout": 700, "soft": true}"#,
        )
        .expect("parse");
        assert_eq!(cfg.transport, TransportKind::Udp);
        assert_eq!(cfg.initial_timeout, Duration::from_millis(700));
        assert!(cfg.soft);
        assert_eq!(cfg.read_size, MountConfig::default().read_size);
        let json = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(json["initial_timeout"], 700);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<MountConfig>(r#"{"rsize": 8192}"#);
        assert!(err.is_err());
    }

    #[test]
    fn load_reads_and_validates_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"servers": ["127.0.0.1:2049"], "readahead": 4, "flush_period": 250}}"#
        )
        .expect("write");
        let cfg = MountConfig::load(file.path()).expect("load");
        assert_eq!(cfg.readahead, 4);
        assert_eq!(cfg.flush_period, Duration::from_millis(250));

        let mut bad = tempfile::NamedTempFile::new().expect("tempfile");
        write!(bad, r#"{{"servers": []}}"#).expect("write");
        assert!(matches!(MountConfig::load(bad.path()), Err(NfsError::InvalidConfig(_))));

        let mut garbage = tempfile::NamedTempFile::new().expect("tempfile");
        write!(garbage, "not json").expect("write");
        assert!(matches!(MountConfig::load(garbage.path()), Err(NfsError::InvalidConfig(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = MountConfig::load(dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(err, NfsError::Io(_)));
    }
}
