#![forbid(unsafe_code)]
//! RPC transport engine for the FrankenNFS client.
//!
//! Layers, bottom up:
//! - [`framing`]: record marking for stream transports
//! - [`message`]: call/reply envelopes and transaction ids
//! - [`rtt`]: per-class round-trip estimation and retransmit timeouts
//! - [`congestion`]: the datagram send window
//! - [`transport`]: connection search, verification and reconnect
//! - [`engine`]: the pending-request table, timer and reply correlation

pub mod congestion;
pub mod engine;
pub mod framing;
pub mod message;
pub mod request;
pub mod rtt;
pub mod transport;

pub use congestion::{CWND_SCALE, CongestionController, MAX_CWND_CREDITS, WindowState};
pub use engine::{EngineStats, RequestEngine};
pub use message::{Reply, ReplyOutcome, XidSource};
pub use request::{RequestHandle, RequestState};
pub use rtt::{RttEstimator, TimeoutPolicy};
pub use transport::{
    Connector, SocketConnector, SocketTransport, TcpTransport, Transport, TransportEvent,
    UdpTransport,
};

use fnfs_error::{NfsError, Result};
use fnfs_types::Cx;
use std::time::Duration;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(NfsError::from)
}

/// Retry and timing policy of the request engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcConfig {
    pub policy: TimeoutPolicy,
    /// Timeout-driven retransmissions before a soft mount gives up or a
    /// hard mount reports the server as not responding.
    pub retrans: u32,
    pub soft: bool,
    pub timer_period: Duration,
    pub try_later_initial: Duration,
    pub try_later_max: Duration,
    /// Try-later resends allowed per request.
    pub try_later_budget: u32,
    /// Congestion window cap, in requests; at most [`MAX_CWND_CREDITS`].
    pub max_outstanding: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            policy: TimeoutPolicy::default(),
            retrans: 3,
            soft: false,
            timer_period: Duration::from_millis(50),
            try_later_initial: Duration::from_secs(1),
            try_later_max: Duration::from_secs(30),
            try_later_budget: 10,
            max_outstanding: 16,
        }
    }
}

impl RpcConfig {
    #[must_use]
    pub fn with_soft(mut self, soft: bool) -> Self {
        self.soft = soft;
        self
    }

    #[must_use]
    pub fn with_retrans(mut self, retrans: u32) -> Self {
        self.retrans = retrans;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_try_later(mut self, initial: Duration, max: Duration, budget: u32) -> Self {
        self.try_later_initial = initial;
        self.try_later_max = max;
        self.try_later_budget = budget;
        self
    }

    #[must_use]
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = max;
        self
    }

    #[must_use]
    pub fn with_timer_period(mut self, period: Duration) -> Self {
        self.timer_period = period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.policy;
        if p.min.is_zero() || p.min > p.max || p.initial.is_zero() {
            return Err(NfsError::InvalidConfig(format!(
                "timeouts must satisfy 0 < min ({:?}) <= max ({:?}) and initial > 0",
                p.min, p.max
            )));
        }
        if !p.multipliers.is_valid() {
            return Err(NfsError::InvalidConfig(
                "timeout class multipliers must be finite and positive".to_owned(),
            ));
        }
        if self.timer_period.is_zero() {
            return Err(NfsError::InvalidConfig("timer period must be non-zero".to_owned()));
        }
        if self.try_later_initial.is_zero() || self.try_later_initial > self.try_later_max {
            return Err(NfsError::InvalidConfig(
                "try-later delays must satisfy 0 < initial <= max".to_owned(),
            ));
        }
        if self.max_outstanding == 0 || self.max_outstanding > MAX_CWND_CREDITS as usize {
            return Err(NfsError::InvalidConfig(format!(
                "max outstanding requests must be in 1..={MAX_CWND_CREDITS}, got {}",
                self.max_outstanding
            )));
        }
        Ok(())
    }
}

/// Where and how to (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Candidate server addresses in order of preference.
    pub servers: Vec<String>,
    pub connect_timeout: Duration,
    pub search_timeout: Duration,
    pub search_concurrency: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            search_timeout: Duration::from_secs(30),
            search_concurrency: 4,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(NfsError::InvalidConfig("no server addresses".to_owned()));
        }
        if self.connect_timeout.is_zero() || self.search_timeout.is_zero() {
            return Err(NfsError::InvalidConfig(
                "connect and search timeouts must be non-zero".to_owned(),
            ));
        }
        if self.search_concurrency == 0 {
            return Err(NfsError::InvalidConfig(
                "search concurrency must be at least 1".to_owned(),
            ));
        }
        if self.reconnect_delay.is_zero() || self.reconnect_delay > self.max_reconnect_delay {
            return Err(NfsError::InvalidConfig(
                "reconnect delays must satisfy 0 < initial <= max".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        RpcConfig::default().validate().expect("rpc");
        TransportConfig::default()
            .with_servers(["127.0.0.1:2049"])
            .validate()
            .expect("transport");
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(RpcConfig::default().with_max_outstanding(0).validate().is_err());
        assert!(
            RpcConfig::default()
                .with_max_outstanding(MAX_CWND_CREDITS as usize + 1)
                .validate()
                .is_err()
        );
        RpcConfig::default()
            .with_max_outstanding(MAX_CWND_CREDITS as usize)
            .validate()
            .expect("ceiling is allowed");
        assert!(
            RpcConfig::default()
                .with_try_later(Duration::from_secs(5), Duration::from_secs(1), 3)
                .validate()
                .is_err()
        );
        let mut policy = TimeoutPolicy::default();
        policy.min = policy.max + Duration::from_secs(1);
        assert!(RpcConfig::default().with_policy(policy).validate().is_err());
        assert!(TransportConfig::default().validate().is_err());
    }
}
