use std::time::Duration;

use anyhow::bail;

use crate::messaging::member::Member;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub service_name: String,
    /// descriptor of the local member, sent to the remote peer during the handshake
    pub member: Option<Member>,

    /// default timeout for requests sent on a channel; zero means 'wait forever'
    pub request_timeout: Duration,
    /// upper bound for a single write to the underlying transport. Service-side processing never
    ///  waits longer than this for I/O.
    pub send_timeout: Duration,

    /// zero disables pings
    pub ping_interval: Duration,
    pub ping_timeout: Duration,

    /// 0 means 'unlimited'
    pub max_incoming_message_size: usize,
    /// 0 means 'unlimited'
    pub max_outgoing_message_size: usize,

    pub daemon_pool: DaemonPoolConfig,
}

impl PeerConfig {
    pub fn new(service_name: impl Into<String>) -> PeerConfig {
        PeerConfig {
            service_name: service_name.into(),
            member: None,
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            ping_interval: Duration::ZERO,
            ping_timeout: Duration::from_secs(30),
            max_incoming_message_size: 0,
            max_outgoing_message_size: 0,
            daemon_pool: DaemonPoolConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_timeout.is_zero() {
            bail!("send timeout must be greater than zero");
        }
        if !self.ping_interval.is_zero() && self.ping_timeout.is_zero() {
            bail!("ping timeout must be greater than zero when pings are enabled");
        }
        self.daemon_pool.validate()
    }

    /// `None` stands for 'no timeout'
    pub fn effective_request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_timeout)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonPoolConfig {
    pub min_workers: usize,
    /// `None` means 'unbounded'
    pub max_workers: Option<usize>,
    /// workers in excess of `min_workers` terminate after being idle for this long
    pub idle_timeout: Duration,
}

impl Default for DaemonPoolConfig {
    fn default() -> Self {
        DaemonPoolConfig {
            min_workers: 1,
            max_workers: None,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl DaemonPoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(max) = self.max_workers {
            if max == 0 {
                bail!("daemon pool needs at least one worker");
            }
            if self.min_workers > max {
                bail!("daemon pool min workers ({}) exceeds max workers ({})", self.min_workers, max);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub peer: PeerConfig,
    /// maximum number of open connections, 0 means 'unlimited'
    pub connection_limit: usize,
}

impl AcceptorConfig {
    pub fn new(service_name: impl Into<String>) -> AcceptorConfig {
        AcceptorConfig {
            peer: PeerConfig::new(service_name),
            connection_limit: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub peer: PeerConfig,
    /// zero means 'wait forever'
    pub connect_timeout: Duration,
    /// timeout for requests sent on this initiator's connection; zero falls back to
    ///  the peer's request timeout
    pub request_send_timeout: Duration,

    /// for connections between remote services in different clusters
    pub remote_cluster_name: Option<String>,
    pub remote_service_name: Option<String>,
}

impl InitiatorConfig {
    pub fn new(service_name: impl Into<String>) -> InitiatorConfig {
        InitiatorConfig {
            peer: PeerConfig::new(service_name),
            connect_timeout: Duration::from_secs(30),
            request_send_timeout: Duration::ZERO,
            remote_cluster_name: None,
            remote_service_name: None,
        }
    }

    pub fn effective_connect_timeout(&self) -> Option<Duration> {
        non_zero(self.connect_timeout)
    }

    pub fn effective_request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_send_timeout)
            .or_else(|| self.peer.effective_request_timeout())
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    }
    else {
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PeerConfig::new("svc").validate().is_ok());
        assert_eq!(DaemonPoolConfig::default().min_workers, 1);
        assert_eq!(DaemonPoolConfig::default().max_workers, None);
    }

    #[rstest]
    #[case::unbounded(1, None, true)]
    #[case::equal(2, Some(2), true)]
    #[case::min_exceeds_max(3, Some(2), false)]
    #[case::zero_max(0, Some(0), false)]
    fn test_daemon_pool_validate(#[case] min: usize, #[case] max: Option<usize>, #[case] expected_ok: bool) {
        let config = DaemonPoolConfig { min_workers: min, max_workers: max, ..Default::default() };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_zero_send_timeout_is_invalid() {
        let mut config = PeerConfig::new("svc");
        config.send_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::both_zero(0, 0, None)]
    #[case::peer_default(0, 30_000, Some(30_000))]
    #[case::own_timeout(500, 30_000, Some(500))]
    fn test_initiator_request_timeout(#[case] own_millis: u64, #[case] peer_millis: u64, #[case] expected: Option<u64>) {
        let mut config = InitiatorConfig::new("svc");
        config.request_send_timeout = Duration::from_millis(own_millis);
        config.peer.request_timeout = Duration::from_millis(peer_millis);
        assert_eq!(config.effective_request_timeout(), expected.map(Duration::from_millis));
    }
}
