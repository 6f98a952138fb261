//! Backend pool for the proxy: round-robin selection with bounded retries

use sigbox_crypto::StreamKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{Endpoint, FrameCodec, FramedConnection, TransportError};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No backend members configured")]
    Empty,

    #[error("No backend reachable after {0} attempts")]
    Exhausted(usize),

    #[error("Member index {0} out of range")]
    NoSuchMember(usize),

    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] TransportError),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),
}

/// Backend pool configuration
#[derive(Debug, Clone)]
pub struct BackendPoolConfig {
    /// Backend agents (round-robin)
    pub members: Vec<Endpoint>,

    /// Key authenticating the proxy-to-backend streams
    pub key: Option<StreamKey>,

    /// Connect attempts per selection before giving up
    pub max_attempts: usize,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for BackendPoolConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            key: None,
            max_attempts: 5,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_secs(1),
        }
    }
}

/// Fixed set of backend agents
pub struct BackendPool {
    config: BackendPoolConfig,
    robin_counter: AtomicUsize,
}

impl BackendPool {
    pub fn new(config: BackendPoolConfig) -> Result<Self, PoolError> {
        if config.members.is_empty() {
            return Err(PoolError::Empty);
        }
        info!("Backend pool with {} members", config.members.len());
        Ok(Self {
            config,
            robin_counter: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.config.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.config.members.is_empty()
    }

    pub fn member(&self, index: usize) -> Option<&Endpoint> {
        self.config.members.get(index)
    }

    /// Next member index (round-robin)
    pub fn next_member(&self) -> usize {
        self.robin_counter.fetch_add(1, Ordering::Relaxed) % self.config.members.len()
    }

    /// Open a framed connection to one specific member
    pub async fn connect_member(&self, index: usize) -> Result<FramedConnection, PoolError> {
        let endpoint = self.member(index).ok_or(PoolError::NoSuchMember(index))?;
        let connection = endpoint.connect().await?;
        let codec = FrameCodec::with_key(self.config.key.as_ref())
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;
        debug!(member = index, %endpoint, "Connected to backend");
        Ok(Framed::new(connection, codec))
    }

    /// Connect to whichever member answers first, walking the ring.
    ///
    /// Gives up after `max_attempts` failures, sleeping with jittered
    /// exponential backoff between tries.
    pub async fn connect_round_robin(&self) -> Result<(usize, FramedConnection), PoolError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            let index = self.next_member();
            match self.connect_member(index).await {
                Ok(conn) => return Ok((index, conn)),
                Err(e) => {
                    warn!(member = index, attempt, "Backend connect failed: {}", e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        Err(PoolError::Exhausted(attempts))
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.config.backoff_max);
        let millis = exp.as_millis() as u64;
        // up to +50% jitter
        Duration::from_millis(millis + fastrand::u64(0..=millis / 2))
    }
}

/// Parse `low:high` into the inclusive list of ports it names
pub fn parse_port_range(range: &str) -> Result<Vec<u16>, PoolError> {
    let invalid = || PoolError::InvalidPortRange(range.to_owned());
    let (low, high) = range.split_once(':').ok_or_else(invalid)?;
    let low: u16 = low.trim().parse().map_err(|_| invalid())?;
    let high: u16 = high.trim().parse().map_err(|_| invalid())?;
    if low == 0 || low > high {
        return Err(invalid());
    }
    Ok((low..=high).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> BackendPool {
        let members = (0..n)
            .map(|i| Endpoint::Tcp(format!("127.0.0.1:{}", 1 + i)))
            .collect();
        BackendPool::new(BackendPoolConfig {
            members,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_pool_config() {
        let config = BackendPoolConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!(config.key.is_none());
    }

    #[test]
    fn test_round_robin() {
        let pool = pool(4);

        assert_eq!(pool.next_member(), 0);
        assert_eq!(pool.next_member(), 1);
        assert_eq!(pool.next_member(), 2);
        assert_eq!(pool.next_member(), 3);
        assert_eq!(pool.next_member(), 0); // Wraps around
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(
            BackendPool::new(BackendPoolConfig::default()),
            Err(PoolError::Empty)
        ));
    }

    #[test]
    fn test_backoff_bounded() {
        let pool = pool(1);
        for attempt in 0..40 {
            let delay = pool.backoff(attempt);
            assert!(delay >= Duration::from_millis(20));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("9000:9002").unwrap(), vec![9000, 9001, 9002]);
        assert_eq!(parse_port_range("7:7").unwrap(), vec![7]);
        assert!(parse_port_range("9002:9000").is_err());
        assert!(parse_port_range("9000").is_err());
        assert!(parse_port_range("a:b").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausted() {
        let pool = BackendPool::new(BackendPoolConfig {
            members: vec![Endpoint::Unix("/nonexistent/sigbox.sock".into())],
            max_attempts: 3,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            pool.connect_round_robin().await,
            Err(PoolError::Exhausted(3))
        ));
    }

    #[tokio::test]
    async fn test_connect_skips_dead_member() {
        let listener = Endpoint::Tcp("127.0.0.1:0".into()).bind().await.unwrap();
        let live = listener.local_endpoint().unwrap();
        let pool = BackendPool::new(BackendPoolConfig {
            members: vec![Endpoint::Unix("/nonexistent/sigbox.sock".into()), live],
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let (index, _conn) = pool.connect_round_robin().await.unwrap();
        assert_eq!(index, 1);
        accept.await.unwrap().unwrap();
    }
}
