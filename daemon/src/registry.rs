//! Session registry: bid -> crypto box

use dashmap::DashMap;
use sigbox_crypto::new_session_id;
use sigbox_cryptobox::{BoxFactory, CryptoBox};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::metrics::METRICS;
use crate::trust::{TrustCache, TrustError};

/// A box shared between the registry and in-flight requests.
/// Operations on one box are serialized by the mutex.
pub type SharedBox = Arc<Mutex<Box<dyn CryptoBox>>>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Trust anchors unavailable: {0}")]
    Trust(#[from] TrustError),
}

struct Session {
    cbox: SharedBox,
    created_at: Instant,
    last_access: Instant,
}

/// Live sessions of one agent
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    factory: Arc<dyn BoxFactory>,
    trust: Arc<TrustCache>,
    default_box: Option<SharedBox>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn BoxFactory>, trust: Arc<TrustCache>, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            trust,
            default_box: None,
            idle_timeout,
        }
    }

    /// Box addressed by requests that carry no bid
    pub fn with_default_box(mut self, cbox: Box<dyn CryptoBox>) -> Self {
        self.default_box = Some(Arc::new(Mutex::new(cbox)));
        self
    }

    pub fn has_default_box(&self) -> bool {
        self.default_box.is_some()
    }

    /// An empty box with the shared trust anchors, not registered anywhere
    pub async fn new_box(&self) -> Result<Box<dyn CryptoBox>, RegistryError> {
        let mut cbox = self.factory.create();
        if let Some(bundle) = self.trust.get().await? {
            cbox.load_trust_anchors(bundle);
        }
        Ok(cbox)
    }

    /// Register a fresh box and return its id
    pub async fn create(&self) -> Result<String, RegistryError> {
        let cbox = self.new_box().await?;
        let bid = new_session_id();
        let now = Instant::now();
        self.sessions.insert(
            bid.clone(),
            Session {
                cbox: Arc::new(Mutex::new(cbox)),
                created_at: now,
                last_access: now,
            },
        );
        METRICS.sessions_active.set(self.sessions.len() as i64);
        debug!(bid = %bid, "Session created");
        Ok(bid)
    }

    /// Box for `bid`, bumping its last access time.
    /// No bid, or an empty one, means the default box.
    pub fn lookup(&self, bid: Option<&str>) -> Option<SharedBox> {
        let Some(bid) = bid.filter(|b| !b.is_empty()) else {
            return self.default_box.clone();
        };
        let mut session = self.sessions.get_mut(bid)?;
        session.last_access = Instant::now();
        Some(session.cbox.clone())
    }

    /// Remove a session; false if it did not exist
    pub fn evict(&self, bid: &str) -> bool {
        let removed = self.sessions.remove(bid);
        if let Some((_, session)) = &removed {
            METRICS.sessions_evicted.inc();
            METRICS.sessions_active.set(self.sessions.len() as i64);
            debug!(
                bid = %bid,
                age = ?session.created_at.elapsed(),
                "Session evicted"
            );
        }
        removed.is_some()
    }

    /// Drop sessions idle for longer than the timeout
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.saturating_duration_since(s.last_access) <= self.idle_timeout);
        let purged = before.saturating_sub(self.sessions.len());

        if purged > 0 {
            METRICS.sessions_evicted.inc_by(purged as u64);
            METRICS.sessions_active.set(self.sessions.len() as i64);
            debug!(purged, "Swept idle sessions");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, bid: &str) -> bool {
        self.sessions.contains_key(bid)
    }

    /// Run `sweep` every `every` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        info!(
            "Sweeping sessions idle for {:?} every {:?}",
            registry.idle_timeout, every
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}
