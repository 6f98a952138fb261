//! Session-affine reverse proxy in front of a pool of agents
//!
//! A client is bound to one backend connection at a time. Control frames
//! that carry a bid are routed to the backend that created that session;
//! everything else goes round-robin. Losing the backend mid-session is
//! reported to the client as EBUSY and the client is disconnected.

mod affinity;
mod backend;

pub use affinity::{Affinity, AffinityMap};
pub use backend::{BackendEvent, BackendLink, Claim};

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use sigbox_crypto::StreamKey;
use sigbox_protocol::{Envelope, ErrorCode, Frame, Response};
use sigbox_transport::{BackendPool, Connection, Endpoint, FrameCodec, Listener};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::config::DaemonConfig;
use crate::metrics::METRICS;
use crate::server::log_codec_error;

/// State shared by all client connections of a proxy
pub struct ProxyState {
    pool: BackendPool,
    affinity: Arc<AffinityMap>,
    next_client: AtomicU64,
}

impl ProxyState {
    pub fn new(pool: BackendPool) -> Self {
        Self {
            pool,
            affinity: Arc::new(AffinityMap::new()),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn affinity(&self) -> &AffinityMap {
        &self.affinity
    }

    async fn connect(&self, member: usize) -> Option<Arc<BackendLink>> {
        match self.pool.connect_member(member).await {
            Ok(framed) => Some(BackendLink::spawn(member, framed, self.affinity.clone())),
            Err(e) => {
                METRICS.backend_failures.inc();
                warn!(member, "Backend unreachable: {}", e);
                None
            }
        }
    }

    /// Pick a backend connection for a control frame
    pub async fn get_back(&self, bid: Option<&str>) -> Option<Arc<BackendLink>> {
        if let Some(bid) = bid {
            match self.affinity.lookup(bid) {
                Some(Affinity::Live(link)) => return Some(link),
                Some(Affinity::Stale(member)) => {
                    if let Some(link) = self.connect(member).await {
                        self.affinity.register(bid, &link);
                        return Some(link);
                    }
                }
                None => {}
            }
        }

        match self.pool.connect_round_robin().await {
            Ok((member, framed)) => Some(BackendLink::spawn(member, framed, self.affinity.clone())),
            Err(e) => {
                METRICS.backend_failures.inc();
                warn!("No backend available: {}", e);
                None
            }
        }
    }
}

/// A bound proxy, ready to serve
pub struct ProxyServer {
    listener: Listener,
    state: Arc<ProxyState>,
    key: Option<StreamKey>,
}

impl ProxyServer {
    pub async fn bind(config: &DaemonConfig) -> Result<Self> {
        let bind = config
            .proxy
            .bind
            .clone()
            .or_else(|| config.server.bind.clone())
            .context("proxy needs a bind address")?;
        let endpoint = Endpoint::from_bind(Some(&bind), true)?;
        Self::bind_to(&endpoint, config).await
    }

    pub async fn bind_to(endpoint: &Endpoint, config: &DaemonConfig) -> Result<Self> {
        let key = config.server.stream_key()?;
        let pool_config = config.proxy.pool_config(key.as_ref())?;
        if pool_config.members.is_empty() {
            bail!("proxy has no backends: set --ports or [proxy] backends");
        }
        let pool = BackendPool::new(pool_config)?;
        let listener = endpoint.bind().await?;

        Ok(Self {
            listener,
            state: Arc::new(ProxyState::new(pool)),
            key,
        })
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F: Future>(self, shutdown: F) -> F::Output {
        let mut clients = JoinSet::new();
        tokio::pin!(shutdown);

        let output = loop {
            tokio::select! {
                out = &mut shutdown => break out,
                accepted = self.listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("{}", e);
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let key = self.key.clone();
                    clients.spawn(serve_client(conn, peer, state, key));
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        };

        info!("Proxy stopping, dropping {} clients", clients.len());
        clients.abort_all();
        self.listener.cleanup();
        output
    }
}

/// Per-client routing state
struct ClientSession {
    id: u64,
    state: Arc<ProxyState>,
    bound: Option<Arc<BackendLink>>,
    pending: Vec<Frame>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl ClientSession {
    fn bound_link(&self) -> Option<&Arc<BackendLink>> {
        self.bound
            .as_ref()
            .filter(|link| !link.is_closed() && link.is_owned_by(self.id))
    }

    /// Make `link` this client's backend, hanging up the previous one.
    ///
    /// A link busy with another client's call is left alone; the session
    /// is reached over a second connection to the same member instead.
    async fn bind(&mut self, link: Arc<BackendLink>, bid: Option<&str>) -> bool {
        let link = match link.claim(self.id, self.events.clone()) {
            Claim::Granted => link,
            Claim::Closed => return false,
            Claim::Busy => {
                debug!(client = self.id, link = link.id(), "Backend busy, opening another");
                let Some(fresh) = self.state.connect(link.member()).await else {
                    return false;
                };
                if let Some(bid) = bid {
                    self.state.affinity.register(bid, &fresh);
                }
                if fresh.claim(self.id, self.events.clone()) != Claim::Granted {
                    return false;
                }
                fresh
            }
        };

        if let Some(old) = self.bound.replace(link.clone()) {
            if !Arc::ptr_eq(&old, &link) && old.release(self.id) {
                debug!(client = self.id, link = old.id(), "Closing stale backend");
                old.close();
            }
        }
        true
    }

    /// Route one control frame; false means the client must be refused
    async fn forward(&mut self, control: Frame) -> bool {
        let envelope: Envelope = control.parse().unwrap_or_default();
        let bid = envelope.bid.filter(|b| !b.is_empty());

        if bid.is_some() || self.bound_link().is_none() {
            let Some(link) = self.state.get_back(bid.as_deref()).await else {
                return false;
            };
            if !self.bind(link, bid.as_deref()).await {
                return false;
            }
        }

        let Some(link) = self.bound_link().cloned() else {
            return false;
        };
        debug!(client = self.id, link = link.id(), op = %envelope.op, "Forwarding");
        let mut ok = true;
        for frame in self.pending.drain(..) {
            ok &= link.send(frame);
        }
        ok && link.send(control)
    }

    fn is_bound_to(&self, link: u64) -> bool {
        self.bound.as_ref().is_some_and(|l| l.id() == link)
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.bound.take() {
            if link.release(self.id) {
                link.close();
            }
        }
    }
}

async fn serve_client(
    conn: Connection,
    peer: String,
    state: Arc<ProxyState>,
    key: Option<StreamKey>,
) {
    let codec = match FrameCodec::with_key(key.as_ref()) {
        Ok(codec) => codec,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    let mut framed = Framed::new(conn, codec);
    let (events, mut backend_rx) = mpsc::unbounded_channel();
    let mut session = ClientSession {
        id: state.next_client.fetch_add(1, Ordering::Relaxed),
        state,
        bound: None,
        pending: Vec::new(),
        events,
    };

    METRICS.connections_active.inc();
    debug!(peer = %peer, client = session.id, "Proxy client connected");

    let mut busy = false;
    loop {
        tokio::select! {
            item = framed.next() => match item {
                Some(Ok(frame)) if frame.is_binary() => session.pending.push(frame),
                Some(Ok(frame)) => {
                    if !session.forward(frame).await {
                        busy = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    log_codec_error(&peer, &e);
                    break;
                }
                None => break,
            },
            Some(event) = backend_rx.recv() => match event {
                BackendEvent::Frame(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        log_codec_error(&peer, &e);
                        break;
                    }
                }
                BackendEvent::Closed(link) if !session.is_bound_to(link) => {
                    trace!(client = session.id, link, "Ignoring close of a replaced backend");
                }
                BackendEvent::Closed(_) => {
                    METRICS.backend_failures.inc();
                    warn!(client = session.id, "Backend lost mid-session");
                    busy = true;
                    break;
                }
            },
        }
    }

    if busy {
        METRICS.request_errors.with_label_values(&[ErrorCode::Busy.as_str()]).inc();
        match Frame::structured(&Response::error(ErrorCode::Busy)) {
            Ok(frame) => {
                let _ = framed.send(frame).await;
            }
            Err(e) => error!("{}", e),
        }
    }
    session.disconnect();
    let _ = framed.close().await;
    METRICS.connections_active.dec();
    debug!(peer = %peer, client = session.id, "Proxy client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::AgentServer;
    use serde_json::json;
    use sigbox_cryptobox::SoftBoxFactory;
    use sigbox_transport::BackendPoolConfig;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn agent() -> (Endpoint, oneshot::Sender<()>) {
        let mut config = DaemonConfig::default();
        config.server.tcp = true;
        config.server.bind = Some("127.0.0.1:0".into());
        let server = AgentServer::bind(&config, Arc::new(SoftBoxFactory)).await.unwrap();
        let endpoint = server.local_endpoint().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));
        (endpoint, tx)
    }

    fn state(members: Vec<Endpoint>) -> ProxyState {
        ProxyState::new(
            BackendPool::new(BackendPoolConfig {
                members,
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn init_via(link: &Arc<BackendLink>) -> String {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(link.claim(99, tx), Claim::Granted);
        link.send(Frame::structured(&json!({"op": "INIT"})).unwrap());
        let BackendEvent::Frame(frame) = rx.recv().await.unwrap() else {
            panic!("link closed");
        };
        let Response::Created { bid } = frame.parse::<Response>().unwrap() else {
            panic!("unexpected reply");
        };
        link.release(99);
        bid
    }

    #[tokio::test]
    async fn test_created_registers_affinity() {
        let (a, _stop_a) = agent().await;
        let (b, _stop_b) = agent().await;
        let state = state(vec![a, b]);

        let link = state.get_back(None).await.unwrap();
        let bid = init_via(&link).await;
        assert_eq!(state.affinity().len(), 1);

        let reused = state.get_back(Some(&bid)).await.unwrap();
        assert!(Arc::ptr_eq(&reused, &link));
    }

    #[tokio::test]
    async fn test_stale_affinity_reconnects_same_member() {
        let (a, _stop_a) = agent().await;
        let (b, _stop_b) = agent().await;
        let state = state(vec![a, b]);

        let link = state.get_back(None).await.unwrap();
        let member = link.member();
        let bid = init_via(&link).await;
        link.close();

        let relinked = state.get_back(Some(&bid)).await.unwrap();
        assert!(!Arc::ptr_eq(&relinked, &link));
        assert_eq!(relinked.member(), member);
    }

    #[tokio::test]
    async fn test_claim_refused_while_call_outstanding() {
        let (a, _stop_a) = agent().await;
        let state = state(vec![a]);
        let link = state.get_back(None).await.unwrap();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert_eq!(link.claim(1, tx1.clone()), Claim::Granted);
        assert!(link.send(Frame::structured(&json!({"op": "INIT"})).unwrap()));
        assert_eq!(link.claim(2, tx2.clone()), Claim::Busy);
        // the caller itself may re-claim mid-call
        assert_eq!(link.claim(1, tx1), Claim::Granted);

        let BackendEvent::Frame(frame) = rx1.recv().await.unwrap() else {
            panic!("link closed");
        };
        assert!(matches!(frame.parse::<Response>().unwrap(), Response::Created { .. }));
        assert_eq!(link.claim(2, tx2), Claim::Granted);

        link.close();
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert_eq!(link.claim(3, tx3), Claim::Closed);
    }

    #[tokio::test]
    async fn test_busy_link_gets_second_connection() {
        let (a, _stop_a) = agent().await;
        let (b, _stop_b) = agent().await;
        let state = Arc::new(state(vec![a, b]));

        let link = state.get_back(None).await.unwrap();
        let bid = init_via(&link).await;

        // another client has a call outstanding on the session's link
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(link.claim(1, tx), Claim::Granted);
        link.send(Frame::structured(&json!({"op": "INFO", "bid": bid})).unwrap());

        let (events, _backend_rx) = mpsc::unbounded_channel();
        let mut session = ClientSession {
            id: 2,
            state: state.clone(),
            bound: None,
            pending: Vec::new(),
            events,
        };
        assert!(session.bind(link.clone(), Some(&bid)).await);

        let bound = session.bound_link().cloned().unwrap();
        assert!(!Arc::ptr_eq(&bound, &link));
        assert_eq!(bound.member(), link.member());
        assert!(link.is_owned_by(1));
        match state.affinity().lookup(&bid) {
            Some(Affinity::Live(pinned)) => assert!(Arc::ptr_eq(&pinned, &bound)),
            _ => panic!("session not pinned to the new link"),
        }
    }

    #[tokio::test]
    async fn test_no_backend() {
        let state = state(vec![Endpoint::Unix("/nonexistent/sigbox.sock".into())]);
        assert!(state.get_back(None).await.is_none());
        assert!(state.get_back(Some("ab")).await.is_none());
    }

    #[tokio::test]
    async fn test_client_refused_when_pool_down() {
        let mut config = DaemonConfig::default();
        config.proxy.backends = vec!["unix:///nonexistent/sigbox.sock".into()];
        config.proxy.max_attempts = 1;
        let proxy = ProxyServer::bind_to(&Endpoint::Tcp("127.0.0.1:0".into()), &config)
            .await
            .unwrap();
        let endpoint = proxy.local_endpoint().unwrap();
        let (_stop, rx) = oneshot::channel::<()>();
        tokio::spawn(proxy.run_until(async move {
            let _ = rx.await;
        }));

        let mut framed = Framed::new(endpoint.connect().await.unwrap(), FrameCodec::new());
        framed
            .send(Frame::structured(&json!({"op": "INIT"})).unwrap())
            .await
            .unwrap();
        let reply: Response = framed.next().await.unwrap().unwrap().parse().unwrap();
        assert_eq!(reply, Response::error(ErrorCode::Busy));
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_requires_backends() {
        let config = DaemonConfig::default();
        assert!(
            ProxyServer::bind_to(&Endpoint::Tcp("127.0.0.1:0".into()), &config)
                .await
                .is_err()
        );
    }
}
