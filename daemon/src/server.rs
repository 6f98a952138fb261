//! Agent server: accept loop and per-connection frame pump

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sigbox_crypto::StreamKey;
use sigbox_cryptobox::{BoxFactory, CryptoBox};
use sigbox_transport::{CodecError, Connection, Endpoint, FrameCodec, Listener};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, DaemonConfig};
use crate::dispatcher::Dispatcher;
use crate::metrics::METRICS;
use crate::registry::SessionRegistry;
use crate::trust::TrustCache;

/// Whether an I/O error is just the peer going away
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Log a failed read the way its cause deserves
pub(crate) fn log_codec_error(peer: &str, e: &CodecError) {
    match e {
        CodecError::Io(io) if is_disconnect(io) => debug!(peer = %peer, "Peer reset connection"),
        CodecError::Io(io) => warn!(peer = %peer, "Read error: {}", io),
        _ => {
            METRICS.framing_errors.inc();
            warn!(peer = %peer, "Dropping connection: {}", e);
        }
    }
}

/// Build the default box from the `[agent]` section, if it names anything
pub async fn load_default_box(
    agent: &AgentConfig,
    factory: &dyn BoxFactory,
    trust: &TrustCache,
) -> Result<Option<Box<dyn CryptoBox>>> {
    if agent.is_empty() {
        return Ok(None);
    }

    let mut cbox = factory.create();
    if let Some(bundle) = trust.get().await? {
        cbox.load_trust_anchors(bundle);
    }

    for key in &agent.keys {
        let raw = tokio::fs::read(&key.path)
            .await
            .with_context(|| format!("reading key {}", key.path.display()))?;
        cbox.load_key(vec![Bytes::from(raw)], key.password.as_deref())
            .await
            .with_context(|| format!("loading key {}", key.path.display()))?;
    }

    let mut certs = Vec::with_capacity(agent.certs.len());
    for path in &agent.certs {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading certificate {}", path.display()))?;
        certs.push(Bytes::from(raw));
    }
    if !certs.is_empty() {
        cbox.load_cert(certs).await.context("loading certificates")?;
    }

    info!(
        keys = agent.keys.len(),
        certs = agent.certs.len(),
        "Default box loaded"
    );
    Ok(Some(cbox))
}

/// A bound agent, ready to serve
pub struct AgentServer {
    listener: Listener,
    registry: Arc<SessionRegistry>,
    key: Option<StreamKey>,
    limit: Arc<Semaphore>,
    sweep_every: Duration,
}

impl AgentServer {
    /// Bind the configured endpoint and prepare the registry
    pub async fn bind(config: &DaemonConfig, factory: Arc<dyn BoxFactory>) -> Result<Self> {
        let endpoint = config.server.endpoint()?;
        Self::bind_to(&endpoint, config, factory).await
    }

    pub async fn bind_to(
        endpoint: &Endpoint,
        config: &DaemonConfig,
        factory: Arc<dyn BoxFactory>,
    ) -> Result<Self> {
        let key = config.server.stream_key()?;
        let trust = Arc::new(TrustCache::new(config.server.ca.clone()));

        let default_box = load_default_box(&config.agent, factory.as_ref(), &trust).await?;
        let mut registry = SessionRegistry::new(factory, trust, config.server.idle_timeout());
        if let Some(cbox) = default_box {
            registry = registry.with_default_box(cbox);
        }

        let listener = endpoint.bind().await?;
        if key.is_none() {
            warn!("No stream key configured, frames are not authenticated");
        }

        Ok(Self {
            listener,
            registry: Arc::new(registry),
            key,
            limit: Arc::new(Semaphore::new(config.server.max_connections.max(1))),
            sweep_every: config.server.sweep_every(),
        })
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve until `shutdown` resolves, then drop every connection, stop the
    /// sweeper and remove the socket file. Returns the shutdown value.
    pub async fn run_until<F: Future>(self, shutdown: F) -> F::Output {
        let sweeper = self.registry.spawn_sweeper(self.sweep_every);
        let mut connections = JoinSet::new();
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
                    let Ok(permit) = self.limit.clone().try_acquire_owned() else {
                        warn!(peer = %peer, "Connection limit reached, refusing");
                        continue;
                    };
                    let registry = self.registry.clone();
                    let key = self.key.clone();
                    connections.spawn(async move {
                        serve_connection(conn, peer, registry, key).await;
                        drop(permit);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        info!("Agent stopping, dropping {} connections", connections.len());
        connections.abort_all();
        sweeper.abort();
        self.listener.cleanup();
        output
    }
}

async fn serve_connection(
    conn: Connection,
    peer: String,
    registry: Arc<SessionRegistry>,
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
    let mut dispatcher = Dispatcher::new(registry);

    METRICS.connections_active.inc();
    debug!(peer = %peer, "Client connected");

    while let Some(item) = framed.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                log_codec_error(&peer, &e);
                break;
            }
        };

        let reply = match dispatcher.handle(frame).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(peer = %peer, "Cannot encode reply: {}", e);
                break;
            }
        };

        let mut sent = Ok(());
        for frame in reply.frames {
            sent = framed.feed(frame).await;
            if sent.is_err() {
                break;
            }
        }
        if let Err(e) = sent.and(framed.flush().await) {
            log_codec_error(&peer, &e);
            break;
        }
        if reply.close {
            debug!(peer = %peer, "Closing after fatal error");
            break;
        }
    }

    let _ = framed.close().await;
    METRICS.connections_active.dec();
    debug!(peer = %peer, "Client disconnected");
}
