//! One proxy-to-backend connection
//!
//! The link runs as its own task. Frames from the backend go to whichever
//! client currently owns the link; a link with no owner only updates the
//! affinity map.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sigbox_protocol::{ErrorCode, Frame, Response};
use sigbox_transport::FramedConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use super::affinity::AffinityMap;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// What a link reports to its owner
#[derive(Debug)]
pub enum BackendEvent {
    Frame(Frame),
    /// The backend behind link `.0` went away while this client owned it
    Closed(u64),
}

struct Owner {
    client: u64,
    events: mpsc::UnboundedSender<BackendEvent>,
    /// A control frame went out and its terminal response has not come back
    in_flight: bool,
}

/// Outcome of `BackendLink::claim`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Granted,
    /// The backend connection is gone
    Closed,
    /// Another client is waiting for a reply on this link
    Busy,
}

pub struct BackendLink {
    id: u64,
    member: usize,
    outbound: mpsc::UnboundedSender<Frame>,
    owner: Mutex<Option<Owner>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl BackendLink {
    /// Start pumping `framed` for pool member `member`
    pub fn spawn(member: usize, framed: FramedConnection, affinity: Arc<AffinityMap>) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            member,
            outbound,
            owner: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        tokio::spawn(link.clone().run(framed, rx, affinity));
        link
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn member(&self) -> usize {
        self.member
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_owned_by(&self, client: u64) -> bool {
        self.owner.lock().as_ref().is_some_and(|o| o.client == client)
    }

    /// Route this link's traffic to `client`.
    ///
    /// Ownership moves between clients only while no call is outstanding,
    /// so a reply is never delivered to a client that did not ask for it.
    pub fn claim(&self, client: u64, events: mpsc::UnboundedSender<BackendEvent>) -> Claim {
        let mut owner = self.owner.lock();
        if self.is_closed() {
            return Claim::Closed;
        }
        let in_flight = match owner.as_ref() {
            Some(o) if o.client == client => o.in_flight,
            Some(o) if o.in_flight => return Claim::Busy,
            Some(o) => {
                debug!(link = self.id, from = o.client, to = client, "Link changes owner");
                false
            }
            None => false,
        };
        *owner = Some(Owner {
            client,
            events,
            in_flight,
        });
        Claim::Granted
    }

    /// Drop ownership if `client` holds it; true if it did
    pub fn release(&self, client: u64) -> bool {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|o| o.client == client) {
            *owner = None;
            return true;
        }
        false
    }

    /// Queue a frame for the backend
    pub fn send(&self, frame: Frame) -> bool {
        if frame.is_structured() {
            if let Some(owner) = self.owner.lock().as_mut() {
                owner.in_flight = true;
            }
        }
        !self.is_closed() && self.outbound.send(frame).is_ok()
    }

    /// Hang up. The current owner, if any, is not told.
    pub fn close(&self) {
        self.owner.lock().take();
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    async fn run(
        self: Arc<Self>,
        framed: FramedConnection,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        affinity: Arc<AffinityMap>,
    ) {
        let (mut sink, mut stream) = framed.split();
        debug!(link = self.id, member = self.member, "Backend link up");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                Some(frame) = outbound.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(link = self.id, "Backend write failed: {}", e);
                        break;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(frame)) => {
                        let terminal = self.observe(&frame, &affinity);
                        self.deliver(frame, terminal);
                    }
                    Some(Err(e)) => {
                        warn!(link = self.id, "Backend read failed: {}", e);
                        break;
                    }
                    None => {
                        debug!(link = self.id, "Backend closed the connection");
                        break;
                    }
                },
            }
        }

        let owner = {
            let mut owner = self.owner.lock();
            self.closed.store(true, Ordering::Release);
            owner.take()
        };
        if let Some(owner) = owner {
            let _ = owner.events.send(BackendEvent::Closed(self.id));
        }
        let _ = sink.close().await;
    }

    /// Track affinity; true if `frame` ends the call in flight
    fn observe(self: &Arc<Self>, frame: &Frame, affinity: &AffinityMap) -> bool {
        if !frame.is_structured() {
            return false;
        }
        match frame.parse::<Response>() {
            Ok(Response::Created { bid }) => affinity.register(&bid, self),
            Ok(Response::Gone { bid: Some(bid) })
            | Ok(Response::Error {
                code: ErrorCode::NotFound,
                bid: Some(bid),
            }) => affinity.remove(&bid),
            Ok(Response::Certs { .. }) => return false,
            _ => {}
        }
        true
    }

    fn deliver(&self, frame: Frame, terminal: bool) {
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            Some(owner) => {
                if terminal {
                    owner.in_flight = false;
                }
                let _ = owner.events.send(BackendEvent::Frame(frame));
            }
            None => trace!(link = self.id, "Dropping frame for unowned link"),
        }
    }
}
