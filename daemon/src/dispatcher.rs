//! Per-connection request dispatcher
//!
//! BINARY frames queue up as positional arguments; each STRUCTURED frame is
//! one control operation that consumes the queue.

use bytes::Bytes;
use serde_json::Value;
use sigbox_cryptobox::CryptoBox;
use sigbox_protocol::{
    Envelope, ErrorCode, Frame, FrameError, Headers, PipeStep, Request, Response, headers_from_opts,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::METRICS;
use crate::registry::SessionRegistry;

/// Frames to send back, and whether to hang up afterwards
#[derive(Debug, Default)]
pub struct Reply {
    pub frames: Vec<Frame>,
    pub close: bool,
}

impl Reply {
    fn push(&mut self, response: &Response) -> Result<(), FrameError> {
        if let Response::Error { code, .. } = response {
            METRICS.request_errors.with_label_values(&[code.as_str()]).inc();
            self.close |= code.is_fatal();
        }
        self.frames.push(Frame::structured(response)?);
        Ok(())
    }

    fn push_binary(&mut self, payload: Bytes) {
        self.frames.push(Frame::binary(payload));
    }

    fn single(response: &Response) -> Result<Self, FrameError> {
        let mut reply = Self::default();
        reply.push(response)?;
        Ok(reply)
    }
}

/// State of one client connection
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    pending: Vec<Bytes>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: Vec::new(),
        }
    }

    /// BINARY frames waiting for their control frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one decoded frame
    pub async fn handle(&mut self, frame: Frame) -> Result<Reply, FrameError> {
        if frame.is_binary() {
            self.pending.push(frame.into_payload());
            return Ok(Reply::default());
        }

        let args = std::mem::take(&mut self.pending);
        let envelope = match frame.parse::<Envelope>() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejecting control frame: {}", e);
                METRICS.requests.with_label_values(&["UNKNOWN"]).inc();
                return Reply::single(&Response::error(ErrorCode::Protocol));
            }
        };
        let Some(failure) = Request::failure_code(&envelope.op) else {
            warn!(op = %envelope.op, "Rejecting unknown operation");
            METRICS.requests.with_label_values(&["UNKNOWN"]).inc();
            return Reply::single(&Response::error(ErrorCode::Protocol));
        };

        let request = match frame.parse::<Request>() {
            Ok(request) => request,
            Err(e) => {
                warn!(op = %envelope.op, "Malformed arguments: {}", e);
                METRICS.requests.with_label_values(&[envelope.op.as_str()]).inc();
                return Reply::single(&Response::error(failure));
            }
        };

        METRICS.requests.with_label_values(&[request.op()]).inc();
        debug!(op = request.op(), bid = ?request.bid(), parts = args.len(), "Dispatching");
        self.dispatch(request, args).await
    }

    async fn dispatch(&self, request: Request, mut args: Vec<Bytes>) -> Result<Reply, FrameError> {
        match request {
            Request::Init => {
                let response = match self.registry.create().await {
                    Ok(bid) => Response::Created { bid },
                    Err(e) => {
                        warn!("Cannot create session: {}", e);
                        Response::error(ErrorCode::LoadCert)
                    }
                };
                return Reply::single(&response);
            }
            Request::Evict { .. } => {
                let bid = request.bid().map(str::to_owned);
                if let Some(bid) = bid.as_deref() {
                    self.registry.evict(bid);
                }
                return Reply::single(&Response::Gone { bid });
            }
            Request::Unprotect { password } => {
                return Reply::single(&self.unprotect(args, password.as_deref()).await);
            }
            _ => {}
        }

        let bid = request.bid().map(str::to_owned);
        let Some(cbox) = self.registry.lookup(bid.as_deref()) else {
            return Reply::single(&Response::not_found(bid.as_deref()));
        };
        let mut cbox = cbox.lock().await;

        let mut reply = Reply::default();
        match request {
            Request::AddKey { bid, password } => {
                let response = match cbox.load_key(args, password.as_deref()).await {
                    Ok(()) => Response::Done { bid },
                    Err(e) => {
                        warn!("eloadkey: {}", e);
                        Response::error(ErrorCode::LoadKey)
                    }
                };
                reply.push(&response)?;
            }
            Request::AddCert { bid } => {
                let response = match cbox.load_cert(args).await {
                    Ok(()) => Response::Done { bid },
                    Err(e) => {
                        warn!("eloadcert: {}", e);
                        Response::error(ErrorCode::LoadCert)
                    }
                };
                reply.push(&response)?;
            }
            Request::Info { .. } => {
                reply.push(&Response::Certs {
                    certs: cbox.certificates(),
                })?;
                reply.push(&Response::Ready)?;
            }
            Request::Pipe { pipe, opts, .. } => {
                let headers = headers_from_opts(&opts);
                match run_pipe(&**cbox, args, &pipe, &headers).await {
                    Ok(data) => {
                        reply.push_binary(data);
                        reply.push(&Response::Rpipe)?;
                    }
                    Err(e) => {
                        warn!("epipe: {}", e);
                        reply.push(&Response::error(ErrorCode::Pipe))?;
                    }
                }
            }
            Request::Unwrap { opts, .. } => {
                let first = (!args.is_empty()).then(|| args.remove(0));
                let second = (!args.is_empty()).then(|| args.remove(0));
                match run_unwrap(&**cbox, first, second, &opts).await {
                    Ok((content, meta)) => {
                        reply.push_binary(content);
                        reply.push(&Response::Meta { meta })?;
                    }
                    Err(e) => {
                        warn!("eunwrap: {}", e);
                        reply.push(&Response::error(ErrorCode::Unwrap))?;
                    }
                }
            }
            Request::Cmp { urls, .. } => {
                let response = match cbox.find_certs_cmp(&urls).await {
                    Ok(number) => Response::Rcmp { number },
                    Err(e) => {
                        warn!("ecmp: {}", e);
                        Response::error(ErrorCode::Cmp)
                    }
                };
                reply.push(&response)?;
            }
            Request::Init | Request::Evict { .. } | Request::Unprotect { .. } => {}
        }
        Ok(reply)
    }

    async fn unprotect(&self, args: Vec<Bytes>, password: Option<&str>) -> Response {
        let mut cbox = match self.registry.new_box().await {
            Ok(cbox) => cbox,
            Err(e) => {
                warn!("eunprotect: {}", e);
                return Response::error(ErrorCode::Unprotect);
            }
        };
        let exported = match cbox.load_key(args, password).await {
            Ok(()) => cbox.export_keys(),
            Err(e) => Err(e),
        };
        match exported {
            Ok(keys) => Response::Clear { keys },
            Err(e) => {
                warn!("eunprotect: {}", e);
                Response::error(ErrorCode::Unprotect)
            }
        }
    }
}

async fn run_pipe(
    cbox: &dyn CryptoBox,
    args: Vec<Bytes>,
    steps: &[PipeStep],
    headers: &Headers,
) -> Result<Bytes, String> {
    let content = args.into_iter().next().ok_or("no content to pipe")?;
    cbox.pipe(content, steps, headers)
        .await
        .map_err(|e| e.to_string())
}

async fn run_unwrap(
    cbox: &dyn CryptoBox,
    first: Option<Bytes>,
    second: Option<Bytes>,
    opts: &Value,
) -> Result<(Bytes, Value), String> {
    let content = first.ok_or("no content to unwrap")?;
    let unwrapped = cbox
        .unwrap_content(content, second, opts)
        .await
        .map_err(|e| e.to_string())?;
    Ok((unwrapped.content, unwrapped.meta))
}
