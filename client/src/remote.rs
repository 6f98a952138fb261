//! Client side of the control protocol

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sigbox_crypto::StreamKey;
use sigbox_protocol::{
    ClearKey, ErrorCode, Frame, Headers, PipeStep, Request, Response, opts_from_headers,
};
use sigbox_transport::{Endpoint, FrameCodec, FramedConnection};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::ClientError;

/// Result of `RemoteBox::unwrap`
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUnwrapped {
    pub content: Bytes,
    pub meta: Value,
}

/// A CryptoBox held by a remote agent.
///
/// One call at a time: every method takes `&mut self` and returns only
/// after the agent's terminal response.
pub struct RemoteBox {
    framed: FramedConnection,
    bid: Option<String>,
    certs: Vec<Value>,
    ready: bool,
}

impl RemoteBox {
    /// Connect and fetch the certificate list of the default box.
    ///
    /// An agent without a default box answers ENOENT; the connection is
    /// still usable for `init()`.
    pub async fn connect(endpoint: &Endpoint, key: Option<&StreamKey>) -> Result<Self, ClientError> {
        let conn = endpoint.connect().await?;
        let mut remote = Self::from_framed(Framed::new(conn, FrameCodec::with_key(key)?));
        match remote.info().await {
            Ok(_) => {}
            Err(ClientError::Remote {
                code: ErrorCode::NotFound,
                ..
            }) => {
                debug!("No default box on {}", endpoint);
                remote.ready = true;
            }
            Err(e) => return Err(e),
        }
        Ok(remote)
    }

    /// Wrap an already framed connection without talking to the agent
    pub fn from_framed(framed: FramedConnection) -> Self {
        Self {
            framed,
            bid: None,
            certs: Vec::new(),
            ready: false,
        }
    }

    pub fn bid(&self) -> Option<&str> {
        self.bid.as_deref()
    }

    /// Address an existing session
    pub fn set_bid(&mut self, bid: Option<String>) {
        self.bid = bid;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Certificates as of the last `info()`
    pub fn certificates(&self) -> &[Value] {
        &self.certs
    }

    pub async fn info(&mut self) -> Result<Vec<Value>, ClientError> {
        let request = Request::Info {
            bid: self.bid.clone(),
        };
        let (_, response) = self.call(Vec::new(), &request).await?;
        match response {
            Response::Ready => {
                self.ready = true;
                Ok(self.certs.clone())
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Create a session and address it from now on
    pub async fn init(&mut self) -> Result<String, ClientError> {
        let (_, response) = self.call(Vec::new(), &Request::Init).await?;
        match response {
            Response::Created { bid } => {
                debug!(bid = %bid, "Session created");
                self.bid = Some(bid.clone());
                self.certs.clear();
                Ok(bid)
            }
            other => Err(unexpected(&Request::Init, &other)),
        }
    }

    /// Destroy the current session. The bid is kept unless the agent
    /// confirms with GONE.
    pub async fn evict(&mut self) -> Result<(), ClientError> {
        let bid = self.bid.clone().ok_or(ClientError::NoSession)?;
        let request = Request::Evict { bid: Some(bid) };
        match self.call(Vec::new(), &request).await? {
            (_, Response::Gone { .. }) => {
                self.bid = None;
                self.certs.clear();
                Ok(())
            }
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    pub async fn add_key(&mut self, parts: Vec<Bytes>, password: Option<&str>) -> Result<(), ClientError> {
        let request = Request::AddKey {
            bid: self.bid.clone(),
            password: password.map(str::to_owned),
        };
        self.expect_done(parts, request).await
    }

    pub async fn add_cert(&mut self, parts: Vec<Bytes>) -> Result<(), ClientError> {
        let request = Request::AddCert {
            bid: self.bid.clone(),
        };
        self.expect_done(parts, request).await
    }

    /// Run `steps` over `content`
    pub async fn pipe(&mut self, content: Bytes, steps: Vec<PipeStep>, headers: Option<Headers>) -> Result<Bytes, ClientError> {
        let request = Request::Pipe {
            bid: self.bid.clone(),
            pipe: steps,
            opts: headers.map(opts_from_headers).unwrap_or_default(),
        };
        match self.call(vec![content], &request).await? {
            (mut output, Response::Rpipe) if !output.is_empty() => Ok(output.swap_remove(0)),
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    /// Verify/decrypt `content`; `detached` carries the content of a
    /// detached signature
    pub async fn unwrap(&mut self, content: Bytes, detached: Option<Bytes>, opts: Value) -> Result<RemoteUnwrapped, ClientError> {
        let request = Request::Unwrap {
            bid: self.bid.clone(),
            opts,
        };
        let parts = std::iter::once(content).chain(detached).collect();
        match self.call(parts, &request).await? {
            (output, Response::Meta { meta }) => Ok(RemoteUnwrapped {
                content: output.into_iter().next().unwrap_or_default(),
                meta,
            }),
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    pub async fn find_certs_cmp(&mut self, urls: Vec<String>) -> Result<u64, ClientError> {
        let request = Request::Cmp {
            bid: self.bid.clone(),
            urls,
        };
        match self.call(Vec::new(), &request).await? {
            (_, Response::Rcmp { number }) => Ok(number),
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    /// Open a password-protected key container without creating a session
    pub async fn unprotect(&mut self, container: Bytes, password: Option<&str>) -> Result<Vec<ClearKey>, ClientError> {
        let request = Request::Unprotect {
            password: password.map(str::to_owned),
        };
        match self.call(vec![container], &request).await? {
            (_, Response::Clear { keys }) => Ok(keys),
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    async fn expect_done(&mut self, parts: Vec<Bytes>, request: Request) -> Result<(), ClientError> {
        match self.call(parts, &request).await? {
            (_, Response::Done { .. }) => Ok(()),
            (_, other) => Err(unexpected(&request, &other)),
        }
    }

    /// Send `parts` and `request`, then read up to the terminal response.
    ///
    /// BINARY frames before it are returned alongside; `CERTS` is recorded
    /// and reading continues.
    async fn call(&mut self, parts: Vec<Bytes>, request: &Request) -> Result<(Vec<Bytes>, Response), ClientError> {
        trace!(op = request.op(), parts = parts.len(), "Sending request");
        for part in parts {
            self.framed.feed(Frame::binary(part)).await?;
        }
        self.framed.send(Frame::structured(request)?).await?;

        let mut output = Vec::new();
        loop {
            let frame = self.framed.next().await.ok_or(ClientError::Closed)??;
            if frame.is_binary() {
                output.push(frame.into_payload());
                continue;
            }
            match frame.parse::<Response>()? {
                Response::Certs { certs } => self.certs = certs,
                Response::Error { code, bid } => return Err(ClientError::Remote { code, bid }),
                response => return Ok((output, response)),
            }
        }
    }
}

fn unexpected(request: &Request, response: &Response) -> ClientError {
    ClientError::Unexpected {
        op: request.op(),
        reply: format!("{response:?}"),
    }
}
