//! Control messages carried in STRUCTURED frames
//!
//! Binary arguments of a request travel as BINARY frames sent right before
//! the request itself; binary results travel as BINARY frames right before the
//! terminal response.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Transport headers handed to the pipeline (e.g. `FILENAME`, `EDRPOU`)
pub type Headers = BTreeMap<String, String>;

/// Client → agent control operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Create a new session
    Init,

    /// Destroy a session
    Evict {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },

    /// Load key material (queued BINARY parts) protected by `password`
    AddKey {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Load certificates (queued BINARY parts)
    AddCert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },

    /// Enumerate loaded certificates
    Info {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },

    /// Run the sign/encrypt pipeline over the first queued BINARY part
    Pipe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
        #[serde(default)]
        pipe: Vec<PipeStep>,
        /// Transport headers, see `headers_from_opts`
        #[serde(default, skip_serializing_if = "Value::is_null")]
        opts: Value,
    },

    /// Verify/decrypt one or two queued BINARY parts
    Unwrap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        opts: Value,
    },

    /// Decrypt a password-protected key container with a throwaway box
    Unprotect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Fetch certificates from CMP endpoints
    Cmp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
        #[serde(default)]
        urls: Vec<String>,
    },
}

impl Request {
    /// Session id carried in the envelope, if any. An empty bid is none.
    pub fn bid(&self) -> Option<&str> {
        let bid = match self {
            Request::Init | Request::Unprotect { .. } => None,
            Request::Evict { bid }
            | Request::AddKey { bid, .. }
            | Request::AddCert { bid }
            | Request::Info { bid }
            | Request::Pipe { bid, .. }
            | Request::Unwrap { bid, .. }
            | Request::Cmp { bid, .. } => bid.as_deref(),
        };
        bid.filter(|b| !b.is_empty())
    }

    /// Error code for a known `op` whose arguments do not decode; `None`
    /// for an unknown op
    pub fn failure_code(op: &str) -> Option<ErrorCode> {
        let code = match op {
            "INIT" | "ADD_CERT" => ErrorCode::LoadCert,
            "EVICT" | "INFO" => ErrorCode::NotFound,
            "ADD_KEY" => ErrorCode::LoadKey,
            "PIPE" => ErrorCode::Pipe,
            "UNWRAP" => ErrorCode::Unwrap,
            "UNPROTECT" => ErrorCode::Unprotect,
            "CMP" => ErrorCode::Cmp,
            _ => return None,
        };
        Some(code)
    }

    /// Wire name of the operation
    pub fn op(&self) -> &'static str {
        match self {
            Request::Init => "INIT",
            Request::Evict { .. } => "EVICT",
            Request::AddKey { .. } => "ADD_KEY",
            Request::AddCert { .. } => "ADD_CERT",
            Request::Info { .. } => "INFO",
            Request::Pipe { .. } => "PIPE",
            Request::Unwrap { .. } => "UNWRAP",
            Request::Unprotect { .. } => "UNPROTECT",
            Request::Cmp { .. } => "CMP",
        }
    }
}

/// Agent → client response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    Created {
        bid: String,
    },
    Gone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },
    /// Certificate descriptions, as produced by the crypto box
    Certs {
        certs: Vec<Value>,
    },
    Ready,
    Rpipe,
    Meta {
        meta: Value,
    },
    Clear {
        keys: Vec<ClearKey>,
    },
    Rcmp {
        number: u64,
    },
    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bid: Option<String>,
    },
}

impl Response {
    pub fn error(code: ErrorCode) -> Self {
        Response::Error { code, bid: None }
    }

    pub fn not_found(bid: Option<&str>) -> Self {
        Response::Error {
            code: ErrorCode::NotFound,
            bid: bid.map(str::to_owned),
        }
    }
}

/// One step of a PIPE request.
///
/// Everything except `op` is passed to the crypto box untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeStep {
    pub op: StepOp,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl PipeStep {
    pub fn sign() -> Self {
        Self {
            op: StepOp::Sign,
            params: Map::new(),
        }
    }

    pub fn encrypt() -> Self {
        Self {
            op: StepOp::Encrypt,
            params: Map::new(),
        }
    }

    /// Add a parameter (`detached`, `tax`, `forCert`, ...)
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    pub fn flag(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOp {
    Sign,
    Encrypt,
    /// Any other step name; the crypto box decides what to do with it
    #[serde(other)]
    Unknown,
}

/// Transport headers out of a PIPE `opts` value.
///
/// Strings are taken as they are, other scalars in their JSON text form.
/// Nested values, nulls and a non-object `opts` contribute nothing.
pub fn headers_from_opts(opts: &Value) -> Headers {
    let Some(map) = opts.as_object() else {
        return Headers::new();
    };
    map.iter()
        .filter_map(|(name, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Bool(_) | Value::Number(_) => value.to_string(),
                _ => return None,
            };
            Some((name.clone(), text))
        })
        .collect()
}

/// `opts` value carrying `headers`
pub fn opts_from_headers(headers: Headers) -> Value {
    Value::Object(
        headers
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect(),
    )
}

/// Private key exported by UNPROTECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearKey {
    pub id: String,
    pub pem: String,
}

/// Error codes of `ERROR` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or expired session id
    #[serde(rename = "ENOENT")]
    NotFound,
    /// Semantically invalid operation; the connection is closed after it
    #[serde(rename = "EPROTO")]
    Protocol,
    #[serde(rename = "ELOADKEY")]
    LoadKey,
    #[serde(rename = "ELOADCERT")]
    LoadCert,
    #[serde(rename = "EPIPE")]
    Pipe,
    #[serde(rename = "EUNWRAP")]
    Unwrap,
    #[serde(rename = "EUNPROTECT")]
    Unprotect,
    #[serde(rename = "ECMP")]
    Cmp,
    /// Proxy could not obtain or keep a backend
    #[serde(rename = "EBUSY")]
    Busy,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::Protocol => "EPROTO",
            ErrorCode::LoadKey => "ELOADKEY",
            ErrorCode::LoadCert => "ELOADCERT",
            ErrorCode::Pipe => "EPIPE",
            ErrorCode::Unwrap => "EUNWRAP",
            ErrorCode::Unprotect => "EUNPROTECT",
            ErrorCode::Cmp => "ECMP",
            ErrorCode::Busy => "EBUSY",
        }
    }

    /// Whether the peer closes the connection after sending this code
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::Protocol | ErrorCode::Busy)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal view of any control frame, used for routing.
///
/// Unlike `Request`/`Response` this never rejects an unknown `op`, so a
/// relay can forward messages it does not understand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub op: String,
    /// Only a string bid is routable; anything else reads as none
    #[serde(default, deserialize_with = "string_or_none")]
    pub bid: Option<String>,
}

fn string_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(bid) => Some(bid),
        _ => None,
    })
}
