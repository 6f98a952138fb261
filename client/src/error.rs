use sigbox_protocol::{ErrorCode, FrameError};
use sigbox_transport::{CodecError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Agent replied {code}")]
    Remote {
        code: ErrorCode,
        bid: Option<String>,
    },

    #[error("Connection closed before the reply")]
    Closed,

    #[error("Unexpected reply to {op}: {reply}")]
    Unexpected { op: &'static str, reply: String },

    #[error("No session: call init() first")]
    NoSession,
}

impl ClientError {
    /// The agent's error code, if the agent refused the call
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
