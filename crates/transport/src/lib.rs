//! sigbox Transport - stream endpoints and the frame codec
//!
//! This crate provides:
//! - Unix socket and TCP endpoints behind one `Connection` type
//! - The frame codec (with optional chained-MAC authentication)
//! - The backend pool used by the proxy (round-robin, bounded retries)

mod endpoint;
mod frame_codec;
mod pool;

pub use endpoint::*;
pub use frame_codec::*;
pub use pool::*;

use tokio_util::codec::Framed;

/// A connection driven frame by frame
pub type FramedConnection = Framed<Connection, FrameCodec>;
