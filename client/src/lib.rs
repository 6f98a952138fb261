//! sigbox client
//!
//! `RemoteBox` drives a CryptoBox living in an agent (directly or through
//! the proxy) over one framed connection.

mod error;
mod remote;

pub use error::ClientError;
pub use remote::{RemoteBox, RemoteUnwrapped};
