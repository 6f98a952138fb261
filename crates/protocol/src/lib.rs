//! sigbox Protocol - Frame definitions and control messages
//!
//! This crate defines the core data structures for the agent protocol:
//! - `Frame`: The self-delimiting unit of transmission (BINARY or STRUCTURED)
//! - `Header`: Wire header parsing and encoding
//! - `Request`/`Response`: The closed set of STRUCTURED control messages
//! - `ErrorCode`: Error codes carried by `ERROR` responses
//!
//! Authentication of the byte stream lives in `sigbox-crypto`, the
//! buffering codec in `sigbox-transport`.

mod frame;
mod message;
mod validation;

pub use frame::*;
pub use message::*;
pub use validation::*;
