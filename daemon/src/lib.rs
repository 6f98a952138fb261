//! sigbox daemon
//!
//! The agent holds CryptoBox sessions and answers the control protocol;
//! the proxy spreads clients over a pool of agents while keeping each
//! session on the agent that created it.

pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod trust;

pub use config::DaemonConfig;
pub use dispatcher::{Dispatcher, Reply};
pub use proxy::{ProxyServer, ProxyState};
pub use registry::{RegistryError, SessionRegistry, SharedBox};
pub use server::AgentServer;
pub use trust::{TrustCache, TrustError};
