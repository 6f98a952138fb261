use sigbox_crypto::{ContainerError, KeyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoxError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Key container is protected and no password was given")]
    PasswordRequired,

    #[error("Key container: {0}")]
    Container(#[from] ContainerError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("No signing key loaded")]
    NoKey,

    #[error("No loaded key matches {0}")]
    UnknownKey(String),

    #[error("Signature not verified: {0}")]
    Verification(String),

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Operation not supported by this box: {0}")]
    Unsupported(&'static str),
}
