use thiserror::Error;

/// Failure taxonomy for a signing run.
///
/// Every variant is fatal to the current run. Nothing is retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignError {
    /// Malformed key material, missing fields, or a rejected credential.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The isolated context failed to start or to accept the credential bundle.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// Encrypting or encoding the credential bundle failed.
    #[error("credential packaging error: {0}")]
    CredentialPackaging(String),

    /// A call to the remote API was rejected or lost in transport.
    #[error("remote request error: {0}")]
    RemoteRequest(String),
}

pub type Result<T, E = SignError> = std::result::Result<T, E>;

impl SignError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SignError::Configuration(msg.into())
    }

    pub fn provisioning(msg: impl Into<String>) -> Self {
        SignError::Provisioning(msg.into())
    }

    pub fn packaging(msg: impl Into<String>) -> Self {
        SignError::CredentialPackaging(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        SignError::RemoteRequest(msg.into())
    }
}
