use thiserror::Error;

/// Domain failures for broker operations. The `Display` strings are the
/// exact legacy wire messages — the presentation layer shows them verbatim,
/// so controllers mostly pass them through untouched.
#[derive(Debug, Error, PartialEq)]
pub enum BrokerError {
    #[error("User not found.")]
    UnknownAccount,

    #[error("Request not found.")]
    UnknownRequest,

    #[error("Invalid request index.")]
    InvalidIndex,

    #[error("User is not a driver.")]
    NotDriver,

    #[error("Invalid day provided.")]
    InvalidDay,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BrokerError::InvalidInput(msg.into())
    }
}
