use thiserror::Error;

/// Reasons an identifier string cannot be resolved to an [`Address`](crate::Address).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("identifier has no domain: {0:?}")]
    MissingDomain(String),

    #[error("unknown domain {domain:?} in identifier {identifier:?}")]
    UnknownDomain { identifier: String, domain: String },

    #[error("identifier has an empty user part: {0:?}")]
    EmptyUser(String),

    #[error("invalid device {device:?} in identifier {identifier:?}")]
    InvalidDevice { identifier: String, device: String },

    #[error("invalid user {user:?} in identifier {identifier:?}")]
    InvalidUser { identifier: String, user: String },
}
