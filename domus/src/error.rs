use thiserror::Error;

use crate::DomainId;

/// Conditions a caller can recover from.
///
/// Broken invariants (a surviving root object on destroy, a foreign object
/// joining a domain, re-entering a held domain) are not represented here: they
/// indicate a defect in the surrounding runtime and panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("domain id space exhausted ({pages} pages in use)")]
    IdSpaceExhausted { pages: usize },

    #[error("unknown or stale domain id {0}")]
    UnknownId(DomainId),

    #[error("the default domain lives until the registry shuts down")]
    PermanentDomain,

    #[error("the registry has been shut down")]
    ShutDown,

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
}

pub type Result<T, E = DomainError> = std::result::Result<T, E>;
