//! Centralized encrypted-data-storage error types.

use thiserror::Error;

/// Service exception kinds a catalog binding can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Catalog,
    Internal,
    Authorization,
    NotExists,
    InvalidArgument,
    Exists,
    /// The request never reached the service (connection, timeout, ...).
    Transport,
    /// The service answered with something the binding could not map.
    Protocol,
}

impl FaultKind {
    /// Exception name as the service reports it.
    pub fn exception_name(&self) -> &'static str {
        match self {
            FaultKind::Catalog => "CatalogException",
            FaultKind::Internal => "InternalException",
            FaultKind::Authorization => "AuthorizationException",
            FaultKind::NotExists => "NotExistsException",
            FaultKind::InvalidArgument => "InvalidArgumentException",
            FaultKind::Exists => "ExistsException",
            FaultKind::Transport => "TransportError",
            FaultKind::Protocol => "ProtocolError",
        }
    }
}

#[derive(Error, Debug)]
pub enum EdsError {
    /// The catalog service type could not be resolved to endpoints.
    #[error("Discovery error: {0}")]
    Discovery(String),
    /// A single catalog endpoint rejected or failed a request.
    #[error("Catalog error at {endpoint} ({kind:?}): {message}")]
    Catalog {
        endpoint: String,
        kind: FaultKind,
        message: String,
    },
    /// Threshold violated or shares malformed.
    #[error("Sharing error: {0}")]
    Sharing(String),
    /// Fewer than the required number of shares could be gathered.
    #[error("Insufficient shares: {detail}{}", .cause.as_ref().map(|c| format!(" (first failure: {c})")).unwrap_or_default())]
    InsufficientShares {
        detail: String,
        #[source]
        cause: Option<Box<EdsError>>,
    },
    /// Shares disagree on their metadata.
    #[error("Corruption detected: {0}")]
    Corruption(String),
    #[error("Cipher init error: {0}")]
    CipherInit(String),
    #[error("Cipher I/O error: {0}")]
    CipherIo(String),
    #[error("Codec error: {0}")]
    Codec(String),
    /// Allocation or storage-medium failure.
    #[error("Resource error: {0}")]
    Resource(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Some endpoints still hold an entry after a best-effort delete.
    #[error("Unregister incomplete: {failed} of {total} endpoints failed, first: {first}")]
    UnregisterIncomplete {
        failed: usize,
        total: usize,
        first: Box<EdsError>,
    },
}

impl EdsError {
    /// Endpoint the error is scoped to, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            EdsError::Catalog { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_not_exists(&self) -> bool {
        matches!(self, EdsError::Catalog { kind: FaultKind::NotExists, .. })
    }
}

pub type Result<T> = std::result::Result<T, EdsError>;
