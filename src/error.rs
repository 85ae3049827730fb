use thiserror::Error;

/// Crate wide error type. Every failure the service can surface is one of
/// these variants; the RPC layer maps them onto twirp error codes, the
/// pipeline maps them onto error counters.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Request validation failure.
    #[error("invalid argument: {field}: {message}")]
    InvalidArgument { field: String, message: String },

    /// The (device, community) pair is already registered.
    #[error("device already registered within community")]
    AlreadyRegistered,

    /// Stream/token mismatch on delete, or a device that does not exist.
    /// Deliberately carries no detail so a caller cannot distinguish a
    /// missing stream from a bad token.
    #[error("not found")]
    NotFound,

    /// Transient backend failure (database connection, store ping).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Incoming MQTT payload could not be parsed. Never surfaced over RPC.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encryption primitive failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// The downstream datastore write failed.
    #[error("datastore write failed: {0}")]
    DatastoreFailed(String),

    /// Certificate cache lookup missed.
    #[error("certificate cache miss")]
    CacheMiss,

    /// Everything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EncodeError {
    pub fn invalid_argument(field: &str, message: &str) -> EncodeError {
        EncodeError::InvalidArgument {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn required_argument(field: &str) -> EncodeError {
        EncodeError::invalid_argument(field, "is required")
    }

    /// The twirp error code string for this error.
    pub fn twirp_code(&self) -> &'static str {
        match self {
            EncodeError::InvalidArgument { .. } => "invalid_argument",
            EncodeError::AlreadyRegistered => "already_exists",
            EncodeError::NotFound => "not_found",
            EncodeError::Unavailable(_) => "unavailable",
            EncodeError::MalformedPayload(_)
            | EncodeError::EncryptionFailed(_)
            | EncodeError::DatastoreFailed(_)
            | EncodeError::CacheMiss
            | EncodeError::Internal(_) => "internal",
        }
    }
}

impl From<diesel::result::Error> for EncodeError {
    fn from(err: diesel::result::Error) -> EncodeError {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::NotFound => EncodeError::NotFound,
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                EncodeError::AlreadyRegistered
            }
            other => EncodeError::Internal(other.to_string()),
        }
    }
}

impl From<diesel::ConnectionError> for EncodeError {
    fn from(err: diesel::ConnectionError) -> EncodeError {
        EncodeError::Unavailable(err.to_string())
    }
}

impl From<prometheus::Error> for EncodeError {
    fn from(err: prometheus::Error) -> EncodeError {
        EncodeError::Internal(err.to_string())
    }
}
