//! Error types and the unified status space.
//!
//! Every failure this crate can observe, whatever layer produced it, is an
//! [`Error`]. Low-level failures keep their origin ([`ErrorDomain`] plus the
//! domain's own code) until a caller asks for [`Error::status`], which is the
//! single translation point into the OSStatus-style [`Status`] space.
//!
//! # Claims
//! - All errors implement `std::error::Error`
//! - Every domain code translates to exactly one status
//! - Unknown domains translate to [`Status::Internal`] and are logged
//! - Authorization-needed and retry-limit conditions stay distinguishable

use crate::access_control::AclPair;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Primary error type for item operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A failure already expressed in the unified status space.
    #[error("{status}: {message}")]
    Status {
        /// Unified status code.
        status: Status,
        /// Human-readable context.
        message: String,
    },

    /// A failure reported by one of the lower layers, in its own code space.
    #[error("{domain} error (code {code}): {message}")]
    Domain {
        /// Where the failure came from.
        domain: ErrorDomain,
        /// The domain-specific code.
        code: i64,
        /// Human-readable context.
        message: String,
    },

    /// The operation needs the listed access controls evaluated first.
    ///
    /// Consumed by the authentication retry engine; callers only see it when
    /// no retry engine wraps the failing call.
    #[error("authorization needed for {} access control(s)", acl_pairs.len())]
    AuthorizationNeeded {
        /// The (access control, operation) pairs awaiting evaluation.
        acl_pairs: Vec<AclPair>,
    },

    /// The authentication loop hit its iteration ceiling.
    ///
    /// This is never a user-correctable failure: it points at a policy that
    /// cannot be satisfied or a provider that never binds.
    #[error("authorization still needed after {attempts} attempts ({} pending pair(s))", acl_pairs.len())]
    RetryLimitExceeded {
        /// Number of times the wrapped operation ran.
        attempts: u32,
        /// The pairs still pending on the final attempt.
        acl_pairs: Vec<AclPair>,
    },
}

/// Result type alias for item operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Origin of a low-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// The item database behind the daemon.
    Storage,
    /// Kernel and key-store (`kern_return_t`) failures.
    Kernel,
    /// The RPC channel to the daemon.
    Transport,
    /// Encoding and decoding of values.
    Serialization,
    /// Distributed device messaging.
    Messaging,
    /// The local authentication provider.
    LocalAuthentication,
    /// The hardware token provider.
    Token,
    /// Any domain this crate does not recognise.
    Other(String),
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Kernel => write!(f, "kernel"),
            Self::Transport => write!(f, "transport"),
            Self::Serialization => write!(f, "serialization"),
            Self::Messaging => write!(f, "messaging"),
            Self::LocalAuthentication => write!(f, "local authentication"),
            Self::Token => write!(f, "token"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Domain-specific codes understood by [`Error::status`].
pub mod codes {
    /// Item database result codes.
    pub mod storage {
        /// Access permission denied.
        pub const PERM: i64 = 3;
        /// Allocation failed.
        pub const NOMEM: i64 = 7;
        /// Row not found.
        pub const NOTFOUND: i64 = 12;
        /// Uniqueness constraint violated.
        pub const CONSTRAINT: i64 = 19;
        /// Authorization denied.
        pub const AUTH: i64 = 23;
    }

    /// `kern_return_t` values surfaced by the key store.
    pub mod kernel {
        /// `kIOReturnBadArgument`.
        pub const BAD_ARGUMENT: i64 = 0xe000_02c2;
        /// `kIOReturnNotReadable`.
        pub const NOT_READABLE: i64 = 0xe000_02c3;
        /// `kIOReturnNotWritable`.
        pub const NOT_WRITABLE: i64 = 0xe000_02c4;
        /// `kIOReturnNotPermitted`.
        pub const NOT_PERMITTED: i64 = 0xe000_02e2;
    }

    /// RPC transport failures.
    pub mod transport {
        /// A reply field had the wrong type.
        pub const TYPE_MISMATCH: i64 = 1;
        /// A required reply field was missing.
        pub const NULL_VALUE: i64 = 2;
        /// The connection to the daemon was lost or refused.
        pub const CONNECTION_FAILED: i64 = 3;
    }

    /// Serialization failures.
    pub mod serialization {
        /// The bytes are not in a supported encoding.
        pub const UNSUPPORTED_ENCODING: i64 = 1;
        /// The decoded type is not supported.
        pub const UNSUPPORTED_TYPE: i64 = 2;
        /// The object cannot be serialized at all.
        pub const UNSUPPORTED_OBJECT: i64 = 3;
        /// Allocation failed while encoding.
        pub const ALLOCATION_FAILED: i64 = 4;
    }

    /// Distributed messaging failures.
    pub mod messaging {
        /// This device has no identifier yet.
        pub const NO_DEVICE_ID: i64 = 1;
        /// The messaging service is not registered.
        pub const NOT_REGISTERED: i64 = 2;
        /// A message could not be sent.
        pub const FAILED_TO_SEND: i64 = 3;
        /// No auth token matched the peer.
        pub const NO_MATCHING_AUTH_TOKEN: i64 = 4;
        /// No peers are reachable.
        pub const NO_PEERS: i64 = 5;
    }

    /// Local authentication failures.
    pub mod local_auth {
        /// Authentication did not succeed.
        pub const AUTHENTICATION_FAILED: i64 = -1;
        /// The user cancelled the prompt.
        pub const USER_CANCEL: i64 = -2;
        /// A parameter was rejected.
        pub const BAD_PARAMETER: i64 = -3;
        /// A prompt was required but UI is not allowed.
        pub const NOT_INTERACTIVE: i64 = -4;
    }

    /// Token provider failures.
    pub mod token {
        /// A parameter was rejected.
        pub const BAD_PARAMETER: i64 = -1;
        /// The token does not implement the operation.
        pub const NOT_IMPLEMENTED: i64 = -2;
        /// The user cancelled a token prompt.
        pub const USER_CANCEL: i64 = -3;
        /// Token data failed validation.
        pub const CORRUPTED_DATA: i64 = -4;
        /// The token requires authentication first.
        pub const AUTHENTICATION_FAILED: i64 = -5;
        /// The requested object does not exist on the token.
        pub const OBJECT_NOT_FOUND: i64 = -6;
    }
}

/// Unified status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// No error.
    Success = 0,
    /// Function or operation not implemented.
    Unimplemented = -4,
    /// Write permission error.
    WritePermission = -61,
    /// One or more parameters are invalid.
    Param = -50,
    /// Failed to allocate memory.
    Allocate = -108,
    /// The user cancelled the operation.
    UserCanceled = -128,
    /// No keychain is available.
    NotAvailable = -25291,
    /// Authentication failed.
    AuthFailed = -25293,
    /// The specified item already exists.
    DuplicateItem = -25299,
    /// The specified item could not be found.
    ItemNotFound = -25300,
    /// The object reference cannot be used here.
    UnsupportedReference = -25304,
    /// User interaction is required but not allowed.
    InteractionNotAllowed = -25308,
    /// This device needs an identifier first.
    DeviceIdNeeded = -25331,
    /// Device messaging is not registered.
    NotRegistered = -25332,
    /// A device message failed to send.
    FailedToSend = -25333,
    /// No device matched the auth token.
    DeviceIdNoMatch = -25334,
    /// No peers are available.
    PeersNotAvailable = -25336,
    /// Data could not be decoded.
    Decode = -26275,
    /// Internal error.
    Internal = -26276,
}

impl Status {
    const ALL: [Self; 19] = [
        Self::Success,
        Self::Unimplemented,
        Self::WritePermission,
        Self::Param,
        Self::Allocate,
        Self::UserCanceled,
        Self::NotAvailable,
        Self::AuthFailed,
        Self::DuplicateItem,
        Self::ItemNotFound,
        Self::UnsupportedReference,
        Self::InteractionNotAllowed,
        Self::DeviceIdNeeded,
        Self::NotRegistered,
        Self::FailedToSend,
        Self::DeviceIdNoMatch,
        Self::PeersNotAvailable,
        Self::Decode,
        Self::Internal,
    ];

    /// Create from a raw status code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// The raw status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "no error",
            Self::Unimplemented => "not implemented",
            Self::WritePermission => "write permission denied",
            Self::Param => "invalid parameter",
            Self::Allocate => "allocation failed",
            Self::UserCanceled => "cancelled by user",
            Self::NotAvailable => "item store not available",
            Self::AuthFailed => "authentication failed",
            Self::DuplicateItem => "duplicate item",
            Self::ItemNotFound => "item not found",
            Self::UnsupportedReference => "unsupported object reference",
            Self::InteractionNotAllowed => "interaction not allowed",
            Self::DeviceIdNeeded => "device id needed",
            Self::NotRegistered => "messaging not registered",
            Self::FailedToSend => "failed to send message",
            Self::DeviceIdNoMatch => "no device matches auth token",
            Self::PeersNotAvailable => "no peers available",
            Self::Decode => "decode error",
            Self::Internal => "internal error",
        };
        write!(f, "{text} ({})", self.code())
    }
}

impl Error {
    /// Create an error already in the unified status space.
    #[must_use]
    pub fn status_error(status: Status, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create a low-level error carrying its origin.
    #[must_use]
    pub fn domain(domain: ErrorDomain, code: i64, message: impl Into<String>) -> Self {
        Self::Domain {
            domain,
            code,
            message: message.into(),
        }
    }

    /// Create a `Param` error.
    #[must_use]
    pub fn param(message: impl Into<String>) -> Self {
        Self::status_error(Status::Param, message)
    }

    /// Create an `ItemNotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status_error(Status::ItemNotFound, message)
    }

    /// Create a `DuplicateItem` error.
    #[must_use]
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::status_error(Status::DuplicateItem, message)
    }

    /// Create a `Decode` error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::status_error(Status::Decode, message)
    }

    /// Create an `UnsupportedReference` error.
    #[must_use]
    pub fn unsupported_reference(message: impl Into<String>) -> Self {
        Self::status_error(Status::UnsupportedReference, message)
    }

    /// Create an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::status_error(Status::Internal, message)
    }

    /// Create an authorization-needed rejection.
    #[must_use]
    pub const fn authorization_needed(acl_pairs: Vec<AclPair>) -> Self {
        Self::AuthorizationNeeded { acl_pairs }
    }

    /// Check if this is an authorization-needed rejection.
    #[must_use]
    pub const fn is_authorization_needed(&self) -> bool {
        matches!(self, Self::AuthorizationNeeded { .. })
    }

    /// Check if this is the retry-limit condition.
    #[must_use]
    pub const fn is_retry_limit_exceeded(&self) -> bool {
        matches!(self, Self::RetryLimitExceeded { .. })
    }

    /// Check if this error translates to `ItemNotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Status::ItemNotFound
    }

    /// Check if this error translates to `DuplicateItem`.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.status() == Status::DuplicateItem
    }

    /// Translate into the unified status space.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Status { status, .. } => *status,
            Self::Domain { domain, code, .. } => translate(domain, *code),
            Self::AuthorizationNeeded { .. } => Status::InteractionNotAllowed,
            Self::RetryLimitExceeded { .. } => Status::Internal,
        }
    }
}

fn translate(domain: &ErrorDomain, code: i64) -> Status {
    match domain {
        ErrorDomain::Storage => match code {
            codes::storage::CONSTRAINT => Status::DuplicateItem,
            codes::storage::NOTFOUND => Status::ItemNotFound,
            codes::storage::PERM | codes::storage::AUTH => Status::WritePermission,
            codes::storage::NOMEM => Status::Allocate,
            _ => Status::NotAvailable,
        },
        ErrorDomain::Kernel => match code {
            codes::kernel::NOT_READABLE | codes::kernel::NOT_WRITABLE => Status::AuthFailed,
            codes::kernel::NOT_PERMITTED => Status::InteractionNotAllowed,
            codes::kernel::BAD_ARGUMENT => Status::Param,
            _ => Status::NotAvailable,
        },
        ErrorDomain::Transport => match code {
            codes::transport::TYPE_MISMATCH | codes::transport::NULL_VALUE => Status::Param,
            codes::transport::CONNECTION_FAILED => Status::NotAvailable,
            _ => Status::Internal,
        },
        ErrorDomain::Serialization => match code {
            codes::serialization::UNSUPPORTED_ENCODING
            | codes::serialization::UNSUPPORTED_TYPE => Status::Decode,
            codes::serialization::UNSUPPORTED_OBJECT => Status::Param,
            codes::serialization::ALLOCATION_FAILED => Status::Allocate,
            _ => Status::Decode,
        },
        ErrorDomain::Messaging => match code {
            codes::messaging::NO_DEVICE_ID => Status::DeviceIdNeeded,
            codes::messaging::NOT_REGISTERED => Status::NotRegistered,
            codes::messaging::FAILED_TO_SEND => Status::FailedToSend,
            codes::messaging::NO_MATCHING_AUTH_TOKEN => Status::DeviceIdNoMatch,
            codes::messaging::NO_PEERS => Status::PeersNotAvailable,
            _ => Status::Internal,
        },
        ErrorDomain::LocalAuthentication => match code {
            codes::local_auth::USER_CANCEL => Status::UserCanceled,
            codes::local_auth::BAD_PARAMETER => Status::Param,
            codes::local_auth::NOT_INTERACTIVE => Status::InteractionNotAllowed,
            _ => Status::AuthFailed,
        },
        ErrorDomain::Token => match code {
            codes::token::BAD_PARAMETER => Status::Param,
            codes::token::NOT_IMPLEMENTED => Status::Unimplemented,
            codes::token::USER_CANCEL => Status::UserCanceled,
            codes::token::CORRUPTED_DATA => Status::Decode,
            codes::token::OBJECT_NOT_FOUND => Status::ItemNotFound,
            _ => Status::Internal,
        },
        ErrorDomain::Other(name) => {
            warn!(domain = %name, code, "unrecognised error domain, reporting internal error");
            Status::Internal
        }
    }
}

impl From<serde_cbor::Error> for Error {
    fn from(err: serde_cbor::Error) -> Self {
        let code = if err.is_syntax() || err.is_eof() {
            codes::serialization::UNSUPPORTED_ENCODING
        } else if err.is_data() {
            codes::serialization::UNSUPPORTED_TYPE
        } else {
            codes::serialization::UNSUPPORTED_OBJECT
        };
        Self::domain(ErrorDomain::Serialization, code, err.to_string())
    }
}

/// Caller-scoped "last detailed error" slot for status-code surfaces.
///
/// Each caller owns its slot and passes it to [`LastError::settle`] after
/// every call, which mirrors a thread-local last-error cache without any
/// ambient state.
#[derive(Debug, Default, Clone)]
pub struct LastError {
    error: Option<Error>,
}

impl LastError {
    /// Create an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self { error: None }
    }

    /// Reduce a result to a raw status code, recording the detailed error.
    ///
    /// Returns `0` and the value on success (clearing the slot), or the
    /// translated status code and `None` on failure.
    pub fn settle<T>(&mut self, result: Result<T>) -> (i32, Option<T>) {
        match result {
            Ok(value) => {
                self.error = None;
                (Status::Success.code(), Some(value))
            }
            Err(err) => {
                let status = err.status();
                self.error = Some(err);
                (status.code(), None)
            }
        }
    }

    /// The detailed error of the last failing call, if the last call failed.
    #[must_use]
    pub const fn get(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Take the recorded error, leaving the slot empty.
    pub fn take(&mut self) -> Option<Error> {
        self.error.take()
    }
}
