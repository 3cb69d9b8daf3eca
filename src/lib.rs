//! Secitem: Client-Side Keychain Item Management
//!
//! Secitem is the client half of a keychain: it turns caller-supplied
//! attribute maps into requests for an item-store daemon and turns the
//! daemon's raw records back into the shapes the caller asked for.
//!
//! # Design Philosophy
//!
//! - **Caller maps are never mutated**: every rewrite goes through a
//!   copy-on-write [`value::CowMap`]
//! - **One status space**: errors of every origin translate to one [`Status`]
//! - **Bounded authentication**: the retry loop gives up after
//!   [`auth::MAX_AUTH_ATTEMPTS`] rounds with a distinct error
//!
//! # Components
//!
//! | Concern | Module |
//! |---------|--------|
//! | Persistent references | [`persistent_ref`] |
//! | Attribute normalization | [`normalize`] |
//! | Identity splitting | [`identity`] |
//! | Token-backed items | [`token`] |
//! | Authentication retry | [`auth`] |
//! | Result shaping | [`shaper`] |
//! | Error translation | [`error`] |
//!
//! # Quick Start
//!
//! ```
//! use secitem::memory::{InMemoryAuthenticator, InMemoryDaemon};
//! use secitem::value::{attr, AttributeMap};
//! use secitem::{ItemClass, Keychain};
//! use std::sync::Arc;
//!
//! let keychain = Keychain::new(
//!     Arc::new(InMemoryDaemon::new()),
//!     Arc::new(InMemoryAuthenticator::new()),
//! );
//! let item = AttributeMap::new()
//!     .with(attr::CLASS, ItemClass::GenericPassword)
//!     .with(attr::SERVICE, "S")
//!     .with(attr::VALUE_DATA, b"secret".as_slice());
//! keychain.add(&item)?;
//! keychain.delete(&AttributeMap::new().with(attr::CLASS, ItemClass::GenericPassword))?;
//! # Ok::<(), secitem::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All operations that can fail return [`Result<T, Error>`]. Use
//! [`Error::status`] for the unified status code, or [`LastError`] for the
//! status-code-plus-slot calling convention.
//!
//! # Thread Safety
//!
//! [`Keychain`] is `Send + Sync`. The collaborators it drives
//! ([`daemon::DaemonClient`], [`token::TokenProvider`],
//! [`auth::Authenticator`]) own their concurrency control.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod access_control;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod der;
pub mod error;
pub mod handle;
pub mod identity;
pub mod item_class;
pub mod keychain;
pub mod memory;
pub mod normalize;
pub mod persistent_ref;
pub mod policy;
pub mod shaper;
pub mod token;
pub mod value;

// Re-export main types for convenience
pub use access_control::{AccessControl, AclPair, Requirement};
pub use auth::{shared_auth_context, AuthUi, Authenticator, PromptOptions};
pub use config::KeychainConfig;
pub use daemon::{DaemonClient, Request, Verb};
pub use error::{Error, ErrorDomain, LastError, Result, Status};
pub use handle::{CertificateHandle, IdentityHandle, KeyHandle, ObjectHandle};
pub use item_class::ItemClass;
pub use keychain::Keychain;
pub use persistent_ref::PersistentRef;
pub use policy::Policy;
pub use shaper::ResultShape;
pub use token::{CompositeTokenValue, Token, TokenProvider};
pub use value::{AttributeMap, Value};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_keychain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Keychain>();
    }

    #[test]
    fn test_error_reexport() {
        let err = Error::not_found("gone");
        assert!(err.is_not_found());
        assert_eq!(err.status(), Status::ItemNotFound);
    }

    #[test]
    fn test_item_class_reexport() {
        assert_eq!(ItemClass::Identity.to_string(), "identity");
    }
}
