//! Boundary to the item-store daemon.
//!
//! The daemon owns storage and indexing. This crate only hands it normalized
//! attribute maps and receives raw records back, so the boundary is a single
//! synchronous [`DaemonClient::call`].
//!
//! # Record contract
//!
//! A raw record is a [`Value::Map`] holding the item's `class`, its item
//! attributes (when `r_Attributes` was requested), the stored value under
//! `v_Data` (when `r_Data` was requested) and the persistent reference under
//! `v_PersistentRef` (when `r_PersistentRef` was requested). Queries whose
//! match limit is above one return a [`Value::Array`] of records. Requests
//! with no return flags reply `None`.

use crate::error::Result;
use crate::value::{AttributeMap, Value};
use std::fmt;

/// RPC verbs understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Insert one item.
    AddItem,
    /// Look up items.
    CopyMatching,
    /// Change matching items.
    UpdateItem,
    /// Remove matching items.
    DeleteItem,
    /// Remove every item of the caller.
    DeleteAll,
    /// Remove every item in the given access groups.
    DeleteItemsForGroups,
    /// Replace the stored items of one token.
    UpdateTokenItems,
    /// Rotate the item-store class keys.
    RollKeys,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddItem => write!(f, "add-item"),
            Self::CopyMatching => write!(f, "copy-matching"),
            Self::UpdateItem => write!(f, "update-item"),
            Self::DeleteItem => write!(f, "delete-item"),
            Self::DeleteAll => write!(f, "delete-all"),
            Self::DeleteItemsForGroups => write!(f, "delete-items-for-groups"),
            Self::UpdateTokenItems => write!(f, "update-token-items"),
            Self::RollKeys => write!(f, "roll-keys"),
        }
    }
}

/// A daemon request. `auth` carries the portable auth parameters
/// (credential reference, UI mode, prompt text), never a live context.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// Insert the item described by `attributes`.
    Add {
        /// Normalized item attributes plus return flags.
        attributes: &'a AttributeMap,
        /// Auth parameters.
        auth: &'a AttributeMap,
    },
    /// Look up items matching `query`.
    CopyMatching {
        /// Normalized query.
        query: &'a AttributeMap,
        /// Auth parameters.
        auth: &'a AttributeMap,
    },
    /// Apply `attributes` to every item matching `query`.
    Update {
        /// Normalized query.
        query: &'a AttributeMap,
        /// Normalized attributes to apply.
        attributes: &'a AttributeMap,
        /// Auth parameters.
        auth: &'a AttributeMap,
    },
    /// Remove every item matching `query`.
    Delete {
        /// Normalized query.
        query: &'a AttributeMap,
        /// Auth parameters.
        auth: &'a AttributeMap,
    },
    /// Remove every item.
    DeleteAll,
    /// Remove every item in `groups`.
    DeleteItemsForGroups {
        /// Access groups to purge.
        groups: &'a [String],
    },
    /// Replace the stored items of `token_id` with `items`.
    UpdateTokenItems {
        /// Token whose items are replaced.
        token_id: &'a str,
        /// Normalized item attribute maps.
        items: &'a [AttributeMap],
    },
    /// Rotate class keys.
    RollKeys {
        /// Roll even if a roll is not due.
        force: bool,
    },
}

impl Request<'_> {
    /// The verb this request is sent under.
    #[must_use]
    pub const fn verb(&self) -> Verb {
        match self {
            Self::Add { .. } => Verb::AddItem,
            Self::CopyMatching { .. } => Verb::CopyMatching,
            Self::Update { .. } => Verb::UpdateItem,
            Self::Delete { .. } => Verb::DeleteItem,
            Self::DeleteAll => Verb::DeleteAll,
            Self::DeleteItemsForGroups { .. } => Verb::DeleteItemsForGroups,
            Self::UpdateTokenItems { .. } => Verb::UpdateTokenItems,
            Self::RollKeys { .. } => Verb::RollKeys,
        }
    }
}

/// Synchronous client for the item-store daemon.
///
/// Failures that need user authorization must be reported as
/// [`crate::Error::AuthorizationNeeded`] carrying the pending acl pairs.
pub trait DaemonClient: Send + Sync {
    /// Perform one request.
    ///
    /// # Errors
    ///
    /// Returns the daemon's failure, in whatever domain it originated.
    fn call(&self, request: Request<'_>) -> Result<Option<Value>>;
}
