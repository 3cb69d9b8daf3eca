//! Access control objects and the pairs surfaced when authorization is needed.
//!
//! An [`AccessControl`] lists, per operation, what the user must prove before
//! the operation may run. Once evaluated against a specific item it becomes
//! *bound* and can no longer be moved to another item.
//!
//! The serialized form is CBOR; it is what the daemon stores under the
//! `accc` attribute and what token items pack into their composite value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operation names carried in [`AclPair`]s.
pub mod operation {
    /// Binding an access control to a new item.
    pub const BIND: &str = "";
    /// Reading an item's secret value.
    pub const DECRYPT: &str = "decrypt";
    /// Encrypting with a key.
    pub const ENCRYPT: &str = "encrypt";
    /// Signing with a key.
    pub const SIGN: &str = "sign";
    /// Deleting an item.
    pub const DELETE: &str = "delete";
}

/// What must be proven before an operation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Requirement {
    /// The operation is allowed without additional authentication.
    #[default]
    None,
    /// Any form of user presence.
    UserPresence,
    /// Requires device passcode.
    DevicePasscode,
    /// Requires biometric authentication.
    Biometric,
    /// Requires biometric OR passcode.
    BiometricOrPasscode,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::UserPresence => write!(f, "User Presence"),
            Self::DevicePasscode => write!(f, "Device Passcode"),
            Self::Biometric => write!(f, "Biometric"),
            Self::BiometricOrPasscode => write!(f, "Biometric or Passcode"),
        }
    }
}

/// Constraints gating use of an item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessControl {
    protection: Option<String>,
    constraints: BTreeMap<String, Requirement>,
    bound: bool,
}

impl AccessControl {
    /// Create an unbound access control with no constraints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data protection class (e.g. `"ak"`).
    #[must_use]
    pub fn with_protection(mut self, protection: impl Into<String>) -> Self {
        self.protection = Some(protection.into());
        self
    }

    /// Require `requirement` before `operation` may run.
    #[must_use]
    pub fn with_constraint(mut self, operation: impl Into<String>, requirement: Requirement) -> Self {
        self.constraints.insert(operation.into(), requirement);
        self
    }

    /// The data protection class, if any.
    #[must_use]
    pub fn protection(&self) -> Option<&str> {
        self.protection.as_deref()
    }

    /// The requirement for `operation`, if one is recorded.
    #[must_use]
    pub fn constraint(&self, operation: &str) -> Option<Requirement> {
        self.constraints.get(operation).copied()
    }

    /// Iterate over (operation, requirement) pairs.
    pub fn constraints(&self) -> impl Iterator<Item = (&str, Requirement)> {
        self.constraints.iter().map(|(op, req)| (op.as_str(), *req))
    }

    /// Whether any operation needs more than [`Requirement::None`].
    #[must_use]
    pub fn requires_authentication(&self) -> bool {
        self.constraints.values().any(|req| *req != Requirement::None)
    }

    /// Whether `operation` needs authentication.
    #[must_use]
    pub fn requires_authentication_for(&self, operation: &str) -> bool {
        self.constraint(operation)
            .is_some_and(|req| req != Requirement::None)
    }

    /// Whether this access control is permanently tied to one item.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound
    }

    /// Return the bound form of this access control.
    #[must_use]
    pub fn into_bound(mut self) -> Self {
        self.bound = true;
        self
    }

    /// Serialize to the stored byte form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Parse the stored byte form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `bytes` is not a valid access control.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::decode("access control data is empty"));
        }
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

impl fmt::Display for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acl(")?;
        if let Some(protection) = &self.protection {
            write!(f, "prot={protection}; ")?;
        }
        for (i, (op, req)) in self.constraints.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{op:?}={req}")?;
        }
        write!(f, "{})", if self.bound { "; bound" } else { "" })
    }
}

/// An (access control, operation) pair awaiting evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPair {
    /// The access control to evaluate.
    pub access_control: AccessControl,
    /// What the caller was attempting.
    pub operation: String,
}

impl AclPair {
    /// Create a new pair.
    #[must_use]
    pub fn new(access_control: AccessControl, operation: impl Into<String>) -> Self {
        Self {
            access_control,
            operation: operation.into(),
        }
    }

    /// Whether this pair asks for the access control to be bound.
    #[must_use]
    pub fn is_bind_request(&self) -> bool {
        self.operation == operation::BIND
    }
}

impl fmt::Display for AclPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {:?}", self.access_control, self.operation)
    }
}
