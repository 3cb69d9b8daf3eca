//! Persistent references: a compact, stable handle to a stored item.
//!
//! Wire format, exactly 12 bytes:
//!
//! ```text
//! +---------+---------+-------------------------------+
//! | 0..4    | class tag (ASCII, e.g. "genp")          |
//! | 4..12   | row id, big-endian u64                  |
//! +---------+---------+-------------------------------+
//! ```

use crate::error::{Error, Result};
use crate::item_class::ItemClass;

/// Encoded length of a persistent reference.
pub const PERSISTENT_REF_LEN: usize = 12;

/// A decoded persistent reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentRef {
    /// Class of the referenced item.
    pub class: ItemClass,
    /// Row identifier inside that class.
    pub row_id: u64,
}

impl PersistentRef {
    /// Create a new reference.
    #[must_use]
    pub const fn new(class: ItemClass, row_id: u64) -> Self {
        Self { class, row_id }
    }

    /// Encode to the 12-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; PERSISTENT_REF_LEN] {
        let mut out = [0u8; PERSISTENT_REF_LEN];
        out[..4].copy_from_slice(self.class.tag());
        out[4..].copy_from_slice(&self.row_id.to_be_bytes());
        out
    }

    /// Decode from the wire form.
    ///
    /// # Errors
    ///
    /// Returns a `Param` error if `bytes` is not exactly 12 bytes or the class
    /// tag is not one of the six recognised classes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PERSISTENT_REF_LEN {
            return Err(Error::param(format!(
                "invalid persistent reference length: {} (expected {PERSISTENT_REF_LEN})",
                bytes.len()
            )));
        }
        let (tag, row) = bytes.split_at(4);
        let class = ItemClass::from_tag(tag).ok_or_else(|| {
            Error::param(format!(
                "unrecognised persistent reference class tag {:?}",
                String::from_utf8_lossy(tag)
            ))
        })?;
        let mut row_bytes = [0u8; 8];
        row_bytes.copy_from_slice(row);
        Ok(Self::new(class, u64::from_be_bytes(row_bytes)))
    }

    /// Return the same row under a different class tag.
    #[must_use]
    pub const fn with_class(self, class: ItemClass) -> Self {
        Self::new(class, self.row_id)
    }
}
