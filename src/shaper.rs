//! Shaping raw daemon records into the form the caller asked for.
//!
//! The caller selects any combination of four return kinds. A single kind of
//! data or persistent reference comes back bare; every other combination
//! comes back as a map holding exactly the requested kinds. Token-backed
//! records are resolved here: their composite value is unpacked and the
//! secret is read from the token only when the caller needs it.

use crate::access_control::AccessControl;
use crate::error::{Error, Result};
use crate::handle::{ObjectHandle, TokenBinding};
use crate::item_class::ItemClass;
use crate::token::{CompositeTokenValue, TokenCache};
use crate::value::{attr, AttributeMap, Value};
use bitflags::bitflags;

bitflags! {
    /// Requested return kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResultShape: u8 {
        /// The item's value.
        const DATA = 1 << 0;
        /// A live object handle.
        const REFERENCE = 1 << 1;
        /// The item's attributes.
        const ATTRIBUTES = 1 << 2;
        /// A persistent reference.
        const PERSISTENT_REF = 1 << 3;
    }
}

impl ResultShape {
    const FLAG_KEYS: [(Self, &'static str); 4] = [
        (Self::DATA, attr::RETURN_DATA),
        (Self::REFERENCE, attr::RETURN_REF),
        (Self::ATTRIBUTES, attr::RETURN_ATTRIBUTES),
        (Self::PERSISTENT_REF, attr::RETURN_PERSISTENT_REF),
    ];

    /// Read the `r_*` flags of a query.
    #[must_use]
    pub fn from_query(query: &AttributeMap) -> Self {
        Self::FLAG_KEYS
            .iter()
            .filter(|(_, key)| query.flag(key))
            .fold(Self::empty(), |acc, (flag, _)| acc | *flag)
    }

    /// Replace the `r_*` flags of `map` with this shape.
    pub fn write_to(self, map: &mut AttributeMap) {
        for (flag, key) in Self::FLAG_KEYS {
            if self.contains(flag) {
                map.insert(key, true);
            } else {
                map.remove(key);
            }
        }
    }

    /// What to request from the daemon so records can be shaped into `self`.
    ///
    /// Records always come back as maps, and handles are built from data.
    #[must_use]
    pub fn daemon_request(self) -> Self {
        if self.is_empty() {
            return self;
        }
        let mut wanted = self | Self::ATTRIBUTES;
        if self.contains(Self::REFERENCE) {
            wanted |= Self::DATA;
        }
        wanted.remove(Self::REFERENCE);
        wanted
    }
}

/// Shape a raw daemon reply, element by element for arrays.
///
/// # Errors
///
/// Returns a `Decode` error for malformed records, or authorization-needed
/// and token failures while reading token values.
pub fn shape(raw: Value, shape: ResultShape, tokens: &mut TokenCache<'_>) -> Result<Value> {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .map(|item| shape_record(item, shape, tokens))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        single => shape_record(single, shape, tokens),
    }
}

fn shape_record(raw: Value, shape: ResultShape, tokens: &mut TokenCache<'_>) -> Result<Value> {
    let record = match raw {
        Value::Map(map) => map,
        Value::Data(bytes) if shape == ResultShape::PERSISTENT_REF => {
            AttributeMap::new().with(attr::VALUE_PERSISTENT_REF, bytes)
        }
        Value::Data(bytes) => AttributeMap::new().with(attr::VALUE_DATA, bytes),
        _ => return Err(Error::decode("daemon record is neither a map nor data")),
    };

    let want_data = shape.contains(ResultShape::DATA);
    let want_ref = shape.contains(ResultShape::REFERENCE);
    let want_attrs = shape.contains(ResultShape::ATTRIBUTES);
    let want_pref = shape.contains(ResultShape::PERSISTENT_REF);
    let token_id = record.get_str(attr::TOKEN_ID).map(str::to_owned);

    let mut value = None;
    let mut token_access_control = None;
    let mut binding = None;
    if want_data || want_ref || (want_attrs && token_id.is_some()) {
        if let Some(raw_value) = record.get_data(attr::VALUE_DATA) {
            match &token_id {
                Some(token_id) => {
                    let composite = CompositeTokenValue::decode(raw_value)?;
                    token_access_control = composite.access_control.clone();
                    binding = Some(TokenBinding::new(token_id.as_str(), composite.object_id.clone()));
                    value = Some(tokens.resolve_value(token_id, composite)?);
                }
                None => value = Some(raw_value.to_vec()),
            }
        }
    }

    if shape == ResultShape::DATA {
        return value
            .map(Value::Data)
            .ok_or_else(|| Error::decode("record carries no value"));
    }
    if shape == ResultShape::PERSISTENT_REF {
        return record
            .get(attr::VALUE_PERSISTENT_REF)
            .cloned()
            .ok_or_else(|| Error::decode("record carries no persistent reference"));
    }

    let mut working = record.item_attributes();
    working.remove(attr::VALUE_DATA);
    working.remove(attr::VALUE_REF);
    working.remove(attr::VALUE_PERSISTENT_REF);
    if want_attrs || want_ref {
        resolve_identity_certificate(&mut working, tokens)?;
    }

    let mut output = AttributeMap::new();
    if want_attrs {
        output = working.clone();
        let access_control = token_access_control
            .as_deref()
            .or_else(|| record.get_data(attr::ACCESS_CONTROL));
        match access_control {
            Some(bytes) => {
                output.insert(attr::ACCESS_CONTROL, AccessControl::from_bytes(bytes)?);
            }
            None => {
                output.remove(attr::ACCESS_CONTROL);
            }
        }
    }
    if want_data {
        if let Some(value) = &value {
            output.insert(attr::VALUE_DATA, value.clone());
        }
    }
    if want_pref {
        if let Some(pref) = record.get(attr::VALUE_PERSISTENT_REF) {
            output.insert(attr::VALUE_PERSISTENT_REF, pref.clone());
        }
    }
    if want_ref {
        if let Some(value) = value {
            working.insert(attr::VALUE_DATA, value);
        }
        if let Some(handle) = ObjectHandle::from_attributes(&working, binding)? {
            output.insert(attr::VALUE_REF, handle);
        }
    }
    Ok(Value::Map(output))
}

/// Replace the packed certificate of a token-backed identity with its DER.
fn resolve_identity_certificate(working: &mut AttributeMap, tokens: &mut TokenCache<'_>) -> Result<()> {
    if working.class() != Some(ItemClass::Identity) {
        return Ok(());
    }
    let Some(cert_token) = working.get_str(attr::IDENTITY_CERTIFICATE_TOKEN_ID).map(str::to_owned) else {
        return Ok(());
    };
    let Some(packed) = working.get_data(attr::IDENTITY_CERTIFICATE_DATA) else {
        return Ok(());
    };
    let composite = CompositeTokenValue::decode(packed)?;
    let der = tokens.resolve_value(&cert_token, composite)?;
    working.insert(attr::IDENTITY_CERTIFICATE_DATA, der);
    Ok(())
}
