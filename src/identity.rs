//! Identity splitting.
//!
//! An identity is never stored as one record: it is a certificate item plus
//! a key item linked by the certificate's public key hash (`pkhh`) equalling
//! the key's application label (`klbl`). Operations addressed to an identity
//! are split into per-half operations here; the per-half work itself is
//! supplied by the caller as closures.

use crate::error::{Error, Result};
use crate::handle::{IdentityHandle, ObjectHandle};
use crate::item_class::ItemClass;
use crate::persistent_ref::PersistentRef;
use crate::shaper::ResultShape;
use crate::value::{attr, AttributeMap, Value};
use tracing::debug;

/// The identity handle under `v_Ref`, if any.
#[must_use]
pub fn identity_in(map: &AttributeMap) -> Option<&IdentityHandle> {
    map.get(attr::VALUE_REF)
        .and_then(Value::as_object)
        .and_then(ObjectHandle::as_identity)
}

fn half(map: &AttributeMap, class: ItemClass, handle: ObjectHandle) -> AttributeMap {
    let mut projected = map.clone();
    projected.insert(attr::CLASS, class);
    projected.insert(attr::VALUE_REF, handle);
    projected
}

/// `map` addressed to the certificate half of `identity`.
#[must_use]
pub fn certificate_half(map: &AttributeMap, identity: &IdentityHandle) -> AttributeMap {
    half(
        map,
        ItemClass::Certificate,
        ObjectHandle::Certificate(identity.certificate().clone()),
    )
}

/// `map` addressed to the key half of `identity`.
#[must_use]
pub fn key_half(map: &AttributeMap, identity: &IdentityHandle) -> AttributeMap {
    half(map, ItemClass::Key, ObjectHandle::Key(identity.key().clone()))
}

/// Rewrite a query by identity handle into a query of class `idnt` over the
/// certificate's attributes.
///
/// # Errors
///
/// Returns the failure of describing the certificate half.
pub fn identity_query(query: &AttributeMap, identity: &IdentityHandle) -> Result<AttributeMap> {
    let mut rewritten = query.clone();
    rewritten.remove(attr::VALUE_REF);
    let mut cert = ObjectHandle::Certificate(identity.certificate().clone()).to_attribute_map()?;
    cert.remove(attr::VALUE_DATA);
    rewritten.merge_under(cert);
    rewritten.insert(attr::CLASS, ItemClass::Identity);
    Ok(rewritten)
}

/// Add both halves of `identity`.
///
/// A duplicate certificate is tolerated; a duplicate key is then tolerated
/// too. The result comes from the certificate half, with persistent
/// references retagged as identity references.
///
/// # Errors
///
/// Returns the first non-duplicate failure of either half.
pub fn add_identity<F>(
    attributes: &AttributeMap,
    identity: &IdentityHandle,
    shape: ResultShape,
    mut add_one: F,
) -> Result<Option<Value>>
where
    F: FnMut(&AttributeMap) -> Result<Option<Value>>,
{
    let cert_result = match add_one(&certificate_half(attributes, identity)) {
        Ok(result) => Some(result),
        Err(err) if err.is_duplicate() => {
            debug!("identity certificate already stored");
            None
        }
        Err(err) => return Err(err),
    };
    let key_result = match add_one(&key_half(attributes, identity)) {
        Ok(result) => result,
        Err(err) if err.is_duplicate() && cert_result.is_none() => {
            debug!("identity key already stored");
            None
        }
        Err(err) => return Err(err),
    };

    let Some(result) = cert_result else {
        return Ok(key_result);
    };
    if shape.contains(ResultShape::PERSISTENT_REF) {
        return result.map(retag_as_identity).transpose();
    }
    Ok(result)
}

fn retag(bytes: &[u8]) -> Result<Value> {
    let pref = PersistentRef::decode(bytes)?.with_class(ItemClass::Identity);
    Ok(Value::Data(pref.encode().to_vec()))
}

fn retag_as_identity(result: Value) -> Result<Value> {
    match result {
        Value::Data(bytes) => retag(&bytes),
        Value::Map(mut map) => {
            if let Some(bytes) = map.get_data(attr::VALUE_PERSISTENT_REF) {
                let retagged = retag(bytes)?;
                map.insert(attr::VALUE_PERSISTENT_REF, retagged);
            }
            Ok(Value::Map(map))
        }
        other => Ok(other),
    }
}

/// Update both halves of `identity`.
///
/// # Errors
///
/// Returns the first failure.
pub fn update_identity<F>(query: &AttributeMap, identity: &IdentityHandle, mut update_one: F) -> Result<()>
where
    F: FnMut(&AttributeMap) -> Result<()>,
{
    update_one(&certificate_half(query, identity))?;
    update_one(&key_half(query, identity))
}

/// Delete the certificate of `identity`, then its key unless another stored
/// certificate still certifies that key.
///
/// `certified` reports whether a stored certificate has the given public key
/// hash.
///
/// # Errors
///
/// Returns the first failure.
pub fn delete_identity<F, C>(
    query: &AttributeMap,
    identity: &IdentityHandle,
    mut delete_one: F,
    mut certified: C,
) -> Result<()>
where
    F: FnMut(&AttributeMap) -> Result<()>,
    C: FnMut(&[u8]) -> Result<bool>,
{
    delete_one(&certificate_half(query, identity))?;
    if let Some(label) = identity.key().application_label() {
        if certified(label)? {
            debug!("identity key is still certified by another certificate, keeping it");
            return Ok(());
        }
    }
    delete_one(&key_half(query, identity))
}

/// Delete the identity stored under `pref`, which `query` carries: the
/// certificate on the same row, then the key it names unless another
/// certificate still certifies that key.
///
/// `key_label` returns the public key hash of the certificate matched by
/// the query it is given.
///
/// # Errors
///
/// Returns not-found when no certificate is stored under `pref`, otherwise
/// the first failure.
pub fn delete_identity_ref<F, L, C>(
    query: &AttributeMap,
    pref: PersistentRef,
    mut delete_one: F,
    mut key_label: L,
    mut certified: C,
) -> Result<()>
where
    F: FnMut(&AttributeMap) -> Result<()>,
    L: FnMut(&AttributeMap) -> Result<Option<Vec<u8>>>,
    C: FnMut(&[u8]) -> Result<bool>,
{
    let mut certificate = query.clone();
    certificate.insert(attr::CLASS, ItemClass::Certificate);
    certificate.insert(
        attr::VALUE_PERSISTENT_REF,
        pref.with_class(ItemClass::Certificate).encode().as_slice(),
    );
    let label = key_label(&certificate)?;
    delete_one(&certificate)?;
    let Some(label) = label else {
        debug!("identity certificate names no key");
        return Ok(());
    };
    if certified(&label)? {
        debug!("identity key is still certified by another certificate, keeping it");
        return Ok(());
    }
    let mut key = query.clone();
    key.remove(attr::VALUE_PERSISTENT_REF);
    key.insert(attr::CLASS, ItemClass::Key);
    key.insert(attr::APPLICATION_LABEL, label);
    delete_one(&key)
}

/// Delete by class `idnt` without a handle: delete matching certificates,
/// then matching keys.
///
/// # Errors
///
/// Returns not-found only when neither half matched anything, otherwise the
/// first other failure.
pub fn delete_identity_class<F>(query: &AttributeMap, mut delete_one: F) -> Result<()>
where
    F: FnMut(&AttributeMap) -> Result<()>,
{
    let mut certs = query.clone();
    certs.insert(attr::CLASS, ItemClass::Certificate);
    let mut keys = query.clone();
    keys.insert(attr::CLASS, ItemClass::Key);

    let outcomes = [delete_one(&certs), delete_one(&keys)];
    let mut found = false;
    for outcome in outcomes {
        match outcome {
            Ok(()) => found = true,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    if found {
        Ok(())
    } else {
        Err(Error::not_found("no identity matches the query"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handle::{CertificateHandle, KeyHandle};

    fn identity() -> IdentityHandle {
        IdentityHandle::new(
            CertificateHandle::new(
                vec![0x30, 0x00],
                AttributeMap::new()
                    .with(attr::PUBLIC_KEY_HASH, vec![7u8])
                    .with(attr::SERIAL_NUMBER, vec![1u8]),
            ),
            KeyHandle::new(AttributeMap::new().with(attr::APPLICATION_LABEL, vec![7u8])),
        )
    }

    fn pref(class: ItemClass) -> Value {
        Value::Data(PersistentRef::new(class, 3).encode().to_vec())
    }

    #[test]
    fn test_delete_by_ref_targets_certificate_row_then_key() {
        let mut deleted = Vec::new();
        delete_identity_ref(
            &AttributeMap::new()
                .with(attr::CLASS, ItemClass::Identity)
                .with(attr::VALUE_PERSISTENT_REF, pref(ItemClass::Identity)),
            PersistentRef::new(ItemClass::Identity, 3),
            |half| {
                deleted.push(half.clone());
                Ok(())
            },
            |cert| {
                assert_eq!(cert.get(attr::VALUE_PERSISTENT_REF), Some(&pref(ItemClass::Certificate)));
                Ok(Some(vec![7u8]))
            },
            |_| Ok(false),
        )
        .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].class(), Some(ItemClass::Certificate));
        assert_eq!(deleted[1].class(), Some(ItemClass::Key));
        assert_eq!(deleted[1].get_data(attr::APPLICATION_LABEL), Some([7u8].as_slice()));
        assert!(!deleted[1].contains_key(attr::VALUE_PERSISTENT_REF));
    }

    #[test]
    fn test_delete_by_ref_keeps_certified_key() {
        let mut deleted = 0;
        delete_identity_ref(
            &AttributeMap::new()
                .with(attr::CLASS, ItemClass::Identity)
                .with(attr::VALUE_PERSISTENT_REF, pref(ItemClass::Identity)),
            PersistentRef::new(ItemClass::Identity, 3),
            |_| {
                deleted += 1;
                Ok(())
            },
            |_| Ok(Some(vec![7u8])),
            |_| Ok(true),
        )
        .unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_identity_in() {
        let map = AttributeMap::new().with(attr::VALUE_REF, ObjectHandle::Identity(identity()));
        assert!(identity_in(&map).is_some());
        assert!(identity_in(&AttributeMap::new()).is_none());
    }

    #[test]
    fn test_halves() {
        let id = identity();
        let cert = certificate_half(&AttributeMap::new(), &id);
        let key = key_half(&AttributeMap::new(), &id);
        assert_eq!(cert.class(), Some(ItemClass::Certificate));
        assert_eq!(key.class(), Some(ItemClass::Key));
    }

    #[test]
    fn test_add_retags_persistent_ref() {
        let mut classes = Vec::new();
        let result = add_identity(
            &AttributeMap::new(),
            &identity(),
            ResultShape::PERSISTENT_REF,
            |half| {
                classes.push(half.class().unwrap());
                Ok(Some(pref(half.class().unwrap())))
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(classes, vec![ItemClass::Certificate, ItemClass::Key]);
        let decoded = PersistentRef::decode(result.as_data().unwrap()).unwrap();
        assert_eq!(decoded.class, ItemClass::Identity);
    }

    #[test]
    fn test_add_tolerates_duplicate_certificate_and_key() {
        let result = add_identity(&AttributeMap::new(), &identity(), ResultShape::empty(), |_| {
            Err(Error::duplicate("dup"))
        })
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_add_duplicate_key_alone_fails() {
        let err = add_identity(&AttributeMap::new(), &identity(), ResultShape::empty(), |half| {
            if half.class() == Some(ItemClass::Key) {
                Err(Error::duplicate("dup"))
            } else {
                Ok(None)
            }
        })
        .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_delete_keeps_certified_key() {
        let mut deleted = Vec::new();
        delete_identity(
            &AttributeMap::new(),
            &identity(),
            |half| {
                deleted.push(half.class().unwrap());
                Ok(())
            },
            |label| Ok(label == [7u8].as_slice()),
        )
        .unwrap();
        assert_eq!(deleted, vec![ItemClass::Certificate]);
    }

    #[test]
    fn test_delete_removes_uncertified_key() {
        let mut deleted = Vec::new();
        delete_identity(
            &AttributeMap::new(),
            &identity(),
            |half| {
                deleted.push(half.class().unwrap());
                Ok(())
            },
            |_| Ok(false),
        )
        .unwrap();
        assert_eq!(deleted, vec![ItemClass::Certificate, ItemClass::Key]);
    }

    #[test]
    fn test_class_delete_not_found_only_when_both_missing() {
        let err = delete_identity_class(&AttributeMap::new(), |_| Err(Error::not_found("none"))).unwrap_err();
        assert!(err.is_not_found());

        delete_identity_class(&AttributeMap::new(), |half| {
            if half.class() == Some(ItemClass::Key) {
                Ok(())
            } else {
                Err(Error::not_found("none"))
            }
        })
        .unwrap();
    }

    #[test]
    fn test_identity_query() {
        let query = AttributeMap::new().with(attr::VALUE_REF, ObjectHandle::Identity(identity()));
        let rewritten = identity_query(&query, &identity()).unwrap();
        assert_eq!(rewritten.class(), Some(ItemClass::Identity));
        assert!(!rewritten.contains_key(attr::VALUE_REF));
        assert!(!rewritten.contains_key(attr::VALUE_DATA));
        assert_eq!(rewritten.get_data(attr::SERIAL_NUMBER), Some([1u8].as_slice()));
    }
}
