//! Property-based tests for Secitem.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use secitem::der::normalize_name;
use secitem::error::codes;
use secitem::memory::{InMemoryAuthenticator, InMemoryDaemon, InMemoryTokenProvider};
use secitem::persistent_ref::PERSISTENT_REF_LEN;
use secitem::value::attr;
use secitem::{
    AttributeMap, CompositeTokenValue, Error, ErrorDomain, ItemClass, Keychain, PersistentRef, ResultShape,
    Status,
};
use proptest::prelude::*;
use std::sync::Arc;

// Strategy for generating ItemClass values
fn item_class_strategy() -> impl Strategy<Value = ItemClass> {
    prop_oneof![
        Just(ItemClass::GenericPassword),
        Just(ItemClass::InternetPassword),
        Just(ItemClass::AppleSharePassword),
        Just(ItemClass::Certificate),
        Just(ItemClass::Key),
        Just(ItemClass::Identity),
    ]
}

fn shape_strategy() -> impl Strategy<Value = ResultShape> {
    (0u8..16).prop_map(ResultShape::from_bits_truncate)
}

fn status_strategy() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Success),
        Just(Status::Param),
        Just(Status::UserCanceled),
        Just(Status::NotAvailable),
        Just(Status::DuplicateItem),
        Just(Status::ItemNotFound),
        Just(Status::InteractionNotAllowed),
        Just(Status::Decode),
        Just(Status::Internal),
    ]
}

/// Single-attribute distinguished name with a PrintableString value.
fn printable_name(value: &str) -> Vec<u8> {
    let mut atv = vec![0x06, 0x03, 0x55, 0x04, 0x03, 0x13, u8::try_from(value.len()).unwrap()];
    atv.extend_from_slice(value.as_bytes());
    let mut seq = vec![0x30, u8::try_from(atv.len()).unwrap()];
    seq.extend(atv);
    let mut set = vec![0x31, u8::try_from(seq.len()).unwrap()];
    set.extend(seq);
    let mut name = vec![0x30, u8::try_from(set.len()).unwrap()];
    name.extend(set);
    name
}

fn token_key_keychain() -> (Keychain, Arc<InMemoryTokenProvider>) {
    let tokens = Arc::new(InMemoryTokenProvider::new());
    let keychain = Keychain::new(Arc::new(InMemoryDaemon::new()), Arc::new(InMemoryAuthenticator::new()))
        .with_token_provider(tokens.clone());
    keychain
        .add(
            &AttributeMap::new()
                .with(attr::CLASS, ItemClass::Key)
                .with(attr::TOKEN_ID, "tok")
                .with(attr::LABEL, "k"),
        )
        .unwrap();
    (keychain, tokens)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Property: persistent references survive encode/decode
    #[test]
    fn prop_persistent_ref_roundtrip(class in item_class_strategy(), row_id in any::<u64>()) {
        let pref = PersistentRef::new(class, row_id);
        let bytes = pref.encode();
        prop_assert_eq!(bytes.len(), PERSISTENT_REF_LEN);
        prop_assert_eq!(PersistentRef::decode(&bytes).unwrap(), pref);
    }

    // Property: any length other than twelve is a parameter error
    #[test]
    fn prop_persistent_ref_bad_length(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
        prop_assume!(bytes.len() != PERSISTENT_REF_LEN);
        prop_assert_eq!(PersistentRef::decode(&bytes).unwrap_err().status(), Status::Param);
    }

    // Property: unknown class tags are rejected
    #[test]
    fn prop_persistent_ref_unknown_tag(tag in proptest::array::uniform4(any::<u8>()), row_id in any::<u64>()) {
        prop_assume!(ItemClass::from_tag(&tag).is_none());
        let mut bytes = tag.to_vec();
        bytes.extend_from_slice(&row_id.to_be_bytes());
        prop_assert_eq!(PersistentRef::decode(&bytes).unwrap_err().status(), Status::Param);
    }

    // Property: composite token values survive encode/decode
    #[test]
    fn prop_composite_roundtrip(
        object_id in proptest::collection::vec(any::<u8>(), 1..64),
        access_control in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)),
        value in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)),
    ) {
        let composite = CompositeTokenValue::new(object_id, access_control, value);
        let decoded = CompositeTokenValue::decode(&composite.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, composite);
    }

    // Property: the daemon is never asked for references and always for
    // attributes once anything is requested
    #[test]
    fn prop_daemon_request(shape in shape_strategy()) {
        let wanted = shape.daemon_request();
        prop_assert!(!wanted.contains(ResultShape::REFERENCE));
        prop_assert_eq!(wanted.is_empty(), shape.is_empty());
        if !shape.is_empty() {
            prop_assert!(wanted.contains(ResultShape::ATTRIBUTES));
        }
        if shape.contains(ResultShape::REFERENCE) {
            prop_assert!(wanted.contains(ResultShape::DATA));
        }
    }

    // Property: unknown storage codes are reported as unavailable
    #[test]
    fn prop_storage_fallback(code in 100i64..10_000) {
        let err = Error::domain(ErrorDomain::Storage, code, "storage");
        prop_assert_eq!(err.status(), Status::NotAvailable);
    }

    // Property: unrecognised domains are internal errors
    #[test]
    fn prop_unknown_domain_internal(name in "[a-z]{1,12}", code in any::<i64>()) {
        let err = Error::domain(ErrorDomain::Other(name), code, "other");
        prop_assert_eq!(err.status(), Status::Internal);
    }

    // Property: status codes map back to their status
    #[test]
    fn prop_status_code_roundtrip(status in status_strategy()) {
        prop_assert_eq!(Status::from_code(status.code()), Some(status));
    }

    // Property: names differing only in case and spacing normalize equally
    #[test]
    fn prop_name_normalization_ignores_case_and_spacing(
        first in "[a-z]{1,10}",
        second in "[a-z]{1,10}",
    ) {
        let plain = printable_name(&format!("{first} {second}"));
        let noisy = printable_name(&format!("  {}   {} ", first.to_uppercase(), second));
        prop_assert_eq!(normalize_name(&plain).unwrap(), normalize_name(&noisy).unwrap());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Property: password results carry exactly the requested kinds
    #[test]
    fn prop_password_result_fields(shape in shape_strategy()) {
        let keychain = Keychain::new(Arc::new(InMemoryDaemon::new()), Arc::new(InMemoryAuthenticator::new()));
        keychain
            .add(
                &AttributeMap::new()
                    .with(attr::CLASS, ItemClass::GenericPassword)
                    .with(attr::SERVICE, "S")
                    .with(attr::VALUE_DATA, b"pw".as_slice()),
            )
            .unwrap();
        let mut query = AttributeMap::new().with(attr::CLASS, ItemClass::GenericPassword);
        shape.write_to(&mut query);
        let found = keychain.copy_matching(&query).unwrap();

        if shape.is_empty() {
            prop_assert!(found.is_none());
        } else if shape == ResultShape::DATA {
            let found = found.unwrap();
            prop_assert_eq!(found.as_data(), Some(b"pw".as_slice()));
        } else if shape == ResultShape::PERSISTENT_REF {
            let found = found.unwrap();
            prop_assert_eq!(found.as_data().map(<[u8]>::len), Some(PERSISTENT_REF_LEN));
        } else {
            let found = found.unwrap();
            let map = found.as_map().unwrap();
            prop_assert_eq!(map.contains_key(attr::VALUE_DATA), shape.contains(ResultShape::DATA));
            prop_assert_eq!(
                map.contains_key(attr::VALUE_PERSISTENT_REF),
                shape.contains(ResultShape::PERSISTENT_REF)
            );
            prop_assert_eq!(map.contains_key(attr::SERVICE), shape.contains(ResultShape::ATTRIBUTES));
            // Passwords have no handle form.
            prop_assert!(!map.contains_key(attr::VALUE_REF));
        }
    }

    // Property: a token key's value is read from the token only when the
    // caller asked for data, a reference or attributes
    #[test]
    fn prop_token_value_read_on_demand(shape in shape_strategy()) {
        let (keychain, tokens) = token_key_keychain();
        let mut query = AttributeMap::new().with(attr::CLASS, ItemClass::Key);
        shape.write_to(&mut query);
        keychain.copy_matching(&query).unwrap();

        let needs_value = shape.intersects(ResultShape::DATA | ResultShape::REFERENCE | ResultShape::ATTRIBUTES);
        prop_assert_eq!(tokens.data_reads("tok"), usize::from(needs_value));
    }

    // Property: token key results carry exactly the requested kinds, with the
    // value read from the token
    #[test]
    fn prop_token_result_fields(shape in shape_strategy()) {
        let (keychain, _tokens) = token_key_keychain();
        let mut query = AttributeMap::new().with(attr::CLASS, ItemClass::Key);
        shape.write_to(&mut query);
        let found = keychain.copy_matching(&query).unwrap();
        let key_material = b"key-material-1".as_slice();

        if shape.is_empty() {
            prop_assert!(found.is_none());
        } else if shape == ResultShape::DATA {
            let found = found.unwrap();
            prop_assert_eq!(found.as_data(), Some(key_material));
        } else if shape == ResultShape::PERSISTENT_REF {
            let found = found.unwrap();
            let pref = PersistentRef::decode(found.as_data().unwrap()).unwrap();
            prop_assert_eq!(pref.class, ItemClass::Key);
        } else {
            let found = found.unwrap();
            let map = found.as_map().unwrap();
            prop_assert_eq!(
                map.get_data(attr::VALUE_DATA),
                shape.contains(ResultShape::DATA).then_some(key_material)
            );
            prop_assert_eq!(
                map.contains_key(attr::VALUE_PERSISTENT_REF),
                shape.contains(ResultShape::PERSISTENT_REF)
            );
            prop_assert_eq!(map.contains_key(attr::VALUE_REF), shape.contains(ResultShape::REFERENCE));
            prop_assert_eq!(map.contains_key(attr::LABEL), shape.contains(ResultShape::ATTRIBUTES));
            prop_assert_eq!(map.contains_key(attr::TOKEN_ID), shape.contains(ResultShape::ATTRIBUTES));
        }
    }
}

#[test]
fn test_storage_codes_translate() {
    let duplicate = Error::domain(ErrorDomain::Storage, codes::storage::CONSTRAINT, "dup");
    assert_eq!(duplicate.status(), Status::DuplicateItem);
    let missing = Error::domain(ErrorDomain::Storage, codes::storage::NOTFOUND, "missing");
    assert_eq!(missing.status(), Status::ItemNotFound);
}
