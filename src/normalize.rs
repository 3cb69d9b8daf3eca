//! Attribute normalization ahead of every daemon request.
//!
//! Caller maps may hold live objects (handles, access-control objects, auth
//! contexts, policies) that cannot cross the RPC boundary. [`normalize`]
//! rewrites them into their plain forms and splits the `u_*` auth options
//! off into a separate auth-parameter map. The caller's map is borrowed and
//! only copied on the first rewrite.

use crate::auth::Authenticator;
use crate::der;
use crate::error::{Error, Result};
use crate::item_class::ItemClass;
use crate::persistent_ref::PersistentRef;
use crate::policy::policies_to_wire;
use crate::value::{attr, AttributeMap, CowMap, Value};
use tracing::debug;

/// Auth options moved from the attributes into the auth parameters.
const AUTH_OPTIONS: [&str; 4] = [
    attr::USE_CREDENTIAL_REF,
    attr::USE_OPERATION_PROMPT,
    attr::USE_AUTH_UI,
    attr::USE_CALLER_NAME,
];

/// What the normalized map will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Attributes of a new item.
    Add,
    /// A query selecting existing items.
    Query,
    /// Attributes applied to existing items.
    Update,
}

/// A normalized map and the auth parameters extracted from it.
#[derive(Debug, Clone)]
pub struct Normalized<'a> {
    /// Attributes ready for the daemon.
    pub attributes: CowMap<'a>,
    /// Live context, credential reference and prompt options.
    pub auth_params: AttributeMap,
}

/// Normalize `map` for `purpose`.
///
/// # Errors
///
/// Returns `Param` when a live auth context and a credential reference are
/// both supplied or a persistent reference is malformed,
/// `UnsupportedReference` for identity handles, and any failure of
/// externalizing the auth context or marshalling policies.
pub fn normalize<'a>(map: CowMap<'a>, purpose: Purpose, authenticator: &dyn Authenticator) -> Result<Normalized<'a>> {
    let mut attributes = map;
    merge_object_handle(&mut attributes, purpose)?;
    serialize_access_control(&mut attributes)?;
    let auth_params = extract_auth_params(&mut attributes, authenticator)?;
    marshal_policy(&mut attributes)?;
    normalize_issuer(&mut attributes);
    if purpose == Purpose::Query {
        pin_persistent_ref(&mut attributes)?;
    }
    Ok(Normalized {
        attributes,
        auth_params,
    })
}

fn merge_object_handle(attributes: &mut CowMap<'_>, purpose: Purpose) -> Result<()> {
    let Some(Value::Object(handle)) = attributes.get(attr::VALUE_REF) else {
        return Ok(());
    };
    let mut defaults = handle.to_attribute_map()?;
    if purpose == Purpose::Query && defaults.class() == Some(ItemClass::Key) {
        // Key material is not a lookup criterion.
        defaults.remove(attr::VALUE_DATA);
    }
    let map = attributes.to_mut();
    map.remove(attr::VALUE_REF);
    map.merge_under(defaults);
    Ok(())
}

fn serialize_access_control(attributes: &mut CowMap<'_>) -> Result<()> {
    if let Some(Value::AccessControl(ac)) = attributes.get(attr::ACCESS_CONTROL) {
        let bytes = ac.to_bytes()?;
        attributes.insert(attr::ACCESS_CONTROL, bytes);
    }
    Ok(())
}

fn extract_auth_params(attributes: &mut CowMap<'_>, authenticator: &dyn Authenticator) -> Result<AttributeMap> {
    let mut auth = AttributeMap::new();
    match attributes.get(attr::USE_AUTH_CONTEXT) {
        Some(Value::AuthContext(context)) => {
            if attributes.contains_key(attr::USE_CREDENTIAL_REF) {
                return Err(Error::param(
                    "an auth context and a credential reference cannot both be supplied",
                ));
            }
            let credential = authenticator.externalize_context(context)?;
            auth.insert(attr::USE_AUTH_CONTEXT, context.clone());
            auth.insert(attr::USE_CREDENTIAL_REF, credential);
            attributes.remove(attr::USE_AUTH_CONTEXT);
        }
        Some(_) => return Err(Error::param("auth context attribute is not a context")),
        None => {}
    }
    for key in AUTH_OPTIONS {
        if let Some(value) = attributes.remove(key) {
            auth.insert(key, value);
        }
    }
    Ok(auth)
}

fn marshal_policy(attributes: &mut CowMap<'_>) -> Result<()> {
    let Some(policy) = attributes.get(attr::MATCH_POLICY) else {
        return Ok(());
    };
    if matches!(policy, Value::Array(items) if items.iter().all(|i| matches!(i, Value::Map(_)))) {
        return Ok(());
    }
    let wire = policies_to_wire(policy)?;
    attributes.insert(attr::MATCH_POLICY, wire);
    Ok(())
}

fn normalize_issuer(attributes: &mut CowMap<'_>) {
    let Some(issuer) = attributes.get_data(attr::ISSUER) else {
        return;
    };
    if !der::is_sequence(issuer) {
        return;
    }
    match der::normalize_name(issuer) {
        Ok(normalized) => {
            attributes.insert(attr::ISSUER, normalized);
        }
        Err(err) => debug!(%err, "issuer is not a well-formed name, passing it through"),
    }
}

fn pin_persistent_ref(attributes: &mut CowMap<'_>) -> Result<()> {
    let Some(value) = attributes.get(attr::VALUE_PERSISTENT_REF) else {
        return Ok(());
    };
    let bytes = value
        .as_data()
        .ok_or_else(|| Error::param("persistent reference must be data"))?;
    let pref = PersistentRef::decode(bytes)?;
    if attributes.class() != Some(pref.class) {
        attributes.insert(attr::CLASS, pref.class);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::access_control::{operation, AccessControl, Requirement};
    use crate::auth::{AuthContext, AuthContextHandle, PromptOptions};
    use crate::error::Status;
    use crate::handle::{CertificateHandle, IdentityHandle, KeyHandle, ObjectHandle};
    use crate::policy::Policy;
    use std::any::Any;

    #[derive(Debug)]
    struct Ctx;

    impl AuthContext for Ctx {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Fixed;

    impl Authenticator for Fixed {
        fn create_context(&self, _credential: Option<&[u8]>) -> Result<AuthContextHandle> {
            Ok(AuthContextHandle::new(Ctx))
        }

        fn externalize_context(&self, _context: &AuthContextHandle) -> Result<Vec<u8>> {
            Ok(b"credential".to_vec())
        }

        fn evaluate_and_update_acl(
            &self,
            _context: &AuthContextHandle,
            _access_control: &AccessControl,
            _operation: &str,
            _options: &PromptOptions,
        ) -> Result<Option<AccessControl>> {
            Ok(None)
        }
    }

    fn run(map: &AttributeMap, purpose: Purpose) -> Result<Normalized<'_>> {
        normalize(CowMap::borrowed(map), purpose, &Fixed)
    }

    #[test]
    fn test_plain_map_is_not_copied() {
        let map = AttributeMap::new()
            .with(attr::CLASS, ItemClass::GenericPassword)
            .with(attr::SERVICE, "S");
        let out = run(&map, Purpose::Add).unwrap();
        assert!(!out.attributes.is_owned());
        assert!(out.auth_params.is_empty());
    }

    #[test]
    fn test_handle_merged_under_caller_attributes() {
        let key = KeyHandle::new(
            AttributeMap::new()
                .with(attr::APPLICATION_LABEL, vec![1u8, 2])
                .with(attr::LABEL, "from handle"),
        )
        .with_data(vec![9u8]);
        let map = AttributeMap::new()
            .with(attr::VALUE_REF, ObjectHandle::Key(key))
            .with(attr::LABEL, "from caller");
        let out = run(&map, Purpose::Add).unwrap();
        let attrs = &out.attributes;
        assert!(!attrs.contains_key(attr::VALUE_REF));
        assert_eq!(attrs.get_str(attr::LABEL), Some("from caller"));
        assert_eq!(attrs.class(), Some(ItemClass::Key));
        assert_eq!(attrs.get_data(attr::VALUE_DATA), Some([9u8].as_slice()));
        // Caller's map is unchanged.
        assert!(map.contains_key(attr::VALUE_REF));
    }

    #[test]
    fn test_key_query_drops_key_material() {
        let key = KeyHandle::new(AttributeMap::new()).with_data(vec![9u8]);
        let map = AttributeMap::new().with(attr::VALUE_REF, ObjectHandle::Key(key));
        let out = run(&map, Purpose::Query).unwrap();
        assert!(!out.attributes.contains_key(attr::VALUE_DATA));
    }

    #[test]
    fn test_identity_handle_unsupported() {
        let identity = IdentityHandle::new(
            CertificateHandle::new(vec![0x30], AttributeMap::new()),
            KeyHandle::new(AttributeMap::new()),
        );
        let map = AttributeMap::new().with(attr::VALUE_REF, ObjectHandle::Identity(identity));
        let err = run(&map, Purpose::Add).unwrap_err();
        assert_eq!(err.status(), Status::UnsupportedReference);
    }

    #[test]
    fn test_access_control_serialized() {
        let ac = AccessControl::new().with_constraint(operation::DECRYPT, Requirement::UserPresence);
        let map = AttributeMap::new().with(attr::ACCESS_CONTROL, ac.clone());
        let out = run(&map, Purpose::Add).unwrap();
        let bytes = out.attributes.get_data(attr::ACCESS_CONTROL).unwrap();
        assert_eq!(AccessControl::from_bytes(bytes).unwrap(), ac);
    }

    #[test]
    fn test_auth_context_externalized() {
        let ctx = AuthContextHandle::new(Ctx);
        let map = AttributeMap::new()
            .with(attr::USE_AUTH_CONTEXT, ctx.clone())
            .with(attr::USE_OPERATION_PROMPT, "Unlock")
            .with(attr::SERVICE, "S");
        let out = run(&map, Purpose::Query).unwrap();
        assert!(!out.attributes.contains_key(attr::USE_AUTH_CONTEXT));
        assert!(!out.attributes.contains_key(attr::USE_OPERATION_PROMPT));
        assert_eq!(out.auth_params.get(attr::USE_AUTH_CONTEXT), Some(&Value::AuthContext(ctx)));
        assert_eq!(out.auth_params.get_data(attr::USE_CREDENTIAL_REF), Some(b"credential".as_slice()));
        assert_eq!(out.auth_params.get_str(attr::USE_OPERATION_PROMPT), Some("Unlock"));
    }

    #[test]
    fn test_context_and_credential_conflict() {
        let map = AttributeMap::new()
            .with(attr::USE_AUTH_CONTEXT, AuthContextHandle::new(Ctx))
            .with(attr::USE_CREDENTIAL_REF, vec![1u8]);
        assert_eq!(run(&map, Purpose::Query).unwrap_err().status(), Status::Param);
    }

    #[test]
    fn test_policy_marshalled() {
        let map = AttributeMap::new().with(attr::MATCH_POLICY, Policy::new("1.2.3"));
        let out = run(&map, Purpose::Query).unwrap();
        let wire = out.attributes.get(attr::MATCH_POLICY).unwrap().as_array().unwrap();
        assert!(matches!(wire[0], Value::Map(_)));
    }

    #[test]
    fn test_issuer_normalized_or_passed_through() {
        // SEQUENCE { SET { SEQUENCE { OID cn, PrintableString " a  b " } } }
        let name = vec![
            0x30, 0x13, 0x31, 0x11, 0x30, 0x0f, 0x06, 0x03, 0x55, 0x04, 0x03, 0x13, 0x08, b' ', b'a', b' ', b' ', b'b',
            b' ', b' ', b' ',
        ];
        let map = AttributeMap::new().with(attr::ISSUER, name.clone());
        let out = run(&map, Purpose::Query).unwrap();
        assert_ne!(out.attributes.get_data(attr::ISSUER).unwrap(), name.as_slice());

        let broken = vec![0x30, 0x05, 0x31];
        let map = AttributeMap::new().with(attr::ISSUER, broken.clone());
        let out = run(&map, Purpose::Query).unwrap();
        assert_eq!(out.attributes.get_data(attr::ISSUER).unwrap(), broken.as_slice());
    }

    #[test]
    fn test_persistent_ref_pins_class() {
        let pref = PersistentRef::new(ItemClass::InternetPassword, 4).encode();
        let map = AttributeMap::new()
            .with(attr::CLASS, ItemClass::GenericPassword)
            .with(attr::VALUE_PERSISTENT_REF, pref.as_slice());
        let out = run(&map, Purpose::Query).unwrap();
        assert_eq!(out.attributes.class(), Some(ItemClass::InternetPassword));
    }

    #[test]
    fn test_bad_persistent_ref_rejected() {
        let map = AttributeMap::new().with(attr::VALUE_PERSISTENT_REF, vec![1u8, 2, 3]);
        assert_eq!(run(&map, Purpose::Query).unwrap_err().status(), Status::Param);
    }
}
