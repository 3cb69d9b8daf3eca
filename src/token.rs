//! Token-backed items.
//!
//! A token item's secret material lives on a hardware token; the daemon only
//! stores a [`CompositeTokenValue`] in the item's `v_Data` field: the
//! token-assigned object id, the object's serialized (bound) access control
//! and, for public material, an inline copy of the value.
//!
//! [`TokenItemAdapter`] translates item add/update/delete into token object
//! operations followed by the ordinary daemon request for the record.

use crate::access_control::{operation, AccessControl, AclPair};
use crate::auth::AuthState;
use crate::daemon::{DaemonClient, Request};
use crate::error::{codes, Error, ErrorDomain, Result, Status};
use crate::handle::{ObjectHandle, TokenBinding};
use crate::item_class::ItemClass;
use crate::persistent_ref::PersistentRef;
use crate::value::{attr, AttributeMap, CowMap, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The record stored by the daemon for a token-backed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeTokenValue {
    /// Token-assigned object identifier.
    #[serde(rename = "oid", with = "serde_bytes")]
    pub object_id: Vec<u8>,
    /// Serialized access control of the object.
    #[serde(rename = "ac", default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub access_control: Option<Vec<u8>>,
    /// Inline copy of the object's value, when it is not secret.
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub value: Option<Vec<u8>>,
}

impl CompositeTokenValue {
    /// Pack the parts of a token item.
    #[must_use]
    pub const fn new(object_id: Vec<u8>, access_control: Option<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        Self {
            object_id,
            access_control,
            value,
        }
    }

    /// Encode to the stored byte form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Decode the stored byte form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `bytes` is not a composite value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Self = serde_cbor::from_slice(bytes)?;
        if value.object_id.is_empty() {
            return Err(Error::decode("token item has an empty object id"));
        }
        Ok(value)
    }

    /// The access control in object form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the stored access control is corrupt.
    pub fn access_control(&self) -> Result<Option<AccessControl>> {
        self.access_control
            .as_deref()
            .map(AccessControl::from_bytes)
            .transpose()
    }
}

/// A hardware token provider.
pub trait TokenProvider: Send + Sync {
    /// Open the token `token_id`. `params` carries portable auth parameters
    /// such as the credential reference.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn create_token(&self, token_id: &str, params: &AttributeMap) -> Result<Arc<dyn Token>>;
}

/// An open token.
pub trait Token: Send + Sync {
    /// The token identifier.
    fn token_id(&self) -> &str;

    /// Create a new object (`object_id == None`) or update an existing one.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn create_or_update_object(&self, object_id: Option<&[u8]>, attributes: &AttributeMap) -> Result<Vec<u8>>;

    /// Delete an object.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn delete_object(&self, object_id: &[u8]) -> Result<()>;

    /// Read an object's value.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn copy_object_data(&self, object_id: &[u8]) -> Result<Vec<u8>>;

    /// Read an object's current access control.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn copy_object_access_control(&self, object_id: &[u8]) -> Result<AccessControl>;

    /// The access control the token would give a new object with `attributes`.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, usually in the token domain.
    fn copy_object_creation_access_control(&self, attributes: &AttributeMap) -> Result<AccessControl>;
}

/// Turn a token "authentication failed" into an authorization-needed
/// rejection for `operation` against the item's access control.
///
/// Any other error passes through unchanged.
#[must_use]
pub fn authorization_from_token_error(err: Error, access_control: Option<&[u8]>, operation: &str) -> Error {
    match &err {
        Error::Domain {
            domain: ErrorDomain::Token,
            code: codes::token::AUTHENTICATION_FAILED,
            ..
        } => match access_control.map(AccessControl::from_bytes) {
            Some(Ok(ac)) => Error::authorization_needed(vec![AclPair::new(ac, operation)]),
            Some(Err(decode)) => decode,
            None => err,
        },
        _ => err,
    }
}

fn no_provider() -> Error {
    Error::status_error(Status::NotAvailable, "no token provider configured")
}

/// Opens tokens at most once per id while a result is being assembled.
pub struct TokenCache<'a> {
    provider: Option<&'a dyn TokenProvider>,
    params: &'a AttributeMap,
    tokens: HashMap<String, Arc<dyn Token>>,
}

impl<'a> TokenCache<'a> {
    /// Create a cache opening tokens through `provider` with `params`.
    #[must_use]
    pub fn new(provider: Option<&'a dyn TokenProvider>, params: &'a AttributeMap) -> Self {
        Self {
            provider,
            params,
            tokens: HashMap::new(),
        }
    }

    /// The open token `token_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotAvailable` without a provider, or the provider's failure.
    pub fn token(&mut self, token_id: &str) -> Result<Arc<dyn Token>> {
        if let Some(token) = self.tokens.get(token_id) {
            return Ok(Arc::clone(token));
        }
        let provider = self.provider.ok_or_else(no_provider)?;
        let token = provider.create_token(token_id, self.params)?;
        self.tokens.insert(token_id.to_owned(), Arc::clone(&token));
        Ok(token)
    }

    /// The value of a token item, inline or read from the token.
    ///
    /// # Errors
    ///
    /// Returns authorization-needed when the token wants authentication,
    /// or the token's failure.
    pub fn resolve_value(&mut self, token_id: &str, composite: CompositeTokenValue) -> Result<Vec<u8>> {
        if let Some(value) = composite.value {
            return Ok(value);
        }
        debug!(token_id, "reading token item value from the token");
        self.token(token_id)?
            .copy_object_data(&composite.object_id)
            .map_err(|err| {
                authorization_from_token_error(err, composite.access_control.as_deref(), operation::DECRYPT)
            })
    }
}

fn pending_access_control(attributes: &AttributeMap) -> Result<Option<AccessControl>> {
    match attributes.get(attr::ACCESS_CONTROL) {
        Some(Value::Data(bytes)) => AccessControl::from_bytes(bytes).map(Some),
        Some(Value::AccessControl(ac)) => Ok(Some(ac.clone())),
        Some(_) => Err(Error::param("access control attribute has an unexpected type")),
        None => Ok(None),
    }
}

/// Create or update the token object behind an item and store the packed
/// composite value in `attributes`.
///
/// `class` is the class of the stored item; on updates `attributes` only
/// holds the changes. Key values stay on the token. `previous_value` is the
/// inline value of the existing item, kept when the update does not supply a
/// new one.
///
/// # Errors
///
/// Returns authorization-needed (with the bind operation) when the access
/// control is not bound yet, or the token's failure.
pub fn create_or_update(
    token: &dyn Token,
    class: Option<ItemClass>,
    object_id: Option<&[u8]>,
    attributes: &mut CowMap<'_>,
    previous_value: Option<&[u8]>,
) -> Result<()> {
    match pending_access_control(attributes)? {
        Some(ac) if !ac.is_bound() => {
            debug!("token item access control must be bound first");
            return Err(Error::authorization_needed(vec![AclPair::new(ac, operation::BIND)]));
        }
        None if object_id.is_none() => {
            let creation = token.copy_object_creation_access_control(attributes)?;
            if creation.requires_authentication() && !creation.is_bound() {
                debug!("token creation access control must be bound first");
                return Err(Error::authorization_needed(vec![AclPair::new(creation, operation::BIND)]));
            }
        }
        _ => {}
    }

    let object_id = token.create_or_update_object(object_id, attributes)?;
    let access_control = token.copy_object_access_control(&object_id)?;
    let inline = if class == Some(ItemClass::Key) {
        None
    } else {
        attributes
            .get_data(attr::VALUE_DATA)
            .or(previous_value)
            .map(<[u8]>::to_vec)
    };
    let packed = CompositeTokenValue::new(object_id, Some(access_control.to_bytes()?), inline).encode()?;
    attributes.insert(attr::VALUE_DATA, packed);
    attributes.remove(attr::ACCESS_CONTROL);
    Ok(())
}

/// Runs item operations against token-backed items.
pub struct TokenItemAdapter<'a> {
    provider: &'a dyn TokenProvider,
    daemon: &'a dyn DaemonClient,
}

impl<'a> TokenItemAdapter<'a> {
    /// Create an adapter over `provider` and `daemon`.
    #[must_use]
    pub const fn new(provider: &'a dyn TokenProvider, daemon: &'a dyn DaemonClient) -> Self {
        Self { provider, daemon }
    }

    fn open(&self, token_id: &str, auth: &AttributeMap) -> Result<Arc<dyn Token>> {
        self.provider.create_token(token_id, auth)
    }

    /// Add a token item described by `state.attributes`.
    ///
    /// Returns the daemon's raw record, or the in-memory attribute map when
    /// the attributes mark the item non-persistent.
    ///
    /// # Errors
    ///
    /// Returns authorization-needed when binding is required, or the token's
    /// or daemon's failure.
    pub fn add(&self, state: &AuthState<'_>, token_id: &str) -> Result<Option<Value>> {
        let auth = state.portable_auth();
        let token = self.open(token_id, &auth)?;
        let mut attributes = state.attributes();
        let class = attributes.class();
        create_or_update(token.as_ref(), class, None, &mut attributes, None)?;

        let mut record = attributes.into_owned();
        let composite = record
            .get_data(attr::VALUE_DATA)
            .map(CompositeTokenValue::decode)
            .transpose()?
            .ok_or_else(|| Error::internal("token item lost its packed value"))?;
        let binding = TokenBinding::new(token_id, composite.object_id);
        if let Some(handle) = ObjectHandle::from_attributes(&record, Some(binding))? {
            record.merge_under(handle.to_attribute_map()?);
        }

        if record.get_bool(attr::IS_PERMANENT) == Some(false) {
            debug!(token_id, "token item is not persistent, returning attributes only");
            return Ok(Some(Value::Map(record.item_attributes())));
        }
        record.insert(attr::RETURN_ATTRIBUTES, true);
        record.insert(attr::RETURN_DATA, true);
        self.daemon.call(Request::Add {
            attributes: &record,
            auth: &auth,
        })
    }

    /// Apply `state.attributes` to every token item matching `query`.
    ///
    /// # Errors
    ///
    /// Returns authorization-needed when the token wants authentication or
    /// binding, or the token's or daemon's failure.
    pub fn update(&self, state: &AuthState<'_>, query: &AttributeMap, token_id: &str) -> Result<()> {
        let auth = state.portable_auth();
        let token = self.open(token_id, &auth)?;
        self.for_each_matching(query, &auth, |composite, requery| {
            let mut attributes = state.attributes();
            create_or_update(
                token.as_ref(),
                requery.class(),
                Some(&composite.object_id),
                &mut attributes,
                composite.value.as_deref(),
            )
            .map_err(|err| {
                authorization_from_token_error(err, composite.access_control.as_deref(), operation::ENCRYPT)
            })?;
            self.daemon.call(Request::Update {
                query: requery,
                attributes: &attributes,
                auth: &auth,
            })?;
            Ok(())
        })
    }

    /// Delete every token item matching `query`, token object first.
    ///
    /// # Errors
    ///
    /// Returns authorization-needed when the token wants authentication, or
    /// the token's or daemon's failure.
    pub fn delete(&self, state: &AuthState<'_>, query: &AttributeMap, token_id: &str) -> Result<()> {
        let auth = state.portable_auth();
        let token = self.open(token_id, &auth)?;
        self.for_each_matching(query, &auth, |composite, requery| {
            token.delete_object(&composite.object_id).map_err(|err| {
                authorization_from_token_error(err, composite.access_control.as_deref(), operation::DELETE)
            })?;
            self.daemon.call(Request::Delete { query: requery, auth: &auth })?;
            Ok(())
        })
    }

    /// Look up every item matching `query` and call `step` with its decoded
    /// composite value and a query selecting exactly that item.
    ///
    /// # Errors
    ///
    /// Returns the daemon's failure (not-found when nothing matches), a
    /// decode error for malformed records, or the first failure of `step`.
    pub fn for_each_matching<F>(&self, query: &AttributeMap, auth: &AttributeMap, mut step: F) -> Result<()>
    where
        F: FnMut(&CompositeTokenValue, &AttributeMap) -> Result<()>,
    {
        let mut search = query.item_attributes();
        search.insert(attr::RETURN_DATA, true);
        search.insert(attr::RETURN_PERSISTENT_REF, true);
        search.insert(attr::MATCH_LIMIT, attr::MATCH_LIMIT_ALL);
        let reply = self
            .daemon
            .call(Request::CopyMatching { query: &search, auth })?
            .ok_or_else(|| Error::not_found("no token item matches the query"))?;
        let records = match reply {
            Value::Array(items) => items,
            single => vec![single],
        };
        for record in &records {
            let record = record
                .as_map()
                .ok_or_else(|| Error::decode("token item record is not a map"))?;
            let composite = record
                .get_data(attr::VALUE_DATA)
                .ok_or_else(|| Error::decode("token item record carries no value"))
                .and_then(CompositeTokenValue::decode)?;
            let pref_bytes = record
                .get_data(attr::VALUE_PERSISTENT_REF)
                .ok_or_else(|| Error::decode("token item record carries no persistent reference"))?;
            let pref = PersistentRef::decode(pref_bytes)?;
            let requery = AttributeMap::new()
                .with(attr::CLASS, pref.class)
                .with(attr::VALUE_PERSISTENT_REF, pref_bytes);
            step(&composite, &requery)?;
        }
        Ok(())
    }
}
