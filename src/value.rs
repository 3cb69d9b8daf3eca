//! Attribute maps, typed values and copy-on-write map views.
//!
//! Queries, attributes-to-apply, auth parameters and raw daemon records are
//! all [`AttributeMap`]s. Code that rewrites a caller's map works on a
//! [`CowMap`], which borrows the caller's map until the first write and then
//! owns a private copy, so the caller never observes a mutation.

use crate::access_control::AccessControl;
use crate::auth::AuthContextHandle;
use crate::handle::ObjectHandle;
use crate::item_class::ItemClass;
use crate::policy::Policy;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Deref;

/// Attribute keys, using the keychain wire names.
pub mod attr {
    /// Item class (`genp`, `inet`, `ashp`, `cert`, `keys`, `idnt`).
    pub const CLASS: &str = "class";
    /// Service name of a generic password.
    pub const SERVICE: &str = "svce";
    /// Account name.
    pub const ACCOUNT: &str = "acct";
    /// Internet server name.
    pub const SERVER: &str = "srvr";
    /// Internet protocol.
    pub const PROTOCOL: &str = "ptcl";
    /// Internet port.
    pub const PORT: &str = "port";
    /// User visible label.
    pub const LABEL: &str = "labl";
    /// Serialized or object access control.
    pub const ACCESS_CONTROL: &str = "accc";
    /// Access group.
    pub const ACCESS_GROUP: &str = "agrp";
    /// Token identifier of a token-backed item.
    pub const TOKEN_ID: &str = "tkid";
    /// Whether the item is stored at all.
    pub const IS_PERMANENT: &str = "perm";
    /// Key application label, the hash of the public key.
    pub const APPLICATION_LABEL: &str = "klbl";
    /// Key application tag.
    pub const APPLICATION_TAG: &str = "atag";
    /// Key class (`public`, `private`, `symmetric`).
    pub const KEY_CLASS: &str = "kcls";
    /// Certificate public key hash.
    pub const PUBLIC_KEY_HASH: &str = "pkhh";
    /// Certificate issuer (normalized DN content).
    pub const ISSUER: &str = "issr";
    /// Certificate serial number.
    pub const SERIAL_NUMBER: &str = "slnr";
    /// Certificate subject.
    pub const SUBJECT: &str = "subj";
    /// Certificate data nested in an identity record.
    pub const IDENTITY_CERTIFICATE_DATA: &str = "certdata";
    /// Token of the certificate nested in an identity record.
    pub const IDENTITY_CERTIFICATE_TOKEN_ID: &str = "certtkid";

    /// Item value (secret or certificate bytes).
    pub const VALUE_DATA: &str = "v_Data";
    /// Object handle.
    pub const VALUE_REF: &str = "v_Ref";
    /// Persistent reference.
    pub const VALUE_PERSISTENT_REF: &str = "v_PersistentRef";

    /// Return the value.
    pub const RETURN_DATA: &str = "r_Data";
    /// Return an object handle.
    pub const RETURN_REF: &str = "r_Ref";
    /// Return the attributes.
    pub const RETURN_ATTRIBUTES: &str = "r_Attributes";
    /// Return a persistent reference.
    pub const RETURN_PERSISTENT_REF: &str = "r_PersistentRef";

    /// Match limit: a number or [`MATCH_LIMIT_ALL`].
    pub const MATCH_LIMIT: &str = "m_Limit";
    /// Match every item.
    pub const MATCH_LIMIT_ALL: &str = "m_LimitAll";
    /// Certificate policy (or list of policies).
    pub const MATCH_POLICY: &str = "m_Policy";

    /// Live authentication context.
    pub const USE_AUTH_CONTEXT: &str = "u_AuthCtx";
    /// Portable credential reference.
    pub const USE_CREDENTIAL_REF: &str = "u_CredRef";
    /// Reason text shown in authentication prompts.
    pub const USE_OPERATION_PROMPT: &str = "u_OpPrompt";
    /// Authentication UI mode.
    pub const USE_AUTH_UI: &str = "u_AuthUI";
    /// Name of the caller shown in prompts.
    pub const USE_CALLER_NAME: &str = "u_CallerName";

    /// Prompting allowed.
    pub const AUTH_UI_ALLOW: &str = "u_AuthUIA";
    /// Fail instead of prompting.
    pub const AUTH_UI_FAIL: &str = "u_AuthUIF";
    /// Skip items that would prompt.
    pub const AUTH_UI_SKIP: &str = "u_AuthUIS";

    /// Whether `key` is a return, match or use option rather than an item attribute.
    #[must_use]
    pub fn is_option(key: &str) -> bool {
        key.starts_with("r_") || key.starts_with("m_") || key.starts_with("u_")
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Number(i64),
    /// Opaque bytes.
    Data(Vec<u8>),
    /// UTF-8 string.
    String(String),
    /// Nested map.
    Map(AttributeMap),
    /// List of values.
    Array(Vec<Value>),
    /// Key, certificate or identity handle.
    Object(ObjectHandle),
    /// Access control in object form.
    AccessControl(AccessControl),
    /// Live authentication context.
    AuthContext(AuthContextHandle),
    /// Certificate evaluation policy.
    Policy(Policy),
}

impl Value {
    /// The string, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes, if this is data.
    #[must_use]
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    /// The flag, if this is a boolean or a number.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// The integer, if this is a number.
    #[must_use]
    pub const fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The nested map, if this is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&AttributeMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The handle, if this is an object handle.
    #[must_use]
    pub const fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(d: Vec<u8>) -> Self {
        Self::Data(d)
    }
}

impl From<&[u8]> for Value {
    fn from(d: &[u8]) -> Self {
        Self::Data(d.to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<ItemClass> for Value {
    fn from(class: ItemClass) -> Self {
        Self::String(class.as_str().to_owned())
    }
}

impl From<AttributeMap> for Value {
    fn from(m: AttributeMap) -> Self {
        Self::Map(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Self::Array(a)
    }
}

impl From<ObjectHandle> for Value {
    fn from(o: ObjectHandle) -> Self {
        Self::Object(o)
    }
}

impl From<AccessControl> for Value {
    fn from(ac: AccessControl) -> Self {
        Self::AccessControl(ac)
    }
}

impl From<AuthContextHandle> for Value {
    fn from(ctx: AuthContextHandle) -> Self {
        Self::AuthContext(ctx)
    }
}

impl From<Policy> for Value {
    fn from(p: Policy) -> Self {
        Self::Policy(p)
    }
}

/// Mapping from attribute key to typed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeMap {
    entries: BTreeMap<String, Value>,
}

impl AttributeMap {
    /// Create an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// String value of `key`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Byte value of `key`.
    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_data)
    }

    /// Boolean value of `key`.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Whether `key` holds a true flag.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get_bool(key).unwrap_or(false)
    }

    /// The parsed item class, if present and recognised.
    #[must_use]
    pub fn class(&self) -> Option<ItemClass> {
        self.get_str(attr::CLASS).and_then(ItemClass::from_name)
    }

    /// Insert every entry of `defaults` whose key is not already present.
    pub fn merge_under(&mut self, defaults: Self) {
        for (key, value) in defaults.entries {
            self.entries.entry(key).or_insert(value);
        }
    }

    /// Entries that describe the item itself, without return/match/use options.
    #[must_use]
    pub fn item_attributes(&self) -> Self {
        self.entries
            .iter()
            .filter(|(k, _)| !attr::is_option(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for AttributeMap {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Copy-on-write view of an [`AttributeMap`].
///
/// Reads go to the borrowed map; the first write materializes a private
/// owned copy.
#[derive(Debug, Clone)]
pub struct CowMap<'a> {
    inner: Cow<'a, AttributeMap>,
}

impl<'a> CowMap<'a> {
    /// View a caller-owned map.
    #[must_use]
    pub const fn borrowed(map: &'a AttributeMap) -> Self {
        Self {
            inner: Cow::Borrowed(map),
        }
    }

    /// Wrap a map this call already owns.
    #[must_use]
    pub const fn owned(map: AttributeMap) -> Self {
        Self {
            inner: Cow::Owned(map),
        }
    }

    /// Whether a private copy has been materialized.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self.inner, Cow::Owned(_))
    }

    /// Mutable access, materializing a private copy on first use.
    pub fn to_mut(&mut self) -> &mut AttributeMap {
        self.inner.to_mut()
    }

    /// Insert a value into the private copy.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.to_mut().insert(key, value)
    }

    /// Remove a value; a borrowed map is only copied when `key` is present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if self.inner.contains_key(key) {
            self.to_mut().remove(key)
        } else {
            None
        }
    }

    /// A fresh view borrowing this one's current contents.
    #[must_use]
    pub fn reborrow(&self) -> CowMap<'_> {
        CowMap::borrowed(&self.inner)
    }

    /// Extract the owned map, cloning if still borrowed.
    #[must_use]
    pub fn into_owned(self) -> AttributeMap {
        self.inner.into_owned()
    }
}

impl Deref for CowMap<'_> {
    type Target = AttributeMap;

    fn deref(&self) -> &AttributeMap {
        &self.inner
    }
}

impl From<AttributeMap> for CowMap<'_> {
    fn from(map: AttributeMap) -> Self {
        Self::owned(map)
    }
}
