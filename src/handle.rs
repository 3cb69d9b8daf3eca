//! Object handles: live references to keys, certificates and identities.
//!
//! Wherever "an object" is accepted, callers may pass any [`ObjectHandle`].
//! Keys and certificates describe themselves through
//! [`ObjectHandle::to_attribute_map`]; an identity is a pairing of one
//! certificate handle and one key handle and is never stored as a single
//! record, so it has no attribute map of its own.

use crate::error::{Error, Result};
use crate::item_class::ItemClass;
use crate::value::{attr, AttributeMap};

/// Default key class for keys that do not state one.
pub const DEFAULT_KEY_CLASS: &str = "private";

/// Token context of a token-resident object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBinding {
    /// Identifier of the token hosting the object.
    pub token_id: String,
    /// Token-assigned object identifier.
    pub object_id: Vec<u8>,
}

impl TokenBinding {
    /// Create a new binding.
    #[must_use]
    pub fn new(token_id: impl Into<String>, object_id: impl Into<Vec<u8>>) -> Self {
        Self {
            token_id: token_id.into(),
            object_id: object_id.into(),
        }
    }
}

/// A key handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyHandle {
    attributes: AttributeMap,
    data: Option<Vec<u8>>,
    token: Option<TokenBinding>,
}

impl KeyHandle {
    /// Create a key handle from its descriptive attributes.
    #[must_use]
    pub const fn new(attributes: AttributeMap) -> Self {
        Self {
            attributes,
            data: None,
            token: None,
        }
    }

    /// Attach the key's external representation.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Mark the key as resident on a token.
    #[must_use]
    pub fn with_token(mut self, token: TokenBinding) -> Self {
        self.token = Some(token);
        self
    }

    /// The key's application label (hash of its public key).
    #[must_use]
    pub fn application_label(&self) -> Option<&[u8]> {
        self.attributes.get_data(attr::APPLICATION_LABEL)
    }

    /// Token context, if the key lives on a token.
    #[must_use]
    pub const fn token(&self) -> Option<&TokenBinding> {
        self.token.as_ref()
    }

    /// The key's attributes.
    #[must_use]
    pub const fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    fn to_attribute_map(&self) -> AttributeMap {
        let mut map = self.attributes.clone();
        map.insert(attr::CLASS, ItemClass::Key);
        if !map.contains_key(attr::KEY_CLASS) {
            map.insert(attr::KEY_CLASS, DEFAULT_KEY_CLASS);
        }
        if let Some(data) = &self.data {
            map.insert(attr::VALUE_DATA, data.clone());
        }
        if let Some(token) = &self.token {
            map.insert(attr::TOKEN_ID, token.token_id.as_str());
        }
        map
    }
}

/// A certificate handle.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateHandle {
    der: Vec<u8>,
    attributes: AttributeMap,
}

impl CertificateHandle {
    /// Create a certificate handle from its DER bytes and parsed attributes
    /// (issuer, serial number, public key hash, subject).
    #[must_use]
    pub fn new(der: impl Into<Vec<u8>>, attributes: AttributeMap) -> Self {
        Self {
            der: der.into(),
            attributes,
        }
    }

    /// The DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Hash of the certified public key.
    #[must_use]
    pub fn public_key_hash(&self) -> Option<&[u8]> {
        self.attributes.get_data(attr::PUBLIC_KEY_HASH)
    }

    fn to_attribute_map(&self) -> AttributeMap {
        let mut map = self.attributes.clone();
        map.insert(attr::CLASS, ItemClass::Certificate);
        map.insert(attr::VALUE_DATA, self.der.clone());
        map
    }
}

/// A certificate paired with its private key.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityHandle {
    certificate: CertificateHandle,
    key: KeyHandle,
}

impl IdentityHandle {
    /// Pair a certificate with its key.
    #[must_use]
    pub const fn new(certificate: CertificateHandle, key: KeyHandle) -> Self {
        Self { certificate, key }
    }

    /// The certificate half.
    #[must_use]
    pub const fn certificate(&self) -> &CertificateHandle {
        &self.certificate
    }

    /// The key half.
    #[must_use]
    pub const fn key(&self) -> &KeyHandle {
        &self.key
    }
}

/// Polymorphic object handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectHandle {
    /// A key.
    Key(KeyHandle),
    /// A certificate.
    Certificate(CertificateHandle),
    /// A certificate and key pair.
    Identity(IdentityHandle),
}

impl ObjectHandle {
    /// The item class this handle refers to.
    #[must_use]
    pub const fn class(&self) -> ItemClass {
        match self {
            Self::Key(_) => ItemClass::Key,
            Self::Certificate(_) => ItemClass::Certificate,
            Self::Identity(_) => ItemClass::Identity,
        }
    }

    /// The identity, if this handle is one.
    #[must_use]
    pub const fn as_identity(&self) -> Option<&IdentityHandle> {
        match self {
            Self::Identity(identity) => Some(identity),
            _ => None,
        }
    }

    /// Attributes describing the referenced item, including its class.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedReference` for identities, which are split into
    /// their halves before reaching this point.
    pub fn to_attribute_map(&self) -> Result<AttributeMap> {
        match self {
            Self::Key(key) => Ok(key.to_attribute_map()),
            Self::Certificate(cert) => Ok(cert.to_attribute_map()),
            Self::Identity(_) => Err(Error::unsupported_reference(
                "an identity cannot be described by a single attribute map",
            )),
        }
    }

    /// Build a live handle from an item record.
    ///
    /// Returns `Ok(None)` for password classes, which have no handle form.
    ///
    /// # Errors
    ///
    /// Returns a `Param` error if the record has no recognised class and a
    /// `Decode` error if a certificate record carries no certificate data.
    pub fn from_attributes(record: &AttributeMap, token: Option<TokenBinding>) -> Result<Option<Self>> {
        let class = record
            .class()
            .ok_or_else(|| Error::param("record has no recognised item class"))?;
        let mut attributes = record.item_attributes();
        attributes.remove(attr::VALUE_REF);
        attributes.remove(attr::VALUE_PERSISTENT_REF);
        attributes.remove(attr::CLASS);
        let data = attributes.remove(attr::VALUE_DATA);

        let handle = match class {
            ItemClass::Key => Self::Key(build_key(attributes, data, token)),
            ItemClass::Certificate => {
                let der = data
                    .as_ref()
                    .and_then(|d| d.as_data())
                    .ok_or_else(|| Error::decode("certificate record carries no data"))?;
                Self::Certificate(CertificateHandle::new(der, attributes))
            }
            ItemClass::Identity => {
                let cert_der = attributes
                    .remove(attr::IDENTITY_CERTIFICATE_DATA)
                    .and_then(|d| d.as_data().map(<[u8]>::to_vec))
                    .ok_or_else(|| Error::decode("identity record carries no certificate data"))?;
                attributes.remove(attr::IDENTITY_CERTIFICATE_TOKEN_ID);
                let cert_attrs = certificate_projection(&attributes);
                let certificate = CertificateHandle::new(cert_der, cert_attrs);
                Self::Identity(IdentityHandle::new(certificate, build_key(attributes, data, token)))
            }
            _ => return Ok(None),
        };
        Ok(Some(handle))
    }
}

fn build_key(
    attributes: AttributeMap,
    data: Option<crate::value::Value>,
    token: Option<TokenBinding>,
) -> KeyHandle {
    let mut key = KeyHandle::new(attributes);
    if let Some(bytes) = data.as_ref().and_then(|d| d.as_data()) {
        key = key.with_data(bytes);
    }
    if let Some(token) = token {
        key = key.with_token(token);
    }
    key
}

/// Certificate attributes an identity record carries alongside its key.
fn certificate_projection(attributes: &AttributeMap) -> AttributeMap {
    [attr::ISSUER, attr::SERIAL_NUMBER, attr::SUBJECT]
        .into_iter()
        .filter_map(|key| attributes.get(key).map(|v| (key.to_owned(), v.clone())))
        .chain(
            attributes
                .get(attr::APPLICATION_LABEL)
                .map(|v| (attr::PUBLIC_KEY_HASH.to_owned(), v.clone())),
        )
        .collect()
}
