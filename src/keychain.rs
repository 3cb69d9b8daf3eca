//! The item-management client.
//!
//! [`Keychain`] is the public surface: add, look up, update and delete items.
//! Every operation normalizes the caller's maps, splits identities into
//! their halves, routes token-backed items through the token adapter and
//! runs the daemon request inside the authentication retry loop.
//!
//! # Example
//!
//! ```
//! use secitem::memory::{InMemoryAuthenticator, InMemoryDaemon};
//! use secitem::value::{attr, AttributeMap};
//! use secitem::{ItemClass, Keychain, Value};
//! use std::sync::Arc;
//!
//! let keychain = Keychain::new(
//!     Arc::new(InMemoryDaemon::new()),
//!     Arc::new(InMemoryAuthenticator::new()),
//! );
//! let item = AttributeMap::new()
//!     .with(attr::CLASS, ItemClass::GenericPassword)
//!     .with(attr::SERVICE, "mail")
//!     .with(attr::ACCOUNT, "alice")
//!     .with(attr::VALUE_DATA, b"hunter2".as_slice());
//! keychain.add(&item)?;
//!
//! let query = AttributeMap::new()
//!     .with(attr::CLASS, ItemClass::GenericPassword)
//!     .with(attr::SERVICE, "mail")
//!     .with(attr::RETURN_DATA, true);
//! assert_eq!(keychain.copy_matching(&query)?, Some(Value::Data(b"hunter2".to_vec())));
//! # Ok::<(), secitem::Error>(())
//! ```

use crate::auth::{shared_auth_context, AuthState, Authenticator, PromptOptions, RetryEngine};
use crate::config::KeychainConfig;
use crate::daemon::{DaemonClient, Request};
use crate::error::{Error, Result, Status};
use crate::identity;
use crate::item_class::ItemClass;
use crate::normalize::{normalize, Normalized, Purpose};
use crate::persistent_ref::PersistentRef;
use crate::shaper::{self, ResultShape};
use crate::token::{TokenCache, TokenItemAdapter, TokenProvider};
use crate::value::{attr, AttributeMap, CowMap, Value};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Client for the item store.
pub struct Keychain {
    daemon: Arc<dyn DaemonClient>,
    authenticator: Arc<dyn Authenticator>,
    tokens: Option<Arc<dyn TokenProvider>>,
    config: KeychainConfig,
    prompt_defaults: PromptOptions,
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keychain")
            .field("config", &self.config)
            .field("tokens", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

impl Keychain {
    /// Create a client with the default configuration and no token support.
    #[must_use]
    pub fn new(daemon: Arc<dyn DaemonClient>, authenticator: Arc<dyn Authenticator>) -> Self {
        let config = KeychainConfig::default();
        Self {
            daemon,
            authenticator,
            tokens: None,
            prompt_defaults: config.prompt_defaults(),
            config,
        }
    }

    /// Enable token-backed items.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: KeychainConfig) -> Self {
        self.prompt_defaults = config.prompt_defaults();
        self.config = config;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &KeychainConfig {
        &self.config
    }

    fn engine(&self) -> RetryEngine<'_> {
        let engine = RetryEngine::new(self.authenticator.as_ref(), &self.prompt_defaults);
        if self.config.share_auth_context {
            engine.with_shared_context(shared_auth_context())
        } else {
            engine
        }
    }

    fn token_adapter(&self) -> Result<TokenItemAdapter<'_>> {
        let provider = self
            .tokens
            .as_deref()
            .ok_or_else(|| Error::status_error(Status::NotAvailable, "no token provider configured"))?;
        Ok(TokenItemAdapter::new(provider, self.daemon.as_ref()))
    }

    fn normalize<'a>(&self, map: &'a AttributeMap, purpose: Purpose) -> Result<Normalized<'a>> {
        normalize(CowMap::borrowed(map), purpose, self.authenticator.as_ref())
    }

    fn shape(&self, raw: Option<Value>, shape: ResultShape, auth: &AttributeMap) -> Result<Option<Value>> {
        match raw {
            Some(raw) if !shape.is_empty() => {
                let mut tokens = TokenCache::new(self.tokens.as_deref(), auth);
                shaper::shape(raw, shape, &mut tokens).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Add an item.
    ///
    /// Returns the new item shaped by the `r_*` flags of `attributes`, or
    /// `None` when none were given.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateItem` when an equal item exists, `Param` for
    /// malformed attributes, and any daemon, token or authentication failure.
    #[instrument(level = "debug", skip_all, fields(class = ?attributes.class()))]
    pub fn add(&self, attributes: &AttributeMap) -> Result<Option<Value>> {
        let shape = ResultShape::from_query(attributes);
        if let Some(identity) = identity::identity_in(attributes) {
            debug!("splitting identity add");
            return identity::add_identity(attributes, identity, shape, |half| self.add_one(half, shape));
        }
        self.add_one(attributes, shape)
    }

    fn add_one(&self, attributes: &AttributeMap, shape: ResultShape) -> Result<Option<Value>> {
        let Normalized {
            mut attributes,
            auth_params,
        } = self.normalize(attributes, Purpose::Add)?;
        if let Some(group) = &self.config.default_access_group {
            if !attributes.contains_key(attr::ACCESS_GROUP) {
                attributes.insert(attr::ACCESS_GROUP, group.as_str());
            }
        }
        shape.daemon_request().write_to(attributes.to_mut());
        let token_id = attributes.get_str(attr::TOKEN_ID).map(str::to_owned);

        let mut state = AuthState::with_attributes(CowMap::owned(auth_params), attributes);
        let raw = self.engine().run(&mut state, |state| match &token_id {
            Some(token_id) => self.token_adapter()?.add(state, token_id),
            None => self.daemon.call(Request::Add {
                attributes: &state.attributes(),
                auth: &state.portable_auth(),
            }),
        })?;
        self.shape(raw, shape, &state.portable_auth())
    }

    /// Look up items.
    ///
    /// Returns the matches shaped by the `r_*` flags of `query`: a single
    /// result by default, an array when `m_Limit` is above one or
    /// `m_LimitAll`, and `None` when no return flag was given.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` when nothing matches, and any daemon, token or
    /// authentication failure.
    #[instrument(level = "debug", skip_all, fields(class = ?query.class()))]
    pub fn copy_matching(&self, query: &AttributeMap) -> Result<Option<Value>> {
        let shape = ResultShape::from_query(query);
        let query = match identity::identity_in(query) {
            Some(identity) => Cow::Owned(identity::identity_query(query, identity)?),
            None => Cow::Borrowed(query),
        };
        let Normalized {
            attributes: mut search,
            auth_params,
        } = self.normalize(&query, Purpose::Query)?;
        shape.daemon_request().write_to(search.to_mut());

        let mut state = AuthState::query_only(CowMap::owned(auth_params));
        self.engine().run(&mut state, |state| {
            let auth = state.portable_auth();
            let raw = self.daemon.call(Request::CopyMatching {
                query: &search,
                auth: &auth,
            })?;
            self.shape(raw, shape, &auth)
        })
    }

    /// Apply `attributes_to_update` to every item matching `query`.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` when nothing matches, and any daemon, token or
    /// authentication failure.
    #[instrument(level = "debug", skip_all, fields(class = ?query.class()))]
    pub fn update(&self, query: &AttributeMap, attributes_to_update: &AttributeMap) -> Result<()> {
        if let Some(identity) = identity::identity_in(query) {
            debug!("splitting identity update");
            return identity::update_identity(query, identity, |half| {
                self.update_one(half, attributes_to_update)
            });
        }
        self.update_one(query, attributes_to_update)
    }

    fn update_one(&self, query: &AttributeMap, attributes_to_update: &AttributeMap) -> Result<()> {
        let Normalized {
            attributes: query,
            mut auth_params,
        } = self.normalize(query, Purpose::Query)?;
        let Normalized {
            attributes: changes,
            auth_params: change_auth,
        } = self.normalize(attributes_to_update, Purpose::Update)?;
        auth_params.merge_under(change_auth);
        let token_id = query.get_str(attr::TOKEN_ID).map(str::to_owned);

        let mut state = AuthState::with_attributes(CowMap::owned(auth_params), changes);
        self.engine().run(&mut state, |state| match &token_id {
            Some(token_id) => self.token_adapter()?.update(state, &query, token_id),
            None => self
                .daemon
                .call(Request::Update {
                    query: &query,
                    attributes: &state.attributes(),
                    auth: &state.portable_auth(),
                })
                .map(drop),
        })
    }

    /// Delete every item matching `query`.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` when nothing matches, and any daemon, token or
    /// authentication failure.
    #[instrument(level = "debug", skip_all, fields(class = ?query.class()))]
    pub fn delete(&self, query: &AttributeMap) -> Result<()> {
        if let Some(identity) = identity::identity_in(query) {
            debug!("splitting identity delete");
            return identity::delete_identity(
                query,
                identity,
                |half| self.delete_one(half),
                |label| self.is_certified(label),
            );
        }
        if let Some(pref) = query.get_data(attr::VALUE_PERSISTENT_REF) {
            let pref = PersistentRef::decode(pref)?;
            if pref.class == ItemClass::Identity {
                debug!(row_id = pref.row_id, "deleting identity by persistent reference");
                return identity::delete_identity_ref(
                    query,
                    pref,
                    |half| self.delete_one(half),
                    |cert| self.certificate_key_label(cert),
                    |label| self.is_certified(label),
                );
            }
        } else if query.class() == Some(ItemClass::Identity) {
            debug!("deleting identities as certificates and keys");
            return identity::delete_identity_class(query, |half| self.delete_one(half));
        }
        self.delete_one(query)
    }

    fn delete_one(&self, query: &AttributeMap) -> Result<()> {
        let Normalized {
            attributes: query,
            auth_params,
        } = self.normalize(query, Purpose::Query)?;
        let token_id = query.get_str(attr::TOKEN_ID).map(str::to_owned);

        let mut state = AuthState::query_only(CowMap::owned(auth_params));
        self.engine().run(&mut state, |state| match &token_id {
            Some(token_id) => self.token_adapter()?.delete(state, &query, token_id),
            None => self
                .daemon
                .call(Request::Delete {
                    query: &query,
                    auth: &state.portable_auth(),
                })
                .map(drop),
        })
    }

    /// Public key hash of the certificate matching `certificate`.
    fn certificate_key_label(&self, certificate: &AttributeMap) -> Result<Option<Vec<u8>>> {
        let query = certificate.clone().with(attr::RETURN_ATTRIBUTES, true);
        let found = self.daemon.call(Request::CopyMatching {
            query: &query,
            auth: &AttributeMap::new(),
        })?;
        Ok(found
            .as_ref()
            .and_then(Value::as_map)
            .and_then(|record| record.get_data(attr::PUBLIC_KEY_HASH))
            .map(<[u8]>::to_vec))
    }

    /// Whether a stored certificate certifies the key with `label`.
    fn is_certified(&self, label: &[u8]) -> Result<bool> {
        let query = AttributeMap::new()
            .with(attr::CLASS, ItemClass::Certificate)
            .with(attr::PUBLIC_KEY_HASH, label);
        match self.daemon.call(Request::CopyMatching {
            query: &query,
            auth: &AttributeMap::new(),
        }) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Replace the stored records of `token_id` with `items`.
    ///
    /// # Errors
    ///
    /// Returns normalization or daemon failures.
    #[instrument(level = "debug", skip(self, items), fields(count = items.len()))]
    pub fn update_token_items(&self, token_id: &str, items: &[AttributeMap]) -> Result<()> {
        let items = items
            .iter()
            .map(|item| {
                let mut normalized = self.normalize(item, Purpose::Add)?.attributes.into_owned();
                normalized.insert(attr::TOKEN_ID, token_id);
                Ok(normalized)
            })
            .collect::<Result<Vec<_>>>()?;
        self.daemon
            .call(Request::UpdateTokenItems {
                token_id,
                items: &items,
            })
            .map(drop)
    }

    /// Delete every item of the caller.
    ///
    /// # Errors
    ///
    /// Returns the daemon's failure.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_all(&self) -> Result<()> {
        self.daemon.call(Request::DeleteAll).map(drop)
    }

    /// Delete every item in `groups`.
    ///
    /// # Errors
    ///
    /// Returns the daemon's failure.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_items_for_groups(&self, groups: &[String]) -> Result<()> {
        self.daemon
            .call(Request::DeleteItemsForGroups { groups })
            .map(drop)
    }

    /// Rotate the store's class keys. Returns whether a roll happened.
    ///
    /// # Errors
    ///
    /// Returns the daemon's failure.
    #[instrument(level = "debug", skip(self))]
    pub fn roll_keys(&self, force: bool) -> Result<bool> {
        let reply = self.daemon.call(Request::RollKeys { force })?;
        Ok(reply.and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::daemon::Verb;
    use crate::handle::{CertificateHandle, IdentityHandle, KeyHandle, ObjectHandle};
    use crate::memory::{InMemoryAuthenticator, InMemoryDaemon};
    use tracing_test::traced_test;

    fn keychain() -> (Keychain, Arc<InMemoryDaemon>) {
        let daemon = Arc::new(InMemoryDaemon::new());
        (Keychain::new(daemon.clone(), Arc::new(InMemoryAuthenticator::new())), daemon)
    }

    fn identity() -> IdentityHandle {
        IdentityHandle::new(
            CertificateHandle::new(
                vec![0x30, 0x00],
                AttributeMap::new()
                    .with(attr::PUBLIC_KEY_HASH, vec![1u8, 2])
                    .with(attr::SERIAL_NUMBER, vec![9u8]),
            ),
            KeyHandle::new(AttributeMap::new().with(attr::APPLICATION_LABEL, vec![1u8, 2])),
        )
    }

    #[test]
    fn test_debug_hides_collaborators() {
        let (keychain, _) = keychain();
        let text = format!("{keychain:?}");
        assert!(text.starts_with("Keychain"));
        assert!(text.contains("tokens: false"));
    }

    #[traced_test]
    #[test]
    fn test_identity_update_touches_both_halves() {
        let (keychain, daemon) = keychain();
        let handle = AttributeMap::new().with(attr::VALUE_REF, ObjectHandle::Identity(identity()));
        keychain.add(&handle).unwrap();
        keychain
            .update(&handle, &AttributeMap::new().with(attr::LABEL, "renamed"))
            .unwrap();

        for class in [ItemClass::Certificate, ItemClass::Key] {
            let records = daemon.records(class);
            assert_eq!(records[0].get_str(attr::LABEL), Some("renamed"));
        }
        assert!(logs_contain("splitting identity update"));
    }

    #[test]
    fn test_bulk_verbs_reach_daemon() {
        let (keychain, daemon) = keychain();
        assert!(keychain.roll_keys(true).unwrap());
        keychain.delete_all().unwrap();
        keychain.delete_items_for_groups(&[]).unwrap();
        assert_eq!(
            daemon.calls(),
            vec![Verb::RollKeys, Verb::DeleteAll, Verb::DeleteItemsForGroups]
        );
    }

    #[test]
    fn test_token_item_needs_provider() {
        let (keychain, daemon) = keychain();
        let err = keychain
            .delete(
                &AttributeMap::new()
                    .with(attr::CLASS, ItemClass::Key)
                    .with(attr::TOKEN_ID, "tok"),
            )
            .unwrap_err();
        assert_eq!(err.status(), Status::NotAvailable);
        assert!(daemon.calls().is_empty());
    }
}
