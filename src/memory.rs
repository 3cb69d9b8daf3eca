//! In-memory daemon, token provider and authenticator.
//!
//! These implement the collaborator traits without any platform service so
//! the client can be exercised end to end in tests and demos. They model
//! just enough of the real services:
//!
//! - [`InMemoryDaemon`] keeps rows per class with per-class uniqueness,
//!   answers with storage-domain errors, joins certificates and keys into
//!   identity records, and rejects value reads of items whose access control
//!   guards decryption unless a credential reference is presented.
//! - [`InMemoryTokenProvider`] hosts token objects and reports
//!   "authentication failed" for guarded operations of sessions opened
//!   without a credential.
//! - [`InMemoryAuthenticator`] binds every access control it evaluates and
//!   refuses guarded operations when UI is not allowed.

use crate::access_control::{operation, AccessControl, AclPair};
use crate::auth::{AuthContext, AuthContextHandle, AuthUi, Authenticator, PromptOptions};
use crate::daemon::{DaemonClient, Request, Verb};
use crate::error::{codes, Error, ErrorDomain, Result};
use crate::item_class::ItemClass;
use crate::persistent_ref::PersistentRef;
use crate::token::{Token, TokenProvider};
use crate::value::{attr, AttributeMap, Value};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

fn storage_error(code: i64, message: &str) -> Error {
    Error::domain(ErrorDomain::Storage, code, message)
}

fn token_error(code: i64, message: impl Into<String>) -> Error {
    Error::domain(ErrorDomain::Token, code, message)
}

/// Attributes that make an item unique within its class.
fn primary_key(class: ItemClass) -> &'static [&'static str] {
    match class {
        ItemClass::GenericPassword => &[attr::ACCOUNT, attr::SERVICE, attr::ACCESS_GROUP],
        ItemClass::InternetPassword | ItemClass::AppleSharePassword => &[
            attr::ACCOUNT,
            attr::SERVER,
            attr::PROTOCOL,
            attr::PORT,
            attr::ACCESS_GROUP,
        ],
        ItemClass::Certificate => &[attr::ISSUER, attr::SERIAL_NUMBER, attr::ACCESS_GROUP],
        ItemClass::Key => &[
            attr::APPLICATION_LABEL,
            attr::APPLICATION_TAG,
            attr::KEY_CLASS,
            attr::TOKEN_ID,
            attr::ACCESS_GROUP,
        ],
        ItemClass::Identity => &[],
    }
}

#[derive(Debug, Clone)]
struct Row {
    class: ItemClass,
    row_id: u64,
    attributes: AttributeMap,
}

impl Row {
    fn matches(&self, query: &AttributeMap) -> bool {
        query.iter().all(|(key, value)| {
            if attr::is_option(key) || key == attr::CLASS {
                return true;
            }
            if key == attr::VALUE_PERSISTENT_REF {
                return value
                    .as_data()
                    .and_then(|bytes| PersistentRef::decode(bytes).ok())
                    .is_some_and(|pref| pref.class == self.class && pref.row_id == self.row_id);
            }
            self.attributes.get(key) == Some(value)
        })
    }

    fn same_item(&self, class: ItemClass, attributes: &AttributeMap) -> bool {
        self.class == class
            && primary_key(class)
                .iter()
                .all(|key| self.attributes.get(key) == attributes.get(key))
    }

    /// The acl pair guarding value reads, if any.
    fn read_guard(&self) -> Option<AclPair> {
        let ac = AccessControl::from_bytes(self.attributes.get_data(attr::ACCESS_CONTROL)?).ok()?;
        ac.requires_authentication_for(operation::DECRYPT)
            .then(|| AclPair::new(ac, operation::DECRYPT))
    }

    fn reply(&self, request: &AttributeMap) -> Option<Value> {
        let want_data = request.flag(attr::RETURN_DATA);
        let want_attrs = request.flag(attr::RETURN_ATTRIBUTES);
        let want_pref = request.flag(attr::RETURN_PERSISTENT_REF);
        if !(want_data || want_attrs || want_pref) {
            return None;
        }
        let mut record = if want_attrs {
            let mut attributes = self.attributes.clone();
            attributes.remove(attr::VALUE_DATA);
            attributes
        } else {
            AttributeMap::new()
        };
        record.insert(attr::CLASS, self.class);
        let token_item = self.attributes.contains_key(attr::TOKEN_ID);
        if want_data || (want_attrs && token_item) {
            if let Some(value) = self.attributes.get(attr::VALUE_DATA) {
                record.insert(attr::VALUE_DATA, value.clone());
            }
        }
        if want_pref {
            let pref = PersistentRef::new(self.class, self.row_id).encode();
            record.insert(attr::VALUE_PERSISTENT_REF, pref.as_slice());
        }
        Some(Value::Map(record))
    }
}

#[derive(Debug, Default)]
struct Store {
    next_row: u64,
    rows: Vec<Row>,
    calls: Vec<Verb>,
}

impl Store {
    fn insert(&mut self, class: ItemClass, attributes: AttributeMap) -> Row {
        self.next_row += 1;
        let row = Row {
            class,
            row_id: self.next_row,
            attributes,
        };
        self.rows.push(row.clone());
        row
    }

    /// Certificate and key rows joined on `pkhh == klbl`.
    fn identities(&self) -> Vec<Row> {
        let keys: Vec<&Row> = self.rows.iter().filter(|r| r.class == ItemClass::Key).collect();
        let mut identities = Vec::new();
        for cert in self.rows.iter().filter(|r| r.class == ItemClass::Certificate) {
            let Some(hash) = cert.attributes.get(attr::PUBLIC_KEY_HASH) else {
                continue;
            };
            for key in keys
                .iter()
                .filter(|k| k.attributes.get(attr::APPLICATION_LABEL) == Some(hash))
            {
                let mut attributes = key.attributes.clone();
                for name in [attr::ISSUER, attr::SERIAL_NUMBER, attr::SUBJECT, attr::PUBLIC_KEY_HASH] {
                    if let Some(value) = cert.attributes.get(name) {
                        attributes.insert(name, value.clone());
                    }
                }
                if let Some(der) = cert.attributes.get(attr::VALUE_DATA) {
                    attributes.insert(attr::IDENTITY_CERTIFICATE_DATA, der.clone());
                }
                if let Some(token_id) = cert.attributes.get(attr::TOKEN_ID) {
                    attributes.insert(attr::IDENTITY_CERTIFICATE_TOKEN_ID, token_id.clone());
                }
                identities.push(Row {
                    class: ItemClass::Identity,
                    row_id: cert.row_id,
                    attributes,
                });
            }
        }
        identities
    }
}

fn required_class(map: &AttributeMap) -> Result<ItemClass> {
    map.class()
        .ok_or_else(|| Error::param("request has no recognised item class"))
}

fn stored_attributes(attributes: &AttributeMap) -> AttributeMap {
    let mut item = attributes.item_attributes();
    item.remove(attr::CLASS);
    item.remove(attr::VALUE_REF);
    item.remove(attr::VALUE_PERSISTENT_REF);
    item
}

fn match_limit(query: &AttributeMap) -> Option<usize> {
    match query.get(attr::MATCH_LIMIT) {
        Some(Value::String(all)) if all == attr::MATCH_LIMIT_ALL => None,
        Some(Value::Number(n)) => Some(usize::try_from(*n).unwrap_or(1).max(1)),
        _ => Some(1),
    }
}

/// Item-store daemon kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDaemon {
    store: Mutex<Store>,
}

impl InMemoryDaemon {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().rows.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verbs received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Verb> {
        self.store.lock().calls.clone()
    }

    /// Stored attributes of every row of `class`.
    #[must_use]
    pub fn records(&self, class: ItemClass) -> Vec<AttributeMap> {
        self.store
            .lock()
            .rows
            .iter()
            .filter(|row| row.class == class)
            .map(|row| row.attributes.clone())
            .collect()
    }

    fn add(store: &mut Store, attributes: &AttributeMap) -> Result<Option<Value>> {
        let class = required_class(attributes)?;
        if class == ItemClass::Identity {
            return Err(Error::param("identities are stored as a certificate and a key"));
        }
        let item = stored_attributes(attributes);
        if let Some(bytes) = item.get_data(attr::ACCESS_CONTROL) {
            let ac = AccessControl::from_bytes(bytes)?;
            if ac.requires_authentication() && !ac.is_bound() {
                return Err(Error::authorization_needed(vec![AclPair::new(ac, operation::BIND)]));
            }
        }
        if store.rows.iter().any(|row| row.same_item(class, &item)) {
            return Err(storage_error(codes::storage::CONSTRAINT, "item already exists"));
        }
        let row = store.insert(class, item);
        debug!(class = %class, row_id = row.row_id, "stored item");
        Ok(row.reply(attributes))
    }

    fn copy_matching(store: &Store, query: &AttributeMap, auth: &AttributeMap) -> Result<Option<Value>> {
        let class = required_class(query)?;
        let candidates = if class == ItemClass::Identity {
            store.identities()
        } else {
            store.rows.iter().filter(|r| r.class == class).cloned().collect()
        };
        let mut matches: Vec<&Row> = candidates.iter().filter(|row| row.matches(query)).collect();

        if query.flag(attr::RETURN_DATA) && !auth.contains_key(attr::USE_CREDENTIAL_REF) {
            let ui = auth
                .get_str(attr::USE_AUTH_UI)
                .and_then(AuthUi::from_value)
                .unwrap_or_default();
            if ui == AuthUi::Skip {
                matches.retain(|row| row.read_guard().is_none());
            } else {
                let guards: Vec<AclPair> = matches.iter().filter_map(|row| row.read_guard()).collect();
                if !guards.is_empty() {
                    return Err(Error::authorization_needed(guards));
                }
            }
        }
        if matches.is_empty() {
            return Err(storage_error(codes::storage::NOTFOUND, "no matching item"));
        }

        let limit = match_limit(query);
        let mut records = matches
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|row| row.reply(query));
        if limit == Some(1) {
            return Ok(records.next());
        }
        let records: Vec<Value> = records.collect();
        Ok((!records.is_empty()).then_some(Value::Array(records)))
    }

    fn update(store: &mut Store, query: &AttributeMap, changes: &AttributeMap) -> Result<Option<Value>> {
        let class = required_class(query)?;
        let changes = stored_attributes(changes);
        let mut updated = 0usize;
        for row in store
            .rows
            .iter_mut()
            .filter(|r| r.class == class && r.matches(query))
        {
            for (key, value) in changes.iter() {
                row.attributes.insert(key, value.clone());
            }
            updated += 1;
        }
        if updated == 0 {
            return Err(storage_error(codes::storage::NOTFOUND, "no matching item"));
        }
        debug!(class = %class, updated, "updated items");
        Ok(None)
    }

    fn delete(store: &mut Store, query: &AttributeMap) -> Result<Option<Value>> {
        let class = required_class(query)?;
        let before = store.rows.len();
        store
            .rows
            .retain(|row| !(row.class == class && row.matches(query)));
        let deleted = before - store.rows.len();
        if deleted == 0 {
            return Err(storage_error(codes::storage::NOTFOUND, "no matching item"));
        }
        debug!(class = %class, deleted, "deleted items");
        Ok(None)
    }

    fn update_token_items(store: &mut Store, token_id: &str, items: &[AttributeMap]) -> Result<Option<Value>> {
        store
            .rows
            .retain(|row| row.attributes.get_str(attr::TOKEN_ID) != Some(token_id));
        for item in items {
            let class = required_class(item)?;
            store.insert(class, stored_attributes(item));
        }
        Ok(None)
    }
}

impl DaemonClient for InMemoryDaemon {
    fn call(&self, request: Request<'_>) -> Result<Option<Value>> {
        let mut store = self.store.lock();
        store.calls.push(request.verb());
        match request {
            Request::Add { attributes, .. } => Self::add(&mut store, attributes),
            Request::CopyMatching { query, auth } => Self::copy_matching(&store, query, auth),
            Request::Update { query, attributes, .. } => Self::update(&mut store, query, attributes),
            Request::Delete { query, .. } => Self::delete(&mut store, query),
            Request::DeleteAll => {
                store.rows.clear();
                Ok(None)
            }
            Request::DeleteItemsForGroups { groups } => {
                store.rows.retain(|row| {
                    row.attributes
                        .get_str(attr::ACCESS_GROUP)
                        .map_or(true, |group| !groups.iter().any(|g| g == group))
                });
                Ok(None)
            }
            Request::UpdateTokenItems { token_id, items } => Self::update_token_items(&mut store, token_id, items),
            Request::RollKeys { force } => {
                debug!(force, "rolled class keys");
                Ok(Some(Value::Bool(true)))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct TokenObject {
    value: Vec<u8>,
    access_control: AccessControl,
}

#[derive(Debug, Default)]
struct TokenObjects {
    next_object: u64,
    objects: BTreeMap<Vec<u8>, TokenObject>,
}

#[derive(Debug)]
struct TokenStore {
    creation_access_control: AccessControl,
    objects: Mutex<TokenObjects>,
    data_reads: AtomicUsize,
}

/// Token provider whose tokens live in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTokenProvider {
    tokens: Mutex<HashMap<String, Arc<TokenStore>>>,
    creation_access_control: AccessControl,
}

impl InMemoryTokenProvider {
    /// Create a provider whose tokens create unguarded objects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Access control given to objects created without one.
    #[must_use]
    pub fn with_creation_access_control(mut self, access_control: AccessControl) -> Self {
        self.creation_access_control = access_control;
        self
    }

    fn store(&self, token_id: &str) -> Option<Arc<TokenStore>> {
        self.tokens.lock().get(token_id).cloned()
    }

    /// Number of objects on `token_id`.
    #[must_use]
    pub fn object_count(&self, token_id: &str) -> usize {
        self.store(token_id)
            .map_or(0, |store| store.objects.lock().objects.len())
    }

    /// Number of value reads served by `token_id`.
    #[must_use]
    pub fn data_reads(&self, token_id: &str) -> usize {
        self.store(token_id)
            .map_or(0, |store| store.data_reads.load(Ordering::SeqCst))
    }
}

impl TokenProvider for InMemoryTokenProvider {
    fn create_token(&self, token_id: &str, params: &AttributeMap) -> Result<Arc<dyn Token>> {
        let store = Arc::clone(self.tokens.lock().entry(token_id.to_owned()).or_insert_with(|| {
            Arc::new(TokenStore {
                creation_access_control: self.creation_access_control.clone(),
                objects: Mutex::new(TokenObjects::default()),
                data_reads: AtomicUsize::new(0),
            })
        }));
        Ok(Arc::new(TokenSession {
            token_id: token_id.to_owned(),
            store,
            authenticated: params.contains_key(attr::USE_CREDENTIAL_REF),
        }))
    }
}

struct TokenSession {
    token_id: String,
    store: Arc<TokenStore>,
    authenticated: bool,
}

impl TokenSession {
    fn object(&self, object_id: &[u8]) -> Result<TokenObject> {
        self.store
            .objects
            .lock()
            .objects
            .get(object_id)
            .cloned()
            .ok_or_else(|| token_error(codes::token::OBJECT_NOT_FOUND, "no such token object"))
    }

    fn authorize(&self, object: &TokenObject, operation: &str) -> Result<()> {
        if object.access_control.requires_authentication_for(operation) && !self.authenticated {
            return Err(token_error(
                codes::token::AUTHENTICATION_FAILED,
                format!("{operation} requires authentication"),
            ));
        }
        Ok(())
    }
}

impl Token for TokenSession {
    fn token_id(&self) -> &str {
        &self.token_id
    }

    fn create_or_update_object(&self, object_id: Option<&[u8]>, attributes: &AttributeMap) -> Result<Vec<u8>> {
        let access_control = attributes
            .get_data(attr::ACCESS_CONTROL)
            .map(AccessControl::from_bytes)
            .transpose()?;
        let mut objects = self.store.objects.lock();
        match object_id {
            None => {
                objects.next_object += 1;
                let id = format!("{}-obj-{}", self.token_id, objects.next_object).into_bytes();
                let value = attributes.get_data(attr::VALUE_DATA).map_or_else(
                    || format!("key-material-{}", objects.next_object).into_bytes(),
                    <[u8]>::to_vec,
                );
                let access_control = access_control
                    .unwrap_or_else(|| self.store.creation_access_control.clone())
                    .into_bound();
                objects.objects.insert(
                    id.clone(),
                    TokenObject {
                        value,
                        access_control,
                    },
                );
                Ok(id)
            }
            Some(id) => {
                let object = objects
                    .objects
                    .get_mut(id)
                    .ok_or_else(|| token_error(codes::token::OBJECT_NOT_FOUND, "no such token object"))?;
                if let Some(value) = attributes.get_data(attr::VALUE_DATA) {
                    object.value = value.to_vec();
                }
                if let Some(access_control) = access_control {
                    object.access_control = access_control;
                }
                Ok(id.to_vec())
            }
        }
    }

    fn delete_object(&self, object_id: &[u8]) -> Result<()> {
        let object = self.object(object_id)?;
        self.authorize(&object, operation::DELETE)?;
        self.store.objects.lock().objects.remove(object_id);
        Ok(())
    }

    fn copy_object_data(&self, object_id: &[u8]) -> Result<Vec<u8>> {
        let object = self.object(object_id)?;
        self.authorize(&object, operation::DECRYPT)?;
        self.store.data_reads.fetch_add(1, Ordering::SeqCst);
        Ok(object.value)
    }

    fn copy_object_access_control(&self, object_id: &[u8]) -> Result<AccessControl> {
        Ok(self.object(object_id)?.access_control)
    }

    fn copy_object_creation_access_control(&self, _attributes: &AttributeMap) -> Result<AccessControl> {
        Ok(self.store.creation_access_control.clone())
    }
}

/// Context created by [`InMemoryAuthenticator`].
#[derive(Debug)]
pub struct MemoryAuthContext {
    id: u64,
}

impl MemoryAuthContext {
    /// Context serial number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl AuthContext for MemoryAuthContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Authenticator that approves every evaluation it is allowed to prompt for.
#[derive(Debug, Default)]
pub struct InMemoryAuthenticator {
    contexts: AtomicU64,
    refuse: AtomicBool,
    evaluations: Mutex<Vec<(AclPair, PromptOptions)>>,
}

impl InMemoryAuthenticator {
    /// Create an approving authenticator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every evaluation fail as if the user cancelled.
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of contexts created.
    #[must_use]
    pub fn contexts_created(&self) -> u64 {
        self.contexts.load(Ordering::SeqCst)
    }

    /// Every evaluation so far with the options it was made under.
    #[must_use]
    pub fn evaluations(&self) -> Vec<(AclPair, PromptOptions)> {
        self.evaluations.lock().clone()
    }
}

impl Authenticator for InMemoryAuthenticator {
    fn create_context(&self, credential: Option<&[u8]>) -> Result<AuthContextHandle> {
        let id = self.contexts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(id, resumed = credential.is_some(), "created authentication context");
        Ok(AuthContextHandle::new(MemoryAuthContext { id }))
    }

    fn externalize_context(&self, context: &AuthContextHandle) -> Result<Vec<u8>> {
        let context = context.downcast_ref::<MemoryAuthContext>().ok_or_else(|| {
            Error::domain(
                ErrorDomain::LocalAuthentication,
                codes::local_auth::BAD_PARAMETER,
                "context was not created by this authenticator",
            )
        })?;
        Ok(format!("credential-{}", context.id).into_bytes())
    }

    fn evaluate_and_update_acl(
        &self,
        _context: &AuthContextHandle,
        access_control: &AccessControl,
        operation: &str,
        options: &PromptOptions,
    ) -> Result<Option<AccessControl>> {
        self.evaluations
            .lock()
            .push((AclPair::new(access_control.clone(), operation), options.clone()));
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::domain(
                ErrorDomain::LocalAuthentication,
                codes::local_auth::USER_CANCEL,
                "user cancelled authentication",
            ));
        }
        if operation != operation::BIND && access_control.requires_authentication_for(operation) && !options.allow_ui
        {
            return Err(Error::domain(
                ErrorDomain::LocalAuthentication,
                codes::local_auth::NOT_INTERACTIVE,
                "authentication needs UI but UI is not allowed",
            ));
        }
        Ok(Some(access_control.clone().into_bound()))
    }
}
