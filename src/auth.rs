//! Local authentication boundary and the authentication retry engine.
//!
//! Operations that touch protected items may be rejected with
//! [`Error::AuthorizationNeeded`]. [`RetryEngine::run`] wraps such an
//! operation: it obtains an authentication context, asks the
//! [`Authenticator`] to evaluate every pending (access control, operation)
//! pair, records any newly bound access control, and tries again.
//!
//! ```text
//!   Attempt ──ok──────────────────────────────▶ Done
//!      │ authorization needed (non-empty pairs)
//!      ▼
//!   Resolve ──retries == MAX_AUTH_ATTEMPTS───▶ RetryLimitExceeded
//!      │ context ready
//!      ▼
//!   Evaluate (every pair) ──▶ Attempt
//! ```
//!
//! All state the loop mutates lives in an explicit [`AuthState`]; the
//! caller's maps are only ever borrowed.

use crate::access_control::{AccessControl, AclPair};
use crate::error::{Error, Result};
use crate::value::{attr, AttributeMap, CowMap, Value};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// Number of retries after the first attempt before the loop gives up.
pub const MAX_AUTH_ATTEMPTS: u32 = 20;

/// A live authentication context owned by an [`Authenticator`].
pub trait AuthContext: fmt::Debug + Send + Sync {
    /// Downcasting support for the provider that created the context.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a live authentication context.
///
/// Two handles are equal when they point at the same context.
#[derive(Clone)]
pub struct AuthContextHandle(Arc<dyn AuthContext>);

impl AuthContextHandle {
    /// Wrap a provider context.
    pub fn new(context: impl AuthContext + 'static) -> Self {
        Self(Arc::new(context))
    }

    /// Borrow the provider's concrete context type.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for AuthContextHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(&other.0).cast::<()>()
    }
}

impl fmt::Debug for AuthContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuthContextHandle").field(&self.0).finish()
    }
}

/// How prompting is handled for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthUi {
    /// Prompt when needed.
    #[default]
    Allow,
    /// Fail with interaction-not-allowed instead of prompting.
    Fail,
    /// Skip items that would need a prompt.
    Skip,
}

impl AuthUi {
    /// Parse the `u_AuthUI` attribute value.
    #[must_use]
    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            attr::AUTH_UI_ALLOW => Some(Self::Allow),
            attr::AUTH_UI_FAIL => Some(Self::Fail),
            attr::AUTH_UI_SKIP => Some(Self::Skip),
            _ => None,
        }
    }

    /// The `u_AuthUI` attribute value.
    #[must_use]
    pub const fn as_value(self) -> &'static str {
        match self {
            Self::Allow => attr::AUTH_UI_ALLOW,
            Self::Fail => attr::AUTH_UI_FAIL,
            Self::Skip => attr::AUTH_UI_SKIP,
        }
    }
}

/// Options handed to the authenticator for every evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOptions {
    /// Why the caller needs the item.
    pub reason: Option<String>,
    /// Who is asking.
    pub caller_name: Option<String>,
    /// Whether any UI may be shown.
    pub allow_ui: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            reason: None,
            caller_name: None,
            allow_ui: true,
        }
    }
}

impl PromptOptions {
    /// Resolve the options for one call, falling back to `defaults`.
    #[must_use]
    pub fn from_auth_params(auth: &AttributeMap, defaults: &Self) -> Self {
        let ui = auth
            .get_str(attr::USE_AUTH_UI)
            .and_then(AuthUi::from_value)
            .unwrap_or_default();
        Self {
            reason: auth
                .get_str(attr::USE_OPERATION_PROMPT)
                .map(str::to_owned)
                .or_else(|| defaults.reason.clone()),
            caller_name: auth
                .get_str(attr::USE_CALLER_NAME)
                .map(str::to_owned)
                .or_else(|| defaults.caller_name.clone()),
            allow_ui: defaults.allow_ui && ui == AuthUi::Allow,
        }
    }
}

/// The local authentication provider.
pub trait Authenticator: Send + Sync {
    /// Create a context, optionally resuming from a credential reference.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure.
    fn create_context(&self, credential: Option<&[u8]>) -> Result<AuthContextHandle>;

    /// Produce the portable credential reference for `context`.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure.
    fn externalize_context(&self, context: &AuthContextHandle) -> Result<Vec<u8>>;

    /// Evaluate `access_control` for `operation`, returning the updated
    /// access control when the provider changed it (e.g. bound it).
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, typically in the local
    /// authentication domain (user cancel, not interactive, ...).
    fn evaluate_and_update_acl(
        &self,
        context: &AuthContextHandle,
        access_control: &AccessControl,
        operation: &str,
        options: &PromptOptions,
    ) -> Result<Option<AccessControl>>;
}

static SHARED_AUTH_CONTEXT: OnceLock<SharedAuthContext> = OnceLock::new();

/// The context shared by every client in the process that enables
/// [`KeychainConfig::with_shared_auth_context`](crate::KeychainConfig::with_shared_auth_context).
#[must_use]
pub fn shared_auth_context() -> &'static SharedAuthContext {
    SHARED_AUTH_CONTEXT.get_or_init(SharedAuthContext::new)
}

/// Authentication context created on first use and then reused.
///
/// Creation is serialized, so concurrent first use from several threads
/// still creates exactly one context.
#[derive(Debug, Default)]
pub struct SharedAuthContext {
    cell: OnceLock<AuthContextHandle>,
    init: Mutex<()>,
}

impl SharedAuthContext {
    /// Create an uninitialized shared context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// The shared context, if it was already created.
    #[must_use]
    pub fn get(&self) -> Option<&AuthContextHandle> {
        self.cell.get()
    }

    /// Return the shared context, creating it through `authenticator` once.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's failure; a failed creation leaves the
    /// context uninitialized so a later call may try again.
    pub fn get_or_create(&self, authenticator: &dyn Authenticator) -> Result<AuthContextHandle> {
        if let Some(context) = self.cell.get() {
            return Ok(context.clone());
        }
        let _guard = self.init.lock();
        if let Some(context) = self.cell.get() {
            return Ok(context.clone());
        }
        let context = authenticator.create_context(None)?;
        debug!("created shared authentication context");
        Ok(self.cell.get_or_init(|| context).clone())
    }
}

/// State threaded through the retry loop.
#[derive(Debug, Clone)]
pub struct AuthState<'a> {
    /// Auth parameters: live context, credential reference, UI options.
    pub auth_params: CowMap<'a>,
    /// Attributes whose pending access control is replaced once bound.
    pub attributes: Option<CowMap<'a>>,
}

impl<'a> AuthState<'a> {
    /// State for an operation that writes `attributes`.
    #[must_use]
    pub const fn with_attributes(auth_params: CowMap<'a>, attributes: CowMap<'a>) -> Self {
        Self {
            auth_params,
            attributes: Some(attributes),
        }
    }

    /// State for an operation without attributes to bind.
    #[must_use]
    pub const fn query_only(auth_params: CowMap<'a>) -> Self {
        Self {
            auth_params,
            attributes: None,
        }
    }

    /// Auth parameters with the live context removed, as sent to the daemon.
    #[must_use]
    pub fn portable_auth(&self) -> AttributeMap {
        let mut portable = self.auth_params.clone().into_owned();
        portable.remove(attr::USE_AUTH_CONTEXT);
        portable
    }

    /// The current attributes, or an empty map.
    #[must_use]
    pub fn attributes(&self) -> CowMap<'_> {
        self.attributes
            .as_ref()
            .map_or_else(|| CowMap::owned(AttributeMap::new()), CowMap::reborrow)
    }
}

/// Drives the bounded authentication retry loop.
pub struct RetryEngine<'e> {
    authenticator: &'e dyn Authenticator,
    shared: Option<&'e SharedAuthContext>,
    defaults: &'e PromptOptions,
}

impl<'e> RetryEngine<'e> {
    /// Create an engine evaluating through `authenticator`.
    #[must_use]
    pub const fn new(authenticator: &'e dyn Authenticator, defaults: &'e PromptOptions) -> Self {
        Self {
            authenticator,
            shared: None,
            defaults,
        }
    }

    /// Reuse `shared` instead of creating a context per call.
    #[must_use]
    pub const fn with_shared_context(mut self, shared: &'e SharedAuthContext) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Run `op` until it succeeds, fails for another reason, or the
    /// iteration ceiling is reached.
    ///
    /// # Errors
    ///
    /// Propagates any failure other than authorization-needed, failures of
    /// the authenticator, and [`Error::RetryLimitExceeded`] once `op` was
    /// retried [`MAX_AUTH_ATTEMPTS`] times and is still rejected.
    pub fn run<T, F>(&self, state: &mut AuthState<'_>, mut op: F) -> Result<T>
    where
        F: FnMut(&AuthState<'_>) -> Result<T>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let acl_pairs = match op(&*state) {
                Ok(value) => return Ok(value),
                Err(Error::AuthorizationNeeded { acl_pairs }) if !acl_pairs.is_empty() => acl_pairs,
                Err(err) => return Err(err),
            };

            if attempts > MAX_AUTH_ATTEMPTS {
                error!(
                    attempts,
                    pairs = %describe(&acl_pairs),
                    "authorization still required after the maximum number of attempts"
                );
                return Err(Error::RetryLimitExceeded {
                    attempts,
                    acl_pairs,
                });
            }
            debug!(attempt = attempts, pending = acl_pairs.len(), "authorization needed");

            let context = self.ensure_context(state)?;
            let options = PromptOptions::from_auth_params(&state.auth_params, self.defaults);
            for pair in &acl_pairs {
                self.evaluate(state, &context, pair, &options)?;
            }
        }
    }

    fn ensure_context(&self, state: &mut AuthState<'_>) -> Result<AuthContextHandle> {
        if let Some(Value::AuthContext(context)) = state.auth_params.get(attr::USE_AUTH_CONTEXT) {
            return Ok(context.clone());
        }
        let credential = state
            .auth_params
            .get_data(attr::USE_CREDENTIAL_REF)
            .map(<[u8]>::to_vec);
        let context = match (&credential, self.shared) {
            (Some(credential), _) => self.authenticator.create_context(Some(credential.as_slice()))?,
            (None, Some(shared)) => shared.get_or_create(self.authenticator)?,
            (None, None) => self.authenticator.create_context(None)?,
        };
        if credential.is_none() {
            let credential = self.authenticator.externalize_context(&context)?;
            state.auth_params.insert(attr::USE_CREDENTIAL_REF, credential);
        }
        state
            .auth_params
            .insert(attr::USE_AUTH_CONTEXT, context.clone());
        Ok(context)
    }

    fn evaluate(
        &self,
        state: &mut AuthState<'_>,
        context: &AuthContextHandle,
        pair: &AclPair,
        options: &PromptOptions,
    ) -> Result<()> {
        let updated = self.authenticator.evaluate_and_update_acl(
            context,
            &pair.access_control,
            &pair.operation,
            options,
        )?;
        let (Some(updated), Some(attributes)) = (updated, state.attributes.as_mut()) else {
            return Ok(());
        };
        let replace = pair.is_bind_request()
            || (updated.is_bound() && attributes.contains_key(attr::ACCESS_CONTROL));
        if replace {
            debug!(operation = %pair.operation, "recording updated access control");
            attributes.insert(attr::ACCESS_CONTROL, updated.to_bytes()?);
        }
        Ok(())
    }
}

fn describe(acl_pairs: &[AclPair]) -> String {
    acl_pairs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::access_control::{operation, Requirement};
    use crate::error::{codes, ErrorDomain};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Ctx(u32);

    impl AuthContext for Ctx {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Recorder {
        created: AtomicU32,
        evaluated: AtomicU32,
        cancel: bool,
    }

    impl Authenticator for Recorder {
        fn create_context(&self, _credential: Option<&[u8]>) -> Result<AuthContextHandle> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(AuthContextHandle::new(Ctx(n)))
        }

        fn externalize_context(&self, context: &AuthContextHandle) -> Result<Vec<u8>> {
            Ok(vec![u8::try_from(context.downcast_ref::<Ctx>().unwrap().0).unwrap()])
        }

        fn evaluate_and_update_acl(
            &self,
            _context: &AuthContextHandle,
            access_control: &AccessControl,
            _operation: &str,
            _options: &PromptOptions,
        ) -> Result<Option<AccessControl>> {
            self.evaluated.fetch_add(1, Ordering::SeqCst);
            if self.cancel {
                return Err(Error::domain(
                    ErrorDomain::LocalAuthentication,
                    codes::local_auth::USER_CANCEL,
                    "cancelled",
                ));
            }
            Ok(Some(access_control.clone().into_bound()))
        }
    }

    fn guarded() -> AccessControl {
        AccessControl::new().with_constraint(operation::SIGN, Requirement::Biometric)
    }

    fn needs(op: &str) -> Error {
        Error::authorization_needed(vec![AclPair::new(guarded(), op)])
    }

    #[test]
    fn test_success_without_auth() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let value = engine.run(&mut state, |_| Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(auth.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_after_evaluation() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let value = engine
            .run(&mut state, |state| {
                if state.auth_params.contains_key(attr::USE_CREDENTIAL_REF) {
                    Ok("done")
                } else {
                    Err(needs(operation::SIGN))
                }
            })
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(auth.created.load(Ordering::SeqCst), 1);
        assert_eq!(auth.evaluated.load(Ordering::SeqCst), 1);
        assert!(state.auth_params.contains_key(attr::USE_AUTH_CONTEXT));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_bound_is_exactly_max_attempts() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let mut calls = 0u32;
        let err = engine
            .run::<(), _>(&mut state, |_| {
                calls += 1;
                Err(needs(operation::DECRYPT))
            })
            .unwrap_err();
        // The first attempt plus MAX_AUTH_ATTEMPTS retries.
        assert_eq!(calls, MAX_AUTH_ATTEMPTS + 1);
        assert!(err.is_retry_limit_exceeded());
        match err {
            Error::RetryLimitExceeded { attempts, acl_pairs } => {
                assert_eq!(attempts, MAX_AUTH_ATTEMPTS + 1);
                assert_eq!(acl_pairs.len(), 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The context is created once and reused across iterations.
        assert_eq!(auth.created.load(Ordering::SeqCst), 1);
        assert!(logs_contain("maximum number of attempts"));
    }

    #[test]
    fn test_empty_pairs_propagate() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let err = engine
            .run::<(), _>(&mut state, |_| Err(Error::authorization_needed(vec![])))
            .unwrap_err();
        assert!(err.is_authorization_needed());
        assert_eq!(auth.evaluated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_other_errors_propagate_immediately() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let err = engine
            .run::<(), _>(&mut state, |_| Err(Error::not_found("x")))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cancel_stops_loop() {
        let auth = Recorder {
            cancel: true,
            ..Recorder::default()
        };
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let mut state = AuthState::query_only(CowMap::owned(AttributeMap::new()));
        let err = engine
            .run::<(), _>(&mut state, |_| Err(needs(operation::SIGN)))
            .unwrap_err();
        assert_eq!(err.status(), crate::error::Status::UserCanceled);
    }

    #[test]
    fn test_bind_request_replaces_attribute() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let caller_attrs = AttributeMap::new().with(attr::ACCESS_CONTROL, guarded().to_bytes().unwrap());
        let mut state = AuthState::with_attributes(
            CowMap::owned(AttributeMap::new()),
            CowMap::borrowed(&caller_attrs),
        );
        engine
            .run(&mut state, |state| {
                let attrs = state.attributes();
                let ac = AccessControl::from_bytes(attrs.get_data(attr::ACCESS_CONTROL).unwrap())?;
                if ac.is_bound() {
                    Ok(())
                } else {
                    Err(Error::authorization_needed(vec![AclPair::new(ac, operation::BIND)]))
                }
            })
            .unwrap();
        let stored = state.attributes.unwrap();
        let ac = AccessControl::from_bytes(stored.get_data(attr::ACCESS_CONTROL).unwrap()).unwrap();
        assert!(ac.is_bound());
        // The caller's map is untouched.
        let original = AccessControl::from_bytes(caller_attrs.get_data(attr::ACCESS_CONTROL).unwrap()).unwrap();
        assert!(!original.is_bound());
    }

    #[test]
    fn test_existing_credential_is_resumed() {
        let auth = Recorder::default();
        let defaults = PromptOptions::default();
        let engine = RetryEngine::new(&auth, &defaults);
        let params = AttributeMap::new().with(attr::USE_CREDENTIAL_REF, vec![42u8]);
        let mut state = AuthState::query_only(CowMap::borrowed(&params));
        let mut first = true;
        engine
            .run(&mut state, |_| {
                if std::mem::take(&mut first) {
                    Err(needs(operation::SIGN))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(state.auth_params.get_data(attr::USE_CREDENTIAL_REF), Some([42u8].as_slice()));
    }

    #[test]
    fn test_shared_context_created_once() {
        let auth = Recorder::default();
        let shared = SharedAuthContext::new();
        let a = shared.get_or_create(&auth).unwrap();
        let b = shared.get_or_create(&auth).unwrap();
        assert_eq!(a, b);
        assert_eq!(auth.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_context_concurrent_first_use() {
        let auth = Recorder::default();
        let shared = SharedAuthContext::new();
        let handles: Vec<AuthContextHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| shared.get_or_create(&auth).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(auth.created.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_process_wide_context_is_one_instance() {
        let from_thread = std::thread::spawn(shared_auth_context).join().unwrap();
        assert!(std::ptr::eq(from_thread, shared_auth_context()));
    }

    #[test]
    fn test_prompt_options_resolution() {
        let defaults = PromptOptions {
            reason: Some("default reason".into()),
            caller_name: Some("app".into()),
            allow_ui: true,
        };
        let params = AttributeMap::new()
            .with(attr::USE_OPERATION_PROMPT, "Sign the document")
            .with(attr::USE_AUTH_UI, AuthUi::Fail.as_value());
        let options = PromptOptions::from_auth_params(&params, &defaults);
        assert_eq!(options.reason.as_deref(), Some("Sign the document"));
        assert_eq!(options.caller_name.as_deref(), Some("app"));
        assert!(!options.allow_ui);
    }

    #[test]
    fn test_auth_ui_values() {
        for ui in [AuthUi::Allow, AuthUi::Fail, AuthUi::Skip] {
            assert_eq!(AuthUi::from_value(ui.as_value()), Some(ui));
        }
        assert_eq!(AuthUi::from_value("bogus"), None);
    }
}
