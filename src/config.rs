//! Client configuration.
//!
//! # Example
//!
//! ```
//! use secitem::KeychainConfig;
//!
//! let config = KeychainConfig::new()
//!     .with_caller_name("Mail")
//!     .with_operation_prompt("Mail wants to read your password")
//!     .with_default_access_group("com.example.mail");
//! assert!(config.allow_ui);
//! assert!(!config.share_auth_context);
//! ```

use crate::auth::PromptOptions;

/// Settings applied to every operation of a [`crate::Keychain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainConfig {
    /// Caller name shown in prompts when a call does not supply one.
    pub caller_name: Option<String>,
    /// Prompt reason used when a call does not supply one.
    pub default_operation_prompt: Option<String>,
    /// Whether authentication UI may be shown at all.
    pub allow_ui: bool,
    /// Reuse one process-wide auth context instead of one per call.
    pub share_auth_context: bool,
    /// Access group given to added items that do not name one.
    pub default_access_group: Option<String>,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainConfig {
    /// Configuration with UI allowed and per-call auth contexts.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            caller_name: None,
            default_operation_prompt: None,
            allow_ui: true,
            share_auth_context: false,
            default_access_group: None,
        }
    }

    /// Set the caller name.
    #[must_use]
    pub fn with_caller_name(mut self, name: impl Into<String>) -> Self {
        self.caller_name = Some(name.into());
        self
    }

    /// Set the default prompt reason.
    #[must_use]
    pub fn with_operation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_operation_prompt = Some(prompt.into());
        self
    }

    /// Allow or forbid authentication UI.
    #[must_use]
    pub const fn with_allow_ui(mut self, allow_ui: bool) -> Self {
        self.allow_ui = allow_ui;
        self
    }

    /// Share one auth context across calls.
    #[must_use]
    pub const fn with_shared_auth_context(mut self, share: bool) -> Self {
        self.share_auth_context = share;
        self
    }

    /// Set the default access group.
    #[must_use]
    pub fn with_default_access_group(mut self, group: impl Into<String>) -> Self {
        self.default_access_group = Some(group.into());
        self
    }

    /// Prompt defaults derived from this configuration.
    #[must_use]
    pub fn prompt_defaults(&self) -> PromptOptions {
        PromptOptions {
            reason: self.default_operation_prompt.clone(),
            caller_name: self.caller_name.clone(),
            allow_ui: self.allow_ui,
        }
    }
}
