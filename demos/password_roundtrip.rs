//! Password Round-Trip Example
//!
//! Stores a password guarded by user presence, reads it back through the
//! authentication retry loop, then deletes it. Everything runs against the
//! in-memory daemon and authenticator.
//!
//! Run with: `RUST_LOG=secitem=debug cargo run --example password_roundtrip`

use secitem::access_control::operation;
use secitem::memory::{InMemoryAuthenticator, InMemoryDaemon};
use secitem::value::attr;
use secitem::{AccessControl, AttributeMap, ItemClass, Keychain, KeychainConfig, LastError, Requirement};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), secitem::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║          SECITEM - Password Round-Trip Demo                ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let authenticator = Arc::new(InMemoryAuthenticator::new());
    let keychain = Keychain::new(Arc::new(InMemoryDaemon::new()), authenticator.clone())
        .with_config(KeychainConfig::new().with_caller_name("password_roundtrip"));

    // Store a guarded password
    println!("Adding password for alice@mail.example.com...");
    let guard = AccessControl::new().with_constraint(operation::DECRYPT, Requirement::UserPresence);
    let pref = keychain.add(
        &AttributeMap::new()
            .with(attr::CLASS, ItemClass::GenericPassword)
            .with(attr::SERVICE, "mail.example.com")
            .with(attr::ACCOUNT, "alice")
            .with(attr::ACCESS_CONTROL, guard)
            .with(attr::VALUE_DATA, b"correct horse battery staple".as_slice())
            .with(attr::RETURN_PERSISTENT_REF, true),
    )?;
    if let Some(pref) = pref.as_ref().and_then(secitem::Value::as_data) {
        println!("✓ Stored, persistent reference: {}", hex(pref));
    }
    println!();

    // Read it back
    println!("Reading password...");
    let secret = keychain.copy_matching(
        &AttributeMap::new()
            .with(attr::CLASS, ItemClass::GenericPassword)
            .with(attr::SERVICE, "mail.example.com")
            .with(attr::RETURN_DATA, true)
            .with(attr::USE_OPERATION_PROMPT, "Read your mail password"),
    )?;
    if let Some(secret) = secret.as_ref().and_then(secitem::Value::as_data) {
        println!("✓ Password: {}", String::from_utf8_lossy(secret));
    }
    for (pair, options) in authenticator.evaluations() {
        println!(
            "  evaluated {} (prompt: {})",
            pair,
            options.reason.as_deref().unwrap_or("-")
        );
    }
    println!();

    // Delete and confirm through the status-code surface
    println!("Deleting password...");
    keychain.delete(&AttributeMap::new().with(attr::CLASS, ItemClass::GenericPassword))?;
    let mut last = LastError::new();
    let (status, _) = last.settle(keychain.copy_matching(
        &AttributeMap::new().with(attr::CLASS, ItemClass::GenericPassword),
    ));
    println!("✓ Lookup after delete: status {status}");
    if let Some(err) = last.get() {
        println!("  {err}");
    }
    println!();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                    Demo Complete                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
