//! Token Key Example
//!
//! Creates a key on an in-memory token with a biometric signing constraint.
//! The first attempt is refused until the access control is bound, the
//! retry loop binds it, and the key is stored as a token-backed item.
//!
//! Run with: `RUST_LOG=secitem=debug cargo run --example token_key`

use secitem::access_control::operation;
use secitem::memory::{InMemoryAuthenticator, InMemoryDaemon, InMemoryTokenProvider};
use secitem::value::attr;
use secitem::{AccessControl, AttributeMap, ItemClass, Keychain, ObjectHandle, Requirement, Value};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), secitem::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              SECITEM - Token Key Demo                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let tokens = Arc::new(InMemoryTokenProvider::new());
    let authenticator = Arc::new(InMemoryAuthenticator::new());
    let keychain = Keychain::new(Arc::new(InMemoryDaemon::new()), authenticator.clone())
        .with_token_provider(tokens.clone());

    println!("Creating key on token \"demo-token\"...");
    let added = keychain.add(
        &AttributeMap::new()
            .with(attr::CLASS, ItemClass::Key)
            .with(attr::TOKEN_ID, "demo-token")
            .with(attr::LABEL, "Demo Signing Key")
            .with(
                attr::ACCESS_CONTROL,
                AccessControl::new().with_constraint(operation::SIGN, Requirement::Biometric),
            )
            .with(attr::RETURN_ATTRIBUTES, true),
    )?;
    println!("✓ Token now holds {} object(s)", tokens.object_count("demo-token"));
    if let Some(Value::AccessControl(ac)) = added.as_ref().and_then(Value::as_map).and_then(|m| m.get(attr::ACCESS_CONTROL)) {
        println!("  access control: {ac}");
    }
    println!("  authentication rounds: {}", authenticator.evaluations().len());
    println!();

    println!("Looking up key handle...");
    let found = keychain.copy_matching(
        &AttributeMap::new()
            .with(attr::CLASS, ItemClass::Key)
            .with(attr::TOKEN_ID, "demo-token")
            .with(attr::RETURN_REF, true),
    )?;
    let handle = found
        .as_ref()
        .and_then(Value::as_map)
        .and_then(|m| m.get(attr::VALUE_REF))
        .and_then(Value::as_object);
    if let Some(ObjectHandle::Key(key)) = handle {
        if let Some(binding) = key.token() {
            println!("✓ Key lives on token {}", binding.token_id);
        }
    }
    println!("  token value reads: {}", tokens.data_reads("demo-token"));
    println!();

    println!("Deleting key...");
    keychain.delete(
        &AttributeMap::new()
            .with(attr::CLASS, ItemClass::Key)
            .with(attr::TOKEN_ID, "demo-token"),
    )?;
    println!("✓ Token now holds {} object(s)", tokens.object_count("demo-token"));
    println!();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                    Demo Complete                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    Ok(())
}
