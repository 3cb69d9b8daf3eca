//! Certificate evaluation policies and their daemon wire form.

use crate::error::{codes, Error, ErrorDomain, Result};
use crate::value::{AttributeMap, Value};

/// Wire key of the policy identifier.
pub const WIRE_OID: &str = "policyOid";
/// Wire key of the policy name.
pub const WIRE_NAME: &str = "policyName";
/// Wire key of the policy options.
pub const WIRE_OPTIONS: &str = "policyOptions";

/// A certificate evaluation policy used to filter certificate queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    oid: String,
    name: Option<String>,
    options: AttributeMap,
}

impl Policy {
    /// Create a policy for the given identifier.
    #[must_use]
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            name: None,
            options: AttributeMap::new(),
        }
    }

    /// Set the policy name (e.g. a host name for SSL policies).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a policy option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key, value);
        self
    }

    /// The policy identifier.
    #[must_use]
    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// Marshal into the plain map form the daemon accepts.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if an option holds a live object that
    /// cannot cross the RPC boundary.
    pub fn to_wire(&self) -> Result<Value> {
        let mut wire = AttributeMap::new().with(WIRE_OID, self.oid.as_str());
        if let Some(name) = &self.name {
            wire.insert(WIRE_NAME, name.as_str());
        }
        if !self.options.is_empty() {
            for (key, value) in self.options.iter() {
                ensure_plain(key, value)?;
            }
            wire.insert(WIRE_OPTIONS, self.options.clone());
        }
        Ok(Value::Map(wire))
    }
}

/// Marshal a policy or a list of policies into wire form.
///
/// # Errors
///
/// Returns a `Param` error if `value` is neither a policy nor a list of them.
pub fn policies_to_wire(value: &Value) -> Result<Value> {
    match value {
        Value::Policy(policy) => Ok(Value::Array(vec![policy.to_wire()?])),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Policy(policy) => policy.to_wire(),
                _ => Err(Error::param("policy list contains a non-policy value")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        _ => Err(Error::param("match policy must be a policy or a list of policies")),
    }
}

fn ensure_plain(key: &str, value: &Value) -> Result<()> {
    match value {
        Value::Bool(_) | Value::Number(_) | Value::Data(_) | Value::String(_) => Ok(()),
        Value::Array(items) => items.iter().try_for_each(|v| ensure_plain(key, v)),
        Value::Map(map) => map.iter().try_for_each(|(k, v)| ensure_plain(k, v)),
        _ => Err(Error::domain(
            ErrorDomain::Serialization,
            codes::serialization::UNSUPPORTED_OBJECT,
            format!("policy option {key:?} cannot be marshalled"),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::access_control::AccessControl;
    use crate::error::Status;

    #[test]
    fn test_wire_form() {
        let policy = Policy::new("1.2.840.113635.100.1.3")
            .with_name("example.com")
            .with_option("revocation", true);
        let wire = policy.to_wire().unwrap();
        let map = wire.as_map().unwrap();
        assert_eq!(map.get_str(WIRE_OID), Some("1.2.840.113635.100.1.3"));
        assert_eq!(map.get_str(WIRE_NAME), Some("example.com"));
        assert!(map.get(WIRE_OPTIONS).unwrap().as_map().unwrap().flag("revocation"));
    }

    #[test]
    fn test_single_policy_becomes_list() {
        let wire = policies_to_wire(&Value::Policy(Policy::new("1.2.3"))).unwrap();
        assert_eq!(wire.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_list_of_policies() {
        let list = Value::Array(vec![Policy::new("1").into(), Policy::new("2").into()]);
        assert_eq!(policies_to_wire(&list).unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_live_option_rejected() {
        let policy = Policy::new("1").with_option("acl", AccessControl::new());
        assert_eq!(policy.to_wire().unwrap_err().status(), Status::Param);
    }

    #[test]
    fn test_non_policy_rejected() {
        assert!(policies_to_wire(&Value::from("nope")).is_err());
        assert!(policies_to_wire(&Value::Array(vec![Value::Bool(true)])).is_err());
    }
}
