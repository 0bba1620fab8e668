use serde::{Deserialize, Serialize};

/// Tagged document form of an encoded argument, result, or event.
///
/// Every value crossing the wire is carried as a `MsgPack` value so the
/// transport never needs to know the concrete Rust type behind it.
pub type Element = rmpv::Value;

/// Authenticated caller identity.
///
/// Supplied by the transport's identity accessor; the core never validates
/// credentials itself, it only compares the granted roles and policies with
/// the lists precomputed on an operation blueprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Named policies this principal satisfies.
    #[serde(default)]
    pub policies: Vec<String>,
}

impl Principal {
    /// Creates a principal with no roles or policies.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Adds roles to the principal.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Adds satisfied policies to the principal.
    #[must_use]
    pub fn with_policies<I, S>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policies.extend(policies.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    #[must_use]
    pub fn has_policy(&self, policy: &str) -> bool {
        self.policies.iter().any(|p| p == policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_builders_accumulate() {
        let principal = Principal::new("alice")
            .with_roles(["admin", "ops"])
            .with_policies(["can-subscribe"]);

        assert_eq!(principal.id, "alice");
        assert!(principal.has_role("ops"));
        assert!(!principal.has_role("guest"));
        assert!(principal.has_policy("can-subscribe"));
    }

    #[test]
    fn principal_deserializes_without_optional_lists() {
        let principal: Principal = serde_json::from_str(r#"{"id":"bob"}"#).unwrap();
        assert_eq!(principal, Principal::new("bob"));
    }
}
