//! Namespace allow-list enforcement.

use std::collections::BTreeSet;
use tracing::warn;

/// Allow-list of namespaces the executor may act within.
///
/// Matching is exact and case-sensitive. An empty list permits nothing.
#[derive(Debug, Clone, Default)]
pub struct NamespacePolicy {
    allowed: BTreeSet<String>,
}

impl NamespacePolicy {
    /// Create a policy from explicit namespace names.
    #[must_use]
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: BTreeSet<String> = namespaces
            .into_iter()
            .map(Into::into)
            .filter(|ns| !ns.is_empty())
            .collect();

        if allowed.is_empty() {
            warn!("Namespace allow-list is empty - every remediation will be rejected");
        }

        Self { allowed }
    }

    /// Parse a comma-separated list such as `"default, aegis"`.
    #[must_use]
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim))
    }

    #[must_use]
    pub fn is_allowed(&self, namespace: &str) -> bool {
        self.allowed.contains(namespace)
    }

    /// Allowed namespaces in sorted order.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}
