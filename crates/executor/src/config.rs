//! Configuration for the executor service.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::NamespacePolicy;
use crate::signature::SignatureVerifier;

/// Executor service configuration.
///
/// Built once at startup and handed to each component explicitly.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,
    /// Shared secret for request signatures.
    pub signing_secret: Option<String>,
    /// Namespaces remediations may target.
    pub allowed_namespaces: Vec<String>,
    /// Loki base URL for audit forwarding. Forwarding is off when unset.
    pub loki_url: Option<String>,
    /// Upper bound on a single Loki push.
    pub sink_timeout: Duration,
    /// Upper bound on a single cluster operation.
    pub dispatch_timeout: Duration,
    /// Maximum skew between a request timestamp and now (`None` disables the check).
    pub signature_max_age: Option<Duration>,
    /// Whether `POST /executor/signature` is served.
    pub signing_endpoint_enabled: bool,
    /// Interval of the background self-healing pass (`None` disables the loop).
    pub self_healing_interval: Option<Duration>,
    /// How far back the self-healing pass looks.
    pub self_healing_window: Duration,
    /// Postgres connection string for the audit store.
    pub database_url: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("allowed_namespaces", &self.allowed_namespaces)
            .field("loki_url", &self.loki_url)
            .field("sink_timeout", &self.sink_timeout)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .field("signature_max_age", &self.signature_max_age)
            .field("signing_endpoint_enabled", &self.signing_endpoint_enabled)
            .field("self_healing_interval", &self.self_healing_interval)
            .field("self_healing_window", &self.self_healing_window)
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            signing_secret: None,
            allowed_namespaces: Vec::new(),
            loki_url: None,
            sink_timeout: Duration::from_millis(2000),
            dispatch_timeout: Duration::from_secs(30),
            signature_max_age: Some(Duration::from_secs(300)),
            signing_endpoint_enabled: true,
            self_healing_interval: Some(Duration::from_secs(300)),
            self_healing_window: Duration::from_secs(60 * 60),
            database_url: None,
        }
    }
}

impl Config {
    /// Load configuration from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u64>().ok());
        // Zero switches the feature off
        let optional_secs = |key: &str, default: Option<Duration>| match number(key) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default,
        };

        Self {
            port: non_empty("EXECUTOR_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.port),
            signing_secret: non_empty("EXECUTOR_SIGNING_SECRET"),
            allowed_namespaces: get("ALLOWED_NAMESPACES")
                .map(|s| {
                    s.split(',')
                        .map(|ns| ns.trim().to_string())
                        .filter(|ns| !ns.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            loki_url: non_empty("LOKI_URL"),
            sink_timeout: number("LOKI_TIMEOUT_MS")
                .map_or(defaults.sink_timeout, Duration::from_millis),
            dispatch_timeout: number("DISPATCH_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map_or(defaults.dispatch_timeout, Duration::from_secs),
            signature_max_age: optional_secs("SIGNATURE_MAX_AGE_SECS", defaults.signature_max_age),
            signing_endpoint_enabled: get("SIGNING_ENDPOINT_ENABLED")
                .map_or(defaults.signing_endpoint_enabled, |v| {
                    v == "true" || v == "1"
                }),
            self_healing_interval: optional_secs(
                "SELF_HEALING_INTERVAL_SECS",
                defaults.self_healing_interval,
            ),
            self_healing_window: number("SELF_HEALING_WINDOW_MINS")
                .filter(|mins| *mins > 0)
                .map_or(defaults.self_healing_window, |mins| {
                    Duration::from_secs(mins * 60)
                }),
            database_url: non_empty("DATABASE_URL"),
        }
    }

    /// Build the signature verifier. Fails closed without a secret.
    pub fn verifier(&self) -> Result<SignatureVerifier, ConfigError> {
        self.signing_secret
            .as_deref()
            .map(SignatureVerifier::new)
            .ok_or(ConfigError::Missing("EXECUTOR_SIGNING_SECRET"))
    }

    #[must_use]
    pub fn namespace_policy(&self) -> NamespacePolicy {
        NamespacePolicy::new(self.allowed_namespaces.iter().cloned())
    }

    /// Reject combinations that cannot run safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_secret.is_none() {
            return Err(ConfigError::Missing("EXECUTOR_SIGNING_SECRET"));
        }
        if let Some(url) = &self.loki_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    key: "LOKI_URL",
                    reason: format!("'{url}' is not an http(s) URL"),
                });
            }
        }
        Ok(())
    }
}
