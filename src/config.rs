//! Client configuration.

use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

/// How the client reacts when the server announces a protocol version with no
/// exactly matching codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Use the closest known codec and log a warning.
    #[default]
    Lenient,
    /// Refuse the connection.
    Strict,
}

impl FromStr for VersionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" => Ok(VersionPolicy::Lenient),
            "strict" => Ok(VersionPolicy::Strict),
            other => Err(format!(
                "Unknown protocol policy '{}', expected 'lenient' or 'strict'",
                other
            )),
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::Lenient => write!(f, "lenient"),
            VersionPolicy::Strict => write!(f, "strict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub version_policy: VersionPolicy,
    /// Name of the connection worker thread.
    pub thread_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version_policy: VersionPolicy::default(),
            thread_name: Self::DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl ClientConfig {
    /// Environment variable selecting the [`VersionPolicy`].
    pub const PROTOCOL_POLICY_ENV: &'static str = "DRIFT_INSPECTOR_PROTOCOL_POLICY";

    /// Environment variable overriding the worker thread name.
    pub const THREAD_NAME_ENV: &'static str = "DRIFT_INSPECTOR_THREAD_NAME";

    const DEFAULT_THREAD_NAME: &'static str = "drift-inspector";

    pub fn with_version_policy(mut self, policy: VersionPolicy) -> Self {
        self.version_policy = policy;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Defaults overridden by environment variables.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::PROTOCOL_POLICY_ENV) {
            match value.parse::<VersionPolicy>() {
                Ok(policy) => {
                    info!("Using protocol policy from {}: {}", Self::PROTOCOL_POLICY_ENV, policy);
                    config.version_policy = policy;
                }
                Err(e) => warn!("{}", e),
            }
        }

        if let Some(name) = lookup(Self::THREAD_NAME_ENV) {
            if !name.trim().is_empty() {
                config.thread_name = name;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.version_policy, VersionPolicy::Lenient);
        assert_eq!(config.thread_name, "drift-inspector");
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("STRICT".parse::<VersionPolicy>(), Ok(VersionPolicy::Strict));
        assert_eq!(" lenient ".parse::<VersionPolicy>(), Ok(VersionPolicy::Lenient));
        assert!("sloppy".parse::<VersionPolicy>().is_err());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ClientConfig::PROTOCOL_POLICY_ENV, "strict"),
            (ClientConfig::THREAD_NAME_ENV, "inspector-worker"),
        ]));
        assert_eq!(config.version_policy, VersionPolicy::Strict);
        assert_eq!(config.thread_name, "inspector-worker");
    }

    #[test]
    fn test_invalid_lookup_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ClientConfig::PROTOCOL_POLICY_ENV, "whatever"),
            (ClientConfig::THREAD_NAME_ENV, "  "),
        ]));
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::default()
            .with_version_policy(VersionPolicy::Strict)
            .with_thread_name("t");
        assert_eq!(config.version_policy, VersionPolicy::Strict);
        assert_eq!(config.thread_name, "t");
    }
}
