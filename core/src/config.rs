//! Client configuration.

use serde::Deserialize;

use crate::paths::normalize_base;

/// Settings for one backend. Each `ResourceClient` owns its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application base URL, e.g. `https://acme.fatfractal.com/open/`.
    pub base_url: String,
    /// Load `ffRefs` targets after every create, update and read.
    pub auto_load_refs: bool,
    /// Send the session as `X-Ff-Auth-*` headers instead of relying on cookies.
    pub simulate_cookies: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            auto_load_refs: true,
            simulate_cookies: false,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base(base_url),
            ..Self::default()
        }
    }

    pub fn with_auto_load_refs(mut self, on: bool) -> Self {
        self.auto_load_refs = on;
        self
    }

    pub fn with_simulated_cookies(mut self, on: bool) -> Self {
        self.simulate_cookies = on;
        self
    }

    /// Read `FF_BASE_URL`, `FF_AUTO_LOAD_REFS` and `FF_SIMULATE_COOKIES`,
    /// falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| match lookup(key).as_deref() {
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            _ => default,
        };
        Self {
            base_url: normalize_base(&lookup("FF_BASE_URL").unwrap_or(defaults.base_url)),
            auto_load_refs: flag("FF_AUTO_LOAD_REFS", defaults.auto_load_refs),
            simulate_cookies: flag("FF_SIMULATE_COOKIES", defaults.simulate_cookies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn new_normalizes_the_base() {
        let c = ClientConfig::new("http://h/app");
        assert_eq!(c.base_url, "http://h/app/");
        assert!(c.auto_load_refs);
        assert!(!c.simulate_cookies);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("FF_BASE_URL", "https://x.example/secure"),
            ("FF_AUTO_LOAD_REFS", "false"),
            ("FF_SIMULATE_COOKIES", "1"),
        ]
        .into_iter()
        .collect();
        let c = ClientConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.base_url, "https://x.example/secure/");
        assert!(!c.auto_load_refs);
        assert!(c.simulate_cookies);
    }

    #[test]
    fn garbage_flags_fall_back() {
        let c = ClientConfig::from_lookup(|k| (k == "FF_AUTO_LOAD_REFS").then(|| "maybe".to_string()));
        assert!(c.auto_load_refs);
        assert_eq!(c.base_url, "http://localhost:8080/");
    }

    #[test]
    fn deserializes_with_defaults() {
        let c: ClientConfig = serde_json::from_str(r#"{"simulate_cookies": true}"#).unwrap();
        assert!(c.simulate_cookies);
        assert!(c.auto_load_refs);
    }
}
