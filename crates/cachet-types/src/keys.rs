//! Storage key derivation.
//!
//! Every session owns three keys that share a Redis Cluster hash tag so the
//! lock script can touch all of them in one slot:
//!
//! ```text
//! {<app>_<id>}_Data   serialized session state
//! {<app>_<id>}_Lock   write-lock token
//! {<app>_<id>}_Meta   session timeout in seconds
//! ```
//!
//! The application name may not contain `_`, `{` or `}`. Session ids are
//! free-form; `%` and `}` are percent-escaped so an id can never close the
//! hash tag early. With those two rules the mapping from
//! `(app, id, kind)` to key is injective.
//!
//! Output-cache entries use `<app>_<key>`. Those can never collide with a
//! session key because an application name never starts with `{`.

use crate::error::ConfigError;

const FORBIDDEN_APP_CHARS: [char; 3] = ['_', '{', '}'];

/// The three keys that make up one session record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKeys {
    pub data: String,
    pub lock: String,
    pub meta: String,
}

/// Derives storage keys for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespacer {
    application_name: String,
}

impl KeyNamespacer {
    /// Create a namespacer, rejecting application names that would break
    /// key injectivity.
    pub fn new(application_name: impl Into<String>) -> Result<Self, ConfigError> {
        let application_name = application_name.into();
        validate_application_name(&application_name)?;
        Ok(Self { application_name })
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Keys for a session.
    pub fn keys(&self, session_id: &str) -> SessionKeys {
        let tag = format!("{{{}_{}}}", self.application_name, escape_id(session_id));
        SessionKeys {
            data: format!("{tag}_Data"),
            lock: format!("{tag}_Lock"),
            meta: format!("{tag}_Meta"),
        }
    }

    /// Key for an output-cache entry.
    pub fn cache_key(&self, key: &str) -> String {
        format!("{}_{}", self.application_name, key)
    }
}

/// Check that an application name can be used as a key prefix.
pub fn validate_application_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "application_name".into(),
            message: "must not be empty".into(),
        });
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_APP_CHARS.contains(c)) {
        return Err(ConfigError::InvalidValue {
            key: "application_name".into(),
            message: format!("must not contain '{c}'"),
        });
    }
    Ok(())
}

fn escape_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '}' => out.push_str("%7D"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ns(app: &str) -> KeyNamespacer {
        KeyNamespacer::new(app).unwrap()
    }

    #[test]
    fn key_layout() {
        let keys = ns("shop").keys("abc123");
        assert_eq!(keys.data, "{shop_abc123}_Data");
        assert_eq!(keys.lock, "{shop_abc123}_Lock");
        assert_eq!(keys.meta, "{shop_abc123}_Meta");
    }

    #[test]
    fn deterministic() {
        assert_eq!(ns("shop").keys("s1"), ns("shop").keys("s1"));
    }

    #[test]
    fn cache_key_layout() {
        assert_eq!(ns("shop").cache_key("/home?x=1"), "shop_/home?x=1");
    }

    #[test]
    fn rejects_separator_in_app_name() {
        for bad in ["", "a_b", "a{b", "b}"] {
            assert!(
                matches!(
                    KeyNamespacer::new(bad),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn braces_in_session_id_are_escaped() {
        let keys = ns("app").keys("x}_Lock");
        assert_eq!(keys.data, "{app_x%7D_Lock}_Data");
        // Only one closing brace, at the end of the hash tag
        assert_eq!(keys.data.matches('}').count(), 1);
    }

    #[test]
    fn escaping_is_injective() {
        // "%7D" literally vs "}" must not map to the same key
        let a = ns("app").keys("%7D");
        let b = ns("app").keys("}");
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn injective_across_apps_and_ids() {
        let apps = ["a", "ab", "a-b", "b"];
        let ids = ["", "_", "b", "b_c", "c", "_c", "}", "%", "%25", "a_b"];
        let mut seen = HashSet::new();
        for app in apps {
            let namespacer = ns(app);
            for id in ids {
                let keys = namespacer.keys(id);
                for key in [keys.data, keys.lock, keys.meta, namespacer.cache_key(id)] {
                    assert!(seen.insert(key.clone()), "collision on {key}");
                }
            }
        }
    }
}
