//! Plugin identity and the handshake environment contract.

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Shared handshake token; a binary started without it is not a plugin.
pub const COOKIE_KEY: &str = "PROVISIO_PLUGIN_COOKIE";
pub const COOKIE_VALUE: &str = "3f6b2c1e-provisio-driver-plugin";

pub const DRIVER_NAME_KEY: &str = "PROVISIO_DRIVER_NAME";
pub const DRIVER_VERSION_KEY: &str = "PROVISIO_DRIVER_VERSION";
pub const DRIVER_ID_KEY: &str = "PROVISIO_DRIVER_ID";

/// Set only when the supervisor re-invokes its own executable.
pub const BUILTIN_KEY: &str = "PROVISIO_BUILTIN_PLUGIN";

/// Which driver a plugin process serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub version: String,
    pub id: i64,
}

impl PluginIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>, id: i64) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            id,
        }
    }

    /// Variables the supervisor adds to the plugin's environment.
    pub fn handshake_env(&self, builtin: bool) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (COOKIE_KEY, COOKIE_VALUE.to_string()),
            (DRIVER_NAME_KEY, self.name.clone()),
            (DRIVER_VERSION_KEY, self.version.clone()),
            (DRIVER_ID_KEY, self.id.to_string()),
        ];
        if builtin {
            vars.push((BUILTIN_KEY, "true".to_string()));
        }
        vars
    }
}

impl std::fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.version, self.id)
    }
}

/// The plugin-side view of the handshake environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    pub identity: PluginIdentity,
    pub builtin: bool,
}

impl PluginEnv {
    /// Read the handshake variables of the current process.
    pub fn from_env() -> PluginResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> PluginResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(COOKIE_KEY).as_deref() != Some(COOKIE_VALUE) {
            return Err(PluginError::Protocol(
                "missing plugin handshake cookie; this binary must be launched by a provisio supervisor"
                    .to_string(),
            ));
        }
        let name = lookup(DRIVER_NAME_KEY)
            .ok_or_else(|| PluginError::Protocol(format!("{DRIVER_NAME_KEY} not set")))?;
        let version = lookup(DRIVER_VERSION_KEY).unwrap_or_default();
        let id = match lookup(DRIVER_ID_KEY) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                PluginError::Protocol(format!("{DRIVER_ID_KEY} is not numeric: {raw}"))
            })?,
            None => 0,
        };
        let builtin = lookup(BUILTIN_KEY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            identity: PluginIdentity::new(name, version, id),
            builtin,
        })
    }
}

/// `true` when this process was started as a self re-invoked built-in plugin.
pub fn is_builtin_invocation() -> bool {
    std::env::var(BUILTIN_KEY)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&'static str, String> = vars.into_iter().collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_handshake_env_round_trips_through_plugin_env() {
        let identity = PluginIdentity::new("shell", "1.0.0", 7);
        let env = PluginEnv::from_lookup(lookup(identity.handshake_env(true))).unwrap();
        assert_eq!(env.identity, identity);
        assert!(env.builtin);
    }

    #[test]
    fn test_builtin_flag_only_for_self_reinvocation() {
        let identity = PluginIdentity::new("k8s", "2", 1);
        let vars = identity.handshake_env(false);
        assert!(vars.iter().all(|(k, _)| *k != BUILTIN_KEY));
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn test_missing_cookie_rejected() {
        let err = PluginEnv::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, PluginError::Protocol(_)));
    }

    #[test]
    fn test_display_tag() {
        assert_eq!(
            PluginIdentity::new("fabric", "2.2", 3).to_string(),
            "fabric@2.2#3"
        );
    }
}
