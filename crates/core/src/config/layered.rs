//! Ordered key/value lookup across configuration layers.
//!
//! Lookups walk the layers in order and return the first non-empty value.
//! The orchestrator builds one [`LayeredConfig`] per operation pass:
//! trigger options, then step outputs, then environment, then the shared
//! `[settings]` table, then the caller's default.

use std::collections::BTreeMap;
use std::sync::Arc;

/// A single source of configuration values.
pub trait ConfigProvider: Send + Sync {
    /// Layer name for diagnostics.
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Option<String>;
}

/// A fixed map of values.
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    name: String,
    values: BTreeMap<String, String>,
}

impl MapProvider {
    pub fn new(name: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

impl ConfigProvider for MapProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Reads `<prefix><KEY>` from the process environment, with the key
/// upper-cased and dots replaced by underscores.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    prefix: String,
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace(['.', '-'], "_"))
    }
}

impl ConfigProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

/// An ordered list of providers; earlier layers win.
#[derive(Clone, Default)]
pub struct LayeredConfig {
    layers: Vec<Arc<dyn ConfigProvider>>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer with lower precedence than every existing one.
    pub fn with_layer(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.layers.push(provider);
        self
    }

    /// First non-empty value across layers.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        self.resolve(key).map(|(_, value)| value)
    }

    /// First non-empty value across layers, or `default`.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.get_opt(key).unwrap_or_else(|| default.to_string())
    }

    /// Name of the layer that supplies `key`, if any.
    pub fn source_of(&self, key: &str) -> Option<&str> {
        self.layers
            .iter()
            .find(|layer| layer.get(key).is_some_and(|v| !v.trim().is_empty()))
            .map(|layer| layer.name())
    }

    fn resolve(&self, key: &str) -> Option<(&str, String)> {
        self.layers.iter().find_map(|layer| {
            layer
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (layer.name(), v))
        })
    }
}

impl std::fmt::Debug for LayeredConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.layers.iter().map(|l| l.name()).collect();
        f.debug_struct("LayeredConfig").field("layers", &names).finish()
    }
}
