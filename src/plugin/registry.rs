//! Ordered plugin registries with per-plugin enable flags.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::{Converter, Parser, Plugin};

struct PluginEntry<P: ?Sized> {
    plugin: Arc<P>,
    enabled: bool,
}

/// Name and enabled flag of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub name: String,
    pub enabled: bool,
}

/// A registration-ordered collection of plugins.
///
/// Plugins can be enabled or disabled at runtime; disabled plugins stay in
/// place so re-enabling restores their original position.
pub struct PluginRegistry<P: ?Sized + Plugin> {
    entries: RwLock<Vec<PluginEntry<P>>>,
}

/// Registry of site parsers.
pub type ParserRegistry = PluginRegistry<dyn Parser>;

/// Registry of output converters.
pub type ConverterRegistry = PluginRegistry<dyn Converter>;

impl<P: ?Sized + Plugin> PluginRegistry<P> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Registers a plugin, enabled.
    ///
    /// Returns `false` and keeps the existing entry if the name is taken.
    #[tracing::instrument(skip(self, plugin), fields(plugin_name = plugin.name()))]
    pub fn register(&self, plugin: Arc<P>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.plugin.name() == plugin.name()) {
            warn!("Duplicate plugin name, keeping the first registration");
            return false;
        }
        debug!(position = entries.len(), "Registering plugin");
        entries.push(PluginEntry {
            plugin,
            enabled: true,
        });
        true
    }

    /// Enables or disables a plugin by name. Returns `false` if unknown.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|e| e.plugin.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                debug!(plugin = name, enabled, "Plugin toggled");
                true
            }
            None => false,
        }
    }

    /// Returns whether `name` is registered and enabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.enabled && e.plugin.name() == name)
    }

    /// Enabled plugins, in registration order.
    #[must_use]
    pub fn enabled(&self) -> Vec<Arc<P>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.enabled)
            .map(|e| Arc::clone(&e.plugin))
            .collect()
    }

    /// Every plugin with its flag, in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| PluginStatus {
                name: e.plugin.name().to_string(),
                enabled: e.enabled,
            })
            .collect()
    }

    /// Returns the number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PluginRegistry<dyn Parser> {
    /// Returns the first enabled parser that can handle `url`.
    #[must_use]
    pub fn find(&self, url: &str) -> Option<Arc<dyn Parser>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.enabled && e.plugin.can_handle(url))
            .map(|e| Arc::clone(&e.plugin))
    }
}

impl<P: ?Sized + Plugin> Default for PluginRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ?Sized + Plugin> fmt::Debug for PluginRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.statuses())
            .finish()
    }
}
