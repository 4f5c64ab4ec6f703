//! Layered settings with explicit override tokens
//!
//! Settings are a base key/value map plus an ordered stack of override layers.
//! Lookups walk the layers top-down and fall back to the base map.
//!
//! An override is built with [`SettingsOverride::builder`], then enabled and
//! disabled explicitly. Each enabled override owns exactly one layer, so
//! disabling one override removes only its own layer, wherever it sits in the
//! stack. This is what lets a session-scoped override (the live server's
//! `ALLOWED_HOSTS`) live underneath per-test overrides and be removed
//! independently of them.
//!
//! List operations (`append`, `prepend`, `remove`) are resolved against the
//! effective value at enable time.

use crate::error::{IsoError, IsoResult};
use parking_lot::RwLock;
use serde_json::Value as SettingValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identifier of one enabled override layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

#[derive(Debug, Clone)]
enum LayerEntry {
    Set(SettingValue),
    Deleted,
}

#[derive(Debug)]
struct Layer {
    id: LayerId,
    entries: BTreeMap<String, LayerEntry>,
}

#[derive(Debug, Default)]
struct SettingsState {
    base: BTreeMap<String, SettingValue>,
    layers: Vec<Layer>,
}

impl SettingsState {
    fn lookup(&self, key: &str) -> Option<&SettingValue> {
        for layer in self.layers.iter().rev() {
            match layer.entries.get(key) {
                Some(LayerEntry::Set(v)) => return Some(v),
                Some(LayerEntry::Deleted) => return None,
                None => {}
            }
        }
        self.base.get(key)
    }
}

/// Shared settings object
///
/// Cheap to share through `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct Settings {
    state: RwLock<SettingsState>,
    next_layer: AtomicU64,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings from base values
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, SettingValue)>,
        K: Into<String>,
    {
        let settings = Self::new();
        {
            let mut state = settings.state.write();
            for (k, v) in values {
                state.base.insert(k.into(), v);
            }
        }
        settings
    }

    /// Effective value of a setting
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.state.read().lookup(key).cloned()
    }

    /// Effective value as bool
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Effective value as string
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Effective value as a list of strings (non-string items are skipped)
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(SettingValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True if the setting has an effective value
    pub fn contains(&self, key: &str) -> bool {
        self.state.read().lookup(key).is_some()
    }

    /// Set a base value (not an override; never restored)
    pub fn set_base(&self, key: impl Into<String>, value: SettingValue) {
        self.state.write().base.insert(key.into(), value);
    }

    /// Number of enabled override layers
    pub fn layer_count(&self) -> usize {
        self.state.read().layers.len()
    }

    fn push_layer(&self, changes: &[(String, Change)]) -> LayerId {
        let id = LayerId(self.next_layer.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.write();
        let mut entries = BTreeMap::new();
        for (key, change) in changes {
            let entry = match change {
                Change::Set(v) => LayerEntry::Set(v.clone()),
                Change::Delete => LayerEntry::Deleted,
                Change::Append(items) | Change::Prepend(items) | Change::Remove(items) => {
                    // Earlier changes in the same override are visible to later ones.
                    let current = match entries.get(key) {
                        Some(LayerEntry::Set(v)) => Some(v.clone()),
                        Some(LayerEntry::Deleted) => None,
                        None => state.lookup(key).cloned(),
                    };
                    LayerEntry::Set(apply_list_change(current, change, items))
                }
            };
            entries.insert(key.clone(), entry);
        }
        debug!(target: "isodb::settings", layer = id.0, keys = changes.len(), "Settings override enabled");
        state.layers.push(Layer { id, entries });
        id
    }

    fn remove_layer(&self, id: LayerId) -> bool {
        let mut state = self.state.write();
        let before = state.layers.len();
        state.layers.retain(|l| l.id != id);
        let removed = state.layers.len() != before;
        if removed {
            debug!(target: "isodb::settings", layer = id.0, "Settings override disabled");
        }
        removed
    }
}

fn apply_list_change(current: Option<SettingValue>, change: &Change, items: &[SettingValue]) -> SettingValue {
    let mut list = match current {
        Some(SettingValue::Array(list)) => list,
        Some(SettingValue::Null) | None => Vec::new(),
        Some(other) => vec![other],
    };
    match change {
        Change::Append(_) => {
            for item in items {
                if !list.contains(item) {
                    list.push(item.clone());
                }
            }
        }
        Change::Prepend(_) => {
            let mut front: Vec<SettingValue> =
                items.iter().filter(|i| !list.contains(*i)).cloned().collect();
            front.append(&mut list);
            list = front;
        }
        Change::Remove(_) => list.retain(|v| !items.contains(v)),
        Change::Set(_) | Change::Delete => {}
    }
    SettingValue::Array(list)
}

/// One change carried by an override
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Replace the value
    Set(SettingValue),
    /// Hide the value
    Delete,
    /// Append items to a list setting (duplicates skipped)
    Append(Vec<SettingValue>),
    /// Prepend items to a list setting (duplicates skipped)
    Prepend(Vec<SettingValue>),
    /// Remove items from a list setting
    Remove(Vec<SettingValue>),
}

// ============================================================================
// Override tokens
// ============================================================================

/// A set of changes that can be enabled and disabled
///
/// Dropping an enabled override disables it.
#[derive(Debug)]
pub struct SettingsOverride {
    settings: Arc<Settings>,
    changes: Vec<(String, Change)>,
    layer: Option<LayerId>,
}

/// Builder for [`SettingsOverride`]
#[derive(Debug)]
pub struct SettingsOverrideBuilder {
    settings: Arc<Settings>,
    changes: Vec<(String, Change)>,
}

impl SettingsOverrideBuilder {
    /// Override a value
    pub fn set(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.changes.push((key.into(), Change::Set(value.into())));
        self
    }

    /// Hide a value
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.changes.push((key.into(), Change::Delete));
        self
    }

    /// Append to a list value
    pub fn append<I, V>(mut self, key: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SettingValue>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.changes.push((key.into(), Change::Append(items)));
        self
    }

    /// Prepend to a list value
    pub fn prepend<I, V>(mut self, key: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SettingValue>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.changes.push((key.into(), Change::Prepend(items)));
        self
    }

    /// Remove from a list value
    pub fn remove<I, V>(mut self, key: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SettingValue>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.changes.push((key.into(), Change::Remove(items)));
        self
    }

    /// Finish building (not yet enabled)
    pub fn build(self) -> SettingsOverride {
        SettingsOverride {
            settings: self.settings,
            changes: self.changes,
            layer: None,
        }
    }
}

impl SettingsOverride {
    /// Start building an override against `settings`
    pub fn builder(settings: &Arc<Settings>) -> SettingsOverrideBuilder {
        SettingsOverrideBuilder {
            settings: Arc::clone(settings),
            changes: Vec::new(),
        }
    }

    /// Apply the changes as a new top layer
    ///
    /// # Errors
    ///
    /// Returns an error if the override is already enabled.
    pub fn enable(&mut self) -> IsoResult<()> {
        if self.layer.is_some() {
            return Err(IsoError::invalid_operation("settings override is already enabled"));
        }
        self.layer = Some(self.settings.push_layer(&self.changes));
        Ok(())
    }

    /// Remove this override's layer
    ///
    /// # Errors
    ///
    /// Returns an error if the override is not enabled.
    pub fn disable(&mut self) -> IsoResult<()> {
        match self.layer.take() {
            Some(id) => {
                self.settings.remove_layer(id);
                Ok(())
            }
            None => Err(IsoError::invalid_operation("settings override is not enabled")),
        }
    }

    /// True while enabled
    pub fn is_enabled(&self) -> bool {
        self.layer.is_some()
    }

    /// Keys touched by this override
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|(k, _)| k.as_str())
    }
}

impl Drop for SettingsOverride {
    fn drop(&mut self) {
        if let Some(id) = self.layer.take() {
            self.settings.remove_layer(id);
        }
    }
}

// ============================================================================
// `settings` fixture wrapper
// ============================================================================

/// Per-test settings handle backing the `settings` fixture
///
/// Every `set`/`delete` enables a new override immediately; `finalize`
/// disables them in reverse order.
#[derive(Debug)]
pub struct SettingsWrapper {
    settings: Arc<Settings>,
    to_restore: parking_lot::Mutex<Vec<SettingsOverride>>,
}

impl SettingsWrapper {
    /// Wrap shared settings
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            to_restore: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Effective value
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.settings.get(key)
    }

    /// Override a value for the rest of the test
    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> IsoResult<()> {
        let mut token = SettingsOverride::builder(&self.settings).set(key, value).build();
        token.enable()?;
        self.to_restore.lock().push(token);
        Ok(())
    }

    /// Hide a value for the rest of the test
    pub fn delete(&self, key: &str) -> IsoResult<()> {
        let mut token = SettingsOverride::builder(&self.settings).delete(key).build();
        token.enable()?;
        self.to_restore.lock().push(token);
        Ok(())
    }

    /// Restore every change made through this wrapper, newest first
    pub fn finalize(&self) -> IsoResult<()> {
        let mut tokens = std::mem::take(&mut *self.to_restore.lock());
        while let Some(mut token) = tokens.pop() {
            token.disable()?;
        }
        Ok(())
    }
}
