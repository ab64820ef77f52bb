//! Plugin lifecycle states and the transition table.
//!
//! The table is pure data: every accepted transition in the daemon goes through
//! [`is_allowed`], and clients use the same table to reason about optimistic updates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unknown,
    Checking,
    Available,
    NotPlugin,
    InstalledInactive,
    InstalledActive,
    Installing,
    Error,
}

impl PluginState {
    pub const ALL: [PluginState; 8] = [
        PluginState::Unknown,
        PluginState::Checking,
        PluginState::Available,
        PluginState::NotPlugin,
        PluginState::InstalledInactive,
        PluginState::InstalledActive,
        PluginState::Installing,
        PluginState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Unknown => "unknown",
            PluginState::Checking => "checking",
            PluginState::Available => "available",
            PluginState::NotPlugin => "not_plugin",
            PluginState::InstalledInactive => "installed_inactive",
            PluginState::InstalledActive => "installed_active",
            PluginState::Installing => "installing",
            PluginState::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(PluginState::Unknown),
            "checking" => Some(PluginState::Checking),
            "available" => Some(PluginState::Available),
            "not_plugin" => Some(PluginState::NotPlugin),
            "installed_inactive" => Some(PluginState::InstalledInactive),
            "installed_active" => Some(PluginState::InstalledActive),
            "installing" => Some(PluginState::Installing),
            "error" => Some(PluginState::Error),
            _ => None,
        }
    }

    /// Short human label used for the rendered view of a row.
    pub fn label(&self) -> &'static str {
        match self {
            PluginState::Unknown => "Unknown",
            PluginState::Checking => "Checking…",
            PluginState::Available => "Available",
            PluginState::NotPlugin => "Not a plugin",
            PluginState::InstalledInactive => "Installed",
            PluginState::InstalledActive => "Active",
            PluginState::Installing => "Installing…",
            PluginState::Error => "Error",
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(
            self,
            PluginState::InstalledInactive | PluginState::InstalledActive
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn allowed_targets(from: PluginState) -> &'static [PluginState] {
    use PluginState::*;
    match from {
        Unknown => &[Checking],
        Checking => &[Available, NotPlugin, Error],
        Available => &[Installing, Error],
        Installing => &[InstalledInactive, Error],
        InstalledInactive => &[InstalledActive, Error],
        InstalledActive => &[InstalledInactive, Error],
        NotPlugin => &[Checking],
        Error => &[Checking],
    }
}

pub fn is_allowed(from: PluginState, to: PluginState) -> bool {
    allowed_targets(from).contains(&to)
}
