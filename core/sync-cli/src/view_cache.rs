//! Last rendered view, cached on disk between runs.
//!
//! Written after every snapshot and read back as the mirror's hydration
//! source, so a cold start can show something before the daemon answers.

use chrono::{DateTime, Utc};
use plugin_sync_client::HydrationSource;
use plugin_sync_protocol::{EntitySnapshot, PluginState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "last-view.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRow {
    pub state: PluginState,
    pub rendered_view: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ViewCache {
    pub written_at: Option<DateTime<Utc>>,
    pub rows: BTreeMap<String, CachedRow>,
}

impl ViewCache {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".plugin-sync").join(CACHE_FILE))
    }

    /// Missing or unreadable caches load as empty.
    pub fn load(path: &Path) -> Self {
        let contents = match fs_err::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(error = %err, "View cache unreadable");
                }
                return Self::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring corrupt view cache");
            Self::default()
        })
    }

    pub fn from_snapshot(entities: &[EntitySnapshot], now: DateTime<Utc>) -> Self {
        let rows = entities
            .iter()
            .map(|entity| {
                (
                    entity.id.clone(),
                    CachedRow {
                        state: entity.state,
                        rendered_view: entity.rendered_view.clone(),
                    },
                )
            })
            .collect();
        Self {
            written_at: Some(now),
            rows,
        }
    }

    /// Writes through a temp file so readers never see a partial cache.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| format!("Failed to encode view cache: {}", err))?;
        let tmp = path.with_extension("json.tmp");
        fs_err::write(&tmp, payload).map_err(|err| err.to_string())?;
        fs_err::rename(&tmp, path).map_err(|err| err.to_string())?;
        Ok(())
    }
}

impl HydrationSource for ViewCache {
    fn last_known_state(&self, id: &str) -> Option<PluginState> {
        self.rows.get(id).map(|row| row.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_sync_client::StateMirror;

    fn entity(id: &str, state: PluginState, rendered_view: &str) -> EntitySnapshot {
        EntitySnapshot {
            id: id.to_string(),
            state,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            rendered_view: rendered_view.to_string(),
            error: None,
        }
    }

    #[test]
    fn saved_snapshot_hydrates_a_cold_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CACHE_FILE);
        let entities = vec![
            entity("acme/widget", PluginState::InstalledActive, "Active"),
            entity("acme/gadget", PluginState::Available, "Install"),
        ];
        ViewCache::from_snapshot(&entities, Utc::now())
            .save(&path)
            .unwrap();

        let cache = ViewCache::load(&path);
        assert_eq!(cache.rows["acme/gadget"].rendered_view, "Install");

        let mut mirror = StateMirror::with_hydration(cache);
        assert_eq!(mirror.get("acme/widget"), Some(PluginState::InstalledActive));
        assert_eq!(mirror.get("acme/unknown"), None);
    }

    #[test]
    fn corrupt_cache_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        fs_err::write(&path, "{not json").unwrap();
        assert!(ViewCache::load(&path).rows.is_empty());
        assert!(ViewCache::load(&dir.path().join("absent.json")).rows.is_empty());
    }
}
