//! Per-install player identity.
//!
//! A player identity is generated once per install and reused across
//! sessions and rooms. Its color and style are derived from the id, so a
//! peer that only knows the id renders the same way.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Key under which the identity is persisted.
pub const PLAYER_KEY: &str = "sharedstate.player";

#[derive(Error, Debug)]
pub enum PlayerStoreError {
    #[error("failed to access local store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local store at {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),

    #[error("no data directory available for the local store")]
    NoDataDir,

    #[error("failed to serialize player identity: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Animation style used when rendering a player's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStyle {
    Sparkle,
    Trail,
    Ripple,
    Pixel,
}

impl PlayerStyle {
    const ALL: [PlayerStyle; 4] = [
        PlayerStyle::Sparkle,
        PlayerStyle::Trail,
        PlayerStyle::Ripple,
        PlayerStyle::Pixel,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerIdentity {
    pub id: Uuid,
    /// `#rrggbb`
    pub color: String,
    pub style: PlayerStyle,
    pub created_at: DateTime<Utc>,
}

impl PlayerIdentity {
    pub fn generate() -> Self {
        Self::from_id(Uuid::new_v4())
    }

    /// Builds the identity for a known id with derived styling.
    pub fn from_id(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        let color = format!(
            "#{:02x}{:02x}{:02x}",
            (r * 255.0).round() as u8,
            (g * 255.0).round() as u8,
            (b * 255.0).round() as u8
        );
        let style = PlayerStyle::ALL[((hash >> 64) % PlayerStyle::ALL.len() as u128) as usize];

        Self {
            id,
            color,
            style,
            created_at: Utc::now(),
        }
    }

    /// Loads the persisted identity, creating one on first use.
    ///
    /// A corrupt record is replaced with a fresh identity.
    pub fn load_or_create(store: &dyn LocalStore) -> Result<Self, PlayerStoreError> {
        match store.get(PLAYER_KEY) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(identity) => return Ok(identity),
                Err(e) => tracing::warn!("discarding unreadable player identity: {}", e),
            },
            Ok(None) => {}
            Err(PlayerStoreError::Corrupt(path, e)) => {
                tracing::warn!("local store at {} is corrupt: {}", path.display(), e)
            }
            Err(e) => return Err(e),
        }

        let identity = Self::generate();
        store.set(PLAYER_KEY, &serde_json::to_string(&identity)?)?;
        tracing::info!("created player identity {}", identity.id);
        Ok(identity)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Durable string key-value storage local to one install.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PlayerStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PlayerStoreError>;
}

/// A JSON object file mapping keys to values.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at `<data_dir>/sharedstate/local.json`.
    pub fn default_location() -> Result<Self, PlayerStoreError> {
        let dir = dirs::data_dir().ok_or(PlayerStoreError::NoDataDir)?;
        Ok(Self::new(dir.join("sharedstate").join("local.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, PlayerStoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| PlayerStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| PlayerStoreError::Corrupt(self.path.clone(), e.to_string()))
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PlayerStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PlayerStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(PlayerStoreError::Corrupt(path, e)) => {
                tracing::warn!("overwriting corrupt local store at {}: {}", path.display(), e);
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        entries.insert(key.to_string(), value.to_string());

        let io_err = |source| PlayerStoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let contents = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, contents).map_err(io_err)
    }
}

/// In-process store, for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PlayerStoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PlayerStoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_styling_is_derived_from_id() {
        let id = Uuid::new_v4();
        let a = PlayerIdentity::from_id(id);
        let b = PlayerIdentity::from_id(id);
        assert_eq!(a.color, b.color);
        assert_eq!(a.style, b.style);
        assert_eq!(a.color.len(), 7);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_load_or_create_reuses_identity() {
        let store = MemoryStore::new();
        let first = PlayerIdentity::load_or_create(&store).unwrap();
        let second = PlayerIdentity::load_or_create(&store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_identity_is_replaced() {
        let store = MemoryStore::new();
        store.set(PLAYER_KEY, "{not json").unwrap();
        let identity = PlayerIdentity::load_or_create(&store).unwrap();
        let raw = store.get(PLAYER_KEY).unwrap().unwrap();
        let stored: PlayerIdentity = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, identity);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("local.json");

        let identity = {
            let store = FileStore::new(&path);
            PlayerIdentity::load_or_create(&store).unwrap()
        };

        let reopened = FileStore::new(&path);
        assert_eq!(PlayerIdentity::load_or_create(&reopened).unwrap(), identity);
        assert!(reopened.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_overwrites_corrupt_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local.json");
        fs::write(&path, "garbage").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.get("k"), Err(PlayerStoreError::Corrupt(_, _))));
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
    }
}
