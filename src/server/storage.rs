//! Document files for the sync server.
//!
//! A room is a directory named by [`room_key`], a bs58 digest of the room
//! id, and each element document in it is one file named by its document
//! id:
//! ```text
//! <DATA_DIR>/<room_key>/<document_id>.automerge
//! ```
//! Both path components come out of the bs58 alphabet, so no string a
//! client sends is ever joined onto the data directory.

use automerge::AutoCommit;
use sharedstate_core::{room_key, DocumentId, RoomId};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const EXTENSION: &str = "automerge";
const STAGING_EXTENSION: &str = "automerge.tmp";

/// Errors that can occur during server storage operations.
#[derive(Debug)]
pub enum ServerStorageError {
    /// Reading or writing a document file failed.
    Io { path: PathBuf, source: io::Error },
    /// A document file exists but does not load as Automerge.
    Corrupt { path: PathBuf, reason: String },
}

impl std::fmt::Display for ServerStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStorageError::Io { path, source } => {
                write!(f, "I/O error for {}: {}", path.display(), source)
            }
            ServerStorageError::Corrupt { path, reason } => {
                write!(f, "Document {} is corrupt: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ServerStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerStorageError::Io { source, .. } => Some(source),
            ServerStorageError::Corrupt { .. } => None,
        }
    }
}

/// Room documents on disk.
#[derive(Debug, Clone)]
pub struct ServerStorage {
    data_dir: PathBuf,
}

impl ServerStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// File holding one element's document.
    pub fn document_path(&self, room: &RoomId, document_id: &DocumentId) -> PathBuf {
        self.data_dir
            .join(room_key(room))
            .join(format!("{}.{}", document_id, EXTENSION))
    }

    /// Loads a document. `Ok(None)` means nobody has written it yet.
    pub fn load(
        &self,
        room: &RoomId,
        document_id: &DocumentId,
    ) -> Result<Option<AutoCommit>, ServerStorageError> {
        let path = self.document_path(room, document_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ServerStorageError::Io { path, source }),
        };

        AutoCommit::load(&bytes)
            .map(Some)
            .map_err(|e| ServerStorageError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    /// Writes the whole document. The previous file stays intact until the
    /// new one is fully on disk.
    pub fn save(
        &self,
        room: &RoomId,
        document_id: &DocumentId,
        doc: &mut AutoCommit,
    ) -> Result<(), ServerStorageError> {
        let path = self.document_path(room, document_id);
        let staging = path.with_extension(STAGING_EXTENSION);
        write_synced(&staging, &doc.save())?;
        fs::rename(&staging, &path).map_err(|source| ServerStorageError::Io { path, source })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ServerStorageError> {
    let io_error = |source| ServerStorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_error)?;
    }
    let mut file = fs::File::create(path).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::{transaction::Transactable, ReadDoc, ROOT};
    use sharedstate_core::ElementId;
    use tempfile::TempDir;

    fn setup() -> (ServerStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = ServerStorage::new(temp_dir.path());
        (storage, temp_dir)
    }

    fn room(s: &str) -> RoomId {
        RoomId::parse(s).unwrap()
    }

    fn doc_id(room_id: &str, element: &str) -> DocumentId {
        DocumentId::for_element(&room(room_id), &ElementId::parse(element).unwrap())
    }

    fn read_string(doc: &AutoCommit, key: &str) -> String {
        doc.get(ROOT, key)
            .unwrap()
            .map(|(v, _)| v.into_string().unwrap())
            .unwrap()
    }

    #[test]
    fn test_room_paths_stay_inside_data_dir() {
        let (storage, temp) = setup();
        let hostile = room("/../../etc/passwd");
        let path = storage.document_path(&hostile, &doc_id("/x", "y"));

        assert!(path.starts_with(temp.path()));
        let dir = path.parent().unwrap();
        assert_eq!(dir.parent().unwrap(), temp.path());
        assert_eq!(dir.file_name().unwrap().to_str().unwrap(), room_key(&hostile));
    }

    #[test]
    fn test_load_unwritten_returns_none() {
        let (storage, _temp) = setup();
        let result = storage.load(&room("/"), &doc_id("/", "counter")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (storage, temp) = setup();
        let blog = room("/blog");
        let id = doc_id("/blog", "likes");

        let mut doc = AutoCommit::new();
        doc.put(ROOT, "value", "hello").unwrap();
        storage.save(&blog, &id, &mut doc).unwrap();

        let loaded = storage.load(&blog, &id).unwrap().unwrap();
        assert_eq!(read_string(&loaded, "value"), "hello");

        let expected = temp
            .path()
            .join(room_key(&blog))
            .join(format!("{}.automerge", id));
        assert!(expected.exists());
        assert!(!expected.with_extension("automerge.tmp").exists());
    }

    #[test]
    fn test_rooms_are_isolated() {
        let (storage, _temp) = setup();
        let id = doc_id("/", "counter");

        let mut one = AutoCommit::new();
        one.put(ROOT, "room", "one").unwrap();
        storage.save(&room("/one"), &id, &mut one).unwrap();

        let mut two = AutoCommit::new();
        two.put(ROOT, "room", "two").unwrap();
        storage.save(&room("/two"), &id, &mut two).unwrap();

        let load = |r: &str| storage.load(&room(r), &id).unwrap();
        assert_eq!(read_string(&load("/one").unwrap(), "room"), "one");
        assert_eq!(read_string(&load("/two").unwrap(), "room"), "two");
        assert!(load("/three").is_none());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (storage, _temp) = setup();
        let r = room("/");
        let id = doc_id("/", "broken");
        let path = storage.document_path(&r, &id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not automerge").unwrap();

        let result = storage.load(&r, &id);
        assert!(matches!(result, Err(ServerStorageError::Corrupt { .. })));
    }

    #[test]
    fn test_overwrite_existing() {
        let (storage, _temp) = setup();
        let r = room("/");
        let id = doc_id("/", "version");

        let mut doc = AutoCommit::new();
        doc.put(ROOT, "version", "1").unwrap();
        storage.save(&r, &id, &mut doc).unwrap();
        doc.put(ROOT, "version", "2").unwrap();
        storage.save(&r, &id, &mut doc).unwrap();

        let loaded = storage.load(&r, &id).unwrap().unwrap();
        assert_eq!(read_string(&loaded, "version"), "2");
    }
}
