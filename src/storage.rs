//! Secure Storage Module
//!
//! Durable session persistence. Records are written atomically and
//! encrypted with Windows DPAPI where available.

use std::path::{Path, PathBuf};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, error, debug};

use crate::session::TrackingSession;

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;

/// Name of the single durable record holding the tracking session.
pub const SESSION_KEY: &str = "sos_session";

/// Keyed record storage, one file per key, encrypted at rest on Windows.
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    /// Create storage rooted at `storage_path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();

        // Ensure directory exists; a failure here resurfaces on the first write.
        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    /// Directory the records live in.
    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Save a record. Readers see either the previous record or the new one.
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(data)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        let encrypted = self.encrypt(json.as_bytes())?;

        let file_path = self.record_path(key);
        let tmp_path = self.storage_path.join(format!("{}.dat.tmp", key));

        std::fs::write(&tmp_path, encrypted)
            .map_err(|e| PersistenceError::Io(format!("{}: {}", tmp_path.display(), e)))?;
        std::fs::rename(&tmp_path, &file_path)
            .map_err(|e| PersistenceError::Io(format!("{}: {}", file_path.display(), e)))?;

        info!("Saved encrypted data for key: {}", key);
        Ok(())
    }

    /// Load a record, `None` if it was never written or has been deleted.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let file_path = self.record_path(key);

        let encrypted = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PersistenceError::Io(format!("{}: {}", file_path.display(), e)))
            }
        };

        let decrypted = self.decrypt(&encrypted)?;

        let json = String::from_utf8(decrypted)
            .map_err(|e| PersistenceError::Decryption(e.to_string()))?;

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let file_path = self.record_path(key);

        match std::fs::remove_file(&file_path) {
            Ok(()) => {
                info!("Deleted stored data for key: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::Io(format!("{}: {}", file_path.display(), e))),
        }
    }

    /// Check if key exists
    pub fn exists(&self, key: &str) -> bool {
        self.record_path(key).exists()
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(PersistenceError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            // Free the memory allocated by CryptProtectData
            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(PersistenceError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(decrypted)
        }
    }

    // Unix hosts rely on the data directory's permissions.
    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        Ok(data.to_vec())
    }
}

/// On-disk shape of the session record.
///
/// Every field is optional so that a damaged or hand-edited record
/// deserializes and is then judged incomplete, instead of failing the read.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    sos_id: Option<String>,
    sos_token: Option<String>,
    #[serde(alias = "idToken")]
    identity_token: Option<String>,
    user_id: Option<String>,
}

impl SessionRecord {
    fn into_session(self) -> Option<TrackingSession> {
        let nonempty = |v: Option<String>| v.filter(|s| !s.is_empty());
        Some(TrackingSession {
            sos_id: nonempty(self.sos_id)?,
            sos_token: nonempty(self.sos_token)?,
            identity_token: nonempty(self.identity_token)?,
            user_id: nonempty(self.user_id)?,
        })
    }
}

impl From<&TrackingSession> for SessionRecord {
    fn from(session: &TrackingSession) -> Self {
        Self {
            sos_id: Some(session.sos_id.clone()),
            sos_token: Some(session.sos_token.clone()),
            identity_token: Some(session.identity_token.clone()),
            user_id: Some(session.user_id.clone()),
        }
    }
}

/// Durable mirror of the active tracking session.
///
/// Passive: only the session controller writes through it.
pub struct SessionStore {
    storage: SecureStorage,
}

impl SessionStore {
    pub fn new(storage: SecureStorage) -> Self {
        Self { storage }
    }

    /// Store under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(SecureStorage::new(dir))
    }

    /// Persist all four session fields in one record.
    pub fn save(&self, session: &TrackingSession) -> Result<(), PersistenceError> {
        self.storage.save(SESSION_KEY, &SessionRecord::from(session))
    }

    /// The persisted session, or `None` if absent or incomplete.
    pub fn load(&self) -> Result<Option<TrackingSession>, PersistenceError> {
        let record: Option<SessionRecord> = self.storage.load(SESSION_KEY)?;
        let session = record.and_then(SessionRecord::into_session);
        if session.is_none() && self.storage.exists(SESSION_KEY) {
            debug!("Stored session record is incomplete, treating as absent");
        }
        Ok(session)
    }

    /// Remove the session record.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        self.storage.delete(SESSION_KEY)
    }

    /// Whether a session id is persisted. Does not check the other fields.
    pub fn has_session_id(&self) -> Result<bool, PersistenceError> {
        let record: Option<SessionRecord> = self.storage.load(SESSION_KEY)?;
        Ok(record
            .and_then(|r| r.sos_id)
            .is_some_and(|id| !id.is_empty()))
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> TrackingSession {
        TrackingSession {
            sos_id: "S1".into(),
            sos_token: "T1".into(),
            identity_token: "I1".into(),
            user_id: "U1".into(),
        }
    }

    #[test]
    fn load_on_empty_store_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path());
        assert_eq!(store.load().unwrap(), None);
        assert!(!store.has_session_id().unwrap());
    }

    #[test]
    fn save_then_load_returns_all_fields() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path());
        store.save(&session()).unwrap();
        assert_eq!(store.load().unwrap(), Some(session()));
        assert!(store.has_session_id().unwrap());
    }

    #[test]
    fn record_survives_reopen() {
        let dir = TempDir::new().unwrap();
        SessionStore::open(dir.path()).save(&session()).unwrap();
        let reopened = SessionStore::open(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(session()));
    }

    #[test]
    fn clear_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path());
        store.save(&session()).unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        assert!(!store.has_session_id().unwrap());
        // Second clear is a no-op.
        store.clear().unwrap();
    }

    #[test]
    fn save_does_not_leave_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path());
        store.save(&session()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.dat", SESSION_KEY)]);
    }

    #[test]
    fn partial_record_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let storage = SecureStorage::new(dir.path());
        let partial = SessionRecord {
            sos_id: Some("S1".into()),
            sos_token: Some("T1".into()),
            ..Default::default()
        };
        storage.save(SESSION_KEY, &partial).unwrap();

        let store = SessionStore::new(storage);
        assert_eq!(store.load().unwrap(), None);
        // The status approximation only looks at the session id.
        assert!(store.has_session_id().unwrap());
    }

    #[test]
    #[cfg(not(windows))]
    fn corrupt_record_is_a_persistence_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(format!("{}.dat", SESSION_KEY)), b"{not json").unwrap();
        let store = SessionStore::open(dir.path());
        assert!(matches!(store.load(), Err(PersistenceError::Serialization(_))));
    }

    #[test]
    fn unwritable_directory_surfaces_error() {
        let dir = TempDir::new().unwrap();
        // A file where the directory should be.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let store = SessionStore::open(&blocked);
        assert!(matches!(store.save(&session()), Err(PersistenceError::Io(_))));
    }
}
