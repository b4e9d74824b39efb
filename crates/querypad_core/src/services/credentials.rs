//! Credential vault.
//!
//! Secrets are keyed `"{connection_id}:database"` and `"{connection_id}:ssh"`.
//! They are read just before a connect or test and handed to the adapter by
//! reference; nothing else in the crate keeps them.
//!
//! Backend selection:
//! - debug builds store secrets in `credentials.json` under the data directory
//!   unless `QUERYPAD_USE_KEYCHAIN=1`
//! - release builds use the OS keychain
//! - an in-memory session store is the fallback when the file cannot be used

use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{QueryPadError, Result};

/// Keychain service name.
const KEYRING_SERVICE: &str = "dev.querypad.QueryPad";

/// Forces the keychain in debug builds when set to `1`.
const FORCE_KEYCHAIN_ENV: &str = "QUERYPAD_USE_KEYCHAIN";

const CREDENTIALS_FILE: &str = "credentials.json";

/// Which secret of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    /// Database password
    Database,
    /// SSH password or key passphrase
    Ssh,
}

impl SecretKind {
    pub const ALL: [SecretKind; 2] = [SecretKind::Database, SecretKind::Ssh];

    /// Vault key for this secret of `connection_id`.
    pub fn key(self, connection_id: Uuid) -> String {
        match self {
            SecretKind::Database => format!("{connection_id}:database"),
            SecretKind::Ssh => format!("{connection_id}:ssh"),
        }
    }
}

/// Storage backend for secrets.
pub trait SecretStore: Send + Sync {
    fn store(&self, key: &str, value: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a secret. Absent keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

// ========== File ==========

/// JSON file store for development builds.
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    secrets: HashMap<String, String>,
}

impl FileSecretStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into(), cache: RwLock::new(HashMap::new()) };
        store.load()?;
        Ok(store)
    }

    /// Store inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(|e| {
            QueryPadError::storage(
                format!("Failed to create data directory: {e}"),
                Some("Check permissions for the data directory"),
            )
        })?;
        Self::open(data_dir.join(CREDENTIALS_FILE))
    }

    fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            QueryPadError::storage(format!("Failed to read credentials file: {e}"), None)
        })?;
        if contents.trim().is_empty() {
            return Ok(());
        }
        let file: SecretsFile = serde_json::from_str(&contents).map_err(|e| {
            QueryPadError::storage(format!("Invalid credentials file format: {e}"), None)
        })?;
        *self.cache.write() = file.secrets;
        Ok(())
    }

    /// Put the cache entry for `key` back after a failed write.
    fn restore(&self, key: &str, previous: Option<String>) {
        let mut cache = self.cache.write();
        match previous {
            Some(value) => cache.insert(key.to_string(), value),
            None => cache.remove(key),
        };
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&SecretsFile { secrets: self.cache.read().clone() })?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .map_err(|e| {
                    QueryPadError::storage(format!("Failed to open credentials file: {e}"), None)
                })?;
            file.write_all(json.as_bytes()).map_err(|e| {
                QueryPadError::storage(format!("Failed to write credentials file: {e}"), None)
            })?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, json).map_err(|e| {
                QueryPadError::storage(format!("Failed to write credentials file: {e}"), None)
            })?;
        }

        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        let previous = self.cache.write().insert(key.to_string(), value.to_string());
        self.persist().inspect_err(|_| self.restore(key, previous))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let Some(previous) = self.cache.write().remove(key) else {
            return Ok(());
        };
        self.persist().inspect_err(|_| self.restore(key, Some(previous)))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ========== Keychain ==========

/// OS keychain store.
#[derive(Debug)]
pub struct KeychainSecretStore {
    service: String,
}

impl Default for KeychainSecretStore {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl SecretStore for KeychainSecretStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?.set_password(value).map_err(|e| {
            QueryPadError::keyring(e.to_string(), Some("Grant QueryPad access to the keychain"))
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(QueryPadError::keyring(
                e.to_string(),
                Some("Grant QueryPad access to the keychain"),
            )),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "keychain"
    }
}

// ========== Session ==========

/// In-memory store; secrets are gone when the process exits.
#[derive(Debug, Default)]
pub struct SessionSecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl SessionSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for SessionSecretStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.secrets.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.secrets.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session"
    }
}

// ========== Service ==========

fn keychain_forced() -> bool {
    std::env::var(FORCE_KEYCHAIN_ENV).map(|v| v == "1").unwrap_or(false)
}

fn select_store(data_dir: &Path) -> Box<dyn SecretStore> {
    if cfg!(not(debug_assertions)) || keychain_forced() {
        return Box::new(KeychainSecretStore::new());
    }

    match FileSecretStore::in_dir(data_dir) {
        Ok(store) => Box::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "File credential store unavailable, using session store");
            Box::new(SessionSecretStore::new())
        }
    }
}

/// Per-connection secret storage.
pub struct CredentialService {
    store: Box<dyn SecretStore>,
}

impl CredentialService {
    /// Pick a backend for this build, keeping file secrets in `data_dir`.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::with_store(select_store(data_dir))
    }

    pub fn with_store(store: Box<dyn SecretStore>) -> Self {
        tracing::info!(store = store.name(), "Credential service initialized");
        Self { store }
    }

    /// Active backend name.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Save a secret. The value is never logged.
    pub fn set_secret(&self, connection_id: Uuid, kind: SecretKind, secret: &str) -> Result<()> {
        self.store.store(&kind.key(connection_id), secret)?;
        tracing::debug!(connection_id = %connection_id, kind = ?kind, "Secret stored");
        Ok(())
    }

    pub fn get_secret(&self, connection_id: Uuid, kind: SecretKind) -> Result<Option<String>> {
        self.store.get(&kind.key(connection_id))
    }

    /// Remove both secrets of a connection.
    pub fn delete_secrets(&self, connection_id: Uuid) -> Result<()> {
        for kind in SecretKind::ALL {
            self.store.delete(&kind.key(connection_id))?;
        }
        tracing::debug!(connection_id = %connection_id, "Secrets deleted");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService").field("store", &self.store.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_secret_keys() {
        let id = Uuid::nil();
        assert_eq!(SecretKind::Database.key(id), format!("{id}:database"));
        assert_eq!(SecretKind::Ssh.key(id), format!("{id}:ssh"));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        {
            let store = FileSecretStore::in_dir(dir.path()).unwrap();
            store.store("a:database", "s3cret").unwrap();
        }

        let store = FileSecretStore::in_dir(dir.path()).unwrap();
        assert_eq!(store.get("a:database").unwrap().as_deref(), Some("s3cret"));

        store.delete("a:database").unwrap();
        store.delete("a:database").unwrap();
        assert_eq!(store.get("a:database").unwrap(), None);
    }

    #[test]
    fn test_failed_write_keeps_cache_in_sync_with_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        let store = FileSecretStore::open(&path).unwrap();
        store.store("kept", "v1").unwrap();

        // A directory in place of the file makes every write fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.store("new", "v2").is_err());
        assert_eq!(store.get("new").unwrap(), None);

        assert!(store.store("kept", "v3").is_err());
        assert_eq!(store.get("kept").unwrap().as_deref(), Some("v1"));

        assert!(store.delete("kept").is_err());
        assert_eq!(store.get("kept").unwrap().as_deref(), Some("v1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileSecretStore::in_dir(dir.path()).unwrap();
        store.store("k", "v").unwrap();

        let mode = fs::metadata(dir.path().join(CREDENTIALS_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_service_round_trip_and_delete_both() {
        let service = CredentialService::with_store(Box::new(SessionSecretStore::new()));
        let id = Uuid::new_v4();

        service.set_secret(id, SecretKind::Database, "db-pw").unwrap();
        service.set_secret(id, SecretKind::Ssh, "ssh-pw").unwrap();
        assert_eq!(service.get_secret(id, SecretKind::Database).unwrap().as_deref(), Some("db-pw"));
        assert_eq!(service.get_secret(id, SecretKind::Ssh).unwrap().as_deref(), Some("ssh-pw"));

        service.delete_secrets(id).unwrap();
        assert_eq!(service.get_secret(id, SecretKind::Database).unwrap(), None);
        assert_eq!(service.get_secret(id, SecretKind::Ssh).unwrap(), None);
    }

    #[test]
    fn test_secrets_are_scoped_by_connection() {
        let service = CredentialService::with_store(Box::new(SessionSecretStore::new()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        service.set_secret(a, SecretKind::Database, "a-pw").unwrap();
        assert_eq!(service.get_secret(b, SecretKind::Database).unwrap(), None);
    }

    #[test]
    fn test_debug_output_names_store_only() {
        let service = CredentialService::with_store(Box::new(SessionSecretStore::new()));
        service.set_secret(Uuid::new_v4(), SecretKind::Database, "hunter2").unwrap();
        let debug = format!("{service:?}");
        assert!(debug.contains("session"));
        assert!(!debug.contains("hunter2"));
    }
}
