use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::credential::{Credential, Platform};
use crate::secret::{PasswordVault, SecretStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const CREDENTIALS_FILE: &str = "credentials.json";
const LOCK_FILE: &str = ".credentials.lock";

/// A stored credential without its password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    #[serde(default)]
    pub platform: Platform,
    pub url: String,
    pub username: String,
}

impl CredentialRecord {
    fn from_credential(credential: &Credential) -> Self {
        Self {
            id: credential.id.clone(),
            platform: credential.platform.clone(),
            url: credential.url.clone(),
            username: credential.username.clone(),
        }
    }

    fn with_password(self, password: String) -> Credential {
        Credential {
            id: self.id,
            platform: self.platform,
            url: self.url,
            username: self.username,
            password,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: Vec<CredentialRecord>,
}

/// Ordered credential list in `<data_dir>/credentials.json`, with passwords
/// kept in a [`PasswordVault`].
pub struct CredentialStore<V: PasswordVault = SecretStore> {
    data_dir: PathBuf,
    vault: V,
}

impl CredentialStore<SecretStore> {
    /// Store backed by the OS keychain.
    pub fn open(data_dir: &Path) -> Self {
        Self::with_vault(data_dir, SecretStore::for_credentials())
    }
}

impl<V: PasswordVault> CredentialStore<V> {
    pub fn with_vault(data_dir: &Path, vault: V) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            vault,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE)
    }

    /// All records in insertion order. A missing file is an empty store.
    pub fn list(&self) -> Result<Vec<CredentialRecord>, BoxError> {
        Ok(self.read_file()?.credentials)
    }

    /// Validate and append `credential`, storing its password in the vault.
    pub fn add(&self, credential: &Credential) -> Result<(), BoxError> {
        credential.validate()?;
        let _lock = self.lock()?;
        let mut file = self.read_file()?;
        if file.credentials.iter().any(|r| r.id == credential.id) {
            return Err(format!("credential '{}' already exists", credential.id).into());
        }

        self.vault.set(&credential.id, &credential.password)?;
        file.credentials
            .push(CredentialRecord::from_credential(credential));
        if let Err(err) = self.write_file(&file) {
            let _ = self.vault.delete(&credential.id);
            return Err(err);
        }
        Ok(())
    }

    /// Look up a credential and resolve its password.
    pub fn get(&self, id: &str) -> Result<Option<Credential>, BoxError> {
        let Some(record) = self.list()?.into_iter().find(|r| r.id == id) else {
            return Ok(None);
        };
        let password = self
            .vault
            .get(id)?
            .ok_or_else(|| format!("password for credential '{id}' is missing from the keychain"))?;
        Ok(Some(record.with_password(password)))
    }

    /// Remove a credential. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, BoxError> {
        let _lock = self.lock()?;
        let mut file = self.read_file()?;
        let before = file.credentials.len();
        file.credentials.retain(|r| r.id != id);
        if file.credentials.len() == before {
            return Ok(false);
        }
        self.write_file(&file)?;
        self.vault.delete(id)?;
        Ok(true)
    }

    fn read_file(&self) -> Result<CredentialsFile, BoxError> {
        let path = self.path();
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| format!("failed to parse '{}': {e}", path.display()).into()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CredentialsFile::default()),
            Err(e) => Err(format!("failed to read '{}': {e}", path.display()).into()),
        }
    }

    /// Write via temp-file + rename.
    fn write_file(&self, file: &CredentialsFile) -> Result<(), BoxError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.path();
        let json = serde_json::to_string_pretty(file)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let temp_path = self.data_dir.join(format!(
            ".{CREDENTIALS_FILE}.tmp-{}-{nanos}",
            std::process::id()
        ));
        {
            let mut temp = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            temp.write_all(json.as_bytes())?;
            temp.sync_all()?;
        }
        if let Err(err) = crate::config::replace_file(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err.into());
        }
        if let Ok(dir) = File::open(&self.data_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn lock(&self) -> Result<File, BoxError> {
        use fs2::FileExt;

        std::fs::create_dir_all(&self.data_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.data_dir.join(LOCK_FILE))?;
        file.try_lock_exclusive()
            .map_err(|_| "credential store is currently in use by another operation")?;
        Ok(file)
    }
}
