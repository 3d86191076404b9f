use std::error::Error;

type BoxError = Box<dyn Error + Send + Sync>;

/// Where credential passwords live, keyed by credential id.
pub trait PasswordVault {
    fn set(&self, id: &str, password: &str) -> Result<(), BoxError>;

    /// `Ok(None)` when nothing is stored for `id`.
    fn get(&self, id: &str) -> Result<Option<String>, BoxError>;

    /// Deleting a missing entry is not an error.
    fn delete(&self, id: &str) -> Result<(), BoxError>;
}

/// Keyring-backed password storage.
///
/// Passwords are stored in the OS keychain with:
/// - Service: `oneclick/<namespace>`
/// - User: `<credential id>`
///
/// The credential list itself lives in the credential store file, so no
/// keychain-side index is kept.
pub struct SecretStore {
    namespace: String,
}

impl SecretStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    /// Store used for saved login credentials.
    pub fn for_credentials() -> Self {
        Self::new("credentials")
    }

    fn service(&self) -> String {
        format!("oneclick/{}", self.namespace)
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service(), id)
    }
}

impl PasswordVault for SecretStore {
    fn set(&self, id: &str, password: &str) -> Result<(), BoxError> {
        self.entry(id)?.set_password(password)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, BoxError> {
        match self.entry(id)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, id: &str) -> Result<(), BoxError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process vault for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryVault {
    entries: std::sync::Mutex<std::collections::BTreeMap<String, String>>,
}

#[cfg(test)]
impl MemoryVault {
    fn entries(&self) -> std::sync::MutexGuard<'_, std::collections::BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
impl PasswordVault for MemoryVault {
    fn set(&self, id: &str, password: &str) -> Result<(), BoxError> {
        self.entries().insert(id.to_string(), password.to_string());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, BoxError> {
        Ok(self.entries().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<(), BoxError> {
        self.entries().remove(id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_store() -> SecretStore {
        SecretStore::new(&format!(
            "test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let store = test_store();
        if let Err(e) = store.set("cred-1", "hunter2") {
            // keyring may fail in CI or headless environments; skip gracefully
            eprintln!("skipping keyring test (set failed): {e}");
            return;
        }

        assert_eq!(store.get("cred-1").unwrap().as_deref(), Some("hunter2"));

        store.set("cred-1", "hunter3").unwrap();
        assert_eq!(store.get("cred-1").unwrap().as_deref(), Some("hunter3"));

        store.delete("cred-1").unwrap();
        assert_eq!(store.get("cred-1").unwrap(), None);
    }

    #[test]
    fn delete_nonexistent_is_ok() {
        let store = test_store();
        // May fail if keyring itself is unavailable, but shouldn't panic
        if let Err(e) = store.delete("nope") {
            eprintln!("skipping keyring test (delete failed): {e}");
        }
    }

    #[test]
    fn service_is_namespaced() {
        assert_eq!(SecretStore::for_credentials().service(), "oneclick/credentials");
    }
}
