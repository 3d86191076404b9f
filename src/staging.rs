use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Maximum age of a staged secret, measured from stage time to read time.
pub const FRESHNESS_WINDOW_MS: i64 = 10_000;

/// A credential secret waiting to be picked up by exactly one autofill run.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedSecret {
    pub username: String,
    pub password: String,
    /// Stage time in epoch milliseconds.
    #[serde(rename = "timestamp")]
    pub staged_at: i64,
}

impl fmt::Debug for StagedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedSecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("staged_at", &self.staged_at)
            .finish()
    }
}

impl StagedSecret {
    /// Age at `now_ms`; a stage time in the future counts as age zero.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.staged_at).max(0)
    }
}

/// What a consume attempt observed. Only `Fresh` carries the secret.
#[derive(Debug, PartialEq, Eq)]
pub enum Consumed {
    Fresh(StagedSecret),
    Expired { age_ms: i64 },
    Empty,
}

impl Consumed {
    pub fn into_secret(self) -> Option<StagedSecret> {
        match self {
            Consumed::Fresh(secret) => Some(secret),
            Consumed::Expired { .. } | Consumed::Empty => None,
        }
    }
}

/// Single-slot hand-off channel between the coordinator and the executor.
///
/// `stage` overwrites whatever is there. `try_consume` always leaves the slot
/// empty, whether the entry was fresh or stale.
#[derive(Debug)]
pub struct StagingSlot {
    entry: Mutex<Option<StagedSecret>>,
    freshness_window_ms: i64,
}

impl Default for StagingSlot {
    fn default() -> Self {
        Self::new(FRESHNESS_WINDOW_MS)
    }
}

impl StagingSlot {
    pub fn new(freshness_window_ms: i64) -> Self {
        Self {
            entry: Mutex::new(None),
            freshness_window_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<StagedSecret>> {
        // A panic while holding the guard cannot leave a half-written entry.
        self.entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stage a secret now. Returns whether a previous entry was replaced.
    pub fn stage(&self, username: &str, password: &str) -> Result<bool, String> {
        self.stage_at(username, password, now_ms())
    }

    pub fn stage_at(&self, username: &str, password: &str, staged_at: i64) -> Result<bool, String> {
        if username.is_empty() {
            return Err("cannot stage an empty username".to_string());
        }
        if password.is_empty() {
            return Err("cannot stage an empty password".to_string());
        }
        let secret = StagedSecret {
            username: username.to_string(),
            password: password.to_string(),
            staged_at,
        };
        let previous = self.lock().replace(secret);
        Ok(previous.is_some())
    }

    pub fn try_consume(&self) -> Consumed {
        self.try_consume_at(now_ms())
    }

    /// Take the staged entry and check its freshness against `now_ms`.
    pub fn try_consume_at(&self, now_ms: i64) -> Consumed {
        let Some(secret) = self.lock().take() else {
            return Consumed::Empty;
        };
        let age_ms = secret.age_ms(now_ms);
        if age_ms < self.freshness_window_ms {
            Consumed::Fresh(secret)
        } else {
            Consumed::Expired { age_ms }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Copy of the staged entry without consuming it.
    pub fn peek(&self) -> Option<StagedSecret> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().take();
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
