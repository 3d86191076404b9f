use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::autofill::selector::SelectorCascade;
use crate::autofill::{AutofillTimings, FormAutofillExecutor};
use crate::login::DEFAULT_LOAD_TIMEOUT_MS;
use crate::staging::{StagingSlot, FRESHNESS_WINDOW_MS};

pub const APP_DIR: &str = "oneclick";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub browser: BrowserSettings,
    pub timings: TimingSettings,
    pub selectors: SelectorCascade,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrowserSettings {
    /// Chrome/Edge binary; discovered when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,
    /// Profile directory; `<data dir>/profile` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_dir: Option<PathBuf>,
    pub headless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingSettings {
    pub render_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub freshness_window_ms: i64,
    pub load_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        let autofill = AutofillTimings::default();
        Self {
            render_delay_ms: autofill.render_delay_ms,
            settle_delay_ms: autofill.settle_delay_ms,
            freshness_window_ms: FRESHNESS_WINDOW_MS,
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
        }
    }
}

impl TimingSettings {
    pub fn autofill(&self) -> AutofillTimings {
        AutofillTimings {
            render_delay_ms: self.render_delay_ms,
            settle_delay_ms: self.settle_delay_ms,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.timings.freshness_window_ms <= 0 {
            return Err("timings.freshnessWindowMs must be positive".to_string());
        }
        if self.timings.load_timeout_ms == 0 {
            return Err("timings.loadTimeoutMs must be positive".to_string());
        }
        for (role, list) in [
            ("username", &self.selectors.username),
            ("password", &self.selectors.password),
        ] {
            if list.is_empty() {
                return Err(format!("selectors.{role} must not be empty"));
            }
        }
        Ok(())
    }

    pub fn executor(&self) -> FormAutofillExecutor {
        FormAutofillExecutor::new(self.selectors.clone(), self.timings.autofill())
    }

    pub fn staging_slot(&self) -> StagingSlot {
        StagingSlot::new(self.timings.freshness_window_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.timings.load_timeout_ms)
    }

    pub fn profile_dir(&self, data_dir: &Path) -> PathBuf {
        self.browser
            .profile_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("profile"))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR))
}

/// Read the config, returning defaults if the file is missing or invalid.
pub fn read_config(path: &Path) -> AppConfig {
    let config = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str::<AppConfig>(&text).unwrap_or_else(|e| {
            log::warn!("failed to parse '{}': {e}", path.display());
            AppConfig::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            log::warn!("failed to read '{}': {e}", path.display());
            AppConfig::default()
        }
    };
    if let Err(reason) = config.validate() {
        log::warn!("ignoring '{}': {reason}", path.display());
        return AppConfig::default();
    }
    config
}

/// Write the config via temp-file + rename.
pub fn write_config(
    path: &Path,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config.validate()?;
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("config path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(config)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_path = parent.join(format!(".{CONFIG_FILE}.tmp-{}-{nanos}", std::process::id()));
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(err) = replace_file(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err.into());
    }
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Atomically replace a file via rename, with a Windows fallback.
pub(crate) fn replace_file(temp_path: &Path, path: &Path) -> io::Result<()> {
    match std::fs::rename(temp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            #[cfg(windows)]
            {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    std::fs::remove_file(path)?;
                    return std::fs::rename(temp_path, path);
                }
            }
            Err(err)
        }
    }
}
