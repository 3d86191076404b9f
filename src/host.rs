pub mod cdp;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::login::tab_watch::TabWatches;
use crate::page::PageModel;

/// Browser-assigned identifier of a tab.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabId(String);

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        TabId(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        TabId(value)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Tab lifecycle notifications a host feeds into its [`TabWatches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Updated { tab: TabId, status: TabStatus },
    Removed { tab: TabId },
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to open tab: {0}")]
    OpenTab(String),
    #[error("tab {0} is not open")]
    TabClosed(TabId),
    #[error("script injection refused in tab {tab}: {reason}")]
    InjectionRefused { tab: TabId, reason: String },
    #[error("browser connection lost: {0}")]
    Disconnected(String),
}

/// Privileged access to the browser: opening tabs, observing their
/// lifecycle, and attaching to a tab's document.
#[async_trait]
pub trait BrowserHost: Send + Sync + 'static {
    type Page: PageModel + 'static;

    /// Event hub this host delivers tab events to.
    fn tab_watches(&self) -> Arc<TabWatches>;

    /// Open a new tab navigated to `url`.
    async fn open_tab(&self, url: &url::Url) -> Result<TabId, HostError>;

    /// Attach to the current document of `tab` so a page-scoped run can act on it.
    async fn inject(&self, tab: &TabId) -> Result<Self::Page, HostError>;
}
