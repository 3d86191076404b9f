use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::EventLoadEventFired;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{BrowserHost, HostError, TabEvent, TabId, TabStatus};
use crate::autofill::selector::Selector;
use crate::login::tab_watch::TabWatches;
use crate::page::{DomEvent, PageError, PageModel};

type BoxError = Box<dyn Error + Send + Sync>;

/// Find the Chrome or Edge binary on the system.
pub fn find_chrome_binary() -> Result<PathBuf, BoxError> {
    // Check well-known paths first
    let candidates = chrome_candidates();
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }

    for name in [
        "google-chrome-stable",
        "google-chrome",
        "chromium",
        "microsoft-edge",
    ] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    Err("could not find Chrome or Edge binary; install Chrome or set browser.chromePath".into())
}

#[cfg(target_os = "macos")]
fn chrome_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"),
        PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
    ]
}

#[cfg(target_os = "windows")]
fn chrome_candidates() -> Vec<PathBuf> {
    let program_files =
        std::env::var("PROGRAMFILES").unwrap_or_else(|_| "C:\\Program Files".to_string());
    let program_files_x86 = std::env::var("PROGRAMFILES(X86)")
        .unwrap_or_else(|_| "C:\\Program Files (x86)".to_string());
    vec![
        PathBuf::from(&program_files).join("Google\\Chrome\\Application\\chrome.exe"),
        PathBuf::from(&program_files_x86).join("Google\\Chrome\\Application\\chrome.exe"),
        PathBuf::from(&program_files).join("Microsoft\\Edge\\Application\\msedge.exe"),
        PathBuf::from(&program_files_x86).join("Microsoft\\Edge\\Application\\msedge.exe"),
    ]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn chrome_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/bin/google-chrome-stable"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium-browser"),
        PathBuf::from("/usr/bin/chromium"),
    ]
}

/// Launch a Chrome/Edge instance with the given profile directory.
///
/// Returns the `Browser` handle and a `JoinHandle` that drives the
/// chromiumoxide event handler loop. The loop ends when the browser goes away.
pub async fn launch_browser(
    chrome_path: &Path,
    profile_dir: &Path,
    headless: bool,
) -> Result<(Browser, JoinHandle<()>), BoxError> {
    std::fs::create_dir_all(profile_dir)?;

    let mut builder = BrowserConfig::builder()
        .chrome_executable(chrome_path)
        .user_data_dir(profile_dir)
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-extensions")
        .launch_timeout(std::time::Duration::from_secs(30));
    if !headless {
        builder = builder.with_head();
    }
    let config = builder
        .build()
        .map_err(|e| format!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config).await?;

    let handle = tokio::spawn(async move {
        log::debug!("browser handler loop starting");
        let mut count = 0u64;
        loop {
            match handler.next().await {
                Some(Ok(())) => count += 1,
                Some(Err(err)) => match &err {
                    // Fatal: underlying transport or process is gone.
                    CdpError::Ws(_)
                    | CdpError::Io(_)
                    | CdpError::ChannelSendError(_)
                    | CdpError::LaunchExit(_, _)
                    | CdpError::LaunchTimeout(_)
                    | CdpError::LaunchIo(_, _) => {
                        log::debug!("browser handler stopped after {count} events: {err}");
                        break;
                    }
                    _ => {
                        log::warn!("ignoring browser handler error after {count} events: {err}");
                    }
                },
                None => {
                    log::debug!("browser handler stream ended after {count} events");
                    break;
                }
            }
        }
    });

    Ok((browser, handle))
}

/// [`BrowserHost`] over a Chrome DevTools Protocol session.
pub struct CdpHost {
    browser: tokio::sync::Mutex<Browser>,
    handler: Mutex<Option<JoinHandle<()>>>,
    pages: Mutex<HashMap<TabId, Page>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    watches: Arc<TabWatches>,
}

impl CdpHost {
    pub async fn launch(
        chrome_path: &Path,
        profile_dir: &Path,
        headless: bool,
    ) -> Result<Self, BoxError> {
        let (browser, handler) = launch_browser(chrome_path, profile_dir, headless).await?;
        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            handler: Mutex::new(Some(handler)),
            pages: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            watches: TabWatches::new(),
        })
    }

    /// Resolve once the user closes the browser.
    pub async fn wait_closed(&self) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handler) = handler {
            let _ = handler.await;
        }
    }

    pub async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            log::debug!("browser close failed: {err}");
        }
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            listener.abort();
        }
    }

    fn page(&self, tab: &TabId) -> Option<Page> {
        self.pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(tab)
            .cloned()
    }
}

#[async_trait]
impl BrowserHost for CdpHost {
    type Page = CdpPage;

    fn tab_watches(&self) -> Arc<TabWatches> {
        Arc::clone(&self.watches)
    }

    async fn open_tab(&self, url: &url::Url) -> Result<TabId, HostError> {
        let exited = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(false);
        if exited {
            return Err(HostError::Disconnected("browser has exited".to_string()));
        }
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page(url.as_str())
                .await
                .map_err(|e| HostError::OpenTab(e.to_string()))?
        };
        let tab = TabId::from(page.target_id().as_ref());

        let mut events = page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(|e| HostError::OpenTab(format!("failed to attach load listener: {e}")))?;
        let watches = Arc::clone(&self.watches);
        let tab_for_task = tab.clone();
        let listener = tokio::spawn(async move {
            while events.next().await.is_some() {
                watches.dispatch(TabEvent::Updated {
                    tab: tab_for_task.clone(),
                    status: TabStatus::Complete,
                });
            }
            watches.dispatch(TabEvent::Removed { tab: tab_for_task });
        });
        {
            let mut listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.retain(|listener| !listener.is_finished());
            listeners.push(listener);
        }

        // The load event may already have fired while the tab was created.
        let ready = page
            .evaluate("document.readyState === 'complete' && location.href !== 'about:blank'")
            .await
            .ok()
            .and_then(|result| result.value().and_then(Value::as_bool))
            .unwrap_or(false);
        if ready {
            self.watches.dispatch(TabEvent::Updated {
                tab: tab.clone(),
                status: TabStatus::Complete,
            });
        }

        self.pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tab.clone(), page);
        log::debug!("opened tab {tab} for {}", url.host_str().unwrap_or(""));
        Ok(tab)
    }

    async fn inject(&self, tab: &TabId) -> Result<CdpPage, HostError> {
        let page = self
            .page(tab)
            .ok_or_else(|| HostError::TabClosed(tab.clone()))?;
        let protocol = page
            .evaluate("location.protocol")
            .await
            .map_err(|e| HostError::InjectionRefused {
                tab: tab.clone(),
                reason: e.to_string(),
            })?
            .value()
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        if protocol != "http:" && protocol != "https:" {
            return Err(HostError::InjectionRefused {
                tab: tab.clone(),
                reason: format!("pages with protocol '{protocol}' cannot be scripted"),
            });
        }
        Ok(CdpPage {
            tab: tab.clone(),
            page,
        })
    }
}

/// Remote handle to a DOM node, resolved through `DOM.querySelector`.
#[derive(Clone)]
pub struct CdpElement(Arc<chromiumoxide::Element>);

impl fmt::Debug for CdpElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CdpElement")
            .field(&self.0.backend_node_id)
            .finish()
    }
}

/// A tab's document. Lookups go through the DOM domain; interactions call a
/// function on the element's remote object. Neither leaves anything behind in
/// the page.
pub struct CdpPage {
    tab: TabId,
    page: Page,
}

impl CdpPage {
    async fn find(&self, selector: &str) -> Option<CdpElement> {
        match self.page.find_element(selector).await {
            Ok(element) => Some(CdpElement(Arc::new(element))),
            Err(CdpError::NotFound) => None,
            Err(err) => {
                log::debug!("lookup of '{selector}' failed in tab {}: {err}", self.tab);
                None
            }
        }
    }

    /// Call `function` with `this` bound to `element`.
    async fn call(&self, element: &CdpElement, function: String) -> Result<Value, PageError> {
        let returns = element
            .0
            .call_js_fn(function, false)
            .await
            .map_err(|e| PageError::Script(e.to_string()))?;
        if let Some(details) = returns.exception_details {
            return Err(PageError::Script(details.text));
        }
        Ok(returns.result.value.unwrap_or(Value::Null))
    }

    /// Run an interaction that reports whether its target was still attached.
    async fn interact(&self, element: &CdpElement, function: String) -> Result<(), PageError> {
        match self.call(element, function).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(PageError::Detached),
        }
    }
}

#[async_trait]
impl PageModel for CdpPage {
    type Element = CdpElement;

    async fn query_selector(&self, selector: &Selector) -> Option<CdpElement> {
        self.find(selector.as_str()).await
    }

    async fn set_value(&self, element: &CdpElement, value: &str) -> Result<(), PageError> {
        self.interact(element, set_value_fn(value)).await
    }

    async fn dispatch_event(&self, element: &CdpElement, event: DomEvent) -> Result<(), PageError> {
        self.interact(element, dispatch_event_fn(event)).await
    }

    async fn click(&self, element: &CdpElement) -> Result<(), PageError> {
        self.interact(element, CLICK_FN.to_string()).await
    }

    async fn closest_form(&self, element: &CdpElement) -> Option<CdpElement> {
        let path = match self.call(element, FORM_PATH_FN.to_string()).await {
            Ok(Value::String(path)) => path,
            Ok(_) => return None,
            Err(err) => {
                log::debug!("form lookup failed in tab {}: {err}", self.tab);
                return None;
            }
        };
        self.find(&path).await
    }

    async fn submit_form(&self, form: &CdpElement) -> Result<(), PageError> {
        match self.call(form, SUBMIT_FN.to_string()).await? {
            Value::Bool(true) => Ok(()),
            Value::String(reason) => Err(PageError::Script(reason)),
            _ => Err(PageError::Detached),
        }
    }
}

const CLICK_FN: &str = r#"function() {
    if (!this.isConnected) return false;
    this.click();
    return true;
}"#;

const SUBMIT_FN: &str = r#"function() {
    if (!this.isConnected) return false;
    if (this.tagName !== 'FORM') return 'submit target is not a form';
    this.submit();
    return true;
}"#;

/// Unique `nth-of-type` path from the root to the nearest enclosing form.
const FORM_PATH_FN: &str = r#"function() {
    const form = this.closest('form');
    if (!form) return null;
    const parts = [];
    for (let node = form; node && node.nodeType === Node.ELEMENT_NODE; node = node.parentElement) {
        let nth = 1;
        for (let sib = node.previousElementSibling; sib; sib = sib.previousElementSibling) {
            if (sib.tagName === node.tagName) nth++;
        }
        parts.unshift(node.tagName.toLowerCase() + ':nth-of-type(' + nth + ')');
    }
    return parts.join(' > ');
}"#;

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn set_value_fn(value: &str) -> String {
    format!(
        "function() {{ if (!this.isConnected) return false; this.value = {}; return true; }}",
        js_string(value)
    )
}

fn dispatch_event_fn(event: DomEvent) -> String {
    format!(
        "function() {{ if (!this.isConnected) return false; this.dispatchEvent(new Event({}, {{ bubbles: true }})); return true; }}",
        js_string(event.name())
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn find_chrome_binary_returns_existing_path_or_error() {
        match find_chrome_binary() {
            Ok(path) => {
                assert!(path.exists(), "found path should exist: {}", path.display());
            }
            Err(e) => {
                // Acceptable in CI where Chrome may not be installed
                let msg = e.to_string();
                assert!(
                    msg.contains("could not find Chrome"),
                    "unexpected error: {msg}"
                );
            }
        }
    }

    #[test]
    fn chrome_candidates_are_absolute_paths() {
        for path in chrome_candidates() {
            assert!(
                path.is_absolute(),
                "candidate should be absolute: {}",
                path.display()
            );
        }
    }

    fn page_scripts() -> Vec<String> {
        vec![
            set_value_fn("alice"),
            dispatch_event_fn(DomEvent::Input),
            dispatch_event_fn(DomEvent::Change),
            CLICK_FN.to_string(),
            SUBMIT_FN.to_string(),
            FORM_PATH_FN.to_string(),
        ]
    }

    #[test]
    fn values_are_embedded_as_js_string_literals() {
        let script = set_value_fn("pa\"ss'</script>\n");
        assert!(script.contains(r#"this.value = "pa\"ss'</script>\n";"#));
    }

    #[test]
    fn scripts_leave_no_marks_on_the_page() {
        for script in page_scripts() {
            for forbidden in ["setAttribute", "dataset", "window.", "globalThis", "localStorage"] {
                assert!(
                    !script.contains(forbidden),
                    "script writes page state via {forbidden}: {script}"
                );
            }
        }
    }

    #[test]
    fn form_lookup_only_reads_the_dom() {
        assert!(FORM_PATH_FN.contains("this.closest('form')"));
        for write in ["this.value", "form.", ".submit(", ".click(", "dispatchEvent", "remove"] {
            assert!(
                !FORM_PATH_FN.contains(write),
                "form lookup touches the page via {write}"
            );
        }
    }

    #[test]
    fn submit_only_targets_forms() {
        assert!(SUBMIT_FN.contains("this.tagName !== 'FORM'"));
        let guard = SUBMIT_FN.find("tagName").unwrap();
        let submit = SUBMIT_FN.find("this.submit()").unwrap();
        assert!(guard < submit);
    }

    #[test]
    fn events_bubble() {
        for event in [DomEvent::Input, DomEvent::Change] {
            let script = dispatch_event_fn(event);
            assert!(script.contains(&format!(
                "new Event(\"{}\", {{ bubbles: true }})",
                event.name()
            )));
        }
    }

    #[test]
    fn interactions_check_the_node_is_attached() {
        for script in page_scripts() {
            if script == FORM_PATH_FN {
                continue;
            }
            assert!(
                script.contains("if (!this.isConnected) return false;"),
                "missing attachment check: {script}"
            );
        }
    }
}
