pub mod tab_watch;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autofill::FormAutofillExecutor;
use crate::credential::Credential;
use crate::host::BrowserHost;
use crate::staging::StagingSlot;

/// Action name of the runtime message that requests a login.
pub const PERFORM_LOGIN_ACTION: &str = "performLogin";

/// Default upper bound on waiting for the login tab to finish loading.
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 30_000;

/// Acknowledgement returned to the requester. It only says the request was
/// accepted; the autofill outcome is never reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAck {
    pub success: bool,
}

impl LoginAck {
    pub fn accepted() -> Self {
        Self { success: true }
    }
}

#[derive(Deserialize)]
struct PerformLoginMessage {
    credential: Credential,
}

/// Privileged side of the hand-off: stages the secret, opens the login tab,
/// waits for it to load and runs the autofill executor in it.
pub struct LoginCoordinator<H: BrowserHost> {
    host: Arc<H>,
    slot: Arc<StagingSlot>,
    executor: Arc<FormAutofillExecutor>,
    load_timeout: Duration,
    shutdown: CancellationToken,
    attempts: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: BrowserHost> LoginCoordinator<H> {
    pub fn new(
        host: Arc<H>,
        slot: Arc<StagingSlot>,
        executor: FormAutofillExecutor,
        load_timeout: Duration,
    ) -> Self {
        Self {
            host,
            slot,
            executor: Arc::new(executor),
            load_timeout,
            shutdown: CancellationToken::new(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn slot(&self) -> &Arc<StagingSlot> {
        &self.slot
    }

    /// Start a login attempt for `credential`.
    ///
    /// Stages the secret synchronously, then continues on a spawned task.
    /// Always returns an accepted acknowledgement; failures are only logged.
    /// Must be called from within a Tokio runtime.
    pub fn perform_login(&self, credential: &Credential) -> LoginAck {
        let url = match self.stage(credential) {
            Ok(url) => url,
            Err(reason) => {
                log::warn!("login request for credential {} not started: {reason}", credential.id);
                return LoginAck::accepted();
            }
        };

        let attempt = run_attempt(
            Arc::clone(&self.host),
            Arc::clone(&self.slot),
            Arc::clone(&self.executor),
            url,
            self.load_timeout,
            self.shutdown.child_token(),
        );
        let handle = tokio::spawn(attempt);

        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        attempts.retain(|attempt| !attempt.is_finished());
        attempts.push(handle);
        LoginAck::accepted()
    }

    fn stage(&self, credential: &Credential) -> Result<url::Url, String> {
        let url = crate::credential::validate_url(&credential.url)?;
        let replaced = self
            .slot
            .stage(&credential.username, &credential.password)?;
        if replaced {
            log::debug!("replaced a pending staged secret");
        }
        Ok(url)
    }

    /// Entry point for runtime messages. Returns `None` for messages that are
    /// not login requests.
    pub fn handle_message(&self, message: &serde_json::Value) -> Option<LoginAck> {
        let action = message.get("action").and_then(serde_json::Value::as_str);
        if action != Some(PERFORM_LOGIN_ACTION) {
            return None;
        }
        match PerformLoginMessage::deserialize(message) {
            Ok(request) => Some(self.perform_login(&request.credential)),
            Err(_) => {
                // The parse error may quote field values, so it is not logged.
                log::warn!("ignoring malformed {PERFORM_LOGIN_ACTION} message");
                Some(LoginAck::accepted())
            }
        }
    }

    /// Stop every attempt that is still waiting for its tab to load and drop
    /// the staged secret. Attempts started afterwards are cancelled at once.
    pub fn cancel_pending(&self) {
        self.shutdown.cancel();
        self.slot.clear();
    }

    /// Wait until all started attempts have finished.
    pub async fn drain(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut attempts = self
                    .attempts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                std::mem::take(&mut *attempts)
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(err) = handle.await {
                    log::error!("login attempt task failed: {err}");
                }
            }
        }
    }
}

async fn run_attempt<H: BrowserHost>(
    host: Arc<H>,
    slot: Arc<StagingSlot>,
    executor: Arc<FormAutofillExecutor>,
    url: url::Url,
    load_timeout: Duration,
    cancel: CancellationToken,
) {
    let watches = host.tab_watches();
    let tab = match host.open_tab(&url).await {
        Ok(tab) => tab,
        Err(err) => {
            log::error!("failed to open login tab: {err}");
            return;
        }
    };
    log::info!("opened login tab {tab}");

    let tab = match watches.watch(tab).loaded(load_timeout, &cancel).await {
        Ok(tab) => tab,
        Err(err) => {
            log::warn!("login abandoned: {err}");
            return;
        }
    };

    let page = match host.inject(&tab).await {
        Ok(page) => page,
        Err(err) => {
            log::error!("failed to inject autofill into tab {tab}");
            log::debug!("injection error: {err}");
            return;
        }
    };
    let outcome = executor.run(&slot, &page).await;
    log::debug!("autofill in tab {tab} finished: {outcome:?}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credential::Platform;
    use crate::host::{HostError, TabEvent, TabId, TabStatus};
    use crate::login::tab_watch::TabWatches;
    use crate::page::document::StaticDocument;
    use crate::staging::{now_ms, Consumed};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host whose tabs never load on their own; tests drive events by hand.
    struct ManualHost {
        watches: Arc<TabWatches>,
        opened: Mutex<Vec<url::Url>>,
        injections: AtomicUsize,
        refuse_injection: bool,
    }

    impl ManualHost {
        fn new(refuse_injection: bool) -> Arc<Self> {
            Arc::new(Self {
                watches: TabWatches::new(),
                opened: Mutex::new(Vec::new()),
                injections: AtomicUsize::new(0),
                refuse_injection,
            })
        }

        fn complete(&self, tab: &str) {
            self.watches.dispatch(TabEvent::Updated {
                tab: TabId::from(tab),
                status: TabStatus::Complete,
            });
        }
    }

    #[async_trait]
    impl BrowserHost for ManualHost {
        type Page = StaticDocument;

        fn tab_watches(&self) -> Arc<TabWatches> {
            Arc::clone(&self.watches)
        }

        async fn open_tab(&self, url: &url::Url) -> Result<TabId, HostError> {
            let mut opened = self.opened.lock().unwrap();
            opened.push(url.clone());
            Ok(TabId::from(format!("tab-{}", opened.len())))
        }

        async fn inject(&self, tab: &TabId) -> Result<StaticDocument, HostError> {
            self.injections.fetch_add(1, Ordering::SeqCst);
            if self.refuse_injection {
                return Err(HostError::InjectionRefused {
                    tab: tab.clone(),
                    reason: "blocked by page policy".to_string(),
                });
            }
            Ok(StaticDocument::parse(
                r#"<input id="username"><input id="password">"#,
            ))
        }
    }

    fn credential() -> Credential {
        Credential {
            id: "c1".to_string(),
            platform: Platform::Salesforce,
            url: "https://login.salesforce.com".to_string(),
            username: "alice".to_string(),
            password: "secret1".to_string(),
        }
    }

    fn coordinator(host: Arc<ManualHost>) -> LoginCoordinator<ManualHost> {
        LoginCoordinator::new(
            host,
            Arc::new(StagingSlot::default()),
            FormAutofillExecutor::default(),
            Duration::from_millis(DEFAULT_LOAD_TIMEOUT_MS),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stages_exactly_the_credential_secret() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));
        let before = now_ms();

        let ack = coordinator.perform_login(&credential());
        assert_eq!(ack, LoginAck::accepted());

        let staged = coordinator.slot().peek().unwrap();
        assert_eq!(staged.username, "alice");
        assert_eq!(staged.password, "secret1");
        assert!(staged.staged_at >= before && staged.staged_at <= now_ms());
        coordinator.cancel_pending();
        coordinator.drain().await;
        assert!(coordinator.slot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_overwrites_the_first() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));
        coordinator.perform_login(&credential());
        let mut other = credential();
        other.username = "bob".to_string();
        other.password = "secret2".to_string();
        coordinator.perform_login(&other);

        match coordinator.slot().try_consume() {
            Consumed::Fresh(secret) => {
                assert_eq!(secret.username, "bob");
                assert_eq!(secret.password, "secret2");
            }
            other => panic!("expected a fresh secret, got {other:?}"),
        }
        coordinator.cancel_pending();
        coordinator.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn injects_only_after_the_watched_tab_completes() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));
        coordinator.perform_login(&credential());
        settle().await;

        assert_eq!(host.opened.lock().unwrap().len(), 1);
        assert!(host.watches.is_watching(&TabId::from("tab-1")));

        host.complete("tab-2");
        host.complete("other");
        settle().await;
        assert_eq!(host.injections.load(Ordering::SeqCst), 0);
        assert!(!coordinator.slot().is_empty());

        host.complete("tab-1");
        host.complete("tab-1");
        coordinator.drain().await;
        assert_eq!(host.injections.load(Ordering::SeqCst), 1);
        assert!(coordinator.slot().is_empty());
        assert_eq!(host.watches.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn injection_failure_is_swallowed() {
        let host = ManualHost::new(true);
        let coordinator = coordinator(Arc::clone(&host));
        let ack = coordinator.perform_login(&credential());
        assert!(ack.success);
        settle().await;
        host.complete("tab-1");
        coordinator.drain().await;
        assert_eq!(host.injections.load(Ordering::SeqCst), 1);
        // Nothing consumed the secret; it stays inert until it goes stale.
        assert!(!coordinator.slot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn load_timeout_removes_the_watch() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));
        coordinator.perform_login(&credential());
        coordinator.drain().await;
        assert_eq!(host.watches.active(), 0);
        assert_eq!(host.injections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credential_is_acknowledged_but_not_started() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));
        let mut bad = credential();
        bad.url = "javascript:alert(1)".to_string();
        assert!(coordinator.perform_login(&bad).success);
        coordinator.drain().await;
        assert!(host.opened.lock().unwrap().is_empty());
        assert!(coordinator.slot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_message_routes_login_requests() {
        let host = ManualHost::new(false);
        let coordinator = coordinator(Arc::clone(&host));

        let message = serde_json::json!({
            "action": "performLogin",
            "credential": {
                "id": "c1",
                "platform": "salesforce",
                "url": "https://login.salesforce.com",
                "username": "alice",
                "password": "secret1"
            }
        });
        let ack = coordinator.handle_message(&message).unwrap();
        assert_eq!(serde_json::to_value(ack).unwrap(), serde_json::json!({"success": true}));
        assert!(!coordinator.slot().is_empty());

        assert_eq!(
            coordinator.handle_message(&serde_json::json!({"action": "copy"})),
            None
        );
        assert_eq!(coordinator.handle_message(&serde_json::json!({})), None);
        assert_eq!(
            coordinator.handle_message(&serde_json::json!({"action": "performLogin"})),
            Some(LoginAck::accepted())
        );
        coordinator.cancel_pending();
        coordinator.drain().await;
    }
}
