use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::host::{TabEvent, TabId, TabStatus};

/// How many unwatched load-complete tabs are remembered.
const EARLY_COMPLETION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchSignal {
    Loaded,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("tab {0} was closed before it finished loading")]
    TabClosed(TabId),
    #[error("tab {tab} did not finish loading within {}ms", .timeout.as_millis())]
    TimedOut { tab: TabId, timeout: Duration },
    #[error("wait for tab {0} was cancelled")]
    Cancelled(TabId),
}

struct Registration {
    generation: u64,
    sender: oneshot::Sender<WatchSignal>,
}

#[derive(Default)]
struct HubState {
    watchers: HashMap<TabId, Registration>,
    early: VecDeque<TabId>,
    next_generation: u64,
}

/// Routes tab events to at most one pending [`TabLoadWatch`] per tab.
///
/// A watch fires on the first load-complete of its own tab and is removed at
/// that moment, so repeated completions never fire it again. A tab that
/// completes before anyone watches it is remembered (bounded) and fires its
/// watch on registration.
#[derive(Default)]
pub struct TabWatches {
    state: Mutex<HubState>,
}

impl TabWatches {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatch(&self, event: TabEvent) {
        let mut state = self.state();
        match event {
            TabEvent::Updated {
                tab,
                status: TabStatus::Complete,
            } => {
                if let Some(registration) = state.watchers.remove(&tab) {
                    let _ = registration.sender.send(WatchSignal::Loaded);
                } else if !state.early.contains(&tab) {
                    state.early.push_back(tab);
                    if state.early.len() > EARLY_COMPLETION_CAPACITY {
                        state.early.pop_front();
                    }
                }
            }
            TabEvent::Updated {
                status: TabStatus::Loading,
                ..
            } => {}
            TabEvent::Removed { tab } => {
                if let Some(registration) = state.watchers.remove(&tab) {
                    let _ = registration.sender.send(WatchSignal::Removed);
                }
                state.early.retain(|known| known != &tab);
            }
        }
    }

    /// Register the watch for `tab`, replacing any earlier one.
    pub fn watch(self: &Arc<Self>, tab: TabId) -> TabLoadWatch {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state();
        state.next_generation += 1;
        let generation = state.next_generation;

        if let Some(pos) = state.early.iter().position(|known| known == &tab) {
            state.early.remove(pos);
            let _ = sender.send(WatchSignal::Loaded);
        } else if state
            .watchers
            .insert(tab.clone(), Registration { generation, sender })
            .is_some()
        {
            log::warn!("replaced an existing load watch for tab {tab}");
        }
        drop(state);

        TabLoadWatch {
            tab,
            generation,
            receiver,
            hub: Arc::clone(self),
        }
    }

    /// Number of registered watches still waiting.
    pub fn active(&self) -> usize {
        self.state().watchers.len()
    }

    pub fn is_watching(&self, tab: &TabId) -> bool {
        self.state().watchers.contains_key(tab)
    }

    fn unregister(&self, tab: &TabId, generation: u64) {
        let mut state = self.state();
        let ours = state
            .watchers
            .get(tab)
            .map(|registration| registration.generation == generation)
            .unwrap_or(false);
        if ours {
            state.watchers.remove(tab);
        }
    }
}

/// One-shot wait for a single tab to finish loading.
///
/// Dropping the watch unregisters it.
pub struct TabLoadWatch {
    tab: TabId,
    generation: u64,
    receiver: oneshot::Receiver<WatchSignal>,
    hub: Arc<TabWatches>,
}

impl TabLoadWatch {
    /// Resolve on the tab's first load-complete, or fail on close, timeout or
    /// cancellation. The registration is gone in every case.
    pub async fn loaded(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TabId, WatchError> {
        let tab = self.tab.clone();
        tokio::select! {
            biased;
            signal = &mut self.receiver => match signal {
                Ok(WatchSignal::Loaded) => Ok(tab),
                Ok(WatchSignal::Removed) | Err(_) => Err(WatchError::TabClosed(tab)),
            },
            _ = cancel.cancelled() => Err(WatchError::Cancelled(tab)),
            _ = tokio::time::sleep(timeout) => Err(WatchError::TimedOut { tab, timeout }),
        }
    }
}

impl Drop for TabLoadWatch {
    fn drop(&mut self) {
        self.hub.unregister(&self.tab, self.generation);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn complete(tab: &str) -> TabEvent {
        TabEvent::Updated {
            tab: TabId::from(tab),
            status: TabStatus::Complete,
        }
    }

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn fires_only_for_the_watched_tab() {
        let hub = TabWatches::new();
        let watch = hub.watch(TabId::from("7"));
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn(async move { watch.loaded(LONG, &cancel).await });
        tokio::task::yield_now().await;

        hub.dispatch(complete("8"));
        hub.dispatch(TabEvent::Updated {
            tab: TabId::from("7"),
            status: TabStatus::Loading,
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert!(hub.is_watching(&TabId::from("7")));

        hub.dispatch(complete("7"));
        assert_eq!(waiter.await.unwrap(), Ok(TabId::from("7")));
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_complete_does_not_fire_again() {
        let hub = TabWatches::new();
        let watch = hub.watch(TabId::from("1"));
        hub.dispatch(complete("1"));
        hub.dispatch(complete("1"));
        let cancel = CancellationToken::new();
        assert_eq!(watch.loaded(LONG, &cancel).await, Ok(TabId::from("1")));
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_before_registration_is_not_lost() {
        let hub = TabWatches::new();
        hub.dispatch(complete("3"));
        let cancel = CancellationToken::new();
        let watch = hub.watch(TabId::from("3"));
        assert_eq!(hub.active(), 0);
        assert_eq!(watch.loaded(LONG, &cancel).await, Ok(TabId::from("3")));

        // The remembered completion is spent.
        let again = hub.watch(TabId::from("3"));
        assert_eq!(
            again.loaded(Duration::from_millis(10), &cancel).await,
            Err(WatchError::TimedOut {
                tab: TabId::from("3"),
                timeout: Duration::from_millis(10)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_unregisters() {
        let hub = TabWatches::new();
        let watch = hub.watch(TabId::from("5"));
        assert_eq!(hub.active(), 1);
        let cancel = CancellationToken::new();
        let result = watch.loaded(Duration::from_millis(250), &cancel).await;
        assert!(matches!(result, Err(WatchError::TimedOut { .. })));
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_unregisters() {
        let hub = TabWatches::new();
        let watch = hub.watch(TabId::from("5"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            watch.loaded(LONG, &cancel).await,
            Err(WatchError::Cancelled(TabId::from("5")))
        );
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tab_removal_ends_the_wait() {
        let hub = TabWatches::new();
        let watch = hub.watch(TabId::from("9"));
        hub.dispatch(TabEvent::Removed {
            tab: TabId::from("9"),
        });
        let cancel = CancellationToken::new();
        assert_eq!(
            watch.loaded(LONG, &cancel).await,
            Err(WatchError::TabClosed(TabId::from("9")))
        );
        assert_eq!(hub.active(), 0);
    }

    #[test]
    fn dropping_a_watch_unregisters_only_itself() {
        let hub = TabWatches::new();
        let first = hub.watch(TabId::from("2"));
        let second = hub.watch(TabId::from("2"));
        drop(first);
        assert!(hub.is_watching(&TabId::from("2")));
        drop(second);
        assert!(!hub.is_watching(&TabId::from("2")));
    }

    #[test]
    fn early_completions_are_bounded() {
        let hub = TabWatches::new();
        for i in 0..(EARLY_COMPLETION_CAPACITY + 5) {
            hub.dispatch(complete(&i.to_string()));
        }
        assert_eq!(hub.state().early.len(), EARLY_COMPLETION_CAPACITY);
        assert!(!hub.state().early.contains(&TabId::from("0")));
    }
}
