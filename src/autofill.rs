pub mod selector;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::page::{DomEvent, PageModel};
use crate::staging::{Consumed, StagedSecret, StagingSlot};
use selector::{FieldRole, SelectorCascade};

/// Wait before field discovery so the page can finish rendering.
pub const RENDER_DELAY_MS: u64 = 1_000;
/// Wait between filling and submitting so page validation handlers can run.
pub const SETTLE_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutofillTimings {
    pub render_delay_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for AutofillTimings {
    fn default() -> Self {
        Self {
            render_delay_ms: RENDER_DELAY_MS,
            settle_delay_ms: SETTLE_DELAY_MS,
        }
    }
}

/// How one executor run ended. Logged by the coordinator, never shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutofillOutcome {
    NoPendingSecret,
    Expired { age_ms: i64 },
    FieldsNotFound { missing: FieldRole },
    FilledWithoutSubmit,
    SubmittedViaControl,
    SubmittedViaForm,
    /// The page rejected an interaction part way through.
    Interrupted { step: &'static str },
}

/// Page-scoped half of the hand-off: consume the staged secret, then fill and
/// submit the login form.
#[derive(Debug, Clone, Default)]
pub struct FormAutofillExecutor {
    selectors: SelectorCascade,
    timings: AutofillTimings,
}

impl FormAutofillExecutor {
    pub fn new(selectors: SelectorCascade, timings: AutofillTimings) -> Self {
        Self { selectors, timings }
    }

    /// Run once against `page`. The slot is always empty afterwards.
    pub async fn run<P: PageModel>(&self, slot: &StagingSlot, page: &P) -> AutofillOutcome {
        let secret = match slot.try_consume() {
            Consumed::Fresh(secret) => secret,
            Consumed::Expired { age_ms } => {
                log::debug!("discarded staged secret older than the freshness window ({age_ms}ms)");
                return AutofillOutcome::Expired { age_ms };
            }
            Consumed::Empty => return AutofillOutcome::NoPendingSecret,
        };

        tokio::time::sleep(Duration::from_millis(self.timings.render_delay_ms)).await;
        self.fill_and_submit(page, secret).await
    }

    /// First candidate for `role` that matches an element on the page.
    pub async fn discover<P: PageModel>(&self, page: &P, role: FieldRole) -> Option<P::Element> {
        for selector in self.selectors.candidates(role) {
            if let Some(element) = page.query_selector(selector).await {
                log::debug!("{role} field matched '{selector}'");
                return Some(element);
            }
        }
        None
    }

    /// Discovery stops at the first missing role, so a page without a
    /// username field is only ever queried.
    async fn fill_and_submit<P: PageModel>(&self, page: &P, secret: StagedSecret) -> AutofillOutcome {
        let Some(username_field) = self.discover(page, FieldRole::Username).await else {
            return AutofillOutcome::FieldsNotFound {
                missing: FieldRole::Username,
            };
        };
        let Some(password_field) = self.discover(page, FieldRole::Password).await else {
            return AutofillOutcome::FieldsNotFound {
                missing: FieldRole::Password,
            };
        };
        let submit_control = self.discover(page, FieldRole::Submit).await;

        if let Err(err) = page.set_value(&username_field, &secret.username).await {
            log::debug!("username fill failed: {err}");
            return AutofillOutcome::Interrupted { step: "fill" };
        }
        if let Err(err) = page.set_value(&password_field, &secret.password).await {
            log::warn!("password fill failed after the username was filled; leaving the form unsubmitted: {err}");
            return AutofillOutcome::Interrupted { step: "fill" };
        }
        drop(secret);

        for field in [&username_field, &password_field] {
            for event in [DomEvent::Input, DomEvent::Change] {
                if let Err(err) = page.dispatch_event(field, event).await {
                    log::debug!("failed to dispatch {event} event: {err}");
                    return AutofillOutcome::Interrupted { step: "dispatch" };
                }
            }
        }

        let settle = Duration::from_millis(self.timings.settle_delay_ms);
        if let Some(submit) = submit_control {
            tokio::time::sleep(settle).await;
            return match page.click(&submit).await {
                Ok(()) => AutofillOutcome::SubmittedViaControl,
                Err(err) => {
                    log::debug!("submit click failed: {err}");
                    AutofillOutcome::Interrupted { step: "click" }
                }
            };
        }

        match page.closest_form(&username_field).await {
            Some(form) => {
                tokio::time::sleep(settle).await;
                match page.submit_form(&form).await {
                    Ok(()) => AutofillOutcome::SubmittedViaForm,
                    Err(err) => {
                        log::debug!("form submit failed: {err}");
                        AutofillOutcome::Interrupted { step: "submit" }
                    }
                }
            }
            None => AutofillOutcome::FilledWithoutSubmit,
        }
    }
}
