pub mod document;

use async_trait::async_trait;
use std::fmt;

use crate::autofill::selector::Selector;

/// Synthetic DOM events the executor fires after assigning a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomEvent {
    Input,
    Change,
}

impl DomEvent {
    pub fn name(self) -> &'static str {
        match self {
            DomEvent::Input => "input",
            DomEvent::Change => "change",
        }
    }
}

impl fmt::Display for DomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("element is no longer attached to the document")]
    Detached,
    #[error("page script failed: {0}")]
    Script(String),
    #[error("page is closed")]
    Closed,
}

/// The live document of one tab, as seen by the autofill executor.
///
/// Element handles are opaque to the executor; they only flow back into the
/// same page they came from.
#[async_trait]
pub trait PageModel: Send + Sync {
    type Element: Clone + Send + Sync + fmt::Debug;

    /// First element in document order matching `selector`.
    async fn query_selector(&self, selector: &Selector) -> Option<Self::Element>;

    async fn set_value(&self, element: &Self::Element, value: &str) -> Result<(), PageError>;

    /// Dispatch a bubbling event of the given kind on `element`.
    async fn dispatch_event(&self, element: &Self::Element, event: DomEvent)
        -> Result<(), PageError>;

    async fn click(&self, element: &Self::Element) -> Result<(), PageError>;

    /// Nearest `<form>` ancestor of `element`, if any.
    async fn closest_form(&self, element: &Self::Element) -> Option<Self::Element>;

    async fn submit_form(&self, form: &Self::Element) -> Result<(), PageError>;
}

#[async_trait]
impl<P: PageModel + ?Sized> PageModel for std::sync::Arc<P> {
    type Element = P::Element;

    async fn query_selector(&self, selector: &Selector) -> Option<Self::Element> {
        (**self).query_selector(selector).await
    }

    async fn set_value(&self, element: &Self::Element, value: &str) -> Result<(), PageError> {
        (**self).set_value(element, value).await
    }

    async fn dispatch_event(
        &self,
        element: &Self::Element,
        event: DomEvent,
    ) -> Result<(), PageError> {
        (**self).dispatch_event(element, event).await
    }

    async fn click(&self, element: &Self::Element) -> Result<(), PageError> {
        (**self).click(element).await
    }

    async fn closest_form(&self, element: &Self::Element) -> Option<Self::Element> {
        (**self).closest_form(element).await
    }

    async fn submit_form(&self, form: &Self::Element) -> Result<(), PageError> {
        (**self).submit_form(form).await
    }
}
