use async_trait::async_trait;
use scraper::{ElementRef, Html};
use std::sync::{Mutex, MutexGuard};

use super::{DomEvent, PageError, PageModel};
use crate::autofill::selector::Selector;

/// Index of an element inside a [`StaticDocument`], in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    tag: String,
    id: Option<String>,
    parent: Option<NodeId>,
}

/// An interaction the executor performed on the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    SetValue(NodeId),
    Dispatch(NodeId, DomEvent),
    Click(NodeId),
    SubmitForm(NodeId),
}

#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub action: PageAction,
    pub at: tokio::time::Instant,
}

#[derive(Debug, Default)]
struct DocumentState {
    values: Vec<String>,
    actions: Vec<RecordedAction>,
    detached: Vec<NodeId>,
    closed: bool,
}

/// An HTML fragment implementing [`PageModel`].
///
/// Selectors are matched by `scraper` against the parsed markup. Every
/// interaction is recorded with the Tokio clock so callers can check ordering
/// and delays. The markup itself never changes; assigned values live beside it.
#[derive(Debug)]
pub struct StaticDocument {
    source: String,
    nodes: Vec<Node>,
    state: Mutex<DocumentState>,
}

/// Every element of `html` in document order. Positions are [`NodeId`]s.
fn elements(html: &Html) -> Vec<ElementRef<'_>> {
    html.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect()
}

impl StaticDocument {
    pub fn parse(markup: &str) -> Self {
        let html = Html::parse_fragment(markup);
        let elements = elements(&html);
        let position = |target: ElementRef<'_>| {
            elements
                .iter()
                .position(|el| el.id() == target.id())
                .map(NodeId)
        };

        let mut nodes = Vec::with_capacity(elements.len());
        let mut values = Vec::with_capacity(elements.len());
        for el in &elements {
            nodes.push(Node {
                tag: el.value().name().to_string(),
                id: el.value().id().map(str::to_string),
                parent: el.parent().and_then(ElementRef::wrap).and_then(position),
            });
            values.push(el.value().attr("value").unwrap_or_default().to_string());
        }

        Self {
            source: markup.to_string(),
            nodes,
            state: Mutex::new(DocumentState {
                values,
                ..DocumentState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.id.as_deref() == Some(id))
            .map(NodeId)
    }

    pub fn value_of(&self, node: NodeId) -> Option<String> {
        self.state().values.get(node.0).cloned()
    }

    pub fn actions(&self) -> Vec<RecordedAction> {
        self.state().actions.clone()
    }

    pub fn events_for(&self, node: NodeId) -> Vec<DomEvent> {
        self.state()
            .actions
            .iter()
            .filter_map(|recorded| match recorded.action {
                PageAction::Dispatch(target, event) if target == node => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Make every later interaction fail as if the tab went away.
    pub fn close(&self) {
        self.state().closed = true;
    }

    /// Make later interactions with `node` fail as if a page script removed it.
    pub fn detach(&self, node: NodeId) {
        self.state().detached.push(node);
    }

    fn first_match(&self, selector: &Selector) -> Option<NodeId> {
        // `Html` is not `Send`, so it never lives across an await.
        let html = Html::parse_fragment(&self.source);
        let hit = html.select(selector.css()).next()?;
        elements(&html)
            .iter()
            .position(|el| el.id() == hit.id())
            .map(NodeId)
    }

    fn record(
        &self,
        node: NodeId,
        action: PageAction,
    ) -> Result<MutexGuard<'_, DocumentState>, PageError> {
        if node.0 >= self.nodes.len() {
            return Err(PageError::Detached);
        }
        let mut state = self.state();
        if state.closed {
            return Err(PageError::Closed);
        }
        if state.detached.contains(&node) {
            return Err(PageError::Detached);
        }
        state.actions.push(RecordedAction {
            action,
            at: tokio::time::Instant::now(),
        });
        Ok(state)
    }
}

#[async_trait]
impl PageModel for StaticDocument {
    type Element = NodeId;

    async fn query_selector(&self, selector: &Selector) -> Option<NodeId> {
        if self.state().closed {
            return None;
        }
        self.first_match(selector)
    }

    async fn set_value(&self, element: &NodeId, value: &str) -> Result<(), PageError> {
        let mut state = self.record(*element, PageAction::SetValue(*element))?;
        if let Some(slot) = state.values.get_mut(element.0) {
            *slot = value.to_string();
        }
        Ok(())
    }

    async fn dispatch_event(&self, element: &NodeId, event: DomEvent) -> Result<(), PageError> {
        self.record(*element, PageAction::Dispatch(*element, event))?;
        Ok(())
    }

    async fn click(&self, element: &NodeId) -> Result<(), PageError> {
        self.record(*element, PageAction::Click(*element))?;
        Ok(())
    }

    async fn closest_form(&self, element: &NodeId) -> Option<NodeId> {
        let mut current = Some(*element);
        while let Some(id) = current {
            let node = self.nodes.get(id.0)?;
            if node.tag == "form" {
                return Some(id);
            }
            current = node.parent;
        }
        None
    }

    async fn submit_form(&self, form: &NodeId) -> Result<(), PageError> {
        let is_form = self
            .nodes
            .get(form.0)
            .map(|node| node.tag == "form")
            .unwrap_or(false);
        if !is_form {
            return Err(PageError::Script("submit target is not a form".to_string()));
        }
        self.record(*form, PageAction::SubmitForm(*form))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LOGIN_FORM: &str = r#"
        <form id="login-form">
          <div class="field"><input id="username" value="prefilled"></div>
        </form>
        <input id="username-2">
    "#;

    #[tokio::test]
    async fn query_selector_returns_first_in_document_order() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        let selector = Selector::parse(r#"input[id*="username"]"#).unwrap();
        assert_eq!(doc.query_selector(&selector).await, Some(user));

        let missing = Selector::parse("#password").unwrap();
        assert_eq!(doc.query_selector(&missing).await, None);
    }

    #[tokio::test]
    async fn combinators_and_classes_match() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        let outside = doc.find_by_id("username-2").unwrap();

        let nested = Selector::parse("form#login-form .field > input").unwrap();
        assert_eq!(doc.query_selector(&nested).await, Some(user));
        let sibling = Selector::parse("form + input").unwrap();
        assert_eq!(doc.query_selector(&sibling).await, Some(outside));
    }

    #[tokio::test]
    async fn initial_values_come_from_markup() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        let outside = doc.find_by_id("username-2").unwrap();
        assert_eq!(doc.value_of(user).as_deref(), Some("prefilled"));
        assert_eq!(doc.value_of(outside).as_deref(), Some(""));
    }

    #[tokio::test]
    async fn closest_form_walks_ancestors() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let form = doc.find_by_id("login-form").unwrap();
        let user = doc.find_by_id("username").unwrap();
        assert_eq!(doc.closest_form(&user).await, Some(form));

        let outside = doc.find_by_id("username-2").unwrap();
        assert_eq!(doc.closest_form(&outside).await, None);
    }

    #[tokio::test]
    async fn interactions_are_recorded_in_order() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let form = doc.find_by_id("login-form").unwrap();
        let user = doc.find_by_id("username").unwrap();
        doc.set_value(&user, "alice").await.unwrap();
        doc.dispatch_event(&user, DomEvent::Input).await.unwrap();
        doc.submit_form(&form).await.unwrap();

        assert_eq!(doc.value_of(user).as_deref(), Some("alice"));
        let actions: Vec<_> = doc.actions().into_iter().map(|a| a.action).collect();
        assert_eq!(
            actions,
            vec![
                PageAction::SetValue(user),
                PageAction::Dispatch(user, DomEvent::Input),
                PageAction::SubmitForm(form),
            ]
        );
        assert_eq!(doc.events_for(user), vec![DomEvent::Input]);
    }

    #[tokio::test]
    async fn submit_requires_a_form() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        assert!(doc.submit_form(&user).await.is_err());
        assert!(doc.actions().is_empty());
    }

    #[tokio::test]
    async fn detached_element_rejects_interaction() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        doc.detach(user);
        assert!(matches!(
            doc.set_value(&user, "alice").await,
            Err(PageError::Detached)
        ));
        assert_eq!(doc.value_of(user).as_deref(), Some("prefilled"));
    }

    #[tokio::test]
    async fn closed_document_rejects_interaction() {
        let doc = StaticDocument::parse(LOGIN_FORM);
        let user = doc.find_by_id("username").unwrap();
        doc.close();
        assert!(matches!(doc.click(&user).await, Err(PageError::Closed)));
        let selector = Selector::parse("#username").unwrap();
        assert_eq!(doc.query_selector(&selector).await, None);
    }
}
