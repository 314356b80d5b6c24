//! In-process surface: a scriptable messaging interface held in memory.
//!
//! Implements both [`ObservationLayer`] and [`ActionLayer`]. It behaves like a
//! small chat client: one conversation is visible at a time, activating a
//! contact re-renders the message list, submitting clears the input and echoes
//! the sent text back as an operator message. Knobs exist to make activation,
//! submission and element lookup misbehave.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    ActionLayer, ContactItem, ElementHandle, ElementRole, ListKind, MessageElement, Mutation,
    MutationBatch, ObservationLayer, SenderRole, SurfaceNode,
};
use crate::error::SurfaceError;
use crate::identity::normalize;

const INPUT_HANDLE: &str = "input";
const SEND_HANDLE: &str = "send";
const CONTACT_PREFIX: &str = "contact:";
const FEED_CAPACITY: usize = 64;

/// What was delivered through the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentKind {
    Text,
    LeadTool,
}

/// One outbound item recorded by the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Raw id of the conversation that was active at send time.
    pub conversation: Option<String>,
    pub kind: SentKind,
    /// Message text, or the tool id for lead tools.
    pub content: String,
}

#[derive(Default)]
struct Inner {
    contacts: Vec<ContactItem>,
    messages: HashMap<String, Vec<MessageElement>>,
    active: Option<String>,
    input: String,
    input_missing: bool,
    send_missing: bool,
    submit_disabled: bool,
    swallowed_submits: u32,
    activation_redirect: Option<String>,
    activations: Vec<String>,
    sent: Vec<SentRecord>,
    subscribers: HashMap<ListKind, Vec<mpsc::UnboundedSender<MutationBatch>>>,
    subscribe_counts: HashMap<ListKind, usize>,
    echo_counter: u64,
}

impl Inner {
    fn emit(&mut self, kind: ListKind, mutation: Mutation) {
        if let Some(senders) = self.subscribers.get_mut(&kind) {
            senders.retain(|tx| tx.send(vec![mutation.clone()]).is_ok());
        }
    }

    fn visible_messages(&self) -> Vec<MessageElement> {
        self.active
            .as_deref()
            .and_then(|raw| self.messages.get(&normalize(raw)))
            .cloned()
            .unwrap_or_default()
    }

    fn contact_raw_id(handle: &ElementHandle) -> Option<&str> {
        handle.0.strip_prefix(CONTACT_PREFIX)
    }

    fn record_send(&mut self, kind: SentKind, content: String) -> SentRecord {
        let record = SentRecord {
            conversation: self.active.clone(),
            kind,
            content,
        };
        self.sent.push(record.clone());
        record
    }

    fn echo_operator_message(&mut self, text: &str) {
        let Some(active) = self.active.clone() else {
            return;
        };
        self.echo_counter += 1;
        let element = MessageElement::text(&format!("out-{}", self.echo_counter), text)
            .with_sender(SenderRole::Operator)
            .with_container(&active)
            .with_time(&chrono::Local::now().format("%H:%M").to_string());
        self.messages
            .entry(normalize(&active))
            .or_default()
            .push(element.clone());
        self.emit(
            ListKind::Messages,
            Mutation {
                added: vec![SurfaceNode::Message(element)],
                removed: vec![],
            },
        );
    }
}

/// Scriptable in-memory surface.
pub struct MemorySurface {
    inner: Mutex<Inner>,
    change_source: bool,
    feed: broadcast::Sender<SentRecord>,
}

impl MemorySurface {
    /// Surface with live change notifications.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Surface without a change source; observers must poll.
    pub fn without_change_source() -> Self {
        Self::build(false)
    }

    fn build(change_source: bool) -> Self {
        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            change_source,
            feed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a conversation to the contact list.
    pub fn add_contact(&self, raw_id: &str, label: &str) {
        let mut inner = self.lock();
        let item = ContactItem {
            handle: ElementHandle::new(format!("{CONTACT_PREFIX}{raw_id}")),
            raw_id: Some(raw_id.to_string()),
            label: label.to_string(),
            unread: 0,
        };
        inner.contacts.push(item.clone());
        inner.emit(
            ListKind::Conversations,
            Mutation {
                added: vec![SurfaceNode::Contact(item)],
                removed: vec![],
            },
        );
    }

    pub fn has_contact(&self, raw_id: &str) -> bool {
        let key = normalize(raw_id);
        self.lock()
            .contacts
            .iter()
            .any(|c| c.raw_id.as_deref().map(normalize).as_deref() == Some(key.as_str()))
    }

    /// Raw id of the visible conversation.
    pub fn active(&self) -> Option<String> {
        self.lock().active.clone()
    }

    /// Force the visible conversation without recording an activation.
    pub fn set_active(&self, raw_id: Option<&str>) {
        self.lock().active = raw_id.map(String::from);
    }

    /// Deliver a message into a conversation.
    ///
    /// The element is stamped with the conversation as its container. If the
    /// conversation is visible the message list changes, otherwise the
    /// contact's unread badge is bumped.
    pub fn push_message(&self, conversation: &str, mut element: MessageElement) {
        if element.container_id.is_none() {
            element.container_id = Some(conversation.to_string());
        }
        let mut inner = self.lock();
        let key = normalize(conversation);
        inner
            .messages
            .entry(key.clone())
            .or_default()
            .push(element.clone());

        let visible = inner.active.as_deref().map(normalize).as_deref() == Some(key.as_str());
        if visible {
            inner.emit(
                ListKind::Messages,
                Mutation {
                    added: vec![SurfaceNode::Message(element)],
                    removed: vec![],
                },
            );
            return;
        }

        let updated = inner
            .contacts
            .iter_mut()
            .find(|c| c.raw_id.as_deref().map(normalize).as_deref() == Some(key.as_str()))
            .map(|c| {
                c.unread += 1;
                c.clone()
            });
        if let Some(contact) = updated {
            inner.emit(
                ListKind::Conversations,
                Mutation {
                    added: vec![SurfaceNode::Contact(contact)],
                    removed: vec![],
                },
            );
        }
    }

    /// Emit a message node that belongs to no known conversation.
    pub fn push_orphan_message(&self, element: MessageElement) {
        self.lock().emit(
            ListKind::Messages,
            Mutation {
                added: vec![SurfaceNode::Message(element)],
                removed: vec![],
            },
        );
    }

    /// Make every activation land on `raw_id` instead of the requested contact.
    pub fn set_activation_redirect(&self, raw_id: Option<&str>) {
        self.lock().activation_redirect = raw_id.map(String::from);
    }

    pub fn set_submit_disabled(&self, disabled: bool) {
        self.lock().submit_disabled = disabled;
    }

    /// Ignore the next `count` submissions (input is left untouched).
    pub fn swallow_submits(&self, count: u32) {
        self.lock().swallowed_submits = count;
    }

    /// Hide or show the input surface and send control.
    pub fn set_controls_present(&self, input: bool, send: bool) {
        let mut inner = self.lock();
        inner.input_missing = !input;
        inner.send_missing = !send;
    }

    /// Drop all change subscribers of a list, as if the source went away.
    pub fn close_subscriptions(&self, kind: ListKind) {
        self.lock().subscribers.remove(&kind);
    }

    /// Raw ids passed to `activate`, in order.
    pub fn activations(&self) -> Vec<String> {
        self.lock().activations.clone()
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    pub fn input_text(&self) -> String {
        self.lock().input.clone()
    }

    /// How many times `subscribe_list` was called for a list.
    pub fn subscribe_count(&self, kind: ListKind) -> usize {
        self.lock().subscribe_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Live feed of everything the surface sends.
    pub fn subscribe_sent(&self) -> broadcast::Receiver<SentRecord> {
        self.feed.subscribe()
    }

    fn check_input(inner: &Inner, handle: &ElementHandle) -> Result<(), SurfaceError> {
        if inner.input_missing || handle.0 != INPUT_HANDLE {
            return Err(SurfaceError::ElementNotFound {
                handle: handle.0.clone(),
            });
        }
        Ok(())
    }

    fn check_send(inner: &Inner, handle: &ElementHandle) -> Result<(), SurfaceError> {
        if inner.send_missing || handle.0 != SEND_HANDLE {
            return Err(SurfaceError::ElementNotFound {
                handle: handle.0.clone(),
            });
        }
        Ok(())
    }

    /// Shared submit path; `force` bypasses the disabled flag.
    fn do_submit(&self, force: bool) {
        let record = {
            let mut inner = self.lock();
            if inner.swallowed_submits > 0 {
                inner.swallowed_submits -= 1;
                debug!("Memory surface swallowed a submit");
                return;
            }
            if (inner.submit_disabled && !force) || inner.input.is_empty() {
                return;
            }
            let text = std::mem::take(&mut inner.input);
            let record = inner.record_send(SentKind::Text, text.clone());
            inner.echo_operator_message(&text);
            record
        };
        let _ = self.feed.send(record);
    }
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObservationLayer for MemorySurface {
    fn subscribe_list(&self, kind: ListKind) -> Option<mpsc::UnboundedReceiver<MutationBatch>> {
        if !self.change_source {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.subscribers.entry(kind).or_default().push(tx);
        *inner.subscribe_counts.entry(kind).or_default() += 1;
        Some(rx)
    }

    async fn query_active_conversation_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    async fn elements_by_role(&self, role: ElementRole) -> Vec<SurfaceNode> {
        let inner = self.lock();
        match role {
            ElementRole::ContactItem => inner
                .contacts
                .iter()
                .cloned()
                .map(SurfaceNode::Contact)
                .collect(),
            ElementRole::MessageItem => inner
                .visible_messages()
                .into_iter()
                .map(SurfaceNode::Message)
                .collect(),
            ElementRole::InputSurface if !inner.input_missing => vec![SurfaceNode::Control {
                handle: ElementHandle::new(INPUT_HANDLE),
                role,
            }],
            ElementRole::SendControl if !inner.send_missing => vec![SurfaceNode::Control {
                handle: ElementHandle::new(SEND_HANDLE),
                role,
            }],
            ElementRole::InputSurface | ElementRole::SendControl => Vec::new(),
        }
    }

    async fn input_value(&self, input: &ElementHandle) -> Result<String, SurfaceError> {
        let inner = self.lock();
        Self::check_input(&inner, input)?;
        Ok(inner.input.clone())
    }
}

#[async_trait]
impl ActionLayer for MemorySurface {
    async fn activate(&self, target: &ElementHandle) -> Result<(), SurfaceError> {
        let mut inner = self.lock();
        let raw = Inner::contact_raw_id(target)
            .filter(|raw| {
                inner
                    .contacts
                    .iter()
                    .any(|c| c.raw_id.as_deref() == Some(*raw))
            })
            .map(String::from)
            .ok_or_else(|| SurfaceError::ElementNotFound {
                handle: target.0.clone(),
            })?;

        inner.activations.push(raw.clone());
        let landed = inner.activation_redirect.clone().unwrap_or(raw);
        let previous = inner.visible_messages();
        inner.active = Some(landed.clone());

        let key = normalize(&landed);
        if let Some(contact) = inner
            .contacts
            .iter_mut()
            .find(|c| c.raw_id.as_deref().map(normalize).as_deref() == Some(key.as_str()))
        {
            contact.unread = 0;
        }

        let current = inner.visible_messages();
        inner.emit(
            ListKind::Messages,
            Mutation {
                added: current.into_iter().map(SurfaceNode::Message).collect(),
                removed: previous.into_iter().map(SurfaceNode::Message).collect(),
            },
        );
        debug!(conversation = %landed, "Memory surface activated conversation");
        Ok(())
    }

    async fn set_input_value(&self, input: &ElementHandle, text: &str) -> Result<(), SurfaceError> {
        let mut inner = self.lock();
        Self::check_input(&inner, input)?;
        inner.input = text.to_string();
        Ok(())
    }

    async fn submit(&self, control: &ElementHandle) -> Result<(), SurfaceError> {
        Self::check_send(&self.lock(), control)?;
        self.do_submit(false);
        Ok(())
    }

    async fn is_submit_disabled(&self, control: &ElementHandle) -> Result<bool, SurfaceError> {
        let inner = self.lock();
        Self::check_send(&inner, control)?;
        Ok(inner.submit_disabled)
    }

    async fn submit_via_input(&self, input: &ElementHandle) -> Result<(), SurfaceError> {
        Self::check_input(&self.lock(), input)?;
        self.do_submit(true);
        Ok(())
    }

    async fn send_lead_tool(&self, tool_id: &str) -> Result<(), SurfaceError> {
        let record = {
            let mut inner = self.lock();
            if inner.active.is_none() {
                return Err(SurfaceError::ActionFailed {
                    action: "send_lead_tool".into(),
                    reason: "no active conversation".into(),
                });
            }
            inner.record_send(SentKind::LeadTool, tool_id.to_string())
        };
        let _ = self.feed.send(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activation_switches_visible_list() {
        let surface = MemorySurface::new();
        surface.add_contact("chat-1", "Alice");
        surface.add_contact("chat-2", "Bob");
        surface.push_message("chat-2", MessageElement::text("m1", "hi"));

        surface
            .activate(&ElementHandle::new("contact:chat-2"))
            .await
            .unwrap();
        assert_eq!(
            surface.query_active_conversation_id().await.as_deref(),
            Some("chat-2")
        );
        assert_eq!(surface.elements_by_role(ElementRole::MessageItem).await.len(), 1);
        assert_eq!(surface.activations(), vec!["chat-2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_contact_cannot_be_activated() {
        let surface = MemorySurface::new();
        let err = surface
            .activate(&ElementHandle::new("contact:nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SurfaceError::ElementNotFound { .. }));
    }

    #[tokio::test]
    async fn submit_clears_input_and_records() {
        let surface = MemorySurface::new();
        surface.add_contact("chat-1", "Alice");
        surface.set_active(Some("chat-1"));
        let input = ElementHandle::new(INPUT_HANDLE);
        surface.set_input_value(&input, "hello").await.unwrap();
        surface.submit(&ElementHandle::new(SEND_HANDLE)).await.unwrap();

        assert_eq!(surface.input_value(&input).await.unwrap(), "");
        let sent = surface.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "hello");
        assert_eq!(sent[0].conversation.as_deref(), Some("chat-1"));
    }

    #[tokio::test]
    async fn disabled_submit_only_passes_alternate_path() {
        let surface = MemorySurface::new();
        surface.set_active(Some("chat-1"));
        surface.set_submit_disabled(true);
        let input = ElementHandle::new(INPUT_HANDLE);
        surface.set_input_value(&input, "x").await.unwrap();

        surface.submit(&ElementHandle::new(SEND_HANDLE)).await.unwrap();
        assert!(surface.sent().is_empty());

        surface.submit_via_input(&input).await.unwrap();
        assert_eq!(surface.sent().len(), 1);
    }

    #[tokio::test]
    async fn hidden_controls_are_not_listed() {
        let surface = MemorySurface::new();
        surface.set_controls_present(false, true);
        assert!(surface.elements_by_role(ElementRole::InputSurface).await.is_empty());
        assert_eq!(surface.elements_by_role(ElementRole::SendControl).await.len(), 1);
    }

    #[tokio::test]
    async fn message_for_background_conversation_bumps_unread() {
        let surface = MemorySurface::new();
        surface.add_contact("chat-1", "Alice");
        let mut rx = surface.subscribe_list(ListKind::Conversations).unwrap();
        surface.push_message("chat-1", MessageElement::text("m1", "ping"));

        let batch = rx.recv().await.unwrap();
        match &batch[0].added[0] {
            SurfaceNode::Contact(c) => assert_eq!(c.unread, 1),
            other => panic!("expected contact, got {other:?}"),
        }
    }
}
