//! Surface: the observed messaging interface and the actions we can take on it.
//!
//! The concrete interface (a DOM, an accessibility tree, a test double) lives
//! behind two traits:
//! - [`ObservationLayer`]: read-only view plus change notifications
//! - [`ActionLayer`]: activation, input, submission
//!
//! Every node the layers hand out carries an opaque [`ElementHandle`] that the
//! action layer accepts back.

pub mod memory;
pub mod observer;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SurfaceError;

pub use memory::MemorySurface;
pub use observer::{ChangeEvent, ChangeObserver, Subscription};

/// Opaque reference to a surface element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

impl ElementHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two live collections we watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Conversations,
    Messages,
}

/// Element roles the observation layer can enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementRole {
    ContactItem,
    MessageItem,
    InputSurface,
    SendControl,
}

impl fmt::Display for ElementRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ContactItem => "contact item",
            Self::MessageItem => "message item",
            Self::InputSurface => "input surface",
            Self::SendControl => "send control",
        };
        f.write_str(label)
    }
}

/// Who authored a message node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The counterpart in the conversation.
    Contact,
    /// The operator (including replies sent by us).
    Operator,
    /// Interface-generated notices.
    System,
}

/// An entry in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactItem {
    pub handle: ElementHandle,
    /// Raw conversation id as exposed by the surface, if any.
    pub raw_id: Option<String>,
    /// Display name.
    pub label: String,
    /// Unread badge count.
    pub unread: u32,
}

/// Structured-card marker on a message node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardMarker {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// A message node in the visible message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageElement {
    pub handle: ElementHandle,
    /// Message-level id attribute.
    pub explicit_id: Option<String>,
    /// Conversation id carried by the enclosing container.
    pub container_id: Option<String>,
    /// Conversation id carried directly on the message.
    pub conversation_hint: Option<String>,
    pub sender: SenderRole,
    pub body: String,
    /// Time-of-day text as rendered (`"14:32"`, `"2:32 PM"`).
    pub time_text: Option<String>,
    pub card: Option<CardMarker>,
    /// Source marker of a spotlight/promoted message.
    pub source_marker: Option<String>,
}

impl MessageElement {
    /// A plain incoming text node.
    pub fn text(explicit_id: &str, body: &str) -> Self {
        Self {
            handle: ElementHandle::new(format!("msg:{explicit_id}")),
            explicit_id: Some(explicit_id.to_string()),
            container_id: None,
            conversation_hint: None,
            sender: SenderRole::Contact,
            body: body.to_string(),
            time_text: None,
            card: None,
            source_marker: None,
        }
    }

    pub fn with_time(mut self, time_text: &str) -> Self {
        self.time_text = Some(time_text.to_string());
        self
    }

    pub fn with_conversation(mut self, raw_id: &str) -> Self {
        self.conversation_hint = Some(raw_id.to_string());
        self
    }

    pub fn with_container(mut self, raw_id: &str) -> Self {
        self.container_id = Some(raw_id.to_string());
        self
    }

    pub fn with_sender(mut self, sender: SenderRole) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_card(mut self, title: Option<&str>, body: Option<&str>) -> Self {
        self.card = Some(CardMarker {
            title: title.map(String::from),
            body: body.map(String::from),
        });
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_marker = Some(source.to_string());
        self
    }
}

/// Any node the observation layer reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceNode {
    Contact(ContactItem),
    Message(MessageElement),
    Control {
        handle: ElementHandle,
        role: ElementRole,
    },
}

impl SurfaceNode {
    pub fn handle(&self) -> &ElementHandle {
        match self {
            Self::Contact(c) => &c.handle,
            Self::Message(m) => &m.handle,
            Self::Control { handle, .. } => handle,
        }
    }
}

/// One raw mutation record from the underlying change source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    pub added: Vec<SurfaceNode>,
    pub removed: Vec<SurfaceNode>,
}

/// All mutation records delivered by one underlying callback.
pub type MutationBatch = Vec<Mutation>;

/// Read-only view of the messaging interface.
#[async_trait]
pub trait ObservationLayer: Send + Sync {
    /// Subscribe to raw mutation batches of a live list.
    ///
    /// Returns `None` when the surface has no change source for that list;
    /// callers fall back to polling.
    fn subscribe_list(&self, kind: ListKind) -> Option<mpsc::UnboundedReceiver<MutationBatch>>;

    /// The conversation the interface currently shows, as a raw id.
    async fn query_active_conversation_id(&self) -> Option<String>;

    /// Enumerate elements with the given role.
    async fn elements_by_role(&self, role: ElementRole) -> Vec<SurfaceNode>;

    /// Current text of an input surface.
    async fn input_value(&self, input: &ElementHandle) -> Result<String, SurfaceError>;
}

/// Side-effecting operations on the interface. All are retry-safe.
#[async_trait]
pub trait ActionLayer: Send + Sync {
    /// Bring a conversation to the foreground.
    async fn activate(&self, target: &ElementHandle) -> Result<(), SurfaceError>;

    async fn set_input_value(&self, input: &ElementHandle, text: &str) -> Result<(), SurfaceError>;

    async fn submit(&self, control: &ElementHandle) -> Result<(), SurfaceError>;

    async fn is_submit_disabled(&self, control: &ElementHandle) -> Result<bool, SurfaceError>;

    /// Alternate submission path (e.g. an Enter keystroke on the input).
    async fn submit_via_input(&self, input: &ElementHandle) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported(format!(
            "alternate submission on {input}"
        )))
    }

    /// Send a lead tool into the active conversation.
    async fn send_lead_tool(&self, tool_id: &str) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported(format!("lead tool {tool_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder_sets_fields() {
        let el = MessageElement::text("m1", "hello")
            .with_time("10:00")
            .with_container("chat-1")
            .with_card(Some("Title"), None)
            .with_source("ad");
        assert_eq!(el.explicit_id.as_deref(), Some("m1"));
        assert_eq!(el.time_text.as_deref(), Some("10:00"));
        assert_eq!(el.container_id.as_deref(), Some("chat-1"));
        assert_eq!(el.card.unwrap().title.as_deref(), Some("Title"));
        assert_eq!(el.source_marker.as_deref(), Some("ad"));
        assert_eq!(el.sender, SenderRole::Contact);
    }

    #[test]
    fn node_handle_accessor() {
        let node = SurfaceNode::Control {
            handle: ElementHandle::new("input"),
            role: ElementRole::InputSurface,
        };
        assert_eq!(node.handle().0, "input");
    }
}
