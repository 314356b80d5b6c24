//! Message classification, fingerprinting and deduplication.
//!
//! Turns a raw [`MessageElement`] into a [`Message`] or a [`DropReason`].
//! Steps run in order: conversation resolution, self-authored filter, kind
//! detection, fingerprint, staleness, dedup.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use chrono::NaiveTime;
use tracing::debug;

use crate::identity::ConversationId;
use crate::pipeline::dedup::DedupCache;
use crate::pipeline::types::{Message, MessageKind};
use crate::surface::{MessageElement, SenderRole};

/// Forward clock skew tolerated before a future timestamp is read as "yesterday".
const MAX_FORWARD_SKEW: Duration = Duration::from_secs(5 * 60);

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%I:%M:%S %p", "%I:%M %p", "%I:%M%p"];

/// Why a message element was not turned into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No conversation id could be resolved.
    Unresolved,
    /// Written by the operator or the interface itself.
    SelfAuthored,
    EmptyBody,
    /// Card marker present but title and body both empty.
    EmptyCard,
    Stale,
    Duplicate,
}

impl DropReason {
    /// Whether the drop indicates a malfunction rather than expected filtering.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unresolved => "unresolved conversation",
            Self::SelfAuthored => "self-authored",
            Self::EmptyBody => "empty body",
            Self::EmptyCard => "empty card",
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
        };
        f.write_str(label)
    }
}

/// Per-call inputs that come from outside the classifier.
#[derive(Debug, Clone)]
pub struct ClassifyContext<'a> {
    /// Conversation the tracker believes is active.
    pub active: Option<&'a ConversationId>,
    /// A switch happened within the cool-down window.
    pub just_switched: bool,
    pub stale_after: Duration,
    /// Local time of day used for the staleness check.
    pub now: NaiveTime,
}

/// Stateful classifier owning the dedup cache.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    dedup: DedupCache,
}

impl Classifier {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            dedup: DedupCache::new(dedup_capacity),
        }
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Forget every fingerprint (used on recovery).
    pub fn clear_dedup(&mut self) {
        self.dedup.clear();
    }

    /// Apply a new cache capacity if the setting changed.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity.max(1) != self.dedup.capacity() {
            self.dedup.resize(capacity);
        }
    }

    pub fn classify(
        &mut self,
        element: &MessageElement,
        ctx: &ClassifyContext<'_>,
    ) -> Result<Message, DropReason> {
        let result = self.classify_inner(element, ctx);
        if let Err(reason) = &result {
            debug!(handle = %element.handle, reason = %reason, "Dropped message");
        }
        result
    }

    fn classify_inner(
        &mut self,
        element: &MessageElement,
        ctx: &ClassifyContext<'_>,
    ) -> Result<Message, DropReason> {
        let conversation_id = resolve_conversation(element, ctx.active)?;

        if element.sender != SenderRole::Contact {
            return Err(DropReason::SelfAuthored);
        }

        let (kind, title, content) = detect_kind(element)?;
        let fingerprint = fingerprint(&conversation_id, element, kind, &content);

        if !ctx.just_switched {
            let sent_at = element.time_text.as_deref().and_then(parse_time_of_day);
            if sent_at.is_some_and(|at| message_age(ctx.now, at) > ctx.stale_after) {
                return Err(DropReason::Stale);
            }
        }

        if !self.dedup.insert(&fingerprint) {
            return Err(DropReason::Duplicate);
        }

        Ok(Message {
            fingerprint,
            conversation_id,
            sender: element.sender,
            content,
            kind,
            title,
            source_info: element.source_marker.clone(),
            timestamp: element.time_text.clone(),
            processed: false,
        })
    }
}

/// Conversation id from the message, then its container, then the tracker.
fn resolve_conversation(
    element: &MessageElement,
    active: Option<&ConversationId>,
) -> Result<ConversationId, DropReason> {
    [
        element.conversation_hint.as_deref(),
        element.container_id.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(ConversationId::new)
    .find(|id| !id.is_unknown())
    .or_else(|| active.filter(|id| !id.is_unknown()).cloned())
    .ok_or(DropReason::Unresolved)
}

fn detect_kind(
    element: &MessageElement,
) -> Result<(MessageKind, Option<String>, String), DropReason> {
    let body = element.body.trim();

    if element.source_marker.is_some() {
        if body.is_empty() {
            return Err(DropReason::EmptyBody);
        }
        return Ok((MessageKind::Spotlight, None, body.to_string()));
    }

    if let Some(card) = &element.card {
        let title = card
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let card_body = card
            .body
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());
        let content = match (title, card_body) {
            (None, None) => return Err(DropReason::EmptyCard),
            (Some(t), None) => t.to_string(),
            (None, Some(b)) => b.to_string(),
            (Some(t), Some(b)) => format!("{t}\n{b}"),
        };
        return Ok((MessageKind::Card, title.map(String::from), content));
    }

    if body.is_empty() {
        return Err(DropReason::EmptyBody);
    }
    Ok((MessageKind::Text, None, body.to_string()))
}

fn fingerprint(
    conversation: &ConversationId,
    element: &MessageElement,
    kind: MessageKind,
    content: &str,
) -> String {
    let explicit = element
        .explicit_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let time = element
        .time_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let id_part = match explicit {
        Some(id) => id.to_string(),
        None => format!("h{:016x}", content_digest(content)),
    };
    let mut fp = format!("{conversation}:{id_part}:{}:{kind}", time.unwrap_or("-"));
    if explicit.is_none() && time.is_none() {
        // Nothing stable to key on; every sighting counts as new.
        fp.push_str(&format!(":r{:016x}", rand::random::<u64>()));
    }
    fp
}

fn content_digest(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Parse a rendered time of day (`"14:32"`, `"14:32:05"`, `"2:32 PM"`).
pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
}

/// How long ago `sent_at` was relative to `now`, both local times of day.
///
/// A timestamp slightly ahead of `now` counts as zero; one far ahead is taken
/// to be from before midnight.
pub fn message_age(now: NaiveTime, sent_at: NaiveTime) -> Duration {
    let mut secs = (now - sent_at).num_seconds();
    if secs < 0 {
        if secs.unsigned_abs() <= MAX_FORWARD_SKEW.as_secs() {
            return Duration::ZERO;
        }
        secs += SECONDS_PER_DAY;
    }
    Duration::from_secs(secs.max(0) as u64)
}
