//! Contact tracker: which conversation is in front, and switching to another.
//!
//! A switch issues one activation, waits for the surface to settle and then
//! confirms the landing by re-reading the reported active conversation. Two
//! attempts are made. Switches are serialized; callers that need the surface
//! for longer (a whole send) hold the [`lease`](ContactTracker::lease).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::SwitchError;
use crate::identity::ConversationId;
use crate::retry::{DelayPolicy, RetryPolicy, retry};
use crate::surface::{ActionLayer, ContactItem, ElementHandle, ElementRole, ObservationLayer, SurfaceNode};

const SWITCH_ATTEMPTS: u32 = 2;

/// Tracker lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Switching { target: ConversationId },
    Active(ConversationId),
}

#[derive(Debug, Clone, Copy)]
struct SwitchTimings {
    settle_delay: Duration,
    cooldown: Duration,
}

#[derive(Debug)]
struct TrackerInner {
    state: TrackerState,
    last_switch: Option<Instant>,
    timings: SwitchTimings,
}

pub struct ContactTracker {
    observation: Arc<dyn ObservationLayer>,
    action: Arc<dyn ActionLayer>,
    inner: Mutex<TrackerInner>,
    switch_lock: tokio::sync::Mutex<()>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

impl ContactTracker {
    pub fn new(
        observation: Arc<dyn ObservationLayer>,
        action: Arc<dyn ActionLayer>,
        settings: &Settings,
    ) -> Self {
        Self {
            observation,
            action,
            inner: Mutex::new(TrackerInner {
                state: TrackerState::Idle,
                last_switch: None,
                timings: Self::timings_from(settings),
            }),
            switch_lock: tokio::sync::Mutex::new(()),
            lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn timings_from(settings: &Settings) -> SwitchTimings {
        SwitchTimings {
            settle_delay: settings.timings.settle_delay(),
            cooldown: settings.switch_cooldown(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick up changed delays.
    pub fn apply(&self, settings: &Settings) {
        self.lock().timings = Self::timings_from(settings);
    }

    pub fn state(&self) -> TrackerState {
        self.lock().state.clone()
    }

    /// The conversation the tracker believes is in front.
    pub fn active(&self) -> Option<ConversationId> {
        match &self.lock().state {
            TrackerState::Active(id) => Some(id.clone()),
            TrackerState::Idle | TrackerState::Switching { .. } => None,
        }
    }

    /// True during the cool-down window after a successful switch.
    pub fn just_switched(&self) -> bool {
        let inner = self.lock();
        inner
            .last_switch
            .is_some_and(|at| at.elapsed() < inner.timings.cooldown)
    }

    /// Exclusive use of the surface, held for a whole send.
    pub async fn lease(&self) -> OwnedMutexGuard<()> {
        self.lease.clone().lock_owned().await
    }

    /// Re-read the externally reported active conversation.
    pub async fn refresh(&self) -> Option<ConversationId> {
        let reported = self
            .observation
            .query_active_conversation_id()
            .await
            .map(|raw| ConversationId::new(&raw))
            .filter(|id| !id.is_unknown());
        let mut inner = self.lock();
        inner.state = match &reported {
            Some(id) => TrackerState::Active(id.clone()),
            None => TrackerState::Idle,
        };
        reported
    }

    /// Bring `target` to the front and confirm it landed.
    pub async fn switch(&self, target: &ConversationId) -> Result<(), SwitchError> {
        let _guard = self.switch_lock.lock().await;

        if self.reported_matches(target).await.is_ok() {
            debug!(conversation = %target, "Already active, no switch needed");
            self.lock().state = TrackerState::Active(target.clone());
            return Ok(());
        }

        let previous = {
            let mut inner = self.lock();
            std::mem::replace(
                &mut inner.state,
                TrackerState::Switching {
                    target: target.clone(),
                },
            )
        };

        let policy = RetryPolicy::new(SWITCH_ATTEMPTS, DelayPolicy::None);
        let result = retry(policy, "switch", |attempt| self.attempt_switch(target, attempt)).await;

        match result {
            Ok(()) => {
                let mut inner = self.lock();
                inner.state = TrackerState::Active(target.clone());
                inner.last_switch = Some(Instant::now());
                info!(conversation = %target, "Switched conversation");
                Ok(())
            }
            Err(e) => {
                let restored = match self.refresh().await {
                    Some(id) => TrackerState::Active(id),
                    None => previous,
                };
                warn!(conversation = %target, error = %e, restored = ?restored, "Conversation switch failed");
                self.lock().state = restored;
                Err(e)
            }
        }
    }

    async fn attempt_switch(&self, target: &ConversationId, attempt: u32) -> Result<(), SwitchError> {
        let handle = self.locate(target).await?;
        debug!(conversation = %target, %handle, attempt, "Activating contact");
        self.action
            .activate(&handle)
            .await
            .map_err(|e| SwitchError::ActivationFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let settle = self.lock().timings.settle_delay;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.reported_matches(target).await
    }

    async fn reported_matches(&self, target: &ConversationId) -> Result<(), SwitchError> {
        let reported = self.observation.query_active_conversation_id().await;
        match reported.as_deref() {
            Some(raw) if target.matches(raw) => Ok(()),
            _ => Err(SwitchError::NotConfirmed {
                target: target.to_string(),
                reported,
            }),
        }
    }

    /// Contact element for `target`: exact id first, then a fuzzy scan.
    async fn locate(&self, target: &ConversationId) -> Result<ElementHandle, SwitchError> {
        let contacts: Vec<ContactItem> = self
            .observation
            .elements_by_role(ElementRole::ContactItem)
            .await
            .into_iter()
            .filter_map(|node| match node {
                SurfaceNode::Contact(c) => Some(c),
                _ => None,
            })
            .collect();

        let exact = contacts.iter().find(|c| {
            c.raw_id
                .as_deref()
                .is_some_and(|raw| ConversationId::new(raw) == *target)
        });
        let found = exact.or_else(|| {
            contacts.iter().find(|c| {
                c.raw_id.as_deref().is_some_and(|raw| target.matches(raw)) || target.matches(&c.label)
            })
        });

        found
            .map(|c| c.handle.clone())
            .ok_or_else(|| SwitchError::ContactNotFound {
                target: target.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::MemorySurface;

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.timings.settle_delay_ms = 0;
        settings
    }

    fn tracker(surface: &Arc<MemorySurface>) -> ContactTracker {
        ContactTracker::new(surface.clone(), surface.clone(), &fast_settings())
    }

    #[tokio::test]
    async fn switch_confirms_and_sets_cooldown() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.add_contact("chat-2", "Bob");
        surface.set_active(Some("chat-1"));
        let tracker = tracker(&surface);
        assert!(!tracker.just_switched());

        let target = ConversationId::new("chat-2");
        tracker.switch(&target).await.unwrap();
        assert_eq!(tracker.state(), TrackerState::Active(target));
        assert!(tracker.just_switched());
        assert_eq!(surface.activations(), vec!["chat-2".to_string()]);
    }

    #[tokio::test]
    async fn switching_state_is_visible_while_settling() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.add_contact("chat-2", "Bob");
        surface.set_active(Some("chat-1"));
        let mut settings = fast_settings();
        settings.timings.settle_delay_ms = 200;
        let tracker = Arc::new(ContactTracker::new(
            surface.clone(),
            surface.clone(),
            &settings,
        ));

        let target = ConversationId::new("chat-2");
        let t = tracker.clone();
        let to = target.clone();
        let switching = tokio::spawn(async move { t.switch(&to).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            tracker.state(),
            TrackerState::Switching {
                target: target.clone()
            }
        );
        assert_eq!(tracker.active(), None);
        assert_eq!(surface.activations(), vec!["chat-2".to_string()]);

        switching.await.unwrap().unwrap();
        assert_eq!(tracker.state(), TrackerState::Active(target.clone()));
        assert_eq!(tracker.active(), Some(target));
        assert_eq!(surface.activations(), vec!["chat-2".to_string()]);
    }

    #[tokio::test]
    async fn already_active_skips_activation() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.set_active(Some("chat-1"));
        let tracker = tracker(&surface);

        tracker.switch(&ConversationId::new("chat-1")).await.unwrap();
        assert!(surface.activations().is_empty());
        assert!(!tracker.just_switched());
    }

    #[tokio::test]
    async fn fuzzy_match_on_long_digit_runs() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("thread:2207781234|web", "Carol");
        let tracker = tracker(&surface);

        tracker.switch(&ConversationId::new("2207781234")).await.unwrap();
        assert_eq!(surface.activations(), vec!["thread:2207781234|web".to_string()]);
    }

    #[tokio::test]
    async fn unconfirmed_switch_retries_once_and_restores() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.add_contact("chat-2", "Bob");
        surface.set_active(Some("chat-1"));
        surface.set_activation_redirect(Some("chat-1"));
        let tracker = tracker(&surface);

        let err = tracker.switch(&ConversationId::new("chat-2")).await.unwrap_err();
        assert!(matches!(err, SwitchError::NotConfirmed { .. }));
        assert_eq!(surface.activations().len(), 2);
        assert_eq!(tracker.active(), Some(ConversationId::new("chat-1")));
        assert!(!tracker.just_switched());
    }

    #[tokio::test]
    async fn unknown_contact_fails() {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        let tracker = tracker(&surface);
        let err = tracker.switch(&ConversationId::new("chat-404")).await.unwrap_err();
        assert!(matches!(err, SwitchError::ContactNotFound { .. }));
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[tokio::test]
    async fn refresh_reads_surface() {
        let surface = Arc::new(MemorySurface::new());
        let tracker = tracker(&surface);
        assert_eq!(tracker.refresh().await, None);
        surface.set_active(Some("conversation-77"));
        assert_eq!(tracker.refresh().await, Some(ConversationId::new("77")));
        assert_eq!(tracker.active(), Some(ConversationId::new("77")));
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let surface = Arc::new(MemorySurface::new());
        let tracker = Arc::new(tracker(&surface));
        let guard = tracker.lease().await;

        let t = tracker.clone();
        let waiter = tokio::spawn(async move {
            let _g = t.lease().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
