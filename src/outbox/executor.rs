//! Surface executor: performs one reply task against the action layer.
//!
//! Holds the tracker lease for the whole task so an incoming-message switch
//! cannot move the surface mid-send. Every step maps its failure to a
//! [`SendError`] carrying the phase it happened in.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{Settings, Timings};
use crate::contacts::ContactTracker;
use crate::error::{SendError, SendPhase, SurfaceError};
use crate::identity::ConversationId;
use crate::outbox::queue::{Outbound, TaskExecutor};
use crate::retry::{DelayPolicy, RetryPolicy, retry};
use crate::surface::{ActionLayer, ElementHandle, ElementRole, ObservationLayer};

const SEND_ATTEMPTS: u32 = 2;

pub struct SurfaceExecutor {
    observation: Arc<dyn ObservationLayer>,
    action: Arc<dyn ActionLayer>,
    tracker: Arc<ContactTracker>,
    timings: Mutex<Timings>,
}

impl SurfaceExecutor {
    pub fn new(
        observation: Arc<dyn ObservationLayer>,
        action: Arc<dyn ActionLayer>,
        tracker: Arc<ContactTracker>,
        settings: &Settings,
    ) -> Self {
        Self {
            observation,
            action,
            tracker,
            timings: Mutex::new(settings.timings.clone()),
        }
    }

    /// Pick up changed waits.
    pub fn apply(&self, settings: &Settings) {
        *self.timings.lock().unwrap_or_else(PoisonError::into_inner) = settings.timings.clone();
    }

    fn timings(&self) -> Timings {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn ensure_active(&self, conversation: &ConversationId) -> Result<(), SendError> {
        self.tracker
            .switch(conversation)
            .await
            .map_err(|e| SendError::Switch {
                phase: SendPhase::Switch,
                conversation: conversation.to_string(),
                reason: e.to_string(),
            })
    }

    async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<(), SendError> {
        let timings = self.timings();
        let policy = RetryPolicy::new(SEND_ATTEMPTS, DelayPolicy::Fixed(timings.poll_interval()));
        retry(policy, "send", |attempt| {
            self.send_once(conversation, text, attempt, &timings)
        })
        .await
    }

    async fn send_once(
        &self,
        conversation: &ConversationId,
        text: &str,
        attempt: u32,
        timings: &Timings,
    ) -> Result<(), SendError> {
        let input = self.wait_for(ElementRole::InputSurface, timings).await?;
        let send = self.wait_for(ElementRole::SendControl, timings).await?;

        self.fill(&input, text).await?;
        if self.submit_disabled(&send).await? {
            debug!(conversation = %conversation, "Send control disabled, re-setting input");
            self.fill(&input, text).await?;
        }

        if self.submit_disabled(&send).await? {
            debug!(conversation = %conversation, "Send control still disabled, trying alternate submit");
            self.action
                .submit_via_input(&input)
                .await
                .map_err(|e| match e {
                    SurfaceError::Unsupported(_) => SendError::SubmitDisabled {
                        phase: SendPhase::Submit,
                        conversation: conversation.to_string(),
                    },
                    other => action_error(SendPhase::Submit, other),
                })?;
        } else {
            self.action
                .submit(&send)
                .await
                .map_err(|e| action_error(SendPhase::Submit, e))?;
        }

        self.verify_sent(&input, conversation, attempt, timings).await
    }

    async fn fill(&self, input: &ElementHandle, text: &str) -> Result<(), SendError> {
        self.action
            .set_input_value(input, text)
            .await
            .map_err(|e| action_error(SendPhase::Fill, e))
    }

    async fn submit_disabled(&self, send: &ElementHandle) -> Result<bool, SendError> {
        self.action
            .is_submit_disabled(send)
            .await
            .map_err(|e| action_error(SendPhase::Submit, e))
    }

    /// First element with `role`, polling until the element wait runs out.
    async fn wait_for(&self, role: ElementRole, timings: &Timings) -> Result<ElementHandle, SendError> {
        let waited = timings.element_wait();
        let deadline = Instant::now() + waited;
        loop {
            if let Some(node) = self.observation.elements_by_role(role).await.into_iter().next() {
                return Ok(node.handle().clone());
            }
            if Instant::now() >= deadline {
                return Err(SendError::ElementUnavailable {
                    phase: SendPhase::Acquire,
                    element: role.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(timings.poll_interval()).await;
        }
    }

    /// The input empties once the surface has taken the message.
    async fn verify_sent(
        &self,
        input: &ElementHandle,
        conversation: &ConversationId,
        attempt: u32,
        timings: &Timings,
    ) -> Result<(), SendError> {
        let deadline = Instant::now() + timings.verify_window();
        loop {
            let value = self
                .observation
                .input_value(input)
                .await
                .map_err(|e| action_error(SendPhase::Verify, e))?;
            if value.trim().is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SendError::NotConfirmed {
                    phase: SendPhase::Verify,
                    conversation: conversation.to_string(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(timings.poll_interval()).await;
        }
    }
}

fn action_error(phase: SendPhase, e: SurfaceError) -> SendError {
    SendError::Action {
        phase,
        reason: e.to_string(),
    }
}

#[async_trait]
impl TaskExecutor for SurfaceExecutor {
    async fn execute(&self, conversation: &ConversationId, payload: &Outbound) -> Result<(), SendError> {
        let _lease = self.tracker.lease().await;
        self.ensure_active(conversation).await?;

        match payload {
            Outbound::Text(text) => self.send_text(conversation, text).await?,
            Outbound::LeadTool { tool_id } => self
                .action
                .send_lead_tool(tool_id)
                .await
                .map_err(|e| action_error(SendPhase::Tool, e))?,
        }
        info!(conversation = %conversation, payload = %payload, "Sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::MemorySurface;
    use crate::surface::memory::SentKind;

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.timings.settle_delay_ms = 0;
        settings.timings.element_wait_ms = 30;
        settings.timings.verify_window_ms = 20;
        settings.timings.poll_interval_ms = 5;
        settings
    }

    fn setup() -> (Arc<MemorySurface>, SurfaceExecutor) {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.add_contact("chat-2", "Bob");
        surface.set_active(Some("chat-1"));
        let settings = fast_settings();
        let tracker = Arc::new(ContactTracker::new(surface.clone(), surface.clone(), &settings));
        let executor = SurfaceExecutor::new(surface.clone(), surface.clone(), tracker, &settings);
        (surface, executor)
    }

    fn text(s: &str) -> Outbound {
        Outbound::Text(s.to_string())
    }

    #[tokio::test]
    async fn sends_to_active_conversation() {
        let (surface, executor) = setup();
        executor
            .execute(&ConversationId::new("chat-1"), &text("hello"))
            .await
            .unwrap();
        let sent = surface.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].conversation.as_deref(), Some("chat-1"));
        assert!(surface.activations().is_empty());
    }

    #[tokio::test]
    async fn switches_before_sending() {
        let (surface, executor) = setup();
        executor
            .execute(&ConversationId::new("chat-2"), &text("hi bob"))
            .await
            .unwrap();
        assert_eq!(surface.activations(), vec!["chat-2".to_string()]);
        assert_eq!(surface.sent()[0].conversation.as_deref(), Some("chat-2"));
    }

    #[tokio::test]
    async fn switch_failure_has_switch_phase() {
        let (_surface, executor) = setup();
        let err = executor
            .execute(&ConversationId::new("chat-404"), &text("x"))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(SendPhase::Switch));
    }

    #[tokio::test]
    async fn missing_input_times_out_in_acquire() {
        let (surface, executor) = setup();
        surface.set_controls_present(false, true);
        let err = executor
            .execute(&ConversationId::new("chat-1"), &text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::ElementUnavailable { .. }));
        assert_eq!(err.phase(), Some(SendPhase::Acquire));
    }

    #[tokio::test]
    async fn disabled_control_uses_alternate_path() {
        let (surface, executor) = setup();
        surface.set_submit_disabled(true);
        executor
            .execute(&ConversationId::new("chat-1"), &text("via enter"))
            .await
            .unwrap();
        assert_eq!(surface.sent()[0].content, "via enter");
    }

    #[tokio::test]
    async fn swallowed_submit_is_retried_once() {
        let (surface, executor) = setup();
        surface.swallow_submits(1);
        executor
            .execute(&ConversationId::new("chat-1"), &text("second try"))
            .await
            .unwrap();
        assert_eq!(surface.sent().len(), 1);
        assert_eq!(surface.input_text(), "");
    }

    #[tokio::test]
    async fn unconfirmed_after_two_attempts() {
        let (surface, executor) = setup();
        surface.swallow_submits(2);
        let err = executor
            .execute(&ConversationId::new("chat-1"), &text("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConfirmed { attempts: 2, .. }));
        assert_eq!(err.phase(), Some(SendPhase::Verify));
        assert!(surface.sent().is_empty());
    }

    #[tokio::test]
    async fn lead_tool_switches_then_sends() {
        let (surface, executor) = setup();
        executor
            .execute(
                &ConversationId::new("chat-2"),
                &Outbound::LeadTool {
                    tool_id: "form-1".into(),
                },
            )
            .await
            .unwrap();
        let sent = surface.sent();
        assert_eq!(sent[0].kind, SentKind::LeadTool);
        assert_eq!(sent[0].content, "form-1");
        assert_eq!(sent[0].conversation.as_deref(), Some("chat-2"));
    }
}
