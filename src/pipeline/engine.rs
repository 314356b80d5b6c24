//! Autopilot: wires the observer, tracker, classifier, router, gate and queue.
//!
//! One instance owns all mutable pipeline state. The run loop reacts to
//! conversation-list changes (switching to conversations with unread
//! messages) and message-list changes (classify, route, gate, enqueue).
//! Delivery outcomes are picked up by small watcher tasks that update the
//! statistics, the health monitor and the notice channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSource, Settings};
use crate::contacts::ContactTracker;
use crate::decision::DecisionService;
use crate::error::SendError;
use crate::identity::ConversationId;
use crate::outbox::{Outbound, QueueStats, ReplyQueue, SurfaceExecutor, TaskOutcome};
use crate::pipeline::classifier::{ClassifyContext, Classifier, DropReason};
use crate::pipeline::gate::{GateRejection, SendGate};
use crate::pipeline::health::{HealthMonitor, HealthSignal};
use crate::pipeline::router::Router;
use crate::pipeline::types::{Message, RouteDecision};
use crate::retry::{DelayPolicy, RetryPolicy, retry};
use crate::store::{HistoryEntry, HistoryRole, Store, counters};
use crate::surface::{
    ActionLayer, ChangeEvent, ChangeObserver, ElementRole, ListKind, MessageElement,
    ObservationLayer, Subscription, SurfaceNode,
};

const NOTICE_CAPACITY: usize = 256;
const RESUBSCRIBE_ATTEMPTS: u32 = 3;
const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(2);

/// Externally consequential events.
#[derive(Debug, Clone)]
pub enum Notice {
    ReplySent {
        conversation: ConversationId,
        text: String,
    },
    ToolSent {
        conversation: ConversationId,
        tool_id: String,
    },
    SendFailed {
        conversation: ConversationId,
        error: SendError,
    },
    SwitchFailed {
        conversation: ConversationId,
        reason: String,
    },
    RecoveryStarted {
        attempt: u32,
    },
    RecoveryExhausted,
}

/// What happened to one message element.
#[derive(Debug, Clone)]
pub enum MessageOutcome {
    Dropped(DropReason),
    Dispatched(Dispatch),
}

/// A routed message and what was done with its decision.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub message: Message,
    pub decision: RouteDecision,
    /// Outbound tasks handed to the queue.
    pub enqueued: usize,
    pub rejected: Vec<GateRejection>,
}

/// External collaborators the autopilot drives.
#[derive(Clone)]
pub struct AutopilotDeps {
    pub observation: Arc<dyn ObservationLayer>,
    pub action: Arc<dyn ActionLayer>,
    pub config: Arc<dyn ConfigSource>,
    pub decision: Arc<dyn DecisionService>,
    pub store: Arc<dyn Store>,
}

pub struct Autopilot {
    observation: Arc<dyn ObservationLayer>,
    config: Arc<dyn ConfigSource>,
    store: Arc<dyn Store>,
    observer: ChangeObserver,
    tracker: Arc<ContactTracker>,
    executor: Arc<SurfaceExecutor>,
    queue: Arc<ReplyQueue>,
    router: Router,
    classifier: Mutex<Classifier>,
    gate: Mutex<SendGate>,
    health: Mutex<HealthMonitor>,
    settings: Mutex<Settings>,
    notices: broadcast::Sender<Notice>,
    recovery_tx: mpsc::UnboundedSender<u32>,
    recovery_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u32>>,
    shutdown: watch::Sender<bool>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Autopilot {
    /// Build an autopilot using the current settings of the config source.
    pub async fn new(deps: AutopilotDeps) -> crate::error::Result<Arc<Self>> {
        let settings = deps.config.settings().await?;

        let tracker = Arc::new(ContactTracker::new(
            deps.observation.clone(),
            deps.action.clone(),
            &settings,
        ));
        let executor = Arc::new(SurfaceExecutor::new(
            deps.observation.clone(),
            deps.action.clone(),
            tracker.clone(),
            &settings,
        ));
        let queue = ReplyQueue::new(executor.clone(), settings.timings.queue_recovery_delay());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            observer: ChangeObserver::new(deps.observation.clone()),
            observation: deps.observation,
            config: deps.config,
            store: deps.store,
            tracker,
            executor,
            queue,
            router: Router::new(deps.decision),
            classifier: Mutex::new(Classifier::new(settings.dedup_capacity)),
            gate: Mutex::new(SendGate::new()),
            health: Mutex::new(HealthMonitor::new(&settings.health)),
            settings: Mutex::new(settings),
            notices,
            recovery_tx,
            recovery_rx: tokio::sync::Mutex::new(recovery_rx),
            shutdown,
        }))
    }

    /// Subscribe to sends, failures and recovery events.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn tracker(&self) -> &Arc<ContactTracker> {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<ReplyQueue> {
        &self.queue
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run the event loop on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let autopilot = Arc::clone(self);
        tokio::spawn(async move { autopilot.run().await })
    }

    /// Stop the run loop and cancel every pending send.
    pub fn stop(&self) {
        info!("Autopilot stopping");
        self.shutdown.send_replace(true);
        self.queue.clear();
    }

    pub async fn run(self: Arc<Self>) {
        let mut recovery_rx = self.recovery_rx.lock().await;
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        let settings = self.refresh_settings().await;
        if let Some(active) = self.tracker.refresh().await {
            info!(conversation = %active, "Autopilot started");
        } else {
            info!("Autopilot started with no active conversation");
        }

        let mut contacts = self.observer.connect(ListKind::Conversations);
        let mut messages = self.observer.connect(ListKind::Messages);
        let mut backup = tokio::time::interval(settings.timings.backup_poll());
        backup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = next_event(&mut contacts), if contacts.is_some() => match event {
                    Some(event) => self.handle_contact_event(event).await,
                    None => {
                        warn!("Conversation change source closed");
                        contacts = None;
                    }
                },
                event = next_event(&mut messages), if messages.is_some() => match event {
                    Some(event) => self.handle_message_event(event).await,
                    None => {
                        warn!("Message change source closed, polling until recovered");
                        messages = None;
                        self.record_failure();
                    }
                },
                Some(attempt) = recovery_rx.recv() => {
                    messages = self.recover(messages.take(), attempt).await;
                },
                _ = backup.tick(), if messages.is_none() => self.poll_messages().await,
            }
        }
        info!("Autopilot stopped");
    }

    async fn handle_contact_event(self: &Arc<Self>, event: ChangeEvent) {
        for node in event.added {
            let SurfaceNode::Contact(contact) = node else {
                continue;
            };
            if contact.unread == 0 {
                continue;
            }
            let raw = contact.raw_id.as_deref().unwrap_or(&contact.label);
            let target = ConversationId::new(raw);
            if target.is_unknown() || self.tracker.active().as_ref() == Some(&target) {
                continue;
            }

            debug!(conversation = %target, unread = contact.unread, "Unread conversation, switching");
            let _lease = self.tracker.lease().await;
            if let Err(e) = self.tracker.switch(&target).await {
                self.notify(Notice::SwitchFailed {
                    conversation: target,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_message_event(self: &Arc<Self>, event: ChangeEvent) {
        for node in event.added {
            if let SurfaceNode::Message(element) = node {
                self.handle_message(&element).await;
            }
        }
    }

    /// Backup path when the surface has no change source.
    async fn poll_messages(self: &Arc<Self>) {
        let nodes = self.observation.elements_by_role(ElementRole::MessageItem).await;
        for node in nodes {
            if let SurfaceNode::Message(element) = node {
                self.handle_message(&element).await;
            }
        }
    }

    /// Classify, route, gate and enqueue one message element.
    pub async fn handle_message(self: &Arc<Self>, element: &MessageElement) -> MessageOutcome {
        let settings = self.refresh_settings().await;

        let active = self.tracker.active();
        let ctx = ClassifyContext {
            active: active.as_ref(),
            just_switched: self.tracker.just_switched(),
            stale_after: settings.stale_after(),
            now: Local::now().time(),
        };
        let classified = locked(&self.classifier).classify(element, &ctx);
        let mut message = match classified {
            Ok(message) => message,
            Err(reason) => {
                if reason.is_failure() {
                    self.record_failure();
                }
                return MessageOutcome::Dropped(reason);
            }
        };

        let conversation = message.conversation_id.clone();
        info!(
            conversation = %conversation,
            fingerprint = %message.fingerprint,
            kind = %message.kind,
            "Processing message"
        );

        let history = self
            .store
            .read(&conversation, settings.history_window)
            .await
            .unwrap_or_else(|e| {
                warn!(conversation = %conversation, error = %e, "Failed to read history");
                Vec::new()
            });
        self.persist_entry(
            &conversation,
            HistoryEntry::new(HistoryRole::Contact, message.content.clone(), message.kind.label()),
        )
        .await;
        self.bump(counters::MESSAGES_PROCESSED).await;

        let rules = self.config.rules().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load rules, routing without them");
            Vec::new()
        });
        let decision = self.router.route(&message, &rules, &settings, &history).await;
        message.processed = true;

        let mut outbound = Vec::new();
        if let Some(reply) = &decision.reply {
            outbound.push(Outbound::Text(reply.text.clone()));
        }
        if let Some(tool) = &decision.tool {
            outbound.push(Outbound::LeadTool {
                tool_id: tool.tool_id.clone(),
            });
        }

        let mut enqueued = 0;
        let mut rejected = Vec::new();
        for payload in outbound {
            let admitted =
                locked(&self.gate).admit(&conversation, Local::now().naive_local(), &settings);
            match admitted {
                Ok(()) => {
                    let rx = self.queue.enqueue(conversation.clone(), payload.clone());
                    self.watch_delivery(conversation.clone(), payload, rx);
                    enqueued += 1;
                }
                Err(rejection) => {
                    info!(conversation = %conversation, payload = %payload, reason = %rejection, "Send gated");
                    self.bump(counters::GATE_REJECTIONS).await;
                    rejected.push(rejection);
                }
            }
        }

        if enqueued == 0 {
            locked(&self.health).record_success();
        }

        MessageOutcome::Dispatched(Dispatch {
            message,
            decision,
            enqueued,
            rejected,
        })
    }

    fn watch_delivery(
        self: &Arc<Self>,
        conversation: ConversationId,
        payload: Outbound,
        rx: oneshot::Receiver<TaskOutcome>,
    ) {
        let autopilot = Arc::clone(self);
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_delivery)) => autopilot.on_delivered(conversation, payload).await,
                Ok(Err(SendError::Cancelled(reason))) => {
                    debug!(conversation = %conversation, reason = %reason, "Send cancelled");
                }
                Ok(Err(error)) => {
                    warn!(conversation = %conversation, error = %error, "Send failed");
                    autopilot.bump(counters::REPLIES_FAILED).await;
                    autopilot.notify(Notice::SendFailed {
                        conversation,
                        error,
                    });
                    autopilot.record_failure();
                }
                Err(_) => {
                    error!(conversation = %conversation, "Reply task dropped without settling");
                }
            }
        });
    }

    async fn on_delivered(&self, conversation: ConversationId, payload: Outbound) {
        locked(&self.health).record_success();
        match payload {
            Outbound::Text(text) => {
                self.bump(counters::REPLIES_SENT).await;
                self.persist_entry(
                    &conversation,
                    HistoryEntry::new(HistoryRole::Autopilot, text.clone(), "text"),
                )
                .await;
                self.notify(Notice::ReplySent { conversation, text });
            }
            Outbound::LeadTool { tool_id } => {
                self.bump(counters::TOOLS_SENT).await;
                self.persist_entry(
                    &conversation,
                    HistoryEntry::new(HistoryRole::Autopilot, tool_id.clone(), "tool"),
                )
                .await;
                self.notify(Notice::ToolSent {
                    conversation,
                    tool_id,
                });
            }
        }
    }

    fn record_failure(&self) {
        let signal = locked(&self.health).record_failure();
        match signal {
            HealthSignal::Degraded { consecutive } => {
                debug!(consecutive, "Recorded processing failure");
            }
            HealthSignal::RecoveryDue { attempt } => {
                let _ = self.recovery_tx.send(attempt);
            }
            HealthSignal::Exhausted { first } => {
                if first {
                    self.notify(Notice::RecoveryExhausted);
                }
            }
        }
    }

    /// Tear down and recreate the message subscription, then start clean.
    async fn recover(&self, current: Option<Subscription>, attempt: u32) -> Option<Subscription> {
        warn!(attempt, "Recovering message subscription");
        self.notify(Notice::RecoveryStarted { attempt });
        if let Some(subscription) = current {
            subscription.disconnect();
        }

        let policy = RetryPolicy::new(
            RESUBSCRIBE_ATTEMPTS,
            DelayPolicy::Exponential {
                base: RESUBSCRIBE_BASE_DELAY,
                max: RESUBSCRIBE_MAX_DELAY,
            },
        );
        let observer = &self.observer;
        let resubscribed = retry(policy, "resubscribe", |_| async move {
            observer
                .connect(ListKind::Messages)
                .ok_or_else(|| "no change source".to_string())
        })
        .await;

        locked(&self.classifier).clear_dedup();
        locked(&self.health).recovery_completed();

        match resubscribed {
            Ok(subscription) => {
                info!(attempt, "Message subscription recovered");
                Some(subscription)
            }
            Err(e) => {
                warn!(attempt, error = %e, "Resubscribe failed, falling back to polling");
                None
            }
        }
    }

    /// Poll the config source, keeping the last good settings on failure.
    async fn refresh_settings(&self) -> Settings {
        let settings = match self.config.settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to load settings, keeping previous");
                return locked(&self.settings).clone();
            }
        };

        self.tracker.apply(&settings);
        self.executor.apply(&settings);
        locked(&self.classifier).set_capacity(settings.dedup_capacity);
        locked(&self.health).apply(&settings.health);
        *locked(&self.settings) = settings.clone();
        settings
    }

    async fn persist_entry(&self, conversation: &ConversationId, entry: HistoryEntry) {
        if let Err(e) = self.store.append(conversation, &entry).await {
            warn!(conversation = %conversation, error = %e, "Failed to persist history");
        }
    }

    async fn bump(&self, counter: &str) {
        if let Err(e) = self.store.increment(counter, 1).await {
            warn!(counter, error = %e, "Failed to update statistics");
        }
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, StaticConfig};
    use crate::decision::DisabledDecisionService;
    use crate::error::ConfigError;
    use crate::pipeline::rules::Rule;
    use crate::store::MemoryStore;
    use crate::surface::MemorySurface;

    async fn autopilot(
        surface: &Arc<MemorySurface>,
        rules: Vec<Rule>,
        settings: Settings,
    ) -> (Arc<Autopilot>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let autopilot = Autopilot::new(AutopilotDeps {
            observation: surface.clone(),
            action: surface.clone(),
            config: Arc::new(StaticConfig::new(settings, rules)),
            decision: Arc::new(DisabledDecisionService),
            store: store.clone(),
        })
        .await
        .unwrap();
        (autopilot, store)
    }

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.timings.settle_delay_ms = 0;
        settings.timings.element_wait_ms = 50;
        settings.timings.verify_window_ms = 20;
        settings.timings.poll_interval_ms = 5;
        settings
    }

    fn surface() -> Arc<MemorySurface> {
        let surface = Arc::new(MemorySurface::new());
        surface.add_contact("chat-1", "Alice");
        surface.set_active(Some("chat-1"));
        surface
    }

    #[tokio::test]
    async fn unreadable_settings_fail_construction() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface();
        let result = Autopilot::new(AutopilotDeps {
            observation: surface.clone(),
            action: surface.clone(),
            config: Arc::new(FileConfig::new(dir.path().join("missing.json"))),
            decision: Arc::new(DisabledDecisionService),
            store: Arc::new(MemoryStore::new()),
        })
        .await;
        let err = result.err().expect("construction should fail");
        assert!(matches!(err, crate::error::Error::Config(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn matched_rule_is_enqueued_and_counted() {
        let surface = surface();
        let rules = vec![Rule::keyword("price", &["price"], "10 dollars")];
        let (autopilot, store) = autopilot(&surface, rules, fast_settings()).await;
        autopilot.tracker().refresh().await;

        let el = MessageElement::text("m1", "price?").with_container("chat-1");
        let MessageOutcome::Dispatched(dispatch) = autopilot.handle_message(&el).await else {
            panic!("expected dispatch");
        };
        assert_eq!(dispatch.enqueued, 1);
        assert!(dispatch.message.processed);
        assert_eq!(store.counter(counters::MESSAGES_PROCESSED).await.unwrap(), 1);

        let again = autopilot.handle_message(&el).await;
        assert!(matches!(again, MessageOutcome::Dropped(DropReason::Duplicate)));
    }

    #[tokio::test]
    async fn gate_rejection_sends_nothing() {
        let surface = surface();
        let mut settings = fast_settings();
        settings.limits.daily_reply_cap = 1;
        let rules = vec![Rule::keyword("hi", &["hi"], "hello")];
        let (autopilot, store) = autopilot(&surface, rules, settings).await;

        let first = MessageElement::text("m1", "hi").with_container("chat-1");
        let second = MessageElement::text("m2", "hi again").with_container("chat-1");
        autopilot.handle_message(&first).await;
        let MessageOutcome::Dispatched(dispatch) = autopilot.handle_message(&second).await else {
            panic!("expected dispatch");
        };
        assert_eq!(dispatch.enqueued, 0);
        assert_eq!(dispatch.rejected, vec![GateRejection::DailyCapReached { cap: 1 }]);
        assert_eq!(store.counter(counters::GATE_REJECTIONS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unresolved_messages_count_toward_recovery() {
        let surface = Arc::new(MemorySurface::new());
        let mut settings = fast_settings();
        settings.health.failure_threshold = 2;
        let (autopilot, _store) = autopilot(&surface, vec![], settings).await;

        let orphan = MessageElement::text("m1", "hi");
        autopilot.handle_message(&orphan).await;
        assert_eq!(locked(&autopilot.health).consecutive_failures(), 1);
        autopilot.handle_message(&orphan).await;
        assert_eq!(locked(&autopilot.health).recovery_attempts(), 1);
        let queued = autopilot.recovery_rx.lock().await.try_recv().unwrap();
        assert_eq!(queued, 1);
    }
}
