//! Reply decision routing.
//!
//! Two independent branches run for every message:
//! - text: static rule response, else AI for `use_ai` rules, else the AI
//!   fallback when enabled
//! - tool: a rule's keyword-to-tool mapping, else an intent decision gated by
//!   confidence, resend interval and the configured lead tools
//!
//! Decision service failures degrade to "no action" for that branch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::decision::{DecisionService, IntentContext};
use crate::identity::ConversationId;
use crate::pipeline::rules::{Rule, RuleMatcher};
use crate::pipeline::types::{Message, ReplyPlan, ReplySource, RouteDecision, ToolPlan, ToolSource};
use crate::store::HistoryEntry;

pub struct Router {
    matcher: RuleMatcher,
    decision: Arc<dyn DecisionService>,
    // Last intent-driven tool plan per conversation.
    last_intent: Mutex<HashMap<ConversationId, Instant>>,
}

impl Router {
    pub fn new(decision: Arc<dyn DecisionService>) -> Self {
        Self {
            matcher: RuleMatcher::new(),
            decision,
            last_intent: Mutex::new(HashMap::new()),
        }
    }

    /// Decide what, if anything, to send in response to `message`.
    pub async fn route(
        &self,
        message: &Message,
        rules: &[Rule],
        settings: &Settings,
        history: &[HistoryEntry],
    ) -> RouteDecision {
        let reply = self.text_branch(message, rules, settings, history).await;
        let tool = self.tool_branch(message, rules, settings, history).await;
        debug!(
            conversation = %message.conversation_id,
            fingerprint = %message.fingerprint,
            reply = reply.is_some(),
            tool = tool.is_some(),
            "Routed message"
        );
        RouteDecision { reply, tool }
    }

    async fn text_branch(
        &self,
        message: &Message,
        rules: &[Rule],
        settings: &Settings,
        history: &[HistoryEntry],
    ) -> Option<ReplyPlan> {
        // Tool-only rules must not shadow lower-priority reply rules.
        let matched = self.matcher.find_match_where(rules, &message.content, message.kind, |r| {
            r.static_response().is_some() || r.use_ai
        });

        match matched {
            Some(rule) => {
                if let Some(text) = rule.static_response() {
                    return Some(ReplyPlan {
                        text: text.to_string(),
                        source: ReplySource::Rule {
                            rule_id: rule.id.clone(),
                        },
                    });
                }
                let text = self.generate(message, history).await?;
                Some(ReplyPlan {
                    text,
                    source: ReplySource::RuleAi {
                        rule_id: rule.id.clone(),
                    },
                })
            }
            None if settings.ai_fallback => {
                let text = self.generate(message, history).await?;
                Some(ReplyPlan {
                    text,
                    source: ReplySource::Fallback,
                })
            }
            None => None,
        }
    }

    async fn generate(&self, message: &Message, history: &[HistoryEntry]) -> Option<String> {
        match self.decision.generate_reply(&message.content, history).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                warn!(conversation = %message.conversation_id, "Decision service returned an empty reply");
                None
            }
            Err(e) => {
                warn!(
                    conversation = %message.conversation_id,
                    service = self.decision.name(),
                    error = %e,
                    "Reply generation failed, no reply"
                );
                None
            }
        }
    }

    async fn tool_branch(
        &self,
        message: &Message,
        rules: &[Rule],
        settings: &Settings,
        history: &[HistoryEntry],
    ) -> Option<ToolPlan> {
        let tool_rule = self.matcher.find_match_where(rules, &message.content, message.kind, |r| {
            r.lead_tool.as_deref().is_some_and(|t| !t.trim().is_empty())
        });
        if let Some(rule) = tool_rule {
            let tool_id = rule.lead_tool.clone()?;
            return Some(ToolPlan {
                tool_id,
                source: ToolSource::Rule {
                    rule_id: rule.id.clone(),
                },
            });
        }

        if !settings.intent.enabled {
            return None;
        }
        self.intent_tool(message, settings, history).await
    }

    async fn intent_tool(
        &self,
        message: &Message,
        settings: &Settings,
        history: &[HistoryEntry],
    ) -> Option<ToolPlan> {
        let conversation = &message.conversation_id;
        if !self.resend_allowed(conversation, settings) {
            debug!(conversation = %conversation, "Intent tool within resend interval, skipping");
            return None;
        }

        let context = IntentContext {
            conversation_id: conversation.to_string(),
            content: message.content.clone(),
            history: history.to_vec(),
            available_tools: settings.lead_tools.clone(),
        };
        let decision = match self.decision.get_intent(&context).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    conversation = %conversation,
                    service = self.decision.name(),
                    error = %e,
                    "Intent detection failed, no tool"
                );
                return None;
            }
        };

        if !decision.should_send {
            return None;
        }
        if decision.confidence < settings.intent.confidence_threshold {
            debug!(
                conversation = %conversation,
                confidence = decision.confidence,
                threshold = settings.intent.confidence_threshold,
                "Intent below confidence threshold"
            );
            return None;
        }
        let tool_id = decision.tool_id?;
        if !settings.is_lead_tool(&tool_id) {
            warn!(conversation = %conversation, tool = %tool_id, "Intent picked an unknown lead tool, ignoring");
            return None;
        }

        self.last_intent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation.clone(), Instant::now());
        info!(conversation = %conversation, tool = %tool_id, confidence = decision.confidence, "Intent selected lead tool");
        Some(ToolPlan {
            tool_id,
            source: ToolSource::Intent {
                confidence: decision.confidence,
                reason: decision.reason,
            },
        })
    }

    fn resend_allowed(&self, conversation: &ConversationId, settings: &Settings) -> bool {
        let interval = settings.intent.min_resend_interval();
        self.last_intent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation)
            .is_none_or(|at| at.elapsed() >= interval)
    }
}
