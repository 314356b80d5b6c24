//! Message processing pipeline.
//!
//! Every message element observed on the surface flows through:
//! 1. `Classifier::classify()`: resolve the conversation, filter, dedup
//! 2. `Router::route()`: rule match, generated reply, lead-tool intent
//! 3. `SendGate::admit()`: working hours and daily caps
//! 4. `ReplyQueue::enqueue()`: serialized delivery on the surface
//!
//! `Autopilot` owns the loop and the health monitor that decides when the
//! message subscription must be rebuilt.

pub mod classifier;
pub mod dedup;
pub mod engine;
pub mod gate;
pub mod health;
pub mod router;
pub mod rules;
pub mod types;

pub use classifier::{Classifier, ClassifyContext, DropReason};
pub use engine::{Autopilot, AutopilotDeps, Dispatch, MessageOutcome, Notice};
pub use gate::{GateRejection, SendGate};
pub use health::{HealthMonitor, HealthSignal};
pub use router::Router;
pub use rules::{MatchLogic, MatchType, Rule, RuleMatcher};
pub use types::{Message, MessageKind, ReplyPlan, ReplySource, RouteDecision, ToolPlan, ToolSource};
