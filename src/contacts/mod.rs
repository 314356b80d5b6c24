//! Conversation tracking and switching.

pub mod tracker;

pub use tracker::{ContactTracker, TrackerState};
