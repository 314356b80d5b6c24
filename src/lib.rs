//! Reply Pilot: an auto-reply engine for a messaging surface.

pub mod config;
pub mod contacts;
pub mod decision;
pub mod error;
pub mod identity;
pub mod outbox;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod surface;
