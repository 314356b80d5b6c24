//! Send gating: working hours and daily rate caps.
//!
//! Checked after routing and before anything is enqueued. An admitted send
//! reserves its slot immediately so concurrent decisions cannot overshoot a cap.

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tracing::debug;

use crate::config::{RateLimits, Settings};
use crate::identity::ConversationId;

/// Why an outbound action was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    OutsideWorkingHours,
    DailyCapReached { cap: u32 },
    ConversationCapReached { cap: u32 },
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideWorkingHours => f.write_str("outside working hours"),
            Self::DailyCapReached { cap } => write!(f, "daily cap of {cap} reached"),
            Self::ConversationCapReached { cap } => {
                write!(f, "per-conversation daily cap of {cap} reached")
            }
        }
    }
}

/// Whether `now` falls in the inclusive window `[start, end]`.
///
/// When `end < start` the window wraps past midnight.
pub fn within_working_hours(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

/// Daily send counters, reset when the local date changes.
#[derive(Debug, Default)]
pub struct RateLimiter {
    day: Option<NaiveDate>,
    total: u32,
    per_conversation: HashMap<ConversationId, u32>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for one send to `conversation` on `today`.
    pub fn try_admit(
        &mut self,
        conversation: &ConversationId,
        today: NaiveDate,
        limits: &RateLimits,
    ) -> Result<(), GateRejection> {
        self.roll(today);

        if limits.daily_reply_cap > 0 && self.total >= limits.daily_reply_cap {
            return Err(GateRejection::DailyCapReached {
                cap: limits.daily_reply_cap,
            });
        }
        let sent = self.per_conversation.get(conversation).copied().unwrap_or(0);
        if limits.per_conversation_daily_cap > 0 && sent >= limits.per_conversation_daily_cap {
            return Err(GateRejection::ConversationCapReached {
                cap: limits.per_conversation_daily_cap,
            });
        }

        self.total += 1;
        *self.per_conversation.entry(conversation.clone()).or_default() += 1;
        Ok(())
    }

    pub fn sent_today(&self) -> u32 {
        self.total
    }

    pub fn sent_today_to(&self, conversation: &ConversationId) -> u32 {
        self.per_conversation.get(conversation).copied().unwrap_or(0)
    }

    fn roll(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            if self.day.is_some() {
                debug!(%today, "New day, resetting send counters");
            }
            self.day = Some(today);
            self.total = 0;
            self.per_conversation.clear();
        }
    }
}

/// Working-hours window plus rate limiter.
#[derive(Debug, Default)]
pub struct SendGate {
    limiter: RateLimiter,
}

impl SendGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admit one outbound action for `conversation` at local time `now`.
    pub fn admit(
        &mut self,
        conversation: &ConversationId,
        now: NaiveDateTime,
        settings: &Settings,
    ) -> Result<(), GateRejection> {
        if let Some((start, end)) = settings.working_hours.window() {
            // Bounds have minute precision, so the whole end minute is inside.
            let time = now.time();
            let minute = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
            if !within_working_hours(minute, start, end) {
                return Err(GateRejection::OutsideWorkingHours);
            }
        }
        self.limiter
            .try_admit(conversation, now.date(), &settings.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn conv(raw: &str) -> ConversationId {
        ConversationId::new(raw)
    }

    #[test]
    fn daytime_window_is_inclusive() {
        assert!(within_working_hours(t(9, 0), t(9, 0), t(18, 0)));
        assert!(within_working_hours(t(18, 0), t(9, 0), t(18, 0)));
        assert!(!within_working_hours(t(8, 59), t(9, 0), t(18, 0)));
        assert!(!within_working_hours(t(18, 1), t(9, 0), t(18, 0)));
    }

    #[test]
    fn overnight_window_wraps() {
        assert!(within_working_hours(t(23, 30), t(22, 0), t(6, 0)));
        assert!(within_working_hours(t(3, 0), t(22, 0), t(6, 0)));
        assert!(within_working_hours(t(6, 0), t(22, 0), t(6, 0)));
        assert!(!within_working_hours(t(12, 0), t(22, 0), t(6, 0)));
    }

    #[test]
    fn gate_rejects_outside_hours() {
        let mut settings = Settings::default();
        settings.working_hours.enabled = true;
        let mut gate = SendGate::new();
        assert_eq!(
            gate.admit(&conv("a"), at(1, 20, 0), &settings),
            Err(GateRejection::OutsideWorkingHours)
        );
        assert!(gate.admit(&conv("a"), at(1, 10, 0), &settings).is_ok());
        // Rejections consume no slot.
        assert_eq!(gate.limiter().sent_today(), 1);
    }

    #[test]
    fn end_minute_is_admitted_to_its_last_second() {
        let mut settings = Settings::default();
        settings.working_hours.enabled = true;
        settings.working_hours.start = "09:00".into();
        settings.working_hours.end = "18:00".into();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut gate = SendGate::new();

        let late = day.and_hms_opt(18, 0, 30).unwrap();
        assert_eq!(gate.admit(&conv("a"), late, &settings), Ok(()));
        let last = day.and_hms_milli_opt(18, 0, 59, 999).unwrap();
        assert_eq!(gate.admit(&conv("a"), last, &settings), Ok(()));
        assert_eq!(
            gate.admit(&conv("a"), at(1, 18, 1), &settings),
            Err(GateRejection::OutsideWorkingHours)
        );
    }

    #[test]
    fn malformed_window_does_not_block() {
        let mut settings = Settings::default();
        settings.working_hours.enabled = true;
        settings.working_hours.start = "nine".into();
        assert!(SendGate::new().admit(&conv("a"), at(1, 3, 0), &settings).is_ok());
    }

    #[test]
    fn daily_cap_blocks_until_next_day() {
        let limits = RateLimits {
            daily_reply_cap: 2,
            per_conversation_daily_cap: 0,
        };
        let today = at(1, 0, 0).date();
        let mut limiter = RateLimiter::new();
        assert!(limiter.try_admit(&conv("a"), today, &limits).is_ok());
        assert!(limiter.try_admit(&conv("b"), today, &limits).is_ok());
        assert_eq!(
            limiter.try_admit(&conv("c"), today, &limits),
            Err(GateRejection::DailyCapReached { cap: 2 })
        );

        let tomorrow = at(2, 0, 0).date();
        assert!(limiter.try_admit(&conv("c"), tomorrow, &limits).is_ok());
        assert_eq!(limiter.sent_today(), 1);
    }

    #[test]
    fn per_conversation_cap() {
        let limits = RateLimits {
            daily_reply_cap: 0,
            per_conversation_daily_cap: 1,
        };
        let today = at(1, 0, 0).date();
        let mut limiter = RateLimiter::new();
        assert!(limiter.try_admit(&conv("a"), today, &limits).is_ok());
        assert_eq!(
            limiter.try_admit(&conv("a"), today, &limits),
            Err(GateRejection::ConversationCapReached { cap: 1 })
        );
        assert!(limiter.try_admit(&conv("b"), today, &limits).is_ok());
        assert_eq!(limiter.sent_today_to(&conv("a")), 1);
    }

    #[test]
    fn zero_caps_are_unlimited() {
        let limits = RateLimits::default();
        let today = at(1, 0, 0).date();
        let mut limiter = RateLimiter::new();
        for _ in 0..500 {
            assert!(limiter.try_admit(&conv("a"), today, &limits).is_ok());
        }
    }
}
