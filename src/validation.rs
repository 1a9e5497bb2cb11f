//! Input validation: length bounds, disallowed characters and a
//! sliding-window rate limit.
//!
//! [`Validator::validate`] applies the three checks in that order and stops
//! at the first failure. It never records a request on its own; callers
//! invoke [`Validator::record_request`] only when a submission actually goes
//! out, so a rejected or merely re-validated message does not consume quota.
//!
//! Time comes from a [`Clock`]. The window is pruned against wall-clock reads
//! taken at call time with no correction for suspended execution.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use crate::config::{InputConfig, ValidationConfig};
use crate::error::ValidationError;

/// Characters rejected by the chat client.
pub const DEFAULT_DISALLOWED: [char; 6] = ['<', '>', '{', '}', '[', ']'];

/// Source of "now" for rate limiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Timestamps of recent requests, oldest first.
#[derive(Debug, Clone)]
pub struct RateWindow {
    max_requests: usize,
    window: Duration,
    times: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    pub fn new(max_requests: usize, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::seconds(window_seconds as i64),
            times: VecDeque::new(),
        }
    }

    /// Drops every timestamp that is `window` or more in the past.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.times.front() {
            if now - *oldest >= self.window {
                self.times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prunes, then fails if the window is already full.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.prune(now);
        if self.times.len() < self.max_requests {
            return Ok(());
        }
        let oldest = self.times.front().copied().unwrap_or(now);
        let remaining_ms = (oldest + self.window - now).num_milliseconds().max(0);
        let retry_after = ((remaining_ms + 999) / 1000).max(1) as u64;
        Err(ValidationError::RateLimited { retry_after })
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.times.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    min_length: usize,
    max_length: usize,
    disallowed: BTreeSet<char>,
    window: RateWindow,
}

impl Validator {
    pub fn new(min_length: usize, max_length: usize, max_requests: usize, window_seconds: u64) -> Self {
        Self {
            min_length,
            max_length,
            disallowed: DEFAULT_DISALLOWED.into_iter().collect(),
            window: RateWindow::new(max_requests, window_seconds),
        }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(
            config.min_length,
            config.max_length,
            config.max_requests,
            config.window_seconds,
        )
    }

    /// Server-side limits also reject backslashes.
    pub fn for_input(config: &InputConfig) -> Self {
        Self::new(
            config.min_length,
            config.max_length,
            config.max_requests,
            config.window_seconds,
        )
        .with_disallowed(DEFAULT_DISALLOWED.into_iter().chain(['\\']))
    }

    pub fn with_disallowed(mut self, chars: impl IntoIterator<Item = char>) -> Self {
        self.disallowed = chars.into_iter().collect();
        self
    }

    pub fn check_length(&self, text: &str) -> Result<(), ValidationError> {
        let len = text.chars().count();
        if len < self.min_length {
            return Err(ValidationError::TooShort {
                min: self.min_length,
            });
        }
        if len > self.max_length {
            return Err(ValidationError::TooLong {
                max: self.max_length,
            });
        }
        Ok(())
    }

    pub fn check_characters(&self, text: &str) -> Result<(), ValidationError> {
        if text.chars().any(|c| self.disallowed.contains(&c)) {
            return Err(ValidationError::InvalidCharacters);
        }
        Ok(())
    }

    /// Length, characters, then rate limit. Does not record a request.
    pub fn validate(&mut self, text: &str, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.check_length(text)?;
        self.check_characters(text)?;
        self.window.check(now)
    }

    pub fn record_request(&mut self, now: DateTime<Utc>) {
        self.window.record(now);
    }

    /// Characters left before `max_length`; negative when over.
    pub fn remaining_chars(&self, text: &str) -> i64 {
        self.max_length as i64 - text.chars().count() as i64
    }

    pub fn requests_in_window(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn validator() -> Validator {
        Validator::new(2, 20, 10, 60)
    }

    #[test]
    fn test_too_short() {
        let mut v = validator();
        assert_eq!(
            v.validate("a", t0()),
            Err(ValidationError::TooShort { min: 2 })
        );
    }

    #[test]
    fn test_too_long() {
        let mut v = validator();
        let text = "a".repeat(21);
        assert_eq!(
            v.validate(&text, t0()),
            Err(ValidationError::TooLong { max: 20 })
        );
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let mut v = validator();
        assert!(v.validate("ab", t0()).is_ok());
        assert!(v.validate(&"a".repeat(20), t0()).is_ok());
    }

    #[test]
    fn test_length_counts_chars_not_bytes() {
        let v = Validator::new(1, 3, 10, 60);
        assert!(v.check_length("héé").is_ok());
    }

    #[test]
    fn test_every_disallowed_char_is_rejected() {
        let mut v = validator();
        for c in DEFAULT_DISALLOWED {
            let text = format!("hi {} there", c);
            assert_eq!(
                v.validate(&text, t0()),
                Err(ValidationError::InvalidCharacters),
                "char {:?} should be rejected",
                c
            );
        }
    }

    #[test]
    fn test_length_checked_before_characters() {
        let mut v = validator();
        assert_eq!(
            v.validate("<", t0()),
            Err(ValidationError::TooShort { min: 2 })
        );
    }

    #[test]
    fn test_validate_does_not_record() {
        let mut v = validator();
        for _ in 0..50 {
            assert!(v.validate("hello", t0()).is_ok());
        }
        assert_eq!(v.requests_in_window(), 0);
    }

    #[test]
    fn test_eleventh_request_in_window_is_limited() {
        let mut v = validator();
        let mut now = t0();
        for _ in 0..10 {
            assert!(v.validate("hello", now).is_ok());
            v.record_request(now);
            now += Duration::seconds(1);
        }

        let err = v.validate("hello", now).unwrap_err();
        let retry = err.retry_after().unwrap();
        assert!(retry > 0 && retry <= 60, "retry_after = {}", retry);
        // Oldest at t0, now = t0 + 10s -> 50s left.
        assert_eq!(retry, 50);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let mut v = Validator::new(1, 10, 1, 60);
        v.record_request(t0());
        let err = v
            .validate("x", t0() + Duration::milliseconds(500))
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(60));
    }

    #[test]
    fn test_window_elapses() {
        let mut v = validator();
        for _ in 0..10 {
            v.record_request(t0());
        }
        assert!(v.validate("hello", t0() + Duration::seconds(59)).is_err());
        assert!(v.validate("hello", t0() + Duration::seconds(60)).is_ok());
        assert_eq!(v.requests_in_window(), 0);
    }

    #[test]
    fn test_remaining_chars() {
        let v = validator();
        assert_eq!(v.remaining_chars("hello"), 15);
        assert_eq!(v.remaining_chars(&"x".repeat(25)), -5);
    }

    #[test]
    fn test_input_validator_rejects_backslash() {
        let v = Validator::for_input(&InputConfig::default());
        assert_eq!(
            v.check_characters("C:\\path"),
            Err(ValidationError::InvalidCharacters)
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::seconds(61));
        assert_eq!(clock.now(), t0() + Duration::seconds(61));
    }
}
