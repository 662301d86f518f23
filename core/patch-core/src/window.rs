//! Maintenance window budget tracking.
//!
//! A window is a start instant plus a maximum duration given as an ISO-8601
//! time-only duration (`PT2H`, `PT3M40S`). Day/month/year components are not
//! accepted. Every query takes `now` explicitly; callers pass `Utc::now()`.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::WindowError;

/// Minutes a single package install is expected to take at most.
pub const PACKAGE_INSTALL_EXPECTED_MAX_TIME_IN_MINUTES: i64 = 5;

static RE_TIME_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)(?:\.\d+)?S)?$").unwrap()
});

/// Parses `PT#H#M#S` (each component optional, at least one present).
pub fn parse_duration(value: &str) -> Result<Duration, WindowError> {
    let value = value.trim();
    let caps = RE_TIME_DURATION
        .captures(value)
        .ok_or_else(|| WindowError::Format(value.to_string()))?;

    let component = |idx: usize| -> Result<Option<i64>, WindowError> {
        caps.get(idx)
            .map(|m| {
                m.as_str()
                    .parse::<i64>()
                    .map_err(|_| WindowError::Format(value.to_string()))
            })
            .transpose()
    };
    let (hours, minutes, seconds) = (component(1)?, component(2)?, component(3)?);
    if hours.is_none() && minutes.is_none() && seconds.is_none() {
        return Err(WindowError::Format(value.to_string()));
    }

    let total_seconds = hours
        .unwrap_or(0)
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes.unwrap_or(0).checked_mul(60)?))
        .and_then(|hm| hm.checked_add(seconds.unwrap_or(0)))
        .ok_or_else(|| WindowError::Format(value.to_string()))?;
    Duration::try_seconds(total_seconds).ok_or_else(|| WindowError::Format(value.to_string()))
}

/// Parses an RFC 3339 start time (fractional seconds of any precision allowed).
pub fn parse_start_time(value: &str) -> Result<DateTime<Utc>, WindowError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WindowError::StartTime(format!("{}: {}", value, e)))
}

/// Immutable time budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    start: DateTime<Utc>,
    duration: Duration,
}

impl MaintenanceWindow {
    pub fn new(start: DateTime<Utc>, duration: Duration) -> Self {
        Self { start, duration }
    }

    /// Fails with [`WindowError::Format`] when the window would end past the
    /// last representable instant.
    pub fn parse(start_time: &str, maximum_duration: &str) -> Result<Self, WindowError> {
        let start = parse_start_time(start_time)?;
        let duration = parse_duration(maximum_duration)?;
        if start.checked_add_signed(duration).is_none() {
            return Err(WindowError::Format(maximum_duration.trim().to_string()));
        }
        Ok(Self::new(start, duration))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Saturates at the last representable instant.
    pub fn end(&self) -> DateTime<Utc> {
        self.start
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whole minutes left in the window, floored and never negative.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        let remaining = self.end().signed_duration_since(now);
        if remaining <= Duration::zero() {
            return 0;
        }
        remaining.num_minutes()
    }

    pub fn is_install_time_available(&self, now: DateTime<Utc>) -> bool {
        let remaining = self.remaining_minutes(now);
        let available = remaining > PACKAGE_INSTALL_EXPECTED_MAX_TIME_IN_MINUTES;
        if !available {
            tracing::debug!(
                remaining_minutes = remaining,
                "Maintenance window has no room for another package"
            );
        }
        available
    }

    /// Percentage of the window elapsed at `now`. Not clamped above 100.
    pub fn percentage_used(&self, now: DateTime<Utc>) -> Result<f64, WindowError> {
        if self.duration == Duration::zero() {
            return Err(WindowError::DivideByZero);
        }
        if now < self.start {
            return Err(WindowError::NegativeElapsed {
                start: self.start.to_rfc3339(),
                now: now.to_rfc3339(),
            });
        }
        let elapsed = now.signed_duration_since(self.start);
        let elapsed_ms = elapsed.num_milliseconds() as f64;
        let duration_ms = self.duration.num_milliseconds() as f64;
        Ok(elapsed_ms / duration_ms * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> DateTime<Utc> {
        parse_start_time(value).unwrap()
    }

    fn window(start: &str, duration: &str) -> MaintenanceWindow {
        MaintenanceWindow::parse(start, duration).unwrap()
    }

    #[test]
    fn test_parse_duration_components() {
        assert_eq!(parse_duration("PT2H").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("PT3M").unwrap(), Duration::minutes(3));
        assert_eq!(parse_duration("PT40S").unwrap(), Duration::seconds(40));
        assert_eq!(
            parse_duration("PT3M40S").unwrap(),
            Duration::seconds(3 * 60 + 40)
        );
        assert_eq!(
            parse_duration("PT12H3M40S").unwrap(),
            Duration::seconds(12 * 3600 + 3 * 60 + 40)
        );
        assert_eq!(
            parse_duration("PT1H40S").unwrap(),
            Duration::seconds(3600 + 40)
        );
        assert_eq!(parse_duration("PT0H").unwrap(), Duration::zero());
    }

    #[test]
    fn test_parse_duration_rejects_day_component() {
        assert!(matches!(
            parse_duration("P1DT12H3M40S"),
            Err(WindowError::Format(_))
        ));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("20m").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_rejects_window_past_calendar_range() {
        assert!(matches!(
            MaintenanceWindow::parse("2024-01-01T00:00:00Z", "PT3000000000H"),
            Err(WindowError::Format(_))
        ));
    }

    #[test]
    fn test_oversized_window_saturates() {
        let start = at("2024-01-01T00:00:00Z");
        let w = MaintenanceWindow::new(start, Duration::hours(3_000_000_000));
        assert_eq!(w.end(), DateTime::<Utc>::MAX_UTC);
        assert!(w.remaining_minutes(start) > 0);
        assert!(w.is_install_time_available(start));
    }

    #[test]
    fn test_remaining_minutes_mid_window() {
        let w = window("2017-02-15T18:15:12.9828835Z", "PT1H");
        assert_eq!(w.remaining_minutes(at("2017-02-15T18:30:20Z")), 44);
    }

    #[test]
    fn test_remaining_minutes_after_window() {
        let w = window("2017-02-15T18:15:12.9828835Z", "PT1H");
        assert_eq!(w.remaining_minutes(at("2017-02-15T19:16:20Z")), 0);
    }

    #[test]
    fn test_remaining_minutes_never_increases() {
        let w = window("2017-02-15T18:00:00Z", "PT1H");
        let mut last = i64::MAX;
        for minute in 0..90 {
            let now = at("2017-02-15T18:00:00Z") + Duration::minutes(minute);
            let remaining = w.remaining_minutes(now);
            assert!(remaining <= last);
            assert!(remaining >= 0);
            last = remaining;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn test_install_time_available() {
        let now = Utc::now();
        let w = MaintenanceWindow::new(now - Duration::minutes(39), Duration::hours(1));
        assert!(w.is_install_time_available(now));
    }

    #[test]
    fn test_install_time_unavailable_after_window() {
        let now = Utc::now();
        let w = MaintenanceWindow::new(now - Duration::minutes(62), Duration::hours(1));
        assert!(!w.is_install_time_available(now));
    }

    #[test]
    fn test_install_time_unavailable_at_threshold() {
        let now = at("2020-01-01T00:55:00Z");
        let w = window("2020-01-01T00:00:00Z", "PT1H");
        assert_eq!(w.remaining_minutes(now), 5);
        assert!(!w.is_install_time_available(now));
    }

    #[test]
    fn test_percentage_used() {
        let now = at("2020-01-01T00:18:00Z");
        let w = window("2020-01-01T00:00:00Z", "PT3H");
        let pct = w.percentage_used(now).unwrap();
        assert!((pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_used_zero_duration_fails() {
        let w = window("2020-01-01T00:00:00Z", "PT0H");
        assert_eq!(
            w.percentage_used(at("2020-01-01T00:10:00Z")),
            Err(WindowError::DivideByZero)
        );
    }

    #[test]
    fn test_percentage_used_before_start_fails() {
        let now = Utc::now();
        let w = MaintenanceWindow::new(now + Duration::hours(1), Duration::hours(2));
        assert!(matches!(
            w.percentage_used(now),
            Err(WindowError::NegativeElapsed { .. })
        ));
    }
}
