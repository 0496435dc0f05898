//! Schedule rules and user-agent presets.
//!
//! Schedule rules apply alternative speed limits inside a daily window.
//! Times are `HH:MM` in UTC; a window may wrap midnight.

use serde::{Deserialize, Serialize};

/// Built-in user agents offered to clients via `get_user_agent_presets`.
pub const UA_PRESETS: &[(&str, &str)] = &[
    ("fetchd", concat!("fetchd/", env!("CARGO_PKG_VERSION"))),
    (
        "chrome",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    ),
    (
        "firefox",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    ),
    ("wget", "Wget/1.21.4"),
    ("curl", "curl/8.6.0"),
];

/// One alternative-limit window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Window start, `HH:MM` UTC.
    pub start: String,
    /// Window end, `HH:MM` UTC. May be earlier than `start` (wraps).
    pub end: String,
    /// Bytes per second inside the window; 0 = unlimited.
    #[serde(default)]
    pub download_limit: u64,
    #[serde(default)]
    pub upload_limit: u64,
    /// Disabled rules are stored but never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Returns the first enabled rule whose window contains the given UTC
/// time (minutes since midnight).
#[must_use]
pub fn active_schedule_rule(rules: &[ScheduleRule], minutes_utc: u32) -> Option<&ScheduleRule> {
    rules.iter().filter(|r| r.enabled).find(|rule| {
        let (Some(start), Some(end)) = (parse_hhmm(&rule.start), parse_hhmm(&rule.end)) else {
            return false;
        };
        if start <= end {
            (start..end).contains(&minutes_utc)
        } else {
            // Wraps midnight: e.g. 23:00–06:00.
            minutes_utc >= start || minutes_utc < end
        }
    })
}

/// Minutes-since-midnight for the current UTC time.
#[must_use]
pub fn utc_minutes_now() -> u32 {
    let secs = crate::record::unix_now().rem_euclid(86_400) as u32;
    secs / 60
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rule(start: &str, end: &str) -> ScheduleRule {
        ScheduleRule {
            start: start.into(),
            end: end.into(),
            download_limit: 1024,
            upload_limit: 512,
            enabled: true,
        }
    }

    #[test]
    fn test_simple_window() {
        let rules = [rule("09:00", "17:00")];
        assert!(active_schedule_rule(&rules, 9 * 60).is_some());
        assert!(active_schedule_rule(&rules, 12 * 60).is_some());
        assert!(active_schedule_rule(&rules, 17 * 60).is_none());
        assert!(active_schedule_rule(&rules, 3 * 60).is_none());
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let rules = [rule("23:00", "06:00")];
        assert!(active_schedule_rule(&rules, 23 * 60 + 30).is_some());
        assert!(active_schedule_rule(&rules, 2 * 60).is_some());
        assert!(active_schedule_rule(&rules, 12 * 60).is_none());
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut disabled = rule("00:00", "23:59");
        disabled.enabled = false;
        assert!(active_schedule_rule(&[disabled], 600).is_none());
    }

    #[test]
    fn test_malformed_times_never_match() {
        let rules = [rule("25:00", "26:00"), rule("nonsense", "17:00")];
        for minute in [0, 600, 1200] {
            assert!(active_schedule_rule(&rules, minute).is_none());
        }
    }

    #[test]
    fn test_serde_defaults() {
        let rule: ScheduleRule =
            serde_json::from_str(r#"{"start":"01:00","end":"02:00"}"#).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.download_limit, 0);
    }

    #[test]
    fn test_presets_include_engine_default() {
        assert!(UA_PRESETS.iter().any(|(name, _)| *name == "fetchd"));
        assert!(UA_PRESETS.len() >= 3);
    }
}
