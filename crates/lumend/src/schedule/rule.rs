use std::collections::BTreeSet;

use chrono::Datelike;
use chrono::Days;
use chrono::NaiveDateTime;
use chrono::Timelike;
use serde::Deserialize;
use serde::Serialize;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

pub fn all_days() -> BTreeSet<Weekday> {
    [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ]
    .into_iter()
    .collect()
}

fn default_enabled() -> bool {
    true
}

/// A time-window rule naming the profile to apply while it is active.
///
/// The window is half-open: `[start, end)`. An end time numerically before
/// the start denotes an overnight window spanning midnight. A rule without
/// an end time is active from its start through the rest of that day, and
/// also serves as a momentary trigger at the exact start minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,

    pub start_hour: u32,
    #[serde(default)]
    pub start_minute: u32,
    #[serde(default)]
    pub end_hour: Option<u32>,
    #[serde(default)]
    pub end_minute: Option<u32>,

    #[serde(default = "all_days")]
    pub days: BTreeSet<Weekday>,

    /// Profile applied when this rule becomes active or triggers.
    pub profile: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleRule {
    fn start_minutes(&self) -> u32 {
        self.start_hour * 60 + self.start_minute
    }

    /// Whether the rule's window contains `now`.
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        if !self.enabled || !self.days.contains(&now.weekday().into()) {
            return false;
        }

        let current = now.hour() * 60 + now.minute();
        let start = self.start_minutes();

        match self.end_hour {
            Some(end_hour) => {
                let end = end_hour * 60 + self.end_minute.unwrap_or(0);
                if end > start {
                    current >= start && current < end
                } else {
                    // Overnight window, e.g. 22:00-08:00.
                    current >= start || current < end
                }
            }
            None => current >= start,
        }
    }

    /// Whether `now` is exactly the rule's start minute on an allowed day.
    pub fn triggers_at(&self, now: NaiveDateTime) -> bool {
        self.enabled
            && self.days.contains(&now.weekday().into())
            && now.hour() == self.start_hour
            && now.minute() == self.start_minute
    }

    /// The earliest start instant strictly after `now`, scanning today
    /// through the next seven days.
    pub fn next_trigger_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.enabled {
            return None;
        }
        for day_offset in 0..8 {
            let Some(date) = now.date().checked_add_days(Days::new(day_offset)) else {
                continue;
            };
            if !self.days.contains(&date.weekday().into()) {
                continue;
            }
            let Some(start) = date.and_hms_opt(self.start_hour, self.start_minute, 0) else {
                continue;
            };
            if start > now {
                return Some(start);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rule(start: (u32, u32), end: Option<(u32, u32)>) -> ScheduleRule {
        ScheduleRule {
            id: "r1".to_string(),
            name: "Test".to_string(),
            icon: String::new(),
            start_hour: start.0,
            start_minute: start.1,
            end_hour: end.map(|e| e.0),
            end_minute: end.map(|e| e.1),
            days: all_days(),
            profile: "work".to_string(),
            enabled: true,
        }
    }

    // 2026-08-24 is a Monday.
    fn monday_at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_same_day_window_is_half_open() {
        let rule = rule((8, 0), Some((18, 0)));
        assert!(rule.is_active_at(monday_at(8, 0)));
        assert!(rule.is_active_at(monday_at(17, 59)));
        assert!(!rule.is_active_at(monday_at(18, 0)));
        assert!(!rule.is_active_at(monday_at(7, 59)));
    }

    #[test]
    fn test_overnight_window_spans_midnight() {
        let rule = rule((22, 0), Some((8, 0)));
        assert!(rule.is_active_at(monday_at(23, 0)));
        assert!(rule.is_active_at(monday_at(7, 0)));
        assert!(!rule.is_active_at(monday_at(12, 0)));
        assert!(!rule.is_active_at(monday_at(8, 0)));
    }

    #[test]
    fn test_rule_without_end_runs_to_end_of_day() {
        let rule = rule((20, 30), None);
        assert!(!rule.is_active_at(monday_at(20, 29)));
        assert!(rule.is_active_at(monday_at(20, 30)));
        assert!(rule.is_active_at(monday_at(23, 59)));
    }

    #[test]
    fn test_weekday_set_filters_activity() {
        let mut rule = rule((8, 0), Some((18, 0)));
        rule.days = [Weekday::Tuesday].into_iter().collect();
        assert!(!rule.is_active_at(monday_at(9, 0)));

        rule.days = [Weekday::Monday].into_iter().collect();
        assert!(rule.is_active_at(monday_at(9, 0)));
    }

    #[test]
    fn test_disabled_rule_is_never_active() {
        let mut rule = rule((0, 0), None);
        rule.enabled = false;
        assert!(!rule.is_active_at(monday_at(12, 0)));
        assert!(!rule.triggers_at(monday_at(0, 0)));
        assert!(rule.next_trigger_after(monday_at(12, 0)).is_none());
    }

    #[test]
    fn test_triggers_only_at_exact_start_minute() {
        let rule = rule((18, 15), None);
        assert!(rule.triggers_at(monday_at(18, 15)));
        assert!(!rule.triggers_at(monday_at(18, 14)));
        assert!(!rule.triggers_at(monday_at(18, 16)));
    }

    #[test]
    fn test_next_trigger_later_today() {
        let rule = rule((18, 0), None);
        let next = rule.next_trigger_after(monday_at(12, 0)).unwrap();
        assert_eq!(next, monday_at(18, 0));
    }

    #[test]
    fn test_next_trigger_skips_to_allowed_weekday() {
        let mut rule = rule((8, 0), None);
        rule.days = [Weekday::Thursday].into_iter().collect();
        let next = rule.next_trigger_after(monday_at(12, 0)).unwrap();
        // Thursday 2026-08-27.
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2026, 8, 27)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_next_trigger_is_strictly_future() {
        let rule = rule((12, 0), None);
        let next = rule.next_trigger_after(monday_at(12, 0)).unwrap();
        // Exactly now does not count; the next occurrence is tomorrow.
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2026, 8, 25)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_rule_parses_from_toml() {
        let rule: ScheduleRule = toml::from_str(
            r#"
            id = "evening"
            name = "Evening"
            start_hour = 22
            end_hour = 8
            days = ["friday", "saturday"]
            profile = "relax"
            "#,
        )
        .unwrap();
        assert_eq!(rule.start_minute, 0);
        assert_eq!(rule.end_hour, Some(8));
        assert!(rule.enabled);
        assert_eq!(rule.days.len(), 2);
        assert!(rule.days.contains(&Weekday::Friday));
    }
}
