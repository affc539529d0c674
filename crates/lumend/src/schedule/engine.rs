use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Local;
use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;

use super::rule::ScheduleRule;

/// Rules are evaluated once per minute; windows have minute resolution.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Emitted when a profile should be applied on behalf of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub rule_id: String,
    pub rule_name: String,
    pub profile_id: String,
}

impl ScheduleEvent {
    fn for_rule(rule: &ScheduleRule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            profile_id: rule.profile.clone(),
        }
    }
}

/// Decides, once per tick, which rule is active and which events to raise.
///
/// Rules are evaluated read-only; the settings layer replaces the whole list
/// on edit. At most one rule is considered active at a time; when several
/// windows overlap the first in list order wins, deliberately, so callers
/// get a documented tie-break instead of an accidental one.
#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    rules: RwLock<Vec<ScheduleRule>>,
    active: Mutex<Option<String>>,
}

impl ScheduleEngine {
    pub fn new(rules: Vec<ScheduleRule>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rules: RwLock::new(rules),
                active: Mutex::new(None),
            }),
        }
    }

    /// Replace the rule list. Takes effect on the next tick.
    pub fn set_rules(&self, rules: Vec<ScheduleRule>) {
        if let Ok(mut current) = self.inner.rules.write() {
            *current = rules;
        }
    }

    pub fn rules(&self) -> Vec<ScheduleRule> {
        self.inner
            .rules
            .read()
            .map(|rules| rules.clone())
            .unwrap_or_default()
    }

    /// The rule currently considered active, if any.
    pub fn active_rule(&self) -> Option<ScheduleRule> {
        let active_id = self.inner.active.lock().ok()?.clone()?;
        self.rules().into_iter().find(|r| r.id == active_id)
    }

    /// The earliest upcoming (rule, start instant) across all enabled rules.
    pub fn next_schedule(&self, now: NaiveDateTime) -> Option<(ScheduleRule, NaiveDateTime)> {
        self.rules()
            .into_iter()
            .filter_map(|rule| rule.next_trigger_after(now).map(|at| (rule, at)))
            .min_by_key(|(_, at)| *at)
    }

    /// Spawn the tick loop and return the event stream.
    ///
    /// The first evaluation runs immediately, then once per minute. The loop
    /// exits when the receiver is dropped.
    pub fn start(&self) -> mpsc::UnboundedReceiver<ScheduleEvent> {
        let inner = self.inner.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Local::now().naive_local();
                for event in inner.tick(now) {
                    info!(
                        rule = %event.rule_name,
                        profile = %event.profile_id,
                        "schedule fired"
                    );
                    if tx.send(event).is_err() {
                        debug!("schedule event receiver dropped; stopping ticks");
                        return;
                    }
                }
            }
        });

        rx
    }
}

impl Inner {
    fn tick(&self, now: NaiveDateTime) -> Vec<ScheduleEvent> {
        let Ok(rules) = self.rules.read() else {
            return Vec::new();
        };
        let Ok(mut active) = self.active.lock() else {
            return Vec::new();
        };
        let (next_active, events) = evaluate(&rules, active.as_deref(), now);
        *active = next_active;
        events
    }
}

/// One tick of the schedule state machine.
///
/// Two independent paths can raise events: the edge-triggered change of the
/// active window, and the momentary exact-start-minute trigger. Both may
/// fire for the same rule in the same tick; that is intended, so rules with
/// and without a duration behave consistently.
fn evaluate(
    rules: &[ScheduleRule],
    previous_active: Option<&str>,
    now: NaiveDateTime,
) -> (Option<String>, Vec<ScheduleEvent>) {
    let active = rules.iter().find(|rule| rule.is_active_at(now));
    let mut events = Vec::new();

    if active.map(|rule| rule.id.as_str()) != previous_active {
        if let Some(rule) = active {
            events.push(ScheduleEvent::for_rule(rule));
        }
    }

    for rule in rules.iter().filter(|rule| rule.triggers_at(now)) {
        events.push(ScheduleEvent::for_rule(rule));
    }

    (active.map(|rule| rule.id.clone()), events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::rule::all_days;
    use chrono::NaiveDate;

    fn rule(id: &str, start: (u32, u32), end: Option<(u32, u32)>) -> ScheduleRule {
        ScheduleRule {
            id: id.to_string(),
            name: id.to_string(),
            icon: String::new(),
            start_hour: start.0,
            start_minute: start.1,
            end_hour: end.map(|e| e.0),
            end_minute: end.map(|e| e.1),
            days: all_days(),
            profile: format!("profile_{id}"),
            enabled: true,
        }
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_activation_edge_fires_exactly_once() {
        let rules = vec![rule("day", (8, 0), Some((18, 0)))];

        let (active, events) = evaluate(&rules, None, at(9, 0));
        assert_eq!(active.as_deref(), Some("day"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].profile_id, "profile_day");

        // Still active next tick: no repeat event.
        let (active, events) = evaluate(&rules, active.as_deref(), at(9, 1));
        assert_eq!(active.as_deref(), Some("day"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_deactivation_raises_no_event() {
        let rules = vec![rule("day", (8, 0), Some((18, 0)))];
        let (active, events) = evaluate(&rules, Some("day"), at(18, 0));
        assert_eq!(active, None);
        assert!(events.is_empty());
    }

    #[test]
    fn test_transition_between_rules_fires_for_new_rule() {
        let rules = vec![
            rule("day", (8, 0), Some((18, 0))),
            rule("evening", (18, 0), Some((22, 0))),
        ];
        let (active, events) = evaluate(&rules, Some("day"), at(18, 0));
        assert_eq!(active.as_deref(), Some("evening"));
        // Edge change plus the exact-start trigger for the same rule.
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.rule_id == "evening"));
    }

    #[test]
    fn test_overlap_tie_break_picks_first_in_list_order() {
        let rules = vec![
            rule("second", (8, 0), Some((20, 0))),
            rule("first", (8, 0), Some((20, 0))),
        ];
        let (active, _) = evaluate(&rules, None, at(12, 0));
        assert_eq!(active.as_deref(), Some("second"));
    }

    #[test]
    fn test_momentary_trigger_without_window_change() {
        // "boost" never becomes the active rule (the running window sorts
        // first), but its exact start minute still triggers.
        let rules = vec![
            rule("day", (8, 0), Some((18, 0))),
            rule("boost", (12, 30), Some((12, 45))),
        ];
        let (active, events) = evaluate(&rules, Some("day"), at(12, 30));
        assert_eq!(active.as_deref(), Some("day"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "boost");
    }

    #[test]
    fn test_disabled_rules_are_ignored() {
        let mut disabled = rule("off", (0, 0), None);
        disabled.enabled = false;
        let (active, events) = evaluate(&[disabled], None, at(12, 0));
        assert_eq!(active, None);
        assert!(events.is_empty());
    }

    #[test]
    fn test_set_rules_replaces_evaluation_input() {
        let engine = ScheduleEngine::new(vec![rule("old", (0, 0), None)]);
        engine.set_rules(vec![rule("new", (6, 0), None)]);
        let rules = engine.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "new");
    }

    #[test]
    fn test_next_schedule_picks_earliest_rule() {
        let engine = ScheduleEngine::new(vec![
            rule("late", (20, 0), None),
            rule("early", (14, 0), None),
        ]);
        let (next_rule, next_at) = engine.next_schedule(at(12, 0)).unwrap();
        assert_eq!(next_rule.id, "early");
        assert_eq!(next_at, at(14, 0));
    }
}
