use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, RuleViolation};

/// Check a full rule set. Every violation is reported, not just the first.
///
/// Overlap only matters between active rules: an inactive rule is a parked
/// window the teacher may re-enable later, and it never produces slots.
pub fn validate_rules(rules: &[AvailabilityRule]) -> Result<(), EngineError> {
    if rules.len() > MAX_RULES_PER_TEACHER {
        return Err(EngineError::LimitExceeded("too many availability rules"));
    }

    let mut violations = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        if rule.day_of_week > 6 {
            violations.push(RuleViolation::DayOutOfRange { index, day: rule.day_of_week });
        }
        for minute in [rule.start_minute, rule.end_minute] {
            if minute > MINUTES_PER_DAY {
                violations.push(RuleViolation::MinuteOutOfRange { index, minute });
            }
        }
        if rule.start_minute >= rule.end_minute {
            violations.push(RuleViolation::EmptyRange { index });
        }
    }

    let comparable: Vec<(usize, &AvailabilityRule)> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_active && r.start_minute < r.end_minute)
        .collect();
    for (i, (first, a)) in comparable.iter().enumerate() {
        for (second, b) in &comparable[i + 1..] {
            if a.day_of_week == b.day_of_week && a.minute_span().overlaps(&b.minute_span()) {
                violations.push(RuleViolation::Overlap {
                    day: a.day_of_week,
                    first: *first,
                    second: *second,
                });
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(violations))
    }
}

impl Engine {
    /// Atomically swap the teacher's entire rule set. Nothing is written on failure.
    pub async fn replace_availability(
        &self,
        teacher_id: Ulid,
        rules: Vec<AvailabilityRule>,
    ) -> Result<(), EngineError> {
        validate_rules(&rules)?;

        let _gate = self.commit_gate.read().await;
        let cal = self.calendar_or_create(teacher_id);
        let mut guard = cal.write().await;
        let count = rules.len();
        let event = Event::AvailabilityReplaced { teacher_id, rules };
        self.persist_and_apply(&event, Some(&mut *guard), None).await?;
        info!("availability for teacher {teacher_id} replaced with {count} rules");
        Ok(())
    }

    /// Active rules for one weekday, ordered by start time. Unknown teachers have none.
    pub async fn get_active_rules(&self, teacher_id: &Ulid, day_of_week: u8) -> Vec<AvailabilityRule> {
        match self.get_calendar(teacher_id) {
            Some(cal) => cal.read().await.active_rules(day_of_week),
            None => Vec::new(),
        }
    }

    /// Every rule, active or not, ordered by day then start time.
    pub async fn get_rules(&self, teacher_id: &Ulid) -> Vec<AvailabilityRule> {
        let Some(cal) = self.get_calendar(teacher_id) else {
            return Vec::new();
        };
        let mut rules = cal.read().await.rules.clone();
        rules.sort_by_key(|r| (r.day_of_week, r.start_minute, r.end_minute));
        rules
    }

    /// Remove every rule. Clearing an empty set succeeds without touching the log.
    pub async fn clear_availability(&self, teacher_id: Ulid) -> Result<(), EngineError> {
        let Some(cal) = self.get_calendar(&teacher_id) else {
            return Ok(());
        };
        let _gate = self.commit_gate.read().await;
        let mut guard = cal.write().await;
        if guard.rules.is_empty() {
            return Ok(());
        }
        let event = Event::AvailabilityCleared { teacher_id };
        self.persist_and_apply(&event, Some(&mut *guard), None).await?;
        info!("availability for teacher {teacher_id} cleared");
        Ok(())
    }
}
