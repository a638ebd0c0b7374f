use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_duration, validate_span};
use super::interval::subtract;
use super::{Engine, EngineError};

/// Free time on one teacher-date, ready to be discretized into start times.
///
/// Holds no reference to engine state: iterating it again yields the same
/// slots, and nothing is enumerated until the caller pulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPlan {
    pub teacher_id: Ulid,
    /// Disjoint free sub-ranges in ascending order.
    pub free: Vec<Span>,
    pub duration_ms: Ms,
    pub step_ms: Ms,
    /// Candidates starting before this instant are skipped.
    pub not_before: Ms,
}

impl SlotPlan {
    pub fn iter(&self) -> Slots<'_> {
        Slots {
            plan: self,
            range: 0,
            cursor: None,
        }
    }
}

impl<'a> IntoIterator for &'a SlotPlan {
    type Item = BookableSlot;
    type IntoIter = Slots<'a>;

    fn into_iter(self) -> Slots<'a> {
        self.iter()
    }
}

/// Lazy walk over a plan's free ranges, `step_ms` apart within each range.
pub struct Slots<'a> {
    plan: &'a SlotPlan,
    range: usize,
    cursor: Option<Ms>,
}

impl Iterator for Slots<'_> {
    type Item = BookableSlot;

    fn next(&mut self) -> Option<BookableSlot> {
        while let Some(free) = self.plan.free.get(self.range) {
            let start = self.cursor.unwrap_or(free.start);
            let end = start + self.plan.duration_ms;
            if end > free.end {
                self.range += 1;
                self.cursor = None;
                continue;
            }
            self.cursor = Some(start + self.plan.step_ms);
            if start < self.plan.not_before {
                continue;
            }
            return Some(BookableSlot {
                teacher_id: self.plan.teacher_id,
                start,
                end,
            });
        }
        None
    }
}

/// Project the calendar's active rules onto `date`, cut out SCHEDULED
/// bookings and return the remaining free time.
pub fn plan_slots(
    cal: &TeacherCalendar,
    date: NaiveDate,
    duration_minutes: u32,
    step_minutes: u32,
    now: Ms,
) -> Result<SlotPlan, EngineError> {
    validate_duration(duration_minutes)?;
    if !(MIN_STEP_MINUTES..=MAX_STEP_MINUTES).contains(&step_minutes) {
        return Err(EngineError::LimitExceeded("slot step out of range"));
    }
    let day_start = day_start_ms(date);
    let day = Span::new(day_start, day_start + DAY_MS);
    validate_span(&day)?;

    let busy: Vec<Span> = cal.scheduled_overlapping(&day).map(|b| b.span()).collect();
    let mut free = Vec::new();
    for rule in cal.active_rules(day_of_week(date)) {
        free.extend(subtract(rule.window_on(day_start), &busy));
    }

    Ok(SlotPlan {
        teacher_id: cal.teacher_id,
        free,
        duration_ms: duration_minutes as Ms * MINUTE_MS,
        step_ms: step_minutes as Ms * MINUTE_MS,
        not_before: now,
    })
}

impl Engine {
    /// Bookable start times for a teacher on a date. Read-only; an empty plan is
    /// a valid answer. `step_minutes` falls back to the configured step.
    pub async fn generate_slots(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        step_minutes: Option<u32>,
        now: Ms,
    ) -> Result<SlotPlan, EngineError> {
        let step = step_minutes.unwrap_or(self.config.step_minutes);
        let plan = match self.get_calendar(&teacher_id) {
            Some(cal) => {
                let guard = cal.read().await;
                plan_slots(&guard, date, duration_minutes, step, now)?
            }
            None => {
                // Still validate so bad input fails the same way for unknown teachers.
                plan_slots(&TeacherCalendar::new(teacher_id), date, duration_minutes, step, now)?
            }
        };
        debug!(
            "slots for teacher {teacher_id} on {date}: {} free ranges",
            plan.free.len()
        );
        Ok(plan)
    }
}
