use chrono::Utc;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration_minutes: u32) -> Result<(), EngineError> {
    if duration_minutes == 0 || duration_minutes > MAX_LESSON_MINUTES {
        return Err(EngineError::LimitExceeded("lesson duration out of range"));
    }
    Ok(())
}

/// The requested span must lie inside a single active rule window on its day.
pub(crate) fn within_availability(cal: &TeacherCalendar, span: &Span) -> bool {
    let Some(date) = date_of(span.start) else {
        return false;
    };
    let day_start = day_start_ms(date);
    cal.active_rules(day_of_week(date))
        .iter()
        .any(|rule| rule.window_on(day_start).contains_span(span))
}

/// Fails with the first SCHEDULED booking that overlaps `span`.
pub(crate) fn check_no_conflict(cal: &TeacherCalendar, span: &Span) -> Result<(), EngineError> {
    if let Some(existing) = cal.scheduled_overlapping(span).next() {
        return Err(EngineError::SlotUnavailable {
            teacher_id: cal.teacher_id,
            span: *span,
            conflict: Some(existing.id),
        });
    }
    Ok(())
}

/// Everything a new booking on `span` must satisfy against the calendar.
pub(crate) fn check_bookable(cal: &TeacherCalendar, span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < now || !within_availability(cal, span) {
        return Err(EngineError::SlotUnavailable {
            teacher_id: cal.teacher_id,
            span: *span,
            conflict: None,
        });
    }
    check_no_conflict(cal, span)
}
