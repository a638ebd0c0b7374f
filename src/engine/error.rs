use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Span};

/// One reason an availability set was rejected. Indices refer to the submitted rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    EmptyRange { index: usize },
    DayOutOfRange { index: usize, day: u8 },
    MinuteOutOfRange { index: usize, minute: u16 },
    Overlap { day: u8, first: usize, second: usize },
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::EmptyRange { index } => {
                write!(f, "rule #{index}: start_time must be before end_time")
            }
            RuleViolation::DayOutOfRange { index, day } => {
                write!(f, "rule #{index}: day_of_week {day} not in 0..=6")
            }
            RuleViolation::MinuteOutOfRange { index, minute } => {
                write!(f, "rule #{index}: minute {minute} past end of day")
            }
            RuleViolation::Overlap { day, first, second } => {
                write!(f, "rules #{first} and #{second} overlap on day {day}")
            }
        }
    }
}

fn join_violations(v: &[RuleViolation]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid availability: {}", join_violations(.0))]
    Validation(Vec<RuleViolation>),

    #[error("no active lesson credit for student {student_id}: purchase or renew a package")]
    NoCredit { student_id: Ulid },

    #[error("slot [{}, {}) unavailable for teacher {teacher_id}{}", .span.start, .span.end,
        .conflict.map(|c| format!(" (conflicts with booking {c})")).unwrap_or_default())]
    SlotUnavailable {
        teacher_id: Ulid,
        span: Span,
        conflict: Option<Ulid>,
    },

    #[error("booking {booking_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        booking_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("{0} timed out; outcome unknown, re-read before retrying")]
    Timeout(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE surfaced to wire clients so each kind stays distinguishable.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NoCredit { .. } => "CB402",
            EngineError::SlotUnavailable { .. } => "23P01",
            EngineError::InvalidTransition { .. } => "CB409",
            EngineError::NotFound(_) => "CB404",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Forbidden(_) => "42501",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Timeout(_) => "57014",
            EngineError::WalError(_) => "58030",
        }
    }
}
