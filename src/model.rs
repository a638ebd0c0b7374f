use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Calendar helpers (UTC) ────────────────────────────────────

/// Unix ms of midnight UTC at the start of `date`.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Parse `HH:MM` into a minute offset from midnight. `24:00` is accepted as end of day.
pub fn parse_time_of_day(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_time_of_day(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ── Availability ──────────────────────────────────────────────

/// A recurring weekly window during which a teacher accepts lessons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub day_of_week: u8,
    /// Minutes from midnight, inclusive.
    pub start_minute: u16,
    /// Minutes from midnight, exclusive.
    pub end_minute: u16,
    pub is_active: bool,
}

impl AvailabilityRule {
    pub fn new(day_of_week: u8, start_minute: u16, end_minute: u16) -> Self {
        Self {
            id: Ulid::new(),
            day_of_week,
            start_minute,
            end_minute,
            is_active: true,
        }
    }

    /// Same-day minute offsets as a span. Only meaningful once validated.
    pub fn minute_span(&self) -> Span {
        Span::new(self.start_minute as Ms, self.end_minute as Ms)
    }

    /// Concrete window on the day starting at `day_start`.
    pub fn window_on(&self, day_start: Ms) -> Span {
        Span::new(
            day_start + self.start_minute as Ms * MINUTE_MS,
            day_start + self.end_minute as Ms * MINUTE_MS,
        )
    }
}

/// A candidate start time. Derived per query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookableSlot {
    pub teacher_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

// ── Bookings ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "SCHEDULED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::NoShow => "NO_SHOW",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Scheduled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SCHEDULED" => Ok(BookingStatus::Scheduled),
            "COMPLETED" => Ok(BookingStatus::Completed),
            "CANCELLED" | "CANCELED" => Ok(BookingStatus::Cancelled),
            "NO_SHOW" | "NOSHOW" => Ok(BookingStatus::NoShow),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// Who initiated a state change. Identity is established upstream; the engine
/// only checks that the actor is related to the booking it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Student(Ulid),
    Teacher(Ulid),
    Admin,
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Student(id) => write!(f, "student:{id}"),
            Actor::Teacher(id) => write!(f, "teacher:{id}"),
            Actor::Admin => f.write_str("admin"),
            Actor::System => f.write_str("system"),
        }
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "admin" => return Ok(Actor::Admin),
            "system" => return Ok(Actor::System),
            _ => {}
        }
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| format!("bad actor: {s}"))?;
        let id = Ulid::from_string(id).map_err(|e| format!("bad actor id: {e}"))?;
        match role.to_ascii_lowercase().as_str() {
            "student" => Ok(Actor::Student(id)),
            "teacher" => Ok(Actor::Teacher(id)),
            _ => Err(format!("bad actor role: {role}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub topic_id: Ulid,
    /// The lesson package that funded this booking.
    pub package_id: Ulid,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
    pub attended_at: Option<Ms>,
    pub meeting_link: Option<String>,
    pub idempotency_key: Option<String>,
    /// Set when a cancellation returned the lesson to the package.
    pub refunded: bool,
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(
            self.scheduled_at,
            self.scheduled_at + self.duration_minutes as Ms * MINUTE_MS,
        )
    }

    /// Every booking holds its package debit until a cancellation refunds it.
    pub fn holds_credit(&self) -> bool {
        !self.refunded
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == BookingStatus::Scheduled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceAction {
    Booked,
    Cancelled { refunded: bool },
    Attended,
    NoShow,
    StatusOverride { from: BookingStatus, to: BookingStatus },
}

impl fmt::Display for AttendanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceAction::Booked => f.write_str("BOOKED"),
            AttendanceAction::Cancelled { refunded: true } => f.write_str("CANCELLED_REFUNDED"),
            AttendanceAction::Cancelled { refunded: false } => f.write_str("CANCELLED"),
            AttendanceAction::Attended => f.write_str("ATTENDED"),
            AttendanceAction::NoShow => f.write_str("NO_SHOW"),
            AttendanceAction::StatusOverride { from, to } => write!(f, "OVERRIDE {from}->{to}"),
        }
    }
}

/// Append-only audit record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceLogEntry {
    pub booking_id: Ulid,
    pub action: AttendanceAction,
    pub timestamp: Ms,
    pub source: Actor,
}

// ── Lesson credit ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPackage {
    pub id: Ulid,
    pub student_id: Ulid,
    pub total_lessons: u32,
    pub used_lessons: u32,
    pub valid_until: Ms,
}

impl LessonPackage {
    /// Always derived from the two counters, never stored.
    pub fn remaining_lessons(&self) -> u32 {
        self.total_lessons.saturating_sub(self.used_lessons)
    }

    pub fn is_active(&self, now: Ms) -> bool {
        self.valid_until > now && self.remaining_lessons() > 0
    }
}

// ── Aggregates ────────────────────────────────────────────────

/// Everything the engine knows about one teacher: weekly rules, bookings
/// (sorted by `scheduled_at`), and each booking's attendance log.
#[derive(Debug, Clone)]
pub struct TeacherCalendar {
    pub teacher_id: Ulid,
    pub rules: Vec<AvailabilityRule>,
    pub bookings: Vec<Booking>,
    pub log: HashMap<Ulid, Vec<AttendanceLogEntry>>,
}

impl TeacherCalendar {
    pub fn new(teacher_id: Ulid) -> Self {
        Self {
            teacher_id,
            rules: Vec::new(),
            bookings: Vec::new(),
            log: HashMap::new(),
        }
    }

    /// Insert booking maintaining sort order by `scheduled_at`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.scheduled_at, |b| b.scheduled_at)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// SCHEDULED bookings whose range overlaps `query`.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn scheduled_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.scheduled_at < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_scheduled() && b.span().end > query.start)
    }

    /// Active rules for a weekday, ordered by start time.
    pub fn active_rules(&self, day_of_week: u8) -> Vec<AvailabilityRule> {
        let mut rules: Vec<AvailabilityRule> = self
            .rules
            .iter()
            .filter(|r| r.is_active && r.day_of_week == day_of_week)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.start_minute, r.end_minute));
        rules
    }

    pub fn append_log(&mut self, entry: AttendanceLogEntry) {
        self.log.entry(entry.booking_id).or_default().push(entry);
    }
}

#[derive(Debug, Clone)]
pub struct StudentAccount {
    pub student_id: Ulid,
    pub packages: Vec<LessonPackage>,
}

impl StudentAccount {
    pub fn new(student_id: Ulid) -> Self {
        Self {
            student_id,
            packages: Vec::new(),
        }
    }

    pub fn package(&self, id: &Ulid) -> Option<&LessonPackage> {
        self.packages.iter().find(|p| p.id == *id)
    }

    pub fn package_mut(&mut self, id: &Ulid) -> Option<&mut LessonPackage> {
        self.packages.iter_mut().find(|p| p.id == *id)
    }
}

// ── WAL records ───────────────────────────────────────────────

/// One record per atomic change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilityReplaced {
        teacher_id: Ulid,
        rules: Vec<AvailabilityRule>,
    },
    AvailabilityCleared {
        teacher_id: Ulid,
    },
    PackageGranted {
        package: LessonPackage,
    },
    /// Booking row, package debit and BOOKED log entry, as one record.
    BookingCreated {
        booking: Booking,
        entry: AttendanceLogEntry,
    },
    /// Status change, optional refund and log entry, as one record.
    BookingCancelled {
        booking_id: Ulid,
        teacher_id: Ulid,
        student_id: Ulid,
        package_id: Ulid,
        at: Ms,
        refunded: bool,
        entry: AttendanceLogEntry,
    },
    AttendanceMarked {
        booking_id: Ulid,
        teacher_id: Ulid,
        status: BookingStatus,
        at: Ms,
        entry: AttendanceLogEntry,
    },
    /// Status change and log entry. Reviving a refunded booking debits its
    /// package again in the same record (`redebit`).
    StatusOverridden {
        booking_id: Ulid,
        teacher_id: Ulid,
        student_id: Ulid,
        package_id: Ulid,
        to: BookingStatus,
        at: Ms,
        redebit: bool,
        entry: AttendanceLogEntry,
    },
    MeetingLinkAttached {
        booking_id: Ulid,
        teacher_id: Ulid,
        link: String,
    },
    /// Compaction snapshot of a booking; carries no ledger effect.
    BookingRestored {
        booking: Booking,
        log: Vec<AttendanceLogEntry>,
    },
}

impl Event {
    /// The teacher calendar this event touches, if any.
    pub fn teacher_id(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilityReplaced { teacher_id, .. }
            | Event::AvailabilityCleared { teacher_id }
            | Event::BookingCancelled { teacher_id, .. }
            | Event::AttendanceMarked { teacher_id, .. }
            | Event::StatusOverridden { teacher_id, .. }
            | Event::MeetingLinkAttached { teacher_id, .. } => Some(*teacher_id),
            Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => {
                Some(booking.teacher_id)
            }
            Event::PackageGranted { .. } => None,
        }
    }

    /// The student account this event touches, if any.
    pub fn student_id(&self) -> Option<Ulid> {
        match self {
            Event::PackageGranted { package } => Some(package.student_id),
            Event::BookingCreated { booking, .. } => Some(booking.student_id),
            Event::BookingCancelled { student_id, .. } => Some(*student_id),
            Event::StatusOverridden {
                student_id,
                redebit: true,
                ..
            } => Some(*student_id),
            _ => None,
        }
    }
}
