use crate::model::Ms;

// ── Calendar bounds ───────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MINUTES_PER_DAY: u16 = 1440;

// ── Per-entity limits ─────────────────────────────────────────

pub const MAX_RULES_PER_TEACHER: usize = 64;
pub const MAX_LESSON_MINUTES: u32 = 480;
pub const MIN_STEP_MINUTES: u32 = 5;
pub const MAX_STEP_MINUTES: u32 = 240;
pub const MAX_PACKAGE_LESSONS: u32 = 10_000;
pub const MAX_PACKAGES_PER_STUDENT: usize = 256;
pub const MAX_BOOKINGS_PER_TEACHER: usize = 100_000;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_MEETING_LINK_LEN: usize = 2048;

// ── Hosting ───────────────────────────────────────────────────

pub const MAX_SCHOOLS: usize = 1024;
pub const MAX_SCHOOL_NAME_LEN: usize = 128;
pub const MAX_LISTEN_CHANNELS: usize = 64;
