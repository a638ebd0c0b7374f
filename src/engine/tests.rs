use super::*;
use crate::limits::*;
use chrono::NaiveDate;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("classbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), SchedulingConfig::default()).unwrap()
}

/// Monday 2026-10-26.
fn lesson_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 26).unwrap()
}

fn at(hour: i64, minute: i64) -> Ms {
    day_start_ms(lesson_day()) + hour * H + minute * M
}

/// A week before the lesson day.
fn now() -> Ms {
    at(8, 0) - 7 * DAY_MS
}

async fn teacher_with_monday_morning(engine: &Engine) -> Ulid {
    let teacher = Ulid::new();
    engine
        .replace_availability(teacher, vec![AvailabilityRule::new(1, 9 * 60, 11 * 60)])
        .await
        .unwrap();
    teacher
}

async fn student_with_lessons(engine: &Engine, total: u32, used: u32) -> (Ulid, Ulid) {
    let student = Ulid::new();
    let package = LessonPackage {
        id: Ulid::new(),
        student_id: student,
        total_lessons: total,
        used_lessons: used,
        valid_until: now() + 365 * DAY_MS,
    };
    let package_id = package.id;
    engine.grant_package(package).await.unwrap();
    (student, package_id)
}

fn request(student: Ulid, teacher: Ulid, start: Ms, minutes: u32) -> NewBooking {
    NewBooking {
        student_id: student,
        teacher_id: teacher,
        topic_id: Ulid::new(),
        start,
        duration_minutes: minutes,
        idempotency_key: None,
    }
}

async fn used(engine: &Engine, student: &Ulid, package: &Ulid) -> u32 {
    engine
        .get_packages(student)
        .await
        .into_iter()
        .find(|p| p.id == *package)
        .unwrap()
        .used_lessons
}

async fn slot_starts(engine: &Engine, teacher: Ulid, minutes: u32) -> Vec<Ms> {
    engine
        .generate_slots(teacher, lesson_day(), minutes, Some(30), now())
        .await
        .unwrap()
        .iter()
        .map(|s| s.start)
        .collect()
}

// ── Slots and reservations ───────────────────────────────

#[tokio::test]
async fn booking_removes_overlapping_slots() {
    let engine = engine_at("monday_scenario.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 10, 0).await;

    assert_eq!(
        slot_starts(&engine, teacher, 60).await,
        vec![at(9, 0), at(9, 30), at(10, 0)]
    );

    engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    assert_eq!(slot_starts(&engine, teacher, 60).await, vec![at(10, 0)]);
}

#[tokio::test]
async fn last_lesson_then_no_credit() {
    let engine = engine_at("last_lesson.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 10, 9).await;

    engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    assert_eq!(used(&engine, &student, &package).await, 10);
    assert_eq!(engine.credit_balance(&student, now()).await, 0);

    let err = engine
        .create_booking(request(student, teacher, at(10, 0), 60), Actor::Student(student), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoCredit { .. }));
    assert_eq!(used(&engine, &student, &package).await, 10);
}

#[tokio::test]
async fn overlapping_reservation_names_the_conflict() {
    let engine = engine_at("overlap_conflict.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (a, _) = student_with_lessons(&engine, 5, 0).await;
    let (b, b_pkg) = student_with_lessons(&engine, 5, 0).await;

    let first = engine
        .create_booking(request(a, teacher, at(9, 0), 60), Actor::Student(a), now())
        .await
        .unwrap();
    let err = engine
        .create_booking(request(b, teacher, at(9, 30), 60), Actor::Student(b), now())
        .await
        .unwrap_err();
    match err {
        EngineError::SlotUnavailable { conflict, .. } => assert_eq!(conflict, Some(first.id)),
        other => panic!("expected SlotUnavailable, got {other:?}"),
    }
    // The loser is not charged.
    assert_eq!(used(&engine, &b, &b_pkg).await, 0);
}

#[tokio::test]
async fn reservation_must_fit_availability_and_future() {
    let engine = engine_at("fit_availability.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;

    // Runs past the window end.
    let err = engine
        .create_booking(request(student, teacher, at(10, 30), 60), Actor::Student(student), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { conflict: None, .. }));

    // Already started.
    let err = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), at(9, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { conflict: None, .. }));
}

#[tokio::test]
async fn unknown_teacher_has_no_slots() {
    let engine = engine_at("unknown_teacher.wal");
    let plan = engine
        .generate_slots(Ulid::new(), lesson_day(), 60, None, now())
        .await
        .unwrap();
    assert_eq!(plan.iter().count(), 0);
}

#[tokio::test]
async fn soonest_expiring_package_is_debited() {
    let engine = engine_at("soonest_package.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, long_pkg) = student_with_lessons(&engine, 5, 0).await;
    let short = LessonPackage {
        id: Ulid::new(),
        student_id: student,
        total_lessons: 2,
        used_lessons: 0,
        valid_until: now() + 30 * DAY_MS,
    };
    let short_id = short.id;
    engine.grant_package(short).await.unwrap();

    let booking = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    assert_eq!(booking.package_id, short_id);
    assert_eq!(used(&engine, &student, &short_id).await, 1);
    assert_eq!(used(&engine, &student, &long_pkg).await, 0);
}

#[tokio::test]
async fn duplicate_package_rejected() {
    let engine = engine_at("dup_package.wal");
    let (student, package) = student_with_lessons(&engine, 5, 0).await;
    let again = LessonPackage {
        id: package,
        student_id: student,
        total_lessons: 5,
        used_lessons: 0,
        valid_until: now() + DAY_MS,
    };
    assert!(matches!(
        engine.grant_package(again).await,
        Err(EngineError::AlreadyExists(id)) if id == package
    ));
}

// ── Cancellation and refunds ─────────────────────────────

#[tokio::test]
async fn early_cancel_refunds_once() {
    let engine = engine_at("cancel_refund.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;

    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    assert_eq!(used(&engine, &student, &package).await, 1);

    let cancelled = engine
        .cancel_booking(b.id, Actor::Student(student), now())
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(now()));
    assert!(cancelled.refunded);
    assert_eq!(used(&engine, &student, &package).await, 0);

    let err = engine
        .cancel_booking(b.id, Actor::Student(student), now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: BookingStatus::Cancelled, .. }
    ));
    assert_eq!(used(&engine, &student, &package).await, 0);

    // The freed slot is offered again.
    assert_eq!(slot_starts(&engine, teacher, 60).await.len(), 3);
}

#[tokio::test]
async fn cancel_inside_cutoff_keeps_the_lesson() {
    let config = SchedulingConfig {
        refund_cutoff_minutes: 24 * 60,
        ..SchedulingConfig::default()
    };
    let engine = Engine::new(test_wal_path("cancel_cutoff.wal"), Arc::new(NotifyHub::new()), config).unwrap();
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;

    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    let cancelled = engine
        .cancel_booking(b.id, Actor::Student(student), at(9, 0) - 2 * H)
        .await
        .unwrap();
    assert!(!cancelled.refunded);
    assert_eq!(used(&engine, &student, &package).await, 1);

    let log = engine.attendance_log(&b.id).await.unwrap();
    assert_eq!(log.last().unwrap().action, AttendanceAction::Cancelled { refunded: false });
}

#[tokio::test]
async fn cancel_checks_ownership() {
    let engine = engine_at("cancel_owner.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;
    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    let err = engine
        .cancel_booking(b.id, Actor::Student(Ulid::new()), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = engine
        .cancel_booking(b.id, Actor::Teacher(Ulid::new()), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    engine
        .cancel_booking(b.id, Actor::Teacher(teacher), now())
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_unknown_booking_not_found() {
    let engine = engine_at("cancel_unknown.wal");
    let id = Ulid::new();
    assert!(matches!(
        engine.cancel_booking(id, Actor::System, now()).await,
        Err(EngineError::NotFound(x)) if x == id
    ));
}

// ── State machine ────────────────────────────────────────

#[tokio::test]
async fn attendance_only_after_start() {
    let engine = engine_at("attendance.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;
    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    let err = engine
        .mark_attendance(b.id, true, Actor::Teacher(teacher), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let err = engine
        .mark_attendance(b.id, true, Actor::Student(student), at(9, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let done = engine
        .mark_attendance(b.id, true, Actor::Teacher(teacher), at(10, 0))
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(done.attended_at, Some(at(10, 0)));
    // A completed lesson stays paid for.
    assert_eq!(used(&engine, &student, &package).await, 1);

    let actions: Vec<_> = engine
        .attendance_log(&b.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec![AttendanceAction::Booked, AttendanceAction::Attended]);
}

#[tokio::test]
async fn terminal_states_are_closed() {
    let engine = engine_at("terminal_closed.wal");
    let teacher = Ulid::new();
    engine
        .replace_availability(teacher, vec![AvailabilityRule::new(1, 8 * 60, 14 * 60)])
        .await
        .unwrap();
    let (student, _) = student_with_lessons(&engine, 10, 0).await;

    let mut terminal = Vec::new();
    for (hour, outcome) in [
        (8, BookingStatus::Completed),
        (9, BookingStatus::NoShow),
        (10, BookingStatus::Cancelled),
    ] {
        let b = engine
            .create_booking(request(student, teacher, at(hour, 0), 60), Actor::Student(student), now())
            .await
            .unwrap();
        let later = at(13, 0);
        engine
            .update_status(b.id, outcome, Actor::System, if outcome == BookingStatus::Cancelled { now() } else { later })
            .await
            .unwrap();
        terminal.push(b.id);
    }

    for id in terminal {
        for to in [
            BookingStatus::Scheduled,
            BookingStatus::Completed,
            BookingStatus::NoShow,
            BookingStatus::Cancelled,
        ] {
            let err = engine
                .update_status(id, to, Actor::System, at(13, 0))
                .await
                .unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidTransition { .. }),
                "{id} -> {to}: {err:?}"
            );
        }
    }
}

#[tokio::test]
async fn override_is_audited_and_admin_only() {
    let engine = engine_at("override.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;
    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    engine
        .cancel_booking(b.id, Actor::Student(student), now())
        .await
        .unwrap();

    let err = engine
        .override_status(b.id, BookingStatus::Completed, Actor::Teacher(teacher), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    assert_eq!(used(&engine, &student, &package).await, 0);
    let revived = engine
        .override_status(b.id, BookingStatus::Completed, Actor::Admin, now())
        .await
        .unwrap();
    assert_eq!(revived.status, BookingStatus::Completed);
    // The refund is taken back when the lesson counts again.
    assert!(!revived.refunded);
    assert_eq!(used(&engine, &student, &package).await, 1);

    let last = engine.attendance_log(&b.id).await.unwrap().pop().unwrap();
    assert_eq!(
        last.action,
        AttendanceAction::StatusOverride {
            from: BookingStatus::Cancelled,
            to: BookingStatus::Completed,
        }
    );
    assert_eq!(last.source, Actor::Admin);
}

#[tokio::test]
async fn override_back_to_scheduled_respects_calendar() {
    let engine = engine_at("override_conflict.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (a, _) = student_with_lessons(&engine, 5, 0).await;
    let (b, _) = student_with_lessons(&engine, 5, 0).await;

    let first = engine
        .create_booking(request(a, teacher, at(9, 0), 60), Actor::Student(a), now())
        .await
        .unwrap();
    engine.cancel_booking(first.id, Actor::Admin, now()).await.unwrap();
    let second = engine
        .create_booking(request(b, teacher, at(9, 0), 60), Actor::Student(b), now())
        .await
        .unwrap();

    let err = engine
        .override_status(first.id, BookingStatus::Scheduled, Actor::Admin, now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotUnavailable { conflict: Some(c), .. } if c == second.id
    ));
}

#[tokio::test]
async fn revived_booking_is_refunded_at_most_once_per_debit() {
    let engine = engine_at("override_refund_once.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;

    let first = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    engine
        .cancel_booking(first.id, Actor::Student(student), now())
        .await
        .unwrap();
    engine
        .override_status(first.id, BookingStatus::Scheduled, Actor::Admin, now())
        .await
        .unwrap();
    assert_eq!(used(&engine, &student, &package).await, 1);

    let second = engine
        .create_booking(request(student, teacher, at(10, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    let cancelled = engine
        .cancel_booking(first.id, Actor::Student(student), now())
        .await
        .unwrap();
    assert!(cancelled.refunded);

    let holding = engine
        .bookings_for_student(&student)
        .await
        .iter()
        .filter(|b| b.holds_credit())
        .count() as u32;
    assert_eq!(holding, 1);
    assert_eq!(used(&engine, &student, &package).await, holding);
    assert_eq!(engine.get_booking(&second.id).await.unwrap().status, BookingStatus::Scheduled);
}

#[tokio::test]
async fn revival_needs_a_lesson_left_on_the_package() {
    let engine = engine_at("override_no_credit.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 1, 0).await;

    let first = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    engine.cancel_booking(first.id, Actor::Admin, now()).await.unwrap();
    engine
        .create_booking(request(student, teacher, at(10, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    let err = engine
        .override_status(first.id, BookingStatus::Completed, Actor::Admin, at(13, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoCredit { .. }));
    let unchanged = engine.get_booking(&first.id).await.unwrap();
    assert_eq!(unchanged.status, BookingStatus::Cancelled);
    assert!(unchanged.refunded);
    assert_eq!(used(&engine, &student, &package).await, 1);
}

#[tokio::test]
async fn revival_debit_survives_replay() {
    let path = test_wal_path("override_replay.wal");
    let (teacher, student, package, booking_id) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), SchedulingConfig::default()).unwrap();
        let teacher = teacher_with_monday_morning(&engine).await;
        let (student, package) = student_with_lessons(&engine, 3, 0).await;
        let b = engine
            .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
            .await
            .unwrap();
        engine.cancel_booking(b.id, Actor::Admin, now()).await.unwrap();
        engine
            .override_status(b.id, BookingStatus::Scheduled, Actor::Admin, now())
            .await
            .unwrap();
        (teacher, student, package, b.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingConfig::default()).unwrap();
    let b = engine.get_booking(&booking_id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Scheduled);
    assert!(!b.refunded);
    assert_eq!(used(&engine, &student, &package).await, 1);
    assert_eq!(engine.bookings_for_teacher(&teacher).await.len(), 1);
}

#[tokio::test]
async fn reopening_through_guardrails_reports_current_state() {
    let engine = engine_at("reopen_current_state.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 2, 0).await;
    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    let err = engine
        .update_status(b.id, BookingStatus::Scheduled, Actor::Admin, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: BookingStatus::Scheduled, .. }));

    engine.cancel_booking(b.id, Actor::Admin, now()).await.unwrap();
    let err = engine
        .update_status(b.id, BookingStatus::Scheduled, Actor::Admin, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: BookingStatus::Cancelled, .. }));

    let missing = Ulid::new();
    let err = engine
        .update_status(missing, BookingStatus::Scheduled, Actor::Admin, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn out_of_range_start_is_rejected_not_overflowed() {
    let engine = engine_at("start_overflow.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 2, 0).await;

    for start in [i64::MAX - 1000, i64::MAX, i64::MIN, MAX_VALID_TIMESTAMP_MS] {
        let err = engine
            .create_booking(request(student, teacher, start, 60), Actor::Student(student), now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)), "{start}: {err:?}");
    }
    assert_eq!(used(&engine, &student, &package).await, 0);
}

// ── Availability store ───────────────────────────────────

#[tokio::test]
async fn invalid_replacement_keeps_previous_rules() {
    let engine = engine_at("replace_atomic.wal");
    let teacher = teacher_with_monday_morning(&engine).await;

    let err = engine
        .replace_availability(
            teacher,
            vec![
                AvailabilityRule::new(2, 600, 700),
                AvailabilityRule::new(2, 650, 750),
                AvailabilityRule::new(3, 700, 600),
            ],
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Validation(v) => assert_eq!(v.len(), 2),
        other => panic!("expected Validation, got {other:?}"),
    }

    let rules = engine.get_active_rules(&teacher, 1).await;
    assert_eq!(rules.len(), 1);
    assert_eq!((rules[0].start_minute, rules[0].end_minute), (540, 660));
    assert!(engine.get_active_rules(&teacher, 2).await.is_empty());
}

#[tokio::test]
async fn clear_is_idempotent() {
    let engine = engine_at("clear_idempotent.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    engine.clear_availability(teacher).await.unwrap();
    engine.clear_availability(teacher).await.unwrap();
    engine.clear_availability(Ulid::new()).await.unwrap();
    assert!(engine.get_rules(&teacher).await.is_empty());
    assert_eq!(slot_starts(&engine, teacher, 60).await, Vec::<Ms>::new());
}

// ── Idempotency, links, notifications ───────────────────

#[tokio::test]
async fn idempotency_key_replays_without_second_debit() {
    let engine = engine_at("idempotency.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, package) = student_with_lessons(&engine, 5, 0).await;

    let mut req = request(student, teacher, at(9, 0), 60);
    req.idempotency_key = Some("checkout-42".into());
    let first = engine
        .create_booking(req.clone(), Actor::Student(student), now())
        .await
        .unwrap();
    let second = engine
        .create_booking(req, Actor::Student(student), now())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(used(&engine, &student, &package).await, 1);

    let found = engine
        .find_by_idempotency_key(student, "checkout-42")
        .await
        .unwrap();
    assert_eq!(found.id, first.id);
    assert!(engine.find_by_idempotency_key(student, "other").await.is_none());
}

#[tokio::test]
async fn meeting_link_attached_once() {
    let engine = engine_at("meeting_link.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;
    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();

    let missing = engine.bookings_missing_links(now()).await;
    assert_eq!(missing.len(), 1);

    assert!(engine.attach_meeting_link(b.id, "https://meet/1".into()).await.unwrap());
    assert!(!engine.attach_meeting_link(b.id, "https://meet/2".into()).await.unwrap());
    let b = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(b.meeting_link.as_deref(), Some("https://meet/1"));
    assert!(engine.bookings_missing_links(now()).await.is_empty());
}

#[tokio::test]
async fn lifecycle_notices_reach_both_parties() {
    let engine = engine_at("notices.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;
    let mut t_rx = engine.notify.subscribe(&crate::notify::teacher_channel(teacher));
    let mut s_rx = engine.notify.subscribe(&crate::notify::student_channel(student));

    let b = engine
        .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    engine
        .cancel_booking(b.id, Actor::Student(student), now())
        .await
        .unwrap();

    let created: serde_json::Value = serde_json::from_str(&t_rx.recv().await.unwrap().payload).unwrap();
    assert_eq!(created["kind"], "booking_created");
    let cancelled: serde_json::Value = serde_json::from_str(&t_rx.recv().await.unwrap().payload).unwrap();
    assert_eq!(cancelled["kind"], "booking_cancelled");
    assert_eq!(cancelled["refunded"], true);
    assert_eq!(s_rx.recv().await.unwrap().channel, format!("student_{student}"));
}

#[tokio::test]
async fn student_and_teacher_listings() {
    let engine = engine_at("listings.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;
    let late = engine
        .create_booking(request(student, teacher, at(10, 0), 60), Actor::Student(student), now())
        .await
        .unwrap();
    let early = engine
        .create_booking(request(student, teacher, at(9, 0), 30), Actor::Student(student), now())
        .await
        .unwrap();

    let ids: Vec<_> = engine.bookings_for_student(&student).await.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
    let ids: Vec<_> = engine.bookings_for_teacher(&teacher).await.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
    assert!(engine.bookings_for_student(&Ulid::new()).await.is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_everything() {
    let path = test_wal_path("replay_all.wal");
    let notify = Arc::new(NotifyHub::new());
    let (teacher, student, package, kept, cancelled) = {
        let engine = Engine::new(path.clone(), notify.clone(), SchedulingConfig::default()).unwrap();
        let teacher = teacher_with_monday_morning(&engine).await;
        let (student, package) = student_with_lessons(&engine, 5, 0).await;
        let mut req = request(student, teacher, at(9, 0), 60);
        req.idempotency_key = Some("k1".into());
        let kept = engine.create_booking(req, Actor::Student(student), now()).await.unwrap();
        let gone = engine
            .create_booking(request(student, teacher, at(10, 0), 60), Actor::Student(student), now())
            .await
            .unwrap();
        engine.cancel_booking(gone.id, Actor::Student(student), now()).await.unwrap();
        (teacher, student, package, kept.id, gone.id)
    };

    let engine = Engine::new(path, notify, SchedulingConfig::default()).unwrap();
    assert_eq!(engine.get_active_rules(&teacher, 1).await.len(), 1);
    assert_eq!(used(&engine, &student, &package).await, 1);
    assert_eq!(engine.get_booking(&kept).await.unwrap().status, BookingStatus::Scheduled);
    assert_eq!(engine.get_booking(&cancelled).await.unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine.attendance_log(&cancelled).await.unwrap().len(), 2);
    assert_eq!(engine.find_by_idempotency_key(student, "k1").await.unwrap().id, kept);
    assert_eq!(slot_starts(&engine, teacher, 60).await, vec![at(10, 0)]);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let notify = Arc::new(NotifyHub::new());
    let (teacher, student, package, booking) = {
        let engine = Engine::new(path.clone(), notify.clone(), SchedulingConfig::default()).unwrap();
        let teacher = teacher_with_monday_morning(&engine).await;
        // Churn the rule set so compaction has something to drop.
        for _ in 0..5 {
            engine
                .replace_availability(teacher, vec![AvailabilityRule::new(1, 9 * 60, 11 * 60)])
                .await
                .unwrap();
        }
        let (student, package) = student_with_lessons(&engine, 5, 0).await;
        let b = engine
            .create_booking(request(student, teacher, at(9, 0), 60), Actor::Student(student), now())
            .await
            .unwrap();
        engine
            .mark_attendance(b.id, false, Actor::Teacher(teacher), at(9, 30))
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await >= 8);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (teacher, student, package, b.id)
    };

    let engine = Engine::new(path, notify, SchedulingConfig::default()).unwrap();
    assert_eq!(engine.get_active_rules(&teacher, 1).await.len(), 1);
    // The restored booking must not be debited a second time.
    assert_eq!(used(&engine, &student, &package).await, 1);
    let b = engine.get_booking(&booking).await.unwrap();
    assert_eq!(b.status, BookingStatus::NoShow);
    assert_eq!(engine.attendance_log(&booking).await.unwrap().len(), 2);
    assert_eq!(engine.bookings_for_student(&student).await.len(), 1);
}

#[tokio::test]
async fn timestamps_outside_calendar_bounds_rejected() {
    let engine = engine_at("bounds.wal");
    let teacher = teacher_with_monday_morning(&engine).await;
    let (student, _) = student_with_lessons(&engine, 5, 0).await;
    let err = engine
        .create_booking(
            request(student, teacher, MAX_VALID_TIMESTAMP_MS, 60),
            Actor::Student(student),
            now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_of_one_slot_exactly_one_wins() {
    let engine = Arc::new(engine_at("race_one_slot.wal"));
    let teacher = teacher_with_monday_morning(&engine).await;

    let mut students = Vec::new();
    for _ in 0..16 {
        students.push(student_with_lessons(&engine, 1, 0).await);
    }

    let mut handles = Vec::new();
    for (student, _) in students.clone() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(request(student, teacher, at(9, 30), 60), Actor::Student(student), now())
                .await
        }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);

    let mut debited = 0;
    for (student, package) in &students {
        debited += used(&engine, student, package).await;
    }
    assert_eq!(debited, 1);
}

mod prop {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Book { student: usize, slot: i64 },
        Cancel { pick: usize, hours_before: i64 },
        Override { pick: usize, to: usize },
    }

    const STATUSES: [BookingStatus; 4] = [
        BookingStatus::Scheduled,
        BookingStatus::Completed,
        BookingStatus::NoShow,
        BookingStatus::Cancelled,
    ];

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 0i64..16).prop_map(|(student, slot)| Op::Book { student, slot }),
            (0usize..32, 0i64..48).prop_map(|(pick, hours_before)| Op::Cancel { pick, hours_before }),
            (0usize..32, 0usize..4).prop_map(|(pick, to)| Op::Override { pick, to }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn credit_conserved_and_calendar_never_double_booked(ops in proptest::collection::vec(op(), 1..40)) {
            tokio_test::block_on(async {
                let config = SchedulingConfig {
                    refund_cutoff_minutes: 24 * 60,
                    ..SchedulingConfig::default()
                };
                let path = test_wal_path(&format!("prop_{}.wal", Ulid::new()));
                let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), config).unwrap();
                let teacher = Ulid::new();
                engine
                    .replace_availability(teacher, vec![AvailabilityRule::new(1, 8 * 60, 16 * 60)])
                    .await
                    .unwrap();
                let mut students = Vec::new();
                for _ in 0..3 {
                    students.push(student_with_lessons(&engine, 6, 0).await);
                }

                let mut created: Vec<Ulid> = Vec::new();
                for op in ops {
                    match op {
                        Op::Book { student, slot } => {
                            let (sid, _) = students[student];
                            // 45-minute lessons on a 30-minute grid overlap their neighbours.
                            let start = at(8, 0) + slot * 30 * M;
                            if let Ok(b) = engine
                                .create_booking(request(sid, teacher, start, 45), Actor::Student(sid), now())
                                .await
                            {
                                created.push(b.id);
                            }
                        }
                        Op::Cancel { pick, hours_before } => {
                            if created.is_empty() {
                                continue;
                            }
                            let id = created[pick % created.len()];
                            let when = at(8, 0) - hours_before * H;
                            let _ = engine.cancel_booking(id, Actor::System, when).await;
                        }
                        Op::Override { pick, to } => {
                            if created.is_empty() {
                                continue;
                            }
                            let id = created[pick % created.len()];
                            let _ = engine.override_status(id, STATUSES[to], Actor::Admin, now()).await;
                        }
                    }
                }

                let bookings = engine.bookings_for_teacher(&teacher).await;
                let scheduled: Vec<_> = bookings.iter().filter(|b| b.is_scheduled()).collect();
                for (i, a) in scheduled.iter().enumerate() {
                    for b in &scheduled[i + 1..] {
                        assert!(!a.span().overlaps(&b.span()), "{} overlaps {}", a.id, b.id);
                    }
                }

                for (sid, pid) in &students {
                    let holding = bookings
                        .iter()
                        .filter(|b| b.package_id == *pid && b.holds_credit())
                        .count() as u32;
                    let used_now = used(&engine, sid, pid).await;
                    assert_eq!(used_now, holding);
                    assert!(used_now <= 6);
                    for b in bookings.iter().filter(|b| b.refunded) {
                        assert_eq!(b.status, BookingStatus::Cancelled);
                    }
                }
                let _ = std::fs::remove_file(&path);
            });
        }
    }
}
