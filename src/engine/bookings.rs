use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::conflict::{check_bookable, validate_duration, validate_span};
use super::ledger::select_package;
use super::{Engine, EngineError};

/// A reservation request as the facade hands it to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub topic_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub idempotency_key: Option<String>,
}

impl NewBooking {
    /// The requested lesson window. `None` when `start` lies outside the
    /// supported calendar range.
    pub fn span(&self) -> Option<Span> {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&self.start) {
            return None;
        }
        let end = self
            .start
            .checked_add(Ms::from(self.duration_minutes).checked_mul(MINUTE_MS)?)?;
        Some(Span::new(self.start, end))
    }
}

fn log_entry(booking_id: Ulid, action: AttendanceAction, timestamp: Ms, source: Actor) -> AttendanceLogEntry {
    AttendanceLogEntry {
        booking_id,
        action,
        timestamp,
        source,
    }
}

/// Students act on their own bookings, teachers on their own calendar.
fn authorize(actor: Actor, booking: &Booking) -> Result<(), EngineError> {
    match actor {
        Actor::Student(id) if id != booking.student_id => Err(EngineError::Forbidden(format!(
            "booking {} belongs to another student",
            booking.id
        ))),
        Actor::Teacher(id) if id != booking.teacher_id => Err(EngineError::Forbidden(format!(
            "booking {} is on another teacher's calendar",
            booking.id
        ))),
        _ => Ok(()),
    }
}

impl Engine {
    /// Check-and-insert under the teacher's write lock. The booking row, the
    /// package debit and the BOOKED entry commit as one record.
    pub async fn create_booking(
        &self,
        req: NewBooking,
        actor: Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        validate_duration(req.duration_minutes)?;
        let span = req
            .span()
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        validate_span(&span)?;
        if let Some(key) = &req.idempotency_key
            && (key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(EngineError::LimitExceeded("idempotency key length"));
        }
        match actor {
            Actor::Student(id) if id != req.student_id => {
                return Err(EngineError::Forbidden("students book only for themselves".into()));
            }
            Actor::Teacher(_) => {
                return Err(EngineError::Forbidden("teachers cannot spend student credit".into()));
            }
            _ => {}
        }

        let _gate = self.commit_gate.read().await;
        let cal = self.calendar_or_create(req.teacher_id);
        let mut cal_guard = cal.write().await;
        let acct = self.account_or_create(req.student_id);
        let mut acct_guard = acct.write().await;

        let existing = req.idempotency_key.as_ref().and_then(|key| {
            self.idempotency
                .get(&(req.student_id, key.clone()))
                .map(|e| *e.value())
        });
        if let Some(existing) = existing {
            drop(acct_guard);
            drop(cal_guard);
            info!("idempotent replay of booking {existing} for student {}", req.student_id);
            return self.get_booking(&existing).await;
        }

        let Some(package_id) = select_package(&acct_guard, now).map(|p| p.id) else {
            metrics::counter!(obs::NO_CREDIT_TOTAL).increment(1);
            return Err(EngineError::NoCredit { student_id: req.student_id });
        };
        if let Err(e) = check_bookable(&cal_guard, &span, now) {
            metrics::counter!(obs::BOOKING_CONFLICTS_TOTAL).increment(1);
            warn!("booking rejected for teacher {}: {e}", req.teacher_id);
            return Err(e);
        }
        if cal_guard.bookings.len() >= MAX_BOOKINGS_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many bookings for teacher"));
        }

        let booking = Booking {
            id: Ulid::new(),
            student_id: req.student_id,
            teacher_id: req.teacher_id,
            topic_id: req.topic_id,
            package_id,
            scheduled_at: req.start,
            duration_minutes: req.duration_minutes,
            status: BookingStatus::Scheduled,
            cancelled_at: None,
            attended_at: None,
            meeting_link: None,
            idempotency_key: req.idempotency_key,
            refunded: false,
            created_at: now,
        };
        let event = Event::BookingCreated {
            entry: log_entry(booking.id, AttendanceAction::Booked, now, actor),
            booking: booking.clone(),
        };
        self.persist_and_apply(&event, Some(&mut *cal_guard), Some(&mut *acct_guard))
            .await?;

        metrics::counter!(obs::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {} created: student {} with teacher {} at {}",
            booking.id, booking.student_id, booking.teacher_id, booking.scheduled_at
        );
        Ok(booking)
    }

    /// SCHEDULED → CANCELLED, refunding the lesson when made before the cutoff.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut cal_guard = self.resolve_booking_write(&booking_id).await?;
        let booking = cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        authorize(actor, &booking)?;
        if !booking.is_scheduled() {
            warn!(
                "stale cancel of booking {booking_id} in state {} by {actor}",
                booking.status
            );
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }

        // A booking is refunded at most once.
        let refunded = !booking.refunded
            && now < booking.scheduled_at.saturating_sub(self.config.refund_cutoff_ms());
        let acct = self.account_or_create(booking.student_id);
        let mut acct_guard = acct.write().await;
        let event = Event::BookingCancelled {
            booking_id,
            teacher_id: booking.teacher_id,
            student_id: booking.student_id,
            package_id: booking.package_id,
            at: now,
            refunded,
            entry: log_entry(booking_id, AttendanceAction::Cancelled { refunded }, now, actor),
        };
        self.persist_and_apply(&event, Some(&mut *cal_guard), Some(&mut *acct_guard))
            .await?;

        let refunded_label = if refunded { "true" } else { "false" };
        metrics::counter!(obs::CANCELLATIONS_TOTAL, "refunded" => refunded_label).increment(1);
        info!("booking {booking_id} cancelled by {actor} (refunded: {refunded})");
        cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// SCHEDULED → COMPLETED or NO_SHOW, once the lesson has started.
    pub async fn mark_attendance(
        &self,
        booking_id: Ulid,
        attended: bool,
        actor: Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if let Actor::Student(_) = actor {
            return Err(EngineError::Forbidden("students cannot mark attendance".into()));
        }
        let target = if attended {
            BookingStatus::Completed
        } else {
            BookingStatus::NoShow
        };

        let _gate = self.commit_gate.read().await;
        let mut cal_guard = self.resolve_booking_write(&booking_id).await?;
        let booking = cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        authorize(actor, &booking)?;
        if !booking.is_scheduled() || booking.scheduled_at > now {
            warn!(
                "rejected attendance on booking {booking_id}: {} -> {target}",
                booking.status
            );
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: booking.status,
                to: target,
            });
        }

        let action = if attended {
            AttendanceAction::Attended
        } else {
            AttendanceAction::NoShow
        };
        let event = Event::AttendanceMarked {
            booking_id,
            teacher_id: booking.teacher_id,
            status: target,
            at: now,
            entry: log_entry(booking_id, action, now, actor),
        };
        self.persist_and_apply(&event, Some(&mut *cal_guard), None).await?;
        info!("booking {booking_id} marked {target}");
        cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Status change through the normal guardrails.
    pub async fn update_status(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        actor: Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        match to {
            BookingStatus::Completed => self.mark_attendance(booking_id, true, actor, now).await,
            BookingStatus::NoShow => self.mark_attendance(booking_id, false, actor, now).await,
            BookingStatus::Cancelled => self.cancel_booking(booking_id, actor, now).await,
            BookingStatus::Scheduled => {
                let cal_guard = self.resolve_booking_write(&booking_id).await?;
                let booking = cal_guard
                    .booking(&booking_id)
                    .ok_or(EngineError::NotFound(booking_id))?;
                Err(EngineError::InvalidTransition {
                    booking_id,
                    from: booking.status,
                    to,
                })
            }
        }
    }

    /// Administrative override: any transition, always audited. Credit only
    /// moves when a refunded booking leaves CANCELLED, which debits its
    /// package again. Reviving a booking into SCHEDULED still may not
    /// double-book the teacher.
    pub async fn override_status(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        actor: Actor,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if !matches!(actor, Actor::Admin | Actor::System) {
            return Err(EngineError::Forbidden("status override requires admin".into()));
        }

        let _gate = self.commit_gate.read().await;
        let mut cal_guard = self.resolve_booking_write(&booking_id).await?;
        let booking = cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = booking.status;
        if to == BookingStatus::Scheduled {
            let span = booking.span();
            if let Some(other) = cal_guard
                .scheduled_overlapping(&span)
                .find(|b| b.id != booking_id)
            {
                return Err(EngineError::SlotUnavailable {
                    teacher_id: booking.teacher_id,
                    span,
                    conflict: Some(other.id),
                });
            }
        }

        let redebit = booking.refunded && to != BookingStatus::Cancelled;
        let acct = redebit.then(|| self.account_or_create(booking.student_id));
        let mut acct_guard = match &acct {
            Some(acct) => Some(acct.write().await),
            None => None,
        };
        if let Some(acct_guard) = &acct_guard {
            let has_credit = acct_guard
                .package(&booking.package_id)
                .is_some_and(|p| p.remaining_lessons() > 0);
            if !has_credit {
                metrics::counter!(obs::NO_CREDIT_TOTAL).increment(1);
                return Err(EngineError::NoCredit {
                    student_id: booking.student_id,
                });
            }
        }

        let event = Event::StatusOverridden {
            booking_id,
            teacher_id: booking.teacher_id,
            student_id: booking.student_id,
            package_id: booking.package_id,
            to,
            at: now,
            redebit,
            entry: log_entry(booking_id, AttendanceAction::StatusOverride { from, to }, now, actor),
        };
        self.persist_and_apply(&event, Some(&mut *cal_guard), acct_guard.as_deref_mut())
            .await?;

        metrics::counter!(obs::OVERRIDES_TOTAL).increment(1);
        warn!("booking {booking_id} status overridden by {actor}: {from} -> {to}");
        cal_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Store a provisioned meeting link. Returns false when there was nothing to do
    /// (link already present, or the booking is no longer scheduled).
    pub async fn attach_meeting_link(&self, booking_id: Ulid, link: String) -> Result<bool, EngineError> {
        if link.is_empty() || link.len() > MAX_MEETING_LINK_LEN {
            return Err(EngineError::LimitExceeded("meeting link length"));
        }
        let _gate = self.commit_gate.read().await;
        let mut cal_guard = self.resolve_booking_write(&booking_id).await?;
        let booking = cal_guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.meeting_link.is_some() || !booking.is_scheduled() {
            return Ok(false);
        }
        let event = Event::MeetingLinkAttached {
            booking_id,
            teacher_id: booking.teacher_id,
            link,
        };
        self.persist_and_apply(&event, Some(&mut *cal_guard), None).await?;
        Ok(true)
    }

    pub async fn get_booking(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        let teacher_id = self
            .teacher_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cal = self
            .get_calendar(&teacher_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = cal.read().await;
        guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// A teacher's bookings in start-time order.
    pub async fn bookings_for_teacher(&self, teacher_id: &Ulid) -> Vec<Booking> {
        match self.get_calendar(teacher_id) {
            Some(cal) => cal.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    /// A student's bookings in start-time order.
    pub async fn bookings_for_student(&self, student_id: &Ulid) -> Vec<Booking> {
        let ids = self
            .student_bookings
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(b) = self.get_booking(&id).await {
                bookings.push(b);
            }
        }
        bookings.sort_by_key(|b| (b.scheduled_at, b.id));
        bookings
    }

    /// Confirm the outcome of a reservation whose response was lost.
    pub async fn find_by_idempotency_key(&self, student_id: Ulid, key: &str) -> Option<Booking> {
        let id = self
            .idempotency
            .get(&(student_id, key.to_string()))
            .map(|e| *e.value())?;
        self.get_booking(&id).await.ok()
    }

    pub async fn attendance_log(&self, booking_id: &Ulid) -> Result<Vec<AttendanceLogEntry>, EngineError> {
        let teacher_id = self
            .teacher_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cal = self
            .get_calendar(&teacher_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = cal.read().await;
        Ok(guard.log.get(booking_id).cloned().unwrap_or_default())
    }

    /// SCHEDULED bookings that have not ended and still lack a meeting link.
    pub async fn bookings_missing_links(&self, now: Ms) -> Vec<Booking> {
        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut missing = Vec::new();
        for cal in calendars {
            let guard = cal.read().await;
            missing.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.is_scheduled() && b.meeting_link.is_none() && b.span().end > now)
                    .cloned(),
            );
        }
        missing
    }
}
