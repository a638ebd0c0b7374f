//! The one seam callers use. Reads go straight to the engine; every mutation
//! runs on its own task under the persistence deadline, so a caller that gives
//! up never leaves a half-applied change behind.

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::SchedulingConfig;
use crate::engine::{Engine, EngineError, NewBooking, SlotPlan, now_ms};
use crate::model::*;
use crate::observability as obs;
use crate::provision::MeetingProvisioner;

pub struct Scheduler {
    engine: Arc<Engine>,
    provisioner: Option<Arc<dyn MeetingProvisioner>>,
    config: SchedulingConfig,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, provisioner: Option<Arc<dyn MeetingProvisioner>>) -> Self {
        let config = engine.config.clone();
        Self {
            engine,
            provisioner,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run a mutation to completion on a separate task and wait at most the
    /// persistence timeout for it. On expiry the task keeps going; the caller
    /// only learns that the outcome is unknown.
    async fn commit<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(f(self.engine.clone()));
        match tokio::time::timeout(self.config.persistence_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::WalError(format!("{op} task failed: {e}"))),
            Err(_) => {
                metrics::counter!(obs::PERSISTENCE_TIMEOUTS_TOTAL, "op" => op).increment(1);
                warn!("{op} exceeded {:?}; outcome unknown", self.config.persistence_timeout);
                Err(EngineError::Timeout(op))
            }
        }
    }

    // ── Slots and reservations ────────────────────────────────

    pub async fn list_bookable_slots(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        step_minutes: Option<u32>,
    ) -> Result<SlotPlan, EngineError> {
        self.engine
            .generate_slots(teacher_id, date, duration_minutes, step_minutes, now_ms())
            .await
    }

    /// Book on the student's own behalf, then try to provision a meeting link.
    /// The booking stands whether or not provisioning succeeds.
    pub async fn reserve(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let actor = Actor::Student(req.student_id);
        let booking = self
            .commit("reserve", move |engine| async move {
                engine.create_booking(req, actor, now_ms()).await
            })
            .await?;
        if booking.meeting_link.is_some() || !booking.is_scheduled() {
            return Ok(booking);
        }
        let linked = self.provision_link(&booking).await;
        Ok(linked.unwrap_or(booking))
    }

    pub async fn release(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        self.commit("release", move |engine| async move {
            engine.cancel_booking(booking_id, actor, now_ms()).await
        })
        .await
    }

    pub async fn set_status(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        self.commit("update_status", move |engine| async move {
            engine.update_status(booking_id, status, actor, now_ms()).await
        })
        .await
    }

    pub async fn override_status(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        self.commit("override_status", move |engine| async move {
            engine.override_status(booking_id, status, actor, now_ms()).await
        })
        .await
    }

    /// Ask the provider for a link and store it. `None` when no provider is
    /// configured, the call fails or times out, or the booking moved on meanwhile.
    pub async fn provision_link(&self, booking: &Booking) -> Option<Booking> {
        let provisioner = self.provisioner.as_ref()?;
        let link = match tokio::time::timeout(
            self.config.provisioning_timeout,
            provisioner.provision(booking),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                metrics::counter!(obs::PROVISIONING_FAILURES_TOTAL).increment(1);
                warn!("meeting link for booking {} not provisioned: {e}", booking.id);
                return None;
            }
            Err(_) => {
                metrics::counter!(obs::PROVISIONING_FAILURES_TOTAL).increment(1);
                warn!("meeting link for booking {} timed out", booking.id);
                return None;
            }
        };

        let booking_id = booking.id;
        match self
            .commit("attach_meeting_link", move |engine| async move {
                engine.attach_meeting_link(booking_id, link).await?;
                engine.get_booking(&booking_id).await
            })
            .await
        {
            Ok(updated) => {
                info!("meeting link attached to booking {booking_id}");
                Some(updated)
            }
            Err(e) => {
                warn!("meeting link for booking {booking_id} not stored: {e}");
                None
            }
        }
    }

    /// Retry provisioning for every upcoming booking still missing a link.
    /// Returns how many links were attached.
    pub async fn backfill_links(&self) -> usize {
        if self.provisioner.is_none() {
            return 0;
        }
        let mut attached = 0;
        for booking in self.engine.bookings_missing_links(now_ms()).await {
            if let Some(updated) = self.provision_link(&booking).await
                && updated.meeting_link.is_some()
            {
                attached += 1;
            }
        }
        attached
    }

    // ── Availability and packages ─────────────────────────────

    pub async fn replace_availability(
        &self,
        teacher_id: Ulid,
        rules: Vec<AvailabilityRule>,
    ) -> Result<(), EngineError> {
        self.commit("replace_availability", move |engine| async move {
            engine.replace_availability(teacher_id, rules).await
        })
        .await
    }

    pub async fn clear_availability(&self, teacher_id: Ulid) -> Result<(), EngineError> {
        self.commit("clear_availability", move |engine| async move {
            engine.clear_availability(teacher_id).await
        })
        .await
    }

    pub async fn grant_package(&self, package: LessonPackage) -> Result<(), EngineError> {
        self.commit("grant_package", move |engine| async move {
            engine.grant_package(package).await
        })
        .await
    }

    // ── Reads ─────────────────────────────────────────────────

    pub async fn availability(&self, teacher_id: &Ulid, day_of_week: Option<u8>) -> Vec<AvailabilityRule> {
        match day_of_week {
            Some(day) => self.engine.get_active_rules(teacher_id, day).await,
            None => self.engine.get_rules(teacher_id).await,
        }
    }

    pub async fn booking(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        self.engine.get_booking(booking_id).await
    }

    /// Re-read after a timed-out reservation.
    pub async fn booking_by_key(&self, student_id: Ulid, key: &str) -> Option<Booking> {
        self.engine.find_by_idempotency_key(student_id, key).await
    }

    pub async fn bookings_for_student(&self, student_id: &Ulid) -> Vec<Booking> {
        self.engine.bookings_for_student(student_id).await
    }

    pub async fn bookings_for_teacher(&self, teacher_id: &Ulid) -> Vec<Booking> {
        self.engine.bookings_for_teacher(teacher_id).await
    }

    pub async fn packages(&self, student_id: &Ulid) -> Vec<LessonPackage> {
        self.engine.get_packages(student_id).await
    }

    pub async fn attendance_log(&self, booking_id: &Ulid) -> Result<Vec<AttendanceLogEntry>, EngineError> {
        self.engine.attendance_log(booking_id).await
    }
}
