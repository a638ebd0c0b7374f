mod availability;
mod bookings;
mod conflict;
mod error;
pub mod interval;
mod ledger;
mod slots;
#[cfg(test)]
mod tests;

pub use availability::validate_rules;
pub use bookings::NewBooking;
pub use conflict::now_ms;
pub use error::{EngineError, RuleViolation};
pub use slots::{SlotPlan, Slots, plan_slots};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::SchedulingConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<TeacherCalendar>>;
pub type SharedAccount = Arc<RwLock<StudentAccount>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Write the batch with a single fsync, or not at all.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All-or-nothing: on error no event of the batch is left in the log, so
/// replay never resurrects a change whose caller was told it failed.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Event application ────────────────────────────────────

/// Apply an event to a teacher calendar (caller holds the lock).
fn apply_to_calendar(cal: &mut TeacherCalendar, event: &Event) {
    match event {
        Event::AvailabilityReplaced { rules, .. } => {
            cal.rules = rules.clone();
        }
        Event::AvailabilityCleared { .. } => {
            cal.rules.clear();
        }
        Event::BookingCreated { booking, entry } => {
            cal.insert_booking(booking.clone());
            cal.append_log(entry.clone());
        }
        Event::BookingRestored { booking, log } => {
            cal.insert_booking(booking.clone());
            for entry in log {
                cal.append_log(entry.clone());
            }
        }
        Event::BookingCancelled { booking_id, at, refunded, entry, .. } => {
            if let Some(b) = cal.booking_mut(booking_id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*at);
                b.refunded = *refunded;
            }
            cal.append_log(entry.clone());
        }
        Event::AttendanceMarked { booking_id, status, at, entry, .. } => {
            if let Some(b) = cal.booking_mut(booking_id) {
                b.status = *status;
                b.attended_at = Some(*at);
            }
            cal.append_log(entry.clone());
        }
        Event::StatusOverridden { booking_id, to, at, redebit, entry, .. } => {
            if let Some(b) = cal.booking_mut(booking_id) {
                b.status = *to;
                if *redebit {
                    b.refunded = false;
                }
                match to {
                    BookingStatus::Cancelled => b.cancelled_at = b.cancelled_at.or(Some(*at)),
                    BookingStatus::Completed | BookingStatus::NoShow => b.attended_at = Some(*at),
                    BookingStatus::Scheduled => {}
                }
            }
            cal.append_log(entry.clone());
        }
        Event::MeetingLinkAttached { booking_id, link, .. } => {
            if let Some(b) = cal.booking_mut(booking_id) {
                b.meeting_link = Some(link.clone());
            }
        }
        Event::PackageGranted { .. } => {}
    }
}

/// Apply an event to a student account (caller holds the lock).
/// Ledger effects were validated before the event was written, so a failure
/// here only happens when replaying a log written by an inconsistent build.
fn apply_to_account(acct: &mut StudentAccount, event: &Event) {
    let result = match event {
        Event::PackageGranted { package } => {
            acct.packages.retain(|p| p.id != package.id);
            acct.packages.push(package.clone());
            Ok(())
        }
        Event::BookingCreated { booking, .. } => ledger::debit(acct, &booking.package_id),
        Event::BookingCancelled { package_id, refunded: true, .. } => ledger::credit(acct, package_id),
        Event::StatusOverridden { package_id, redebit: true, .. } => ledger::debit(acct, package_id),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("ledger effect skipped for student {}: {e}", acct.student_id);
    }
}

pub struct Engine {
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) accounts: DashMap<Ulid, SharedAccount>,
    /// Reverse lookup: booking id → teacher id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    /// Student id → their booking ids, in creation order.
    pub(super) student_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// (student id, client key) → booking id
    pub(super) idempotency: DashMap<(Ulid, String), Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot and the WAL swap see no half-committed change.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub config: SchedulingConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: SchedulingConfig,
    ) -> io::Result<Self> {
        let replay = Wal::replay::<Event>(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                "discarding {} trailing bytes of {}",
                replay.discarded_bytes,
                wal_path.display()
            );
        }
        let wal = Wal::open_truncated(&wal_path, replay.valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            calendars: DashMap::new(),
            accounts: DashMap::new(),
            booking_index: DashMap::new(),
            student_bookings: DashMap::new(),
            idempotency: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            config,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never block here: this may run inside an async
        // context (lazy school creation).
        for event in &replay.records {
            if let Some(teacher_id) = event.teacher_id() {
                let cal = engine.calendar_or_create(teacher_id);
                let Ok(mut guard) = cal.try_write() else {
                    return Err(io::Error::other("replay: calendar lock contended"));
                };
                apply_to_calendar(&mut guard, event);
            }
            if let Some(student_id) = event.student_id() {
                let acct = engine.account_or_create(student_id);
                let Ok(mut guard) = acct.try_write() else {
                    return Err(io::Error::other("replay: account lock contended"));
                };
                apply_to_account(&mut guard, event);
            }
            engine.index_event(event);
        }
        if !replay.records.is_empty() {
            info!(
                "replayed {} events ({} teachers, {} students)",
                replay.records.len(),
                engine.calendars.len(),
                engine.accounts.len()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn index_event(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => {
                self.booking_index.insert(booking.id, booking.teacher_id);
                self.student_bookings
                    .entry(booking.student_id)
                    .or_default()
                    .push(booking.id);
                if let Some(key) = &booking.idempotency_key {
                    self.idempotency
                        .insert((booking.student_id, key.clone()), booking.id);
                }
            }
            _ => {}
        }
    }

    /// WAL-append, apply to every aggregate the event touches, index, notify.
    /// The caller holds the commit gate and the write locks passed in.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        cal: Option<&mut TeacherCalendar>,
        acct: Option<&mut StudentAccount>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let mut touched = None;
        if let Some(cal) = cal {
            apply_to_calendar(cal, event);
            touched = booking_id_of(event).and_then(|id| cal.booking(&id).cloned());
        }
        if let Some(acct) = acct {
            apply_to_account(acct, event);
        }
        self.index_event(event);
        self.notify.publish(event, touched.as_ref());
        Ok(())
    }

    pub fn get_calendar(&self, teacher_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(teacher_id).map(|e| e.value().clone())
    }

    pub(super) fn calendar_or_create(&self, teacher_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(teacher_id)
            .or_insert_with(|| Arc::new(RwLock::new(TeacherCalendar::new(teacher_id))))
            .value()
            .clone()
    }

    pub fn get_account(&self, student_id: &Ulid) -> Option<SharedAccount> {
        self.accounts.get(student_id).map(|e| e.value().clone())
    }

    pub(super) fn account_or_create(&self, student_id: Ulid) -> SharedAccount {
        self.accounts
            .entry(student_id)
            .or_insert_with(|| Arc::new(RwLock::new(StudentAccount::new(student_id))))
            .value()
            .clone()
    }

    pub fn teacher_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Lookup booking → teacher, acquire that calendar's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TeacherCalendar>, EngineError> {
        let teacher_id = self
            .teacher_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cal = self
            .get_calendar(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        Ok(cal.write_owned().await)
    }

    /// Rewrite the WAL as a snapshot of current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let accounts: Vec<SharedAccount> = self.accounts.iter().map(|e| e.value().clone()).collect();
        for acct in accounts {
            let guard = acct.read().await;
            for package in &guard.packages {
                events.push(Event::PackageGranted { package: package.clone() });
            }
        }

        let calendars: Vec<SharedCalendar> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for cal in calendars {
            let guard = cal.read().await;
            if !guard.rules.is_empty() {
                events.push(Event::AvailabilityReplaced {
                    teacher_id: guard.teacher_id,
                    rules: guard.rules.clone(),
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingRestored {
                    booking: booking.clone(),
                    log: guard.log.get(&booking.id).cloned().unwrap_or_default(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn booking_id_of(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => Some(booking.id),
        Event::BookingCancelled { booking_id, .. }
        | Event::AttendanceMarked { booking_id, .. }
        | Event::StatusOverridden { booking_id, .. }
        | Event::MeetingLinkAttached { booking_id, .. } => Some(*booking_id),
        _ => None,
    }
}
