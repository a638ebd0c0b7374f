use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, BookingStatus, Event, Ms};

const CHANNEL_CAPACITY: usize = 256;

pub fn teacher_channel(id: Ulid) -> String {
    format!("teacher_{id}")
}

pub fn student_channel(id: Ulid) -> String {
    format!("student_{id}")
}

/// What external delivery (email, push, LISTEN clients) receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeBody {
    BookingCreated { booking_id: Ulid, student_id: Ulid, teacher_id: Ulid, scheduled_at: Ms, duration_minutes: u32 },
    BookingCancelled { booking_id: Ulid, refunded: bool, at: Ms },
    AttendanceMarked { booking_id: Ulid, status: BookingStatus, at: Ms },
    StatusOverridden { booking_id: Ulid, status: BookingStatus, at: Ms },
    MeetingLinkAttached { booking_id: Ulid, link: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub channel: String,
    pub payload: String,
}

/// Fire-and-forget broadcast hub, one channel per teacher and per student.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, channel: &str, payload: String) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(Notice {
                channel: channel.to_string(),
                payload,
            });
        }
    }

    /// Fan a committed event out to the teacher and student it concerns.
    /// `booking` is the post-apply state of the booking the event touched.
    pub fn publish(&self, event: &Event, booking: Option<&Booking>) {
        let Some(booking) = booking else { return };
        let Some(body) = notice_body(event, booking) else { return };
        let payload = match serde_json::to_string(&body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("dropping notice for booking {}: {e}", booking.id);
                return;
            }
        };
        self.send(&teacher_channel(booking.teacher_id), payload.clone());
        self.send(&student_channel(booking.student_id), payload);
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn notice_body(event: &Event, booking: &Booking) -> Option<NoticeBody> {
    match event {
        Event::BookingCreated { .. } => Some(NoticeBody::BookingCreated {
            booking_id: booking.id,
            student_id: booking.student_id,
            teacher_id: booking.teacher_id,
            scheduled_at: booking.scheduled_at,
            duration_minutes: booking.duration_minutes,
        }),
        Event::BookingCancelled { refunded, at, .. } => Some(NoticeBody::BookingCancelled {
            booking_id: booking.id,
            refunded: *refunded,
            at: *at,
        }),
        Event::AttendanceMarked { status, at, .. } => Some(NoticeBody::AttendanceMarked {
            booking_id: booking.id,
            status: *status,
            at: *at,
        }),
        Event::StatusOverridden { to, at, .. } => Some(NoticeBody::StatusOverridden {
            booking_id: booking.id,
            status: *to,
            at: *at,
        }),
        Event::MeetingLinkAttached { link, .. } => Some(NoticeBody::MeetingLinkAttached {
            booking_id: booking.id,
            link: link.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, AttendanceAction, AttendanceLogEntry};

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            student_id: Ulid::new(),
            teacher_id: Ulid::new(),
            topic_id: Ulid::new(),
            package_id: Ulid::new(),
            scheduled_at: 1_000,
            duration_minutes: 60,
            status: BookingStatus::Scheduled,
            cancelled_at: None,
            attended_at: None,
            meeting_link: None,
            idempotency_key: None,
            refunded: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("teacher_x");
        hub.send("teacher_x", "hello".into());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "teacher_x");
        assert_eq!(received.payload, "hello");
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send("student_nobody", "ignored".into());
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_teacher_and_student() {
        let hub = NotifyHub::new();
        let b = booking();
        let mut t = hub.subscribe(&teacher_channel(b.teacher_id));
        let mut s = hub.subscribe(&student_channel(b.student_id));

        let event = Event::BookingCreated {
            booking: b.clone(),
            entry: AttendanceLogEntry {
                booking_id: b.id,
                action: AttendanceAction::Booked,
                timestamp: 0,
                source: Actor::Student(b.student_id),
            },
        };
        hub.publish(&event, Some(&b));

        let tn = t.recv().await.unwrap();
        let sn = s.recv().await.unwrap();
        assert_eq!(tn.payload, sn.payload);
        let json: serde_json::Value = serde_json::from_str(&tn.payload).unwrap();
        assert_eq!(json["kind"], "booking_created");
        assert_eq!(json["booking_id"], b.id.to_string());
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("teacher_gone");
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 0);
    }
}
