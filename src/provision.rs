//! Meeting-link provisioning seam. Provisioning is best-effort: a booking is
//! valid without a link, and a link can be attached later.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Booking;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider returned an unusable link: {0}")]
    InvalidLink(String),
}

#[async_trait]
pub trait MeetingProvisioner: Send + Sync {
    async fn provision(&self, booking: &Booking) -> Result<String, ProvisionError>;
}

/// Derives a stable room URL from the booking id under a fixed base.
pub struct UrlTemplateProvisioner {
    base: String,
}

impl UrlTemplateProvisioner {
    pub fn new(base: &str) -> Result<Self, ProvisionError> {
        let base = base.trim().trim_end_matches('/');
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(ProvisionError::InvalidLink(base.to_string()));
        }
        Ok(Self { base: base.to_string() })
    }
}

#[async_trait]
impl MeetingProvisioner for UrlTemplateProvisioner {
    async fn provision(&self, booking: &Booking) -> Result<String, ProvisionError> {
        Ok(format!("{}/{}", self.base, booking.id.to_string().to_lowercase()))
    }
}
