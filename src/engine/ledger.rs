//! Lesson-credit accounting. `debit` and `credit` are the only mutators of
//! `used_lessons`, and only event application calls them, so credit moves
//! exactly when a booking record commits.

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// The active package that expires soonest, if any.
pub(super) fn select_package(acct: &StudentAccount, now: Ms) -> Option<&LessonPackage> {
    acct.packages
        .iter()
        .filter(|p| p.is_active(now))
        .min_by_key(|p| (p.valid_until, p.id))
}

pub(super) fn debit(acct: &mut StudentAccount, package_id: &Ulid) -> Result<(), EngineError> {
    let student_id = acct.student_id;
    let package = acct
        .package_mut(package_id)
        .ok_or(EngineError::NotFound(*package_id))?;
    if package.used_lessons >= package.total_lessons {
        return Err(EngineError::NoCredit { student_id });
    }
    package.used_lessons += 1;
    Ok(())
}

/// Return one lesson. Never takes `used_lessons` below zero.
pub(super) fn credit(acct: &mut StudentAccount, package_id: &Ulid) -> Result<(), EngineError> {
    let package = acct
        .package_mut(package_id)
        .ok_or(EngineError::NotFound(*package_id))?;
    package.used_lessons = package.used_lessons.saturating_sub(1);
    Ok(())
}

impl Engine {
    /// Record a purchased package for a student.
    pub async fn grant_package(&self, package: LessonPackage) -> Result<(), EngineError> {
        if package.total_lessons == 0 || package.total_lessons > MAX_PACKAGE_LESSONS {
            return Err(EngineError::LimitExceeded("package size out of range"));
        }
        if package.used_lessons > package.total_lessons {
            return Err(EngineError::LimitExceeded("package already overdrawn"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&package.valid_until) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let _gate = self.commit_gate.read().await;
        let acct = self.account_or_create(package.student_id);
        let mut guard = acct.write().await;
        if guard.package(&package.id).is_some() {
            return Err(EngineError::AlreadyExists(package.id));
        }
        if guard.packages.len() >= MAX_PACKAGES_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many packages for student"));
        }
        let (id, student_id, total) = (package.id, package.student_id, package.total_lessons);
        let event = Event::PackageGranted { package };
        self.persist_and_apply(&event, None, Some(&mut *guard)).await?;
        info!("package {id} with {total} lessons granted to student {student_id}");
        Ok(())
    }

    pub async fn get_packages(&self, student_id: &Ulid) -> Vec<LessonPackage> {
        match self.get_account(student_id) {
            Some(acct) => acct.read().await.packages.clone(),
            None => Vec::new(),
        }
    }

    /// Lessons still bookable across all active packages.
    pub async fn credit_balance(&self, student_id: &Ulid, now: Ms) -> u32 {
        let Some(acct) = self.get_account(student_id) else {
            return 0;
        };
        acct.read()
            .await
            .packages
            .iter()
            .filter(|p| p.is_active(now))
            .map(|p| p.remaining_lessons())
            .sum()
    }
}
