use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::config::SchedulingConfig;
use crate::engine::Engine;
use crate::janitor;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::provision::MeetingProvisioner;
use crate::scheduling::Scheduler;

/// One isolated scheduler per school. The pgwire database name picks the school.
pub struct SchoolRegistry {
    schools: DashMap<String, Arc<Scheduler>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    scheduling: SchedulingConfig,
    provisioner: Option<Arc<dyn MeetingProvisioner>>,
    link_backfill_interval: Duration,
}

impl SchoolRegistry {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        scheduling: SchedulingConfig,
        provisioner: Option<Arc<dyn MeetingProvisioner>>,
        link_backfill_interval: Duration,
    ) -> Self {
        Self {
            schools: DashMap::new(),
            data_dir,
            compact_threshold,
            scheduling,
            provisioner,
            link_backfill_interval,
        }
    }

    /// Get or lazily open a school: replay its WAL and start its background tasks.
    pub fn get_or_create(&self, school: &str) -> io::Result<Arc<Scheduler>> {
        if let Some(existing) = self.schools.get(school) {
            return Ok(existing.value().clone());
        }
        if school.len() > MAX_SCHOOL_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "school name too long"));
        }
        let safe_name = sanitize(school)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty school name"))?;

        if self.schools.len() >= MAX_SCHOOLS {
            return Err(io::Error::other("too many schools"));
        }

        // The entry lock serializes concurrent first connections to one school.
        let entry = self.schools.entry(school.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.scheduling.clone(),
        )?);
        let scheduler = Arc::new(Scheduler::new(engine.clone(), self.provisioner.clone()));

        tokio::spawn(janitor::run_compactor(engine, self.compact_threshold));
        if self.provisioner.is_some() {
            tokio::spawn(janitor::run_link_backfill(
                scheduler.clone(),
                self.link_backfill_interval,
            ));
        }

        entry.or_insert(scheduler.clone());
        metrics::gauge!(crate::observability::SCHOOLS_ACTIVE).set(self.schools.len() as f64);
        info!("school {school:?} loaded");
        Ok(scheduler)
    }

    pub fn len(&self) -> usize {
        self.schools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schools.is_empty()
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize(school: &str) -> Option<String> {
    let safe: String = school
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!safe.is_empty()).then_some(safe)
}
