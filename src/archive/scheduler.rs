//! Daily archive scheduler.
//!
//! Runs one additive archive pass per day at the configured local time,
//! covering yesterday's articles for every source.

use std::sync::{Arc, Mutex};

use chrono::{FixedOffset, NaiveDate, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ArchiveOutcome, ArchiveService};

/// Long-lived service owning the daily archive job.
pub struct ArchiveScheduler {
    service: Arc<ArchiveService>,
    enabled: bool,
    hour: u32,
    minute: u32,
    offset: FixedOffset,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveScheduler {
    pub fn new(
        service: Arc<ArchiveService>,
        enabled: bool,
        hour: u32,
        minute: u32,
        offset: FixedOffset,
    ) -> Self {
        Self {
            service,
            enabled,
            hour: hour.min(23),
            minute: minute.min(59),
            offset,
            handle: Mutex::new(None),
        }
    }

    /// Start the daily job. Idempotent; a no-op when auto-archive is
    /// disabled.
    pub fn start(&self) {
        if !self.enabled {
            info!("Auto archive is disabled, skipping scheduler start");
            return;
        }
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            warn!("Archive scheduler is already running");
            return;
        }

        let service = self.service.clone();
        let (hour, minute, offset) = (self.hour, self.minute, self.offset);
        *handle = Some(tokio::spawn(async move {
            loop {
                let wait = duration_until(hour, minute, offset);
                tokio::time::sleep(wait).await;

                let yesterday = (Utc::now().with_timezone(&offset) - chrono::Duration::days(1))
                    .date_naive();
                info!(date = %yesterday, "Starting daily archive");
                let outcomes = run_daily_archive(&service, yesterday);
                let total: usize = outcomes.iter().map(|o| o.archived_count).sum();
                info!(total, "Daily archive completed");
            }
        }));
        info!(hour, minute, "Archive scheduler started");
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
            info!("Archive scheduler shutdown");
        }
    }

    /// Manually trigger an archive pass for one source or all, defaulting
    /// to yesterday.
    pub fn run_archive_now(
        &self,
        source: Option<&str>,
        target_date: Option<NaiveDate>,
    ) -> Vec<ArchiveOutcome> {
        let target = target_date.unwrap_or_else(|| {
            (Utc::now().with_timezone(&self.offset) - chrono::Duration::days(1)).date_naive()
        });
        match source {
            Some(source) => match self.service.archive_source(source, None, Some(target)) {
                Ok(outcome) => vec![outcome],
                Err(e) => {
                    warn!(source, error = %e, "Manual archive failed");
                    Vec::new()
                }
            },
            None => run_daily_archive(&self.service, target),
        }
    }
}

impl Drop for ArchiveScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Archive yesterday's rows for every source, isolating failures.
fn run_daily_archive(service: &ArchiveService, target: NaiveDate) -> Vec<ArchiveOutcome> {
    let sources = match service.store().articles().sources() {
        Ok(sources) => sources,
        Err(e) => {
            warn!(error = %e, "Could not enumerate sources");
            return Vec::new();
        }
    };

    let mut outcomes = Vec::new();
    for source in sources {
        match service.archive_source(&source, None, Some(target)) {
            Ok(outcome) => {
                if outcome.archived_count > 0 {
                    info!(
                        source = %outcome.source,
                        archived = outcome.archived_count,
                        "Archived source"
                    );
                }
                outcomes.push(outcome);
            }
            Err(e) => warn!(source = %source, error = %e, "Failed to archive source"),
        }
    }
    outcomes
}

/// Time until the next local occurrence of hh:mm.
fn duration_until(hour: u32, minute: u32, offset: FixedOffset) -> std::time::Duration {
    let now = Utc::now().with_timezone(&offset);
    let today_fire = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_local_timezone(offset)
        .single()
        .unwrap_or_else(|| now.fixed_offset());
    let next_fire = if today_fire > now {
        today_fire
    } else {
        today_fire + chrono::Duration::days(1)
    };
    (next_fire - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fire_is_within_a_day() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let wait = duration_until(1, 0, offset);
        assert!(wait <= std::time::Duration::from_secs(24 * 3600));
    }
}
