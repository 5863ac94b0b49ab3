//! Periodic housekeeping on the `loop_interval` tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::{record_present, record_session_version};
use crate::presence::PresenceChange;
use crate::server::MasterServer;

/// What one pass did.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub purged_jobs: usize,
    pub expired_markers: usize,
    pub rotated_to: Option<u64>,
    pub presence: Option<PresenceChange>,
    pub fileserver_updated: bool,
}

pub struct Maintenance {
    server: MasterServer,
    running: AtomicBool,
    last_fileserver_update: Mutex<Option<Instant>>,
}

/// Clears the in-progress flag however the pass ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Maintenance {
    pub fn new(server: MasterServer) -> Self {
        Self {
            server,
            running: AtomicBool::new(false),
            last_fileserver_update: Mutex::new(None),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.server.config.loop_interval.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.run_once().await.is_none() {
                        debug!("previous maintenance pass still running, skipping");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One pass. `None` when another pass is still in progress.
    pub async fn run_once(&self) -> Option<MaintenanceReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = Running(&self.running);
        let config = &self.server.config;
        let mut report = MaintenanceReport::default();

        match self.server.jobs.clean_old_jobs(config.keep_jobs_seconds).await {
            Ok(n) => report.purged_jobs = n,
            Err(e) => warn!(error = %e, "job purge failed"),
        }

        report.expired_markers = self.server.keys.autosigner().expire_markers().await;

        if config.publish_session > 0
            && self.server.sessions.age() >= Duration::from_secs(config.publish_session)
        {
            let version = self.server.sessions.rotate();
            record_session_version(version);
            report.rotated_to = Some(version);
        }

        if config.presence_events {
            let change = self.server.presence.diff();
            record_present(change.present.len());
            if !change.new.is_empty() {
                info!(minions = ?change.new, "minions appeared");
            }
            if !change.lost.is_empty() {
                info!(minions = ?change.lost, "minions lost");
            }
            report.presence = Some(change);
        }

        if self.fileserver_due() {
            let failed = self.server.fileserver.update().await;
            debug!(failed, "fileserver backends refreshed");
            report.fileserver_updated = true;
        }

        Some(report)
    }

    fn fileserver_due(&self) -> bool {
        let interval = self.server.config.fileserver_update_interval;
        if interval == 0 {
            return false;
        }
        let mut last = self
            .last_fileserver_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let due = last.map_or(true, |at| at.elapsed() >= Duration::from_secs(interval));
        if due {
            *last = Some(Instant::now());
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::common::memory_server;

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let (_dir, server) = memory_server("").await;
        let maintenance = Maintenance::new(server);
        maintenance.running.store(true, Ordering::Release);
        assert!(maintenance.run_once().await.is_none());
        maintenance.running.store(false, Ordering::Release);
        assert!(maintenance.run_once().await.is_some());
        // the guard released the flag
        assert!(!maintenance.running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn fileserver_refresh_follows_its_interval() {
        let (_dir, server) = memory_server("fileserver_update_interval: 3600\n").await;
        let maintenance = Maintenance::new(server);
        assert!(maintenance.run_once().await.unwrap().fileserver_updated);
        assert!(!maintenance.run_once().await.unwrap().fileserver_updated);
    }

    #[tokio::test]
    async fn session_rotates_after_publish_session() {
        let (_dir, server) = memory_server("publish_session: 1\n").await;
        let before = server.sessions.current().version;
        let maintenance = Maintenance::new(server.clone());
        assert!(maintenance.run_once().await.unwrap().rotated_to.is_none());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report.rotated_to, Some(before + 1));
        assert_eq!(server.sessions.current().version, before + 1);
    }
}
