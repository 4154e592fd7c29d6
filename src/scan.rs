use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ai::Classifier;
use crate::db::Database;
use crate::email::MailSource;
use crate::models::{ApplicationRecord, Watermark};
use crate::reconcile::{Outcome, Reconciler};

/// A scan fires on login when the last one is older than this.
pub const AUTO_SCAN_WINDOW_HOURS: i64 = 24;

/// A scan claim this old is assumed to belong to a crashed process.
pub const STALE_CLAIM_MINUTES: i64 = 30;

static NEXT_LOCK: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("classifier is not configured: {0}")]
    Configuration(String),

    #[error("could not list candidate emails: {0:#}")]
    Listing(anyhow::Error),

    #[error("a scan is already in progress")]
    AlreadyRunning,

    #[error("could not read stored applications: {0:#}")]
    Store(anyhow::Error),

    #[error("could not save scan results: {0:#}")]
    Commit(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub candidates: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub job_related: usize,
    pub created: usize,
    pub merged: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub records: Vec<ApplicationRecord>,
    pub watermark: Watermark,
    pub report: ScanReport,
}

pub struct Scanner<'a> {
    source: &'a mut dyn MailSource,
    classifier: &'a dyn Classifier,
    reconciler: &'a Reconciler,
    clock: &'a dyn Fn() -> DateTime<Utc>,
}

impl<'a> Scanner<'a> {
    pub fn new(
        source: &'a mut dyn MailSource,
        classifier: &'a dyn Classifier,
        reconciler: &'a Reconciler,
    ) -> Self {
        Self {
            source,
            classifier,
            reconciler,
            clock: &Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: &'a dyn Fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// One pass over the mailbox. Works on a private copy of the collection;
    /// nothing is published until the caller commits the outcome.
    pub fn run(
        &mut self,
        records: Vec<ApplicationRecord>,
        watermark: Watermark,
    ) -> Result<ScanOutcome, ScanError> {
        if !self.classifier.is_configured() {
            return Err(ScanError::Configuration(
                "set classifier_api_key (or JOBTRAIL_API_KEY) first".to_string(),
            ));
        }

        let candidates = self
            .source
            .list_since(watermark)
            .map_err(ScanError::Listing)?;

        let mut report = ScanReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        info!(candidates = candidates.len(), since = watermark.millis(), "scan started");

        let mut records = records;
        for candidate in &candidates {
            let Some(email) = self.source.fetch_details(&candidate.id) else {
                report.fetch_failures += 1;
                continue;
            };
            report.fetched += 1;

            let analysis = self.classifier.analyze(&email.subject, &email.body);
            if analysis.is_job_related {
                report.job_related += 1;
            }

            match self.reconciler.apply(&mut records, &analysis, &email, (self.clock)()) {
                Outcome::Created { id } => {
                    debug!(%id, email = %email.id, "new application");
                    report.created += 1;
                }
                Outcome::Merged {
                    id,
                    status_changed,
                    email_added,
                    contact_added,
                } => {
                    debug!(%id, email = %email.id, status_changed, email_added, contact_added, "application updated");
                    report.merged += 1;
                }
                Outcome::Dropped(reason) => {
                    debug!(id = %email.id, ?reason, "email dropped");
                    report.dropped += 1;
                }
            }
        }

        let watermark = watermark.advance_to((self.clock)());
        info!(
            fetched = report.fetched,
            created = report.created,
            merged = report.merged,
            dropped = report.dropped,
            "scan finished"
        );
        if report.fetch_failures > 0 {
            warn!(failures = report.fetch_failures, "some emails could not be fetched");
        }

        Ok(ScanOutcome {
            records,
            watermark,
            report,
        })
    }
}

/// "Cycle in progress" marker. The flag rejects re-entry on this handle and
/// the claim row in the store rejects scans from other processes.
#[derive(Debug)]
pub struct ScanLock {
    owner: String,
    running: AtomicBool,
    stale_after: Duration,
}

pub struct ScanGuard<'a> {
    lock: &'a ScanLock,
    db: &'a Database,
}

impl ScanLock {
    pub fn new() -> Self {
        Self {
            owner: format!(
                "{}:{}",
                std::process::id(),
                NEXT_LOCK.fetch_add(1, Ordering::Relaxed)
            ),
            running: AtomicBool::new(false),
            stale_after: Duration::minutes(STALE_CLAIM_MINUTES),
        }
    }

    pub fn try_acquire<'a>(
        &'a self,
        db: &'a Database,
        now: DateTime<Utc>,
    ) -> Result<ScanGuard<'a>, ScanError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ScanError::AlreadyRunning)?;

        match db.try_claim_scan(&self.owner, now, self.stale_after) {
            Ok(true) => {
                debug!(owner = %self.owner, "scan claimed");
                Ok(ScanGuard { lock: self, db })
            }
            Ok(false) => {
                self.running.store(false, Ordering::Release);
                Err(ScanError::AlreadyRunning)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(ScanError::Store(e))
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for ScanLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        // A leftover claim expires on its own after STALE_CLAIM_MINUTES.
        if let Err(e) = self.db.release_scan(&self.lock.owner) {
            warn!(owner = %self.lock.owner, error = %e, "could not release scan claim");
        }
        self.lock.running.store(false, Ordering::Release);
    }
}

/// Load, scan, and commit records plus watermark in one transaction.
pub fn sync(
    db: &Database,
    source: &mut dyn MailSource,
    classifier: &dyn Classifier,
    reconciler: &Reconciler,
    lock: &ScanLock,
    clock: &dyn Fn() -> DateTime<Utc>,
) -> Result<ScanReport, ScanError> {
    let _guard = lock.try_acquire(db, clock())?;

    let records = db.load_records().map_err(ScanError::Store)?;
    let watermark = db.load_watermark().map_err(ScanError::Store)?;

    let outcome = Scanner::new(source, classifier, reconciler)
        .with_clock(clock)
        .run(records, watermark)?;

    db.commit_scan(&outcome.records, outcome.watermark)
        .map_err(ScanError::Commit)?;
    Ok(outcome.report)
}

pub fn should_auto_scan(watermark: Watermark, now: DateTime<Utc>) -> bool {
    watermark.is_stale(now, Duration::hours(AUTO_SCAN_WINDOW_HOURS))
}
