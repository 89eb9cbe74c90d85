//! Scheduled renewal sweep.
//!
//! A cron schedule drives periodic passes over the registry; every
//! certificate with `autoRenew` whose remaining validity is below its
//! renewal threshold is renewed. Sweeps are serialized; a trigger landing
//! during a sweep defers one follow-up run instead of overlapping.

use chrono::{DateTime, Utc};
use ck_common::{EngineError, EngineResult};
use ck_lifecycle::{CreateOrRenewOptions, LifecyclePipeline};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cron::CronSchedule;

/// How often the run loop re-evaluates the schedule.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SCHEDULE: &str = "0 3 * * *";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalStatus {
    pub enabled: bool,
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub sweep_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sweep: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

pub struct RenewalScheduler {
    pipeline: Arc<LifecyclePipeline>,
    schedule: std::sync::RwLock<Option<CronSchedule>>,
    enabled: AtomicBool,
    sweep_lock: tokio::sync::Mutex<()>,
    deferred: AtomicBool,
    last_sweep: std::sync::RwLock<Option<DateTime<Utc>>>,
}

impl RenewalScheduler {
    pub fn new(pipeline: Arc<LifecyclePipeline>) -> Self {
        let default = CronSchedule::parse(DEFAULT_SCHEDULE).ok();
        Self {
            pipeline,
            schedule: std::sync::RwLock::new(default),
            enabled: AtomicBool::new(true),
            sweep_lock: tokio::sync::Mutex::new(()),
            deferred: AtomicBool::new(false),
            last_sweep: std::sync::RwLock::new(None),
        }
    }

    /// Validate and install a new schedule.
    pub fn set_schedule(&self, expression: &str) -> EngineResult<()> {
        let parsed = CronSchedule::parse(expression)?;
        info!(schedule = %expression, "renewal schedule updated");
        *self.schedule.write().expect("schedule lock poisoned") = Some(parsed);
        Ok(())
    }

    /// Idempotent enable/disable.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn status(&self) -> RenewalStatus {
        let schedule = self.schedule.read().expect("schedule lock poisoned");
        let enabled = self.enabled.load(Ordering::SeqCst);
        RenewalStatus {
            enabled,
            schedule: schedule.as_ref().map(|s| s.expression().to_string()),
            next_run: if enabled {
                schedule.as_ref().and_then(|s| s.next_after(Utc::now()))
            } else {
                None
            },
            sweep_running: self.sweep_lock.try_lock().is_err(),
            last_sweep: *self.last_sweep.read().expect("last sweep lock poisoned"),
        }
    }

    /// Drive the schedule until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> EngineResult<()> {
        info!("renewal scheduler started");
        let mut last_check = Utc::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }

            let now = Utc::now();
            let due = self.enabled.load(Ordering::SeqCst)
                && self
                    .schedule
                    .read()
                    .expect("schedule lock poisoned")
                    .as_ref()
                    .and_then(|s| s.next_after(last_check))
                    .is_some_and(|next| next <= now);
            last_check = now;

            if due {
                match self.run_sweep(&cancel).await {
                    Ok(report) => info!(
                        checked = report.checked,
                        renewed = report.renewed,
                        failed = report.failed,
                        "renewal sweep finished"
                    ),
                    Err(e) => warn!(error = %e, "renewal sweep did not run"),
                }
            }
        }

        info!("renewal scheduler stopped");
        Ok(())
    }

    /// One sweep over the registry. Serialized: a sweep already in progress
    /// defers this trigger to a single follow-up run.
    pub async fn run_sweep(&self, cancel: &CancellationToken) -> EngineResult<SweepReport> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            self.deferred.store(true, Ordering::SeqCst);
            return Err(EngineError::Conflict("renewal sweep already running".into()));
        };

        let mut report = SweepReport::default();
        loop {
            let due = self.pipeline.registry().due_for_renewal().await;
            report.checked += due.len();

            for cert in due {
                if cancel.is_cancelled() {
                    break;
                }
                info!(
                    name = %cert.name,
                    fingerprint = %cert.fingerprint,
                    days_left = cert.days_until_expiry(),
                    "renewing expiring certificate"
                );
                match self
                    .pipeline
                    .create_or_renew(&cert.fingerprint, CreateOrRenewOptions::default(), cancel)
                    .await
                {
                    Ok(_) => report.renewed += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(name = %cert.name, error = %e, "renewal failed");
                    }
                }
            }

            *self.last_sweep.write().expect("last sweep lock poisoned") = Some(Utc::now());
            // A trigger that landed mid-sweep gets exactly one follow-up.
            if !self.deferred.swap(false, Ordering::SeqCst) || cancel.is_cancelled() {
                break;
            }
        }

        Ok(report)
    }
}
