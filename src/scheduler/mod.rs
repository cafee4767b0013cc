//! Scheduled execution of the detection pipeline.
//!
//! Daemon mode drives four jobs from cron triggers in the configured
//! timezone; test mode runs the same jobs on short intervals for CI; once
//! mode runs reconcile + report and exits. Each job id runs in its own task
//! loop, so a job never overlaps itself; distinct jobs may run in parallel.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::alerting::{AlertConfig, AlertManager};
use crate::config::Config;
use crate::detection::{Reconciler, ReconcilerSettings};
use crate::fetcher::{BookFetcher, CancelToken};
use crate::reports::ReportGenerator;
use crate::store::{ChangeFilter, Store};

/// How the scheduler process was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Daemon,
    TestInterval,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Reconcile,
    DailyReport,
    ReportCleanup,
    FingerprintCleanup,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Reconcile => "change_detection",
            Job::DailyReport => "daily_report",
            Job::ReportCleanup => "report_cleanup",
            Job::FingerprintCleanup => "fingerprint_cleanup",
        }
    }

    /// Interval cadence in test mode.
    fn test_interval(&self) -> Duration {
        match self {
            Job::Reconcile => Duration::from_secs(2 * 60),
            Job::DailyReport => Duration::from_secs(4 * 60),
            Job::ReportCleanup => Duration::from_secs(10 * 60),
            Job::FingerprintCleanup => Duration::from_secs(15 * 60),
        }
    }
}

/// Six-field cron expression for a daily trigger at (hour, minute).
fn daily_cron_expr(hour: u32, minute: u32) -> String {
    format!("0 {minute} {hour} * * *")
}

/// Report generation trails reconciliation by five minutes, carrying into
/// the next hour when needed.
pub fn report_schedule(hour: u32, minute: u32) -> (u32, u32) {
    let minute = minute + 5;
    if minute >= 60 {
        ((hour + 1) % 24, minute - 60)
    } else {
        (hour, minute)
    }
}

pub struct SchedulerService {
    config: Config,
    store: Store,
    reconciler: Reconciler,
    reports: ReportGenerator,
    alerts: AlertManager,
    cancel: CancelToken,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerService {
    pub fn new(config: Config, store: Store) -> anyhow::Result<Arc<Self>> {
        let cancel = CancelToken::new();
        let fetcher = Arc::new(BookFetcher::new(&config, cancel.clone())?);
        let reconciler = Reconciler::new(
            store.clone(),
            fetcher.clone(),
            ReconcilerSettings::from_config(&config),
            cancel.clone(),
        );
        let reports = ReportGenerator::new(store.clone(), config.reports_dir.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            reconciler,
            reports,
            alerts: AlertManager::new(AlertConfig::default()),
            cancel,
            shutdown_tx,
        }))
    }

    /// Ask all job loops to stop after their current iteration. The cancel
    /// token additionally tells an in-flight reconciliation to wind down.
    pub fn shutdown(&self) {
        info!("scheduler shutting down");
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
    }

    /// Run until shutdown (daemon/test) or to completion (once).
    pub async fn run(self: Arc<Self>, mode: SchedulerMode) -> anyhow::Result<()> {
        match mode {
            SchedulerMode::Once => {
                self.run_once().await;
                Ok(())
            }
            SchedulerMode::Daemon => {
                info!(
                    hour = self.config.schedule_hour,
                    minute = self.config.schedule_minute,
                    timezone = %self.config.timezone,
                    "scheduler started (daemon mode)"
                );
                self.spawn_jobs(mode).await
            }
            SchedulerMode::TestInterval => {
                info!("scheduler started (test-interval mode)");
                self.spawn_jobs(mode).await
            }
        }
    }

    async fn spawn_jobs(self: Arc<Self>, mode: SchedulerMode) -> anyhow::Result<()> {
        let tz = self.config.tz();
        let (report_hour, report_minute) =
            report_schedule(self.config.schedule_hour, self.config.schedule_minute);

        let mut jobs: Vec<(Job, String)> = Vec::new();
        if self.config.enable_change_detection {
            jobs.push((
                Job::Reconcile,
                daily_cron_expr(self.config.schedule_hour, self.config.schedule_minute),
            ));
        }
        if self.config.generate_daily_reports {
            jobs.push((Job::DailyReport, daily_cron_expr(report_hour, report_minute)));
        }
        jobs.push((Job::ReportCleanup, daily_cron_expr(1, 0)));
        jobs.push((Job::FingerprintCleanup, daily_cron_expr(1, 30)));

        let mut handles = Vec::new();
        for (job, expr) in jobs {
            let service = Arc::clone(&self);
            let handle = match mode {
                SchedulerMode::TestInterval => tokio::spawn(async move {
                    service.interval_loop(job).await;
                }),
                _ => {
                    let schedule = cron::Schedule::from_str(&expr)
                        .map_err(|e| anyhow::anyhow!("bad cron expression {expr}: {e}"))?;
                    tokio::spawn(async move {
                        service.cron_loop(job, schedule, tz).await;
                    })
                }
            };
            handles.push(handle);
        }

        // Wait for all loops; they exit when shutdown() fires.
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "job task panicked");
            }
        }
        Ok(())
    }

    async fn cron_loop(&self, job: Job, schedule: cron::Schedule, tz: Tz) {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(job = job.name(), "job scheduled");
        loop {
            let Some(next) = schedule.upcoming(tz).next() else {
                warn!(job = job.name(), "schedule yields no future fire time");
                return;
            };
            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(wait) => {
                    self.execute(job).await;
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn interval_loop(&self, job: Job) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = interval(job.test_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; skip that initial tick.
        ticker.tick().await;
        info!(job = job.name(), period_secs = job.test_interval().as_secs(), "job scheduled");
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    self.execute(job).await;
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn run_once(&self) {
        let total = self.store.count_books().unwrap_or(0);
        info!(books = total, "running change detection once");

        let run = self.reconciler.reconcile(None, false).await;
        if run.success {
            info!(
                changes = run.changes_detected,
                updated = run.updated_books,
                duration_secs = run.detection_duration_seconds,
                "change detection completed"
            );
        } else {
            error!(errors = run.errors.len(), "change detection finished with errors");
        }

        if run.changes_detected > 0 {
            self.alert_recent_changes();
        }

        if self.config.generate_daily_reports {
            match self
                .reports
                .generate_daily_report(None, self.config.report_format)
            {
                Ok(report) => self.alerts.send_daily_summary(&report),
                Err(e) => error!(error = %e, "daily report failed"),
            }
        }
        info!("run-once mode completed");
    }

    async fn execute(&self, job: Job) {
        let started = std::time::Instant::now();
        info!(job = job.name(), "job starting");

        match job {
            Job::Reconcile => {
                let run = self.reconciler.reconcile(None, true).await;
                if run.changes_detected > 0 {
                    self.alert_recent_changes();
                }
                info!(
                    job = job.name(),
                    success = run.success,
                    changes = run.changes_detected,
                    duration_secs = started.elapsed().as_secs_f64(),
                    "job completed"
                );
            }
            Job::DailyReport => match self
                .reports
                .generate_daily_report(None, self.config.report_format)
            {
                Ok(report) => {
                    self.alerts.send_daily_summary(&report);
                    info!(
                        job = job.name(),
                        report_id = %report.report_id,
                        duration_secs = started.elapsed().as_secs_f64(),
                        "job completed"
                    );
                }
                Err(e) => error!(job = job.name(), error = %e, "job failed"),
            },
            Job::ReportCleanup => {
                match self
                    .reports
                    .cleanup_old_reports(self.config.report_retention_days)
                {
                    Ok(deleted) => info!(job = job.name(), deleted, "job completed"),
                    Err(e) => error!(job = job.name(), error = %e, "job failed"),
                }
            }
            Job::FingerprintCleanup => match self.reconciler.cleanup_orphan_fingerprints() {
                Ok(removed) => info!(job = job.name(), removed, "job completed"),
                Err(e) => error!(job = job.name(), error = %e, "job failed"),
            },
        }
    }

    /// Feed the last hour of change records to the alert channel.
    fn alert_recent_changes(&self) {
        let filter = ChangeFilter {
            since: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        match self.store.changes_filtered(&filter, None) {
            Ok(changes) => {
                self.alerts.process_changes(&changes);
            }
            Err(e) => warn!(error = %e, "failed to load recent changes for alerting"),
        }
    }
}
