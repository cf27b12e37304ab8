//! Lock-protected periodic scheduler
//!
//! Two states, idle and running. A tick runs one cycle only when this process is
//! idle and the filesystem run lock is free; otherwise the tick is dropped, never
//! queued. The in-process flag and the lock file are released on every exit path,
//! including a panicking cycle.

pub mod pipeline;
pub mod run_lock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::SyncResult;
use crate::models::SyncReport;

pub use pipeline::SyncPipeline;
pub use run_lock::{LockAttempt, LockRecord, RunLock, RunLockGuard};

/// One full synchronization pass
#[async_trait]
pub trait SyncCycle: Send + Sync {
    async fn run_cycle(&self) -> SyncResult<SyncReport>;
}

#[derive(Debug)]
pub enum TickOutcome {
    Ran(SyncResult<SyncReport>),
    /// A cycle of this process is still running
    SkippedBusy,
    /// Another live process holds the run lock
    SkippedLocked { owner_pid: u32 },
}

impl TickOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, TickOutcome::Ran(_))
    }
}

/// Snapshot exposed by the status endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cycles_run: u64,
    pub ticks_skipped: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

/// Resets the running flag when dropped
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    cycle: Arc<dyn SyncCycle>,
    lock: RunLock,
    interval: Duration,
    run_on_start: bool,
    running: AtomicBool,
    status: RwLock<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(cycle: Arc<dyn SyncCycle>, lock: RunLock, interval: Duration) -> Self {
        Self {
            cycle,
            lock,
            interval,
            run_on_start: true,
            running: AtomicBool::new(false),
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let mut status = self.status.read().await.clone();
        status.running = self.is_running();
        status
    }

    /// Handle one cadence tick
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Previous cycle still running, tick skipped");
            self.status.write().await.ticks_skipped += 1;
            return TickOutcome::SkippedBusy;
        }
        let _flag = RunningFlag(&self.running);

        let guard = match self.lock.try_acquire() {
            Ok(LockAttempt::Acquired(guard)) => guard,
            Ok(LockAttempt::Held(holder)) => {
                tracing::info!(
                    owner_pid = holder.owner_pid,
                    started_at = %holder.started_at,
                    "Run lock held by another process, tick skipped"
                );
                self.status.write().await.ticks_skipped += 1;
                return TickOutcome::SkippedLocked {
                    owner_pid: holder.owner_pid,
                };
            }
            Err(e) => {
                tracing::error!(error = %e, "Run lock unavailable");
                self.status.write().await.last_error = Some(e.to_string());
                return TickOutcome::Ran(Err(e));
            }
        };

        let started_at = Utc::now();
        self.status.write().await.last_started_at = Some(started_at);

        let result = self.cycle.run_cycle().await;
        drop(guard);

        let mut status = self.status.write().await;
        status.cycles_run += 1;
        status.last_finished_at = Some(Utc::now());
        match &result {
            Ok(report) => {
                status.last_report = Some(report.clone());
                status.last_error = None;
            }
            Err(e) => {
                tracing::error!(error = %e, "Sync cycle failed");
                status.last_error = Some(e.to_string());
            }
        }
        drop(status);

        TickOutcome::Ran(result)
    }

    /// Single cycle for one-shot mode
    pub async fn run_once(&self) -> TickOutcome {
        self.tick().await
    }

    /// Tick on the configured cadence until `cancel` fires
    ///
    /// Cancellation is observed between cycles; a running cycle completes.
    pub async fn run(&self, cancel: CancellationToken) {
        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            run_on_start = self.run_on_start,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
