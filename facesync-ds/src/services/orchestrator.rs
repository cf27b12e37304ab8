//! Device Orchestrator
//!
//! Fans one prepared batch out to every configured device. Each device runs as its
//! own tokio task under an independent time budget, so a slow, hung or panicking
//! device only fails itself. Results come back in device order.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::error::SyncError;
use crate::models::{BatchOutcome, DeviceResult, DeviceStats, PreparedIdentity};
use crate::services::device_client::{DeviceApiFactory, DeviceTarget};
use crate::services::reconciler::{ReconcileOptions, Reconciler};
use crate::services::registry::DeviceRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Time budget of one device's whole reconciliation
    pub device_timeout: Duration,
    /// Devices reconciled at once; 0 means no limit
    pub max_parallel_devices: usize,
    pub reconcile: ReconcileOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(900),
            max_parallel_devices: 0,
            reconcile: ReconcileOptions::default(),
        }
    }
}

pub struct DeviceOrchestrator {
    registry: Arc<DeviceRegistry>,
    factory: Arc<dyn DeviceApiFactory>,
    options: OrchestratorOptions,
    permits: Option<Arc<Semaphore>>,
}

impl DeviceOrchestrator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        factory: Arc<dyn DeviceApiFactory>,
        options: OrchestratorOptions,
    ) -> Self {
        let permits = (options.max_parallel_devices > 0)
            .then(|| Arc::new(Semaphore::new(options.max_parallel_devices)));
        Self {
            registry,
            factory,
            options,
            permits,
        }
    }

    /// Reconcile `batch` on every device
    ///
    /// Never fails as a whole: per-device failures, timeouts and panics become
    /// failed `DeviceResult`s.
    pub async fn run_batch(
        &self,
        devices: &[DeviceTarget],
        batch: Arc<Vec<PreparedIdentity>>,
        roster_invites: Arc<HashSet<String>>,
    ) -> BatchOutcome {
        let batch_start = Instant::now();
        tracing::info!(
            devices = devices.len(),
            identities = batch.len(),
            "Starting device batch"
        );

        let handles: Vec<_> = devices
            .iter()
            .map(|target| {
                let target = target.clone();
                let registry = Arc::clone(&self.registry);
                let factory = Arc::clone(&self.factory);
                let permits = self.permits.clone();
                let batch = Arc::clone(&batch);
                let roster_invites = Arc::clone(&roster_invites);
                let timeout = self.options.device_timeout;
                let reconcile = self.options.reconcile;

                tokio::spawn(async move {
                    // Semaphore is never closed, so acquisition only waits
                    let _permit = match permits {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };

                    let started = Instant::now();
                    let work = async {
                        let api = factory
                            .connect(&target)
                            .map_err(|e| SyncError::device(&target.address, e))?;
                        Reconciler::new(api, registry, reconcile)
                            .reconcile(&batch, &roster_invites)
                            .await
                    };

                    let result = match tokio::time::timeout(timeout, work).await {
                        Ok(result) => result,
                        Err(_) => Err(SyncError::DeviceTimeout {
                            device: target.address.clone(),
                            seconds: timeout.as_secs(),
                        }),
                    };
                    device_result(&target, result, started.elapsed())
                })
            })
            .collect();

        let joined = join_all(handles).await;
        let results: Vec<DeviceResult> = joined
            .into_iter()
            .zip(devices)
            .map(|(joined, target)| match joined {
                Ok(result) => result,
                Err(e) => {
                    let reason = if e.is_panic() {
                        "worker panicked".to_string()
                    } else {
                        e.to_string()
                    };
                    let err = SyncError::DeviceWorker {
                        device: target.address.clone(),
                        reason,
                    };
                    device_result(target, Err(err), batch_start.elapsed())
                }
            })
            .collect();

        let outcome = BatchOutcome { results };
        tracing::info!(
            succeeded = outcome.devices_succeeded(),
            failed = outcome.devices_failed(),
            elapsed_ms = batch_start.elapsed().as_millis() as u64,
            "Device batch complete"
        );
        outcome
    }
}

fn device_result(
    target: &DeviceTarget,
    result: Result<DeviceStats, SyncError>,
    elapsed: Duration,
) -> DeviceResult {
    let duration_ms = elapsed.as_millis() as u64;
    match result {
        Ok(stats) => {
            // Reaching the commit is not enough: failed chunks, refused deletes and
            // unconfirmed identities all leave the device behind the roster
            let success = stats.is_clean();
            let error = (!success).then(|| stats.problem_summary());
            if let Some(problem) = &error {
                tracing::warn!(device = %target.label(), problem = %problem, "Device reconciled with errors");
            }
            DeviceResult {
                device: target.address.clone(),
                success,
                error,
                stats,
                duration_ms,
            }
        }
        Err(e) => {
            tracing::error!(device = %target.label(), error = %e, "Device reconciliation failed");
            DeviceResult {
                device: target.address.clone(),
                success: false,
                error: Some(e.to_string()),
                stats: DeviceStats::default(),
                duration_ms,
            }
        }
    }
}
