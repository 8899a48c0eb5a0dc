//! The reservation sweep.
//!
//! A handler crash or a lost settle leaves a reservation OPEN and its
//! provisional additions still counted against the key. The sweeper runs on
//! a cron cadence and releases everything older than the sweep deadline,
//! bounding any capacity leak to T_sweep plus one sweep interval. Every node
//! may run one; releases are idempotent, so overlapping sweeps across the
//! cluster are harmless.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use tollgate_core::engine::QuotaEngine;

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Seconds between sweep passes. The cron seconds field caps this at 59.
    pub interval_secs: u32,
    /// Disable only when another process on the cluster runs the sweep.
    pub enabled: bool,
}

/// Owns the scheduler that periodically reclaims stale reservations.
pub struct ReservationSweeper {
    scheduler: JobScheduler,
}

impl ReservationSweeper {
    /// Register the sweep job against the engine and start it. When
    /// disabled, no job is registered and [`Self::shutdown`] is a no-op.
    pub async fn start(
        engine: Arc<QuotaEngine>,
        config: SweepConfig,
    ) -> Result<Self, JobSchedulerError> {
        let scheduler = JobScheduler::new().await?;
        if !config.enabled {
            tracing::info!("reservation sweep disabled");
            return Ok(Self { scheduler });
        }

        let schedule = format!("*/{} * * * * *", config.interval_secs.clamp(1, 59));
        let job = Job::new_async(schedule.as_str(), move |_id, _scheduler| {
            let engine = engine.clone();
            Box::pin(async move {
                match engine.sweep().await {
                    Ok(0) => {}
                    Ok(released) => {
                        tracing::info!(released, "sweep reclaimed stale reservations");
                    }
                    Err(error) => {
                        tracing::warn!(%error, "reservation sweep failed");
                    }
                }
            })
        })?;

        let job_id = scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::info!(schedule = %schedule, job_id = %job_id, "reservation sweep scheduled");

        Ok(Self { scheduler })
    }

    pub async fn shutdown(&mut self) -> Result<(), JobSchedulerError> {
        self.scheduler.shutdown().await?;
        tracing::info!("reservation sweep stopped");
        Ok(())
    }
}
