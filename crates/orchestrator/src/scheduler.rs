use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::jobs::JobKind;
use crate::orchestrator::Orchestrator;

/// Cron driver: one scheduled job per [`JobKind`], each calling
/// [`Orchestrator::trigger`].
pub struct CycleScheduler {
    orchestrator: Orchestrator,
}

impl CycleScheduler {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Registers every job and runs until Ctrl-C.
    ///
    /// # Errors
    /// Returns an error if a cron expression is invalid or the scheduler
    /// fails to start.
    pub async fn start(self) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        for (kind, state) in self.orchestrator.jobs().snapshot().await {
            let cron = state.schedule.cron.clone();
            let job = Self::job(kind, &cron, self.orchestrator.clone())
                .with_context(|| format!("Invalid cron expression for {kind} job: '{cron}'"))?;
            scheduler.add(job).await?;
            info!(job = %kind, cron = %cron, expected_period_minutes = state.schedule.expected_period_minutes, "Job scheduled");
        }

        scheduler.start().await?;
        info!("Scheduler started");

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown requested");
        scheduler.shutdown().await?;
        Ok(())
    }

    fn job(kind: JobKind, cron: &str, orchestrator: Orchestrator) -> Result<Job> {
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.trigger(kind).await {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!(job = %kind, "Scheduled run suppressed"),
                    Err(e) => error!(job = %kind, error = %e, "Scheduled run failed"),
                }
            })
        })?;
        Ok(job)
    }
}
