//! Long-running job coordinators.
//!
//! Migration and block jobs live inside QEMU; their state is reconstructed
//! by polling (`query-migrate`, `query-block-jobs`) every
//! `job_poll_interval_ms` until a terminal state shows up.

use serde_json::json;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{QmpError, Result};
use crate::monitor::Monitor;
use crate::types::{BlockJobInfo, JobState, MigrationInfo, MIGRATION_COMPLETED};

/// Job name used in errors about the outgoing migration stream.
const OUTGOING_MIGRATION: &str = "migration";

/// Job name used in errors about the incoming migration stream.
const INCOMING_MIGRATION: &str = "incoming migration";

impl Monitor {
    // =========================================================================
    // Migration
    // =========================================================================

    pub async fn migrate_set_capabilities(&self, capabilities: &HashMap<String, bool>) -> Result<()> {
        let capabilities: Vec<_> = capabilities
            .iter()
            .map(|(capability, state)| json!({ "capability": capability, "state": state }))
            .collect();

        self.run_unit(
            "migrate-set-capabilities",
            Some(json!({ "capabilities": capabilities })),
        )
        .await
    }

    /// Start sending the migration stream to `uri` without waiting.
    pub async fn migrate_start(&self, uri: &str) -> Result<()> {
        info!(socket = %self.socket_path().display(), uri, "Starting migration");
        self.run_unit("migrate", Some(json!({ "uri": uri }))).await
    }

    /// Migrate to `uri` and wait for the stream to complete.
    ///
    /// A failed migration is not retried.
    pub async fn migrate(&self, uri: &str) -> Result<()> {
        self.migrate_start(uri).await?;
        self.migrate_wait(MIGRATION_COMPLETED).await
    }

    /// Poll until the migration reaches `state` (e.g. `pre-switchover`).
    pub async fn migrate_wait(&self, state: &str) -> Result<()> {
        loop {
            let info = self.query_migrate().await?;
            if let JobState::Failed(reason) = JobState::from(&info) {
                return Err(QmpError::JobFailed {
                    job: OUTGOING_MIGRATION.to_string(),
                    reason,
                });
            }

            if info.status.as_deref() == Some(state) {
                return Ok(());
            }

            tokio::time::sleep(self.config().job_poll_interval()).await;
        }
    }

    /// Resume a migration paused in `from_state`.
    pub async fn migrate_continue(&self, from_state: &str) -> Result<()> {
        self.run_unit("migrate-continue", Some(json!({ "state": from_state })))
            .await
    }

    /// Receive a migration stream on `uri` and wait until it is done.
    ///
    /// The job state is checked before `cancel` on every round, so a stream
    /// that completed just as the caller gave up is still reported as a
    /// success.
    pub async fn migrate_incoming(&self, cancel: &CancellationToken, uri: &str) -> Result<()> {
        info!(socket = %self.socket_path().display(), uri, "Waiting for incoming migration");
        self.run_unit("migrate-incoming", Some(json!({ "uri": uri })))
            .await?;

        loop {
            let info = self.query_migrate().await?;
            match JobState::from(&info) {
                JobState::Completed => {
                    info!(socket = %self.socket_path().display(), "Incoming migration completed");
                    return Ok(());
                }
                JobState::Failed(reason) => {
                    return Err(QmpError::JobFailed {
                        job: INCOMING_MIGRATION.to_string(),
                        reason,
                    });
                }
                JobState::Ready | JobState::Running(_) => {}
            }

            if cancel.is_cancelled() {
                debug!(socket = %self.socket_path().display(), "Incoming migration wait cancelled");
                return Err(QmpError::Cancelled);
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config().job_poll_interval()) => {}
            }
        }
    }

    async fn query_migrate(&self) -> Result<MigrationInfo> {
        self.run("query-migrate", None).await
    }

    // =========================================================================
    // Block jobs
    // =========================================================================

    /// Commit the top image of `node_name` into its backing file.
    pub async fn block_commit(&self, node_name: &str) -> Result<()> {
        let arguments = json!({ "device": node_name, "job-id": node_name });
        self.run_unit("block-commit", Some(arguments)).await?;

        self.block_job_wait_ready(node_name).await?;
        self.block_job_complete(node_name).await
    }

    /// Mirror `node_name` onto `target` and wait until both are in sync.
    ///
    /// Writes to the source are replicated synchronously to the target so
    /// the two converge. The caller completes or cancels the job afterwards.
    pub async fn blockdev_mirror(&self, node_name: &str, target: &str) -> Result<()> {
        let arguments = json!({
            "device": node_name,
            "target": target,
            "sync": "top",
            "job-id": node_name,
            "copy-mode": "write-blocking",
        });
        self.run_unit("blockdev-mirror", Some(arguments)).await?;

        self.block_job_wait_ready(node_name).await
    }

    /// Ask QEMU to cancel a block job. Does not wait for it to stop.
    pub async fn block_job_cancel(&self, job_id: &str) -> Result<()> {
        self.run_unit("block-job-cancel", Some(json!({ "device": job_id })))
            .await
    }

    pub async fn block_job_complete(&self, job_id: &str) -> Result<()> {
        self.run_unit("block-job-complete", Some(json!({ "device": job_id })))
            .await
    }

    /// Put `overlay` on top of `node_name`, which becomes its backing node.
    pub async fn blockdev_snapshot(&self, node_name: &str, overlay: &str) -> Result<()> {
        self.run_unit(
            "blockdev-snapshot",
            Some(json!({ "node": node_name, "overlay": overlay })),
        )
        .await
    }

    async fn block_job_wait_ready(&self, job_id: &str) -> Result<()> {
        loop {
            let jobs: Vec<BlockJobInfo> = self.run("query-block-jobs", None).await?;

            let job = jobs
                .iter()
                .find(|job| job.device == job_id)
                .ok_or_else(|| QmpError::JobNotFound(job_id.to_string()))?;

            match JobState::from(job) {
                JobState::Ready => {
                    debug!(job = job_id, "Block job ready");
                    return Ok(());
                }
                JobState::Failed(reason) => {
                    warn!(job = job_id, reason = %reason, "Block job failed");
                    return Err(QmpError::JobFailed {
                        job: job_id.to_string(),
                        reason,
                    });
                }
                JobState::Completed => {
                    // Concluded without ever reporting ready.
                    return Err(QmpError::JobFailed {
                        job: job_id.to_string(),
                        reason: "job concluded before becoming ready".to_string(),
                    });
                }
                JobState::Running(status) => {
                    debug!(job = job_id, status = %status, offset = job.offset, len = job.len, "Waiting for block job");
                }
            }

            tokio::time::sleep(self.config().job_poll_interval()).await;
        }
    }
}
