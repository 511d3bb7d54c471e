use backup_engine::{BackupObserver, ItemOutcome, RunStatus};
use tracing::{info, warn};

/// Reports progress through the log.
pub struct LoggingObserver;

impl BackupObserver for LoggingObserver {
    fn on_result(&self, item: &str, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success => info!(item, "Backed up"),
            outcome => warn!(item, ?outcome, code = outcome.code(), "Item not backed up"),
        }
    }

    fn on_run_finished(&self, status: RunStatus) {
        match status {
            RunStatus::Success => info!("Backup pass complete"),
            status => warn!(?status, code = status.code(), "Backup pass did not complete"),
        }
    }
}
