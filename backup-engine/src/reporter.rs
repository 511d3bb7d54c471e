//! Per-item and final notifications.
//!
//! Observer and listener callbacks run behind a panic guard so a misbehaving observer can
//! never prevent the completion listener from hearing about the end of the run.

use crate::outcome::{ItemOutcome, ItemResult, RunResult, RunStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub trait BackupObserver: Send + Sync {
    fn on_result(&self, item: &str, outcome: ItemOutcome);

    fn on_run_finished(&self, status: RunStatus);
}

pub trait CompletionListener: Send + Sync {
    fn on_task_finished(&self, result: &RunResult);
}

pub struct ResultReporter {
    run_id: Uuid,
    destination: String,
    started_at: DateTime<Utc>,
    observer: Option<Arc<dyn BackupObserver>>,
    listener: Option<Arc<dyn CompletionListener>>,
    items: Vec<ItemResult>,
    reported: HashSet<String>,
}

impl ResultReporter {
    pub fn new(
        run_id: Uuid,
        destination: impl Into<String>,
        observer: Option<Arc<dyn BackupObserver>>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Self {
        Self {
            run_id,
            destination: destination.into(),
            started_at: Utc::now(),
            observer,
            listener,
            items: Vec::new(),
            reported: HashSet::new(),
        }
    }

    /// Record an item's terminal outcome. A second outcome for the same item is ignored.
    pub fn record(&mut self, item: &str, outcome: ItemOutcome) {
        if !self.reported.insert(item.to_string()) {
            warn!(item, ?outcome, "Ignoring duplicate outcome");
            return;
        }

        info!(run_id = %self.run_id, item, ?outcome, code = outcome.code(), "Item finished");
        self.items.push(ItemResult {
            item: item.to_string(),
            outcome,
        });

        if let Some(observer) = &self.observer {
            guarded("on_result", || observer.on_result(item, outcome));
        }
    }

    pub fn has_outcome(&self, item: &str) -> bool {
        self.reported.contains(item)
    }

    /// Finalize the run. Consumes the reporter so it cannot fire twice.
    pub fn finish(self, status: RunStatus) -> RunResult {
        let result = RunResult {
            run_id: self.run_id,
            destination: self.destination,
            status,
            items: self.items,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        if let Some(observer) = &self.observer {
            guarded("on_run_finished", || observer.on_run_finished(status));
        }
        if let Some(listener) = &self.listener {
            guarded("on_task_finished", || listener.on_task_finished(&result));
        }

        result
    }
}

fn guarded<F: FnOnce()>(callback: &str, f: F) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback, "Observer callback panicked");
    }
}
