//! Backup run engine.
//!
//! A run walks an explicit step machine:
//!
//! ```text
//! Start -> Initialize -> NextItem -> BeginItem -> InvokeAgent -> Submit -> NextItem ... -> Finalize
//!                 \__________ Abort (from any step) __________/
//! ```
//!
//! Items never overlap. Agent calls are dispatched as separate tasks and the run suspends on
//! a correlation token until the agent completes, times out or the run is cancelled.
//! `Finalize` runs on every path: it finishes the transport (if it was initialized),
//! releases the wake lock, deletes the journal after a clean run and reports the result.

mod task;

pub use task::{BackupTask, RunRequest};

use crate::agent::session::AgentCompletion;
use crate::agent::{AgentOutput, AgentSession, BackupAgent};
use crate::config::EngineConfig;
use crate::item::{BackupItem, Queue, METADATA_SENTINEL};
use crate::ops::PendingOperationTable;
use crate::outcome::{flags, ItemOutcome, RunResult, RunStatus, TransportOutcome};
use crate::payload;
use crate::reporter::ResultReporter;
use crate::resources::{DestinationLocks, WakeLockGuard};
use crate::store::StateStore;
use crate::transport::TransportSession;
use crate::utils::{AgentFailure, RunAbort};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct BackupRunEngine {
    config: EngineConfig,
    locks: Arc<DestinationLocks>,
    ops: PendingOperationTable<AgentCompletion>,
}

/// One item attempt. Survives a non-incremental retry.
struct ItemAttempt {
    item: BackupItem,
    agent: Arc<dyn BackupAgent>,
    incremental: bool,
    retried: bool,
    quota: Option<u64>,
}

enum Step {
    Start,
    Initialize(Queue),
    NextItem,
    BeginItem(BackupItem),
    InvokeAgent(ItemAttempt),
    Submit(ItemAttempt, AgentOutput),
    Abort(RunAbort),
    Finalize,
}

/// Mutable state of one run.
struct Run {
    run_id: Uuid,
    task: BackupTask,
    store: StateStore,
    session: TransportSession,
    reporter: ResultReporter,
    pending: VecDeque<BackupItem>,
    /// Queued items (and metadata) that had state once the destination was initialized
    stateful: HashSet<String>,
    /// Real item currently between `BeginItem` and its recorded outcome
    current: Option<BackupItem>,
    abort: Option<RunAbort>,
}

impl BackupRunEngine {
    pub fn new(config: EngineConfig, locks: Arc<DestinationLocks>) -> Self {
        Self {
            config,
            locks,
            ops: PendingOperationTable::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Agent operations still awaiting completion.
    pub fn pending_operations(&self) -> usize {
        self.ops.len()
    }

    /// Run a backup task to completion on a spawned task.
    pub fn spawn(self: &Arc<Self>, task: BackupTask) -> tokio::task::JoinHandle<RunResult> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(task).await })
    }

    /// Run a backup task to completion. Never fails: every problem ends up in the result.
    pub async fn run(&self, task: BackupTask) -> RunResult {
        let destination = task.transport.destination().to_string();
        let _destination_guard = self.locks.acquire(&destination).await;
        let wake_guard = task.wake_lock.acquire();

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            destination = %destination,
            items = task.request.queue.len(),
            non_incremental = task.request.non_incremental,
            user_initiated = task.request.user_initiated,
            "Starting backup run"
        );

        let mut run = Run {
            run_id,
            store: StateStore::new(&self.config.state_dir, &destination),
            session: TransportSession::new(Arc::clone(&task.transport), self.config.finish_timeout()),
            reporter: ResultReporter::new(
                run_id,
                destination,
                task.observer.clone(),
                task.listener.clone(),
            ),
            pending: VecDeque::new(),
            stateful: HashSet::new(),
            current: None,
            abort: None,
            task,
        };

        let mut step = Step::Start;
        loop {
            step = match step {
                Step::Start => self.start(&run),
                Step::Initialize(queue) => self.initialize(&mut run, queue).await,
                Step::NextItem => self.next_item(&mut run),
                Step::BeginItem(item) => self.begin_item(&mut run, item),
                Step::InvokeAgent(attempt) => self.invoke_agent(&mut run, attempt).await,
                Step::Submit(attempt, output) => self.submit(&mut run, attempt, output).await,
                Step::Abort(reason) => self.abort(&mut run, reason),
                Step::Finalize => break,
            };
        }

        self.finalize(run, wake_guard).await
    }

    fn start(&self, run: &Run) -> Step {
        let queue = Queue::from_ids(run.task.request.queue.iter().cloned());
        if queue.is_empty() {
            info!(run_id = %run.run_id, "Nothing to back up");
            return Step::Finalize;
        }
        Step::Initialize(queue)
    }

    async fn initialize(&self, run: &mut Run, queue: Queue) -> Step {
        if let Err(e) = run.session.ensure_initialized(&run.store).await {
            return Step::Abort(e);
        }

        let ids: Vec<String> = queue
            .items
            .iter()
            .map(|item| item.id.clone())
            .chain(std::iter::once(METADATA_SENTINEL.to_string()))
            .collect();
        run.stateful = match stateful_items(&run.store, ids).await {
            Ok(stateful) => stateful,
            Err(e) => return Step::Abort(e),
        };

        let include_metadata = queue.metadata_requested
            || run.task.request.non_incremental
            || !run.stateful.contains(METADATA_SENTINEL)
            || queue.items.iter().any(|item| !run.stateful.contains(&item.id));

        run.pending = queue.items.into();
        if include_metadata {
            run.pending.push_front(BackupItem::metadata());
        } else {
            debug!(run_id = %run.run_id, "All items incremental, skipping metadata backup");
        }
        Step::NextItem
    }

    fn next_item(&self, run: &mut Run) -> Step {
        if run.task.cancel.is_cancelled() {
            return Step::Abort(RunAbort::Cancelled);
        }
        match run.pending.pop_front() {
            Some(item) => Step::BeginItem(item),
            None => Step::Finalize,
        }
    }

    fn begin_item(&self, run: &mut Run, item: BackupItem) -> Step {
        let incremental = !run.task.request.non_incremental && run.stateful.contains(&item.id);

        let agent = if item.is_metadata() {
            run.task.agents.metadata_agent()
        } else {
            match run.task.agents.bind(&item.id) {
                Some(agent) => agent,
                None => {
                    warn!(run_id = %run.run_id, item = %item.id, "No agent for item");
                    run.reporter.record(&item.id, ItemOutcome::PackageNotFound);
                    return Step::NextItem;
                }
            }
        };

        if !item.is_metadata() {
            run.current = Some(item.clone());
        }
        debug!(run_id = %run.run_id, item = %item.id, incremental, "Beginning item");

        Step::InvokeAgent(ItemAttempt {
            item,
            agent,
            incremental,
            retried: false,
            quota: None,
        })
    }

    async fn invoke_agent(&self, run: &mut Run, mut attempt: ItemAttempt) -> Step {
        let id = attempt.item.id.clone();

        attempt.quota = match run.session.quota(&id, false).await {
            Ok(quota) => Some(quota),
            Err(e) if attempt.item.is_metadata() => return Step::Abort(e.into()),
            Err(e) => {
                warn!(run_id = %run.run_id, item = %id, error = %e, "Quota unavailable, assuming unbounded");
                None
            }
        };

        let transport_flags = match run.session.transport_flags().await {
            Ok(flags) => flags,
            Err(e) => return Step::Abort(e.into()),
        };

        let old_state = if attempt.incremental {
            match read_state(&run.store, &id).await {
                Ok(state) => state,
                Err(e) => return Step::Abort(e),
            }
        } else {
            Bytes::new()
        };

        let session = AgentSession::new(
            &id,
            Arc::clone(&attempt.agent),
            &self.ops,
            self.config.agent_timeout(),
            run.task.cancel.clone(),
        );
        let output = match session.invoke(old_state, transport_flags, attempt.quota).await {
            Ok(output) => output,
            Err(failure) => return self.agent_failed(run, attempt, failure),
        };

        if let Err(e) = payload::validate(&output.payload) {
            attempt.agent.fail(&e.to_string());
            return self.agent_failed(run, attempt, e.into());
        }

        Step::Submit(attempt, output)
    }

    fn agent_failed(&self, run: &mut Run, attempt: ItemAttempt, failure: AgentFailure) -> Step {
        match failure {
            AgentFailure::Cancelled => Step::Abort(RunAbort::Cancelled),
            failure if attempt.item.is_metadata() => {
                Step::Abort(RunAbort::MetadataFailed(failure.to_string()))
            }
            failure => {
                warn!(run_id = %run.run_id, item = %attempt.item.id, error = %failure, "Agent failed");
                self.finish_item(run, &attempt, ItemOutcome::AgentFailure);
                Step::NextItem
            }
        }
    }

    async fn submit(&self, run: &mut Run, mut attempt: ItemAttempt, output: AgentOutput) -> Step {
        let id = attempt.item.id.clone();
        let size = output.payload.len() as u64;

        let mut backup_flags = if attempt.incremental {
            flags::INCREMENTAL
        } else {
            flags::NON_INCREMENTAL
        };
        if run.task.request.user_initiated {
            backup_flags |= flags::USER_INITIATED;
        }

        let outcome = match run.session.perform_backup(&id, output.payload, backup_flags).await {
            Ok(outcome) => outcome,
            Err(e) => return Step::Abort(e.into()),
        };

        match outcome {
            TransportOutcome::Ok => {
                if let Err(e) = commit_state(&run.store, &id, output.new_state).await {
                    return Step::Abort(e);
                }
                self.finish_item(run, &attempt, ItemOutcome::Success);
                Step::NextItem
            }
            TransportOutcome::NonIncrementalRequired if attempt.incremental && !attempt.retried => {
                info!(run_id = %run.run_id, item = %id, "Transport requested non-incremental backup, retrying");
                attempt.incremental = false;
                attempt.retried = true;
                Step::InvokeAgent(attempt)
            }
            TransportOutcome::NonIncrementalRequired => Step::Abort(RunAbort::ProtocolViolation(id)),
            TransportOutcome::PackageRejected | TransportOutcome::QuotaExceeded
                if attempt.item.is_metadata() =>
            {
                Step::Abort(RunAbort::MetadataFailed(format!("transport returned {:?}", outcome)))
            }
            TransportOutcome::PackageRejected => {
                info!(run_id = %run.run_id, item = %id, "Transport rejected item");
                self.finish_item(run, &attempt, ItemOutcome::PackageRejected);
                Step::NextItem
            }
            TransportOutcome::QuotaExceeded => {
                let quota = attempt.quota.unwrap_or(u64::MAX);
                info!(run_id = %run.run_id, item = %id, size, quota, "Item exceeded transport quota");
                attempt.agent.on_quota_exceeded(size, quota).await;
                self.finish_item(run, &attempt, ItemOutcome::QuotaExceeded);
                Step::NextItem
            }
            TransportOutcome::NotInitialized => {
                let store = run.store.clone();
                let reset = match tokio::task::spawn_blocking(move || store.reset()).await {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = reset {
                    error!(run_id = %run.run_id, error = %e, "Failed to reset state after transport lost initialization");
                }
                Step::Abort(RunAbort::NotInitialized)
            }
            TransportOutcome::Aborted => Step::Abort(RunAbort::TransportStatus {
                item: id,
                code: outcome.code(),
            }),
        }
    }

    /// Record a real item's outcome and release its agent.
    fn finish_item(&self, run: &mut Run, attempt: &ItemAttempt, outcome: ItemOutcome) {
        if attempt.item.is_metadata() {
            debug!(run_id = %run.run_id, ?outcome, "Metadata item finished");
            return;
        }
        run.current = None;
        run.task.agents.unbind(&attempt.item.id);
        run.reporter.record(&attempt.item.id, outcome);
    }

    fn abort(&self, run: &mut Run, reason: RunAbort) -> Step {
        let cancelled = matches!(reason, RunAbort::Cancelled);
        if cancelled {
            warn!(run_id = %run.run_id, "Backup run cancelled");
        } else {
            error!(run_id = %run.run_id, error = %reason, "Backup run aborted");
        }

        if let Some(item) = run.current.take().filter(|item| !run.reporter.has_outcome(&item.id)) {
            let outcome = if cancelled {
                ItemOutcome::BackupCancelled
            } else {
                ItemOutcome::TransportAborted
            };
            run.task.agents.unbind(&item.id);
            run.reporter.record(&item.id, outcome);
        }

        if !run.pending.is_empty() {
            info!(run_id = %run.run_id, skipped = run.pending.len(), "Remaining items not attempted");
            run.pending.clear();
        }
        run.abort = Some(reason);
        Step::Finalize
    }

    async fn finalize(&self, mut run: Run, wake_guard: WakeLockGuard) -> RunResult {
        run.session.finish().await;
        wake_guard.release();

        let status = match &run.abort {
            None => RunStatus::Success,
            Some(RunAbort::Cancelled) => RunStatus::BackupCancelled,
            Some(_) => RunStatus::TransportAborted,
        };

        if status == RunStatus::Success {
            if let Some(journal) = &run.task.journal {
                if let Err(e) = journal.delete() {
                    warn!(run_id = %run.run_id, error = %e, "Failed to delete journal");
                }
            }
        }

        let result = run.reporter.finish(status);
        info!(
            run_id = %run.run_id,
            status = ?result.status,
            items = result.items.len(),
            succeeded = result.count(ItemOutcome::Success),
            "Backup run finished"
        );
        result
    }
}

async fn stateful_items(store: &StateStore, ids: Vec<String>) -> Result<HashSet<String>, RunAbort> {
    let store = store.clone();
    let stateful = tokio::task::spawn_blocking(move || store.with_state(ids.iter().map(String::as_str)))
        .await
        .map_err(crate::EngineError::from)?;
    Ok(stateful)
}

async fn read_state(store: &StateStore, item: &str) -> Result<Bytes, RunAbort> {
    let store = store.clone();
    let item = item.to_string();
    let state = tokio::task::spawn_blocking(move || store.read(&item))
        .await
        .map_err(crate::EngineError::from)??;
    Ok(state)
}

async fn commit_state(store: &StateStore, item: &str, state: Bytes) -> Result<(), RunAbort> {
    let store = store.clone();
    let item = item.to_string();
    tokio::task::spawn_blocking(move || store.write_atomic(&item, &state))
        .await
        .map_err(crate::EngineError::from)??;
    Ok(())
}
