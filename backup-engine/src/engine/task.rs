use crate::agent::AgentResolver;
use crate::journal::DataChangedJournal;
use crate::reporter::{BackupObserver, CompletionListener};
use crate::resources::WakeLock;
use crate::transport::Transport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the caller asked to back up.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Item identifiers in caller order. May contain the metadata sentinel and duplicates.
    pub queue: Vec<String>,
    pub user_initiated: bool,
    pub non_incremental: bool,
}

impl RunRequest {
    pub fn new<I, S>(queue: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: queue.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn user_initiated(mut self, user_initiated: bool) -> Self {
        self.user_initiated = user_initiated;
        self
    }

    pub fn non_incremental(mut self, non_incremental: bool) -> Self {
        self.non_incremental = non_incremental;
        self
    }
}

/// Everything one run needs besides the engine itself.
pub struct BackupTask {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) agents: Arc<dyn AgentResolver>,
    pub(crate) request: RunRequest,
    pub(crate) journal: Option<Arc<dyn DataChangedJournal>>,
    pub(crate) observer: Option<Arc<dyn BackupObserver>>,
    pub(crate) listener: Option<Arc<dyn CompletionListener>>,
    pub(crate) wake_lock: WakeLock,
    pub(crate) cancel: CancellationToken,
}

impl BackupTask {
    pub fn new(
        transport: Arc<dyn Transport>,
        agents: Arc<dyn AgentResolver>,
        request: RunRequest,
    ) -> Self {
        Self {
            transport,
            agents,
            request,
            journal: None,
            observer: None,
            listener: None,
            wake_lock: WakeLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn DataChangedJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BackupObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_wake_lock(mut self, wake_lock: WakeLock) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    /// Cancelling the token ends the run after the in-flight step.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }
}
