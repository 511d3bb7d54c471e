//! In-memory fakes shared by the unit tests.

use crate::agent::{AgentResolver, BackupAgent};
use crate::journal::DataChangedJournal;
use crate::outcome::{codes, ItemOutcome, RunResult, RunStatus};
use crate::payload::{PayloadWriter, StateWriter};
use crate::reporter::{BackupObserver, CompletionListener};
use crate::transport::{Transport, TransportResult};
use crate::utils::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Initialize,
    Quota { item: String, full_backup: bool },
    Flags,
    PerformBackup { item: String, flags: u32, payload: Bytes },
    Finish,
}

struct FakeTransportState {
    init_status: i32,
    unavailable: bool,
    flags: u32,
    quota: u64,
    failing_quota: HashSet<String>,
    failing_perform: HashSet<String>,
    failing_finish: bool,
    /// (item, required flag bits, returned code); first match wins
    responses: Vec<(String, u32, i32)>,
    calls: Vec<TransportCall>,
}

pub struct FakeTransport {
    destination: String,
    state: Mutex<FakeTransportState>,
}

impl FakeTransport {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            state: Mutex::new(FakeTransportState {
                init_status: codes::TRANSPORT_OK,
                unavailable: false,
                flags: 0,
                quota: 1024 * 1024,
                failing_quota: HashSet::new(),
                failing_perform: HashSet::new(),
                failing_finish: false,
                responses: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_init_status(&self, status: i32) {
        self.state.lock().init_status = status;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn set_flags(&self, flags: u32) {
        self.state.lock().flags = flags;
    }

    pub fn set_quota(&self, quota: u64) {
        self.state.lock().quota = quota;
    }

    pub fn fail_quota_for(&self, item: &str) {
        self.state.lock().failing_quota.insert(item.to_string());
    }

    /// Submissions of `item` fail as if the transport dropped the connection.
    pub fn fail_perform_for(&self, item: &str) {
        self.state.lock().failing_perform.insert(item.to_string());
    }

    pub fn fail_finish(&self) {
        self.state.lock().failing_finish = true;
    }

    /// Answer every submission of `item` with `code`.
    pub fn respond(&self, item: &str, code: i32) {
        self.respond_when(item, 0, code);
    }

    /// Answer submissions of `item` carrying all of `flags` with `code`.
    pub fn respond_when(&self, item: &str, flags: u32, code: i32) {
        self.state.lock().responses.push((item.to_string(), flags, code));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn init_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Initialize))
    }

    pub fn finish_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Finish))
    }

    /// Quota lookups as (item, full_backup), in order.
    pub fn quota_requests(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Quota { item, full_backup } => Some((item.clone(), *full_backup)),
                _ => None,
            })
            .collect()
    }

    /// Submissions of `item` as (flags, payload), in order.
    pub fn performed(&self, item: &str) -> Vec<(u32, Bytes)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::PerformBackup { item: i, flags, payload } if i == item => {
                    Some((*flags, payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Submitted item identifiers, in order.
    pub fn performed_items(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::PerformBackup { item, .. } => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: TransportCall) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.unavailable {
            return Err(TransportError::Unavailable("fake transport is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    async fn initialize_device(&self) -> TransportResult<i32> {
        self.record(TransportCall::Initialize)?;
        Ok(self.state.lock().init_status)
    }

    async fn backup_quota(&self, item: &str, full_backup: bool) -> TransportResult<u64> {
        self.record(TransportCall::Quota {
            item: item.to_string(),
            full_backup,
        })?;
        let state = self.state.lock();
        if state.failing_quota.contains(item) {
            return Err(TransportError::Unavailable(format!("quota lookup for {item} failed")));
        }
        Ok(state.quota)
    }

    async fn transport_flags(&self) -> TransportResult<u32> {
        self.record(TransportCall::Flags)?;
        Ok(self.state.lock().flags)
    }

    async fn perform_backup(&self, item: &str, payload: Bytes, flags: u32) -> TransportResult<i32> {
        self.record(TransportCall::PerformBackup {
            item: item.to_string(),
            flags,
            payload,
        })?;
        let state = self.state.lock();
        if state.failing_perform.contains(item) {
            return Err(TransportError::Unavailable(format!("connection lost sending {item}")));
        }
        let code = state
            .responses
            .iter()
            .find(|(i, required, _)| i == item && flags & required == *required)
            .map(|(_, _, code)| *code)
            .unwrap_or(codes::TRANSPORT_OK);
        Ok(code)
    }

    async fn finish_backup(&self) -> TransportResult<i32> {
        self.record(TransportCall::Finish)?;
        if self.state.lock().failing_finish {
            return Err(TransportError::Unavailable("finish failed".to_string()));
        }
        Ok(codes::TRANSPORT_OK)
    }
}

type WriteFn = Box<dyn Fn(&Bytes, &mut PayloadWriter, &mut StateWriter) -> anyhow::Result<()> + Send + Sync>;

enum Behavior {
    Write(WriteFn),
    Hang,
}

pub struct FakeAgent {
    behavior: Behavior,
    old_states: Mutex<Vec<Bytes>>,
    transport_flags: Mutex<Vec<u32>>,
    quotas: Mutex<Vec<Option<u64>>>,
    quota_exceeded: Mutex<Vec<(u64, u64)>>,
    failures: Mutex<Vec<String>>,
}

impl FakeAgent {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Bytes, &mut PayloadWriter, &mut StateWriter) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_behavior(Behavior::Write(Box::new(f)))
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            old_states: Mutex::new(Vec::new()),
            transport_flags: Mutex::new(Vec::new()),
            quotas: Mutex::new(Vec::new()),
            quota_exceeded: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Writes `key` -> `data<id>` and new state `state<id>`.
    pub fn with_data(id: &str) -> Self {
        let data = format!("data{id}");
        let state = format!("state{id}");
        Self::new(move |_, payload, new_state| {
            payload.write_entity("key", data.as_bytes())?;
            new_state.write_all(state.as_bytes())?;
            Ok(())
        })
    }

    pub fn writing_key(key: &str) -> Self {
        let key = key.to_string();
        Self::new(move |_, payload, new_state| {
            payload.write_entity(&key, b"value")?;
            new_state.write_all(b"state")?;
            Ok(())
        })
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_, _, _| Err(anyhow::anyhow!("{message}")))
    }

    pub fn panicking(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_, _, _| -> anyhow::Result<()> { panic!("{}", message) })
    }

    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    pub fn invocations(&self) -> usize {
        self.old_states.lock().len()
    }

    pub fn old_states(&self) -> Vec<Bytes> {
        self.old_states.lock().clone()
    }

    pub fn seen_transport_flags(&self) -> Vec<u32> {
        self.transport_flags.lock().clone()
    }

    pub fn seen_quotas(&self) -> Vec<Option<u64>> {
        self.quotas.lock().clone()
    }

    pub fn quota_exceeded_calls(&self) -> Vec<(u64, u64)> {
        self.quota_exceeded.lock().clone()
    }

    pub fn fail_calls(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl BackupAgent for FakeAgent {
    async fn on_backup(
        &self,
        old_state: Bytes,
        data: &mut PayloadWriter,
        new_state: &mut StateWriter,
    ) -> anyhow::Result<()> {
        self.old_states.lock().push(old_state.clone());
        self.transport_flags.lock().push(data.transport_flags());
        self.quotas.lock().push(data.quota());

        match &self.behavior {
            Behavior::Write(f) => f(&old_state, data, new_state),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn on_quota_exceeded(&self, backup_size: u64, quota: u64) {
        self.quota_exceeded.lock().push((backup_size, quota));
    }

    fn fail(&self, reason: &str) {
        self.failures.lock().push(reason.to_string());
    }
}

pub struct FakeResolver {
    agents: Mutex<HashMap<String, Arc<dyn BackupAgent>>>,
    metadata: Arc<dyn BackupAgent>,
    unbound: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn new(metadata: Arc<dyn BackupAgent>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            metadata,
            unbound: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, item: &str, agent: Arc<dyn BackupAgent>) -> Self {
        self.agents.lock().insert(item.to_string(), agent);
        self
    }

    pub fn unbound(&self) -> Vec<String> {
        self.unbound.lock().clone()
    }
}

impl AgentResolver for FakeResolver {
    fn bind(&self, item: &str) -> Option<Arc<dyn BackupAgent>> {
        self.agents.lock().get(item).cloned()
    }

    fn metadata_agent(&self) -> Arc<dyn BackupAgent> {
        Arc::clone(&self.metadata)
    }

    fn unbind(&self, item: &str) {
        self.unbound.lock().push(item.to_string());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    panics: bool,
    results: Mutex<Vec<(String, ItemOutcome)>>,
    finished: Mutex<Vec<RunStatus>>,
}

impl RecordingObserver {
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Default::default()
        }
    }

    pub fn results(&self) -> Vec<(String, ItemOutcome)> {
        self.results.lock().clone()
    }

    pub fn finished(&self) -> Vec<RunStatus> {
        self.finished.lock().clone()
    }
}

impl BackupObserver for RecordingObserver {
    fn on_result(&self, item: &str, outcome: ItemOutcome) {
        self.results.lock().push((item.to_string(), outcome));
        if self.panics {
            panic!("observer exploded");
        }
    }

    fn on_run_finished(&self, status: RunStatus) {
        self.finished.lock().push(status);
        if self.panics {
            panic!("observer exploded");
        }
    }
}

#[derive(Default)]
pub struct RecordingListener {
    results: Mutex<Vec<RunResult>>,
}

impl RecordingListener {
    pub fn results(&self) -> Vec<RunResult> {
        self.results.lock().clone()
    }
}

impl CompletionListener for RecordingListener {
    fn on_task_finished(&self, result: &RunResult) {
        self.results.lock().push(result.clone());
    }
}

#[derive(Default)]
pub struct FakeJournal {
    deletes: AtomicUsize,
}

impl FakeJournal {
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl DataChangedJournal for FakeJournal {
    fn delete(&self) -> std::io::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
