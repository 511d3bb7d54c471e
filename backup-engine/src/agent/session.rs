//! One bounded `on_backup` round trip.

use super::BackupAgent;
use crate::ops::PendingOperationTable;
use crate::payload::{PayloadWriter, StateWriter};
use crate::utils::AgentFailure;
use bytes::Bytes;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub payload: Bytes,
    pub new_state: Bytes,
}

pub type AgentCompletion = Result<AgentOutput, AgentFailure>;

pub struct AgentSession<'a> {
    item: &'a str,
    agent: Arc<dyn BackupAgent>,
    ops: &'a PendingOperationTable<AgentCompletion>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        item: &'a str,
        agent: Arc<dyn BackupAgent>,
        ops: &'a PendingOperationTable<AgentCompletion>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            item,
            agent,
            ops,
            timeout,
            cancel,
        }
    }

    /// Run the agent in its own task and wait for its completion token. Timeout and
    /// cancellation discard any late completion.
    pub async fn invoke(
        &self,
        old_state: Bytes,
        transport_flags: u32,
        quota: Option<u64>,
    ) -> Result<AgentOutput, AgentFailure> {
        let (token, rx) = self.ops.register();
        debug!(item = self.item, %token, "Dispatching agent backup");

        let agent = Arc::clone(&self.agent);
        let completer = self.ops.clone();
        let handle = tokio::spawn(async move {
            let mut data = PayloadWriter::new(transport_flags, quota);
            let mut new_state = StateWriter::new();
            let result = AssertUnwindSafe(agent.on_backup(old_state, &mut data, &mut new_state))
                .catch_unwind()
                .await;

            let completion = match result {
                Ok(Ok(())) => Ok(AgentOutput {
                    payload: data.into_bytes(),
                    new_state: new_state.into_bytes(),
                }),
                Ok(Err(e)) => Err(AgentFailure::Failed(format!("{e:#}"))),
                Err(panic) => Err(AgentFailure::Crashed(panic_message(panic.as_ref()))),
            };
            completer.complete(token, completion);
        });

        tokio::select! {
            waited = tokio::time::timeout(self.timeout, rx) => match waited {
                Ok(Ok(completion)) => completion,
                Ok(Err(_)) => Err(AgentFailure::Crashed("completion channel closed".to_string())),
                Err(_) => {
                    warn!(item = self.item, %token, timeout = ?self.timeout, "Agent timed out");
                    self.ops.cancel(token);
                    handle.abort();
                    Err(AgentFailure::TimedOut(self.timeout))
                }
            },
            _ = self.cancel.cancelled() => {
                self.ops.cancel(token);
                handle.abort();
                Err(AgentFailure::Cancelled)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "agent panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAgent;

    async fn invoke(agent: Arc<FakeAgent>, timeout: Duration) -> (Result<AgentOutput, AgentFailure>, usize) {
        let ops = PendingOperationTable::new();
        let session = AgentSession::new("app", agent, &ops, timeout, CancellationToken::new());
        let result = session.invoke(Bytes::from_static(b"old"), 1, Some(100)).await;
        (result, ops.len())
    }

    #[tokio::test]
    async fn test_successful_round_trip() {
        let agent = Arc::new(FakeAgent::with_data("app"));
        let (result, pending) = invoke(agent.clone(), Duration::from_secs(5)).await;

        let output = result.unwrap();
        assert_eq!(output.new_state, Bytes::from_static(b"stateapp"));
        assert!(!output.payload.is_empty());
        assert_eq!(agent.old_states(), vec![Bytes::from_static(b"old")]);
        assert_eq!(agent.seen_transport_flags(), vec![1]);
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_agent_error_is_failure() {
        let agent = Arc::new(FakeAgent::failing("boom"));
        let (result, _) = invoke(agent, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentFailure::Failed(msg)) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_agent_panic_is_crash() {
        let agent = Arc::new(FakeAgent::panicking("kaboom"));
        let (result, _) = invoke(agent, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentFailure::Crashed(msg)) if msg == "kaboom"));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_operation() {
        let agent = Arc::new(FakeAgent::hanging());
        let (result, pending) = invoke(agent, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AgentFailure::TimedOut(_))));
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let ops = PendingOperationTable::new();
        let cancel = CancellationToken::new();
        let session = AgentSession::new(
            "app",
            Arc::new(FakeAgent::hanging()),
            &ops,
            Duration::from_secs(30),
            cancel.clone(),
        );
        cancel.cancel();

        let result = session.invoke(Bytes::new(), 0, None).await;
        assert!(matches!(result, Err(AgentFailure::Cancelled)));
        assert!(ops.is_empty());
    }
}
