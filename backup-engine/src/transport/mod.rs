//! Remote transport abstraction.
//!
//! A transport owns the storage destination. Every call may fail with
//! [`TransportError::Unavailable`] when the remote endpoint dies.

pub mod local;
pub mod session;

pub use local::LocalTransport;
pub use session::TransportSession;

use crate::utils::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human readable transport name
    fn name(&self) -> &str;

    /// Storage identity used to scope persisted state
    fn destination(&self) -> &str;

    /// Wipe the destination and prepare it for a fresh backup set. Returns a wire code.
    async fn initialize_device(&self) -> TransportResult<i32>;

    /// Advisory size limit for one item's payload. `full_backup` selects the limit for
    /// full-data streams; key/value items always ask with `false`, whether or not the
    /// attempt is incremental.
    async fn backup_quota(&self, item: &str, full_backup: bool) -> TransportResult<u64>;

    /// Feature flags handed to agents (e.g. client-side encryption enabled).
    async fn transport_flags(&self) -> TransportResult<u32>;

    /// Submit one item's payload. Returns a wire code.
    async fn perform_backup(&self, item: &str, payload: Bytes, flags: u32) -> TransportResult<i32>;

    /// Commit everything submitted during the run. Returns a wire code.
    async fn finish_backup(&self) -> TransportResult<i32>;
}
