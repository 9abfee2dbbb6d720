//! Ledger → store projection: checkpointed log scans per watched contract,
//! plus the slower full reconciliation pass.

pub mod handlers;
pub mod reconcile;
pub mod synchronizer;

use async_trait::async_trait;

use crate::error::Result;
use crate::ledger::LogEntry;

pub use handlers::{PoolEventHandler, TokenTransferHandler};
pub use reconcile::Reconciler;
pub use synchronizer::{EventSynchronizer, SyncSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDisposition {
    Applied,
    /// Not an event this handler projects.
    Ignored,
}

/// Projects one contract's logs into the store. Must be idempotent: the same
/// log may be delivered more than once.
///
/// Decode errors (`AppError::Abi`) skip the log; any other error aborts the
/// scan without advancing the checkpoint.
#[async_trait]
pub trait LogHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, log: &LogEntry) -> Result<LogDisposition>;
}
