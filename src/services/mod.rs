pub mod catalog;
pub mod lease;
pub mod sweeper;

use tracing::warn;

use crate::error::LeaseResult;
use crate::ledger::LedgerTx;

/// Commits on success, rolls back on failure.
pub(crate) async fn finish<T: LedgerTx, R>(tx: T, result: LeaseResult<R>) -> LeaseResult<R> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", err, rollback_err);
            }
            Err(err)
        }
    }
}
