//! Seams to the local ledger state and its history tables.

use crate::error::Result;
use crate::range::LedgerRange;
use crate::types::{LedgerHeaderHistoryEntry, TransactionHistoryEntry};

/// Collaborator that owns local ledger state. Transaction-execution
/// semantics live entirely behind this trait.
pub trait LedgerApplier: Send + Sync {
    /// The local last-closed ledger.
    fn last_closed(&self) -> LedgerHeaderHistoryEntry;

    /// Apply one ledger's transaction set to local state, producing the
    /// newly closed ledger. The set's `ledger_seq` must be exactly one
    /// past the current last-closed ledger.
    fn apply_transaction_set(
        &self,
        txs: &TransactionHistoryEntry,
    ) -> Result<LedgerHeaderHistoryEntry>;

    /// Adopt a verified header as the new last-closed ledger after its
    /// bucket state has been restored, skipping replay of everything at or
    /// before it.
    fn reset_to(&self, entry: &LedgerHeaderHistoryEntry) -> Result<()>;
}

/// Collaborator that serves locally stored history for publication: the
/// header and transaction records for ledgers this node has closed.
pub trait HistorySource: Send + Sync {
    /// Header entries for the range, ascending.
    fn headers_in(&self, range: LedgerRange) -> Result<Vec<LedgerHeaderHistoryEntry>>;

    /// Transaction entries for the range, ascending.
    fn tx_sets_in(&self, range: LedgerRange) -> Result<Vec<TransactionHistoryEntry>>;
}
