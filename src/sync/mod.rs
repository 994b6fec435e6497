//! Sync engine
//!
//! The components of one tick, leaves first:
//!
//! - `discovery` finds the plan sheets to process
//! - `identifier` assigns row identifiers
//! - `tickets` drives ticket creation through the push sheet
//! - `linker` installs linked cells from the index sheet
//! - `reconciler` resolves field differences between plan and index rows
//! - `orchestrator` owns the shared snapshots and runs the above in order
//!
//! Components never lock shared state; they receive `Arc<SheetSnapshot>`s and
//! return reports.

pub mod discovery;
pub mod identifier;
pub mod index;
pub mod linker;
pub mod orchestrator;
pub mod reconciler;
pub mod ticket;
pub mod tickets;

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, SyncError};
use crate::sheets::model::{BatchReport, CellUpdate, RowId, RowUpdate, SheetId, WriteMode};
use crate::sheets::SheetService;

pub use discovery::Discovery;
pub use identifier::{IdentifierService, RowIdentifier};
pub use index::ProjectIndex;
pub use linker::FieldLinker;
pub use orchestrator::{Orchestrator, SyncJob, TickReport};
pub use reconciler::BidirectionalReconciler;
pub use ticket::Ticket;
pub use tickets::TicketCreationPipeline;

/// Row that produced an update: `(sheet, row)`.
pub type Origin = (SheetId, RowId);

/// Row updates for one sheet, one entry per row id.
///
/// Cells for a row are merged while they come from the same origin; a later
/// origin targeting an already-claimed row is dropped.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub sheet_id: SheetId,
    rows: Vec<RowUpdate>,
    owners: HashMap<RowId, (usize, Origin)>,
}

impl UpdateBatch {
    pub fn new(sheet_id: SheetId) -> Self {
        Self {
            sheet_id,
            rows: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Queue `cell` for `row_id`. Returns `false` when the row is owned by a
    /// different origin.
    pub fn push(&mut self, row_id: RowId, origin: Origin, cell: CellUpdate) -> bool {
        match self.owners.get(&row_id) {
            Some((position, owner)) if *owner == origin => {
                let row = &mut self.rows[*position];
                if !row.cells.iter().any(|c| c.column_id == cell.column_id) {
                    row.cells.push(cell);
                }
                true
            }
            Some((_, owner)) => {
                tracing::debug!(
                    sheet_id = self.sheet_id,
                    row_id,
                    kept = ?owner,
                    dropped = ?origin,
                    "Duplicate row update collapsed"
                );
                false
            }
            None => {
                self.owners.insert(row_id, (self.rows.len(), origin));
                self.rows.push(RowUpdate::update(row_id, vec![cell]));
                true
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[RowUpdate] {
        &self.rows
    }

    /// Write the batch; an empty batch is a no-op.
    pub async fn flush(
        self,
        service: &dyn SheetService,
        tally: &mut WriteTally,
    ) -> Result<BatchReport> {
        if self.rows.is_empty() {
            return Ok(BatchReport::default());
        }
        let report = service
            .write_rows(self.sheet_id, &self.rows, WriteMode::Update)
            .await?;
        tally.record(self.sheet_id, &report);
        Ok(report)
    }
}

/// Write counts accumulated by a component pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteTally {
    pub rows_written: usize,
    pub rows_failed: usize,
    /// Sheets that accepted at least one row.
    pub sheets: BTreeSet<SheetId>,
}

impl WriteTally {
    pub fn record(&mut self, sheet_id: SheetId, report: &BatchReport) {
        self.rows_written += report.written.len();
        self.rows_failed += report.failed_rows();
        if !report.written.is_empty() {
            self.sheets.insert(sheet_id);
        }
    }

    pub fn merge(&mut self, other: &WriteTally) {
        self.rows_written += other.rows_written;
        self.rows_failed += other.rows_failed;
        self.sheets.extend(other.sheets.iter().copied());
    }
}

/// First fatal chunk error of a batch, if any. Non-fatal failures were
/// already logged by the client and are retried on the next tick.
pub fn fatal_error(report: BatchReport) -> Result<()> {
    match report.failures.into_iter().find(|f| f.error.kind().is_fatal()) {
        Some(failure) => Err(failure.error),
        None => Ok(()),
    }
}

/// Propagate fatal errors; log and swallow the rest.
pub(crate) fn tolerate<T>(result: Result<T>, context: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.kind().is_fatal() => Err(error),
        Err(SyncError::NotFound { resource }) => {
            tracing::info!(resource = %resource, "{}: not found, skipped", context);
            Ok(None)
        }
        Err(error) => {
            tracing::warn!(kind = %error.kind(), error = %error, "{}", context);
            Ok(None)
        }
    }
}
