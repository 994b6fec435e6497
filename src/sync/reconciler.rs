//! Bidirectional field reconciliation between plan rows and index rows.
//!
//! Last writer wins, judged from cell history, with guard bands at row and
//! cell level inside which two edits count as simultaneous and nothing is
//! written.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{ColumnNames, SyncedField};
use crate::error::Result;
use crate::sheets::model::{Cell, CellUpdate, ColumnId, RowId, SheetId};
use crate::sheets::{LinkDirection, LinkState, SheetService, SheetSnapshot};

use super::index::ProjectIndex;
use super::ticket::{unknown_ticket_warning, Ticket};
use super::{fatal_error, tolerate, UpdateBatch, WriteTally};

/// Row modification times this close are treated as equal (seconds).
pub const ROW_GUARD_SECS: i64 = 15;
/// Cell modification times this close are treated as equal (seconds).
pub const CELL_GUARD_SECS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Plan,
    Index,
}

/// Later side wins unless both times fall within `guard_secs`.
pub fn pick_winner(
    plan: Option<DateTime<Utc>>,
    index: Option<DateTime<Utc>>,
    guard_secs: i64,
) -> Option<Side> {
    match (plan, index) {
        (None, None) => None,
        (Some(_), None) => Some(Side::Plan),
        (None, Some(_)) => Some(Side::Index),
        (Some(plan), Some(index)) => {
            let delta = plan.timestamp() - index.timestamp();
            if delta.abs() <= guard_secs {
                None
            } else if delta > 0 {
                Some(Side::Plan)
            } else {
                Some(Side::Index)
            }
        }
    }
}

/// Whether two row modification times fall inside the row guard band.
fn within_row_guard(plan: Option<DateTime<Utc>>, index: Option<DateTime<Utc>>) -> bool {
    match (plan, index) {
        (Some(plan), Some(index)) => (plan.timestamp() - index.timestamp()).abs() <= ROW_GUARD_SECS,
        _ => false,
    }
}

/// Whether the plan and index cells already agree for `field`.
pub fn cells_match(plan: Option<&Cell>, index: Option<&Cell>, field: SyncedField) -> bool {
    let text = |cell: Option<&Cell>| cell.and_then(|c| c.text()).map(|t| t.trim().to_string());
    let url = |cell: Option<&Cell>| cell.and_then(|c| c.hyperlink_url()).map(str::to_string);

    let (plan_text, index_text) = (text(plan), text(index));
    let same_text = match field {
        SyncedField::Ticket => match (&plan_text, &index_text) {
            (Some(p), Some(i)) => p.eq_ignore_ascii_case(i),
            (p, i) => p == i,
        },
        _ => plan_text == index_text,
    };
    if !same_text {
        return false;
    }
    // Ticket hyperlinks are regenerated by the tracker; ignore them
    field == SyncedField::Ticket || url(plan) == url(index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub warnings: usize,
    pub plan_cells: usize,
    pub index_cells: usize,
    pub rows_in_guard: usize,
    pub writes: WriteTally,
}

pub struct BidirectionalReconciler {
    service: Arc<dyn SheetService>,
    columns: ColumnNames,
}

impl BidirectionalReconciler {
    pub fn new(service: Arc<dyn SheetService>, columns: ColumnNames) -> Self {
        Self { service, columns }
    }

    /// Most recent modification time of a cell.
    async fn last_modified(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        column_id: ColumnId,
    ) -> Result<Option<DateTime<Utc>>> {
        let history = self
            .service
            .get_cell_history(sheet_id, row_id, column_id, 1)
            .await?;
        Ok(history.first().and_then(|h| h.modified_at))
    }

    pub async fn reconcile(
        &self,
        plans: &[Arc<SheetSnapshot>],
        index: &ProjectIndex,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let index_sheet = index.snapshot();
        let mut index_batch = UpdateBatch::new(index_sheet.id);
        let names = &self.columns.plan;

        for snapshot in plans {
            let Some(ticket_column) = snapshot.column_id(&names.ticket) else {
                continue;
            };
            let fields: Vec<_> = self
                .columns
                .synced_fields()
                .into_iter()
                .filter_map(|pair| {
                    Some((
                        pair.field,
                        snapshot.column_id(pair.plan)?,
                        index_sheet.column_id(pair.index)?,
                    ))
                })
                .collect();
            let mut plan_batch = UpdateBatch::new(snapshot.id);

            for row in snapshot.rows() {
                if snapshot.is_summary(row, &names.summary) {
                    continue;
                }
                let ticket = Ticket::parse(snapshot.value_by_name(row, &names.ticket).as_deref());
                let Some(key) = ticket.key() else {
                    continue;
                };
                let origin = (snapshot.id, row.id);

                let Some(index_row) = index.row(key) else {
                    tracing::warn!(
                        sheet_id = snapshot.id,
                        row_id = row.id,
                        ticket = %key,
                        "Ticket not found in index sheet"
                    );
                    plan_batch.push(
                        row.id,
                        origin,
                        CellUpdate::text(ticket_column, unknown_ticket_warning(key)),
                    );
                    report.warnings += 1;
                    continue;
                };

                if within_row_guard(row.modified_at, index_row.modified_at) {
                    report.rows_in_guard += 1;
                    continue;
                }

                for &(field, plan_column, index_column) in &fields {
                    let plan_cell = row.cell(plan_column);
                    let index_cell = index_row.cell(index_column);
                    if cells_match(plan_cell, index_cell, field) {
                        continue;
                    }

                    let (plan_time, index_time) = tokio::join!(
                        self.last_modified(snapshot.id, row.id, plan_column),
                        self.last_modified(index_sheet.id, index_row.id, index_column),
                    );
                    let (Some(plan_time), Some(index_time)) = (
                        tolerate(plan_time, "Fetch plan cell history")?,
                        tolerate(index_time, "Fetch index cell history")?,
                    ) else {
                        continue;
                    };

                    match pick_winner(plan_time, index_time, CELL_GUARD_SECS) {
                        Some(Side::Plan) => {
                            tracing::debug!(
                                ticket = %key,
                                field = ?field,
                                "Plan value wins"
                            );
                            if index_batch.push(
                                index_row.id,
                                origin,
                                CellUpdate::copy_of(plan_cell, index_column),
                            ) {
                                report.index_cells += 1;
                            }
                        }
                        Some(Side::Index) => {
                            let linked = plan_cell.is_some_and(|c| {
                                snapshot.link_state(c, LinkDirection::In) == LinkState::Ok
                            });
                            if linked {
                                continue;
                            }
                            tracing::debug!(
                                ticket = %key,
                                field = ?field,
                                "Index value wins"
                            );
                            plan_batch.push(
                                row.id,
                                origin,
                                CellUpdate::copy_of(index_cell, plan_column),
                            );
                            report.plan_cells += 1;
                        }
                        None => {}
                    }
                }
            }

            let written = plan_batch
                .flush(self.service.as_ref(), &mut report.writes)
                .await?;
            fatal_error(written)?;
        }

        let written = index_batch
            .flush(self.service.as_ref(), &mut report.writes)
            .await?;
        fatal_error(written)?;

        tracing::info!(
            warnings = report.warnings,
            plan_cells = report.plan_cells,
            index_cells = report.index_cells,
            rows_in_guard = report.rows_in_guard,
            "Reconciliation finished"
        );
        Ok(report)
    }
}
