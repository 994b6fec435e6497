//! Linked-cell installer.
//!
//! Plan rows holding a ticket key get their ticket, status, task and assignee
//! cells sourced from the matching index row, so the spreadsheet service
//! keeps them current between ticks.

use std::sync::Arc;

use crate::config::ColumnNames;
use crate::error::Result;
use crate::sheets::model::{CellLinkRef, CellUpdate};
use crate::sheets::{LinkDirection, LinkState, SheetService, SheetSnapshot};

use super::index::ProjectIndex;
use super::ticket::Ticket;
use super::{fatal_error, UpdateBatch, WriteTally};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub linked: usize,
    pub unlinked_broken: usize,
    pub writes: WriteTally,
}

/// Link cells to install on `snapshot`, plus (linked, broken) cell counts.
pub fn plan_links(
    snapshot: &SheetSnapshot,
    index: &ProjectIndex,
    columns: &ColumnNames,
) -> (UpdateBatch, usize, usize) {
    let mut batch = UpdateBatch::new(snapshot.id);
    let (mut linked, mut broken) = (0, 0);
    let index_sheet = index.snapshot();

    let pairs: Vec<_> = columns
        .synced_fields()
        .into_iter()
        .filter_map(|pair| {
            Some((
                snapshot.column_id(pair.plan)?,
                index_sheet.column_id(pair.index)?,
            ))
        })
        .collect();
    if pairs.is_empty() {
        return (batch, 0, 0);
    }

    for row in snapshot.rows() {
        if snapshot.is_summary(row, &columns.plan.summary) {
            continue;
        }
        let ticket = Ticket::parse(snapshot.value_by_name(row, &columns.plan.ticket).as_deref());
        let Some(index_row) = ticket.key().and_then(|key| index.row_id(key)) else {
            continue;
        };

        for &(plan_column, index_column) in &pairs {
            let cell = row.cell(plan_column);
            let state = cell
                .map(|c| snapshot.link_state(c, LinkDirection::In))
                .unwrap_or(LinkState::NoValue);
            let update = match state {
                LinkState::Ok => continue,
                LinkState::Unlinked | LinkState::Invalid | LinkState::NoValue => {
                    linked += 1;
                    CellUpdate::link(
                        plan_column,
                        CellLinkRef {
                            sheet_id: index_sheet.id,
                            row_id: index_row,
                            column_id: index_column,
                        },
                    )
                }
                LinkState::Broken => {
                    broken += 1;
                    CellUpdate::copy_of(cell, plan_column)
                }
            };
            batch.push(row.id, (snapshot.id, row.id), update);
        }
    }
    (batch, linked, broken)
}

pub struct FieldLinker {
    service: Arc<dyn SheetService>,
    columns: ColumnNames,
}

impl FieldLinker {
    pub fn new(service: Arc<dyn SheetService>, columns: ColumnNames) -> Self {
        Self { service, columns }
    }

    /// One batch per plan sheet.
    pub async fn link(
        &self,
        plans: &[Arc<SheetSnapshot>],
        index: &ProjectIndex,
    ) -> Result<LinkReport> {
        let mut report = LinkReport::default();
        for snapshot in plans {
            let (batch, linked, broken) = plan_links(snapshot, index, &self.columns);
            if batch.is_empty() {
                continue;
            }
            tracing::debug!(
                sheet_id = snapshot.id,
                rows = batch.len(),
                linked,
                broken,
                "Installing linked cells"
            );
            let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
            if written.is_complete() {
                report.linked += linked;
                report.unlinked_broken += broken;
            }
            fatal_error(written)?;
        }
        Ok(report)
    }
}
