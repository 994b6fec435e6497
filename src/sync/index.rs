//! Ticket lookup over the index sheet.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::IndexColumns;
use crate::sheets::model::{Row, RowId, SheetId};
use crate::sheets::SheetSnapshot;

use super::ticket::is_ticket_key;

/// Index sheet snapshot plus its ticket and identifier lookups.
#[derive(Debug, Clone)]
pub struct ProjectIndex {
    snapshot: Arc<SheetSnapshot>,
    tickets: HashMap<String, RowId>,
    identifiers: HashMap<String, String>,
}

impl ProjectIndex {
    /// Build lookups from `snapshot`. Tickets are unique; on duplicates the
    /// first row wins.
    pub fn build(snapshot: Arc<SheetSnapshot>, columns: &IndexColumns) -> Self {
        let mut tickets = HashMap::new();
        let mut identifiers = HashMap::new();

        for row in snapshot.rows() {
            let Some(ticket) = snapshot
                .value_by_name(row, &columns.ticket)
                .filter(|t| is_ticket_key(t))
            else {
                continue;
            };
            let key = ticket.to_ascii_uppercase();
            if let Some(first) = tickets.get(&key) {
                tracing::warn!(
                    ticket = %ticket,
                    kept_row = first,
                    duplicate_row = row.id,
                    "Ticket appears on several index rows"
                );
                continue;
            }
            tickets.insert(key, row.id);
            if let Some(identifier) = snapshot.value_by_name(row, &columns.uuid) {
                identifiers.entry(identifier).or_insert(ticket);
            }
        }

        tracing::debug!(
            sheet_id = snapshot.id,
            tickets = tickets.len(),
            identified = identifiers.len(),
            "Index lookup built"
        );

        Self {
            snapshot,
            tickets,
            identifiers,
        }
    }

    pub fn snapshot(&self) -> &Arc<SheetSnapshot> {
        &self.snapshot
    }

    pub fn sheet_id(&self) -> SheetId {
        self.snapshot.id
    }

    pub fn row_id(&self, ticket: &str) -> Option<RowId> {
        self.tickets.get(&ticket.trim().to_ascii_uppercase()).copied()
    }

    pub fn row(&self, ticket: &str) -> Option<&Row> {
        self.row_id(ticket).and_then(|id| self.snapshot.row(id))
    }

    /// Ticket of the index row carrying `identifier`.
    pub fn ticket_for(&self, identifier: &str) -> Option<&str> {
        self.identifiers.get(identifier).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::model::{Cell, Column, Sheet};
    use serde_json::json;

    fn row(id: RowId, ticket: &str, uuid: Option<&str>) -> Row {
        let mut cells = vec![Cell {
            column_id: 1,
            value: Some(json!(ticket)),
            ..Default::default()
        }];
        if let Some(uuid) = uuid {
            cells.push(Cell {
                column_id: 2,
                value: Some(json!(uuid)),
                ..Default::default()
            });
        }
        Row {
            id,
            cells,
            ..Default::default()
        }
    }

    fn index(rows: Vec<Row>) -> ProjectIndex {
        let sheet = Sheet {
            id: 99,
            name: "Index".to_string(),
            columns: vec![
                Column {
                    id: 1,
                    title: "Jira Ticket".to_string(),
                    ..Default::default()
                },
                Column {
                    id: 2,
                    title: "UUID".to_string(),
                    ..Default::default()
                },
            ],
            rows,
            modified_at: None,
        };
        ProjectIndex::build(
            Arc::new(SheetSnapshot::from_sheet(sheet)),
            &IndexColumns::default(),
        )
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let index = index(vec![row(5, "ABC-1", Some("1-2-3-4"))]);
        assert_eq!(index.row_id("abc-1"), Some(5));
        assert_eq!(index.ticket_for("1-2-3-4"), Some("ABC-1"));
        assert_eq!(index.row_id("ABC-2"), None);
    }

    #[test]
    fn test_duplicate_ticket_first_row_wins() {
        let index = index(vec![
            row(5, "ABC-1", None),
            row(6, "ABC-1", Some("1-2-3-4")),
            row(7, "not a key", None),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.row_id("ABC-1"), Some(5));
        assert_eq!(index.ticket_for("1-2-3-4"), None);
    }
}
