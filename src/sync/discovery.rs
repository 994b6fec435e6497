//! Plan sheet discovery.
//!
//! Walks workspaces breadth-first (workspace → folder → subfolder) and keeps
//! the sheets modified since a cut-off.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::sheets::model::{FolderContents, FolderId, SheetId, SheetSummary, WorkspaceId};
use crate::sheets::SheetService;

use super::tolerate;

pub struct Discovery {
    service: Arc<dyn SheetService>,
    workspace_ids: Vec<WorkspaceId>,
    excluded: Vec<SheetId>,
}

impl Discovery {
    /// `excluded` are sheets that are never plan sheets (index, push).
    pub fn new(
        service: Arc<dyn SheetService>,
        workspace_ids: Vec<WorkspaceId>,
        excluded: Vec<SheetId>,
    ) -> Self {
        Self {
            service,
            workspace_ids,
            excluded,
        }
    }

    /// Sorted, deduplicated plan sheet ids modified at or after `since`;
    /// every sheet when `since` is `None`.
    pub async fn discover(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SheetId>> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<FolderId> = VecDeque::new();
        let mut visited: HashSet<FolderId> = HashSet::new();

        for &workspace_id in &self.workspace_ids {
            let listing = self.service.list_workspace(workspace_id).await;
            let Some(listing) = tolerate(listing, "List workspace")? else {
                continue;
            };
            self.collect(&listing, since, &mut found, &mut queue);
        }

        while let Some(folder_id) = queue.pop_front() {
            if !visited.insert(folder_id) {
                continue;
            }
            let listing = self.service.list_folder(folder_id).await;
            let Some(listing) = tolerate(listing, "List folder")? else {
                continue;
            };
            self.collect(&listing, since, &mut found, &mut queue);
        }

        for excluded in &self.excluded {
            found.remove(excluded);
        }

        tracing::info!(
            sheets = found.len(),
            workspaces = self.workspace_ids.len(),
            folders = visited.len(),
            full = since.is_none(),
            "Discovered plan sheets"
        );
        Ok(found.into_iter().collect())
    }

    fn collect(
        &self,
        listing: &FolderContents,
        since: Option<DateTime<Utc>>,
        found: &mut BTreeSet<SheetId>,
        queue: &mut VecDeque<FolderId>,
    ) {
        found.extend(
            listing
                .sheets
                .iter()
                .filter(|s| modified_since(s, since))
                .map(|s| s.id),
        );
        queue.extend(listing.folders.iter().map(|f| f.id));
    }
}

fn modified_since(sheet: &SheetSummary, since: Option<DateTime<Utc>>) -> bool {
    match (since, sheet.modified_at) {
        (Some(since), Some(modified)) => modified >= since,
        _ => true,
    }
}
