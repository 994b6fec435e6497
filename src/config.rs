//! Sync configuration
//!
//! Loads per-environment settings from YAML. The file holds one section per
//! environment (`dev`, `staging`, `prod`); column names default to the
//! standard plan/index/push sheet layouts and only need overriding when a
//! sheet deviates.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::NaiveTime;
use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::sheets::model::{SheetId, WorkspaceId};

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "config/plan_sync.yaml";

/// Environment variable overriding the configuration path
pub const CONFIG_PATH_VAR: &str = "PLAN_SYNC_CONFIG";

/// Deployment environment selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Resolve the single command-line argument.
    ///
    /// Returns the environment and, when the argument was not recognised,
    /// the raw value so the caller can warn about it.
    pub fn from_arg(arg: Option<&str>) -> (Self, Option<String>) {
        match arg.map(str::trim) {
            None | Some("") => (Environment::Dev, None),
            Some("--dev" | "-dev" | "-d" | "--debug" | "-debug") => (Environment::Dev, None),
            Some("--staging" | "-staging" | "-s") => (Environment::Staging, None),
            Some("--prod" | "-prod" | "-p") => (Environment::Prod, None),
            Some(other) => (Environment::Dev, Some(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Secret store path of the API token; dev shares the staging secret.
    pub fn secret_path(&self) -> &'static str {
        match self {
            Environment::Dev | Environment::Staging => {
                "staging/smartsheet-data-sync/svc-api-token"
            }
            Environment::Prod => "prod/smartsheet-data-sync/svc-api-token",
        }
    }

    pub fn writes_log_file(&self) -> bool {
        matches!(self, Environment::Dev)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for one environment.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub workspace_ids: Vec<WorkspaceId>,
    pub index_sheet_id: SheetId,
    pub push_sheet_id: SheetId,
    /// Only sheets modified within this window are synced on a regular tick.
    pub lookback_minutes: i64,
    /// Project key used when neither the row nor its parent ticket names one.
    #[serde(default = "default_project_key")]
    pub default_project_key: String,
    /// Fetch only rows modified within the look-back window.
    #[serde(default)]
    pub incremental_rows: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub columns: ColumnNames,
}

fn default_project_key() -> String {
    "PROJ".to_string()
}

impl SyncConfig {
    /// Load the section for `env` from a YAML file.
    pub fn from_file(path: impl AsRef<Path>, env: Environment) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text, env)
    }

    pub fn from_yaml(text: &str, env: Environment) -> Result<Self> {
        let mut sections: HashMap<String, SyncConfig> = serde_yaml::from_str(text)
            .map_err(|e| SyncError::configuration(format!("Invalid configuration: {}", e)))?;
        let config = sections.remove(env.as_str()).ok_or_else(|| {
            SyncError::configuration(format!("No configuration section for '{}'", env))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace_ids.is_empty() {
            return Err(SyncError::configuration("workspace_ids must not be empty"));
        }
        if self.index_sheet_id <= 0 || self.push_sheet_id <= 0 {
            return Err(SyncError::configuration(
                "index_sheet_id and push_sheet_id must be positive",
            ));
        }
        if self.index_sheet_id == self.push_sheet_id {
            return Err(SyncError::configuration(
                "index and push sheets must be different sheets",
            ));
        }
        if self.lookback_minutes <= 0 {
            return Err(SyncError::configuration("lookback_minutes must be positive"));
        }
        if self.scheduler.sync_interval_secs == 0 || self.scheduler.resize_unit_secs == 0 {
            return Err(SyncError::configuration(
                "scheduler intervals must be positive",
            ));
        }
        Ok(())
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lookback_minutes)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Starting interval of the sync job (seconds).
    pub sync_interval_secs: u64,
    /// Runtime tolerance before the interval is resized (seconds).
    pub margin_secs: u64,
    /// Granularity of resized intervals (seconds).
    pub resize_unit_secs: u64,
    /// Daily UTC time of the full sync that ignores the look-back window.
    pub full_sync_at: Option<NaiveTime>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 120,
            margin_secs: 60,
            resize_unit_secs: 60,
            full_sync_at: NaiveTime::from_hms_opt(2, 0, 0),
        }
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent_requests: usize,
    /// Minimum spacing between requests (~300 req/min upstream limit).
    pub min_request_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.smartsheet.com/2.0".to_string(),
            timeout_secs: 30,
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_concurrent_requests: 8,
            min_request_interval_ms: 200,
        }
    }
}

/// Column titles on the three sheet kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub plan: PlanColumns,
    pub index: IndexColumns,
    pub push: PushColumns,
}

/// The fields kept consistent between a plan row and its index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedField {
    Ticket,
    Status,
    Task,
    Assignee,
}

/// A synced field with its column title on each side.
#[derive(Debug, Clone, Copy)]
pub struct FieldPair<'a> {
    pub field: SyncedField,
    pub plan: &'a str,
    pub index: &'a str,
}

impl ColumnNames {
    /// Link-set and reconcile-set: ticket, status, task, assignee.
    pub fn synced_fields(&self) -> [FieldPair<'_>; 4] {
        [
            FieldPair {
                field: SyncedField::Ticket,
                plan: &self.plan.ticket,
                index: &self.index.ticket,
            },
            FieldPair {
                field: SyncedField::Status,
                plan: &self.plan.ticket_status,
                index: &self.index.ticket_status,
            },
            FieldPair {
                field: SyncedField::Task,
                plan: &self.plan.task,
                index: &self.index.task,
            },
            FieldPair {
                field: SyncedField::Assignee,
                plan: &self.plan.assignee,
                index: &self.index.assignee,
            },
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanColumns {
    pub uuid: String,
    pub task: String,
    pub ticket: String,
    pub ticket_status: String,
    pub assignee: String,
    pub summary: String,
    pub team: String,
    pub initiative: String,
    pub program: String,
    pub issue_type: String,
    pub parent_ticket: String,
    pub parent_issue_type: String,
    pub project_key: String,
    pub inject: String,
    pub ktlo: String,
}

impl Default for PlanColumns {
    fn default() -> Self {
        Self {
            uuid: "UUID".to_string(),
            task: "Tasks".to_string(),
            ticket: "Jira Ticket".to_string(),
            ticket_status: "Jira Status".to_string(),
            assignee: "Assigned To".to_string(),
            summary: "Summary".to_string(),
            team: "Team".to_string(),
            initiative: "Initiative".to_string(),
            program: "Program".to_string(),
            issue_type: "Issue Type".to_string(),
            parent_ticket: "Parent Ticket".to_string(),
            parent_issue_type: "Parent Issue Type".to_string(),
            project_key: "Project Key".to_string(),
            inject: "Inject".to_string(),
            ktlo: "KTLO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexColumns {
    pub uuid: String,
    pub task: String,
    pub ticket: String,
    pub ticket_status: String,
    pub assignee: String,
}

impl Default for IndexColumns {
    fn default() -> Self {
        Self {
            uuid: "UUID".to_string(),
            task: "Tasks".to_string(),
            ticket: "Jira Ticket".to_string(),
            ticket_status: "Jira Status".to_string(),
            assignee: "Assignee".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushColumns {
    pub uuid: String,
    pub task: String,
    pub ticket: String,
    pub issue_type: String,
    pub project_key: String,
    pub components: String,
    pub labels: String,
    pub epic_name: String,
    pub epic_link: String,
    pub issue_links: String,
    pub sync_status: String,
}

impl Default for PushColumns {
    fn default() -> Self {
        Self {
            uuid: "UUID".to_string(),
            task: "Tasks".to_string(),
            ticket: "Jira Ticket".to_string(),
            issue_type: "Issue Type".to_string(),
            project_key: "Project Key".to_string(),
            components: "Components".to_string(),
            labels: "Labels".to_string(),
            epic_name: "Epic Name".to_string(),
            epic_link: "Epic Link".to_string(),
            issue_links: "Issue Links".to_string(),
            sync_status: "Sync Status".to_string(),
        }
    }
}
