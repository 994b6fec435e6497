//! plan-sync - Smartsheet plan sheet synchronisation
//!
//! Keeps user-maintained plan sheets coherent with a central index sheet that
//! mirrors tickets in an external issue tracker.
//!
//! ## Tick
//! Each scheduled tick runs one pass:
//! Discovery -> Snapshots -> Identifiers -> Ticket pipeline -> Links -> Reconcile
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plan_sync::config::{Environment, SyncConfig};
//! use plan_sync::sheets::SmartsheetClient;
//! use plan_sync::sync::Orchestrator;
//!
//! # async fn run() -> plan_sync::error::Result<()> {
//! let config = SyncConfig::from_file("config/plan_sync.yaml", Environment::Dev)?;
//! let client = Arc::new(SmartsheetClient::from_env(&config.client)?);
//! let orchestrator = Orchestrator::new(client, config);
//! orchestrator.initialize().await?;
//! let report = orchestrator.tick(None).await?;
//! println!("{} rows written", report.rows_written);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Configuration, logging and credentials
pub mod config;
pub mod logging;
pub mod secrets;

// Spreadsheet service access
pub mod sheets;

// Sync engine components
pub mod sync;

// Job dispatch
pub mod scheduler;

pub mod util;

pub use config::{Environment, SyncConfig};
pub use error::{ErrorKind, Result, SyncError};
pub use scheduler::{Job, ResizePolicy, Scheduler, Trigger};
pub use sync::{Orchestrator, SyncJob, TickReport};
