//! Spreadsheet service access: wire model, HTTP client, in-memory service
//! and per-sheet snapshots.

pub mod client;
pub mod memory;
pub mod model;
pub mod snapshot;

pub use client::{RetryPolicy, SheetService, SmartsheetClient};
pub use memory::InMemorySheets;
pub use snapshot::{LinkDirection, LinkState, SheetSnapshot};
