//! Classification of the plan ticket field.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static TICKET_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]+-\d+$").expect("valid ticket key regex"));

/// Marker written while a ticket is being created.
pub const PENDING: &str = "Pending…";
const PENDING_ASCII: &str = "Pending...";
/// Marker a user writes to request creation.
pub const CREATE: &str = "Create";
/// Substring the tracker puts into its failure status.
pub const SYNC_ERROR_MARKER: &str = "reasonPhrase";

/// Text written into a plan ticket cell whose ticket the index lacks.
pub fn unknown_ticket_warning(ticket: &str) -> String {
    format!(
        "[WARNING]; {} not found in the index sheet. Check the ticket key.",
        ticket
    )
}

pub fn is_ticket_key(text: &str) -> bool {
    TICKET_KEY.is_match(text.trim())
}

/// Project prefix of a ticket key (`ABC-12` → `ABC`).
pub fn project_prefix(key: &str) -> Option<&str> {
    let key = key.trim();
    if !is_ticket_key(key) {
        return None;
    }
    key.split_once('-').map(|(prefix, _)| prefix)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ticket {
    Empty,
    Create,
    Pending,
    Key(String),
    SyncError(String),
    Other(String),
}

impl Ticket {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ticket::Empty;
        };
        if text.eq_ignore_ascii_case(CREATE) {
            Ticket::Create
        } else if text == PENDING || text == PENDING_ASCII {
            Ticket::Pending
        } else if is_ticket_key(text) {
            Ticket::Key(text.to_string())
        } else if text.contains(SYNC_ERROR_MARKER) {
            Ticket::SyncError(text.to_string())
        } else {
            Ticket::Other(text.to_string())
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Ticket::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Ticket::Pending)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ticket::Empty => Ok(()),
            Ticket::Create => f.write_str(CREATE),
            Ticket::Pending => f.write_str(PENDING),
            Ticket::Key(text) | Ticket::SyncError(text) | Ticket::Other(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentinels() {
        assert_eq!(Ticket::parse(None), Ticket::Empty);
        assert_eq!(Ticket::parse(Some("  ")), Ticket::Empty);
        assert_eq!(Ticket::parse(Some("create")), Ticket::Create);
        assert_eq!(Ticket::parse(Some("CREATE")), Ticket::Create);
        assert_eq!(Ticket::parse(Some("Pending…")), Ticket::Pending);
        assert_eq!(Ticket::parse(Some("Pending...")), Ticket::Pending);
        assert_eq!(
            Ticket::parse(Some(" ABC-12 ")),
            Ticket::Key("ABC-12".to_string())
        );
        assert_eq!(
            Ticket::parse(Some("reasonPhrase: Bad Request")),
            Ticket::SyncError("reasonPhrase: Bad Request".to_string())
        );
        assert!(matches!(
            Ticket::parse(Some(&unknown_ticket_warning("XYZ-999"))),
            Ticket::Other(_)
        ));
    }

    #[test]
    fn test_ticket_key_pattern() {
        assert!(is_ticket_key("abc-1"));
        assert!(!is_ticket_key("ABC1"));
        assert!(!is_ticket_key("AB1-2"));
        assert!(!is_ticket_key("ABC-"));
        assert_eq!(project_prefix("DATA-77"), Some("DATA"));
        assert_eq!(project_prefix("Create"), None);
    }

    #[test]
    fn test_display_round_trips_pending() {
        assert_eq!(Ticket::Pending.to_string(), PENDING);
        assert_eq!(Ticket::parse(Some(&Ticket::Pending.to_string())), Ticket::Pending);
    }
}
