//! Shared application state for the ledger server.

use std::sync::Arc;

use harness::io::ledger::SqliteLedger;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The ledger; every call opens its own SQLite connection.
    pub ledger: Arc<SqliteLedger>,
}

impl AppState {
    pub fn new(ledger: SqliteLedger) -> Self {
        Self {
            ledger: Arc::new(ledger),
        }
    }
}
