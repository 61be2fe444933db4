// 🗃️ Document Store - capabilities the lifecycle and confirmation need
//
// Atomic units are lists of plain commands (StoreOp) so callers never hold a
// transaction handle or pass closures into the store.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cancel::Cancellation;
use crate::models::{AnalysisResult, Bill, BillStatus, Event, Expense};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Guard failed or a unique key already exists
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("interrupted")]
    Interrupted,

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored row cannot be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                StoreError::Interrupted
            }
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Database(err),
        }
    }
}

// ============================================================================
// FIELD SET
// ============================================================================

/// Partial update of a bill. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct BillFields {
    pub status: Option<BillStatus>,
    pub processed_date: Option<DateTime<Utc>>,
    pub analysis_results: Option<AnalysisResult>,
    pub generated_expenses: Option<Vec<Expense>>,
    /// `Some(None)` clears the message
    pub error_message: Option<Option<String>>,
}

impl BillFields {
    pub fn status(status: BillStatus) -> Self {
        BillFields {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_expenses(mut self, expenses: Vec<Expense>) -> Self {
        self.generated_expenses = Some(expenses);
        self
    }

    pub fn apply(&self, bill: &mut Bill) {
        if let Some(status) = self.status {
            bill.status = status;
        }
        if let Some(date) = self.processed_date {
            bill.processed_date = Some(date);
        }
        if let Some(analysis) = &self.analysis_results {
            bill.analysis_results = Some(analysis.clone());
        }
        if let Some(expenses) = &self.generated_expenses {
            bill.generated_expenses = expenses.clone();
        }
        if let Some(message) = &self.error_message {
            bill.error_message = message.clone();
        }
    }
}

// ============================================================================
// ATOMIC COMMANDS
// ============================================================================

#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Abort the unit unless the bill exists and has one of these statuses
    ExpectStatus {
        bill_id: String,
        allowed: Vec<BillStatus>,
    },
    /// Append to the ledger; every expense must already carry id + category
    InsertExpenses {
        bill_id: Option<String>,
        expenses: Vec<Expense>,
    },
    UpdateBill {
        bill_id: String,
        fields: BillFields,
    },
    /// Swap one staged item, located by id inside the unit; `NotFound` if absent
    ReplaceStagedItem {
        bill_id: String,
        expense_id: String,
        expense: Expense,
    },
    AppendEvent(Event),
}

/// Outcome of a committed unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomicOutcome {
    pub expenses_inserted: usize,
    pub bills_updated: usize,
}

// ============================================================================
// STORE CAPABILITY
// ============================================================================

pub trait DocumentStore: Send + Sync {
    fn create_bill(&self, bill: &Bill) -> Result<(), StoreError>;

    /// `NotFound` when no bill has this id
    fn find_bill(&self, bill_id: &str) -> Result<Bill, StoreError>;

    /// Single field-set update keyed by id, `NotFound` when no bill matches
    fn update_bill(&self, bill_id: &str, fields: &BillFields) -> Result<(), StoreError>;

    /// Non-transactional ledger insert, returns rows written
    fn insert_expenses(&self, bill_id: Option<&str>, expenses: &[Expense]) -> Result<usize, StoreError>;

    /// All ops commit together or none do
    fn run_atomic(&self, ops: &[StoreOp], cancel: &Cancellation) -> Result<AtomicOutcome, StoreError>;

    fn expenses_for_bill(&self, bill_id: &str) -> Result<Vec<Expense>, StoreError>;

    fn count_expenses(&self) -> Result<i64, StoreError>;

    fn events_for_bill(&self, bill_id: &str) -> Result<Vec<Event>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_apply_only_what_is_set() {
        let mut bill = Bill::new("r.jpg", "image/jpeg");
        bill.error_message = Some("previous failure".to_string());

        let fields = BillFields {
            status: Some(BillStatus::Processed),
            error_message: Some(None),
            ..Default::default()
        };
        fields.apply(&mut bill);

        assert_eq!(bill.status, BillStatus::Processed);
        assert_eq!(bill.error_message, None);
        assert_eq!(bill.file_name, "r.jpg");
        assert!(bill.analysis_results.is_none());
    }

    #[test]
    fn test_interrupted_sqlite_error_maps_to_interrupted() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::Interrupted));

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: expenses.id".to_string()),
        );
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }
}
