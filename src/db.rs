// 🗄️ SQLite Document Store - bills (staging), expenses (ledger), events (audit)
//
// Bills are stored as documents: scalar columns for what we filter on, JSON
// for the analysis result and staged items.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::models::{AnalysisResult, Bill, BillStatus, Event, Expense};
use crate::store::{AtomicOutcome, BillFields, DocumentStore, StoreError, StoreOp};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // ==========================================================================
    // Bills Table (staging records)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bills (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            file_type TEXT NOT NULL,
            upload_date TEXT NOT NULL,
            processed_date TEXT,
            status TEXT NOT NULL,
            analysis_results TEXT,
            generated_expenses TEXT NOT NULL DEFAULT '[]',
            error_message TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Expenses Table (ledger)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            date TEXT NOT NULL,
            category_id TEXT NOT NULL,
            bill_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            bill_id TEXT NOT NULL,
            data TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_bill ON expenses(bill_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_bill ON events(bill_id, timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW CODECS
// ============================================================================

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", value, e)))
}

/// Raw bill columns, decoded outside the rusqlite row closure
struct BillRow {
    id: String,
    file_name: String,
    file_type: String,
    upload_date: String,
    processed_date: Option<String>,
    status: String,
    analysis_results: Option<String>,
    generated_expenses: String,
    error_message: Option<String>,
}

impl BillRow {
    const COLUMNS: &'static str = "id, file_name, file_type, upload_date, processed_date,
        status, analysis_results, generated_expenses, error_message";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(BillRow {
            id: row.get(0)?,
            file_name: row.get(1)?,
            file_type: row.get(2)?,
            upload_date: row.get(3)?,
            processed_date: row.get(4)?,
            status: row.get(5)?,
            analysis_results: row.get(6)?,
            generated_expenses: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_bill(self) -> Result<Bill, StoreError> {
        let status = BillStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", self.status)))?;
        let analysis_results: Option<AnalysisResult> = self
            .analysis_results
            .as_deref()
            .map(serde_json::from_str::<AnalysisResult>)
            .transpose()?;

        Ok(Bill {
            upload_date: parse_time(&self.upload_date)?,
            processed_date: self.processed_date.as_deref().map(parse_time).transpose()?,
            status,
            analysis_results,
            generated_expenses: serde_json::from_str(&self.generated_expenses)?,
            error_message: self.error_message,
            id: self.id,
            file_name: self.file_name,
            file_type: self.file_type,
        })
    }
}

fn find_bill_in(conn: &Connection, bill_id: &str) -> Result<Bill, StoreError> {
    let sql = format!("SELECT {} FROM bills WHERE id = ?1", BillRow::COLUMNS);
    conn.query_row(&sql, params![bill_id], BillRow::from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("bill {}", bill_id)))?
        .into_bill()
}

fn write_bill(conn: &Connection, bill: &Bill) -> Result<usize, StoreError> {
    let analysis_json = bill
        .analysis_results
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let expenses_json = serde_json::to_string(&bill.generated_expenses)?;

    let updated = conn.execute(
        "UPDATE bills
         SET status = ?2,
             processed_date = ?3,
             analysis_results = ?4,
             generated_expenses = ?5,
             error_message = ?6
         WHERE id = ?1",
        params![
            bill.id,
            bill.status.as_str(),
            bill.processed_date.map(|dt| dt.to_rfc3339()),
            analysis_json,
            expenses_json,
            bill.error_message,
        ],
    )?;

    Ok(updated)
}

fn update_bill_in(conn: &Connection, bill_id: &str, fields: &BillFields) -> Result<(), StoreError> {
    let mut bill = find_bill_in(conn, bill_id)?;
    fields.apply(&mut bill);
    write_bill(conn, &bill)?;
    Ok(())
}

fn replace_staged_item_in(
    conn: &Connection,
    bill_id: &str,
    expense_id: &str,
    expense: &Expense,
) -> Result<(), StoreError> {
    let mut bill = find_bill_in(conn, bill_id)?;
    let slot = bill
        .generated_expenses
        .iter_mut()
        .find(|e| e.id.as_deref() == Some(expense_id))
        .ok_or_else(|| StoreError::NotFound(format!("expense {} in bill {}", expense_id, bill_id)))?;

    *slot = Expense {
        id: Some(expense_id.to_string()),
        ..expense.clone()
    };
    write_bill(conn, &bill)?;
    Ok(())
}

fn insert_expenses_in(
    conn: &Connection,
    bill_id: Option<&str>,
    expenses: &[Expense],
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO expenses (id, name, amount, date, category_id, bill_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    let mut inserted = 0;
    for expense in expenses {
        let id = expense
            .id
            .as_deref()
            .ok_or_else(|| StoreError::Corrupt(format!("ledger entry {:?} has no id", expense.name)))?;
        let category_id = expense
            .category_id
            .as_deref()
            .ok_or_else(|| StoreError::Corrupt(format!("ledger entry {} has no category", id)))?;

        stmt.execute(params![
            id,
            expense.name,
            expense.amount,
            expense.date.to_rfc3339(),
            category_id,
            bill_id,
        ])?;
        inserted += 1;
    }

    Ok(inserted)
}

fn insert_event_in(conn: &Connection, event: &Event) -> Result<(), StoreError> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, bill_id, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.bill_id,
            data_json,
        ],
    )?;

    Ok(())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Document store over one SQLite connection
///
/// Calls serialize on the connection mutex; separate `SqliteStore`s on the
/// same file serialize on SQLite's write lock (`BEGIN IMMEDIATE`).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Corrupt("connection mutex poisoned".to_string()))
    }
}

impl DocumentStore for SqliteStore {
    fn create_bill(&self, bill: &Bill) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let analysis_json = bill
            .analysis_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let expenses_json = serde_json::to_string(&bill.generated_expenses)?;

        conn.execute(
            "INSERT INTO bills (
                id, file_name, file_type, upload_date, processed_date,
                status, analysis_results, generated_expenses, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                bill.id,
                bill.file_name,
                bill.file_type,
                bill.upload_date.to_rfc3339(),
                bill.processed_date.map(|dt| dt.to_rfc3339()),
                bill.status.as_str(),
                analysis_json,
                expenses_json,
                bill.error_message,
            ],
        )?;

        Ok(())
    }

    fn find_bill(&self, bill_id: &str) -> Result<Bill, StoreError> {
        let conn = self.lock()?;
        find_bill_in(&conn, bill_id)
    }

    fn update_bill(&self, bill_id: &str, fields: &BillFields) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        // read-modify-write must not interleave with another connection
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        update_bill_in(&tx, bill_id, fields)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_expenses(&self, bill_id: Option<&str>, expenses: &[Expense]) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        insert_expenses_in(&conn, bill_id, expenses)
    }

    fn run_atomic(&self, ops: &[StoreOp], cancel: &Cancellation) -> Result<AtomicOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = AtomicOutcome::default();

        // any early return drops `tx`, which rolls back
        for op in ops {
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted);
            }

            match op {
                StoreOp::ExpectStatus { bill_id, allowed } => {
                    let bill = find_bill_in(&tx, bill_id)?;
                    if !allowed.contains(&bill.status) {
                        return Err(StoreError::Conflict(format!(
                            "bill {} is {}",
                            bill_id, bill.status
                        )));
                    }
                }
                StoreOp::InsertExpenses { bill_id, expenses } => {
                    outcome.expenses_inserted += insert_expenses_in(&tx, bill_id.as_deref(), expenses)?;
                }
                StoreOp::UpdateBill { bill_id, fields } => {
                    update_bill_in(&tx, bill_id, fields)?;
                    outcome.bills_updated += 1;
                }
                StoreOp::ReplaceStagedItem {
                    bill_id,
                    expense_id,
                    expense,
                } => {
                    replace_staged_item_in(&tx, bill_id, expense_id, expense)?;
                    outcome.bills_updated += 1;
                }
                StoreOp::AppendEvent(event) => {
                    insert_event_in(&tx, event)?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(StoreError::Interrupted);
        }

        tx.commit()?;
        debug!(ops = ops.len(), ?outcome, "Atomic unit committed");
        Ok(outcome)
    }

    fn expenses_for_bill(&self, bill_id: &str) -> Result<Vec<Expense>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, amount, date, category_id
             FROM expenses
             WHERE bill_id = ?1
             ORDER BY rowid",
        )?;

        let rows = stmt
            .query_map(params![bill_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, amount, date, category_id)| -> Result<Expense, StoreError> {
                Ok(Expense {
                    id: Some(id),
                    name,
                    amount,
                    date: parse_time(&date)?,
                    category_id: Some(category_id),
                })
            })
            .collect()
    }

    fn count_expenses(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))?;
        Ok(count)
    }

    fn events_for_bill(&self, bill_id: &str) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, bill_id, data
             FROM events
             WHERE bill_id = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![bill_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_id, timestamp, event_type, bill_id, data)| -> Result<Event, StoreError> {
                Ok(Event {
                    event_id,
                    timestamp: parse_time(&timestamp)?,
                    event_type,
                    bill_id,
                    data: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }
}
