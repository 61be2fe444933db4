// 🧾 Receipt Models - Staging records and ledger entries
// A Bill tracks one receipt from upload to confirmation, an Expense is one
// line item (staged on the bill, then committed to the ledger)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// BILL STATUS
// ============================================================================

/// Lifecycle state of a staging record
///
/// Progression: Uploaded → Processed | Error → Confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Uploaded,
    Processed,
    Confirmed,
    Error,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Uploaded => "uploaded",
            BillStatus::Processed => "processed",
            BillStatus::Confirmed => "confirmed",
            BillStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(BillStatus::Uploaded),
            "processed" => Some(BillStatus::Processed),
            "confirmed" => Some(BillStatus::Confirmed),
            "error" => Some(BillStatus::Error),
            _ => None,
        }
    }

    /// Confirmed is the only terminal success state
    pub fn is_terminal(&self) -> bool {
        matches!(self, BillStatus::Confirmed)
    }
}

impl std::fmt::Display for BillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EXPENSE (staged item / ledger entry)
// ============================================================================

/// One line item. Lives on a bill while staged, in the ledger once confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    /// Stable identity, assigned at processing or confirmation time if absent
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    /// Amount in currency units
    pub amount: f64,

    pub date: DateTime<Utc>,

    /// Nullable while staged, mandatory at confirmation
    #[serde(default)]
    pub category_id: Option<String>,
}

impl Expense {
    /// New uncategorized item with a fresh identifier
    pub fn new(name: impl Into<String>, amount: f64, date: DateTime<Utc>) -> Self {
        Expense {
            id: Some(new_id()),
            name: name.into(),
            amount,
            date,
            category_id: None,
        }
    }

    /// Builder pattern: assign category
    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    /// A blank category reference counts as missing
    pub fn has_category(&self) -> bool {
        self.category_id
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }

    /// Assign an identifier if none is present, returning it
    pub fn ensure_id(&mut self) -> &str {
        if self.id.as_deref().map(str::is_empty).unwrap_or(true) {
            self.id = Some(new_id());
        }
        self.id.as_deref().unwrap_or_default()
    }
}

// ============================================================================
// BILL (staging record)
// ============================================================================

/// Output of recognition + classification, stored on the bill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Raw recognized text, opaque
    pub extracted_text: String,

    /// Declared total, 0 when the classifier found none. Advisory only.
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    #[serde(rename = "_id")]
    pub id: String,

    pub file_name: String,
    pub file_type: String,

    pub upload_date: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_date: Option<DateTime<Utc>>,

    pub status: BillStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<AnalysisResult>,

    /// Staged items, editable between Processed and Confirmed
    #[serde(default)]
    pub generated_expenses: Vec<Expense>,

    /// Why the last processing attempt failed (status = Error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Bill {
    /// Fresh staging record in the Uploaded state
    pub fn new(file_name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Bill {
            id: new_id(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            upload_date: Utc::now(),
            processed_date: None,
            status: BillStatus::Uploaded,
            analysis_results: None,
            generated_expenses: Vec::new(),
            error_message: None,
        }
    }

    pub fn staged_item(&self, expense_id: &str) -> Option<&Expense> {
        self.generated_expenses
            .iter()
            .find(|e| e.id.as_deref() == Some(expense_id))
    }

    /// Sum of staged item amounts (not validated against the declared total)
    pub fn staged_total(&self) -> f64 {
        self.generated_expenses.iter().map(|e| e.amount).sum()
    }
}

// ============================================================================
// EVENT (audit trail)
// ============================================================================

/// One row of the audit trail: every lifecycle transition is an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub bill_id: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, bill_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: new_id(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            bill_id: bill_id.to_string(),
            data,
        }
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
