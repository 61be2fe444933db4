// Receipt Ledger - Core Library
// Receipt ingestion (recognize → classify → stage) and confirmation into the
// expense ledger. Used by the CLI, the API server, and tests.

pub mod cancel;
pub mod classifier;
pub mod config;
pub mod confirmation;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod recognition;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use cancel::Cancellation;
pub use classifier::{classify, Classification, ReceiptItem};
pub use config::Config;
pub use confirmation::ConfirmationCoordinator;
pub use db::{setup_database, SqliteStore};
pub use error::{Error, Result};
pub use lifecycle::BillLifecycle;
pub use models::{AnalysisResult, Bill, BillStatus, Event, Expense};
pub use recognition::{FixedTextRecognizer, GoogleVisionRecognizer, RecognitionError, Recognizer};
pub use service::{BillService, MAX_UPLOAD_BYTES};
pub use store::{AtomicOutcome, BillFields, DocumentStore, StoreError, StoreOp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
