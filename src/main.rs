use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use receipt_ledger::{
    classify, Bill, BillService, Cancellation, Config, FixedTextRecognizer,
    GoogleVisionRecognizer, Recognizer, SqliteStore,
};

const USAGE: &str = "\
Usage: receipt-ledger <command>

  upload <image>                                   recognize with Google Vision and stage items
  upload-text <text-file>                          stage items from an already transcribed receipt
  classify <text-file>                             print the items found in a text file
  show <bill-id>                                   print a bill and its staged items
  set-category <bill-id> <expense-id> <category>   categorize one staged item
  confirm <bill-id> <category>                     confirm, using <category> for uncategorized items
  history <bill-id>                                print the audit trail of a bill";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let arg = |i: usize| arg_at(&args, i);

    let config = Config::from_env()?;

    match args.first().map(String::as_str) {
        Some("upload") => run_upload(&config, arg(1)?),
        Some("upload-text") => run_upload_text(&config, arg(1)?),
        Some("classify") => run_classify(arg(1)?),
        Some("show") => run_show(&config, arg(1)?),
        Some("set-category") => run_set_category(&config, arg(1)?, arg(2)?, arg(3)?),
        Some("confirm") => run_confirm(&config, arg(1)?, arg(2)?),
        Some("history") => run_history(&config, arg(1)?),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn arg_at(args: &[String], i: usize) -> Result<&str> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument\n\n{}", USAGE))
}

fn open_service(config: &Config, recognizer: Arc<dyn Recognizer>) -> Result<BillService> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    Ok(BillService::new(Arc::new(store), recognizer))
}

/// Recognizer for commands that never process images
fn offline_service(config: &Config) -> Result<BillService> {
    open_service(config, Arc::new(FixedTextRecognizer::new("")))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn guess_file_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn run_upload(config: &Config, image_path: &str) -> Result<()> {
    let api_key = config
        .vision_api_key
        .as_deref()
        .ok_or_else(|| anyhow!("VISION_API_KEY is not set (use upload-text for transcribed receipts)"))?;
    let recognizer =
        GoogleVisionRecognizer::new(&config.vision_endpoint, api_key, config.recognition_timeout)?;

    let path = Path::new(image_path);
    let image = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let service = open_service(config, Arc::new(recognizer))?;
    let bill = service.upload_bill(
        &file_name_of(path),
        guess_file_type(path),
        &image,
        &Cancellation::with_timeout(config.request_timeout),
    )?;

    print_bill(&bill);
    Ok(())
}

fn run_upload_text(config: &Config, text_path: &str) -> Result<()> {
    let path = Path::new(text_path);
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let service = open_service(config, Arc::new(FixedTextRecognizer::new(text.clone())))?;
    let bill = service.upload_bill(
        &file_name_of(path),
        guess_file_type(path),
        text.as_bytes(),
        &Cancellation::new(),
    )?;

    print_bill(&bill);
    Ok(())
}

fn run_classify(text_path: &str) -> Result<()> {
    let text = fs::read_to_string(text_path).with_context(|| format!("Failed to read {}", text_path))?;
    let result = classify(&text);

    for item in &result.items {
        println!("{:<40} {:>10.2}", item.name, item.price);
    }
    println!("{}", "-".repeat(51));
    println!("{:<40} {:>10.2}", "Items", result.items_total);
    println!("{:<40} {:>10.2}", "Declared total", result.declared_total);
    Ok(())
}

fn run_show(config: &Config, bill_id: &str) -> Result<()> {
    let service = offline_service(config)?;
    let bill = service.get_bill(bill_id)?;
    print_bill(&bill);

    let ledger = service.ledger_for_bill(bill_id)?;
    if !ledger.is_empty() {
        println!("\nLedger entries: {}", ledger.len());
    }
    Ok(())
}

fn run_set_category(config: &Config, bill_id: &str, expense_id: &str, category: &str) -> Result<()> {
    let service = offline_service(config)?;
    let bill = service.get_bill(bill_id)?;
    let item = bill
        .staged_item(expense_id)
        .cloned()
        .ok_or_else(|| anyhow!("No staged item {} in bill {}", expense_id, bill_id))?;

    let bill = service.update_staged_item(
        bill_id,
        expense_id,
        item.with_category(category),
        &Cancellation::new(),
    )?;

    print_bill(&bill);
    Ok(())
}

fn run_confirm(config: &Config, bill_id: &str, category: &str) -> Result<()> {
    let service = offline_service(config)?;
    let bill = service.get_bill(bill_id)?;
    if bill.generated_expenses.is_empty() {
        bail!("Bill {} has no staged items to confirm", bill_id);
    }

    let expenses = bill
        .generated_expenses
        .into_iter()
        .map(|e| if e.has_category() { e } else { e.with_category(category) })
        .collect();

    let outcome = service.confirm_expenses(bill_id, expenses, &Cancellation::new())?;
    println!("✓ Confirmed {} expenses from bill {}", outcome.expenses_inserted, bill_id);
    Ok(())
}

fn run_history(config: &Config, bill_id: &str) -> Result<()> {
    let service = offline_service(config)?;
    for event in service.bill_history(bill_id)? {
        println!("{}  {:<20} {}", event.timestamp.to_rfc3339(), event.event_type, event.data);
    }
    Ok(())
}

fn print_bill(bill: &Bill) {
    println!("Bill {}  [{}]  {} ({})", bill.id, bill.status, bill.file_name, bill.file_type);
    if let Some(message) = &bill.error_message {
        println!("  error: {}", message);
    }
    for expense in &bill.generated_expenses {
        println!(
            "  {}  {:<32} {:>10.2}  {}",
            expense.id.as_deref().unwrap_or("-"),
            expense.name,
            expense.amount,
            expense.category_id.as_deref().unwrap_or("(uncategorized)")
        );
    }
    if let Some(analysis) = &bill.analysis_results {
        println!("  declared total: {:.2}  staged sum: {:.2}", analysis.total, bill.staged_total());
    }
}
