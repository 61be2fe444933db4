// 🔎 Text Classifier - Recognized receipt text → line items + declared total
//
// Best-effort streaming heuristic over lines. Known limitations:
// - an item name with no price line right after it is dropped
// - layouts that put all names first and all prices after are misparsed
// - the declared total is never checked against the item sum

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// One (name, price) pair pulled from the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub name: String,
    pub price: f64,
}

impl ReceiptItem {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        ReceiptItem {
            name: name.into(),
            price,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Items in input order
    pub items: Vec<ReceiptItem>,

    /// Last price line that could not be attached to an item, 0 if none
    pub declared_total: f64,

    /// Running sum of flushed item prices
    pub items_total: f64,
}

// ============================================================================
// LINE PATTERNS
// ============================================================================

/// Letter first, then letters, digits, spaces or slashes
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9\s/]+").expect("valid regex"))
}

/// Optional currency symbol, `<digits>.<two digits>`, anything after is dropped
fn price_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[$€£¥]?(\d+\.\d{2})").expect("valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineKind {
    Name,
    Price(f64),
    Other,
}

fn classify_line(line: &str) -> LineKind {
    if name_pattern().is_match(line) {
        return LineKind::Name;
    }

    price_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(LineKind::Price)
        .unwrap_or(LineKind::Other)
}

// ============================================================================
// STREAMING ACCUMULATOR
// ============================================================================

#[derive(Debug, Default)]
struct Candidate {
    name: Option<String>,
    price: Option<f64>,
}

impl Candidate {
    /// Complete = named and priced with a non-zero amount
    fn take_complete(&mut self) -> Option<ReceiptItem> {
        match (&self.name, self.price) {
            (Some(name), Some(price)) if price != 0.0 => {
                let item = ReceiptItem::new(name.clone(), price);
                *self = Candidate::default();
                Some(item)
            }
            _ => None,
        }
    }
}

/// Split recognized text into line items and a declared total
///
/// A price line attaches to the current item if it is named and not yet
/// priced; otherwise it is taken as the declared total (last one wins).
pub fn classify(raw_text: &str) -> Classification {
    let mut result = Classification::default();
    let mut current = Candidate::default();

    for line in raw_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match classify_line(line) {
            LineKind::Name => {
                if let Some(item) = current.take_complete() {
                    result.items_total += item.price;
                    result.items.push(item);
                }
                current = Candidate {
                    name: Some(line.to_string()),
                    price: None,
                };
            }
            LineKind::Price(price) => {
                if current.name.is_some() && current.price.is_none() {
                    current.price = Some(price);
                } else {
                    result.declared_total = price;
                }
            }
            LineKind::Other => {}
        }
    }

    if let Some(item) = current.take_complete() {
        result.items_total += item.price;
        result.items.push(item);
    }

    result
}

// ============================================================================
// TESTS
// ============================================================================
