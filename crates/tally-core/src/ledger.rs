// Ledger domain types and input validation
//
// LedgerRecord is the row stored in the spreadsheet-backed ledger. All
// mutations are keyed by the immutable record_id, never by row position.
// Validation happens here so the executor can reject bad input before any
// backend write.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TallyError};
use crate::turn::TurnOrigin;

/// Maximum accepted amount (IDR)
pub const MAX_AMOUNT: f64 = 100_000_000.0;

/// Default currency when a draft does not name one
pub const DEFAULT_CURRENCY: &str = "IDR";

const MAX_MEMO_LEN: usize = 100;
const MAX_NOTES_LEN: usize = 500;
const MIN_YEAR: i32 = 2020;
const MAX_YEAR: i32 = 2030;

// Characters stripped from free-text fields before they reach the sheet
static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>"'=;]"#).expect("static regex"));

/// Fixed expense category set
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Category {
    Food,
    #[serde(rename = "Health & Wellness")]
    HealthWellness,
    Snack,
    #[serde(rename = "Bills & Utilities")]
    BillsUtilities,
    Entertainment,
    Transport,
    Education,
    Charity,
    Shopping,
}

impl Category {
    /// All categories, in display order
    pub const ALL: [Category; 9] = [
        Category::Food,
        Category::HealthWellness,
        Category::Snack,
        Category::BillsUtilities,
        Category::Entertainment,
        Category::Transport,
        Category::Education,
        Category::Charity,
        Category::Shopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Food => "Food",
            Category::HealthWellness => "Health & Wellness",
            Category::Snack => "Snack",
            Category::BillsUtilities => "Bills & Utilities",
            Category::Entertainment => "Entertainment",
            Category::Transport => "Transport",
            Category::Education => "Education",
            Category::Charity => "Charity",
            Category::Shopping => "Shopping",
        }
    }

    /// Parse a category name, case-insensitively
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| {
                TallyError::invalid(format!(
                    "Invalid category '{}'. Must be one of: {}",
                    trimmed,
                    Category::ALL.map(|c| c.as_str()).join(", ")
                ))
            })
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One expense transaction row in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Stable identifier, assigned at creation, never reused
    pub record_id: Uuid,

    /// Item name, e.g. "Yogurt"
    pub memo: String,

    /// Amount in `currency` units
    pub amount: f64,

    /// ISO-ish currency code, e.g. "IDR"
    pub currency: String,

    pub category: Category,

    /// Optional free-text note
    pub notes: String,

    /// Transaction date
    pub occurred_at: NaiveDate,

    /// Which producer created the record
    pub created_by_origin: TurnOrigin,

    pub created_at: DateTime<Utc>,
}

/// Input for creating a ledger record, prior to validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordDraft {
    pub memo: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub category: String,
    /// MM/DD/YYYY; defaults to today when absent
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated draft, ready to become a LedgerRecord
#[derive(Debug, Clone)]
pub struct ValidDraft {
    pub memo: String,
    pub amount: f64,
    pub currency: String,
    pub category: Category,
    pub notes: String,
    pub occurred_at: NaiveDate,
}

impl RecordDraft {
    /// Validate and sanitize the draft. `today` is injected so notification
    /// replays stay deterministic under test.
    pub fn validate(&self, today: NaiveDate) -> Result<ValidDraft> {
        let memo = sanitize_text(&self.memo, MAX_MEMO_LEN, "Name")?;

        if !self.amount.is_finite() {
            return Err(TallyError::invalid("Amount must be a number"));
        }
        if self.amount <= 0.0 {
            return Err(TallyError::invalid("Amount must be positive"));
        }
        if self.amount > MAX_AMOUNT {
            return Err(TallyError::invalid(format!(
                "Amount exceeds maximum limit ({MAX_AMOUNT:.0} {DEFAULT_CURRENCY})"
            )));
        }

        let category = Category::parse(&self.category)?;

        let occurred_at = match self.date.as_deref() {
            Some(s) if !s.trim().is_empty() => parse_sheet_date(s)?,
            _ => today,
        };

        let notes = match self.notes.as_deref() {
            Some(n) if n.len() > MAX_NOTES_LEN => {
                return Err(TallyError::invalid(format!(
                    "Notes must be {MAX_NOTES_LEN} characters or less"
                )));
            }
            Some(n) => UNSAFE_CHARS.replace_all(n, "").trim().to_string(),
            None => String::new(),
        };

        Ok(ValidDraft {
            memo,
            amount: self.amount,
            currency: self
                .currency
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            category,
            notes,
            occurred_at,
        })
    }
}

/// Field-level changes for an update; absent fields are left untouched.
/// Applying the same changes twice yields the same record (last-write-wins
/// per field), which is what makes update retries safe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordChanges {
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// MM/DD/YYYY
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.memo.is_none()
            && self.amount.is_none()
            && self.currency.is_none()
            && self.category.is_none()
            && self.date.is_none()
            && self.notes.is_none()
    }

    /// Validate the changes and apply them to `record`, returning the merged
    /// record. Pure so the executor can retry overwrites safely.
    pub fn apply_to(&self, record: &LedgerRecord) -> Result<LedgerRecord> {
        let mut merged = record.clone();

        if let Some(memo) = &self.memo {
            merged.memo = sanitize_text(memo, MAX_MEMO_LEN, "Name")?;
        }
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount <= 0.0 {
                return Err(TallyError::invalid("Amount must be positive"));
            }
            if amount > MAX_AMOUNT {
                return Err(TallyError::invalid(format!(
                    "Amount exceeds maximum limit ({MAX_AMOUNT:.0} {DEFAULT_CURRENCY})"
                )));
            }
            merged.amount = amount;
        }
        if let Some(currency) = &self.currency {
            if currency.trim().is_empty() {
                return Err(TallyError::invalid("Currency must not be empty"));
            }
            merged.currency = currency.trim().to_string();
        }
        if let Some(category) = &self.category {
            merged.category = Category::parse(category)?;
        }
        if let Some(date) = &self.date {
            merged.occurred_at = parse_sheet_date(date)?;
        }
        if let Some(notes) = &self.notes {
            if notes.len() > MAX_NOTES_LEN {
                return Err(TallyError::invalid(format!(
                    "Notes must be {MAX_NOTES_LEN} characters or less"
                )));
            }
            merged.notes = UNSAFE_CHARS.replace_all(notes, "").trim().to_string();
        }

        Ok(merged)
    }
}

/// Filter for query/summarize and for resolving relative references
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring match on memo
    #[serde(default)]
    pub memo_contains: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Exact amount, for follow-ups like "the one for 15000"
    #[serde(default)]
    pub amount: Option<f64>,
    /// MM/DD/YYYY, inclusive
    #[serde(default)]
    pub date_from: Option<String>,
    /// MM/DD/YYYY, inclusive
    #[serde(default)]
    pub date_to: Option<String>,
}

impl RecordFilter {
    /// Parse the string fields into a matchable form
    pub fn compile(&self) -> Result<CompiledFilter> {
        Ok(CompiledFilter {
            memo_contains: self
                .memo_contains
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_lowercase()),
            category: self
                .category
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| Category::parse(s))
                .transpose()?,
            amount: self.amount,
            date_from: self
                .date_from
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(parse_sheet_date)
                .transpose()?,
            date_to: self
                .date_to
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(parse_sheet_date)
                .transpose()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.memo_contains.is_none()
            && self.category.is_none()
            && self.amount.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }
}

/// A RecordFilter with dates and category parsed
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    pub memo_contains: Option<String>,
    pub category: Option<Category>,
    pub amount: Option<f64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl CompiledFilter {
    pub fn matches(&self, record: &LedgerRecord) -> bool {
        if let Some(needle) = &self.memo_contains {
            if !record.memo.to_lowercase().contains(needle) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(amount) = self.amount {
            if (record.amount - amount).abs() > 0.005 {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if record.occurred_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if record.occurred_at > to {
                return false;
            }
        }
        true
    }
}

/// Aggregate over a set of ledger records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub count: usize,
    pub total_amount: f64,
    pub currency: String,
    pub by_category: BTreeMap<Category, f64>,
}

impl LedgerSummary {
    pub fn from_records(records: &[LedgerRecord]) -> Self {
        let mut by_category: BTreeMap<Category, f64> = BTreeMap::new();
        let mut total = 0.0;
        for record in records {
            total += record.amount;
            *by_category.entry(record.category).or_insert(0.0) += record.amount;
        }
        Self {
            count: records.len(),
            total_amount: total,
            currency: records
                .first()
                .map(|r| r.currency.clone())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            by_category,
        }
    }
}

/// Parse MM/DD/YYYY and enforce the accepted year range
pub fn parse_sheet_date(s: &str) -> Result<NaiveDate> {
    let date = NaiveDate::parse_from_str(s.trim(), "%m/%d/%Y").map_err(|_| {
        TallyError::invalid(format!(
            "Date must be in MM/DD/YYYY format (e.g., 01/15/2025), got '{}'",
            s.trim()
        ))
    })?;
    let year = chrono::Datelike::year(&date);
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(TallyError::invalid(format!(
            "Date must be between {MIN_YEAR} and {MAX_YEAR}"
        )));
    }
    Ok(date)
}

/// Format a date the way the sheet stores it
pub fn format_sheet_date(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// Render an amount without trailing noise: whole numbers plain, else 2dp
pub fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{amount:.0}")
    } else {
        format!("{amount:.2}")
    }
}

fn sanitize_text(raw: &str, max_len: usize, field: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(TallyError::invalid(format!("{field} is required")));
    }
    if raw.len() > max_len {
        return Err(TallyError::invalid(format!(
            "{field} must be {max_len} characters or less"
        )));
    }
    let cleaned = UNSAFE_CHARS.replace_all(raw, "").trim().to_string();
    if cleaned.is_empty() {
        return Err(TallyError::invalid(format!(
            "{field} contains only invalid characters"
        )));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 5).unwrap()
    }

    #[test]
    fn draft_defaults_date_and_currency() {
        let draft = RecordDraft {
            memo: "Yogurt".into(),
            amount: 15_000.0,
            category: "Food".into(),
            ..Default::default()
        };
        let valid = draft.validate(today()).unwrap();
        assert_eq!(valid.occurred_at, today());
        assert_eq!(valid.currency, DEFAULT_CURRENCY);
        assert_eq!(valid.category, Category::Food);
    }

    #[test]
    fn draft_rejects_bad_amounts() {
        let mut draft = RecordDraft {
            memo: "Yogurt".into(),
            amount: -5.0,
            category: "Food".into(),
            ..Default::default()
        };
        assert!(draft.validate(today()).is_err());

        draft.amount = MAX_AMOUNT + 1.0;
        assert!(draft.validate(today()).is_err());
    }

    #[test]
    fn draft_rejects_unknown_category() {
        let draft = RecordDraft {
            memo: "Yogurt".into(),
            amount: 10.0,
            category: "Gadgets".into(),
            ..Default::default()
        };
        let err = draft.validate(today()).unwrap_err();
        assert!(matches!(err, TallyError::InvalidInput(_)));
    }

    #[test]
    fn draft_sanitizes_memo() {
        let draft = RecordDraft {
            memo: "soap <script>'".into(),
            amount: 10.0,
            category: "Shopping".into(),
            ..Default::default()
        };
        let valid = draft.validate(today()).unwrap();
        assert_eq!(valid.memo, "soap script");
    }

    #[test]
    fn date_parsing_bounds() {
        assert!(parse_sheet_date("11/04/2025").is_ok());
        assert!(parse_sheet_date("11/04/2019").is_err());
        assert!(parse_sheet_date("2025-11-04").is_err());
    }

    #[test]
    fn category_parse_is_case_insensitive() {
        assert_eq!(Category::parse("food").unwrap(), Category::Food);
        assert_eq!(
            Category::parse("health & wellness").unwrap(),
            Category::HealthWellness
        );
        assert!(Category::parse("unknown").is_err());
    }

    #[test]
    fn changes_apply_is_idempotent() {
        let record = LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: "soap".into(),
            amount: 15_000.0,
            currency: "IDR".into(),
            category: Category::Shopping,
            notes: String::new(),
            occurred_at: today(),
            created_by_origin: TurnOrigin::Chat,
            created_at: Utc::now(),
        };
        let changes = RecordChanges {
            amount: Some(20_000.0),
            ..Default::default()
        };
        let once = changes.apply_to(&record).unwrap();
        let twice = changes.apply_to(&once).unwrap();
        assert_eq!(once.amount, 20_000.0);
        assert_eq!(twice.amount, once.amount);
        assert_eq!(twice.memo, once.memo);
    }

    #[test]
    fn filter_matches_by_all_fields() {
        let record = LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: "Fried Rice".into(),
            amount: 50.0,
            currency: "IDR".into(),
            category: Category::Food,
            notes: String::new(),
            occurred_at: today(),
            created_by_origin: TurnOrigin::Notification,
            created_at: Utc::now(),
        };
        let filter = RecordFilter {
            memo_contains: Some("rice".into()),
            category: Some("Food".into()),
            date_from: Some("11/01/2025".into()),
            date_to: Some("11/30/2025".into()),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(filter.matches(&record));

        let miss = RecordFilter {
            memo_contains: Some("soap".into()),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(!miss.matches(&record));
    }

    #[test]
    fn summary_totals_by_category() {
        let mk = |memo: &str, amount: f64, category: Category| LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: memo.into(),
            amount,
            currency: "IDR".into(),
            category,
            notes: String::new(),
            occurred_at: today(),
            created_by_origin: TurnOrigin::Chat,
            created_at: Utc::now(),
        };
        let records = vec![
            mk("a", 10.0, Category::Food),
            mk("b", 5.0, Category::Food),
            mk("c", 7.0, Category::Transport),
        ];
        let summary = LedgerSummary::from_records(&records);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total_amount, 22.0);
        assert_eq!(summary.by_category[&Category::Food], 15.0);
        assert_eq!(summary.by_category[&Category::Transport], 7.0);
    }
}
