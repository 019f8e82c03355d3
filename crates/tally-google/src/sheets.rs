// Sheets LedgerBackend implementation
//
// The spreadsheet is a generic tabular store: column A holds the record id,
// and the executor on top of this backend is what enforces id uniqueness and
// idempotency. Row lookups always go through the id column, never a
// remembered row index, so concurrent mutations cannot corrupt a neighbor.
//
// Row layout (header in row 1):
//   record_id | memo | amount | currency | category | date | notes | origin | created_at

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use tally_core::ledger::{format_sheet_date, parse_sheet_date, Category};
use tally_core::{LedgerBackend, LedgerRecord, RecordFilter, Result, TallyError, TurnOrigin};

use crate::auth::TokenProvider;

const DEFAULT_API_URL: &str = "https://sheets.googleapis.com/v4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const COLUMNS: u32 = 9;

/// Sheets-backed expense ledger
#[derive(Clone)]
pub struct SheetsLedger {
    client: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    api_url: String,
    spreadsheet_id: String,
    sheet_name: String,
    /// Numeric sheet id (gid) needed by row-deletion requests
    sheet_gid: i64,
}

impl SheetsLedger {
    pub fn new(
        token: Arc<dyn TokenProvider>,
        spreadsheet_id: impl Into<String>,
        sheet_name: impl Into<String>,
        sheet_gid: i64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            api_url: DEFAULT_API_URL.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
            sheet_gid,
        }
    }

    /// Point at a different endpoint (for tests and proxies)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// All data rows with their 1-based sheet row numbers
    async fn read_rows(&self) -> Result<Vec<(u32, LedgerRecord)>> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}",
            self.api_url, self.spreadsheet_id, self.sheet_name
        );
        let body: ValuesResponse = self.request_json(self.client.get(&url)).await?;

        let mut rows = Vec::new();
        for (index, row) in body.values.into_iter().enumerate().skip(1) {
            let row_number = (index + 1) as u32;
            match parse_row(&row) {
                Some(record) => rows.push((row_number, record)),
                None => {
                    warn!(row_number, "Skipping unparseable ledger row");
                }
            }
        }
        Ok(rows)
    }

    async fn find_row(&self, record_id: Uuid) -> Result<Option<(u32, LedgerRecord)>> {
        let id = record_id.to_string();
        Ok(self
            .read_rows()
            .await?
            .into_iter()
            .find(|(_, record)| record.record_id.to_string() == id))
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let token = self.token.bearer_token().await?;
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TallyError::transient_write(format!("sheets request: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TallyError::config(format!("sheets auth failed: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TallyError::transient_write(format!(
                "sheets API {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TallyError::transient_write(format!("sheets response: {e}")))
    }
}

#[async_trait]
impl LedgerBackend for SheetsLedger {
    async fn insert(&self, record: &LedgerRecord) -> Result<()> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}:append",
            self.api_url, self.spreadsheet_id, self.sheet_name
        );
        let _: Value = self
            .request_json(
                self.client
                    .post(&url)
                    .query(&[("valueInputOption", "RAW")])
                    .json(&json!({ "values": [row_for_record(record)] })),
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, record_id: Uuid) -> Result<Option<LedgerRecord>> {
        Ok(self.find_row(record_id).await?.map(|(_, record)| record))
    }

    async fn overwrite(&self, record: &LedgerRecord) -> Result<bool> {
        let Some((row_number, _)) = self.find_row(record.record_id).await? else {
            return Ok(false);
        };

        let range = format!("{}!A{row_number}:I{row_number}", self.sheet_name);
        let url = format!(
            "{}/spreadsheets/{}/values/{}",
            self.api_url, self.spreadsheet_id, range
        );
        let _: Value = self
            .request_json(
                self.client
                    .put(&url)
                    .query(&[("valueInputOption", "RAW")])
                    .json(&json!({ "values": [row_for_record(record)] })),
            )
            .await?;
        Ok(true)
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool> {
        let Some((row_number, _)) = self.find_row(record_id).await? else {
            return Ok(false);
        };

        let url = format!(
            "{}/spreadsheets/{}:batchUpdate",
            self.api_url, self.spreadsheet_id
        );
        let _: Value = self
            .request_json(self.client.post(&url).json(&json!({
                "requests": [{
                    "deleteDimension": {
                        "range": {
                            "sheetId": self.sheet_gid,
                            "dimension": "ROWS",
                            "startIndex": row_number - 1,
                            "endIndex": row_number
                        }
                    }
                }]
            })))
            .await?;
        Ok(true)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<LedgerRecord>> {
        let compiled = filter.compile()?;
        let mut records: Vec<LedgerRecord> = self
            .read_rows()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| compiled.matches(record))
            .collect();
        records.sort_by_key(|r| (r.occurred_at, r.created_at));
        Ok(records)
    }
}

fn row_for_record(record: &LedgerRecord) -> Vec<String> {
    vec![
        record.record_id.to_string(),
        record.memo.clone(),
        record.amount.to_string(),
        record.currency.clone(),
        record.category.to_string(),
        format_sheet_date(record.occurred_at),
        record.notes.clone(),
        record.created_by_origin.to_string(),
        record.created_at.to_rfc3339(),
    ]
}

fn parse_row(row: &[String]) -> Option<LedgerRecord> {
    if row.len() < COLUMNS as usize {
        return None;
    }

    Some(LedgerRecord {
        record_id: Uuid::from_str(row[0].trim()).ok()?,
        memo: row[1].clone(),
        amount: row[2].trim().parse().ok()?,
        currency: row[3].clone(),
        category: Category::parse(&row[4]).ok()?,
        occurred_at: parse_sheet_date(&row[5]).ok()?,
        notes: row[6].clone(),
        created_by_origin: TurnOrigin::from(row[7].as_str()),
        created_at: DateTime::parse_from_rfc3339(row[8].trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()?,
    })
}

#[derive(Debug, Default, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_record() -> LedgerRecord {
        LedgerRecord {
            record_id: Uuid::now_v7(),
            memo: "Yogurt".into(),
            amount: 15_000.0,
            currency: "IDR".into(),
            category: Category::Food,
            notes: "weekly".into(),
            occurred_at: NaiveDate::from_ymd_opt(2025, 11, 4).unwrap(),
            created_by_origin: TurnOrigin::Chat,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn row_round_trips() {
        let record = sample_record();
        let row = row_for_record(&record);
        let parsed = parse_row(&row).unwrap();

        assert_eq!(parsed.record_id, record.record_id);
        assert_eq!(parsed.memo, record.memo);
        assert_eq!(parsed.amount, record.amount);
        assert_eq!(parsed.category, record.category);
        assert_eq!(parsed.occurred_at, record.occurred_at);
        assert_eq!(parsed.created_by_origin, record.created_by_origin);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        // Too short
        assert!(parse_row(&["abc".to_string()]).is_none());

        // Bad uuid
        let mut row = row_for_record(&sample_record());
        row[0] = "not-a-uuid".into();
        assert!(parse_row(&row).is_none());

        // Bad amount
        let mut row = row_for_record(&sample_record());
        row[2] = "lots".into();
        assert!(parse_row(&row).is_none());
    }

    #[test]
    fn header_rows_do_not_parse() {
        let header: Vec<String> = [
            "record_id", "memo", "amount", "currency", "category", "date", "notes", "origin",
            "created_at",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert!(parse_row(&header).is_none());
    }
}
