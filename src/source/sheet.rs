//! Flat tabular export provider.
//!
//! Reads three tables (memberships, check-ins, payments) from either a
//! published CSV URL or a local file. Local workbooks (.xlsx/.xls/.xlsm/.ods)
//! are read with calamine; date cells are passed through as spreadsheet
//! serial numbers so the normalizer's serial-date path handles them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use url::Url;

use super::{
    ensure_success, fingerprint, send_with_retry, FetchWindow, RawBatch, RawRecord, RetryPolicy,
    SourceAdapter, SourceError, TabularRow,
};
use crate::types::SheetSourceConfig;

/// Where one table lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLocation {
    Url(Url),
    File(PathBuf),
}

impl TableLocation {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw)
                .map_err(|e| SourceError::Configuration(format!("Invalid table URL {}: {}", raw, e)))?;
            return Ok(TableLocation::Url(url));
        }
        let path = PathBuf::from(raw);
        if !path.exists() {
            return Err(SourceError::Configuration(format!(
                "Table file not found: {}",
                path.display()
            )));
        }
        Ok(TableLocation::File(path))
    }

    fn describe(&self) -> String {
        match self {
            TableLocation::Url(url) => url.to_string(),
            TableLocation::File(path) => path.display().to_string(),
        }
    }
}

pub struct SheetSource {
    client: reqwest::Client,
    members: TableLocation,
    visits: TableLocation,
    payments: Option<TableLocation>,
    retry: RetryPolicy,
}

impl SheetSource {
    pub fn new(config: &SheetSourceConfig, retry: RetryPolicy) -> Result<Self, SourceError> {
        Ok(Self {
            client: reqwest::Client::new(),
            members: TableLocation::parse(&config.members)?,
            visits: TableLocation::parse(&config.visits)?,
            payments: config
                .payments
                .as_deref()
                .map(TableLocation::parse)
                .transpose()?,
            retry,
        })
    }

    async fn load_table(&self, location: &TableLocation) -> Result<Vec<RawRecord>, SourceError> {
        let rows = match location {
            TableLocation::Url(url) => {
                let response =
                    send_with_retry(self.client.get(url.clone()), &self.retry).await?;
                let text = ensure_success(response).await?.text().await?;
                parse_csv(&text)
            }
            TableLocation::File(path) if is_workbook(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_workbook(&path))
                    .await
                    .map_err(|e| SourceError::Decode(format!("Workbook reader panicked: {}", e)))??
            }
            TableLocation::File(path) => {
                let text = tokio::fs::read_to_string(path).await?;
                parse_csv(&text)
            }
        };
        log::debug!("Loaded {} rows from {}", rows.len(), location.describe());
        Ok(rows.into_iter().map(RawRecord::Tabular).collect())
    }
}

#[async_trait]
impl SourceAdapter for SheetSource {
    fn identity(&self) -> String {
        let payments = self
            .payments
            .as_ref()
            .map(TableLocation::describe)
            .unwrap_or_default();
        fingerprint(&[
            "sheet",
            &self.members.describe(),
            &self.visits.describe(),
            &payments,
        ])
    }

    async fn fetch(&self, _window: FetchWindow) -> Result<RawBatch, SourceError> {
        // Exports are always full tables; windowing happens in the normalizer.
        let payments = async {
            match &self.payments {
                Some(location) => self.load_table(location).await,
                None => Ok(Vec::new()),
            }
        };
        let (members, visits, payments) = tokio::try_join!(
            self.load_table(&self.members),
            self.load_table(&self.visits),
            payments
        )?;

        log::info!(
            "Sheet export: {} membership rows, {} visit rows, {} payment rows",
            members.len(),
            visits.len(),
            payments.len()
        );

        Ok(RawBatch {
            members,
            visits,
            payments,
            skipped: 0,
        })
    }
}

fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "xlsx" | "xls" | "xlsm" | "ods"))
        .unwrap_or(false)
}

/// Parse CSV text with a header row into rows.
///
/// Quoted fields may contain commas, doubled quotes and line breaks. Blank
/// lines are skipped.
pub fn parse_csv(text: &str) -> Vec<TabularRow> {
    let mut records = split_records(text.trim_start_matches('\u{feff}')).into_iter();
    let headers: Vec<String> = match records.next() {
        Some(h) => h.into_iter().map(|c| c.trim().to_string()).collect(),
        None => return Vec::new(),
    };

    records
        .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
        .map(|r| TabularRow::from_cells(&headers, r.into_iter().map(|c| c.trim().to_string()).collect()))
        .collect()
}

fn split_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    records
}

/// Read the first worksheet of a local workbook.
pub fn read_workbook(path: &Path) -> Result<Vec<TabularRow>, SourceError> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook = open_workbook_auto(path)?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| SourceError::Decode(format!("{} has no worksheets", path.display())))?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(header) => header.iter().map(cell_to_string).collect(),
        None => return Ok(Vec::new()),
    };

    Ok(rows
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
        .map(|cells| TabularRow::from_cells(&headers, cells))
        .collect())
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(_) => String::new(),
        Data::DateTime(dt) => format!("{}", dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}
