use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cxr_db_core::{BrowseError, CxrRecord, ImageId, PatientGender, Table, ViewPosition};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const COLUMN_IMAGE_INDEX: &str = "Image Index";
pub const COLUMN_FINDING_LABELS: &str = "Finding Labels";
pub const COLUMN_FOLLOW_UP: &str = "Follow-up #";
pub const COLUMN_PATIENT_ID: &str = "Patient ID";
pub const COLUMN_PATIENT_AGE: &str = "Patient Age";
pub const COLUMN_PATIENT_GENDER: &str = "Patient Gender";
pub const COLUMN_VIEW_POSITION: &str = "View Position";

const REQUIRED_COLUMNS: [&str; 7] = [
    COLUMN_IMAGE_INDEX,
    COLUMN_FINDING_LABELS,
    COLUMN_FOLLOW_UP,
    COLUMN_PATIENT_ID,
    COLUMN_PATIENT_AGE,
    COLUMN_PATIENT_GENDER,
    COLUMN_VIEW_POSITION,
];

const FINDING_SEPARATOR: char = '|';

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Read and parse the metadata file at `path`.
///
/// # Errors
/// Returns [`BrowseError::DataLoad`] when the file cannot be read or any row is malformed.
pub fn load_table(path: &Path) -> Result<Table, BrowseError> {
    let bytes = fs::read(path).map_err(|err| {
        BrowseError::DataLoad(format!("failed to read {}: {err}", path.display()))
    })?;
    let source = String::from_utf8(bytes).map_err(|err| {
        BrowseError::DataLoad(format!("{} is not valid UTF-8: {err}", path.display()))
    })?;
    parse_table(&source, &path.display().to_string())
}

/// Parse metadata rows from CSV text. `origin` names the source in error messages.
///
/// # Errors
/// Returns [`BrowseError::DataLoad`] on missing columns, malformed cells, or
/// duplicate image identifiers.
pub fn parse_table(source: &str, origin: &str) -> Result<Table, BrowseError> {
    let digest = format!("sha256:{:x}", Sha256::digest(source.as_bytes()));
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let rows = split_rows(source).map_err(|err| BrowseError::DataLoad(format!("{origin}: {err}")))?;

    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Err(BrowseError::DataLoad(format!("{origin}: missing header row")));
    };
    let columns = ColumnMap::from_header(&header.fields)
        .map_err(|err| BrowseError::DataLoad(format!("{origin}: {err}")))?;

    let mut records = Vec::new();
    for row in rows {
        let record = columns
            .record(&row)
            .map_err(|err| BrowseError::DataLoad(format!("{origin}:{}: {err}", row.line)))?;
        records.push(record);
    }

    Table::from_records(records, digest)
        .map_err(|err| BrowseError::DataLoad(format!("{origin}: {err}")))
}

/// Strip the trailing unit letter (`058Y` -> 58).
///
/// # Errors
/// Returns a message when the remainder is not an integer.
pub fn parse_age(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    let digits = match trimmed.chars().last() {
        Some(unit) if unit.is_ascii_alphabetic() => &trimmed[..trimmed.len() - 1],
        _ => trimmed,
    };
    digits.parse::<u32>().map_err(|err| format!("invalid age `{raw}`: {err}"))
}

#[must_use]
pub fn split_findings(raw: &str) -> Vec<String> {
    raw.split(FINDING_SEPARATOR)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvRow {
    line: usize,
    fields: Vec<String>,
}

fn split_rows(source: &str) -> Result<Vec<CsvRow>, String> {
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut line = 1_usize;
    let mut row_start = 1_usize;
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            '"' => return Err(format!("line {line}: unexpected quote in unquoted field")),
            ',' => {
                fields.push(std::mem::take(&mut field));
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                finish_row(&mut rows, &mut fields, &mut field, quoted, row_start);
                quoted = false;
                line += 1;
                row_start = line;
            }
            _ if quoted => {
                return Err(format!("line {line}: unexpected character after closing quote"));
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(format!("line {row_start}: unterminated quoted field"));
    }
    finish_row(&mut rows, &mut fields, &mut field, quoted, row_start);
    Ok(rows)
}

fn finish_row(
    rows: &mut Vec<CsvRow>,
    fields: &mut Vec<String>,
    field: &mut String,
    quoted: bool,
    line: usize,
) {
    fields.push(std::mem::take(field));
    let blank = fields.len() == 1 && fields[0].trim().is_empty() && !quoted;
    let fields = std::mem::take(fields);
    if !blank {
        rows.push(CsvRow { line, fields });
    }
}

#[derive(Debug)]
struct ColumnMap {
    width: usize,
    positions: HashMap<&'static str, usize>,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self, String> {
        let mut positions = HashMap::new();
        for column in REQUIRED_COLUMNS {
            let position = header
                .iter()
                .position(|name| name.trim() == column)
                .ok_or_else(|| format!("missing required column `{column}`"))?;
            positions.insert(column, position);
        }
        Ok(Self { width: header.len(), positions })
    }

    fn cell<'a>(&self, row: &'a CsvRow, column: &'static str) -> &'a str {
        self.positions.get(column).map_or("", |position| row.fields[*position].trim())
    }

    fn record(&self, row: &CsvRow) -> Result<CxrRecord, String> {
        if row.fields.len() != self.width {
            return Err(format!("expected {} fields, found {}", self.width, row.fields.len()));
        }

        let image_id = self.cell(row, COLUMN_IMAGE_INDEX);
        if image_id.is_empty() {
            return Err(format!("column `{COLUMN_IMAGE_INDEX}` is empty"));
        }

        let patient_id = self.cell(row, COLUMN_PATIENT_ID);
        let patient_id = patient_id
            .parse::<u64>()
            .map_err(|err| format!("column `{COLUMN_PATIENT_ID}`: invalid `{patient_id}`: {err}"))?;
        let follow_up = self.cell(row, COLUMN_FOLLOW_UP);
        let follow_up = follow_up
            .parse::<u32>()
            .map_err(|err| format!("column `{COLUMN_FOLLOW_UP}`: invalid `{follow_up}`: {err}"))?;
        let age = parse_age(self.cell(row, COLUMN_PATIENT_AGE))
            .map_err(|err| format!("column `{COLUMN_PATIENT_AGE}`: {err}"))?;
        let gender = self.cell(row, COLUMN_PATIENT_GENDER);
        let gender = PatientGender::parse(gender)
            .ok_or_else(|| format!("column `{COLUMN_PATIENT_GENDER}`: unknown value `{gender}`"))?;
        let view_position = self.cell(row, COLUMN_VIEW_POSITION);
        let view_position = ViewPosition::parse(view_position).ok_or_else(|| {
            format!("column `{COLUMN_VIEW_POSITION}`: unknown value `{view_position}`")
        })?;

        Ok(CxrRecord {
            image_id: ImageId::new(image_id),
            patient_id,
            follow_up,
            age,
            gender,
            view_position,
            findings: split_findings(self.cell(row, COLUMN_FINDING_LABELS)),
        })
    }
}

/// Loaded table plus the wall-clock window it stays cached for.
#[derive(Debug, Clone)]
pub struct CachedTable {
    pub table: Arc<Table>,
    pub loaded_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct CacheEntry {
    cached: CachedTable,
    loaded: Instant,
}

/// Time-bounded cache around [`load_table`].
///
/// Entries are replaced only after `ttl` has elapsed; the source file is
/// treated as static. Failed loads are not cached.
#[derive(Debug)]
pub struct TableCache {
    path: PathBuf,
    ttl: Duration,
    entry: RwLock<Option<CacheEntry>>,
}

impl TableCache {
    #[must_use]
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self { path, ttl, entry: RwLock::new(None) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// # Errors
    /// Returns [`BrowseError::DataLoad`] when a (re)load is due and fails.
    pub fn get_or_load(&self) -> Result<Arc<Table>, BrowseError> {
        self.snapshot().map(|cached| cached.table)
    }

    /// # Errors
    /// Returns [`BrowseError::DataLoad`] when a (re)load is due and fails.
    pub fn snapshot(&self) -> Result<CachedTable, BrowseError> {
        if let Some(cached) = self.fresh_entry(&self.entry.read()) {
            tracing::debug!(path = %self.path.display(), "table cache hit");
            return Ok(cached);
        }

        let mut entry = self.entry.write();
        if let Some(cached) = self.fresh_entry(&entry) {
            return Ok(cached);
        }

        let table = Arc::new(load_table(&self.path)?);
        let loaded_at = OffsetDateTime::now_utc();
        let expires_at = time::Duration::try_from(self.ttl)
            .ok()
            .and_then(|ttl| loaded_at.checked_add(ttl));
        tracing::info!(
            path = %self.path.display(),
            rows = table.len(),
            findings = table.vocabulary().len(),
            digest = table.source_digest(),
            "loaded metadata table"
        );

        let cached = CachedTable { table, loaded_at, expires_at };
        *entry = Some(CacheEntry { cached: cached.clone(), loaded: Instant::now() });
        Ok(cached)
    }

    fn fresh_entry(&self, entry: &Option<CacheEntry>) -> Option<CachedTable> {
        entry
            .as_ref()
            .filter(|entry| entry.loaded.elapsed() < self.ttl)
            .map(|entry| entry.cached.clone())
    }
}
