use std::fmt;

use regex::{Regex, RegexBuilder};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{BursarError, Result};
use crate::models::bad_key;

// ---------------------------------------------------------------------------
// Provider kinds — enum dispatch for the default narrative rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    MpesaPaybill,
    BankTransfer,
}

pub const ALL_PROVIDERS: &[ProviderKind] = &[ProviderKind::MpesaPaybill, ProviderKind::BankTransfer];

impl ProviderKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::MpesaPaybill => "mpesa_paybill",
            Self::BankTransfer => "bank_transfer",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MpesaPaybill => "M-Pesa Paybill",
            Self::BankTransfer => "Bank Transfer",
        }
    }

    /// Whether the M-Pesa token heuristics (provider ref, 254 mobile) apply.
    pub fn uses_mpesa_heuristics(&self) -> bool {
        matches!(self, Self::MpesaPaybill)
    }
}

pub fn get_by_key(key: &str) -> Option<ProviderKind> {
    ALL_PROVIDERS.iter().find(|p| p.key() == key).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
    Pipe,
}

impl Delimiter {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Comma => "comma",
            Self::Semicolon => "semicolon",
            Self::Tab => "tab",
            Self::Pipe => "pipe",
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            Self::Comma => b',',
            Self::Semicolon => b';',
            Self::Tab => b'\t',
            Self::Pipe => b'|',
        }
    }

    /// Accepts either the key or the literal character.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "comma" | "," => Some(Self::Comma),
            "semicolon" | ";" => Some(Self::Semicolon),
            "tab" | "\t" | "\\t" => Some(Self::Tab),
            "pipe" | "|" => Some(Self::Pipe),
            _ => None,
        }
    }
}

/// Where a field lives in a row: a zero-based position, or a header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnLocator {
    Index(usize),
    Name(String),
}

impl ColumnLocator {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<usize>() {
            Ok(i) => Self::Index(i),
            Err(_) => Self::Name(raw.to_string()),
        }
    }
}

impl fmt::Display for ColumnLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: i64,
    pub school_id: i64,
    pub bank_name: String,
    pub pattern_name: String,
    pub provider: ProviderKind,
    pub date_column: ColumnLocator,
    pub amount_column: ColumnLocator,
    pub narrative_column: ColumnLocator,
    pub reference_column: Option<ColumnLocator>,
    pub student_id_regex: Option<String>,
    pub provider_ref_regex: Option<String>,
    pub mobile_regex: Option<String>,
    pub date_format: String,
    pub has_header: bool,
    pub delimiter: Delimiter,
    pub encoding: String,
    pub is_active: bool,
}

/// Fields an operator supplies when registering a pattern.
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub school_id: i64,
    pub bank_name: String,
    pub pattern_name: String,
    pub provider: ProviderKind,
    pub date_column: String,
    pub amount_column: String,
    pub narrative_column: String,
    pub reference_column: Option<String>,
    pub student_id_regex: Option<String>,
    pub provider_ref_regex: Option<String>,
    pub mobile_regex: Option<String>,
    pub date_format: String,
    pub has_header: bool,
    pub delimiter: Delimiter,
    pub encoding: String,
}

/// Compiled narrative rules for one pattern. Built once per upload.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub provider: ProviderKind,
    pub student_id: Option<Regex>,
    pub provider_ref: Option<Regex>,
    pub mobile: Option<Regex>,
}

impl ExtractionRules {
    pub fn has_custom_rules(&self) -> bool {
        self.student_id.is_some() || self.provider_ref.is_some() || self.mobile.is_some()
    }
}

fn compile(raw: Option<&str>, case_insensitive: bool) -> Result<Option<Regex>> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => Ok(Some(RegexBuilder::new(r).case_insensitive(case_insensitive).build()?)),
        None => Ok(None),
    }
}

impl Pattern {
    pub fn rules(&self) -> Result<ExtractionRules> {
        Ok(ExtractionRules {
            provider: self.provider,
            student_id: compile(self.student_id_regex.as_deref(), true)?,
            provider_ref: compile(self.provider_ref_regex.as_deref(), false)?,
            mobile: compile(self.mobile_regex.as_deref(), false)?,
        })
    }
}

const PATTERN_COLUMNS: &str = "id, school_id, bank_name, pattern_name, provider, date_column, amount_column, \
     narrative_column, reference_column, student_id_regex, provider_ref_regex, mobile_regex, \
     date_format, has_header, delimiter, encoding, is_active";

fn pattern_from_row(row: &Row) -> rusqlite::Result<Pattern> {
    let provider: String = row.get(4)?;
    let delimiter: String = row.get(14)?;
    let reference: Option<String> = row.get(8)?;
    Ok(Pattern {
        id: row.get(0)?,
        school_id: row.get(1)?,
        bank_name: row.get(2)?,
        pattern_name: row.get(3)?,
        provider: get_by_key(&provider).ok_or_else(|| bad_key(4, &provider))?,
        date_column: ColumnLocator::parse(&row.get::<_, String>(5)?),
        amount_column: ColumnLocator::parse(&row.get::<_, String>(6)?),
        narrative_column: ColumnLocator::parse(&row.get::<_, String>(7)?),
        reference_column: reference
            .filter(|r| !r.trim().is_empty())
            .map(|r| ColumnLocator::parse(&r)),
        student_id_regex: row.get(9)?,
        provider_ref_regex: row.get(10)?,
        mobile_regex: row.get(11)?,
        date_format: row.get(12)?,
        has_header: row.get(13)?,
        delimiter: Delimiter::from_key(&delimiter).ok_or_else(|| bad_key(14, &delimiter))?,
        encoding: row.get(15)?,
        is_active: row.get(16)?,
    })
}

fn validate(new: &NewPattern) -> Result<()> {
    for (label, value) in [
        ("bank name", &new.bank_name),
        ("pattern name", &new.pattern_name),
        ("date column", &new.date_column),
        ("amount column", &new.amount_column),
        ("narrative column", &new.narrative_column),
        ("date format", &new.date_format),
    ] {
        if value.trim().is_empty() {
            return Err(BursarError::InvalidPattern(format!("{label} is required")));
        }
    }
    for (label, raw) in [
        ("student id regex", &new.student_id_regex),
        ("provider reference regex", &new.provider_ref_regex),
        ("mobile regex", &new.mobile_regex),
    ] {
        if let Some(r) = raw.as_deref().filter(|r| !r.trim().is_empty()) {
            Regex::new(r).map_err(|e| BursarError::InvalidPattern(format!("{label}: {e}")))?;
        }
    }
    if encoding_rs::Encoding::for_label(new.encoding.trim().as_bytes()).is_none() {
        return Err(BursarError::InvalidPattern(format!("unknown encoding: {}", new.encoding)));
    }
    Ok(())
}

fn blank_to_none(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub fn add_pattern(conn: &Connection, new: &NewPattern) -> Result<i64> {
    validate(new)?;
    if !crate::store::school_exists(conn, new.school_id)? {
        return Err(BursarError::UnknownSchool(new.school_id));
    }
    conn.execute(
        "INSERT INTO patterns (school_id, bank_name, pattern_name, provider, date_column, amount_column, \
         narrative_column, reference_column, student_id_regex, provider_ref_regex, mobile_regex, \
         date_format, has_header, delimiter, encoding) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            new.school_id,
            new.bank_name.trim(),
            new.pattern_name.trim(),
            new.provider.key(),
            new.date_column.trim(),
            new.amount_column.trim(),
            new.narrative_column.trim(),
            blank_to_none(&new.reference_column),
            blank_to_none(&new.student_id_regex),
            blank_to_none(&new.provider_ref_regex),
            blank_to_none(&new.mobile_regex),
            new.date_format,
            new.has_header,
            new.delimiter.key(),
            new.encoding.trim(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_pattern(conn: &Connection, pattern_id: i64) -> Result<Pattern> {
    let sql = format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1");
    conn.query_row(&sql, [pattern_id], pattern_from_row)
        .optional()?
        .ok_or(BursarError::UnknownPattern(pattern_id))
}

/// Resolve a pattern usable for an upload in `school_id`.
pub fn active_pattern(conn: &Connection, school_id: i64, pattern_id: i64) -> Result<Pattern> {
    let pattern = get_pattern(conn, pattern_id)?;
    if pattern.school_id != school_id {
        return Err(BursarError::UnknownPattern(pattern_id));
    }
    if !pattern.is_active {
        return Err(BursarError::InactivePattern(pattern_id));
    }
    Ok(pattern)
}

pub fn list_patterns(conn: &Connection, school_id: i64) -> Result<Vec<Pattern>> {
    let sql = format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns WHERE school_id = ?1 ORDER BY bank_name, pattern_name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([school_id], pattern_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn deactivate_pattern(conn: &Connection, school_id: i64, pattern_id: i64) -> Result<()> {
    let n = conn.execute(
        "UPDATE patterns SET is_active = 0, updated_at = datetime('now') WHERE id = ?1 AND school_id = ?2",
        rusqlite::params![pattern_id, school_id],
    )?;
    if n == 0 {
        return Err(BursarError::UnknownPattern(pattern_id));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn mpesa_pattern(school_id: i64) -> NewPattern {
    NewPattern {
        school_id,
        bank_name: "Equity Bank".to_string(),
        pattern_name: "Paybill export".to_string(),
        provider: ProviderKind::MpesaPaybill,
        date_column: "Date".to_string(),
        amount_column: "Amount".to_string(),
        narrative_column: "Narrative".to_string(),
        reference_column: None,
        student_id_regex: None,
        provider_ref_regex: None,
        mobile_regex: None,
        date_format: "%Y-%m-%d".to_string(),
        has_header: true,
        delimiter: Delimiter::Comma,
        encoding: "utf-8".to_string(),
    }
}
