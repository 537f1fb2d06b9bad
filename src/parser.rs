use std::rc::Rc;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{BursarError, Result};
use crate::extractor::Extractor;
use crate::models::ParsedTransaction;
use crate::patterns::{ColumnLocator, Pattern};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn statement_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decode statement bytes with the pattern's encoding label, or the encoding
/// named by a byte-order mark. Malformed input or an unknown label falls back
/// to lossy decoding; binary files are rejected.
pub fn decode_statement(bytes: &[u8], label: &str) -> Result<String> {
    let declared = Encoding::for_label(label.trim().as_bytes());
    let resolved = Encoding::for_bom(bytes).map(|(encoding, _)| encoding).or(declared);
    let wide = resolved.is_some_and(|e| e == UTF_16LE || e == UTF_16BE);
    // NUL never appears in single-byte or UTF-8 text
    if !wide && bytes.contains(&0) {
        return Err(BursarError::UndecodableStatement(
            "file contains binary data, expected delimited text".to_string(),
        ));
    }
    let text = match resolved {
        Some(encoding) => {
            let (decoded, used, had_errors) = encoding.decode(bytes);
            if !had_errors {
                decoded.into_owned()
            } else if wide {
                warn!(encoding = used.name(), "statement has malformed UTF-16, replacing bad units");
                decoded.into_owned()
            } else {
                warn!(encoding = used.name(), "statement is not valid for its encoding, decoding lossily");
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
        None => {
            warn!(label, "unknown encoding label, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    };
    Ok(match text.strip_prefix('\u{feff}') {
        Some(rest) => rest.to_string(),
        None => text,
    })
}

/// Strip currency markers and thousands separators. `(500.00)` is negative.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s = raw.trim().trim_matches('"').trim();
    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    let stripped = s.trim_start_matches(|c: char| c.is_alphabetic() || matches!(c, '$' | '£' | '€'));
    if stripped.len() != s.len() {
        s = stripped.trim_start_matches('.').trim();
    }
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value.abs() } else { value })
}

pub fn parse_date(raw: &str, format: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, format).ok().map(|dt| dt.date()))
}

// ---------------------------------------------------------------------------
// Raw rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: usize,
    fields: Vec<String>,
    header: Rc<Vec<String>>,
}

impl RawRow {
    /// Trimmed value at `locator`; empty when the column cannot be resolved.
    pub fn get(&self, locator: &ColumnLocator) -> &str {
        let idx = match locator {
            ColumnLocator::Index(i) => Some(*i),
            ColumnLocator::Name(name) => self.header.iter().position(|h| h.eq_ignore_ascii_case(name.trim())),
        };
        idx.and_then(|i| self.fields.get(i)).map(String::as_str).unwrap_or("")
    }
}

/// Lazy, single-pass iterator over the data rows of a decoded statement.
pub struct StatementRows<'a> {
    records: csv::StringRecordsIntoIter<&'a [u8]>,
    header: Rc<Vec<String>>,
    awaiting_header: bool,
}

pub fn statement_rows<'a>(text: &'a str, pattern: &Pattern) -> StatementRows<'a> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(pattern.delimiter.byte())
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    StatementRows {
        records: reader.into_records(),
        header: Rc::new(Vec::new()),
        awaiting_header: pattern.has_header,
    }
}

impl Iterator for StatementRows<'_> {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        loop {
            let record = match self.records.next()? {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable statement line");
                    continue;
                }
            };
            let fields: Vec<String> = record.iter().map(|f| f.trim().to_string()).collect();
            if fields.iter().all(|f| f.is_empty()) {
                continue;
            }
            if self.awaiting_header {
                self.awaiting_header = false;
                self.header = Rc::new(fields);
                continue;
            }
            if fields.len() < 2 {
                continue;
            }
            let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
            return Some(RawRow {
                line,
                fields,
                header: Rc::clone(&self.header),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Typed conversion
// ---------------------------------------------------------------------------

/// Convert a raw row into a typed transaction. `None` is a parse skip: bad
/// date, bad amount, or a non-positive amount.
pub fn to_transaction(row: &RawRow, pattern: &Pattern, extractor: &Extractor) -> Option<ParsedTransaction> {
    let raw_date = row.get(&pattern.date_column);
    let Some(date) = parse_date(raw_date, &pattern.date_format) else {
        debug!(line = row.line, raw_date, "skipping row: unparseable date");
        return None;
    };
    let raw_amount = row.get(&pattern.amount_column);
    let amount = match parse_amount(raw_amount).map(|a| a.round_dp(2)) {
        Some(a) if a > Decimal::ZERO => a,
        _ => {
            debug!(line = row.line, raw_amount, "skipping row: no positive amount");
            return None;
        }
    };
    let narrative = row.get(&pattern.narrative_column).to_string();
    let details = extractor.extract(&narrative);
    let explicit = pattern.reference_column.as_ref().map(|c| row.get(c));
    let bank_reference = extractor.choose_bank_reference(explicit, &details, &narrative);

    Some(ParsedTransaction {
        line: row.line,
        date,
        amount,
        narrative,
        provider_reference: details.provider_reference,
        mobile_number: details.mobile_number,
        payer_name: details.payer_name,
        student_no: details.student_no,
        bank_reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{Delimiter, ProviderKind};
    use rust_decimal_macros::dec;

    fn pattern() -> Pattern {
        Pattern {
            id: 1,
            school_id: 1,
            bank_name: "Equity Bank".into(),
            pattern_name: "Paybill".into(),
            provider: ProviderKind::MpesaPaybill,
            date_column: ColumnLocator::Name("Date".into()),
            amount_column: ColumnLocator::Name("Amount".into()),
            narrative_column: ColumnLocator::Name("Narrative".into()),
            reference_column: None,
            student_id_regex: None,
            provider_ref_regex: None,
            mobile_regex: None,
            date_format: "%d/%m/%Y".into(),
            has_header: true,
            delimiter: Delimiter::Comma,
            encoding: "utf-8".into(),
            is_active: true,
        }
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,500.00"), Some(dec!(1500.00)));
        assert_eq!(parse_amount("KES 2,000"), Some(dec!(2000)));
        assert_eq!(parse_amount("Ksh.750.50"), Some(dec!(750.50)));
        assert_eq!(parse_amount("(300.00)"), Some(dec!(-300.00)));
        assert_eq!(parse_amount("\"$12.5\""), Some(dec!(12.5)));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("1-2"), None);
    }

    #[test]
    fn test_parse_date_uses_pattern_format() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_date("05/03/2024", "%d/%m/%Y"), Some(d));
        assert_eq!(parse_date("2024-03-05 14:02:11", "%Y-%m-%d %H:%M:%S"), Some(d));
        assert_eq!(parse_date("2024-03-05", "%d/%m/%Y"), None);
    }

    #[test]
    fn test_decode_falls_back_and_strips_bom() {
        let text = decode_statement(b"\xEF\xBB\xBFDate,Amount\n", "utf-8").unwrap();
        assert!(text.starts_with("Date"));
        // 0xE9 is é in windows-1252
        let latin = decode_statement(b"Caf\xE9,1", "latin-1").unwrap();
        assert_eq!(latin, "Café,1");
        let lossy = decode_statement(b"Caf\xE9,1", "utf-8").unwrap();
        assert!(lossy.starts_with("Caf"));
        let unknown = decode_statement(b"a,b", "no-such-charset").unwrap();
        assert_eq!(unknown, "a,b");
    }

    fn utf16le(text: &str, bom: bool) -> Vec<u8> {
        let mut bytes = if bom { vec![0xFF, 0xFE] } else { Vec::new() };
        bytes.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        bytes
    }

    #[test]
    fn test_decode_utf16_statements() {
        let text = "Date,Amount\n01/02/2024,500\n";
        assert_eq!(decode_statement(&utf16le(text, false), "utf-16le").unwrap(), text);
        // A BOM names the encoding even when the label says otherwise
        assert_eq!(decode_statement(&utf16le(text, true), "utf-8").unwrap(), text);

        let be: Vec<u8> = text.encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(decode_statement(&be, "utf-16be").unwrap(), text);
    }

    #[test]
    fn test_decode_rejects_binary() {
        assert!(matches!(
            decode_statement(b"PK\x03\x04\x00\x00", "utf-8"),
            Err(BursarError::UndecodableStatement(_))
        ));
    }

    #[test]
    fn test_rows_skip_header_blank_and_short_lines() {
        let text = "Date,Amount,Narrative\n\n01/02/2024,500,\"MPS 254700000001 QA12BC34DE 1#7 JANE\"\nlonely\n,,\n02/02/2024,250,cash\n";
        let p = pattern();
        let rows: Vec<RawRow> = statement_rows(text, &p).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(&p.amount_column), "500");
        assert_eq!(rows[0].get(&ColumnLocator::Name("narrative".into())), "MPS 254700000001 QA12BC34DE 1#7 JANE");
        assert_eq!(rows[1].get(&ColumnLocator::Index(2)), "cash");
        assert_eq!(rows[1].get(&ColumnLocator::Index(9)), "");
        assert_eq!(rows[1].get(&ColumnLocator::Name("Missing".into())), "");
        assert_eq!(rows[0].line, 3);
    }

    #[test]
    fn test_rows_without_header_use_positions() {
        let mut p = pattern();
        p.has_header = false;
        p.delimiter = Delimiter::Semicolon;
        let rows: Vec<RawRow> = statement_rows("01/02/2024;500;x\n", &p).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&ColumnLocator::Index(1)), "500");
        assert_eq!(rows[0].get(&p.date_column), "");
    }

    #[test]
    fn test_to_transaction() {
        let p = pattern();
        let ex = Extractor::new(p.rules().unwrap()).unwrap();
        let text = "Date,Amount,Narrative\n\
                    01/02/2024,\"1,500.00\",MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL KAGIRI\n\
                    01/02/2024,-200.00,reversal\n\
                    31/02/2024,10,bad date\n";
        let txs: Vec<_> = statement_rows(text, &p)
            .filter_map(|r| to_transaction(&r, &p, &ex))
            .collect();
        assert_eq!(txs.len(), 1);
        let tx = &txs[0];
        assert_eq!(tx.amount, dec!(1500.00));
        assert_eq!(tx.student_no.as_deref(), Some("00001"));
        assert_eq!(tx.provider_reference.as_deref(), Some("TK18K8USG7"));
        assert_eq!(tx.bank_reference.as_deref(), Some("TK18K8USG7"));
        assert_eq!(tx.mobile_number.as_deref(), Some("254721266013"));
    }

    #[test]
    fn test_explicit_reference_column_wins() {
        let mut p = pattern();
        p.reference_column = Some(ColumnLocator::Name("Ref".into()));
        let ex = Extractor::new(p.rules().unwrap()).unwrap();
        let text = "Date,Amount,Narrative,Ref\n01/02/2024,100,MPS TK18K8USG7 1#2,FT24032XYZ\n";
        let tx = statement_rows(text, &p)
            .find_map(|r| to_transaction(&r, &p, &ex))
            .unwrap();
        assert_eq!(tx.bank_reference.as_deref(), Some("FT24032XYZ"));
        assert_eq!(tx.provider_reference.as_deref(), Some("TK18K8USG7"));
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(statement_checksum(b"abc"), statement_checksum(b"abc"));
        assert_ne!(statement_checksum(b"abc"), statement_checksum(b"abd"));
        assert_eq!(statement_checksum(b"").len(), 64);
    }
}
