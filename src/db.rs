use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schools (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    student_no TEXT NOT NULL,
    full_name TEXT NOT NULL,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (school_id, student_no),
    FOREIGN KEY (school_id) REFERENCES schools(id)
);

CREATE TABLE IF NOT EXISTS student_fees (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    term TEXT NOT NULL,
    amount_charged TEXT NOT NULL,
    amount_paid TEXT NOT NULL DEFAULT '0.00',
    is_paid INTEGER DEFAULT 0,
    due_date TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (school_id) REFERENCES schools(id),
    FOREIGN KEY (student_id) REFERENCES students(id)
);

CREATE TABLE IF NOT EXISTS receivables (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    fee_id INTEGER NOT NULL UNIQUE,
    amount_due TEXT NOT NULL,
    amount_paid TEXT NOT NULL,
    due_date TEXT NOT NULL,
    is_cleared INTEGER DEFAULT 0,
    cleared_at TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (student_id) REFERENCES students(id),
    FOREIGN KEY (fee_id) REFERENCES student_fees(id)
);

CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    bank_name TEXT NOT NULL,
    pattern_name TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT 'mpesa_paybill',
    date_column TEXT NOT NULL,
    amount_column TEXT NOT NULL,
    narrative_column TEXT NOT NULL,
    reference_column TEXT,
    student_id_regex TEXT,
    provider_ref_regex TEXT,
    mobile_regex TEXT,
    date_format TEXT NOT NULL DEFAULT '%Y-%m-%d',
    has_header INTEGER DEFAULT 1,
    delimiter TEXT NOT NULL DEFAULT 'comma',
    encoding TEXT NOT NULL DEFAULT 'utf-8',
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    UNIQUE (school_id, bank_name, pattern_name),
    FOREIGN KEY (school_id) REFERENCES schools(id)
);

CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    pattern_id INTEGER,
    file_name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'processing',
    total INTEGER DEFAULT 0,
    matched INTEGER DEFAULT 0,
    unmatched INTEGER DEFAULT 0,
    duplicate INTEGER DEFAULT 0,
    error_message TEXT,
    uploaded_by TEXT,
    uploaded_at TEXT DEFAULT (datetime('now')),
    processed_at TEXT,
    FOREIGN KEY (school_id) REFERENCES schools(id),
    FOREIGN KEY (pattern_id) REFERENCES patterns(id)
);

CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    fee_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    method TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'completed',
    reference_number TEXT NOT NULL DEFAULT '',
    transaction_id TEXT NOT NULL DEFAULT '',
    bank_reference TEXT,
    payment_date TEXT NOT NULL,
    processed_by TEXT,
    notes TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (school_id) REFERENCES schools(id),
    FOREIGN KEY (student_id) REFERENCES students(id),
    FOREIGN KEY (fee_id) REFERENCES student_fees(id)
);

CREATE TABLE IF NOT EXISTS credits (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'overpayment',
    description TEXT NOT NULL DEFAULT '',
    payment_id INTEGER,
    parent_credit_id INTEGER,
    is_applied INTEGER DEFAULT 0,
    applied_to_fee_id INTEGER,
    applied_at TEXT,
    created_by TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (student_id) REFERENCES students(id),
    FOREIGN KEY (payment_id) REFERENCES payments(id),
    FOREIGN KEY (parent_credit_id) REFERENCES credits(id),
    FOREIGN KEY (applied_to_fee_id) REFERENCES student_fees(id)
);

CREATE TABLE IF NOT EXISTS payment_allocations (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    payment_id INTEGER,
    credit_id INTEGER,
    fee_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    created_by TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    CHECK ((payment_id IS NULL) <> (credit_id IS NULL)),
    UNIQUE (payment_id, fee_id),
    UNIQUE (credit_id, fee_id),
    FOREIGN KEY (payment_id) REFERENCES payments(id),
    FOREIGN KEY (credit_id) REFERENCES credits(id),
    FOREIGN KEY (fee_id) REFERENCES student_fees(id)
);

CREATE TABLE IF NOT EXISTS unmatched_transactions (
    id INTEGER PRIMARY KEY,
    school_id INTEGER NOT NULL,
    upload_id INTEGER,
    transaction_date TEXT NOT NULL,
    amount TEXT NOT NULL,
    narrative TEXT NOT NULL DEFAULT '',
    bank_reference TEXT,
    provider_reference TEXT,
    mobile_number TEXT,
    payer_name TEXT,
    extracted_student_no TEXT,
    status TEXT NOT NULL DEFAULT 'unmatched',
    reason TEXT NOT NULL,
    matched_payment_id INTEGER,
    matched_student_id INTEGER,
    notes TEXT NOT NULL DEFAULT '',
    matched_by TEXT,
    matched_at TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (upload_id) REFERENCES uploads(id),
    FOREIGN KEY (matched_payment_id) REFERENCES payments(id),
    FOREIGN KEY (matched_student_id) REFERENCES students(id)
);

CREATE INDEX IF NOT EXISTS idx_fees_student ON student_fees(school_id, student_id);
CREATE INDEX IF NOT EXISTS idx_payments_txn ON payments(school_id, transaction_id);
CREATE INDEX IF NOT EXISTS idx_payments_student_date ON payments(school_id, student_id, payment_date);
CREATE INDEX IF NOT EXISTS idx_credits_student ON credits(school_id, student_id, is_applied);
CREATE INDEX IF NOT EXISTS idx_unmatched_status ON unmatched_transactions(school_id, status, transaction_date);
CREATE INDEX IF NOT EXISTS idx_unmatched_bank_ref ON unmatched_transactions(school_id, bank_reference);
CREATE INDEX IF NOT EXISTS idx_unmatched_provider_ref ON unmatched_transactions(school_id, provider_reference);

CREATE TRIGGER IF NOT EXISTS credits_applied_no_update
BEFORE UPDATE ON credits WHEN OLD.is_applied = 1
BEGIN
    SELECT RAISE(ABORT, 'applied credit is immutable');
END;

CREATE TRIGGER IF NOT EXISTS credits_applied_no_delete
BEFORE DELETE ON credits WHEN OLD.is_applied = 1
BEGIN
    SELECT RAISE(ABORT, 'applied credit is immutable');
END;
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(Duration::from_secs(10))?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

/// Canonical TEXT form for money: always two decimal places.
pub fn money_sql(amount: Decimal) -> String {
    let mut d = amount.round_dp(2);
    d.rescale(2);
    d.to_string()
}

pub fn get_decimal(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(raw.trim())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn get_date(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn date_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
