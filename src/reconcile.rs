use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::allocation::AllocationOrder;
use crate::dedup::{find_duplicate, DuplicateKind};
use crate::error::{BursarError, Result};
use crate::extractor::Extractor;
use crate::models::{bad_key, ParsedTransaction, UnresolvedReason, UploadJob, UploadStatus};
use crate::parser::{decode_statement, statement_checksum, statement_rows, to_transaction};
use crate::patterns::{active_pattern, Pattern};
use crate::posting::{post_payment, PaymentDraft};
use crate::store::find_student;
use crate::unresolved::{self, NewUnresolved};

/// One statement submission.
#[derive(Debug, Clone)]
pub struct StatementUpload<'a> {
    pub school_id: i64,
    pub pattern_id: i64,
    pub file_name: &'a str,
    pub bytes: &'a [u8],
    pub operator: Option<&'a str>,
    pub strict_duplicates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Matched { payment_id: i64, credited: Decimal },
    Duplicate(DuplicateKind),
    Unresolved { id: i64, reason: UnresolvedReason },
}

impl RowOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched { .. } => "Matched",
            Self::Duplicate(_) => "Duplicate",
            Self::Unresolved { .. } => "Unmatched",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RowReport {
    pub line: usize,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub student_no: Option<String>,
    pub narrative: String,
    pub outcome: RowOutcome,
}

/// Per-upload counters. `total` counts every row that reached duplicate
/// detection; rows skipped while parsing are not counted anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadTally {
    pub total: i64,
    pub matched: i64,
    pub unmatched: i64,
    pub duplicate: i64,
}

impl UploadTally {
    pub fn record(&mut self, outcome: &RowOutcome) {
        self.total += 1;
        match outcome {
            RowOutcome::Matched { .. } => self.matched += 1,
            RowOutcome::Duplicate(_) => self.duplicate += 1,
            RowOutcome::Unresolved { .. } => self.unmatched += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub job: UploadJob,
    pub rows: Vec<RowReport>,
}

// ---------------------------------------------------------------------------
// Upload jobs
// ---------------------------------------------------------------------------

const UPLOAD_COLUMNS: &str = "id, school_id, pattern_id, file_name, checksum, status, total, matched, \
     unmatched, duplicate, error_message, uploaded_at, processed_at";

fn upload_from_row(row: &Row) -> rusqlite::Result<UploadJob> {
    let status: String = row.get(5)?;
    Ok(UploadJob {
        id: row.get(0)?,
        school_id: row.get(1)?,
        pattern_id: row.get(2)?,
        file_name: row.get(3)?,
        checksum: row.get(4)?,
        status: UploadStatus::from_key(&status).ok_or_else(|| bad_key(5, &status))?,
        total: row.get(6)?,
        matched: row.get(7)?,
        unmatched: row.get(8)?,
        duplicate: row.get(9)?,
        error_message: row.get(10)?,
        uploaded_at: row.get(11)?,
        processed_at: row.get(12)?,
    })
}

pub fn get_upload(conn: &Connection, upload_id: i64) -> Result<Option<UploadJob>> {
    let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?1");
    Ok(conn.query_row(&sql, [upload_id], upload_from_row).optional()?)
}

pub fn list_uploads(conn: &Connection, school_id: i64, limit: usize) -> Result<Vec<UploadJob>> {
    let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE school_id = ?1 ORDER BY id DESC LIMIT ?2");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![school_id, limit as i64], upload_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn create_job(conn: &Connection, upload: &StatementUpload, checksum: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO uploads (school_id, pattern_id, file_name, checksum, status, uploaded_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            upload.school_id,
            upload.pattern_id,
            upload.file_name,
            checksum,
            UploadStatus::Processing.key(),
            upload.operator,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn finish_job(
    conn: &Connection,
    job_id: i64,
    status: UploadStatus,
    tally: &UploadTally,
    error_message: Option<&str>,
) -> Result<UploadJob> {
    conn.execute(
        "UPDATE uploads SET status = ?1, total = ?2, matched = ?3, unmatched = ?4, duplicate = ?5, \
         error_message = ?6, processed_at = datetime('now') WHERE id = ?7 AND status = ?8",
        rusqlite::params![
            status.key(),
            tally.total,
            tally.matched,
            tally.unmatched,
            tally.duplicate,
            error_message,
            job_id,
            UploadStatus::Processing.key(),
        ],
    )?;
    get_upload(conn, job_id)?.ok_or_else(|| BursarError::Other(format!("upload {job_id} vanished")))
}

// ---------------------------------------------------------------------------
// Row processing
// ---------------------------------------------------------------------------

struct RowContext<'a> {
    school_id: i64,
    upload_id: i64,
    operator: Option<&'a str>,
    strict_duplicates: bool,
}

fn park(conn: &Connection, ctx: &RowContext, txn: &ParsedTransaction, reason: UnresolvedReason, notes: &str) -> Result<RowOutcome> {
    let id = unresolved::record(
        conn,
        &NewUnresolved {
            school_id: ctx.school_id,
            upload_id: Some(ctx.upload_id),
            tx: txn,
            reason,
            notes,
        },
    )?;
    Ok(RowOutcome::Unresolved { id, reason })
}

/// Dedup, student lookup, balance read and posting for one row, committed as
/// a single immediate transaction. A posting failure rolls back to a
/// savepoint and parks the row instead.
fn process_row(conn: &mut Connection, ctx: &RowContext, txn: &ParsedTransaction) -> Result<RowOutcome> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let student = match txn.student_no.as_deref() {
        Some(no) => find_student(&tx, ctx.school_id, no)?,
        None => None,
    };
    if let Some(kind) = find_duplicate(&tx, ctx.school_id, txn, student.as_ref().map(|s| s.id), ctx.strict_duplicates)? {
        tx.commit()?;
        return Ok(RowOutcome::Duplicate(kind));
    }

    let outcome = match (txn.student_no.as_deref(), student) {
        (None, _) => park(&tx, ctx, txn, UnresolvedReason::NoStudentId, "")?,
        (Some(_), None) => park(&tx, ctx, txn, UnresolvedReason::StudentNotFound, "")?,
        (Some(_), Some(student)) => {
            let draft = PaymentDraft {
                student: &student,
                amount: txn.amount,
                payment_date: txn.date,
                narrative: &txn.narrative,
                provider_reference: txn.provider_reference.as_deref(),
                bank_reference: txn.bank_reference.as_deref(),
                processed_by: ctx.operator,
                notes: None,
            };
            let sp = tx.savepoint()?;
            match post_payment(&sp, &draft, None, AllocationOrder::OldestFirst) {
                Ok(posted) => {
                    sp.commit()?;
                    RowOutcome::Matched {
                        payment_id: posted.payment_id,
                        credited: posted.credited,
                    }
                }
                Err(BursarError::NoObligationHistory(_)) => {
                    drop(sp);
                    park(&tx, ctx, txn, UnresolvedReason::NoObligationHistory, "")?
                }
                Err(e) => {
                    drop(sp);
                    error!(line = txn.line, error = %e, "posting failed, row rolled back");
                    let notes = format!("Error during processing: {e}");
                    park(&tx, ctx, txn, UnresolvedReason::PersistenceFailure, &notes)?
                }
            }
        }
    };
    tx.commit()?;
    Ok(outcome)
}

fn log_outcome(txn: &ParsedTransaction, outcome: &RowOutcome) {
    let student = txn.student_no.as_deref().unwrap_or("-");
    match outcome {
        RowOutcome::Matched { payment_id, credited } => {
            info!(line = txn.line, student, amount = %txn.amount, payment_id, credited = %credited, "matched")
        }
        RowOutcome::Duplicate(kind) => {
            info!(line = txn.line, student, amount = %txn.amount, by = kind.name(), "duplicate")
        }
        RowOutcome::Unresolved { id, reason } => {
            warn!(line = txn.line, student, amount = %txn.amount, unresolved_id = id, reason = reason.key(), "unresolved")
        }
    }
}

fn prepare(pattern: &Pattern, bytes: &[u8]) -> Result<(String, Extractor)> {
    let text = decode_statement(bytes, &pattern.encoding)?;
    let extractor = Extractor::new(pattern.rules()?)?;
    Ok((text, extractor))
}

/// Process a statement end to end. Rows are handled one at a time in file
/// order; per-row problems end up as unresolved transactions, and only an
/// unreadable file (or a database that refuses writes) marks the job failed.
pub fn process_statement(conn: &mut Connection, upload: &StatementUpload) -> Result<UploadReport> {
    let pattern = active_pattern(conn, upload.school_id, upload.pattern_id)?;
    let checksum = statement_checksum(upload.bytes);
    {
        let mut stmt = conn.prepare("SELECT 1 FROM uploads WHERE school_id = ?1 AND checksum = ?2")?;
        if stmt.exists(rusqlite::params![upload.school_id, checksum])? {
            warn!(file = upload.file_name, "identical file was uploaded before, relying on row-level duplicate checks");
        }
    }
    let job_id = create_job(conn, upload, &checksum)?;
    info!(upload_id = job_id, file = upload.file_name, pattern = %pattern.pattern_name, "processing statement");

    let mut tally = UploadTally::default();
    let (text, extractor) = match prepare(&pattern, upload.bytes) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(upload_id = job_id, error = %e, "statement rejected");
            let job = finish_job(conn, job_id, UploadStatus::Failed, &tally, Some(&e.to_string()))?;
            return Ok(UploadReport { job, rows: Vec::new() });
        }
    };

    let ctx = RowContext {
        school_id: upload.school_id,
        upload_id: job_id,
        operator: upload.operator,
        strict_duplicates: upload.strict_duplicates,
    };
    let mut rows = Vec::new();
    for raw in statement_rows(&text, &pattern) {
        let Some(txn) = to_transaction(&raw, &pattern, &extractor) else {
            continue;
        };
        let outcome = match process_row(conn, &ctx, &txn) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(upload_id = job_id, line = txn.line, error = %e, "row could not be recorded");
                let job = finish_job(conn, job_id, UploadStatus::Failed, &tally, Some(&e.to_string()))?;
                return Ok(UploadReport { job, rows });
            }
        };
        log_outcome(&txn, &outcome);
        tally.record(&outcome);
        rows.push(RowReport {
            line: txn.line,
            date: txn.date,
            amount: txn.amount,
            student_no: txn.student_no,
            narrative: txn.narrative,
            outcome,
        });
    }

    let job = finish_job(conn, job_id, UploadStatus::Completed, &tally, None)?;
    info!(
        upload_id = job_id,
        total = tally.total,
        matched = tally.matched,
        unmatched = tally.unmatched,
        duplicate = tally.duplicate,
        "statement processed"
    );
    Ok(UploadReport { job, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::models::{Student, UnresolvedStatus};
    use crate::patterns::{add_pattern, deactivate_pattern, mpesa_pattern};
    use crate::posting::{allocations_for, AllocationSource};
    use crate::store::{add_fee, add_school, add_student, get_obligation, mutate_obligation};
    use rust_decimal_macros::dec;

    const STATEMENT: &str = "Date,Amount,Narrative
2024-03-01,200.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL KAGIRI
2024-03-01,80.00,MPS 254722000111 TK18K8USG8 064010#00777 JOHN DOE
2024-03-02,55.00,MPS 254722000222 QA11BB22CC ANON
2024-03-02,100.00,MPS 254722000333 QA11BB22DD 064010#00002 NEW KID
2024-03-03,40.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL K
not-a-date,10.00,garbage
2024-03-03,-5.00,reversal
";

    struct Fixture {
        _dir: tempfile::TempDir,
        conn: Connection,
        school: i64,
        pattern: i64,
        samuel: Student,
        tuition: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let pattern = add_pattern(&conn, &mpesa_pattern(school)).unwrap();
        add_student(&conn, school, "00001", "Samuel Kagiri").unwrap();
        add_student(&conn, school, "00002", "New Kid").unwrap();
        let samuel = find_student(&conn, school, "00001").unwrap().unwrap();
        let due = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let tuition = add_fee(&conn, &samuel, "Tuition", "T1", dec!(150), due).unwrap();
        Fixture {
            _dir: dir,
            conn,
            school,
            pattern,
            samuel,
            tuition,
        }
    }

    fn run(f: &mut Fixture, bytes: &[u8]) -> UploadReport {
        let upload = StatementUpload {
            school_id: f.school,
            pattern_id: f.pattern,
            file_name: "statement.csv",
            bytes,
            operator: Some("tester"),
            strict_duplicates: false,
        };
        process_statement(&mut f.conn, &upload).unwrap()
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_statement_end_to_end() {
        let mut f = fixture();
        let report = run(&mut f, STATEMENT.as_bytes());
        let job = &report.job;
        assert_eq!(job.status, UploadStatus::Completed);
        assert_eq!((job.total, job.matched, job.unmatched, job.duplicate), (5, 1, 3, 1));
        assert!(job.processed_at.is_some());

        let reasons: Vec<RowOutcome> = report.rows.iter().map(|r| r.outcome).collect();
        assert!(matches!(reasons[0], RowOutcome::Matched { credited, .. } if credited == dec!(50)));
        assert!(matches!(reasons[1], RowOutcome::Unresolved { reason: UnresolvedReason::StudentNotFound, .. }));
        assert!(matches!(reasons[2], RowOutcome::Unresolved { reason: UnresolvedReason::NoStudentId, .. }));
        assert!(matches!(reasons[3], RowOutcome::Unresolved { reason: UnresolvedReason::NoObligationHistory, .. }));
        assert_eq!(reasons[4], RowOutcome::Duplicate(DuplicateKind::ProviderReference));

        let fee = get_obligation(&f.conn, f.tuition).unwrap().unwrap();
        assert_eq!(fee.amount_paid, dec!(150));
        assert!(fee.is_paid);
        assert_eq!(count(&f.conn, "payments"), 1);
        assert_eq!(count(&f.conn, "credits"), 1);

        // Conservation for the matched row
        let RowOutcome::Matched { payment_id, credited } = reasons[0] else { unreachable!() };
        let allocated: Decimal = allocations_for(&f.conn, AllocationSource::Payment(payment_id))
            .unwrap()
            .iter()
            .map(|a| a.amount)
            .sum();
        assert_eq!(allocated + credited, dec!(200));

        let parked = unresolved::list(&f.conn, f.school, &Default::default()).unwrap();
        assert_eq!(parked.len(), 3);
        assert!(parked.iter().all(|u| u.status == UnresolvedStatus::Unmatched && u.upload_id == Some(job.id)));
        assert!(parked.iter().any(|u| u.payer_name.as_deref() == Some("JOHN DOE")));
    }

    #[test]
    fn test_utf16_statement_is_processed() {
        let mut f = fixture();
        let mut wide = mpesa_pattern(f.school);
        wide.encoding = "utf-16le".to_string();
        f.pattern = add_pattern(&f.conn, &wide).unwrap();

        let csv = "Date,Amount,Narrative\n2024-03-01,200.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL\n";
        let bytes: Vec<u8> = csv.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let report = run(&mut f, &bytes);
        assert_eq!(report.job.status, UploadStatus::Completed);
        assert_eq!((report.job.total, report.job.matched), (1, 1));
        assert_eq!(report.rows[0].student_no.as_deref(), Some("00001"));
        assert_eq!(get_obligation(&f.conn, f.tuition).unwrap().unwrap().amount_paid, dec!(150));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut f = fixture();
        run(&mut f, STATEMENT.as_bytes());
        let paid_before = get_obligation(&f.conn, f.tuition).unwrap().unwrap().amount_paid;

        let second = run(&mut f, STATEMENT.as_bytes());
        assert_eq!(second.job.status, UploadStatus::Completed);
        assert_eq!(second.job.total, 5);
        assert_eq!(second.job.duplicate, 5);
        assert_eq!(second.job.matched, 0);
        assert_eq!(count(&f.conn, "payments"), 1);
        assert_eq!(count(&f.conn, "unmatched_transactions"), 3);
        assert_eq!(get_obligation(&f.conn, f.tuition).unwrap().unwrap().amount_paid, paid_before);
        assert_eq!(count(&f.conn, "uploads"), 2);
    }

    #[test]
    fn test_oldest_first_across_obligations() {
        let mut f = fixture();
        let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let second = add_fee(&f.conn, &f.samuel, "Tuition", "T2", dec!(100), feb).unwrap();
        mutate_obligation(&f.conn, f.tuition, dec!(100), false).unwrap();
        let csv = "Date,Amount,Narrative\n2024-03-01,120.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL\n";
        let report = run(&mut f, csv.as_bytes());
        assert_eq!(report.job.matched, 1);
        assert_eq!(get_obligation(&f.conn, f.tuition).unwrap().unwrap().amount_paid, dec!(150));
        assert_eq!(get_obligation(&f.conn, second).unwrap().unwrap().amount_paid, dec!(70));
        assert_eq!(count(&f.conn, "credits"), 0);
    }

    #[test]
    fn test_settled_history_credits_full_amount() {
        let mut f = fixture();
        mutate_obligation(&f.conn, f.tuition, dec!(150), true).unwrap();
        let csv = "Date,Amount,Narrative\n2024-03-01,90.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL\n";
        let report = run(&mut f, csv.as_bytes());
        assert_eq!(report.job.matched, 1);
        assert!(matches!(report.rows[0].outcome, RowOutcome::Matched { credited, .. } if credited == dec!(90)));
        assert_eq!(count(&f.conn, "payment_allocations"), 0);
    }

    #[test]
    fn test_persistence_failure_rolls_back_row() {
        let mut f = fixture();
        f.conn
            .execute_batch(
                "CREATE TRIGGER fail_credits BEFORE INSERT ON credits \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let csv = "Date,Amount,Narrative\n2024-03-01,200.00,MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL\n";
        let report = run(&mut f, csv.as_bytes());
        assert_eq!(report.job.status, UploadStatus::Completed);
        assert_eq!(report.job.unmatched, 1);
        assert_eq!(count(&f.conn, "payments"), 0);
        assert_eq!(count(&f.conn, "payment_allocations"), 0);
        assert_eq!(get_obligation(&f.conn, f.tuition).unwrap().unwrap().amount_paid, dec!(0));

        let parked = unresolved::list(&f.conn, f.school, &Default::default()).unwrap();
        assert_eq!(parked[0].reason, UnresolvedReason::PersistenceFailure);
        assert!(parked[0].notes.contains("disk full"));
    }

    #[test]
    fn test_binary_file_fails_job() {
        let mut f = fixture();
        let report = run(&mut f, b"PK\x03\x04\x00\x00binary");
        assert_eq!(report.job.status, UploadStatus::Failed);
        assert!(report.job.error_message.as_deref().unwrap_or("").contains("binary"));
        assert_eq!(report.job.total, 0);
        assert!(report.rows.is_empty());
    }

    #[test]
    fn test_inactive_pattern_rejected_before_job() {
        let mut f = fixture();
        deactivate_pattern(&f.conn, f.school, f.pattern).unwrap();
        let upload = StatementUpload {
            school_id: f.school,
            pattern_id: f.pattern,
            file_name: "statement.csv",
            bytes: STATEMENT.as_bytes(),
            operator: None,
            strict_duplicates: false,
        };
        assert!(matches!(
            process_statement(&mut f.conn, &upload),
            Err(BursarError::InactivePattern(_))
        ));
        assert_eq!(count(&f.conn, "uploads"), 0);
    }

    #[test]
    fn test_list_uploads_newest_first() {
        let mut f = fixture();
        run(&mut f, STATEMENT.as_bytes());
        run(&mut f, b"Date,Amount,Narrative\n");
        let uploads = list_uploads(&f.conn, f.school, 10).unwrap();
        assert_eq!(uploads.len(), 2);
        assert!(uploads[0].id > uploads[1].id);
        assert_eq!(uploads[0].total, 0);
    }
}
