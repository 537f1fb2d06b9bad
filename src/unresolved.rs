//! Queue of statement rows the automatic pass could not settle, and the
//! operator actions that resolve them.
//!
//! States: `unmatched` -> `matched` | `ignored`. Both outcomes are terminal.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use crate::allocation::AllocationOrder;
use crate::db::{date_sql, get_date, get_decimal, money_sql};
use crate::error::{BursarError, Result};
use crate::models::{bad_key, ParsedTransaction, Payment, UnresolvedReason, UnresolvedStatus, UnresolvedTransaction};
use crate::posting::{find_payment, payments_like, post_payment, PaymentDraft, Posted};
use crate::store::find_student;

pub struct NewUnresolved<'a> {
    pub school_id: i64,
    pub upload_id: Option<i64>,
    pub tx: &'a ParsedTransaction,
    pub reason: UnresolvedReason,
    pub notes: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct UnresolvedFilter {
    pub status: Option<UnresolvedStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub search: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StudentMatch {
    pub record: UnresolvedTransaction,
    pub posted: Posted,
}

#[derive(Debug, Clone)]
pub struct PaymentSuggestion {
    pub payment: Payment,
    pub score: u8,
}

const UNRESOLVED_COLUMNS: &str = "u.id, u.school_id, u.upload_id, u.transaction_date, u.amount, u.narrative, \
     u.bank_reference, u.provider_reference, u.mobile_number, u.extracted_student_no, u.status, u.reason, \
     u.matched_payment_id, u.matched_student_id, u.notes, u.matched_by, u.matched_at, u.payer_name";

fn unresolved_from_row(row: &Row) -> rusqlite::Result<UnresolvedTransaction> {
    let status: String = row.get(10)?;
    let reason: String = row.get(11)?;
    Ok(UnresolvedTransaction {
        id: row.get(0)?,
        school_id: row.get(1)?,
        upload_id: row.get(2)?,
        transaction_date: get_date(row, 3)?,
        amount: get_decimal(row, 4)?,
        narrative: row.get(5)?,
        bank_reference: row.get(6)?,
        provider_reference: row.get(7)?,
        mobile_number: row.get(8)?,
        extracted_student_no: row.get(9)?,
        status: UnresolvedStatus::from_key(&status).ok_or_else(|| bad_key(10, &status))?,
        reason: UnresolvedReason::from_key(&reason).ok_or_else(|| bad_key(11, &reason))?,
        matched_payment_id: row.get(12)?,
        matched_student_id: row.get(13)?,
        notes: row.get(14)?,
        matched_by: row.get(15)?,
        matched_at: row.get(16)?,
        payer_name: row.get(17)?,
    })
}

fn require_unmatched(record: &UnresolvedTransaction) -> Result<()> {
    if record.status != UnresolvedStatus::Unmatched {
        return Err(BursarError::InvalidTransition {
            id: record.id,
            status: record.status.key().to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Recording and queries
// ---------------------------------------------------------------------------

pub fn record(conn: &Connection, new: &NewUnresolved) -> Result<i64> {
    let tx = new.tx;
    conn.execute(
        "INSERT INTO unmatched_transactions (school_id, upload_id, transaction_date, amount, narrative, \
         bank_reference, provider_reference, mobile_number, payer_name, extracted_student_no, status, reason, notes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            new.school_id,
            new.upload_id,
            date_sql(tx.date),
            money_sql(tx.amount),
            tx.narrative,
            tx.bank_reference,
            tx.provider_reference,
            tx.mobile_number,
            tx.payer_name,
            tx.student_no,
            UnresolvedStatus::Unmatched.key(),
            new.reason.key(),
            new.notes,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, school_id: i64, id: i64) -> Result<UnresolvedTransaction> {
    let sql = format!("SELECT {UNRESOLVED_COLUMNS} FROM unmatched_transactions u WHERE u.id = ?1 AND u.school_id = ?2");
    conn.query_row(&sql, rusqlite::params![id, school_id], unresolved_from_row)
        .optional()?
        .ok_or(BursarError::UnknownUnresolved(id))
}

/// Newest first. `search` is a case-insensitive substring over the narrative,
/// the extracted student id and payer name, and the matched student's id and name.
pub fn list(conn: &Connection, school_id: i64, filter: &UnresolvedFilter) -> Result<Vec<UnresolvedTransaction>> {
    let sql = format!(
        "SELECT {UNRESOLVED_COLUMNS} FROM unmatched_transactions u \
         LEFT JOIN students s ON s.id = u.matched_student_id \
         WHERE u.school_id = ?1 \
         AND (?2 IS NULL OR u.status = ?2) \
         AND (?3 IS NULL OR u.transaction_date >= ?3) \
         AND (?4 IS NULL OR u.transaction_date <= ?4) \
         AND (?5 IS NULL \
              OR instr(lower(u.narrative), lower(?5)) > 0 \
              OR instr(lower(COALESCE(u.extracted_student_no, '')), lower(?5)) > 0 \
              OR instr(lower(COALESCE(u.payer_name, '')), lower(?5)) > 0 \
              OR instr(lower(COALESCE(s.student_no, '')), lower(?5)) > 0 \
              OR instr(lower(COALESCE(s.full_name, '')), lower(?5)) > 0) \
         ORDER BY u.transaction_date DESC, u.id DESC"
    );
    let search = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                school_id,
                filter.status.map(|s| s.key()),
                filter.from.map(date_sql),
                filter.to.map(date_sql),
                search,
            ],
            unresolved_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Completed payments of the extracted student with the same amount and date
/// that no other parked row already points at.
pub fn suggest_payments(conn: &Connection, school_id: i64, id: i64) -> Result<Vec<PaymentSuggestion>> {
    let record = get(conn, school_id, id)?;
    let Some(student_no) = record.extracted_student_no.as_deref() else {
        return Ok(Vec::new());
    };
    let Some(student) = find_student(conn, school_id, student_no)? else {
        return Ok(Vec::new());
    };
    let mut linked = conn.prepare(
        "SELECT 1 FROM unmatched_transactions WHERE matched_payment_id = ?1 AND id != ?2",
    )?;
    let narrative = record.narrative.to_lowercase();

    let mut suggestions = Vec::new();
    for payment in payments_like(conn, &student, record.amount, record.transaction_date)? {
        if linked.exists(rusqlite::params![payment.id, record.id])? {
            continue;
        }
        let mentioned = [payment.transaction_id.as_str(), payment.reference_number.as_str()]
            .iter()
            .any(|r| !r.is_empty() && narrative.contains(&r.to_lowercase()));
        suggestions.push(PaymentSuggestion {
            payment,
            score: if mentioned { 100 } else { 80 },
        });
    }
    suggestions.sort_by(|a, b| b.score.cmp(&a.score).then(b.payment.id.cmp(&a.payment.id)));
    suggestions.truncate(10);
    Ok(suggestions)
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

fn mark_resolved(
    conn: &Connection,
    id: i64,
    status: UnresolvedStatus,
    payment_id: Option<i64>,
    student_id: Option<i64>,
    operator: Option<&str>,
    notes: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE unmatched_transactions SET status = ?1, \
         matched_payment_id = COALESCE(?2, matched_payment_id), \
         matched_student_id = COALESCE(?3, matched_student_id), \
         matched_by = ?4, matched_at = datetime('now'), \
         notes = COALESCE(?5, notes), updated_at = datetime('now') \
         WHERE id = ?6",
        rusqlite::params![status.key(), payment_id, student_id, operator, notes, id],
    )?;
    Ok(())
}

fn non_empty(notes: Option<&str>) -> Option<&str> {
    notes.map(str::trim).filter(|n| !n.is_empty())
}

/// Link to an existing payment. No balances move.
pub fn match_to_payment(
    conn: &mut Connection,
    school_id: i64,
    id: i64,
    payment_id: i64,
    operator: Option<&str>,
    notes: Option<&str>,
) -> Result<UnresolvedTransaction> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = get(&tx, school_id, id)?;
    require_unmatched(&record)?;
    let payment = find_payment(&tx, school_id, payment_id)?.ok_or(BursarError::UnknownPayment(payment_id))?;
    mark_resolved(
        &tx,
        id,
        UnresolvedStatus::Matched,
        Some(payment.id),
        Some(payment.student_id),
        operator,
        non_empty(notes),
    )?;
    let updated = get(&tx, school_id, id)?;
    tx.commit()?;
    info!(unresolved_id = id, payment_id, "matched to existing payment");
    Ok(updated)
}

/// Create a payment for `student_no` from the parked row, allocating
/// largest-outstanding first (or only to `target`), exactly as the automatic
/// path would post it.
pub fn match_to_student(
    conn: &mut Connection,
    school_id: i64,
    id: i64,
    student_no: &str,
    target: Option<i64>,
    operator: Option<&str>,
    notes: Option<&str>,
) -> Result<StudentMatch> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = get(&tx, school_id, id)?;
    require_unmatched(&record)?;
    let student = find_student(&tx, school_id, student_no)?
        .ok_or_else(|| BursarError::UnknownStudent(student_no.to_string()))?;

    let payment_notes = format!("Matched from unresolved transaction {id}");
    let draft = PaymentDraft {
        student: &student,
        amount: record.amount,
        payment_date: record.transaction_date,
        narrative: &record.narrative,
        provider_reference: record.provider_reference.as_deref(),
        bank_reference: record.bank_reference.as_deref(),
        processed_by: operator,
        notes: Some(&payment_notes),
    };
    let posted = post_payment(&tx, &draft, target, AllocationOrder::LargestFirst)?;
    mark_resolved(
        &tx,
        id,
        UnresolvedStatus::Matched,
        Some(posted.payment_id),
        Some(student.id),
        operator,
        non_empty(notes),
    )?;
    let updated = get(&tx, school_id, id)?;
    tx.commit()?;
    info!(
        unresolved_id = id,
        student = %student.student_no,
        payment_id = posted.payment_id,
        credited = %posted.credited,
        "matched to student"
    );
    Ok(StudentMatch {
        record: updated,
        posted,
    })
}

pub fn ignore(
    conn: &mut Connection,
    school_id: i64,
    id: i64,
    operator: Option<&str>,
    notes: Option<&str>,
) -> Result<UnresolvedTransaction> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = get(&tx, school_id, id)?;
    require_unmatched(&record)?;
    mark_resolved(&tx, id, UnresolvedStatus::Ignored, None, None, operator, non_empty(notes))?;
    let updated = get(&tx, school_id, id)?;
    tx.commit()?;
    info!(unresolved_id = id, "ignored");
    Ok(updated)
}

/// Only unmatched rows may be deleted; resolved rows are kept for audit.
pub fn delete(conn: &mut Connection, school_id: i64, id: i64) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = get(&tx, school_id, id)?;
    require_unmatched(&record)?;
    tx.execute("DELETE FROM unmatched_transactions WHERE id = ?1", [id])?;
    tx.commit()?;
    info!(unresolved_id = id, "deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::models::Student;
    use crate::posting::{allocations_for, AllocationSource};
    use crate::store::{add_fee, add_school, add_student, get_obligation};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seed_student(conn: &Connection, school: i64, no: &str, name: &str) -> Student {
        add_student(conn, school, no, name).unwrap();
        find_student(conn, school, no).unwrap().unwrap()
    }

    fn parked(conn: &Connection, school: i64, narrative: &str, amount: Decimal, student_no: Option<&str>) -> i64 {
        let tx = ParsedTransaction {
            line: 2,
            date: date("2024-03-01"),
            amount,
            narrative: narrative.to_string(),
            provider_reference: None,
            mobile_number: None,
            payer_name: None,
            student_no: student_no.map(str::to_string),
            bank_reference: None,
        };
        record(
            conn,
            &NewUnresolved {
                school_id: school,
                upload_id: None,
                tx: &tx,
                reason: UnresolvedReason::StudentNotFound,
                notes: "",
            },
        )
        .unwrap()
    }

    #[test]
    fn test_match_to_student_uses_largest_first() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001", "Samuel Kagiri");
        let small = add_fee(&conn, &s, "Transport", "T1", dec!(50), date("2024-01-01")).unwrap();
        let big = add_fee(&conn, &s, "Tuition", "T1", dec!(300), date("2024-02-01")).unwrap();
        let id = parked(&conn, school, "deposit for samuel", dec!(320), Some("99999"));

        let m = match_to_student(&mut conn, school, id, "00001", None, Some("ops"), Some("confirmed by phone")).unwrap();
        assert_eq!(m.record.status, UnresolvedStatus::Matched);
        assert_eq!(m.record.matched_student_id, Some(s.id));
        assert_eq!(m.record.matched_payment_id, Some(m.posted.payment_id));
        assert_eq!(m.record.notes, "confirmed by phone");
        assert_eq!(m.record.matched_by.as_deref(), Some("ops"));
        assert_eq!(m.posted.anchor_fee_id, big);
        assert_eq!(get_obligation(&conn, big).unwrap().unwrap().amount_paid, dec!(300));
        assert_eq!(get_obligation(&conn, small).unwrap().unwrap().amount_paid, dec!(20));

        let allocs = allocations_for(&conn, AllocationSource::Payment(m.posted.payment_id)).unwrap();
        assert_eq!(allocs.len(), 2);

        let err = ignore(&mut conn, school, id, None, None).unwrap_err();
        assert!(matches!(err, BursarError::InvalidTransition { .. }));
    }

    #[test]
    fn test_match_to_student_with_target_credits_rest() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001", "Samuel Kagiri");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        add_fee(&conn, &s, "Transport", "T1", dec!(100), date("2024-01-01")).unwrap();
        let id = parked(&conn, school, "deposit", dec!(150), None);

        let m = match_to_student(&mut conn, school, id, "00001", Some(fee), None, None).unwrap();
        assert_eq!(m.posted.allocations.len(), 1);
        assert_eq!(m.posted.credited, dec!(50));
    }

    #[test]
    fn test_match_to_student_without_history_stays_unmatched() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        seed_student(&conn, school, "00001", "Samuel Kagiri");
        let id = parked(&conn, school, "deposit", dec!(150), None);

        let err = match_to_student(&mut conn, school, id, "00001", None, None, None).unwrap_err();
        assert!(matches!(err, BursarError::NoObligationHistory(_)));
        assert_eq!(get(&conn, school, id).unwrap().status, UnresolvedStatus::Unmatched);
        let n: i64 = conn.query_row("SELECT count(*) FROM payments", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);

        let err = match_to_student(&mut conn, school, id, "77777", None, None, None).unwrap_err();
        assert!(matches!(err, BursarError::UnknownStudent(_)));
    }

    #[test]
    fn test_match_to_payment_moves_no_money() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001", "Samuel Kagiri");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        conn.execute(
            "INSERT INTO payments (school_id, student_id, fee_id, amount, method, payment_date) \
             VALUES (?1, ?2, ?3, '40.00', 'cash', '2024-03-01')",
            rusqlite::params![school, s.id, fee],
        )
        .unwrap();
        let payment_id = conn.last_insert_rowid();
        let id = parked(&conn, school, "cash at office", dec!(40), Some("00001"));

        let rec = match_to_payment(&mut conn, school, id, payment_id, None, None).unwrap();
        assert_eq!(rec.matched_payment_id, Some(payment_id));
        assert_eq!(rec.matched_student_id, Some(s.id));
        assert_eq!(get_obligation(&conn, fee).unwrap().unwrap().amount_paid, dec!(0));

        let other = parked(&conn, school, "x", dec!(1), None);
        assert!(matches!(
            match_to_payment(&mut conn, school, other, 9999, None, None),
            Err(BursarError::UnknownPayment(9999))
        ));
    }

    #[test]
    fn test_ignore_and_delete_transitions() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let a = parked(&conn, school, "noise", dec!(5), None);
        let b = parked(&conn, school, "typo", dec!(5), None);

        let rec = ignore(&mut conn, school, a, Some("ops"), Some("bank charge")).unwrap();
        assert_eq!(rec.status, UnresolvedStatus::Ignored);
        assert_eq!(rec.notes, "bank charge");
        assert!(matches!(delete(&mut conn, school, a), Err(BursarError::InvalidTransition { .. })));

        delete(&mut conn, school, b).unwrap();
        assert!(matches!(get(&conn, school, b), Err(BursarError::UnknownUnresolved(_))));
    }

    #[test]
    fn test_list_filters() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00042", "Grace Wanjiru");
        add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        let a = parked(&conn, school, "MPS deposit", dec!(10), Some("123"));
        parked(&conn, school, "other", dec!(10), None);
        match_to_student(&mut conn, school, a, "00042", None, None, None).unwrap();

        let all = list(&conn, school, &UnresolvedFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let open = UnresolvedFilter { status: Some(UnresolvedStatus::Unmatched), ..Default::default() };
        assert_eq!(list(&conn, school, &open).unwrap().len(), 1);

        let by_name = UnresolvedFilter { search: Some("wanjiru".into()), ..Default::default() };
        assert_eq!(list(&conn, school, &by_name).unwrap()[0].id, a);

        let by_extracted = UnresolvedFilter { search: Some("123".into()), ..Default::default() };
        assert_eq!(list(&conn, school, &by_extracted).unwrap().len(), 1);

        let later = UnresolvedFilter { from: Some(date("2024-04-01")), ..Default::default() };
        assert!(list(&conn, school, &later).unwrap().is_empty());
        let window = UnresolvedFilter {
            from: Some(date("2024-03-01")),
            to: Some(date("2024-03-01")),
            ..Default::default()
        };
        assert_eq!(list(&conn, school, &window).unwrap().len(), 2);
    }

    #[test]
    fn test_payer_name_is_kept_and_searchable() {
        let (_dir, conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let tx = ParsedTransaction {
            line: 4,
            date: date("2024-03-02"),
            amount: dec!(75),
            narrative: "MPS 254722000111 TK18K8USG8 064010#00777 JANE WANJIKU".to_string(),
            provider_reference: Some("TK18K8USG8".to_string()),
            mobile_number: Some("254722000111".to_string()),
            payer_name: Some("JANE WANJIKU".to_string()),
            student_no: Some("00777".to_string()),
            bank_reference: Some("TK18K8USG8".to_string()),
        };
        let id = record(
            &conn,
            &NewUnresolved {
                school_id: school,
                upload_id: None,
                tx: &tx,
                reason: UnresolvedReason::StudentNotFound,
                notes: "",
            },
        )
        .unwrap();
        parked(&conn, school, "cash deposit", dec!(75), None);

        assert_eq!(get(&conn, school, id).unwrap().payer_name.as_deref(), Some("JANE WANJIKU"));
        let by_payer = UnresolvedFilter { search: Some("wanjiku".into()), ..Default::default() };
        let hits = list(&conn, school, &by_payer).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn test_suggest_payments_scores_and_excludes_linked() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001", "Samuel Kagiri");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        for txn in ["QX7P2M9LKA", "ZZ11AA22BB"] {
            conn.execute(
                "INSERT INTO payments (school_id, student_id, fee_id, amount, method, transaction_id, payment_date) \
                 VALUES (?1, ?2, ?3, '40.00', 'mpesa', ?4, '2024-03-01')",
                rusqlite::params![school, s.id, fee, txn],
            )
            .unwrap();
        }
        let id = parked(&conn, school, "paid qx7p2m9lka 1#00001", dec!(40), Some("00001"));
        let suggestions = suggest_payments(&conn, school, id).unwrap();
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].score, 100);
        assert_eq!(suggestions[0].payment.transaction_id, "QX7P2M9LKA");
        assert_eq!(suggestions[1].score, 80);

        let other = parked(&conn, school, "second", dec!(40), Some("00001"));
        match_to_payment(&mut conn, school, other, suggestions[1].payment.id, None, None).unwrap();
        let again = suggest_payments(&conn, school, id).unwrap();
        assert_eq!(again.len(), 1);

        let nobody = parked(&conn, school, "none", dec!(40), None);
        assert!(suggest_payments(&conn, school, nobody).unwrap().is_empty());
    }
}
