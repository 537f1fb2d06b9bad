use rusqlite::Connection;

use crate::cli::open_db;
use crate::error::Result;
use crate::settings::load_settings;

fn count(conn: &Connection, sql: &str, school_id: i64) -> Result<i64> {
    Ok(conn.query_row(sql, [school_id], |r| r.get(0))?)
}

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Operator:   {}", settings.operator().unwrap_or("(not set)"));
    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Dedup:      {}", if settings.strict_duplicates { "strict" } else { "legacy" });

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `bursar init` to set up.");
        return Ok(());
    }
    let conn = open_db(&settings)?;
    let school = settings.school_id;
    let name: Option<String> = conn
        .query_row("SELECT name FROM schools WHERE id = ?1", [school], |r| r.get(0))
        .ok();
    println!("School:     {} ({school})", name.as_deref().unwrap_or("(not set)"));

    let students = count(&conn, "SELECT count(*) FROM students WHERE school_id = ?1", school)?;
    let open_fees = count(&conn, "SELECT count(*) FROM student_fees WHERE school_id = ?1 AND is_paid = 0", school)?;
    let payments = count(&conn, "SELECT count(*) FROM payments WHERE school_id = ?1", school)?;
    let uploads = count(&conn, "SELECT count(*) FROM uploads WHERE school_id = ?1", school)?;
    let unmatched = count(
        &conn,
        "SELECT count(*) FROM unmatched_transactions WHERE school_id = ?1 AND status = 'unmatched'",
        school,
    )?;
    let credits = count(&conn, "SELECT count(*) FROM credits WHERE school_id = ?1 AND is_applied = 0", school)?;

    println!();
    println!("Students:           {students}");
    println!("Open obligations:   {open_fees}");
    println!("Payments:           {payments}");
    println!("Uploads:            {uploads}");
    println!("Unresolved:         {unmatched}");
    println!("Unapplied credits:  {credits}");
    Ok(())
}
