use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::Result;
use crate::settings::load_settings;
use crate::store::add_student;

pub fn add(student_no: &str, name: &str) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    add_student(&conn, settings.school_id, student_no, name.trim())?;
    println!("Added student {}: {}", student_no.trim(), name.trim());
    Ok(())
}

pub fn list() -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let mut stmt = conn.prepare(
        "SELECT s.student_no, s.full_name, count(f.id) \
         FROM students s LEFT JOIN student_fees f ON f.student_id = s.id \
         WHERE s.school_id = ?1 GROUP BY s.id ORDER BY s.student_no",
    )?;
    let rows: Vec<(String, String, i64)> = stmt
        .query_map([settings.school_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["Student", "Name", "Obligations"]);
    for (no, name, fees) in rows {
        table.add_row(vec![Cell::new(no), Cell::new(name), Cell::new(fees)]);
    }
    println!("Students\n{table}");
    Ok(())
}
