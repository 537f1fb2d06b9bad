use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::{BursarError, Result};
use crate::settings::{load_settings, save_settings};
use crate::store::{add_school, school_exists};

pub fn add(name: &str) -> Result<()> {
    let mut settings = load_settings();
    let conn = open_db(&settings)?;
    let id = add_school(&conn, name.trim())?;
    println!("Added school {id}: {}", name.trim());

    if !school_exists(&conn, settings.school_id)? {
        settings.school_id = id;
        save_settings(&settings)?;
        println!("Active school is now {id}");
    }
    Ok(())
}

pub fn list() -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, \
         (SELECT count(*) FROM students st WHERE st.school_id = s.id) \
         FROM schools s ORDER BY s.id",
    )?;
    let rows: Vec<(i64, String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Students", "Active"]);
    for (id, name, students) in rows {
        let active = if id == settings.school_id { "*" } else { "" };
        table.add_row(vec![Cell::new(id), Cell::new(name), Cell::new(students), Cell::new(active)]);
    }
    println!("Schools\n{table}");
    Ok(())
}

pub fn switch(id: i64) -> Result<()> {
    let mut settings = load_settings();
    let conn = open_db(&settings)?;
    if !school_exists(&conn, id)? {
        return Err(BursarError::UnknownSchool(id));
    }
    settings.school_id = id;
    save_settings(&settings)?;
    println!("Active school is now {id}");
    Ok(())
}
