use comfy_table::{Cell, Table};

use crate::cli::{open_db, or_dash};
use crate::error::{BursarError, Result};
use crate::patterns::{self, Delimiter, NewPattern, ALL_PROVIDERS};
use crate::settings::load_settings;

/// Flags of `patterns add`, before validation.
pub struct PatternArgs {
    pub bank: String,
    pub name: String,
    pub provider: String,
    pub date_column: String,
    pub amount_column: String,
    pub narrative_column: String,
    pub reference_column: Option<String>,
    pub student_regex: Option<String>,
    pub provider_ref_regex: Option<String>,
    pub mobile_regex: Option<String>,
    pub date_format: String,
    pub no_header: bool,
    pub delimiter: String,
    pub encoding: String,
}

pub fn add(args: PatternArgs) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;

    let provider = patterns::get_by_key(&args.provider).ok_or_else(|| {
        let keys: Vec<&str> = ALL_PROVIDERS.iter().map(|p| p.key()).collect();
        BursarError::InvalidPattern(format!(
            "unknown provider '{}' (expected one of: {})",
            args.provider,
            keys.join(", ")
        ))
    })?;
    let delimiter = Delimiter::from_key(&args.delimiter)
        .ok_or_else(|| BursarError::InvalidPattern(format!("unknown delimiter '{}'", args.delimiter)))?;

    let new = NewPattern {
        school_id: settings.school_id,
        bank_name: args.bank,
        pattern_name: args.name,
        provider,
        date_column: args.date_column,
        amount_column: args.amount_column,
        narrative_column: args.narrative_column,
        reference_column: args.reference_column,
        student_id_regex: args.student_regex,
        provider_ref_regex: args.provider_ref_regex,
        mobile_regex: args.mobile_regex,
        date_format: args.date_format,
        has_header: !args.no_header,
        delimiter,
        encoding: args.encoding,
    };
    let id = patterns::add_pattern(&conn, &new)?;
    println!("Added pattern {id}: {} / {} ({})", new.bank_name.trim(), new.pattern_name.trim(), provider.name());
    Ok(())
}

pub fn list() -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let rows = patterns::list_patterns(&conn, settings.school_id)?;

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Bank", "Name", "Provider", "Date", "Amount", "Narrative", "Reference", "Format", "Delim", "Active",
    ]);
    for p in rows {
        let reference = p.reference_column.as_ref().map(|c| c.to_string());
        table.add_row(vec![
            Cell::new(p.id),
            Cell::new(&p.bank_name),
            Cell::new(&p.pattern_name),
            Cell::new(p.provider.name()),
            Cell::new(&p.date_column),
            Cell::new(&p.amount_column),
            Cell::new(&p.narrative_column),
            Cell::new(or_dash(reference.as_deref())),
            Cell::new(&p.date_format),
            Cell::new(p.delimiter.key()),
            Cell::new(if p.is_active { "yes" } else { "no" }),
        ]);
    }
    println!("Patterns\n{table}");
    Ok(())
}

pub fn deactivate(id: i64) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    patterns::deactivate_pattern(&conn, settings.school_id, id)?;
    println!("Deactivated pattern {id}");
    Ok(())
}
