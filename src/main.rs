mod allocation;
mod cli;
mod credits;
mod db;
mod dedup;
mod error;
mod extractor;
mod fmt;
mod models;
mod parser;
mod patterns;
mod posting;
mod receivables;
mod reconcile;
mod settings;
mod store;
mod unresolved;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{
    Cli, Commands, CreditsCommands, FeesCommands, PatternsCommands, SchoolCommands, StudentsCommands,
    UnresolvedCommands, UploadsCommands,
};

/// Logs go to stderr so command output stays clean. `RUST_LOG` wins over the
/// configured level.
fn init_tracing() {
    let level = settings::load_settings().log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Status => cli::status::run(),
        Commands::School { command } => match command {
            SchoolCommands::Add { name } => cli::school::add(&name),
            SchoolCommands::List => cli::school::list(),
            SchoolCommands::Use { id } => cli::school::switch(id),
        },
        Commands::Students { command } => match command {
            StudentsCommands::Add { student, name } => cli::students::add(&student, &name),
            StudentsCommands::List => cli::students::list(),
        },
        Commands::Fees { command } => match command {
            FeesCommands::Add {
                student,
                category,
                term,
                amount,
                due,
            } => cli::fees::add(&student, &category, &term, amount, due),
        },
        Commands::Balance { student } => cli::balance::run(&student),
        Commands::Patterns { command } => match command {
            PatternsCommands::Add {
                bank,
                name,
                provider,
                date_column,
                amount_column,
                narrative_column,
                reference_column,
                student_regex,
                provider_ref_regex,
                mobile_regex,
                date_format,
                no_header,
                delimiter,
                encoding,
            } => cli::patterns::add(cli::patterns::PatternArgs {
                bank,
                name,
                provider,
                date_column,
                amount_column,
                narrative_column,
                reference_column,
                student_regex,
                provider_ref_regex,
                mobile_regex,
                date_format,
                no_header,
                delimiter,
                encoding,
            }),
            PatternsCommands::List => cli::patterns::list(),
            PatternsCommands::Deactivate { id } => cli::patterns::deactivate(id),
        },
        Commands::Upload { file, pattern, verbose } => cli::upload::run(&file, pattern, verbose),
        Commands::Uploads { command } => match command {
            UploadsCommands::List { limit } => cli::upload::list(limit),
        },
        Commands::Unresolved { command } => match command {
            UnresolvedCommands::List {
                status,
                from_date,
                to_date,
                search,
            } => cli::unresolved::list(status.as_deref(), from_date, to_date, search.as_deref()),
            UnresolvedCommands::Show { id } => cli::unresolved::show(id),
            UnresolvedCommands::Match {
                id,
                payment,
                student,
                fee,
                notes,
            } => match (payment, student) {
                (Some(payment_id), _) => cli::unresolved::match_payment(id, payment_id, notes.as_deref()),
                (None, Some(student)) => cli::unresolved::match_student(id, &student, fee, notes.as_deref()),
                (None, None) => Err(error::BursarError::Other(
                    "Pass --payment <id> or --student <student-id>".to_string(),
                )),
            },
            UnresolvedCommands::Ignore { id, notes } => cli::unresolved::ignore(id, notes.as_deref()),
            UnresolvedCommands::Delete { id, yes } => cli::unresolved::delete(id, yes),
        },
        Commands::Credits { command } => match command {
            CreditsCommands::List { student, all } => cli::credits::list(student.as_deref(), all),
            CreditsCommands::Add {
                student,
                amount,
                source,
                description,
            } => cli::credits::add(&student, amount, &source, &description),
            CreditsCommands::Apply { id, fee } => cli::credits::apply(id, fee),
            CreditsCommands::ApplyAll { student } => cli::credits::apply_all(student.as_deref()),
            CreditsCommands::Delete { id } => cli::credits::delete(id),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
