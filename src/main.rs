mod ai;
mod config;
mod db;
mod email;
mod models;
mod reconcile;
mod scan;
mod tui;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai::{Classifier, EmailClassifier};
use config::AppConfig;
use db::Database;
use email::{EmailConfig, ImapMailSource};
use models::{contact_directory, ApplicationRecord, JobStatus, Stats};
use scan::{ScanError, ScanLock, ScanReport};

#[derive(Parser)]
#[command(name = "jobtrail")]
#[command(about = "Track job applications from your inbox")]
struct Cli {
    /// Use this database file instead of the default data directory
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// View or change settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Log in to the mailbox; scans if the last scan is more than a day old
    Connect,

    /// Scan the mailbox for new application emails now
    Sync,

    /// Applications grouped by status
    Board,

    /// List applications
    List {
        /// Only this status (applied, oa, interviewing, offer, rejected, unknown)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one application with its emails and contacts
    Show {
        /// Application ID
        id: String,
    },

    /// Every recruiter contact across all applications
    Contacts,

    /// Summary numbers
    Stats,

    /// Set or clear the notes on an application
    Note {
        id: String,
        /// Omit to clear
        text: Option<String>,
    },

    /// Set or clear the role of an application
    Role {
        id: String,
        /// Omit to clear
        text: Option<String>,
    },

    /// Interactive browser
    Browse {
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Delete all applications, settings and the sync watermark
    Wipe {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Set a value (empty value clears it)
    Set { key: String, value: String },

    /// Show current settings with secrets masked
    Show,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let db = match &cli.db {
        Some(path) => Database::open_at(path)?,
        None => Database::open()?,
    };
    let lock = ScanLock::new();

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Config { command } => {
            db.ensure_initialized()?;
            match command {
                ConfigCommands::Set { key, value } => {
                    let mut config = AppConfig::load(&db)?;
                    config.set(&key, &value)?;
                    config.save(&db)?;
                    if value.trim().is_empty() {
                        println!("Cleared {}.", key);
                    } else {
                        println!("Set {}.", key);
                    }
                }
                ConfigCommands::Show => {
                    let config = AppConfig::load(&db)?;
                    for (key, value) in config.masked() {
                        println!("{:<20} {}", key, value);
                    }
                    let watermark = db.load_watermark()?;
                    let last = watermark
                        .as_datetime()
                        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!("{:<20} {}", "last_sync", last);
                }
            }
        }

        Commands::Connect => {
            db.ensure_initialized()?;
            let config = AppConfig::load(&db)?;
            let mut source = connect_mailbox(&config)?;
            println!("Connected.");

            let watermark = db.load_watermark()?;
            if scan::should_auto_scan(watermark, Utc::now()) {
                println!("Last scan is more than a day old, scanning now...");
                let result = require_classifier(&config)
                    .and_then(|classifier| run_sync(&db, &config, &classifier, &mut source, &lock));
                if let Err(e) = result {
                    eprintln!("Scan skipped: {:#}", e);
                }
            } else {
                println!("Scanned recently; run 'jobtrail sync' to scan again.");
            }
            source.logout();
        }

        Commands::Sync => {
            db.ensure_initialized()?;
            let config = AppConfig::load(&db)?;
            let classifier = require_classifier(&config)?;
            let mut source = connect_mailbox(&config)?;
            let result = run_sync(&db, &config, &classifier, &mut source, &lock);
            source.logout();
            result?;
        }

        Commands::Board => {
            db.ensure_initialized()?;
            let records = db.load_records()?;
            print_board(&records);
        }

        Commands::List { status } => {
            db.ensure_initialized()?;
            let filter = parse_status_filter(status.as_deref())?;
            let records: Vec<ApplicationRecord> = db
                .load_records()?
                .into_iter()
                .filter(|r| filter.is_none_or(|s| r.status == s))
                .collect();
            if records.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<18} {:<16} {:<24} {:<20} {:<11} {:>6}",
                    "ID", "STATUS", "COMPANY", "ROLE", "UPDATED", "EMAILS"
                );
                println!("{}", "-".repeat(100));
                for record in records {
                    println!(
                        "{:<18} {:<16} {:<24} {:<20} {:<11} {:>6}",
                        truncate(&record.id, 16),
                        record.status,
                        truncate(&record.company, 22),
                        truncate(record.role.as_deref().unwrap_or("-"), 18),
                        record.last_updated.format("%Y-%m-%d").to_string(),
                        record.emails.len()
                    );
                }
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            let records = db.load_records()?;
            match records.iter().find(|r| r.id == id) {
                Some(record) => print_record(record),
                None => println!("Application '{}' not found.", id),
            }
        }

        Commands::Contacts => {
            db.ensure_initialized()?;
            let records = db.load_records()?;
            let contacts = contact_directory(&records);
            if contacts.is_empty() {
                println!("No recruiter contacts yet.");
            } else {
                println!(
                    "{:<22} {:<30} {:<18} {:<18} {:<11}",
                    "NAME", "EMAIL", "ROLE", "COMPANY", "LAST"
                );
                println!("{}", "-".repeat(103));
                for contact in contacts {
                    println!(
                        "{:<22} {:<30} {:<18} {:<18} {:<11}",
                        truncate(&contact.name, 20),
                        truncate(&contact.email, 28),
                        truncate(&contact.role, 16),
                        truncate(&contact.company, 16),
                        contact.last_contact_date.format("%Y-%m-%d").to_string()
                    );
                    if let Some(linked_in) = &contact.linked_in {
                        println!("{:<22} {}", "", linked_in);
                    }
                }
            }
        }

        Commands::Stats => {
            db.ensure_initialized()?;
            let stats = Stats::from_records(&db.load_records()?);
            println!("Total applied:  {}", stats.total_applied);
            println!("Interviews:     {}", stats.interviews);
            println!("Offers:         {}", stats.offers);
            println!("Response rate:  {}%", stats.response_rate);
        }

        Commands::Note { id, text } => {
            db.ensure_initialized()?;
            let text = text.filter(|t| !t.trim().is_empty());
            if !db.update_notes(&id, text.as_deref())? {
                return Err(anyhow!("Application '{}' not found", id));
            }
            println!("{} notes for {}.", if text.is_some() { "Updated" } else { "Cleared" }, id);
        }

        Commands::Role { id, text } => {
            db.ensure_initialized()?;
            let text = text.filter(|t| !t.trim().is_empty());
            if !db.update_role(&id, text.as_deref())? {
                return Err(anyhow!("Application '{}' not found", id));
            }
            println!("{} role for {}.", if text.is_some() { "Updated" } else { "Cleared" }, id);
        }

        Commands::Browse { status } => {
            db.ensure_initialized()?;
            let filter = parse_status_filter(status.as_deref())?;
            tui::run_browse(db.load_records()?, filter)?;
        }

        Commands::Wipe { yes } => {
            db.ensure_initialized()?;
            if !yes && !confirm("Delete all applications and settings? Type 'yes' to continue: ")? {
                println!("Aborted.");
                return Ok(());
            }
            db.wipe()?;
            println!("All data removed. Set classifier_api_key again before the next scan.");
        }
    }

    Ok(())
}

fn connect_mailbox(config: &AppConfig) -> Result<ImapMailSource> {
    let username = config.mail_username.as_deref().ok_or_else(|| {
        anyhow!("mail_username is not set. Run 'jobtrail config set mail_username <address>'")
    })?;
    let password_path = config.password_path().ok_or_else(|| {
        anyhow!("mail_password_file is not set. Run 'jobtrail config set mail_password_file <path>'")
    })?;

    let email_config = EmailConfig::from_password_file(config.server(), username, &password_path)?;
    println!("Connecting to {} as {}...", email_config.server, username);
    ImapMailSource::connect(email_config)
}

/// A scan without a usable classifier key stops here, before any mailbox traffic.
fn require_classifier(config: &AppConfig) -> Result<EmailClassifier> {
    let classifier = EmailClassifier::from_config(config)?;
    if !classifier.is_configured() {
        return Err(ScanError::Configuration(
            "set classifier_api_key (at least 10 characters) or JOBTRAIL_API_KEY".to_string(),
        )
        .into());
    }
    Ok(classifier)
}

fn run_sync(
    db: &Database,
    config: &AppConfig,
    classifier: &EmailClassifier,
    source: &mut ImapMailSource,
    lock: &ScanLock,
) -> Result<()> {
    let reconciler = config.reconciler()?;
    info!(matcher = reconciler.matcher_name(), policy = ?reconciler.policy(), "starting scan");

    println!("Scanning...");
    let report = scan::sync(db, source, classifier, &reconciler, lock, &Utc::now)
        .context("Scan failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!("\nResults:");
    println!("  Candidate emails: {}", report.candidates);
    println!("  Job related:      {}", report.job_related);
    println!("  New applications: {}", report.created);
    println!("  Updated:          {}", report.merged);
    if report.fetch_failures > 0 {
        println!("  Not fetched:      {}", report.fetch_failures);
    }
}

fn print_board(records: &[ApplicationRecord]) {
    if records.is_empty() {
        println!("No applications tracked yet. Run 'jobtrail sync' first.");
        return;
    }
    for status in JobStatus::BOARD {
        let column: Vec<&ApplicationRecord> =
            records.iter().filter(|r| r.status == status).collect();
        println!("{} ({})", status, column.len());
        for record in column {
            let role = record
                .role
                .as_deref()
                .map(|r| format!(" - {}", truncate(r, 30)))
                .unwrap_or_default();
            println!(
                "  {:<30}{} ({})",
                truncate(&record.company, 28),
                role,
                record.last_updated.format("%Y-%m-%d")
            );
        }
        println!();
    }
    let unknown = records.iter().filter(|r| !r.status.is_known()).count();
    if unknown > 0 {
        println!("{} application(s) with unknown status not shown.", unknown);
    }
}

fn print_record(record: &ApplicationRecord) {
    println!("Application {}", record.id);
    println!("Company: {}", record.company);
    if let Some(role) = &record.role {
        println!("Role: {}", role);
    }
    println!("Status: {}", record.status);
    println!("Last updated: {}", record.last_updated.format("%Y-%m-%d %H:%M UTC"));
    if let Some(notes) = &record.notes {
        println!("\n--- Notes ---\n{}", textwrap::fill(notes, 80));
    }

    println!("\n--- Emails ({}) ---", record.emails.len());
    for email in &record.emails {
        println!("{}  {}", email.date.format("%Y-%m-%d"), email.subject);
        println!("    from {}", email.sender);
        for line in textwrap::fill(&email.snippet, 76).lines() {
            println!("    {}", line);
        }
    }

    if !record.contacts.is_empty() {
        println!("\n--- Contacts ---");
        for contact in &record.contacts {
            println!("{} <{}> {}", contact.name, contact.email, contact.role);
            if let Some(linked_in) = &contact.linked_in {
                println!("    {}", linked_in);
            }
        }
    }
}

fn parse_status_filter(status: Option<&str>) -> Result<Option<JobStatus>> {
    status.map(|s| s.parse::<JobStatus>()).transpose()
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
