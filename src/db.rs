use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::{ApplicationRecord, EmailSummary, JobStatus, RecruiterContact, Watermark};

const WATERMARK_KEY: &str = "last_sync_millis";
const SCAN_CLAIM_KEY: &str = "scan_claim";

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrail") {
            Ok(proj_dirs.data_dir().join("jobtrail.db"))
        } else {
            Ok(PathBuf::from("jobtrail.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                company TEXT NOT NULL,
                role TEXT,
                status TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS application_emails (
                application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                email_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                sender TEXT NOT NULL,
                date TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (application_id, email_id)
            );

            CREATE TABLE IF NOT EXISTS application_contacts (
                application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                email TEXT NOT NULL COLLATE NOCASE,
                role TEXT NOT NULL,
                linked_in TEXT,
                company TEXT NOT NULL,
                last_contact_date TEXT NOT NULL,
                PRIMARY KEY (application_id, email)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applications_position ON applications(position);
            CREATE INDEX IF NOT EXISTS idx_applications_status ON applications(status);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobtrail init' first."
            ));
        }
        Ok(())
    }

    // --- Record collection ---

    pub fn load_records(&self) -> Result<Vec<ApplicationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, company, role, status, last_updated, notes
             FROM applications ORDER BY position",
        )?;
        let mut records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load applications")?;

        for record in &mut records {
            record.emails = self.load_emails(&record.id)?;
            record.contacts = self.load_contacts(&record.id)?;
        }
        Ok(records)
    }

    fn load_emails(&self, application_id: &str) -> Result<Vec<EmailSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT email_id, subject, snippet, sender, date, body
             FROM application_emails WHERE application_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([application_id], |row| {
            Ok(EmailSummary {
                id: row.get(0)?,
                subject: row.get(1)?,
                snippet: row.get(2)?,
                sender: row.get(3)?,
                date: parse_timestamp(&row.get::<_, String>(4)?),
                body: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to load emails for application {}", application_id))
    }

    fn load_contacts(&self, application_id: &str) -> Result<Vec<RecruiterContact>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, email, role, linked_in, company, last_contact_date
             FROM application_contacts WHERE application_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([application_id], |row| {
            Ok(RecruiterContact {
                name: row.get(0)?,
                email: row.get(1)?,
                role: row.get(2)?,
                linked_in: row.get(3)?,
                company: row.get(4)?,
                last_contact_date: parse_timestamp(&row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to load contacts for application {}", application_id))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ApplicationRecord> {
        let status: String = row.get(3)?;
        let last_updated: String = row.get(4)?;
        Ok(ApplicationRecord {
            id: row.get(0)?,
            company: row.get(1)?,
            role: row.get(2)?,
            status: JobStatus::parse_lenient(&status),
            last_updated: parse_timestamp(&last_updated),
            emails: Vec::new(),
            contacts: Vec::new(),
            notes: row.get(5)?,
        })
    }

    /// Replace the whole collection.
    #[cfg(test)]
    pub fn save_records(&self, records: &[ApplicationRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        replace_records(&tx, records)?;
        tx.commit().context("Failed to commit applications")?;
        Ok(())
    }

    /// Publish a finished scan: the collection and the watermark land together or not at all.
    pub fn commit_scan(&self, records: &[ApplicationRecord], watermark: Watermark) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        replace_records(&tx, records)?;
        put_setting(&tx, WATERMARK_KEY, &watermark.millis().to_string())?;
        tx.commit().context("Failed to commit scan results")?;
        info!(
            applications = records.len(),
            watermark = watermark.millis(),
            "committed scan"
        );
        Ok(())
    }

    pub fn load_watermark(&self) -> Result<Watermark> {
        let value = self.get_setting(WATERMARK_KEY)?;
        Ok(value
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(Watermark)
            .unwrap_or(Watermark::NEVER))
    }

    pub fn update_notes(&self, id: &str, notes: Option<&str>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE applications SET notes = ?1 WHERE id = ?2",
            params![notes, id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_role(&self, id: &str, role: Option<&str>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE applications SET role = ?1 WHERE id = ?2",
            params![role, id],
        )?;
        Ok(changed > 0)
    }

    /// Delete every application and every setting (credentials and watermark included).
    pub fn wipe(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM application_contacts", [])?;
        tx.execute("DELETE FROM application_emails", [])?;
        tx.execute("DELETE FROM applications", [])?;
        tx.execute("DELETE FROM settings", [])?;
        tx.commit().context("Failed to wipe local data")?;
        info!("wiped all local data");
        Ok(())
    }

    // --- Scan claim ---

    /// Claim the single scan slot for `owner`. The claim is a settings row, so
    /// every connection to the same file sees it. A claim older than
    /// `stale_after` belongs to a process that died mid-scan and is taken over.
    pub fn try_claim_scan(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        // IMMEDIATE takes the write lock up front, so two claimers cannot both read "free".
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to lock the database for a scan claim")?;
        let held: Option<String> = tx
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [SCAN_CLAIM_KEY],
                |row| row.get(0),
            )
            .optional()?;

        if let Some((holder, since)) = held.as_deref().and_then(parse_claim) {
            let age = now.timestamp_millis() - since;
            if holder != owner && age < stale_after.num_milliseconds() {
                debug!(holder, age_ms = age, "scan slot is taken");
                return Ok(false);
            }
            if holder != owner {
                warn!(holder, age_ms = age, "taking over a stale scan claim");
            }
        }

        put_setting(
            &tx,
            SCAN_CLAIM_KEY,
            &format!("{} {}", owner, now.timestamp_millis()),
        )?;
        tx.commit().context("Failed to record scan claim")?;
        Ok(true)
    }

    /// Drop `owner`'s claim. Someone else's claim is left alone.
    pub fn release_scan(&self, owner: &str) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let held: Option<String> = tx
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [SCAN_CLAIM_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if held.as_deref().and_then(parse_claim).is_some_and(|(holder, _)| holder == owner) {
            tx.execute("DELETE FROM settings WHERE key = ?1", [SCAN_CLAIM_KEY])?;
        }
        tx.commit().context("Failed to release scan claim")?;
        Ok(())
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read setting '{}'", key))
    }

    #[cfg(test)]
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        put_setting(&self.conn, key, value)
    }

    /// Write several settings atomically. `None` removes the key.
    pub fn set_settings(&self, pairs: &[(&str, Option<&str>)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (key, value) in pairs {
            match value {
                Some(v) => put_setting(&tx, key, v)?,
                None => {
                    tx.execute("DELETE FROM settings WHERE key = ?1", [key])?;
                }
            }
        }
        tx.commit().context("Failed to save settings")?;
        Ok(())
    }
}

fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn replace_records(tx: &Transaction, records: &[ApplicationRecord]) -> Result<()> {
    tx.execute("DELETE FROM application_contacts", [])?;
    tx.execute("DELETE FROM application_emails", [])?;
    tx.execute("DELETE FROM applications", [])?;

    let mut insert_app = tx.prepare(
        "INSERT INTO applications (id, position, company, role, status, last_updated, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut insert_email = tx.prepare(
        "INSERT OR IGNORE INTO application_emails
            (application_id, position, email_id, subject, snippet, sender, date, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    let mut insert_contact = tx.prepare(
        "INSERT OR IGNORE INTO application_contacts
            (application_id, position, name, email, role, linked_in, company, last_contact_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;

    for (position, record) in records.iter().enumerate() {
        insert_app
            .execute(params![
                record.id,
                position as i64,
                record.company,
                record.role,
                record.status.label(),
                record.last_updated.to_rfc3339(),
                record.notes,
            ])
            .with_context(|| format!("Failed to save application {}", record.id))?;

        for (i, email) in record.emails.iter().enumerate() {
            insert_email.execute(params![
                record.id,
                i as i64,
                email.id,
                email.subject,
                email.snippet,
                email.sender,
                email.date.to_rfc3339(),
                email.body,
            ])?;
        }

        for (i, contact) in record.contacts.iter().enumerate() {
            insert_contact.execute(params![
                record.id,
                i as i64,
                contact.name,
                contact.email,
                contact.role,
                contact.linked_in,
                contact.company,
                contact.last_contact_date.to_rfc3339(),
            ])?;
        }
    }

    debug!(applications = records.len(), "replaced application collection");
    Ok(())
}

// "<owner> <millis>"
fn parse_claim(value: &str) -> Option<(&str, i64)> {
    let (owner, millis) = value.rsplit_once(' ')?;
    Some((owner, millis.parse().ok()?))
}

// Unparseable timestamps load as the epoch rather than failing the whole load.
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
