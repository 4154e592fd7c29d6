use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Applied,
    #[serde(rename = "OA / Skill Test")]
    OaReceived,
    Interviewing,
    Offer,
    Rejected,
    Unknown,
}

impl JobStatus {
    /// Board columns, in display order. `Unknown` never gets a column.
    pub const BOARD: [JobStatus; 5] = [
        JobStatus::Applied,
        JobStatus::OaReceived,
        JobStatus::Interviewing,
        JobStatus::Offer,
        JobStatus::Rejected,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Applied => "Applied",
            JobStatus::OaReceived => "OA / Skill Test",
            JobStatus::Interviewing => "Interviewing",
            JobStatus::Offer => "Offer",
            JobStatus::Rejected => "Rejected",
            JobStatus::Unknown => "Unknown",
        }
    }

    /// Progression rank. Offer and Rejected are both terminal.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Unknown => 0,
            JobStatus::Applied => 1,
            JobStatus::OaReceived => 2,
            JobStatus::Interviewing => 3,
            JobStatus::Offer | JobStatus::Rejected => 4,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != JobStatus::Unknown
    }

    /// Like `from_str`, but anything unrecognised becomes `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(JobStatus::Unknown)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "applied" => Ok(JobStatus::Applied),
            "oaskilltest" | "oareceived" | "oa" | "skilltest" | "assessment" => {
                Ok(JobStatus::OaReceived)
            }
            "interviewing" | "interview" => Ok(JobStatus::Interviewing),
            "offer" => Ok(JobStatus::Offer),
            "rejected" | "rejection" => Ok(JobStatus::Rejected),
            "unknown" => Ok(JobStatus::Unknown),
            _ => Err(anyhow!(
                "Unknown status '{}'. Expected one of: applied, oa, interviewing, offer, rejected",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSummary {
    pub id: String, // source-unique (IMAP UID)
    pub subject: String,
    pub snippet: String,
    pub sender: String,
    pub date: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecruiterContact {
    pub name: String,
    pub email: String,
    pub role: String,
    pub linked_in: Option<String>,
    pub company: String, // from the analysis, not the owning record
    pub last_contact_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: String, // id of the first email that created the record
    pub company: String,
    pub role: Option<String>,
    pub status: JobStatus,
    pub last_updated: DateTime<Utc>,
    pub emails: Vec<EmailSummary>,
    pub contacts: Vec<RecruiterContact>,
    pub notes: Option<String>,
}

impl ApplicationRecord {
    pub fn has_email(&self, email_id: &str) -> bool {
        self.emails.iter().any(|e| e.id == email_id)
    }

    pub fn has_contact(&self, address: &str) -> bool {
        self.contacts
            .iter()
            .any(|c| c.email.trim().eq_ignore_ascii_case(address.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecruiterDetails {
    pub name: String,
    pub email: String,
    pub role: String,
    pub linked_in: Option<String>,
}

/// Classifier judgment about a single email. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub is_job_related: bool,
    pub company: String,
    pub status_update: JobStatus,
    pub recruiter: Option<RecruiterDetails>,
}

impl AnalysisResult {
    pub fn not_job_related() -> Self {
        Self {
            is_job_related: false,
            company: String::new(),
            status_update: JobStatus::Unknown,
            recruiter: None,
        }
    }
}

/// Milliseconds since epoch of the last completed scan. Zero means never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Watermark(pub i64);

impl Watermark {
    pub const NEVER: Watermark = Watermark(0);

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn is_never(&self) -> bool {
        self.0 <= 0
    }

    pub fn advance_to(self, now: DateTime<Utc>) -> Watermark {
        Watermark(self.0.max(now.timestamp_millis()))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.timestamp_millis() - self.0 > window.num_milliseconds()
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_never() {
            return None;
        }
        Utc.timestamp_millis_opt(self.0).single()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stats {
    pub total_applied: usize,
    pub interviews: usize,
    pub offers: usize,
    pub response_rate: u32,
}

impl Stats {
    pub fn from_records(records: &[ApplicationRecord]) -> Self {
        let total_applied = records.len();
        let count = |status: JobStatus| records.iter().filter(|r| r.status == status).count();
        let responded = records
            .iter()
            .filter(|r| r.status != JobStatus::Applied)
            .count();
        let response_rate = if total_applied > 0 {
            (responded as f64 * 100.0 / total_applied as f64).round() as u32
        } else {
            0
        };
        Self {
            total_applied,
            interviews: count(JobStatus::Interviewing),
            offers: count(JobStatus::Offer),
            response_rate,
        }
    }
}

/// Every recruiter contact across all records, in record order.
pub fn contact_directory(records: &[ApplicationRecord]) -> Vec<&RecruiterContact> {
    records.iter().flat_map(|r| r.contacts.iter()).collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_status_parse_accepts_labels_and_variants() {
        assert_eq!("OA / Skill Test".parse::<JobStatus>().unwrap(), JobStatus::OaReceived);
        assert_eq!("oa".parse::<JobStatus>().unwrap(), JobStatus::OaReceived);
        assert_eq!("OA_Received".parse::<JobStatus>().unwrap(), JobStatus::OaReceived);
        assert_eq!("interviewing".parse::<JobStatus>().unwrap(), JobStatus::Interviewing);
        assert_eq!(" Offer ".parse::<JobStatus>().unwrap(), JobStatus::Offer);
        assert!("ghosted".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_parse_lenient_falls_back_to_unknown() {
        assert_eq!(JobStatus::parse_lenient("maybe?"), JobStatus::Unknown);
        assert_eq!(JobStatus::parse_lenient("Rejected"), JobStatus::Rejected);
    }

    #[test]
    fn test_status_serde_uses_labels() {
        let json = serde_json::to_string(&JobStatus::OaReceived).unwrap();
        assert_eq!(json, "\"OA / Skill Test\"");
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobStatus::OaReceived);
    }

    #[test]
    fn test_display_honours_width() {
        assert_eq!(format!("{:<8}|", JobStatus::Offer), "Offer   |");
    }

    #[test]
    fn test_board_excludes_unknown() {
        assert!(!JobStatus::BOARD.contains(&JobStatus::Unknown));
        assert_eq!(JobStatus::BOARD.len(), 5);
    }

    #[test]
    fn test_stats_zero_records_has_zero_response_rate() {
        let stats = Stats::from_records(&[]);
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn test_stats_counts_and_rounds_response_rate() {
        let records = vec![
            record("1", "Acme", JobStatus::Applied),
            record("2", "Globex", JobStatus::Interviewing),
            record("3", "Initech", JobStatus::Offer),
        ];
        let stats = Stats::from_records(&records);
        assert_eq!(stats.total_applied, 3);
        assert_eq!(stats.interviews, 1);
        assert_eq!(stats.offers, 1);
        // 2/3 responded
        assert_eq!(stats.response_rate, 67);
    }

    #[test]
    fn test_watermark_advance_never_goes_backwards() {
        let wm = Watermark(at(100).timestamp_millis());
        assert_eq!(wm.advance_to(at(50)), wm);
        assert_eq!(wm.advance_to(at(200)), Watermark(at(200).timestamp_millis()));
    }

    #[test]
    fn test_watermark_staleness() {
        let day = Duration::hours(24);
        assert!(Watermark::NEVER.is_stale(at(0), day));
        let wm = Watermark(at(0).timestamp_millis());
        assert!(!wm.is_stale(at(3600), day));
        assert!(wm.is_stale(at(24 * 3600 + 1), day));
    }

    #[test]
    fn test_contact_directory_flattens_in_record_order() {
        let mut a = record("1", "Acme", JobStatus::Applied);
        let mut b = record("2", "Globex", JobStatus::Applied);
        let contact = |name: &str| RecruiterContact {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            role: "Recruiter".to_string(),
            linked_in: None,
            company: "x".to_string(),
            last_contact_date: at(0),
        };
        a.contacts.push(contact("ann"));
        b.contacts.push(contact("bob"));
        let records = vec![a, b];
        let names: Vec<_> = contact_directory(&records).iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["ann", "bob"]);
    }

    #[test]
    fn test_has_contact_ignores_case() {
        let mut r = record("1", "Acme", JobStatus::Applied);
        r.contacts.push(RecruiterContact {
            name: "Ann".to_string(),
            email: "Ann@Acme.com".to_string(),
            role: String::new(),
            linked_in: None,
            company: "Acme".to_string(),
            last_contact_date: at(0),
        });
        assert!(r.has_contact("ann@acme.com"));
        assert!(!r.has_contact("bob@acme.com"));
    }
}
