//! Folds per-email analyses into the application collection.
//!
//! Identity is resolved by a pluggable [`CompanyMatcher`]; the first record in
//! insertion order that matches wins. Status changes go through a
//! [`StatusPolicy`]. Email and contact appends are guarded by existence checks,
//! so re-ingesting the same email leaves those fields unchanged.

use chrono::{DateTime, Utc};
use strsim::jaro_winkler;
use tracing::debug;

use crate::models::{
    AnalysisResult, ApplicationRecord, EmailSummary, JobStatus, RecruiterContact,
    RecruiterDetails,
};

pub trait CompanyMatcher {
    fn matches(&self, stored: &str, candidate: &str) -> bool;
    fn name(&self) -> &'static str;
}

/// Case-insensitive containment in either direction ("Acme" ~ "Acme Corp").
/// Short names can collide ("Meta" ~ "MetaSoft").
#[derive(Debug, Default, Clone, Copy)]
pub struct SubstringMatcher;

impl CompanyMatcher for SubstringMatcher {
    fn matches(&self, stored: &str, candidate: &str) -> bool {
        let stored = stored.to_lowercase();
        let candidate = candidate.to_lowercase();
        stored.contains(&candidate) || candidate.contains(&stored)
    }

    fn name(&self) -> &'static str {
        "substring"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatcher;

impl CompanyMatcher for ExactMatcher {
    fn matches(&self, stored: &str, candidate: &str) -> bool {
        stored.trim().to_lowercase() == candidate.trim().to_lowercase()
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}

/// Jaro-Winkler over names with punctuation and corporate suffixes removed.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    pub threshold: f64,
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self { threshold: 0.92 }
    }
}

impl SimilarityMatcher {
    pub fn normalize(name: &str) -> String {
        const SUFFIXES: [&str; 8] = ["inc", "corp", "corporation", "llc", "ltd", "co", "gmbh", "plc"];
        name.to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .filter(|w| !SUFFIXES.contains(w))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl CompanyMatcher for SimilarityMatcher {
    fn matches(&self, stored: &str, candidate: &str) -> bool {
        let a = Self::normalize(stored);
        let b = Self::normalize(candidate);
        if a.is_empty() || b.is_empty() {
            return false;
        }
        jaro_winkler(&a, &b) >= self.threshold
    }

    fn name(&self) -> &'static str {
        "similarity"
    }
}

pub fn matcher_by_name(name: &str) -> Option<Box<dyn CompanyMatcher>> {
    match name {
        "substring" => Some(Box::new(SubstringMatcher)),
        "exact" => Some(Box::new(ExactMatcher)),
        "similarity" | "fuzzy" => Some(Box::new(SimilarityMatcher::default())),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPolicy {
    /// The most recently processed non-Unknown status wins, even if it regresses.
    #[default]
    LatestWins,
    /// Only move to a status of equal or higher rank.
    HighestRank,
}

impl StatusPolicy {
    pub fn resolve(&self, current: JobStatus, incoming: JobStatus) -> JobStatus {
        if !incoming.is_known() {
            return current;
        }
        match self {
            StatusPolicy::LatestWins => incoming,
            StatusPolicy::HighestRank => {
                if incoming.rank() >= current.rank() {
                    incoming
                } else {
                    current
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotJobRelated,
    EmptyCompany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created {
        id: String,
    },
    Merged {
        id: String,
        status_changed: bool,
        email_added: bool,
        contact_added: bool,
    },
    Dropped(DropReason),
}

pub struct Reconciler {
    matcher: Box<dyn CompanyMatcher>,
    policy: StatusPolicy,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(Box::new(SubstringMatcher), StatusPolicy::default())
    }
}

impl Reconciler {
    pub fn new(matcher: Box<dyn CompanyMatcher>, policy: StatusPolicy) -> Self {
        Self { matcher, policy }
    }

    pub fn matcher_name(&self) -> &'static str {
        self.matcher.name()
    }

    pub fn policy(&self) -> StatusPolicy {
        self.policy
    }

    pub fn find_match(&self, records: &[ApplicationRecord], company: &str) -> Option<usize> {
        records
            .iter()
            .position(|r| self.matcher.matches(&r.company, company))
    }

    pub fn apply(
        &self,
        records: &mut Vec<ApplicationRecord>,
        analysis: &AnalysisResult,
        email: &EmailSummary,
        now: DateTime<Utc>,
    ) -> Outcome {
        if !analysis.is_job_related {
            return Outcome::Dropped(DropReason::NotJobRelated);
        }
        let company = analysis.company.trim();
        if company.is_empty() {
            return Outcome::Dropped(DropReason::EmptyCompany);
        }

        let recruiter = usable_recruiter(analysis.recruiter.as_ref());

        match self.find_match(records, company) {
            Some(idx) => {
                let record = &mut records[idx];

                let next = self.policy.resolve(record.status, analysis.status_update);
                let status_changed = next != record.status;
                record.status = next;

                let email_added = !record.has_email(&email.id);
                if email_added {
                    record.emails.push(email.clone());
                }

                let mut contact_added = false;
                if let Some(details) = recruiter {
                    if !record.has_contact(&details.email) {
                        record.contacts.push(to_contact(details, company, now));
                        contact_added = true;
                    }
                }

                record.last_updated = now;

                debug!(
                    id = %record.id,
                    company = %record.company,
                    status = %record.status,
                    status_changed,
                    email_added,
                    contact_added,
                    "merged analysis into existing application"
                );

                Outcome::Merged {
                    id: record.id.clone(),
                    status_changed,
                    email_added,
                    contact_added,
                }
            }
            None => {
                let status = if analysis.status_update.is_known() {
                    analysis.status_update
                } else {
                    JobStatus::Applied
                };
                let record = ApplicationRecord {
                    id: unique_id(records, &email.id),
                    company: company.to_string(),
                    role: None,
                    status,
                    last_updated: now,
                    emails: vec![email.clone()],
                    contacts: recruiter
                        .map(|details| vec![to_contact(details, company, now)])
                        .unwrap_or_default(),
                    notes: None,
                };
                debug!(id = %record.id, company = %record.company, status = %record.status, "created application");
                let id = record.id.clone();
                records.push(record);
                Outcome::Created { id }
            }
        }
    }
}

// Ids are the creating email's id. The same email can create a second record
// when a later analysis names a different company, so suffix to stay unique.
fn unique_id(records: &[ApplicationRecord], email_id: &str) -> String {
    let taken = |id: &str| records.iter().any(|r| r.id == id);
    if !taken(email_id) {
        return email_id.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", email_id, n))
        .find(|id| !taken(id))
        .unwrap_or_else(|| email_id.to_string())
}

// A recruiter without an address can't be deduplicated, so it is ignored.
fn usable_recruiter(recruiter: Option<&RecruiterDetails>) -> Option<&RecruiterDetails> {
    recruiter.filter(|r| !r.email.trim().is_empty())
}

fn to_contact(details: &RecruiterDetails, company: &str, now: DateTime<Utc>) -> RecruiterContact {
    RecruiterContact {
        name: details.name.trim().to_string(),
        email: details.email.trim().to_string(),
        role: details.role.trim().to_string(),
        linked_in: details
            .linked_in
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        company: company.to_string(),
        last_contact_date: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;

    #[test]
    fn test_creates_record_from_first_analysis() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        let outcome = reconciler.apply(
            &mut records,
            &analysis("Acme", JobStatus::Applied),
            &email("e1"),
            at(10),
        );

        assert_eq!(outcome, Outcome::Created { id: "e1".to_string() });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "e1");
        assert_eq!(records[0].company, "Acme");
        assert_eq!(records[0].status, JobStatus::Applied);
        assert_eq!(records[0].emails, vec![email("e1")]);
        assert_eq!(records[0].last_updated, at(10));
    }

    #[test]
    fn test_substring_match_merges_and_updates_status() {
        let reconciler = Reconciler::default();
        let mut records = vec![record("e1", "Acme Corp", JobStatus::Applied)];
        let outcome = reconciler.apply(
            &mut records,
            &analysis("Acme", JobStatus::Interviewing),
            &email("e2"),
            at(20),
        );

        assert!(matches!(outcome, Outcome::Merged { status_changed: true, email_added: true, .. }));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].company, "Acme Corp");
        assert_eq!(records[0].status, JobStatus::Interviewing);
        let ids: Vec<_> = records[0].emails.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_unknown_status_never_overwrites() {
        let reconciler = Reconciler::default();
        let mut records = vec![record("e1", "Acme Corp", JobStatus::Interviewing)];
        reconciler.apply(
            &mut records,
            &analysis("Acme", JobStatus::Unknown),
            &email("e3"),
            at(30),
        );

        assert_eq!(records[0].status, JobStatus::Interviewing);
        assert_eq!(records[0].emails.len(), 2);
        assert_eq!(records[0].last_updated, at(30));
    }

    #[test]
    fn test_empty_company_is_dropped() {
        let reconciler = Reconciler::default();
        let mut records = vec![record("e1", "Acme", JobStatus::Applied)];
        let before = records.clone();

        let outcome = reconciler.apply(&mut records, &analysis("   ", JobStatus::Offer), &email("e9"), at(5));

        assert_eq!(outcome, Outcome::Dropped(DropReason::EmptyCompany));
        assert_eq!(records, before);
    }

    #[test]
    fn test_not_job_related_is_dropped() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        let mut a = analysis("Acme", JobStatus::Offer);
        a.is_job_related = false;

        let outcome = reconciler.apply(&mut records, &a, &email("e1"), at(0));

        assert_eq!(outcome, Outcome::Dropped(DropReason::NotJobRelated));
        assert!(records.is_empty());
    }

    #[test]
    fn test_default_status_is_applied_on_creation() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        reconciler.apply(&mut records, &analysis("Globex", JobStatus::Unknown), &email("g1"), at(0));
        assert_eq!(records[0].status, JobStatus::Applied);
    }

    #[test]
    fn test_same_email_twice_is_idempotent_for_emails() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        let a = analysis("Acme", JobStatus::Applied);
        reconciler.apply(&mut records, &a, &email("e1"), at(0));
        let outcome = reconciler.apply(&mut records, &a, &email("e1"), at(1));

        assert!(matches!(outcome, Outcome::Merged { email_added: false, .. }));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].emails.len(), 1);
    }

    #[test]
    fn test_recruiter_contact_is_deduplicated_by_email() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        let mut a = analysis("Acme", JobStatus::Applied);
        a.recruiter = Some(recruiter("Ann Lee", "ann@acme.com"));
        reconciler.apply(&mut records, &a, &email("e1"), at(0));

        let mut again = analysis("Acme Inc", JobStatus::Unknown);
        again.recruiter = Some(recruiter("Ann", "ANN@acme.com"));
        let outcome = reconciler.apply(&mut records, &again, &email("e2"), at(1));

        assert!(matches!(outcome, Outcome::Merged { contact_added: false, .. }));
        assert_eq!(records[0].contacts.len(), 1);
        assert_eq!(records[0].contacts[0].company, "Acme");
        assert_eq!(records[0].contacts[0].last_contact_date, at(0));
    }

    #[test]
    fn test_new_contact_carries_analysis_company() {
        let reconciler = Reconciler::default();
        let mut records = vec![record("e1", "Acme Corporation", JobStatus::Applied)];
        let mut a = analysis("Acme", JobStatus::Unknown);
        a.recruiter = Some(recruiter("Bob", "bob@acme.com"));
        reconciler.apply(&mut records, &a, &email("e2"), at(7));

        let contact = &records[0].contacts[0];
        assert_eq!(contact.company, "Acme");
        assert_eq!(contact.last_contact_date, at(7));
    }

    #[test]
    fn test_blank_recruiter_email_is_ignored() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        let mut a = analysis("Acme", JobStatus::Applied);
        a.recruiter = Some(recruiter("Nobody", "  "));
        reconciler.apply(&mut records, &a, &email("e1"), at(0));
        assert!(records[0].contacts.is_empty());
    }

    #[test]
    fn test_two_emails_same_new_company_merge_last_write_wins() {
        let reconciler = Reconciler::default();
        let mut records = Vec::new();
        reconciler.apply(&mut records, &analysis("Globex", JobStatus::Applied), &email("g1"), at(0));
        reconciler.apply(&mut records, &analysis("Globex", JobStatus::Offer), &email("g2"), at(1));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Offer);
        assert_eq!(records[0].emails.len(), 2);
    }

    #[test]
    fn test_latest_wins_allows_downgrade() {
        let reconciler = Reconciler::default();
        let mut records = vec![record("e1", "Acme", JobStatus::Offer)];
        reconciler.apply(&mut records, &analysis("Acme", JobStatus::Applied), &email("e2"), at(0));
        assert_eq!(records[0].status, JobStatus::Applied);
    }

    #[test]
    fn test_highest_rank_blocks_downgrade() {
        let reconciler = Reconciler::new(Box::new(SubstringMatcher), StatusPolicy::HighestRank);
        let mut records = vec![record("e1", "Acme", JobStatus::Offer)];
        let outcome = reconciler.apply(&mut records, &analysis("Acme", JobStatus::Applied), &email("e2"), at(0));

        assert!(matches!(outcome, Outcome::Merged { status_changed: false, .. }));
        assert_eq!(records[0].status, JobStatus::Offer);
    }

    #[test]
    fn test_highest_rank_terminal_tie_takes_incoming() {
        assert_eq!(
            StatusPolicy::HighestRank.resolve(JobStatus::Offer, JobStatus::Rejected),
            JobStatus::Rejected
        );
        assert_eq!(
            StatusPolicy::HighestRank.resolve(JobStatus::Rejected, JobStatus::Unknown),
            JobStatus::Rejected
        );
    }

    #[test]
    fn test_first_match_in_insertion_order_wins() {
        let reconciler = Reconciler::default();
        let mut records = vec![
            record("m1", "MetaSoft", JobStatus::Applied),
            record("m2", "Meta", JobStatus::Applied),
        ];
        reconciler.apply(&mut records, &analysis("Meta", JobStatus::Interviewing), &email("m3"), at(0));

        assert_eq!(records[0].status, JobStatus::Interviewing);
        assert_eq!(records[1].status, JobStatus::Applied);
    }

    #[test]
    fn test_substring_matcher_is_bidirectional_and_symmetric() {
        let m = SubstringMatcher;
        let pairs = [
            ("Acme", "acme corp"),
            ("ACME CORP", "acme"),
            ("Globex", "Initech"),
            ("Meta", "MetaSoft"),
            ("", "anything"),
        ];
        for (a, b) in pairs {
            let expected = a.to_lowercase().contains(&b.to_lowercase())
                || b.to_lowercase().contains(&a.to_lowercase());
            assert_eq!(m.matches(a, b), expected, "{} vs {}", a, b);
            assert_eq!(m.matches(a, b), m.matches(b, a), "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_exact_matcher_rejects_substrings() {
        let m = ExactMatcher;
        assert!(m.matches("Acme", " acme "));
        assert!(!m.matches("Acme", "Acme Corp"));
    }

    #[test]
    fn test_similarity_matcher_ignores_suffixes_and_punctuation() {
        let m = SimilarityMatcher::default();
        assert!(m.matches("Acme, Inc.", "ACME"));
        assert!(m.matches("Globex Corporation", "Globex"));
        assert!(!m.matches("Meta", "Initech"));
        assert_eq!(SimilarityMatcher::normalize("Acme, Inc."), "acme");
    }

    #[test]
    fn test_exact_matcher_keeps_short_names_apart() {
        let reconciler = Reconciler::new(Box::new(ExactMatcher), StatusPolicy::LatestWins);
        let mut records = vec![record("m1", "MetaSoft", JobStatus::Applied)];
        reconciler.apply(&mut records, &analysis("Meta", JobStatus::Applied), &email("m2"), at(0));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_matcher_by_name() {
        assert_eq!(matcher_by_name("exact").map(|m| m.name()), Some("exact"));
        assert_eq!(matcher_by_name("fuzzy").map(|m| m.name()), Some("similarity"));
        assert!(matcher_by_name("levenshtein").is_none());
    }

    #[test]
    fn test_reprocessed_email_with_new_company_gets_fresh_id() {
        let reconciler = Reconciler::new(Box::new(ExactMatcher), StatusPolicy::LatestWins);
        let mut records = vec![record("e1", "Acme", JobStatus::Applied)];
        let outcome =
            reconciler.apply(&mut records, &analysis("Globex", JobStatus::Applied), &email("e1"), at(5));
        assert_eq!(outcome, Outcome::Created { id: "e1-2".to_string() });
        assert_eq!(records[1].emails[0].id, "e1");
    }
}
