use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use scraper::Html;
use std::fs;
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{EmailSummary, Watermark};

/// Upper bound on messages examined in one scan.
pub const MAX_CANDIDATES: usize = 20;
const SNIPPET_CHARS: usize = 200;

const SUBJECT_TERMS: [&str; 5] = ["application", "interview", "offer", "rejected", "assessment"];
const SENDER_TERMS: [&str; 3] = ["recruiter", "talent", "careers"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
}

/// Where candidate emails come from. Listing failures are errors; a single
/// message that cannot be fetched is just absent.
pub trait MailSource {
    fn list_since(&mut self, watermark: Watermark) -> Result<Vec<MessageRef>>;
    fn fetch_details(&mut self, id: &str) -> Option<EmailSummary>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl EmailConfig {
    pub fn new(server: &str, username: &str, password: &str) -> Self {
        Self {
            server: server.to_string(),
            port: 993,
            username: username.to_string(),
            password: password.trim().to_string(),
        }
    }

    pub fn from_password_file(server: &str, username: &str, password_file: &Path) -> Result<Self> {
        let password = fs::read_to_string(password_file)
            .with_context(|| format!("Failed to read password file: {:?}", password_file))?;
        Ok(Self::new(server, username, &password))
    }

    pub fn is_gmail(&self) -> bool {
        let server = self.server.to_lowercase();
        server.contains("gmail") || server.contains("googlemail")
    }
}

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

pub struct ImapMailSource {
    config: EmailConfig,
    session: ImapSession,
}

impl ImapMailSource {
    /// Log in and select INBOX.
    pub fn connect(config: EmailConfig) -> Result<Self> {
        let tls = native_tls::TlsConnector::builder().build()?;

        let addr = (config.server.as_str(), config.port);
        let tcp = TcpStream::connect(addr).context("Failed to connect to IMAP server")?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;
        tcp.set_write_timeout(Some(Duration::from_secs(30)))?;
        let tls_stream = tls
            .connect(&config.server, tcp)
            .map_err(|e| anyhow!("TLS handshake with {} failed: {}", config.server, e))?;

        let client = imap::Client::new(tls_stream);
        let mut session = client
            .login(&config.username, &config.password)
            .map_err(|e| anyhow!("Login failed: {}", e.0))?;

        session.select("INBOX").context("Failed to select INBOX")?;
        info!(server = %config.server, user = %config.username, "mailbox connected");

        Ok(Self { config, session })
    }

    pub fn logout(mut self) {
        if let Err(e) = self.session.logout() {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    fn search_query(&self, watermark: Watermark) -> String {
        if self.config.is_gmail() {
            format!("X-GM-RAW \"{}\"", gmail_query(watermark))
        } else {
            imap_search(watermark)
        }
    }

    fn fetch_message(&mut self, uid: u32) -> Result<EmailSummary> {
        let messages = self
            .session
            .uid_fetch(uid.to_string(), "(RFC822 INTERNALDATE)")
            .with_context(|| format!("Failed to fetch message {}", uid))?;
        let message = messages
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Message {} not found", uid))?;
        let raw = message
            .body()
            .ok_or_else(|| anyhow!("Message {} has no body", uid))?;
        let internal_date = message.internal_date().map(|d| d.with_timezone(&Utc));
        parse_message(&uid.to_string(), raw, internal_date, Utc::now())
    }
}

impl MailSource for ImapMailSource {
    fn list_since(&mut self, watermark: Watermark) -> Result<Vec<MessageRef>> {
        let query = self.search_query(watermark);
        debug!(query = %query, "searching mailbox");
        let uids = self
            .session
            .uid_search(&query)
            .context("Mailbox search failed")?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(MAX_CANDIDATES);

        Ok(uids
            .into_iter()
            .map(|uid| MessageRef { id: uid.to_string() })
            .collect())
    }

    fn fetch_details(&mut self, id: &str) -> Option<EmailSummary> {
        let uid: u32 = match id.parse() {
            Ok(uid) => uid,
            Err(_) => {
                warn!(id, "not an IMAP UID");
                return None;
            }
        };
        match self.fetch_message(uid) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(id, error = %e, "could not fetch message");
                None
            }
        }
    }
}

/// Gmail search syntax, used through the X-GM-RAW extension.
pub fn gmail_query(watermark: Watermark) -> String {
    let mut query = format!(
        "(subject:({}) OR from:({}))",
        SUBJECT_TERMS.join(" OR "),
        SENDER_TERMS.join(" OR ")
    );
    if !watermark.is_never() {
        query.push_str(&format!(" after:{}", watermark.millis() / 1000));
    }
    query
}

/// Portable IMAP SEARCH equivalent of `gmail_query`. SINCE has day granularity.
pub fn imap_search(watermark: Watermark) -> String {
    let terms: Vec<String> = SUBJECT_TERMS
        .iter()
        .map(|t| format!("SUBJECT \"{}\"", t))
        .chain(SENDER_TERMS.iter().map(|t| format!("FROM \"{}\"", t)))
        .collect();

    let mut tree = String::new();
    if let Some((last, rest)) = terms.split_last() {
        tree = last.clone();
        for term in rest.iter().rev() {
            tree = format!("OR {} {}", term, tree);
        }
    }

    match watermark.as_datetime() {
        Some(since) => format!("{} SINCE {}", tree, since.format("%d-%b-%Y")),
        None => tree,
    }
}

/// Turn a raw RFC 822 message into a summary.
pub fn parse_message(
    id: &str,
    raw: &[u8],
    internal_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<EmailSummary> {
    let parsed = parse_mail(raw).context("Malformed message")?;

    let header = |name: &str| {
        parsed
            .headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let subject = header("Subject").unwrap_or_else(|| "No Subject".to_string());
    let sender = header("From").unwrap_or_else(|| "Unknown".to_string());

    let date = internal_date
        .or_else(|| {
            header("Date")
                .and_then(|d| mailparse::dateparse(&d).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        })
        .unwrap_or(now);

    let text = find_part(&parsed, "text/plain")
        .or_else(|| find_part(&parsed, "text/html").map(|html| html_to_text(&html)))
        .unwrap_or_default();
    let snippet = make_snippet(&text);
    let body = if text.trim().is_empty() { snippet.clone() } else { text };

    Ok(EmailSummary {
        id: id.to_string(),
        subject,
        snippet,
        sender,
        date,
        body,
    })
}

fn find_part(part: &ParsedMail, mimetype: &str) -> Option<String> {
    if part.subparts.is_empty() {
        if part.get_content_disposition().disposition == DispositionType::Attachment {
            return None;
        }
        if !part.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return None;
        }
        return part.get_body().ok().filter(|b| !b.trim().is_empty());
    }
    part.subparts.iter().find_map(|p| find_part(p, mimetype))
}

pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut pieces = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "title"));
        if !hidden {
            pieces.push(text.to_string());
        }
    }
    collapse_whitespace(&pieces.join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn make_snippet(text: &str) -> String {
    collapse_whitespace(text).chars().take(SNIPPET_CHARS).collect()
}
