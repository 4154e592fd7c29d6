use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;

use crate::db::Database;
use crate::reconcile::{matcher_by_name, Reconciler, StatusPolicy};

pub const KEYS: [&str; 7] = [
    "mail_username",
    "mail_password_file",
    "mail_server",
    "classifier_api_key",
    "model",
    "matcher",
    "status_policy",
];

const DEFAULT_SERVER: &str = "imap.gmail.com";
const DEFAULT_MODEL: &str = "gemini-flash";
const DEFAULT_MATCHER: &str = "substring";

/// Settings persisted in the `settings` table. Passed explicitly to whatever needs it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub mail_username: Option<String>,
    pub mail_password_file: Option<String>,
    pub mail_server: Option<String>,
    pub classifier_api_key: Option<String>,
    pub model: Option<String>,
    pub matcher: Option<String>,
    pub status_policy: Option<String>,
}

impl AppConfig {
    pub fn load(db: &Database) -> Result<Self> {
        Ok(Self {
            mail_username: db.get_setting("mail_username")?,
            mail_password_file: db.get_setting("mail_password_file")?,
            mail_server: db.get_setting("mail_server")?,
            classifier_api_key: db.get_setting("classifier_api_key")?,
            model: db.get_setting("model")?,
            matcher: db.get_setting("matcher")?,
            status_policy: db.get_setting("status_policy")?,
        })
    }

    pub fn save(&self, db: &Database) -> Result<()> {
        db.set_settings(&[
            ("mail_username", self.mail_username.as_deref()),
            ("mail_password_file", self.mail_password_file.as_deref()),
            ("mail_server", self.mail_server.as_deref()),
            ("classifier_api_key", self.classifier_api_key.as_deref()),
            ("model", self.model.as_deref()),
            ("matcher", self.matcher.as_deref()),
            ("status_policy", self.status_policy.as_deref()),
        ])
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        let stored = if value.is_empty() { None } else { Some(value.to_string()) };

        match key {
            "mail_username" => self.mail_username = stored,
            "mail_password_file" => self.mail_password_file = stored,
            "mail_server" => self.mail_server = stored,
            "classifier_api_key" => self.classifier_api_key = stored,
            "model" => {
                if let Some(name) = &stored {
                    crate::ai::resolve_model(name)?;
                }
                self.model = stored;
            }
            "matcher" => {
                if let Some(name) = &stored {
                    if matcher_by_name(name).is_none() {
                        return Err(anyhow!(
                            "Unknown matcher '{}'. Available: substring (default), exact, similarity",
                            name
                        ));
                    }
                }
                self.matcher = stored;
            }
            "status_policy" => {
                if let Some(name) = &stored {
                    parse_policy(name)?;
                }
                self.status_policy = stored;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown setting '{}'. Available: {}",
                    key,
                    KEYS.join(", ")
                ));
            }
        }
        Ok(())
    }

    pub fn server(&self) -> &str {
        self.mail_server.as_deref().unwrap_or(DEFAULT_SERVER)
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Stored key first, then `JOBTRAIL_API_KEY`, then the provider's own variable.
    pub fn resolve_api_key(&self, provider_env_var: &str) -> Option<String> {
        self.classifier_api_key
            .clone()
            .or_else(|| env::var("JOBTRAIL_API_KEY").ok())
            .or_else(|| env::var(provider_env_var).ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    pub fn password_path(&self) -> Option<PathBuf> {
        self.mail_password_file.as_deref().map(expand_home)
    }

    pub fn reconciler(&self) -> Result<Reconciler> {
        let name = self.matcher.as_deref().unwrap_or(DEFAULT_MATCHER);
        let matcher = matcher_by_name(name).ok_or_else(|| anyhow!("Unknown matcher '{}'", name))?;
        let policy = match self.status_policy.as_deref() {
            Some(name) => parse_policy(name)?,
            None => StatusPolicy::default(),
        };
        Ok(Reconciler::new(matcher, policy))
    }

    /// Display form with secrets masked.
    pub fn masked(&self) -> Vec<(&'static str, String)> {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(not set)".to_string());
        vec![
            ("mail_username", show(&self.mail_username)),
            ("mail_password_file", show(&self.mail_password_file)),
            ("mail_server", self.server().to_string()),
            (
                "classifier_api_key",
                self.classifier_api_key
                    .as_deref()
                    .map(mask_secret)
                    .unwrap_or_else(|| "(not set)".to_string()),
            ),
            ("model", self.model_name().to_string()),
            ("matcher", self.matcher.clone().unwrap_or_else(|| DEFAULT_MATCHER.to_string())),
            ("status_policy", self.status_policy.clone().unwrap_or_else(|| "latest".to_string())),
        ]
    }
}

fn parse_policy(name: &str) -> Result<StatusPolicy> {
    match name {
        "latest" | "latest-wins" => Ok(StatusPolicy::LatestWins),
        "highest" | "highest-rank" => Ok(StatusPolicy::HighestRank),
        _ => Err(anyhow!(
            "Unknown status policy '{}'. Available: latest (default), highest",
            name
        )),
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{}/{}", home, rest))
    } else {
        PathBuf::from(path)
    }
}

fn mask_secret(secret: &str) -> String {
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{}", tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_settings_table() {
        let db = Database::open_in_memory().unwrap();
        let mut config = AppConfig::default();
        config.set("mail_username", "me@gmail.com").unwrap();
        config.set("classifier_api_key", "  AIzaSyExampleKey123  ").unwrap();
        config.set("matcher", "exact").unwrap();
        config.save(&db).unwrap();

        let loaded = AppConfig::load(&db).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.classifier_api_key.as_deref(), Some("AIzaSyExampleKey123"));
    }

    #[test]
    fn test_empty_value_clears_setting() {
        let mut config = AppConfig::default();
        config.set("mail_server", "imap.example.com").unwrap();
        config.set("mail_server", "").unwrap();
        assert_eq!(config.server(), "imap.gmail.com");
    }

    #[test]
    fn test_unknown_keys_and_values_are_rejected() {
        let mut config = AppConfig::default();
        assert!(config.set("theme", "dark").is_err());
        assert!(config.set("matcher", "levenshtein").is_err());
        assert!(config.set("status_policy", "random").is_err());
        assert!(config.set("model", "gpt-3").is_err());
    }

    #[test]
    fn test_reconciler_reflects_settings() {
        let mut config = AppConfig::default();
        assert_eq!(config.reconciler().unwrap().matcher_name(), "substring");
        config.set("matcher", "similarity").unwrap();
        config.set("status_policy", "highest").unwrap();
        let reconciler = config.reconciler().unwrap();
        assert_eq!(reconciler.matcher_name(), "similarity");
        assert_eq!(reconciler.policy(), StatusPolicy::HighestRank);
    }

    #[test]
    fn test_stored_key_takes_precedence() {
        let config = AppConfig {
            classifier_api_key: Some("stored-key-123456".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_api_key("JOBTRAIL_TEST_UNSET_VAR").as_deref(),
            Some("stored-key-123456")
        );
    }

    #[test]
    fn test_masked_hides_api_key() {
        let config = AppConfig {
            classifier_api_key: Some("AIzaSyExampleKey123".to_string()),
            ..Default::default()
        };
        let masked = config.masked();
        let key = masked.iter().find(|(k, _)| *k == "classifier_api_key").unwrap();
        assert_eq!(key.1, "****y123");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/pw"), PathBuf::from("/etc/pw"));
        assert!(expand_home("~/pw.txt").to_string_lossy().ends_with("/pw.txt"));
    }
}
