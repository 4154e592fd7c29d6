use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::models::{AnalysisResult, JobStatus, RecruiterDetails};

// --- Provider trait ---

pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
}

impl ProviderKind {
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAI => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

fn spec(provider: ProviderKind, model_id: &str, short_name: &str) -> ModelSpec {
    ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    }
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    match name {
        "gemini-flash" | "gemini" | "flash" => {
            Ok(spec(ProviderKind::Gemini, "gemini-2.5-flash", "gemini-flash"))
        }
        "gemini-pro" => Ok(spec(ProviderKind::Gemini, "gemini-2.5-pro", "gemini-pro")),
        "api-sonnet" | "sonnet" => Ok(spec(
            ProviderKind::Anthropic,
            "claude-sonnet-4-5-20250929",
            "api-sonnet",
        )),
        "api-haiku" | "haiku" => Ok(spec(
            ProviderKind::Anthropic,
            "claude-haiku-4-5-20251001",
            "api-haiku",
        )),
        "gpt-4o" => Ok(spec(ProviderKind::OpenAI, "gpt-4o", "gpt-4o")),
        "gpt-4o-mini" => Ok(spec(ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini")),
        _ => Err(anyhow!(
            "Unknown model '{}'. Available: gemini-flash (default), gemini-pro, \
             api-sonnet, api-haiku, gpt-4o, gpt-4o-mini",
            name
        )),
    }
}

pub fn create_provider(spec: &ModelSpec, api_key: String) -> Box<dyn AIProvider> {
    match spec.provider {
        ProviderKind::Gemini => Box::new(GeminiProvider::new(api_key, spec.model_id.clone())),
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(api_key, spec.model_id.clone())),
        ProviderKind::OpenAI => Box::new(OpenAIProvider::new(api_key, spec.model_id.clone())),
    }
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, model_id: String) -> Self {
        let client = reqwest::blocking::Client::new();
        Self { api_key, model_id, client }
    }
}

impl AIProvider for GeminiProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json".to_string(),
                max_output_tokens: max_tokens,
            },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model_id);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Gemini API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: GeminiResponse = response
            .json()
            .context("Failed to parse Gemini API response")?;

        api_response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| anyhow!("No content in Gemini API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model_id: String) -> Self {
        let client = reqwest::blocking::Client::new();
        Self { api_key, model_id, client }
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    response_format: OpenAIResponseFormat,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(api_key: String, model_id: String) -> Self {
        let client = reqwest::blocking::Client::new();
        Self { api_key, model_id, client }
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = OpenAIRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            response_format: OpenAIResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Email classification ---

pub trait Classifier {
    /// False when no usable credential is present; a scan must not start.
    fn is_configured(&self) -> bool;

    /// Never fails: any problem yields a "not job related" analysis.
    fn analyze(&self, subject: &str, body: &str) -> AnalysisResult;
}

const MIN_KEY_LEN: usize = 10;
const MAX_BODY_CHARS: usize = 8000;
const MAX_RESPONSE_TOKENS: u32 = 1024;

pub struct EmailClassifier {
    provider: Option<Box<dyn AIProvider>>,
}

impl EmailClassifier {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let spec = resolve_model(config.model_name())?;
        debug!(model = %spec.short_name, id = %spec.model_id, "classifier model");
        let provider = match config.resolve_api_key(spec.provider.env_var()) {
            Some(key) if key.chars().count() >= MIN_KEY_LEN => Some(create_provider(&spec, key)),
            Some(_) => {
                warn!("classifier API key is too short; ignoring it");
                None
            }
            None => None,
        };
        Ok(Self { provider })
    }

    #[cfg(test)]
    pub fn with_provider(provider: Box<dyn AIProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    #[cfg(test)]
    pub fn unconfigured() -> Self {
        Self { provider: None }
    }
}

impl Classifier for EmailClassifier {
    fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    fn analyze(&self, subject: &str, body: &str) -> AnalysisResult {
        let Some(provider) = &self.provider else {
            warn!("classifier has no API key; treating email as not job related");
            return AnalysisResult::not_job_related();
        };

        let prompt = build_prompt(subject, body);
        let response = match provider.complete(&prompt, MAX_RESPONSE_TOKENS) {
            Ok(text) => text,
            Err(e) => {
                warn!(model = provider.model_name(), error = %e, "email analysis failed");
                return AnalysisResult::not_job_related();
            }
        };
        debug!(raw = %response, "classifier response");

        match parse_analysis(&response) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "could not parse classifier response");
                AnalysisResult::not_job_related()
            }
        }
    }
}

pub fn build_prompt(subject: &str, body: &str) -> String {
    let body: String = body.chars().take(MAX_BODY_CHARS).collect();
    format!(
        "You are a strict assistant for a personal job application tracker. Decide whether \
        the email below is DIRECTLY about one of the user's own job applications, and extract \
        its state. Ignore generic notifications.\n\n\
        RULES:\n\
        1. Job-related ONLY: the email must be about a specific application, interview, coding \
        test or offer. Marketing, newsletters and job-board alerts (LinkedIn, ZipRecruiter, \
        Indeed) are NOT job-related.\n\
        2. The company name is required: extract a specific, real company name. If none is \
        mentioned, or it is a generic service, set company to \"\". Never use generic words, \
        months or \"null\" as a company.\n\
        3. If the email is not job-related, set isJobRelated to false and leave the other \
        fields empty.\n\n\
        Subject: \"{subject}\"\n\
        Body: \"{body}\"\n\n\
        Fields:\n\
        - isJobRelated (boolean)\n\
        - company (string, \"\" when not job-related)\n\
        - statusUpdate: one of \"Applied\", \"OA / Skill Test\", \"Interviewing\", \"Offer\", \
        \"Rejected\", \"Unknown\"\n\
        - recruiter: {{\"name\", \"email\", \"role\", \"linkedIn\"}} when a specific recruiter is \
        named, otherwise null\n\n\
        Respond with ONLY a JSON object:\n\
        {{\"company\": string, \"statusUpdate\": string, \"recruiter\": {{\"name\": string, \
        \"email\": string, \"role\": string, \"linkedIn\": string}} | null, \"isJobRelated\": boolean}}",
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawAnalysis {
    company: Option<String>,
    status_update: Option<String>,
    recruiter: Option<RawRecruiter>,
    is_job_related: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecruiter {
    name: Option<String>,
    email: Option<String>,
    role: Option<String>,
    #[serde(rename = "linkedIn")]
    linked_in: Option<String>,
}

#[allow(clippy::expect_used)]
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("constant regex pattern is valid")
});

/// Parse a classifier reply. Tolerates code fences and prose around the JSON object.
pub fn parse_analysis(text: &str) -> Result<AnalysisResult> {
    let unfenced = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);

    let start = unfenced
        .find('{')
        .ok_or_else(|| anyhow!("No JSON object in classifier response"))?;
    let end = unfenced
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow!("Unterminated JSON object in classifier response"))?;

    let raw: RawAnalysis = serde_json::from_str(&unfenced[start..=end])
        .context("Classifier response is not valid analysis JSON")?;

    let recruiter = raw.recruiter.map(|r| RecruiterDetails {
        name: r.name.unwrap_or_default(),
        email: r.email.unwrap_or_default(),
        role: r.role.unwrap_or_default(),
        linked_in: r.linked_in.filter(|l| !l.trim().is_empty()),
    });

    Ok(AnalysisResult {
        is_job_related: raw.is_job_related.unwrap_or(false),
        company: raw.company.unwrap_or_default().trim().to_string(),
        status_update: raw
            .status_update
            .as_deref()
            .map(JobStatus::parse_lenient)
            .unwrap_or(JobStatus::Unknown),
        recruiter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedProvider(Result<String, String>);

    impl AIProvider for CannedProvider {
        fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            self.0.clone().map_err(|e| anyhow!(e))
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_resolve_model_gemini_default() {
        let spec = resolve_model("gemini-flash").unwrap();
        assert_eq!(spec.model_id, "gemini-2.5-flash");
        assert_eq!(spec.provider, ProviderKind::Gemini);

        let spec = resolve_model("gemini").unwrap();
        assert_eq!(spec.short_name, "gemini-flash");
    }

    #[test]
    fn test_resolve_model_other_providers() {
        assert_eq!(resolve_model("api-sonnet").unwrap().provider, ProviderKind::Anthropic);
        assert_eq!(resolve_model("haiku").unwrap().provider, ProviderKind::Anthropic);
        assert_eq!(resolve_model("gpt-4o").unwrap().provider, ProviderKind::OpenAI);
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_create_provider_keeps_model_id() {
        let spec = resolve_model("gpt-4o-mini").unwrap();
        let provider = create_provider(&spec, "sk-test-key-000".to_string());
        assert_eq!(provider.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_parse_analysis_plain_json() {
        let text = r#"{"company": "Acme", "statusUpdate": "Interviewing", "recruiter": null, "isJobRelated": true}"#;
        let analysis = parse_analysis(text).unwrap();
        assert!(analysis.is_job_related);
        assert_eq!(analysis.company, "Acme");
        assert_eq!(analysis.status_update, JobStatus::Interviewing);
        assert!(analysis.recruiter.is_none());
    }

    #[test]
    fn test_parse_analysis_fenced_with_recruiter() {
        let text = "Here you go:\n```json\n{\"company\": \" Globex \", \"statusUpdate\": \"OA / Skill Test\", \
                    \"recruiter\": {\"name\": \"Ann Lee\", \"email\": \"ann@globex.com\", \"role\": \"Recruiter\", \"linkedIn\": \"\"}, \
                    \"isJobRelated\": true}\n```";
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.company, "Globex");
        assert_eq!(analysis.status_update, JobStatus::OaReceived);
        let recruiter = analysis.recruiter.unwrap();
        assert_eq!(recruiter.email, "ann@globex.com");
        assert_eq!(recruiter.linked_in, None);
    }

    #[test]
    fn test_parse_analysis_fence_pattern_shared_across_calls() {
        let replies = [
            "```json\n{\"company\": \"Acme\", \"isJobRelated\": true}\n```",
            "```\n{\"company\": \"Globex\", \"isJobRelated\": true}\n``` trailing {braces}",
            "```json {\"company\": \"Initech\"} ```",
        ];
        let companies: Vec<String> = replies
            .iter()
            .map(|r| parse_analysis(r).unwrap().company)
            .collect();
        assert_eq!(companies, ["Acme", "Globex", "Initech"]);
        assert!(CODE_FENCE.is_match(replies[0]));
    }

    #[test]
    fn test_parse_analysis_missing_fields_default() {
        let analysis = parse_analysis(r#"{"company": "Initech"}"#).unwrap();
        assert!(!analysis.is_job_related);
        assert_eq!(analysis.status_update, JobStatus::Unknown);
    }

    #[test]
    fn test_parse_analysis_unknown_status_label() {
        let analysis =
            parse_analysis(r#"{"company": "Acme", "statusUpdate": "Ghosted", "isJobRelated": true}"#)
                .unwrap();
        assert_eq!(analysis.status_update, JobStatus::Unknown);
    }

    #[test]
    fn test_parse_analysis_rejects_non_json() {
        assert!(parse_analysis("I cannot help with that.").is_err());
        assert!(parse_analysis("{ not json }").is_err());
    }

    #[test]
    fn test_classifier_degrades_on_provider_error() {
        let classifier = EmailClassifier::with_provider(Box::new(CannedProvider(Err(
            "503 Service Unavailable".to_string(),
        ))));
        assert!(classifier.is_configured());
        assert_eq!(classifier.analyze("Offer", "body"), AnalysisResult::not_job_related());
    }

    #[test]
    fn test_classifier_degrades_on_garbage_output() {
        let classifier =
            EmailClassifier::with_provider(Box::new(CannedProvider(Ok("nope".to_string()))));
        assert_eq!(classifier.analyze("Offer", "body"), AnalysisResult::not_job_related());
    }

    #[test]
    fn test_classifier_returns_parsed_analysis() {
        let classifier = EmailClassifier::with_provider(Box::new(CannedProvider(Ok(
            r#"{"company": "Acme", "statusUpdate": "Offer", "isJobRelated": true}"#.to_string(),
        ))));
        let analysis = classifier.analyze("Your offer from Acme", "Congratulations");
        assert_eq!(analysis.company, "Acme");
        assert_eq!(analysis.status_update, JobStatus::Offer);
    }

    #[test]
    fn test_unconfigured_classifier() {
        let classifier = EmailClassifier::unconfigured();
        assert!(!classifier.is_configured());
        assert_eq!(classifier.analyze("a", "b"), AnalysisResult::not_job_related());
    }

    #[test]
    fn test_short_stored_key_leaves_classifier_unconfigured() {
        let config = AppConfig {
            classifier_api_key: Some("short".to_string()),
            ..Default::default()
        };
        let classifier = EmailClassifier::from_config(&config).unwrap();
        assert!(!classifier.is_configured());
    }

    #[test]
    fn test_prompt_truncates_body() {
        let body = "x".repeat(MAX_BODY_CHARS + 500);
        let prompt = build_prompt("Interview invite", &body);
        assert!(prompt.contains("Interview invite"));
        assert!(!prompt.contains(&"x".repeat(MAX_BODY_CHARS + 1)));
        assert!(prompt.contains(&"x".repeat(MAX_BODY_CHARS)));
    }
}
