#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use polyglot_survey_core::{
    now_utc, same_language, Question, SurveyError, TrialRecord, BACK_TRANSLATION_FAILED,
    BACK_TRANSLATION_NOT_PERFORMED, BACK_TRANSLATION_SKIPPED, REFERENCE_LANGUAGE_MARKER,
    TRANSLATION_DISABLED_MARKER,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const DEFAULT_MODEL_ID: &str = "gpt-4o";
pub const DEFAULT_TRIAL_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[allow(clippy::expect_used)]
static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?(?:\d*\.\d+|\d+)").expect("number regex"));

#[allow(clippy::expect_used)]
static DIGIT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").expect("digit regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    ForwardTranslation,
    BackTranslation,
    Verification,
    SurveyResponse,
}

impl CallPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForwardTranslation => "forward_translation",
            Self::BackTranslation => "back_translation",
            Self::Verification => "verification",
            Self::SurveyResponse => "survey_response",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "forward_translation" => Some(Self::ForwardTranslation),
            "back_translation" => Some(Self::BackTranslation),
            "verification" => Some(Self::Verification),
            "survey_response" => Some(Self::SurveyResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Succeeded,
    Failed,
}

impl CallStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub purpose: CallPurpose,
    pub model_id: String,
    pub language: String,
    pub question_id: Option<String>,
    pub trial_number: Option<u32>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Audit row for one external call that produced a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderCallRecord {
    pub provider_call_id: Ulid,
    pub purpose: CallPurpose,
    pub language: String,
    pub question_id: Option<String>,
    pub trial_number: Option<u32>,
    pub provider_name: String,
    pub adapter_version: String,
    pub model_id: String,
    pub request_json: Value,
    pub request_hash: String,
    pub response_json: Value,
    pub response_hash: String,
    pub latency_ms: Option<u64>,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
    pub status: CallStatus,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReply {
    /// Reply text; `None` when the service answered with a failure status.
    pub text: Option<String>,
    pub call: ProviderCallRecord,
}

pub trait CompletionClient {
    fn provider_name(&self) -> &'static str;

    /// Transport failures are returned as errors; service-side failures come
    /// back as a reply without text so the call is still auditable.
    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply>;
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

fn build_request_json(request: &CompletionRequest, provider_name: &str, adapter_version: &str) -> Value {
    json!({
        "provider_name": provider_name,
        "adapter_version": adapter_version,
        "purpose": request.purpose.as_str(),
        "model": request.model_id,
        "language": request.language,
        "question_id": request.question_id,
        "trial_number": request.trial_number,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "messages": chat_messages(request),
    })
}

fn chat_messages(request: &CompletionRequest) -> Value {
    json!([
        {"role": "system", "content": request.system_prompt},
        {"role": "user", "content": request.user_prompt},
    ])
}

fn latency_between(started_at: OffsetDateTime, ended_at: OffsetDateTime) -> Option<u64> {
    let millis = (ended_at - started_at).whole_milliseconds();
    if millis <= 0 {
        Some(0)
    } else {
        u64::try_from(millis).ok()
    }
}

/// Deterministic offline client; answers depend only on the request.
#[derive(Debug, Clone)]
pub struct MockClient {
    adapter_version: String,
}

impl Default for MockClient {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
        }
    }
}

impl MockClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deterministic_byte(&self, request: &CompletionRequest) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(request.model_id.as_bytes());
        hasher.update(request.language.as_bytes());
        hasher.update(request.user_prompt.as_bytes());
        hasher.update(request.trial_number.unwrap_or_default().to_le_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hasher.finalize()[0]
    }

    fn answer(&self, request: &CompletionRequest) -> String {
        let body = request
            .user_prompt
            .rsplit("\n\n")
            .next()
            .unwrap_or_default()
            .to_string();
        match request.purpose {
            CallPurpose::ForwardTranslation => format!("({}) {body}", request.language),
            CallPurpose::BackTranslation => {
                let prefix = format!("({}) ", request.language);
                body.strip_prefix(&prefix).unwrap_or(&body).to_string()
            }
            CallPurpose::Verification => "5".to_string(),
            CallPurpose::SurveyResponse => {
                (1 + self.deterministic_byte(request) % 4).to_string()
            }
        }
    }
}

impl CompletionClient for MockClient {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        let started_at = now_utc();
        let request_json = build_request_json(request, self.provider_name(), &self.adapter_version);
        let request_hash = hash_json(&request_json)?;
        let text = self.answer(request);
        let response_json = json!({"content": text});
        let response_hash = hash_json(&response_json)?;
        let ended_at = now_utc();

        Ok(CompletionReply {
            text: Some(text),
            call: ProviderCallRecord {
                provider_call_id: Ulid::new(),
                purpose: request.purpose,
                language: request.language.clone(),
                question_id: request.question_id.clone(),
                trial_number: request.trial_number,
                provider_name: self.provider_name().to_string(),
                adapter_version: self.adapter_version.clone(),
                model_id: request.model_id.clone(),
                request_json,
                request_hash,
                response_json,
                response_hash,
                latency_ms: latency_between(started_at, ended_at),
                started_at,
                ended_at,
                status: CallStatus::Succeeded,
                error_text: None,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub api_key: Option<String>,
}

impl HttpClientConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

    /// Reads the bearer token from `api_key_env`.
    ///
    /// # Errors
    /// Returns an error when the environment variable is missing or empty.
    pub fn from_env(api_key_env: &str, base_url: Option<&str>, timeout_ms: Option<u64>) -> Result<Self> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| anyhow!("missing env var '{api_key_env}' required for the chat completions API"))?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("env var '{api_key_env}' is empty"));
        }
        Ok(Self {
            base_url: base_url.unwrap_or(Self::DEFAULT_BASE_URL).to_string(),
            timeout_ms: timeout_ms.unwrap_or(Self::DEFAULT_TIMEOUT_MS),
            api_key: Some(api_key),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Blocking client for an OpenAI-compatible chat completions endpoint.
#[derive(Debug)]
pub struct OpenAiChatClient {
    config: HttpClientConfig,
    adapter_version: String,
    agent: ureq::Agent,
}

impl OpenAiChatClient {
    #[must_use]
    pub fn new(config: HttpClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self {
            config,
            adapter_version: "openai_chat.v1".to_string(),
            agent,
        }
    }
}

impl CompletionClient for OpenAiChatClient {
    fn provider_name(&self) -> &'static str {
        "openai_chat"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        let started_at = now_utc();
        let request_json = build_request_json(request, self.provider_name(), &self.adapter_version);
        let request_hash = hash_json(&request_json)?;

        let mut outbound_json = json!({
            "model": request.model_id,
            "messages": chat_messages(request),
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            outbound_json["max_tokens"] = json!(max_tokens);
        }

        let mut req = self
            .agent
            .request("POST", &self.config.endpoint())
            .set("content-type", "application/json");
        if let Some(token) = &self.config.api_key {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let (status, error_text, status_code, body_json) = match req.send_json(&outbound_json) {
            Ok(response) => {
                let code = response.status();
                let body: Value = response.into_json()?;
                (CallStatus::Succeeded, None, code, body)
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_json::<Value>().unwrap_or(Value::Null);
                (
                    CallStatus::Failed,
                    Some(format!("http status {code}")),
                    code,
                    body,
                )
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        let content = body_json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string());
        let (status, error_text, text) = match (status, content) {
            (CallStatus::Succeeded, Some(text)) => (status, error_text, Some(text)),
            (CallStatus::Succeeded, None) => (
                CallStatus::Failed,
                Some("response missing choices[0].message.content".to_string()),
                None,
            ),
            (CallStatus::Failed, _) => (status, error_text, None),
        };

        let response_json = json!({
            "status_code": status_code,
            "body": body_json,
        });
        let response_hash = hash_json(&response_json)?;
        let ended_at = now_utc();

        Ok(CompletionReply {
            text,
            call: ProviderCallRecord {
                provider_call_id: Ulid::new(),
                purpose: request.purpose,
                language: request.language.clone(),
                question_id: request.question_id.clone(),
                trial_number: request.trial_number,
                provider_name: self.provider_name().to_string(),
                adapter_version: self.adapter_version.clone(),
                model_id: request.model_id.clone(),
                request_json: outbound_json,
                request_hash,
                response_json,
                response_hash,
                latency_ms: latency_between(started_at, ended_at),
                started_at,
                ended_at,
                status,
                error_text,
            },
        })
    }
}

/// Retry behaviour for external calls. The default makes a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
        }
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] when `max_attempts` is outside
    /// `1..=MAX_ATTEMPTS_LIMIT`.
    pub fn bounded(max_attempts: u32, initial_backoff_ms: u64) -> Result<Self, SurveyError> {
        if !(1..=Self::MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
            return Err(SurveyError::Configuration(format!(
                "max_attempts MUST be in 1..={}",
                Self::MAX_ATTEMPTS_LIMIT
            )));
        }
        Ok(Self {
            max_attempts,
            initial_backoff_ms,
        })
    }

    /// Backoff before attempt `attempt + 1`, doubling per attempt.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

pub struct RetryingClient {
    inner: Box<dyn CompletionClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    #[must_use]
    pub fn new(inner: Box<dyn CompletionClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl CompletionClient for RetryingClient {
    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        let mut attempt = 1;
        loop {
            let outcome = self.inner.complete(request);
            let retryable = match &outcome {
                Ok(reply) => reply.text.is_none(),
                Err(_) => true,
            };
            if !retryable || attempt >= self.policy.max_attempts {
                return outcome;
            }
            let backoff = self.policy.backoff_after(attempt);
            warn!(
                purpose = request.purpose.as_str(),
                attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "provider call failed, retrying"
            );
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
            attempt += 1;
        }
    }
}

/// Shared stop switch checked before every external call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed post-call delay; the only throttling applied to the external service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pacer {
    delay: Duration,
}

impl Pacer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TranslationFailure,
    VerificationUnparseable,
    ResponseExtractionFailure,
    RequestFailure,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TranslationFailure => "translation_failure",
            Self::VerificationUnparseable => "verification_unparseable",
            Self::ResponseExtractionFailure => "response_extraction_failure",
            Self::RequestFailure => "request_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunDiagnostics {
    pub calls_attempted: u64,
    pub translation_failures: u64,
    pub verification_unparseable: u64,
    pub response_extraction_failures: u64,
    pub request_failures: u64,
}

impl RunDiagnostics {
    pub fn record(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::TranslationFailure => self.translation_failures += 1,
            FailureKind::VerificationUnparseable => self.verification_unparseable += 1,
            FailureKind::ResponseExtractionFailure => self.response_extraction_failures += 1,
            FailureKind::RequestFailure => self.request_failures += 1,
        }
    }

    pub fn absorb(&mut self, other: &Self) {
        self.calls_attempted += other.calls_attempted;
        self.translation_failures += other.translation_failures;
        self.verification_unparseable += other.verification_unparseable;
        self.response_extraction_failures += other.response_extraction_failures;
        self.request_failures += other.request_failures;
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.translation_failures
            + self.verification_unparseable
            + self.response_extraction_failures
            + self.request_failures
    }
}

/// First signed or unsigned decimal/integer literal in `text`.
#[must_use]
pub fn extract_response_value(text: &str) -> Option<f64> {
    NUMBER_PATTERN
        .find(text)
        .and_then(|found| found.as_str().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// First digit in `text`, accepted only when it is on the 1-5 scale.
#[must_use]
pub fn parse_verification_score(text: &str) -> Option<u8> {
    DIGIT_PATTERN
        .find(text)
        .and_then(|found| found.as_str().parse::<u8>().ok())
        .filter(|score| (1..=5).contains(score))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub translated_text: String,
    pub back_translated_text: String,
    pub verification_score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationOutcome {
    pub translation: Translation,
    pub failures: Vec<FailureKind>,
    pub provider_calls: Vec<ProviderCallRecord>,
    pub calls_attempted: u64,
}

/// Forward translation, back-translation and fidelity scoring for one prompt.
///
/// Failures degrade instead of aborting: a failed forward translation falls
/// back to the original prompt, a failed back-translation keeps the forward
/// text, and in both cases no score is produced.
pub struct PromptTranslator<'a> {
    client: &'a dyn CompletionClient,
    model_id: String,
    reference_language: String,
    use_translation: bool,
    pacer: Pacer,
}

impl<'a> PromptTranslator<'a> {
    #[must_use]
    pub fn new(
        client: &'a dyn CompletionClient,
        model_id: &str,
        reference_language: &str,
        use_translation: bool,
        pacer: Pacer,
    ) -> Self {
        Self {
            client,
            model_id: model_id.to_string(),
            reference_language: reference_language.to_string(),
            use_translation,
            pacer,
        }
    }

    #[must_use]
    pub fn translate(&self, prompt: &str, target_language: &str, question_id: Option<&str>) -> TranslationOutcome {
        let mut outcome = TranslationOutcome {
            translation: Translation {
                translated_text: prompt.to_string(),
                back_translated_text: REFERENCE_LANGUAGE_MARKER.to_string(),
                verification_score: None,
            },
            failures: Vec::new(),
            provider_calls: Vec::new(),
            calls_attempted: 0,
        };

        if same_language(target_language, &self.reference_language) {
            return outcome;
        }
        if !self.use_translation {
            outcome.translation.back_translated_text = TRANSLATION_DISABLED_MARKER.to_string();
            return outcome;
        }

        let source = &self.reference_language;
        let forward = self.call(
            &mut outcome,
            CompletionRequest {
                purpose: CallPurpose::ForwardTranslation,
                model_id: self.model_id.clone(),
                language: target_language.to_string(),
                question_id: question_id.map(str::to_string),
                trial_number: None,
                system_prompt: format!(
                    "You are a professional survey translator working from {source} into {target_language}. Return only the translated text."
                ),
                user_prompt: format!(
                    "Translate the following {source} survey question into {target_language}. Keep its meaning, tone and response scale intact.\n\n{prompt}"
                ),
                temperature: 0.0,
                max_tokens: None,
            },
        );
        let Some(translated) = forward else {
            warn!(language = target_language, "forward translation failed, sending original prompt");
            outcome.failures.push(FailureKind::TranslationFailure);
            outcome.translation.back_translated_text = BACK_TRANSLATION_NOT_PERFORMED.to_string();
            return outcome;
        };
        info!(language = target_language, original = prompt, translated = %translated, "forward translation");
        outcome.translation.translated_text.clone_from(&translated);

        if translated == prompt {
            outcome.translation.back_translated_text = BACK_TRANSLATION_SKIPPED.to_string();
            return outcome;
        }

        let back = self.call(
            &mut outcome,
            CompletionRequest {
                purpose: CallPurpose::BackTranslation,
                model_id: self.model_id.clone(),
                language: target_language.to_string(),
                question_id: question_id.map(str::to_string),
                trial_number: None,
                system_prompt: format!(
                    "You are a professional survey translator working from {target_language} into {source}. Return only the translated text."
                ),
                user_prompt: format!(
                    "Translate the following {target_language} survey question back into {source}. Keep its meaning, tone and response scale intact.\n\n{translated}"
                ),
                temperature: 0.0,
                max_tokens: None,
            },
        );
        let Some(back_translated) = back else {
            warn!(language = target_language, "back-translation failed");
            outcome.failures.push(FailureKind::TranslationFailure);
            outcome.translation.back_translated_text = BACK_TRANSLATION_FAILED.to_string();
            return outcome;
        };
        info!(language = target_language, back_translated = %back_translated, "back-translation");
        outcome.translation.back_translated_text.clone_from(&back_translated);

        let verdict = self.call(
            &mut outcome,
            CompletionRequest {
                purpose: CallPurpose::Verification,
                model_id: self.model_id.clone(),
                language: target_language.to_string(),
                question_id: question_id.map(str::to_string),
                trial_number: None,
                system_prompt: "You compare two survey texts for semantic equivalence and reply with a single digit from 1 to 5.".to_string(),
                user_prompt: format!(
                    "Rate how closely the back-translation preserves the meaning of the original:\n\
                     1 - completely different meaning\n\
                     2 - mostly different meaning\n\
                     3 - partially similar meaning\n\
                     4 - mostly the same meaning\n\
                     5 - identical meaning\n\n\
                     Original:\n{prompt}\n\nBack-translation:\n{back_translated}\n\n\
                     Reply with the digit only."
                ),
                temperature: 0.0,
                max_tokens: Some(5),
            },
        );
        match verdict {
            Some(reply) => {
                outcome.translation.verification_score = parse_verification_score(&reply);
                if outcome.translation.verification_score.is_none() {
                    warn!(language = target_language, reply = %reply, "verification reply had no 1-5 digit");
                    outcome.failures.push(FailureKind::VerificationUnparseable);
                }
            }
            None => outcome.failures.push(FailureKind::RequestFailure),
        }
        info!(
            language = target_language,
            score = ?outcome.translation.verification_score,
            "translation verified"
        );
        outcome
    }

    fn call(&self, outcome: &mut TranslationOutcome, request: CompletionRequest) -> Option<String> {
        outcome.calls_attempted += 1;
        let result = self.client.complete(&request);
        self.pacer.pause();
        match result {
            Ok(reply) => {
                if let Some(error_text) = &reply.call.error_text {
                    warn!(purpose = request.purpose.as_str(), error = %error_text, "provider call failed");
                }
                outcome.provider_calls.push(reply.call);
                reply.text.filter(|text| !text.trim().is_empty())
            }
            Err(err) => {
                warn!(purpose = request.purpose.as_str(), error = %err, "provider call failed");
                None
            }
        }
    }
}

/// Welford accumulator for progress reporting (sample std, 0 for one value).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sample_std(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1 => Some(0.0),
            count => Some((self.m2 / (count - 1) as f64).sqrt()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialRunnerConfig {
    pub model_id: String,
    pub num_trials: u32,
    pub temperature: f32,
    pub reference_language: String,
    pub use_translation: bool,
    pub call_delay: Duration,
}

impl TrialRunnerConfig {
    #[must_use]
    pub fn new(model_id: &str, num_trials: u32) -> Self {
        Self {
            model_id: model_id.to_string(),
            num_trials,
            temperature: DEFAULT_TRIAL_TEMPERATURE,
            reference_language: polyglot_survey_core::DEFAULT_REFERENCE_LANGUAGE.to_string(),
            use_translation: true,
            call_delay: Duration::ZERO,
        }
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] for a blank model, zero trials or
    /// a temperature outside `(0.0, 2.0]`.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.model_id.trim().is_empty() {
            return Err(SurveyError::Configuration("model_id MUST be non-empty".to_string()));
        }
        if self.num_trials == 0 {
            return Err(SurveyError::Configuration("num_trials MUST be >= 1".to_string()));
        }
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            return Err(SurveyError::Configuration(
                "trial temperature MUST be in (0.0, 2.0]".to_string(),
            ));
        }
        if self.reference_language.trim().is_empty() {
            return Err(SurveyError::Configuration(
                "reference_language MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialProgress {
    pub language: String,
    pub question_id: String,
    pub trial_number: u32,
    pub num_trials: u32,
    pub response_value: Option<f64>,
    pub valid_responses: u64,
    pub running_mean: Option<f64>,
    pub running_std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionRun {
    pub records: Vec<TrialRecord>,
    pub translation: Translation,
    pub provider_calls: Vec<ProviderCallRecord>,
    pub diagnostics: RunDiagnostics,
    pub running: RunningStats,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurveyRunOutcome {
    pub records: Vec<TrialRecord>,
    pub provider_calls: Vec<ProviderCallRecord>,
    pub diagnostics: RunDiagnostics,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallEstimate {
    pub response_calls: u64,
    pub forward_translation_calls: u64,
    pub back_translation_calls: u64,
    pub verification_calls: u64,
    pub total_calls: u64,
}

impl CallEstimate {
    /// Upper bound on external calls for a run; failures only lower it.
    #[must_use]
    pub fn for_run(
        languages: &[String],
        question_count: usize,
        num_trials: u32,
        reference_language: &str,
        use_translation: bool,
    ) -> Self {
        let questions = u64::try_from(question_count).unwrap_or(u64::MAX);
        let language_count = u64::try_from(languages.len()).unwrap_or(u64::MAX);
        let translated = if use_translation {
            let count = languages
                .iter()
                .filter(|language| !same_language(language, reference_language))
                .count();
            u64::try_from(count).unwrap_or(u64::MAX)
        } else {
            0
        };
        let response_calls = language_count
            .saturating_mul(questions)
            .saturating_mul(u64::from(num_trials));
        let per_step = translated.saturating_mul(questions);
        Self {
            response_calls,
            forward_translation_calls: per_step,
            back_translation_calls: per_step,
            verification_calls: per_step,
            total_calls: response_calls.saturating_add(per_step.saturating_mul(3)),
        }
    }
}

pub struct TrialRunner<'a> {
    client: &'a dyn CompletionClient,
    config: TrialRunnerConfig,
    cancel: CancelFlag,
}

impl<'a> TrialRunner<'a> {
    /// # Errors
    /// Returns [`SurveyError::Configuration`] when the config is invalid.
    pub fn new(client: &'a dyn CompletionClient, config: TrialRunnerConfig) -> Result<Self, SurveyError> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            cancel: CancelFlag::new(),
        })
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn config(&self) -> &TrialRunnerConfig {
        &self.config
    }

    fn pacer(&self) -> Pacer {
        Pacer::new(self.config.call_delay)
    }

    /// Runs every trial of one question in one language.
    ///
    /// The prompt is translated once and reused by all trials.
    pub fn run_question(
        &self,
        language: &str,
        question: &Question,
        progress: &mut dyn FnMut(&TrialProgress),
    ) -> QuestionRun {
        let mut run = QuestionRun {
            records: Vec::new(),
            translation: Translation {
                translated_text: question.prompt_text.clone(),
                back_translated_text: REFERENCE_LANGUAGE_MARKER.to_string(),
                verification_score: None,
            },
            provider_calls: Vec::new(),
            diagnostics: RunDiagnostics::default(),
            running: RunningStats::default(),
            cancelled: false,
        };
        if self.cancel.is_cancelled() {
            run.cancelled = true;
            return run;
        }

        let translator = PromptTranslator::new(
            self.client,
            &self.config.model_id,
            &self.config.reference_language,
            self.config.use_translation,
            self.pacer(),
        );
        let translated = translator.translate(&question.prompt_text, language, Some(&question.id));
        run.diagnostics.calls_attempted += translated.calls_attempted;
        for failure in &translated.failures {
            run.diagnostics.record(*failure);
        }
        run.provider_calls.extend(translated.provider_calls);
        run.translation = translated.translation;

        let pacer = self.pacer();
        for trial_number in 1..=self.config.num_trials {
            if self.cancel.is_cancelled() {
                info!(language, question_id = %question.id, trial_number, "run cancelled");
                run.cancelled = true;
                break;
            }

            let request = CompletionRequest {
                purpose: CallPurpose::SurveyResponse,
                model_id: self.config.model_id.clone(),
                language: language.to_string(),
                question_id: Some(question.id.clone()),
                trial_number: Some(trial_number),
                system_prompt: "You are a respondent in a values survey. Answer the question with a single number from its response scale and nothing else.".to_string(),
                user_prompt: run.translation.translated_text.clone(),
                temperature: self.config.temperature,
                max_tokens: None,
            };
            run.diagnostics.calls_attempted += 1;
            let result = self.client.complete(&request);
            pacer.pause();

            let reply_text = match result {
                Ok(reply) => {
                    let text = reply.text.clone();
                    run.provider_calls.push(reply.call);
                    text
                }
                Err(err) => {
                    warn!(language, question_id = %question.id, trial_number, error = %err, "survey response request failed");
                    None
                }
            };

            let response_value = match &reply_text {
                Some(text) => {
                    let value = extract_response_value(text);
                    if value.is_none() {
                        debug!(language, question_id = %question.id, trial_number, reply = %text, "no numeric literal in reply");
                        run.diagnostics.record(FailureKind::ResponseExtractionFailure);
                    }
                    value
                }
                None => {
                    run.diagnostics.record(FailureKind::RequestFailure);
                    None
                }
            };
            if let Some(value) = response_value {
                run.running.push(value);
            }

            run.records.push(TrialRecord {
                language: language.to_string(),
                question_id: question.id.clone(),
                trial_number,
                original_prompt: question.prompt_text.clone(),
                translated_prompt: run.translation.translated_text.clone(),
                back_translated_prompt: run.translation.back_translated_text.clone(),
                verification_score: run.translation.verification_score,
                response_value,
            });

            let snapshot = TrialProgress {
                language: language.to_string(),
                question_id: question.id.clone(),
                trial_number,
                num_trials: self.config.num_trials,
                response_value,
                valid_responses: run.running.count(),
                running_mean: run.running.mean(),
                running_std: run.running.sample_std(),
            };
            info!(
                language,
                question_id = %question.id,
                trial = trial_number,
                of = self.config.num_trials,
                response = ?response_value,
                valid = snapshot.valid_responses,
                running_mean = ?snapshot.running_mean,
                running_std = ?snapshot.running_std,
                "trial complete"
            );
            progress(&snapshot);
        }
        run
    }

    /// Languages, then questions, then trials, strictly in order.
    pub fn run_survey(
        &self,
        languages: &[String],
        questions: &[Question],
        progress: &mut dyn FnMut(&TrialProgress),
    ) -> SurveyRunOutcome {
        let mut outcome = SurveyRunOutcome::default();
        let total_units = languages.len().saturating_mul(questions.len());
        let mut completed_units = 0_usize;

        'languages: for language in languages {
            info!(language = %language, questions = questions.len(), "starting language");
            for question in questions {
                let run = self.run_question(language, question, progress);
                outcome.records.extend(run.records);
                outcome.provider_calls.extend(run.provider_calls);
                outcome.diagnostics.absorb(&run.diagnostics);
                if run.cancelled {
                    outcome.cancelled = true;
                    break 'languages;
                }
                completed_units += 1;
                info!(
                    completed = completed_units,
                    total = total_units,
                    "question batches complete"
                );
            }
        }

        if outcome.diagnostics.total_failures() > 0 {
            warn!(
                translation_failures = outcome.diagnostics.translation_failures,
                verification_unparseable = outcome.diagnostics.verification_unparseable,
                response_extraction_failures = outcome.diagnostics.response_extraction_failures,
                request_failures = outcome.diagnostics.request_failures,
                "survey run finished with recovered failures"
            );
        }
        outcome
    }
}
